//! Defines an abstract interface to a media-controller device.
//!
//! The compositor only sees the media graph through [`MediaDevice`]. The
//! Linux backend ([`linux`]) implements it with ioctls on the media, subdevice
//! and video nodes. The mock backend ([`mock`]) implements it in memory and
//! executes submissions in software.
use arrayvec::ArrayVec;
use bitflags::bitflags;
use derive_more::{Display, From};
use std::{fmt, io, time::Duration};

use crate::{
    format::{PixelFormat, MAX_PLANES},
    geom::Rect,
    surface::{DmaBufRef, PlaneDesc, SurfaceDesc},
};

pub mod dmaheap;
pub mod linux;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
mod sys;
pub mod topology;

/// `V4L2_CID_ALPHA_COMPONENT`
pub const CID_ALPHA_COMPONENT: u32 = 0x0098_0929;

/// Identifies an entity of the media graph.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From)]
#[display(fmt = "#{}", _0)]
pub struct EntityId(pub u32);

/// Identifies a pad of an entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PadRef {
    pub entity: EntityId,
    pub index: u16,
}

impl PadRef {
    pub const fn new(entity: EntityId, index: u16) -> Self {
        Self { entity, index }
    }
}

impl fmt::Debug for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver: String,
    pub model: String,
    pub bus_info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A subdevice (a processing unit configured through its pads).
    Subdev,
    /// A video node (an I/O endpoint buffers are queued on).
    VideoNode,
    Other,
}

#[derive(Debug, Clone)]
pub struct EntityDesc {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub num_pads: u16,
    pub num_links: u16,
    /// The character device number of the entity's device node.
    pub dev: Option<(u32, u32)>,
}

bitflags! {
    pub struct LinkFlags: u32 {
        const ENABLED = 1;
        const IMMUTABLE = 1 << 1;
        const DYNAMIC = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkDesc {
    pub source: PadRef,
    pub sink: PadRef,
    pub flags: LinkFlags,
}

/// The media-bus format of a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbusFormat {
    pub code: u32,
    pub size: [u32; 2],
}

impl MbusFormat {
    pub const fn new(code: u32, size: [u32; 2]) -> Self {
        Self { code, size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionTarget {
    Crop,
    Compose,
}

/// The memory layout of one plane as seen by a video node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneFormat {
    pub pitch: u32,
    pub len: u32,
}

/// The format of the buffers queued on a video node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub format: PixelFormat,
    pub size: [u32; 2],
    pub planes: ArrayVec<[PlaneFormat; MAX_PLANES]>,
}

impl VideoFormat {
    /// The format describing `surface`, read as `format`. `format` must have
    /// the same memory layout as `surface.format`.
    pub fn for_surface(surface: &SurfaceDesc, format: PixelFormat) -> Self {
        Self {
            format,
            size: surface.size,
            planes: surface
                .planes
                .iter()
                .map(|p| PlaneFormat {
                    pitch: p.pitch,
                    len: p.len,
                })
                .collect(),
        }
    }
}

/// A media-controller device and the subdevice/video nodes of its entities.
///
/// Nodes are addressed by the `EntityId` of their entity. All methods take
/// `&self` because completion is waited for on a separate thread while the
/// calling thread may keep configuring the pipeline.
pub trait MediaDevice: Send + Sync + 'static {
    fn device_info(&self) -> io::Result<DeviceInfo>;

    fn entities(&self) -> io::Result<Vec<EntityDesc>>;

    /// Get the links whose source is a pad of `entity`.
    fn links(&self, entity: EntityId) -> io::Result<Vec<LinkDesc>>;

    fn setup_link(&self, link: &LinkDesc, enable: bool) -> io::Result<()>;

    fn set_pad_format(&self, pad: PadRef, format: &MbusFormat) -> io::Result<()>;

    fn set_selection(&self, pad: PadRef, target: SelectionTarget, rect: Rect) -> io::Result<()>;

    fn set_control(&self, entity: EntityId, id: u32, value: i32) -> io::Result<()>;

    fn set_video_format(&self, node: EntityId, format: &VideoFormat) -> io::Result<()>;

    /// Returns the number of buffers actually allocated.
    fn request_buffers(&self, node: EntityId, count: u32) -> io::Result<u32>;

    fn queue_buffer(&self, node: EntityId, planes: &[PlaneDesc]) -> io::Result<()>;

    fn dequeue_buffer(&self, node: EntityId) -> io::Result<()>;

    fn stream_on(&self, node: EntityId) -> io::Result<()>;

    fn stream_off(&self, node: EntityId) -> io::Result<()>;

    /// Wait until a buffer can be dequeued from `node`. Returns `false` on
    /// timeout.
    fn wait_done(&self, node: EntityId, timeout: Duration) -> io::Result<bool>;
}

/// Allocates DMA-buf memory the CPU can write.
pub trait DmaAllocator: Send + Sync + 'static {
    type Buffer: DmaBuffer;

    fn allocate(&self, len: usize) -> io::Result<Self::Buffer>;
}

/// An owned DMA-buf. Dropping it releases the memory.
pub trait DmaBuffer: Send + 'static {
    fn fd(&self) -> DmaBufRef;

    fn len(&self) -> usize;

    /// Give `f` CPU access to the whole buffer.
    fn write_with(&mut self, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()>;
}
