//! Descriptors of externally allocated surfaces.
use arrayvec::ArrayVec;
use derive_more::Display;
use std::os::unix::io::RawFd;

use crate::{
    format::{PixelFormat, MAX_PLANES},
    geom::Rect,
};

/// A borrowed reference to a DMA-buf file descriptor.
///
/// The memory is owned by whoever allocated the buffer (the kernel, on behalf
/// of the graphics core). The driver only passes the descriptor to the kernel
/// for the duration of one submission and never closes it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display(fmt = "dmabuf#{}", _0)]
pub struct DmaBufRef(RawFd);

impl DmaBufRef {
    /// Wrap a descriptor the caller keeps open for as long as any submission
    /// referencing it is outstanding.
    pub const fn borrow_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    pub const fn as_raw(self) -> RawFd {
        self.0
    }
}

/// One memory plane of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneDesc {
    pub buf: DmaBufRef,
    /// The byte offset of the plane within `buf`.
    pub offset: u32,
    pub pitch: u32,
    /// The number of bytes the plane occupies, starting at `offset`.
    pub len: u32,
}

/// A surface the pipeline reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    pub format: PixelFormat,
    pub size: [u32; 2],
    pub planes: ArrayVec<[PlaneDesc; MAX_PLANES]>,
}

impl SurfaceDesc {
    /// Describe a surface stored in a single DMA-buf. Multi-planar formats
    /// place their planes back to back.
    pub fn new(buf: DmaBufRef, format: PixelFormat, size: [u32; 2], pitch: u32) -> Self {
        let mut planes = ArrayVec::new();
        let mut offset = 0;
        for plane in 0..format.num_planes() {
            let len = pitch * format.plane_rows(plane, size[1]);
            planes.push(PlaneDesc {
                buf,
                offset,
                pitch,
                len,
            });
            offset += len;
        }
        Self {
            format,
            size,
            planes,
        }
    }

    pub fn pitch(&self) -> u32 {
        self.planes[0].pitch
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.size)
    }

    /// The total number of bytes spanned by all planes.
    pub fn byte_len(&self) -> usize {
        self.planes
            .iter()
            .map(|p| (p.offset + p.len) as usize)
            .max()
            .unwrap_or(0)
    }

    /// Check whether two descriptors refer to the same render target. Two
    /// draws may share a composition only if this holds.
    pub fn same_target(&self, other: &Self) -> bool {
        self.planes[0].buf == other.planes[0].buf
            && self.planes[0].offset == other.planes[0].offset
            && self.pitch() == other.pitch()
            && self.size == other.size
            && self.format == other.format
    }

    /// Check that the planes are large enough for the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        self.planes.len() == self.format.num_planes()
            && self.size[0] > 0
            && self.size[1] > 0
            && self.planes.iter().enumerate().all(|(i, p)| {
                p.pitch >= self.format.min_pitch(i, self.size[0])
                    && p.len >= p.pitch * self.format.plane_rows(i, self.size[1])
            })
    }
}
