//! Hardware-assisted 2D compositing on a V4L2 media-controller pipeline
//!
//! The pipeline consists of several input ports (RPF) reading DMA-buf
//! surfaces, scalers (UDS) that can be inserted between an input port and the
//! compose unit, a compose unit (BRU) blending its sink pads in order, and an
//! output port (WPF) writing the result back to memory. See [`device`] for how
//! a sequence of fills and blits is batched into compositions, and
//! [`adapter`] for the driver-facing entry point.
//!
//! # Example
//!
//! ```no_run
//! use vspcomp::{prelude::*, CardState, Config, PixelFormat, Rect, SurfaceDesc};
//! # fn dest_fd() -> vspcomp::DmaBufRef { unimplemented!() }
//!
//! let device = vspcomp::open(Config::from_env()).unwrap();
//! let mut accel = vspcomp::VspAccel::new(device);
//!
//! let target = SurfaceDesc::new(dest_fd(), PixelFormat::Argb8888, [640, 480], 640 * 4);
//! let mut state = CardState::new(target);
//! if accel.check_state(&mut state, vspcomp::AccelFlags::FILL_RECTANGLE) {
//!     accel.set_state(&mut state, vspcomp::AccelFlags::FILL_RECTANGLE).unwrap();
//!     accel.fill_rectangle(Rect::new(0, 0, 64, 64)).unwrap();
//!     accel.engine_sync().unwrap();
//! }
//! ```
pub mod adapter;
pub mod alloc;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod geom;
pub mod iface;
pub mod media;
pub mod pipeline;
pub mod scale;
pub mod surface;

/// Re-exports traits from `iface` and `media`.
pub mod prelude {
    pub use super::iface::GfxDriver;
    pub use super::media::{DmaAllocator, DmaBuffer, MediaDevice};
}

pub use self::{
    adapter::VspAccel,
    config::Config,
    device::{AlphaMode, BlitParams, Device, DeviceStats},
    error::{DrawError, PipelineError, ProbeError},
    format::PixelFormat,
    geom::Rect,
    iface::{
        AccelFlags, BlendFunction, BlittingFlags, CardState, CoreFormat, CoreSurface, DrawingFlags,
        StateModified,
    },
    surface::{DmaBufRef, SurfaceDesc},
};

/// The default device type, backed by the kernel.
pub type LinuxDevice = Device<media::linux::LinuxMedia, media::dmaheap::DmaHeap>;

/// Open the media device and the DMA heap named by `config` and attach to
/// them.
pub fn open(config: Config) -> Result<LinuxDevice, ProbeError> {
    let media =
        media::linux::LinuxMedia::open(&config.device_path).map_err(ProbeError::DeviceAbsent)?;
    let heap =
        media::dmaheap::DmaHeap::open(&config.dma_heap_path).map_err(ProbeError::DeviceAbsent)?;
    Device::attach(media, heap, config)
}
