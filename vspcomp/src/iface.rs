//! Defines the acceleration contract consumed by a generic 2D graphics core.
//!
//! The graphics core owns a [`CardState`] per drawing context. Before each
//! primitive it asks the driver whether the primitive can be accelerated with
//! the current state ([`GfxDriver::check_state`]), hands over the state that
//! changed since the last call ([`GfxDriver::set_state`]), and then issues the
//! primitive. Every failure is recoverable: the core is expected to render the
//! primitive in software instead.
use arrayvec::ArrayVec;
use bitflags::bitflags;
use rgb::RGBA8;

use crate::{
    error::DrawError,
    format::{PixelFormat, MAX_PLANES},
    geom::Rect,
    surface::{PlaneDesc, SurfaceDesc},
};

/// A trait for hardware 2D drivers.
pub trait GfxDriver {
    /// Check if the primitives in `accel` can be accelerated with `state`.
    ///
    /// On success, the accepted primitives are added to `state.accel`. This
    /// method never touches the hardware.
    fn check_state(&self, state: &mut CardState, accel: AccelFlags) -> bool;

    /// Program the parts of `state` marked in `state.modified`.
    ///
    /// Clears `state.modified` and adds `accel` to `state.set` on success.
    fn set_state(&mut self, state: &mut CardState, accel: AccelFlags) -> Result<(), DrawError>;

    /// Fill `rect` (in destination coordinates) with `state.color`.
    fn fill_rectangle(&mut self, rect: Rect) -> Result<(), DrawError>;

    /// Copy `src_rect` of the source surface to `(dx, dy)` of the destination.
    fn blit(&mut self, src_rect: Rect, dx: i32, dy: i32) -> Result<(), DrawError>;

    /// Copy `src_rect` of the source surface to `dst_rect`, resizing it.
    fn stretch_blit(&mut self, src_rect: Rect, dst_rect: Rect) -> Result<(), DrawError>;

    /// Start executing the commands issued so far. Doesn't wait for them to
    /// complete.
    fn emit_commands(&mut self);

    /// Wait until all commands issued so far have completed.
    fn engine_sync(&mut self) -> Result<(), DrawError>;
}

bitflags! {
    /// Primitives.
    pub struct AccelFlags: u32 {
        const FILL_RECTANGLE = 1;
        const BLIT = 1 << 1;
        const STRETCH_BLIT = 1 << 2;
    }
}

bitflags! {
    /// Modifiers of `fill_rectangle`.
    pub struct DrawingFlags: u32 {
        /// Blend `color` over the destination using `src_blend` and
        /// `dst_blend`.
        const BLEND = 1;
        const XOR = 1 << 1;
        const DST_COLORKEY = 1 << 2;
    }
}

bitflags! {
    /// Modifiers of `blit` and `stretch_blit`.
    pub struct BlittingFlags: u32 {
        /// Blend using the source's alpha channel.
        const BLEND_ALPHACHANNEL = 1;
        /// Blend using `color.a` as a constant alpha.
        const BLEND_COLORALPHA = 1 << 1;
        /// Modulate the source with `color`.
        const COLORIZE = 1 << 2;
        const SRC_COLORKEY = 1 << 3;
        const DST_COLORKEY = 1 << 4;
        const ROTATE180 = 1 << 5;
        /// Read a single field of an interlaced source.
        const DEINTERLACE = 1 << 6;
    }
}

bitflags! {
    /// Fields of [`CardState`] that changed since the last `set_state`.
    pub struct StateModified: u32 {
        const DESTINATION = 1;
        const SOURCE = 1 << 1;
        const CLIP = 1 << 2;
        const COLOR = 1 << 3;
        const SRC_BLEND = 1 << 4;
        const DST_BLEND = 1 << 5;
        const DRAWING_FLAGS = 1 << 6;
        const BLITTING_FLAGS = 1 << 7;
        const ALL = 0xff;
    }
}

/// Pixel formats known to the graphics core. The pipeline reads and writes
/// only the ones with a [`PixelFormat`] counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreFormat {
    Argb8888,
    Rgb32,
    Rgb24,
    Rgb16,
    Argb1555,
    Rgb555,
    Yuy2,
    Uyvy,
    Nv12,
    Nv16,
    /// 8-bit alpha only.
    A8,
    /// 8-bit palette index.
    Lut8,
    /// 16-bit ARGB 4:4:4:4.
    Argb4444,
    /// Three-plane 4:2:0 (`Y`, `U`, `V`).
    I420,
    /// Three-plane 4:2:0 (`Y`, `V`, `U`).
    Yv12,
}

impl CoreFormat {
    pub fn pixel_format(self) -> Option<PixelFormat> {
        Some(match self {
            CoreFormat::Argb8888 => PixelFormat::Argb8888,
            CoreFormat::Rgb32 => PixelFormat::Rgb32,
            CoreFormat::Rgb24 => PixelFormat::Rgb24,
            CoreFormat::Rgb16 => PixelFormat::Rgb16,
            CoreFormat::Argb1555 => PixelFormat::Argb1555,
            CoreFormat::Rgb555 => PixelFormat::Rgb555,
            CoreFormat::Yuy2 => PixelFormat::Yuy2,
            CoreFormat::Uyvy => PixelFormat::Uyvy,
            CoreFormat::Nv12 => PixelFormat::Nv12,
            CoreFormat::Nv16 => PixelFormat::Nv16,
            CoreFormat::A8
            | CoreFormat::Lut8
            | CoreFormat::Argb4444
            | CoreFormat::I420
            | CoreFormat::Yv12 => return None,
        })
    }
}

impl From<PixelFormat> for CoreFormat {
    fn from(x: PixelFormat) -> Self {
        match x {
            PixelFormat::Argb8888 => CoreFormat::Argb8888,
            PixelFormat::Rgb32 => CoreFormat::Rgb32,
            PixelFormat::Rgb24 => CoreFormat::Rgb24,
            PixelFormat::Rgb16 => CoreFormat::Rgb16,
            PixelFormat::Argb1555 => CoreFormat::Argb1555,
            PixelFormat::Rgb555 => CoreFormat::Rgb555,
            PixelFormat::Yuy2 => CoreFormat::Yuy2,
            PixelFormat::Uyvy => CoreFormat::Uyvy,
            PixelFormat::Nv12 => CoreFormat::Nv12,
            PixelFormat::Nv16 => CoreFormat::Nv16,
        }
    }
}

/// The maximum number of planes of a [`CoreSurface`].
pub const MAX_CORE_PLANES: usize = 3;

/// A surface as described by the graphics core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoreSurface {
    pub format: CoreFormat,
    pub size: [u32; 2],
    pub planes: ArrayVec<[PlaneDesc; MAX_CORE_PLANES]>,
}

impl CoreSurface {
    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.size)
    }

    /// Convert `self` to a descriptor the pipeline can use. Fails if the
    /// format isn't supported or the planes don't fit the geometry.
    pub fn to_desc(&self) -> Result<SurfaceDesc, &'static str> {
        let format = self
            .format
            .pixel_format()
            .ok_or("unsupported pixel format")?;
        if self.planes.len() != format.num_planes() || self.planes.len() > MAX_PLANES {
            return Err("malformed surface");
        }
        let desc = SurfaceDesc {
            format,
            size: self.size,
            planes: self.planes.iter().cloned().collect(),
        };
        if desc.is_well_formed() {
            Ok(desc)
        } else {
            Err("malformed surface")
        }
    }
}

impl From<SurfaceDesc> for CoreSurface {
    fn from(x: SurfaceDesc) -> Self {
        Self {
            format: x.format.into(),
            size: x.size,
            planes: x.planes.iter().cloned().collect(),
        }
    }
}

/// Blend factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFunction {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
}

/// The drawing state shared by the graphics core and a driver.
#[derive(Debug, Clone)]
pub struct CardState {
    pub destination: CoreSurface,
    pub source: Option<CoreSurface>,
    /// Drawing is restricted to this rectangle of the destination.
    pub clip: Rect,
    pub color: RGBA8,
    pub src_blend: BlendFunction,
    pub dst_blend: BlendFunction,
    pub drawing_flags: DrawingFlags,
    pub blitting_flags: BlittingFlags,
    pub modified: StateModified,
    /// The primitives accepted by the last `check_state` calls.
    pub accel: AccelFlags,
    /// The primitives the driver has been programmed for.
    pub set: AccelFlags,
}

impl CardState {
    /// Construct a `CardState` drawing into `destination`, with everything
    /// marked as modified.
    pub fn new(destination: impl Into<CoreSurface>) -> Self {
        let destination = destination.into();
        Self {
            clip: destination.bounds(),
            destination,
            source: None,
            color: RGBA8::new(0, 0, 0, 255),
            src_blend: BlendFunction::SrcAlpha,
            dst_blend: BlendFunction::InvSrcAlpha,
            drawing_flags: DrawingFlags::empty(),
            blitting_flags: BlittingFlags::empty(),
            modified: StateModified::ALL,
            accel: AccelFlags::empty(),
            set: AccelFlags::empty(),
        }
    }

    pub fn set_destination(&mut self, destination: impl Into<CoreSurface>) {
        let destination = destination.into();
        self.clip = destination.bounds();
        self.destination = destination;
        self.modified |= StateModified::DESTINATION | StateModified::CLIP;
    }

    pub fn set_source(&mut self, source: Option<CoreSurface>) {
        self.source = source;
        self.modified |= StateModified::SOURCE;
    }

    pub fn set_clip(&mut self, clip: Rect) {
        self.clip = clip;
        self.modified |= StateModified::CLIP;
    }

    pub fn set_color(&mut self, color: RGBA8) {
        self.color = color;
        self.modified |= StateModified::COLOR;
    }

    pub fn set_blend(&mut self, src_blend: BlendFunction, dst_blend: BlendFunction) {
        self.src_blend = src_blend;
        self.dst_blend = dst_blend;
        self.modified |= StateModified::SRC_BLEND | StateModified::DST_BLEND;
    }

    pub fn set_drawing_flags(&mut self, flags: DrawingFlags) {
        self.drawing_flags = flags;
        self.modified |= StateModified::DRAWING_FLAGS;
    }

    pub fn set_blitting_flags(&mut self, flags: BlittingFlags) {
        self.blitting_flags = flags;
        self.modified |= StateModified::BLITTING_FLAGS;
    }
}
