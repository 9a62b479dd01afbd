//! Implements the acceleration contract on top of a [`Device`].
use bitflags::bitflags;
use log::{trace, warn};
use rgb::RGBA8;

use crate::{
    device::{AlphaMode, BlitParams, Device},
    error::DrawError,
    geom::Rect,
    iface::{
        AccelFlags, BlendFunction, BlittingFlags, CardState, DrawingFlags, GfxDriver,
        StateModified,
    },
    media::{DmaAllocator, MediaDevice},
    surface::SurfaceDesc,
};

bitflags! {
    /// The parts of the drawing state that have been validated and cached.
    struct Validity: u32 {
        const DESTINATION = 1;
        const SOURCE = 1 << 1;
        const CLIP = 1 << 2;
        const COLOR = 1 << 3;
        const BLEND = 1 << 4;
    }
}

const SUPPORTED_DRAWING_FLAGS: DrawingFlags = DrawingFlags::BLEND;

const BLEND_BLITTING_FLAGS: BlittingFlags = BlittingFlags::from_bits_truncate(
    BlittingFlags::BLEND_ALPHACHANNEL.bits() | BlittingFlags::BLEND_COLORALPHA.bits(),
);

const SUPPORTED_BLITTING_FLAGS: BlittingFlags = BlittingFlags::from_bits_truncate(
    BLEND_BLITTING_FLAGS.bits() | BlittingFlags::DEINTERLACE.bits(),
);

/// Calculate `base + (to - from)`, saturating at the bounds of `i32`.
fn translate(base: i32, from: i32, to: i32) -> i32 {
    let x = base as i64 + (to as i64 - from as i64);
    x.max(i32::min_value() as i64).min(i32::max_value() as i64) as i32
}

fn is_source_over(state: &CardState) -> bool {
    state.src_blend == BlendFunction::SrcAlpha && state.dst_blend == BlendFunction::InvSrcAlpha
}

/// Find a reason `accel` can't be accelerated with `state`.
fn decline_reason(state: &CardState, accel: AccelFlags) -> Option<&'static str> {
    let dest = match state.destination.to_desc() {
        Ok(dest) => dest,
        Err(why) => return Some(why),
    };

    if accel.contains(AccelFlags::FILL_RECTANGLE) {
        let flags = state.drawing_flags;
        if !SUPPORTED_DRAWING_FLAGS.contains(flags) {
            return Some("unsupported drawing flags");
        }
        if flags.contains(DrawingFlags::BLEND) {
            if !is_source_over(state) {
                return Some("unsupported blend functions");
            }
        } else if state.color.a != 255 && dest.format.has_alpha() {
            return Some("translucent fill without blending");
        }
    }

    if accel.intersects(AccelFlags::BLIT | AccelFlags::STRETCH_BLIT) {
        let source = match state.source.as_ref().map(|s| s.to_desc()) {
            Some(Ok(source)) => source,
            Some(Err(why)) => return Some(why),
            None => return Some("no source"),
        };

        let flags = state.blitting_flags;
        if !SUPPORTED_BLITTING_FLAGS.contains(flags) {
            return Some("unsupported blitting flags");
        }
        if flags.contains(BLEND_BLITTING_FLAGS) {
            return Some("both alpha channel and color alpha");
        }
        if flags.intersects(BLEND_BLITTING_FLAGS) {
            if !is_source_over(state) {
                return Some("unsupported blend functions");
            }
        } else if source.format.has_alpha() && dest.format.has_alpha() {
            return Some("copying the alpha channel");
        }
    }

    None
}

/// A hardware 2D driver backed by a compositor device.
///
/// The validated parts of the drawing state are cached, so `set_state` only
/// looks at what the graphics core reports as modified.
#[derive(Debug)]
pub struct VspAccel<M: MediaDevice, A: DmaAllocator> {
    device: Device<M, A>,
    valid: Validity,
    destination: Option<SurfaceDesc>,
    source: Option<SurfaceDesc>,
    /// The clip rectangle intersected with the destination bounds. `None`
    /// means everything is clipped.
    clip: Option<Rect>,
    color: RGBA8,
    fill_blend: bool,
    blit: BlitParams,
}

impl<M: MediaDevice, A: DmaAllocator> VspAccel<M, A> {
    pub fn new(device: Device<M, A>) -> Self {
        Self {
            device,
            valid: Validity::empty(),
            destination: None,
            source: None,
            clip: None,
            color: RGBA8::new(0, 0, 0, 255),
            fill_blend: false,
            blit: BlitParams::default(),
        }
    }

    pub fn device(&self) -> &Device<M, A> {
        &self.device
    }

    pub fn into_device(self) -> Device<M, A> {
        self.device
    }

    /// Get the destination if the aspects in `needed` have been validated.
    fn destination(&self, needed: Validity) -> Result<&SurfaceDesc, DrawError> {
        match &self.destination {
            Some(dest) if self.valid.contains(needed | Validity::DESTINATION) => Ok(dest),
            _ => Err(DrawError::Unsupported("the state has not been set")),
        }
    }

    fn source(&self) -> Result<&SurfaceDesc, DrawError> {
        match &self.source {
            Some(source) if self.valid.contains(Validity::SOURCE) => Ok(source),
            _ => Err(DrawError::Unsupported("the state has not been set")),
        }
    }
}

impl<M: MediaDevice, A: DmaAllocator> GfxDriver for VspAccel<M, A> {
    fn check_state(&self, state: &mut CardState, accel: AccelFlags) -> bool {
        if let Some(reason) = decline_reason(state, accel) {
            trace!("Not accelerating {:?}: {}", accel, reason);
            return false;
        }
        state.accel |= accel;
        true
    }

    fn set_state(&mut self, state: &mut CardState, accel: AccelFlags) -> Result<(), DrawError> {
        let modified = state.modified;
        if modified.contains(StateModified::DESTINATION) {
            self.valid -= Validity::DESTINATION | Validity::CLIP;
        }
        if modified.contains(StateModified::SOURCE) {
            self.valid -= Validity::SOURCE;
        }
        if modified.contains(StateModified::CLIP) {
            self.valid -= Validity::CLIP;
        }
        if modified.contains(StateModified::COLOR) {
            // The color alpha is a blending parameter
            self.valid -= Validity::COLOR | Validity::BLEND;
        }
        if modified.intersects(
            StateModified::SRC_BLEND
                | StateModified::DST_BLEND
                | StateModified::DRAWING_FLAGS
                | StateModified::BLITTING_FLAGS,
        ) {
            self.valid -= Validity::BLEND;
        }

        if !self.valid.contains(Validity::DESTINATION) {
            let dest = state.destination.to_desc().map_err(DrawError::Unsupported)?;
            self.destination = Some(dest);
            self.valid |= Validity::DESTINATION;
        }

        if accel.intersects(AccelFlags::BLIT | AccelFlags::STRETCH_BLIT)
            && !self.valid.contains(Validity::SOURCE)
        {
            let source = match &state.source {
                Some(source) => source.to_desc().map_err(DrawError::Unsupported)?,
                None => return Err(DrawError::Unsupported("no source")),
            };
            self.source = Some(source);
            self.valid |= Validity::SOURCE;
        }

        if !self.valid.contains(Validity::CLIP) {
            self.clip = state.clip.intersection(&state.destination.bounds());
            self.valid |= Validity::CLIP;
        }

        if !self.valid.contains(Validity::COLOR) {
            self.color = state.color;
            self.valid |= Validity::COLOR;
        }

        if !self.valid.contains(Validity::BLEND) {
            let flags = state.blitting_flags;
            self.fill_blend = state.drawing_flags.contains(DrawingFlags::BLEND);
            self.blit = BlitParams {
                alpha: if flags.contains(BlittingFlags::BLEND_ALPHACHANNEL) {
                    AlphaMode::Channel
                } else if flags.contains(BlittingFlags::BLEND_COLORALPHA) {
                    AlphaMode::Constant(state.color.a)
                } else {
                    AlphaMode::Opaque
                },
                deinterlace: flags.contains(BlittingFlags::DEINTERLACE),
            };
            self.valid |= Validity::BLEND;
        }

        state.modified = StateModified::empty();
        state.set |= accel;
        Ok(())
    }

    fn fill_rectangle(&mut self, rect: Rect) -> Result<(), DrawError> {
        let dest = self.destination(Validity::CLIP | Validity::COLOR | Validity::BLEND)?;
        let rect = match self.clip.and_then(|clip| clip.intersection(&rect)) {
            Some(rect) => rect,
            None => return Ok(()),
        };
        self.device.fill(dest, rect, self.color, self.fill_blend)
    }

    fn blit(&mut self, src_rect: Rect, dx: i32, dy: i32) -> Result<(), DrawError> {
        let dest = self.destination(Validity::CLIP | Validity::BLEND)?;
        let source = self.source()?;

        // Clip against the source, then the destination
        let src = match src_rect.intersection(&source.bounds()) {
            Some(src) => src,
            None => return Ok(()),
        };
        let dst = Rect::new(
            translate(dx, src_rect.x, src.x),
            translate(dy, src_rect.y, src.y),
            src.w,
            src.h,
        );
        let clipped = match self.clip.and_then(|clip| clip.intersection(&dst)) {
            Some(clipped) => clipped,
            None => return Ok(()),
        };
        let src = Rect::new(
            translate(src.x, dst.x, clipped.x),
            translate(src.y, dst.y, clipped.y),
            clipped.w,
            clipped.h,
        );

        self.device
            .blit(dest, source, src, clipped.x, clipped.y, self.blit)
    }

    fn stretch_blit(&mut self, src_rect: Rect, dst_rect: Rect) -> Result<(), DrawError> {
        let dest = self.destination(Validity::CLIP | Validity::BLEND)?;
        let source = self.source()?;

        if !source.bounds().contains_rect(&src_rect) {
            return Err(DrawError::Unsupported("source rectangle is out of bounds"));
        }
        let clip = match self.clip {
            Some(clip) => clip,
            None => return Ok(()),
        };
        if !clip.contains_rect(&dst_rect) {
            return if clip.intersection(&dst_rect).is_some() {
                Err(DrawError::Unsupported("clipped stretch blit"))
            } else {
                Ok(())
            };
        }

        self.device
            .stretch_blit(dest, source, src_rect, dst_rect, self.blit)
    }

    fn emit_commands(&mut self) {
        if let Err(e) = self.device.flush() {
            warn!("Flushing failed: {}", e);
        }
    }

    fn engine_sync(&mut self) -> Result<(), DrawError> {
        self.device.sync()
    }
}
