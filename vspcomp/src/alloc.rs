//! Input slot and scaler allocation for the open composition.
//!
//! A composition may use each input port once and each scaler once. Slots
//! are handed out in index order, which is also the blending order of the
//! compose unit, so the order of `reserve` calls is the painter's order.
//! Scalers are assigned first-fit. Nothing here touches the hardware; the
//! tables are read back by `pipeline::configure` at flush time.
use arrayvec::ArrayVec;
use std::fmt;

use crate::{
    config::{MAX_INPUTS, MAX_SCALERS},
    format::PixelFormat,
    geom::Rect,
    surface::SurfaceDesc,
};

/// The lifecycle of the composition owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No composition exists.
    Idle,
    /// A composition exists but has no sources other than its seed.
    Open,
    /// A composition has at least one source.
    Accumulating,
    /// The composition has been handed to the hardware. Its slots stay
    /// reserved until it retires.
    Submitted,
}

/// Why a source could not be added to the open composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Every input port is in use.
    Inputs,
    /// The source needs a scaler and every scaler is in use.
    Scaler,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Exhausted::Inputs => write!(f, "no input port is available"),
            Exhausted::Scaler => write!(f, "no scaler is available"),
        }
    }
}

/// A source to be read by an input port.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRequest {
    pub source: SurfaceDesc,
    /// The format the input port reads `source` as. This is either
    /// `source.format` or its opaque variant.
    pub read_format: PixelFormat,
    pub src_rect: Rect,
    pub dst_rect: Rect,
    /// The value of the alpha control, used for pixels without an alpha
    /// channel.
    pub alpha: u8,
    /// Read only the top field of `src_rect`.
    pub deinterlace: bool,
    /// The source is the composition target itself, providing the
    /// background of the composition.
    pub seed: bool,
}

impl SlotRequest {
    /// The size of the image leaving the input port.
    pub fn cropped_size(&self) -> [u32; 2] {
        let [w, h] = self.src_rect.size();
        if self.deinterlace {
            [w, h / 2]
        } else {
            [w, h]
        }
    }

    pub fn needs_scaler(&self) -> bool {
        self.cropped_size() != self.dst_rect.size()
    }
}

/// A reserved input port.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    /// The input port index, which is also the sink pad of the compose unit.
    pub index: u8,
    pub request: SlotRequest,
    pub scaler: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Allocator {
    phase: Phase,
    num_inputs: usize,
    slots: ArrayVec<[InputSlot; MAX_INPUTS]>,
    /// The slot owning each scaler.
    scaler_owner: ArrayVec<[Option<u8>; MAX_SCALERS]>,
}

impl Allocator {
    pub fn new(num_inputs: usize, num_scalers: usize) -> Self {
        assert!(num_inputs <= MAX_INPUTS && num_scalers <= MAX_SCALERS);
        Self {
            phase: Phase::Idle,
            num_inputs,
            slots: ArrayVec::new(),
            scaler_owner: (0..num_scalers).map(|_| None).collect(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Start a new composition.
    pub fn open(&mut self) {
        assert_eq!(self.phase, Phase::Idle, "a composition already exists");
        debug_assert!(self.slots.is_empty());
        self.phase = Phase::Open;
    }

    /// Reserve an input port (and a scaler if `request` needs one) for
    /// `request`.
    pub fn reserve(&mut self, request: SlotRequest) -> Result<u8, Exhausted> {
        assert!(
            self.phase == Phase::Open || self.phase == Phase::Accumulating,
            "no composition is open"
        );

        if self.slots.len() >= self.num_inputs {
            return Err(Exhausted::Inputs);
        }
        let index = self.slots.len() as u8;

        let scaler = if request.needs_scaler() {
            let s = self
                .scaler_owner
                .iter()
                .position(Option::is_none)
                .ok_or(Exhausted::Scaler)?;
            self.scaler_owner[s] = Some(index);
            Some(s as u8)
        } else {
            None
        };

        if !request.seed {
            self.phase = Phase::Accumulating;
        }
        self.slots.push(InputSlot {
            index,
            request,
            scaler,
        });
        Ok(index)
    }

    /// Mark the composition as handed to the hardware.
    pub fn submit(&mut self) {
        assert_eq!(self.phase, Phase::Accumulating);
        self.phase = Phase::Submitted;
    }

    /// Release every slot and scaler and return to `Idle`.
    pub fn reset(&mut self) {
        self.slots.clear();
        for owner in self.scaler_owner.iter_mut() {
            *owner = None;
        }
        self.phase = Phase::Idle;
    }

    pub fn slots(&self) -> &[InputSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [InputSlot] {
        &mut self.slots
    }

    /// The number of slots in use, including the seed.
    pub fn num_used(&self) -> usize {
        self.slots.len()
    }

    /// The number of slots in use by sources other than the seed.
    pub fn num_sources(&self) -> usize {
        self.slots.iter().filter(|s| !s.request.seed).count()
    }

    pub fn scaler_owner(&self, s: u8) -> Option<u8> {
        self.scaler_owner[s as usize]
    }

    pub fn num_scalers(&self) -> usize {
        self.scaler_owner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::DmaBufRef;
    use quickcheck_macros::quickcheck;

    fn request(src: [u32; 2], dst: [u32; 2]) -> SlotRequest {
        let source = SurfaceDesc::new(
            DmaBufRef::borrow_raw(3),
            PixelFormat::Argb8888,
            [64, 64],
            256,
        );
        SlotRequest {
            source,
            read_format: PixelFormat::Argb8888,
            src_rect: Rect::from_size(src),
            dst_rect: Rect::from_size(dst),
            alpha: 255,
            deinterlace: false,
            seed: false,
        }
    }

    #[test]
    fn phases() {
        let mut alloc = Allocator::new(4, 1);
        assert_eq!(alloc.phase(), Phase::Idle);
        alloc.open();
        assert_eq!(alloc.phase(), Phase::Open);

        let mut seed = request([64, 64], [64, 64]);
        seed.seed = true;
        assert_eq!(alloc.reserve(seed), Ok(0));
        assert_eq!(alloc.phase(), Phase::Open);
        assert_eq!(alloc.num_sources(), 0);

        assert_eq!(alloc.reserve(request([8, 8], [8, 8])), Ok(1));
        assert_eq!(alloc.phase(), Phase::Accumulating);

        alloc.submit();
        assert_eq!(alloc.phase(), Phase::Submitted);
        assert_eq!(alloc.num_used(), 2);

        alloc.reset();
        assert_eq!(alloc.phase(), Phase::Idle);
        assert_eq!(alloc.num_used(), 0);
    }

    #[test]
    fn scaler_is_exclusive() {
        let mut alloc = Allocator::new(4, 1);
        alloc.open();
        assert_eq!(alloc.reserve(request([8, 8], [16, 16])), Ok(0));
        assert_eq!(alloc.scaler_owner(0), Some(0));
        assert_eq!(
            alloc.reserve(request([8, 8], [4, 4])),
            Err(Exhausted::Scaler)
        );
        // Unscaled sources still fit
        assert_eq!(alloc.reserve(request([8, 8], [8, 8])), Ok(1));
    }

    #[test]
    fn deinterlace_reads_half_height() {
        let mut r = request([8, 8], [8, 4]);
        r.deinterlace = true;
        assert_eq!(r.cropped_size(), [8, 4]);
        assert!(!r.needs_scaler());

        r.dst_rect = Rect::from_size([8, 8]);
        assert!(r.needs_scaler());
    }

    #[quickcheck]
    fn first_fit(num_inputs: u8, num_scalers: u8, scaled: Vec<bool>) -> bool {
        let num_inputs = (num_inputs as usize % MAX_INPUTS) + 1;
        let num_scalers = num_scalers as usize % (MAX_SCALERS + 1);
        let mut alloc = Allocator::new(num_inputs, num_scalers);
        alloc.open();

        let mut scalers_used = 0;
        for (i, &scaled) in scaled.iter().enumerate() {
            let dst = if scaled { [16, 16] } else { [8, 8] };
            let used = alloc.num_used();
            let expected = if used >= num_inputs {
                Err(Exhausted::Inputs)
            } else if scaled && scalers_used >= num_scalers {
                Err(Exhausted::Scaler)
            } else {
                Ok(used as u8)
            };

            let result = alloc.reserve(request([8, 8], dst));
            if result != expected {
                log::debug!("step {}: got {:?}, expected {:?}", i, result, expected);
                return false;
            }
            if result.is_ok() && scaled {
                if alloc.scaler_owner(scalers_used as u8) != result.ok() {
                    return false;
                }
                scalers_used += 1;
            }
        }
        alloc.num_used() <= num_inputs
    }
}
