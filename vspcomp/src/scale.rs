//! Multi-pass scaling and the scratch buffers it renders into.
//!
//! A scaler can shrink or enlarge an image by at most `max_ratio` per axis
//! in one pass. Larger factors are split into intermediate passes, each of
//! which changes one axis by up to `max_ratio` and renders into a scratch
//! buffer. The final pass, from the last scratch buffer to the destination,
//! is within the limit and is composed like any other source.
use log::trace;
use std::io;

use crate::{
    format::PixelFormat,
    media::{DmaAllocator, DmaBuffer},
    surface::{DmaBufRef, SurfaceDesc},
};

/// Check if scaling `from` to `to` exceeds `max_ratio`.
fn exceeds(from: u32, to: u32, max_ratio: u32) -> bool {
    let (from, to, max_ratio) = (from as u64, to as u64, max_ratio as u64);
    from > to * max_ratio || to > from * max_ratio
}

/// Compare the scale factors of two axes. Returns `true` if `a` needs more
/// scaling than `b`, or they are equal.
fn ratio_ge(a: (u32, u32), b: (u32, u32)) -> bool {
    let norm = |(from, to): (u32, u32)| {
        let (from, to) = (from as u64, to as u64);
        if from >= to {
            (from, to)
        } else {
            (to, from)
        }
    };
    let (an, ad) = norm(a);
    let (bn, bd) = norm(b);
    an * bd >= bn * ad
}

/// Calculate the sizes of the intermediate images needed to scale an image
/// of size `src` to `dst`. Returns an empty list if it can be done in one
/// pass.
///
/// Each intermediate pass scales one axis, starting with the one having the
/// larger factor.
pub fn plan_passes(src: [u32; 2], dst: [u32; 2], max_ratio: u32) -> Vec<[u32; 2]> {
    assert!(max_ratio >= 2);
    assert!(src.iter().chain(dst.iter()).all(|&x| x > 0));

    let mut passes = Vec::new();
    let mut cur = src;
    loop {
        let over = [
            exceeds(cur[0], dst[0], max_ratio),
            exceeds(cur[1], dst[1], max_ratio),
        ];
        let axis = match over {
            [false, false] => break,
            [true, false] => 0,
            [false, true] => 1,
            [true, true] => {
                if ratio_ge((cur[0], dst[0]), (cur[1], dst[1])) {
                    0
                } else {
                    1
                }
            }
        };

        cur[axis] = if cur[axis] > dst[axis] {
            (cur[axis] + max_ratio - 1) / max_ratio
        } else {
            cur[axis] * max_ratio
        };
        passes.push(cur);
    }

    trace!("plan_passes({:?}, {:?}) = {:?}", src, dst, passes);
    passes
}

/// The size of a solid tile that can be stretched to `size` in one pass.
pub fn fill_tile_size(size: [u32; 2], min_size: u32, max_ratio: u32) -> [u32; 2] {
    let axis = |extent: u32| {
        let needed = (extent + max_ratio - 1) / max_ratio;
        needed.max(min_size).min(extent).max(1)
    };
    [axis(size[0]), axis(size[1])]
}

#[derive(Debug)]
struct Entry<B> {
    buffer: B,
    /// The last composition referencing the buffer.
    generation: u64,
}

/// A fixed-size ring of scratch buffers.
#[derive(Debug)]
pub struct ScratchPool<B> {
    entries: Vec<Option<Entry<B>>>,
    next: usize,
}

impl<B: DmaBuffer> ScratchPool<B> {
    /// Construct a `ScratchPool`. At least two entries are created so that
    /// the source and target of a pass never share a buffer.
    pub fn new(len: usize) -> Self {
        Self {
            entries: (0..len.max(2)).map(|_| None).collect(),
            next: 0,
        }
    }

    /// The entry to be handed out by the next call to `take`.
    pub fn peek(&self) -> usize {
        self.next
    }

    /// Check if entry `index` may still be read or written by a composition
    /// that hasn't retired.
    pub fn is_busy(&self, index: usize, retired: u64) -> bool {
        match &self.entries[index] {
            Some(entry) => entry.generation > retired,
            None => false,
        }
    }

    /// Hand out the next entry as a surface, (re)allocating its buffer if it's
    /// smaller than `format` at `size` needs. The caller must have made sure
    /// the entry isn't busy.
    pub fn take<A>(
        &mut self,
        alloc: &A,
        format: PixelFormat,
        size: [u32; 2],
    ) -> io::Result<(usize, SurfaceDesc)>
    where
        A: DmaAllocator<Buffer = B>,
    {
        let index = self.next;
        let pitch = format.min_pitch(0, size[0]);
        let mut desc = SurfaceDesc::new(DmaBufRef::borrow_raw(-1), format, size, pitch);
        let len = desc.byte_len();

        let entry = match &mut self.entries[index] {
            Some(entry) if entry.buffer.len() >= len => entry,
            slot => {
                // Free the old one first
                *slot = None;
                let buffer = alloc.allocate(len)?;
                trace!("Scratch buffer {}: allocated {} bytes", index, len);
                slot.get_or_insert(Entry {
                    buffer,
                    generation: 0,
                })
            }
        };

        let fd = entry.buffer.fd();
        for plane in desc.planes.iter_mut() {
            plane.buf = fd;
        }

        self.next = (index + 1) % self.entries.len();
        Ok((index, desc))
    }

    /// Give the CPU write access to entry `index`.
    pub fn write(&mut self, index: usize, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        match &mut self.entries[index] {
            Some(entry) => entry.buffer.write_with(f),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    /// Record that the composition `generation` references the buffer `fd`,
    /// if it's one of ours.
    pub fn touch(&mut self, fd: DmaBufRef, generation: u64) {
        for entry in self.entries.iter_mut().flatten() {
            if entry.buffer.fd() == fd {
                entry.generation = entry.generation.max(generation);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release every buffer.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{MockAllocator, MockMedia};
    use quickcheck_macros::quickcheck;

    #[test]
    fn single_pass() {
        assert!(plan_passes([100, 100], [100, 100], 11).is_empty());
        assert!(plan_passes([1100, 10], [100, 110], 11).is_empty());
    }

    #[test]
    fn two_axis_downscale() {
        assert_eq!(
            plan_passes([2000, 2000], [100, 100], 11),
            vec![[182, 2000], [182, 182]]
        );
    }

    #[test]
    fn larger_factor_first() {
        assert_eq!(
            plan_passes([1200, 3000], [100, 100], 11),
            vec![[1200, 273], [110, 273]]
        );
    }

    #[test]
    fn upscale() {
        assert_eq!(plan_passes([10, 10], [200, 10], 11), vec![[110, 10]]);
    }

    #[quickcheck]
    fn passes_are_within_limit(src: (u16, u16), dst: (u16, u16), max_ratio: u8) -> bool {
        let max_ratio = (max_ratio as u32 % 15) + 2;
        let src = [src.0 as u32 + 1, src.1 as u32 + 1];
        let dst = [dst.0 as u32 + 1, dst.1 as u32 + 1];

        let passes = plan_passes(src, dst, max_ratio);
        let mut cur = src;
        for &next in passes.iter().chain(std::iter::once(&dst)) {
            for axis in 0..2 {
                if exceeds(cur[axis], next[axis], max_ratio) {
                    return false;
                }
            }
            cur = next;
        }
        true
    }

    #[test]
    fn tile_size() {
        assert_eq!(fill_tile_size([100, 4], 8, 11), [10, 4]);
        assert_eq!(fill_tile_size([16, 1000], 8, 11), [8, 91]);
    }

    #[test]
    fn pool_reuses_and_rotates() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let alloc = MockAllocator::new(&media);
        let mut pool = ScratchPool::new(2);

        let (i0, a) = pool.take(&alloc, PixelFormat::Argb8888, [16, 16]).unwrap();
        let (i1, _) = pool.take(&alloc, PixelFormat::Argb8888, [16, 16]).unwrap();
        assert_eq!((i0, i1), (0, 1));
        assert_eq!(media.num_buffers(), 2);

        // Smaller; reused
        let (i2, b) = pool.take(&alloc, PixelFormat::Argb8888, [8, 8]).unwrap();
        assert_eq!(i2, 0);
        assert_eq!(a.planes[0].buf, b.planes[0].buf);

        // Larger; reallocated
        let (_, c) = pool.take(&alloc, PixelFormat::Argb8888, [64, 64]).unwrap();
        assert_eq!(media.num_buffers(), 2);
        assert_ne!(c.planes[0].buf.as_raw(), -1);

        pool.touch(b.planes[0].buf, 3);
        assert!(pool.is_busy(0, 2));
        assert!(!pool.is_busy(0, 3));

        pool.clear();
        assert_eq!(media.num_buffers(), 0);
    }
}
