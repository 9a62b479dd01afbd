//! Integer rectangles used for source/destination sub-regions and damage.
use std::{
    cmp::{max, min},
    fmt,
};

/// An axis-aligned rectangle in pixel units.
///
/// `x` and `y` are the top-left corner (inclusive). An empty rectangle has a
/// zero width or height; its position is meaningless.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.w, self.h, self.x, self.y)
    }
}

impl Rect {
    #[inline]
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// A rectangle placed at the origin.
    #[inline]
    pub const fn from_size(size: [u32; 2]) -> Self {
        Self::new(0, 0, size[0], size[1])
    }

    #[inline]
    pub fn size(&self) -> [u32; 2] {
        [self.w, self.h]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// The exclusive right edge.
    #[inline]
    pub fn right(&self) -> i64 {
        self.x as i64 + self.w as i64
    }

    /// The exclusive bottom edge.
    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.h as i64
    }

    fn from_edges(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self::new(
            x0 as i32,
            y0 as i32,
            max(x1 - x0, 0) as u32,
            max(y1 - y0, 0) as u32,
        )
    }

    /// The smallest rectangle containing both. Empty operands are ignored.
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::from_edges(
            min(self.x, other.x) as i64,
            min(self.y, other.y) as i64,
            max(self.right(), other.right()),
            max(self.bottom(), other.bottom()),
        )
    }

    #[inline]
    pub fn union_assign(&mut self, other: &Self) {
        *self = self.union(other);
    }

    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let s = Self::from_edges(
            max(self.x, other.x) as i64,
            max(self.y, other.y) as i64,
            min(self.right(), other.right()),
            min(self.bottom(), other.bottom()),
        );
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    /// Check if `other` lies entirely within `self`. An empty `other` is
    /// contained by anything.
    pub fn contains_rect(&self, other: &Self) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    #[inline]
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.w, self.h)
    }

    #[inline]
    pub fn with_size(&self, size: [u32; 2]) -> Self {
        Self::new(self.x, self.y, size[0], size[1])
    }
}

/// Accumulates the bounding box of every rectangle written by a composition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Damage {
    bounds: Option<Rect>,
}

impl Damage {
    pub const fn new() -> Self {
        Self { bounds: None }
    }

    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if let Some(x) = &mut self.bounds {
            x.union_assign(&rect);
        } else {
            self.bounds = Some(rect);
        }
    }

    pub fn bounds(&self) -> Option<Rect> {
        self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn rect(v: (i16, i16, u8, u8)) -> Rect {
        Rect::new(v.0 as i32, v.1 as i32, v.2 as u32, v.3 as u32)
    }

    #[quickcheck]
    fn union_contains_operands(a: (i16, i16, u8, u8), b: (i16, i16, u8, u8)) -> bool {
        let (a, b) = (rect(a), rect(b));
        let u = a.union(&b);
        u.contains_rect(&a) && u.contains_rect(&b)
    }

    #[quickcheck]
    fn intersection_is_contained(a: (i16, i16, u8, u8), b: (i16, i16, u8, u8)) -> bool {
        let (a, b) = (rect(a), rect(b));
        match a.intersection(&b) {
            Some(i) => a.contains_rect(&i) && b.contains_rect(&i) && !i.is_empty(),
            None => true,
        }
    }

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.union(&Rect::new(-100, -100, 0, 3)), a);
        assert_eq!(Rect::default().union(&a), a);
    }

    #[test]
    fn damage_bounds() {
        let mut damage = Damage::new();
        assert!(damage.is_empty());
        damage.add(Rect::new(0, 0, 50, 50));
        damage.add(Rect::new(100, 100, 50, 50));
        damage.add(Rect::new(7, 7, 0, 0));
        assert_eq!(damage.bounds(), Some(Rect::new(0, 0, 150, 150)));
    }

    #[test]
    fn disjoint_intersection() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.intersection(&Rect::new(10, 0, 10, 10)), None);
        assert_eq!(
            a.intersection(&Rect::new(5, -5, 10, 10)),
            Some(Rect::new(5, 0, 5, 5))
        );
    }
}
