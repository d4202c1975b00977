use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A packet sequence number. Sequence numbers are u32 on the wire and wrap around, so they are
///  ordered by modular distance: `a` is before `b` iff `(a - b) & 0x8000_0000 != 0`.
///
/// There is deliberately no `Ord` implementation since the order is not transitive across the
///  full number space.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Sqn(u32);

impl Debug for Sqn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Display for Sqn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sqn {
    pub const ZERO: Sqn = Sqn(0);
    const SIGN_BIT: u32 = 0x8000_0000;

    pub fn from_raw(raw: u32) -> Sqn {
        Sqn(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn is_before(self, other: Sqn) -> bool {
        self.0.wrapping_sub(other.0) & Self::SIGN_BIT != 0
    }

    pub fn is_after(self, other: Sqn) -> bool {
        other.is_before(self)
    }

    pub fn is_before_or_eq(self, other: Sqn) -> bool {
        !self.is_after(other)
    }

    /// number of steps from `self` to `later`, assuming `self` is not after `later`
    pub fn distance_to(self, later: Sqn) -> u32 {
        later.0.wrapping_sub(self.0)
    }

    pub fn next(self) -> Sqn {
        self + 1
    }

    pub fn prev(self) -> Sqn {
        self - 1
    }

    /// iterates from `self` (inclusive) to `end` (exclusive), empty if `end` is not after `self`
    pub fn to(self, end: Sqn) -> impl Iterator<Item = Sqn> {
        let len = if end.is_after(self) { self.distance_to(end) } else { 0 };
        (0..len).map(move |offs| self + offs)
    }

    pub fn max(self, other: Sqn) -> Sqn {
        if self.is_before(other) { other } else { self }
    }

    pub fn min(self, other: Sqn) -> Sqn {
        if self.is_after(other) { other } else { self }
    }
}

impl Add<u32> for Sqn {
    type Output = Sqn;

    fn add(self, rhs: u32) -> Self::Output {
        Sqn(self.0.wrapping_add(rhs))
    }
}
impl AddAssign<u32> for Sqn {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}
impl Sub<u32> for Sqn {
    type Output = Sqn;

    fn sub(self, rhs: u32) -> Self::Output {
        Sqn(self.0.wrapping_sub(rhs))
    }
}
