use std::fmt::{Display, Formatter};

/// Per-stream, per-direction sequence number.
///
/// Sequence numbers wrap modulo 2^32, so they have no total order. All
/// comparisons go through [`SeqNr::distance_from`], which interprets the
/// difference in `(-2^31, 2^31]` - the usual signed-difference rule.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNr(u32);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const ZERO: SeqNr = SeqNr(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    pub fn plus(self, n: u32) -> SeqNr {
        SeqNr(self.0.wrapping_add(n))
    }

    /// Signed modular distance from `other` to `self`: positive if `self`
    /// is ahead of `other`, negative if behind.
    pub fn distance_from(self, other: SeqNr) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub fn is_before(self, other: SeqNr) -> bool {
        self.distance_from(other) < 0
    }

    pub fn is_after(self, other: SeqNr) -> bool {
        self.distance_from(other) > 0
    }

    /// Iterate `[self, end)` in modular order. `end` must be at or ahead of
    /// `self` by less than 2^31.
    pub fn until(self, end: SeqNr) -> SeqRange {
        debug_assert!(end.distance_from(self) >= 0);
        SeqRange { next: self, end }
    }
}

pub struct SeqRange {
    next: SeqNr,
    end: SeqNr,
}

impl Iterator for SeqRange {
    type Item = SeqNr;

    fn next(&mut self) -> Option<SeqNr> {
        if self.next == self.end {
            None
        } else {
            let result = self.next;
            self.next = self.next.next();
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::ahead(7, 5, 2)]
    #[case::behind(5, 7, -2)]
    #[case::wrap_ahead(2, u32::MAX - 1, 4)]
    #[case::wrap_behind(u32::MAX - 1, 2, -4)]
    fn test_distance(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNr::from_raw(a).distance_from(SeqNr::from_raw(b)), expected);
    }

    #[rstest]
    #[case::regular(3, 4)]
    #[case::wrap(u32::MAX, 0)]
    fn test_next(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(SeqNr::from_raw(raw).next(), SeqNr::from_raw(expected));
    }

    #[rstest]
    #[case::empty(3, 3, vec![])]
    #[case::simple(3, 6, vec![3, 4, 5])]
    #[case::wrapping(u32::MAX - 1, 1, vec![u32::MAX - 1, u32::MAX, 0])]
    fn test_until(#[case] from: u32, #[case] to: u32, #[case] expected: Vec<u32>) {
        let actual = SeqNr::from_raw(from)
            .until(SeqNr::from_raw(to))
            .map(SeqNr::to_raw)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::before(1, 2, true, false)]
    #[case::after(2, 1, false, true)]
    #[case::same(2, 2, false, false)]
    #[case::wrap(u32::MAX, 1, true, false)]
    fn test_ordering(#[case] a: u32, #[case] b: u32, #[case] before: bool, #[case] after: bool) {
        assert_eq!(SeqNr::from_raw(a).is_before(SeqNr::from_raw(b)), before);
        assert_eq!(SeqNr::from_raw(a).is_after(SeqNr::from_raw(b)), after);
    }
}
