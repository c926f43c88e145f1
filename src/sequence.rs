//! Sequence numbers live in a ring of [NUM_SEQUENCE_NUMBERS] values that is shared by all sender
//!  and receiver channels. Comparisons are relative to a reference point, taking wrap-around into
//!  account: a number up to half the ring ahead of the reference is 'after' it, everything else
//!  is 'before' it.

pub const NUM_SEQUENCE_NUMBERS: u16 = 1024;

const HALF_RING: i32 = NUM_SEQUENCE_NUMBERS as i32 / 2;

/// Returns the signed distance of `nr` from `expected`: negative if `nr` is before `expected`,
///  zero if equal, positive if after.
pub fn relative_sequence_number(nr: u16, expected: u16) -> i32 {
    debug_assert!(nr < NUM_SEQUENCE_NUMBERS && expected < NUM_SEQUENCE_NUMBERS);

    let ring = NUM_SEQUENCE_NUMBERS as i32;
    let diff = (nr as i32 - expected as i32).rem_euclid(ring);
    if diff >= HALF_RING {
        diff - ring
    }
    else {
        diff
    }
}

pub fn next_sequence_number(nr: u16) -> u16 {
    (nr + 1) % NUM_SEQUENCE_NUMBERS
}

pub fn prev_sequence_number(nr: u16) -> u16 {
    (nr + NUM_SEQUENCE_NUMBERS - 1) % NUM_SEQUENCE_NUMBERS
}

/// `nr + delta` in the ring, `delta` being a (possibly negative) relative distance
pub fn add_to_sequence_number(nr: u16, delta: i32) -> u16 {
    (nr as i32 + delta).rem_euclid(NUM_SEQUENCE_NUMBERS as i32) as u16
}

/// number of sequence numbers from `start` (inclusive) to `end` (exclusive), walking forward
pub fn sequence_distance(start: u16, end: u16) -> u16 {
    (end + NUM_SEQUENCE_NUMBERS - start) % NUM_SEQUENCE_NUMBERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(7, 7, 0)]
    #[case::after(8, 7, 1)]
    #[case::before(6, 7, -1)]
    #[case::wrap_after(5, 1020, 9)]
    #[case::wrap_before(1020, 5, -9)]
    #[case::just_below_half(511, 0, 511)]
    #[case::half(512, 0, -512)]
    #[case::zero_from_max(0, 1023, 1)]
    fn test_relative(#[case] nr: u16, #[case] expected: u16, #[case] relative: i32) {
        assert_eq!(relative_sequence_number(nr, expected), relative);
    }

    #[test]
    fn test_relative_is_consistent_over_the_whole_ring() {
        for a in 0..NUM_SEQUENCE_NUMBERS {
            assert_eq!(relative_sequence_number(a, a), 0);
            for delta in 1..HALF_RING {
                let b = add_to_sequence_number(a, delta);
                assert!(relative_sequence_number(b, a) > 0, "{} should be after {}", b, a);
                assert!(relative_sequence_number(a, b) < 0, "{} should be before {}", a, b);
                assert_eq!(relative_sequence_number(b, a), delta);
            }
        }
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1023, 0)]
    fn test_next(#[case] nr: u16, #[case] expected: u16) {
        assert_eq!(next_sequence_number(nr), expected);
        assert_eq!(prev_sequence_number(expected), nr);
    }

    #[rstest]
    #[case(0, 0, 0)]
    #[case(10, 15, 5)]
    #[case(1020, 3, 7)]
    fn test_distance(#[case] start: u16, #[case] end: u16, #[case] expected: u16) {
        assert_eq!(sequence_distance(start, end), expected);
    }
}
