//! Trace window sizing.
//!
//! Before each trace query the session counts matches in a probe window. When
//! the probe is denser than the target, the queried window shrinks in
//! proportion so that the expected number of matches stays near the target:
//!
//! ```text
//! window = floor(match_target * probe_window / match_count)
//! ```
//!
//! Density is rarely uniform, so this bounds result size on average only.
//! The window never drops below one block, so an extremely dense region is
//! still walked block by block.

/// Number of blocks to query next, given `match_count` matches in a probe of
/// `probe_window` blocks and a desired `match_target`.
pub fn estimate_window(match_count: u64, match_target: u64, probe_window: u64) -> u64 {
    if match_count <= match_target {
        return probe_window;
    }
    let shrunk = u128::from(match_target) * u128::from(probe_window) / u128::from(match_count);
    // match_target < match_count, so shrunk < probe_window and fits in u64.
    (shrunk as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_probe_shrinks_window() {
        assert_eq!(estimate_window(400, 100, 100), 25);
        assert_eq!(estimate_window(300, 100, 100), 33);
    }

    #[test]
    fn sparse_probe_keeps_full_span() {
        assert_eq!(estimate_window(50, 100, 100), 100);
        assert_eq!(estimate_window(100, 100, 100), 100);
        assert_eq!(estimate_window(0, 100, 100), 100);
    }

    #[test]
    fn shrunk_window_is_strictly_smaller() {
        for count in 101..2_000 {
            assert!(estimate_window(count, 100, 100) < 100);
        }
    }

    #[test]
    fn extreme_density_keeps_one_block() {
        assert_eq!(estimate_window(100_000, 10, 100), 1);
        assert_eq!(estimate_window(u64::MAX, 1, 100), 1);
    }

    #[test]
    fn large_values_do_not_overflow() {
        assert_eq!(estimate_window(u64::MAX, u64::MAX - 1, u64::MAX), u64::MAX - 1);
    }
}
