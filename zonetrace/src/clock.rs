//! Profiler clock
//!
//! Nanoseconds since the first time the clock was read in this process, as
//! `i64`. Every event timestamp comes from [`now`].

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

#[must_use]
#[inline]
pub fn now() -> i64 {
    let elapsed = ANCHOR.get_or_init(Instant::now).elapsed();
    i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
}

/// Smallest non-zero step between consecutive readings
#[must_use]
pub fn resolution(samples: usize) -> u64 {
    let mut best = u64::MAX;
    let mut prev = now();
    for _ in 0..samples {
        let current = now();
        let step = current.wrapping_sub(prev);
        if step > 0 {
            best = best.min(step.unsigned_abs());
        }
        prev = current;
    }
    if best == u64::MAX {
        1
    } else {
        best
    }
}

/// Average cost of one reading in nanoseconds
#[must_use]
pub fn read_cost(samples: u32) -> u64 {
    let samples = samples.max(1);
    let begin = now();
    let mut sink = 0i64;
    for _ in 0..samples {
        sink = sink.wrapping_add(now());
    }
    std::hint::black_box(sink);
    let total = now().wrapping_sub(begin).max(0).unsigned_abs();
    total / u64::from(samples)
}

/// Verify readings never go backwards
///
/// # Errors
/// The size of the first backwards step, in nanoseconds.
pub fn check_monotonic(samples: usize) -> Result<(), i64> {
    check_sequence((0..samples).map(|_| now()))
}

pub(crate) fn check_sequence(readings: impl IntoIterator<Item = i64>) -> Result<(), i64> {
    let mut prev = i64::MIN;
    for reading in readings {
        if reading < prev {
            return Err(prev - reading);
        }
        prev = reading;
    }
    Ok(())
}

#[must_use]
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        assert!(check_monotonic(10_000).is_ok());
        let a = now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now() - a >= 2_000_000);
    }

    #[test]
    fn test_check_sequence_reports_back_step() {
        assert_eq!(check_sequence([1, 5, 5, 9]), Ok(()));
        assert_eq!(check_sequence([1, 5, 3, 9]), Err(2));
    }

    #[test]
    fn test_resolution_is_positive() {
        assert!(resolution(1_000) >= 1);
        let _ = read_cost(100);
    }
}
