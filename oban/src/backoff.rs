//! Retry delay calculation.
//!
//! The default strategy is an exponential curve with a fixed minimum pad and
//! symmetric jitter, with the exponent clamped so the delay never grows past
//! a few days. Workers may override it entirely via [`crate::Worker::backoff`].

use rand::Rng;

/// Exponent cap: 2^18 seconds is roughly three days.
const MAX_POW: u32 = 18;
const MIN_PAD: u64 = 15;
const JITTER_MULT: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JitterMode {
    Inc,
    Dec,
    Both,
}

pub(crate) fn exponential(attempt: u32, mult: u64, min_pad: u64, max_pow: u32) -> u64 {
    mult * 2u64.pow(attempt.min(max_pow)) + min_pad
}

pub(crate) fn jitter(value: u64, mode: JitterMode, mult: f64) -> u64 {
    let spread = value as f64 * mult;

    let offset = match mode {
        JitterMode::Inc => rand::thread_rng().gen_range(0.0..=spread),
        JitterMode::Dec => -rand::thread_rng().gen_range(0.0..=spread),
        JitterMode::Both => rand::thread_rng().gen_range(-spread..=spread),
    };

    (value as f64 + offset).round().max(1.0) as u64
}

/// Default retry delay in seconds for a job on its given attempt.
///
/// The base is `2^attempt + 15`, jittered by ±10%. The exponent is clamped so
/// late attempts of long-lived jobs stay bounded.
pub fn jittery_clamped(attempt: i32, max_attempts: i32) -> u64 {
    let capped = attempt.min(max_attempts).clamp(0, MAX_POW as i32) as u32;
    let base = exponential(capped, 1, MIN_PAD, MAX_POW);

    jitter(base, JitterMode::Both, JITTER_MULT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_exponential_backoff() {
        assert_eq!(exponential(0, 1, 0, MAX_POW), 1);
        assert_eq!(exponential(1, 1, 0, MAX_POW), 2);
        assert_eq!(exponential(2, 1, 0, MAX_POW), 4);
        assert_eq!(exponential(3, 1, 0, MAX_POW), 8);
    }

    #[test]
    fn test_exponential_with_multiplier() {
        assert_eq!(exponential(2, 5, 0, MAX_POW), 20);
    }

    #[test]
    fn test_exponential_with_min_pad() {
        assert_eq!(exponential(0, 1, 10, MAX_POW), 11);
        assert_eq!(exponential(1, 1, 10, MAX_POW), 12);
    }

    #[test]
    fn test_exponential_with_max_pow() {
        assert_eq!(exponential(10, 1, 0, 5), 32);
        assert_eq!(exponential(100, 1, 0, 5), 32);
    }

    #[test]
    fn test_inc_mode_always_increases() {
        for _ in 0..100 {
            assert!(jitter(100, JitterMode::Inc, 0.1) >= 100);
        }
    }

    #[test]
    fn test_dec_mode_always_decreases() {
        for _ in 0..100 {
            assert!(jitter(100, JitterMode::Dec, 0.1) <= 100);
        }
    }

    #[test]
    fn test_both_mode_stays_in_range() {
        for _ in 0..100 {
            let result = jitter(100, JitterMode::Both, 0.1);
            assert!((90..=110).contains(&result));
        }
    }

    #[test]
    fn test_custom_multiplier() {
        for _ in 0..100 {
            let result = jitter(100, JitterMode::Inc, 0.5);
            assert!((100..=150).contains(&result));
        }
    }

    #[test]
    fn test_jittery_clamped_stays_near_base() {
        // base for attempt 1 is 2 + 15 = 17, jittered by at most 10%
        for _ in 0..100 {
            let result = jittery_clamped(1, 10);
            assert!((15..=19).contains(&result));
        }
    }

    #[test]
    fn test_jittery_clamped_large_attempts_are_clamped() {
        let ceiling = ((2u64.pow(MAX_POW) + MIN_PAD) as f64 * 1.1) as u64 + 1;

        for _ in 0..100 {
            assert!(jittery_clamped(100, 100) <= ceiling);
        }
    }

    #[test]
    fn test_jittery_clamped_always_positive() {
        assert!(jittery_clamped(1, 1) > 0);
        assert!(jittery_clamped(1, 20) > 0);
        assert!(jittery_clamped(10, 20) > 0);
        assert!(jittery_clamped(50, 100) > 0);
    }

    #[test]
    fn test_jittery_clamped_grows_with_attempt_on_expectation() {
        let average = |attempt: i32| -> f64 {
            (0..200).map(|_| jittery_clamped(attempt, 20) as f64).sum::<f64>() / 200.0
        };

        assert!(average(6) > average(2));
    }
}
