//! Turns a probe's checks into a 0-100 score and a status tier.
//!
//! The thresholds here are the single definition of HEALTHY / DEGRADED /
//! UNHEALTHY used by the orchestrator, the remediation rules and reports.

use super::{CheckOutcome, HealthStatus};

/// Minimum score for HEALTHY.
pub const HEALTHY_THRESHOLD: u8 = 80;
/// Minimum score for DEGRADED; anything lower is UNHEALTHY.
pub const DEGRADED_THRESHOLD: u8 = 60;

pub const MAX_SCORE: u8 = 100;

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        if score >= HEALTHY_THRESHOLD {
            HealthStatus::Healthy
        } else if score >= DEGRADED_THRESHOLD {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// `round(100 * passed / total)`, half rounding up.
///
/// With no checks the score is 100 only when the probe reported no errors.
pub fn calculate_score(checks: &[CheckOutcome], error_count: usize) -> u8 {
    let total = checks.len() as u64;
    if total == 0 {
        return if error_count == 0 { MAX_SCORE } else { 0 };
    }
    let passed = checks.iter().filter(|c| c.passed).count() as u64;
    ((200 * passed + total) / (2 * total)) as u8
}

pub fn clamp_score(raw: i64) -> u8 {
    raw.clamp(0, MAX_SCORE as i64) as u8
}

/// Arithmetic mean of the scores, rounded. `None` for an empty set.
pub fn mean_score<I: IntoIterator<Item = u8>>(scores: I) -> Option<u8> {
    let (sum, count) = scores
        .into_iter()
        .fold((0u64, 0u64), |(sum, count), s| (sum + s as u64, count + 1));
    if count == 0 {
        return None;
    }
    Some(((2 * sum + count) / (2 * count)) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn checks(passed: usize, total: usize) -> Vec<CheckOutcome> {
        (0..total)
            .map(|i| {
                if i < passed {
                    CheckOutcome::pass(format!("check-{i}"))
                } else {
                    CheckOutcome::fail(format!("check-{i}"), "failed")
                }
            })
            .collect()
    }

    #[test]
    fn all_passing_is_full_score() {
        assert_eq!(calculate_score(&checks(10, 10), 0), 100);
    }

    #[test]
    fn partial_pass_rounds_half_up() {
        assert_eq!(calculate_score(&checks(3, 10), 0), 30);
        assert_eq!(calculate_score(&checks(1, 3), 0), 33);
        assert_eq!(calculate_score(&checks(2, 3), 0), 67);
        assert_eq!(calculate_score(&checks(1, 8), 0), 13);
    }

    #[test]
    fn empty_checks_depend_on_errors() {
        assert_eq!(calculate_score(&[], 0), 100);
        assert_eq!(calculate_score(&[], 2), 0);
    }

    #[test]
    fn errors_do_not_change_a_structured_score() {
        assert_eq!(calculate_score(&checks(4, 4), 3), 100);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        assert_eq!(clamp_score(-15), 0);
        assert_eq!(clamp_score(250), 100);
        assert_eq!(clamp_score(42), 42);
    }

    #[test]
    fn thresholds_map_to_tiers() {
        assert_eq!(HealthStatus::from_score(100), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(60), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(59), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_score(0), HealthStatus::Unhealthy);
    }

    #[test]
    fn mean_score_rounds() {
        assert_eq!(mean_score([100, 30]), Some(65));
        assert_eq!(mean_score([100, 33]), Some(67));
        assert_eq!(mean_score(Vec::<u8>::new()), None);
    }

    proptest! {
        #[test]
        fn score_matches_rounded_ratio(total in 1usize..200, passed_seed in 0usize..200) {
            let passed = passed_seed % (total + 1);
            let score = calculate_score(&checks(passed, total), 0);
            let expected = (100.0 * passed as f64 / total as f64).round() as u8;
            prop_assert_eq!(score, expected);
            prop_assert_eq!(HealthStatus::from_score(score), HealthStatus::from_score(expected));
        }
    }
}
