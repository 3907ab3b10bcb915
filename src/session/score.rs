//! Mutation score computation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::mutant::{MutantRegistry, ResultStatus};

/// Percentage of mutants that did not survive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MutationScore {
    /// No mutant produced a verdict.
    NotApplicable,
    /// Score in `[0, 100]`.
    Percent(f64),
}

impl MutationScore {
    /// Numeric value, if any.
    pub fn percent(&self) -> Option<f64> {
        match self {
            Self::NotApplicable => None,
            Self::Percent(value) => Some(*value),
        }
    }
}

impl fmt::Display for MutationScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplicable => f.write_str("n/a"),
            Self::Percent(value) => write!(f, "{value:.2}%"),
        }
    }
}

/// Per-status counts of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// All mutants.
    pub total: usize,
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Timed-out mutants.
    pub timeout: usize,
    /// Mutants whose sandbox failed.
    pub execution_error: usize,
    /// Mutants never evaluated.
    pub not_run: usize,
}

impl ScoreSummary {
    /// Count statuses.
    pub fn from_registry(registry: &MutantRegistry) -> Self {
        let mut out = Self {
            total: registry.len(),
            ..Self::default()
        };
        for mutant in registry.mutants() {
            match mutant.status {
                ResultStatus::Killed => out.killed += 1,
                ResultStatus::Survived => out.survived += 1,
                ResultStatus::Timeout => out.timeout += 1,
                ResultStatus::ExecutionError => out.execution_error += 1,
                ResultStatus::NotRun => out.not_run += 1,
            }
        }
        out
    }

    /// Mutants that received a verdict from a test run.
    pub fn judged(&self) -> usize {
        self.total - self.execution_error - self.not_run
    }

    /// Detected share of judged mutants.
    pub fn score(&self) -> MutationScore {
        let judged = self.judged();
        if judged == 0 {
            return MutationScore::NotApplicable;
        }
        let detected = judged - self.survived;
        MutationScore::Percent(detected as f64 * 100.0 / judged as f64)
    }
}

/// Score a registry. `ExecutionError` and `NotRun` mutants have no verdict and
/// are left out; an empty or verdict-less registry is not applicable.
pub fn compute_score(registry: &MutantRegistry) -> MutationScore {
    ScoreSummary::from_registry(registry).score()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::session::mutant::test_mutant;

    fn registry_with(statuses: &[ResultStatus]) -> MutantRegistry {
        let mutants = (0..statuses.len() as u32)
            .map(|id| test_mutant(id, "m"))
            .collect();
        let mut registry = MutantRegistry::new(mutants).expect("registry should build");
        for (id, status) in statuses.iter().enumerate() {
            if status.is_terminal() {
                registry
                    .record(id as u32, *status)
                    .expect("status should record");
            }
        }
        registry
    }

    fn status() -> impl Strategy<Value = ResultStatus> {
        prop_oneof![
            Just(ResultStatus::Killed),
            Just(ResultStatus::Survived),
            Just(ResultStatus::Timeout),
            Just(ResultStatus::ExecutionError),
        ]
    }

    #[test]
    fn empty_registry_is_not_applicable() {
        assert_eq!(
            compute_score(&MutantRegistry::default()),
            MutationScore::NotApplicable
        );
    }

    #[test]
    fn timeouts_count_as_detected() {
        let registry = registry_with(&[
            ResultStatus::Killed,
            ResultStatus::Timeout,
            ResultStatus::Survived,
            ResultStatus::Survived,
        ]);
        assert_eq!(compute_score(&registry), MutationScore::Percent(50.0));
    }

    #[test]
    fn execution_errors_are_left_out() {
        let registry = registry_with(&[ResultStatus::Killed, ResultStatus::ExecutionError]);
        assert_eq!(compute_score(&registry), MutationScore::Percent(100.0));

        let only_errors = registry_with(&[ResultStatus::ExecutionError]);
        assert_eq!(compute_score(&only_errors), MutationScore::NotApplicable);
    }

    #[test]
    fn summary_counts_every_status() {
        let summary = ScoreSummary::from_registry(&registry_with(&[
            ResultStatus::Killed,
            ResultStatus::Survived,
            ResultStatus::Timeout,
            ResultStatus::ExecutionError,
            ResultStatus::NotRun,
        ]));
        assert_eq!(summary.total, 5);
        assert_eq!(summary.killed, 1);
        assert_eq!(summary.survived, 1);
        assert_eq!(summary.timeout, 1);
        assert_eq!(summary.execution_error, 1);
        assert_eq!(summary.not_run, 1);
        assert_eq!(summary.judged(), 3);
    }

    #[test]
    fn display_uses_two_decimals() {
        assert_eq!(MutationScore::Percent(100.0 / 3.0).to_string(), "33.33%");
        assert_eq!(MutationScore::NotApplicable.to_string(), "n/a");
    }

    proptest! {
        #[test]
        fn score_stays_within_bounds(statuses in prop::collection::vec(status(), 1..64)) {
            let registry = registry_with(&statuses);
            match compute_score(&registry) {
                MutationScore::Percent(value) => prop_assert!((0.0..=100.0).contains(&value)),
                MutationScore::NotApplicable => prop_assert!(
                    statuses.iter().all(|s| *s == ResultStatus::ExecutionError)
                ),
            }
        }

        #[test]
        fn all_killed_is_full_score(count in 1usize..32) {
            let registry = registry_with(&vec![ResultStatus::Killed; count]);
            prop_assert_eq!(compute_score(&registry), MutationScore::Percent(100.0));
        }
    }
}
