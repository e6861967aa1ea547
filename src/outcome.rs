//! Outcome lattice and expectation matching.
//!
//! Outcomes form a total order from best to worst; aggregating one solution
//! across many testcases takes the worst outcome. The declaration order of
//! the enum IS the lattice order, so `Ord` is derived.

use serde::{Deserialize, Serialize};

/// Verdict for a single evaluation or an aggregated solution.
///
/// Ordered from best to worst; `worst_of` relies on the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Passed all checks
    Accepted,
    /// Output does not match expected
    WrongAnswer,
    /// Exceeded memory limit
    MemoryLimitExceeded,
    /// Exceeded time limit
    TimeLimitExceeded,
    /// Made no CPU progress while the wall clock kept running
    IdlenessLimitExceeded,
    /// Program crashed or non-zero exit
    RuntimeError,
    /// Output too large
    OutputLimitExceeded,
    /// Checker or interactor failed
    JudgeFailed,
    /// The grading machinery itself failed
    InternalError,
    /// Source did not compile
    CompilationError,
}

impl Outcome {
    /// Get short code for the outcome
    pub fn code(&self) -> &'static str {
        match self {
            Outcome::Accepted => "AC",
            Outcome::WrongAnswer => "WA",
            Outcome::MemoryLimitExceeded => "MLE",
            Outcome::TimeLimitExceeded => "TLE",
            Outcome::IdlenessLimitExceeded => "ILE",
            Outcome::RuntimeError => "RTE",
            Outcome::OutputLimitExceeded => "OLE",
            Outcome::JudgeFailed => "JF",
            Outcome::InternalError => "IE",
            Outcome::CompilationError => "CE",
        }
    }

    /// Check if the outcome is a failure (not accepted)
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Accepted)
    }

    /// Terminal outcomes stop further evaluation of the solution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Outcome::JudgeFailed | Outcome::InternalError | Outcome::CompilationError
        )
    }

    /// Worst outcome of a set, or `Accepted` for an empty set.
    pub fn worst_of(outcomes: impl IntoIterator<Item = Outcome>) -> Outcome {
        outcomes
            .into_iter()
            .max()
            .unwrap_or(Outcome::Accepted)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Admissible outcome set declared for a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedOutcome {
    /// Matches everything
    Any,
    Accepted,
    /// Accepted, TLE or ILE
    AcceptedOrTle,
    WrongAnswer,
    /// Any of WA, RTE, MLE, OLE, TLE, ILE
    Incorrect,
    TimeLimitExceeded,
    TleOrRte,
    RuntimeError,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    JudgeFailed,
}

impl ExpectedOutcome {
    /// Whether the aggregated outcome satisfies this expectation.
    pub fn matches(&self, outcome: Outcome) -> bool {
        use Outcome::*;
        match self {
            ExpectedOutcome::Any => true,
            ExpectedOutcome::Accepted => outcome == Accepted,
            ExpectedOutcome::AcceptedOrTle => {
                matches!(outcome, Accepted | TimeLimitExceeded | IdlenessLimitExceeded)
            }
            ExpectedOutcome::WrongAnswer => outcome == WrongAnswer,
            ExpectedOutcome::Incorrect => matches!(
                outcome,
                WrongAnswer
                    | RuntimeError
                    | MemoryLimitExceeded
                    | OutputLimitExceeded
                    | TimeLimitExceeded
                    | IdlenessLimitExceeded
            ),
            ExpectedOutcome::TimeLimitExceeded => {
                matches!(outcome, TimeLimitExceeded | IdlenessLimitExceeded)
            }
            ExpectedOutcome::TleOrRte => matches!(
                outcome,
                TimeLimitExceeded | IdlenessLimitExceeded | RuntimeError
            ),
            ExpectedOutcome::RuntimeError => outcome == RuntimeError,
            ExpectedOutcome::MemoryLimitExceeded => outcome == MemoryLimitExceeded,
            ExpectedOutcome::OutputLimitExceeded => outcome == OutputLimitExceeded,
            ExpectedOutcome::JudgeFailed => outcome == JudgeFailed,
        }
    }

    /// Whether a TLE verdict under doubled limits deserves the
    /// "might actually be correct" warning.
    pub fn is_tle_shaped(&self) -> bool {
        matches!(
            self,
            ExpectedOutcome::TimeLimitExceeded | ExpectedOutcome::TleOrRte
        )
    }
}

impl std::fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ExpectedOutcome::Any => "ANY",
            ExpectedOutcome::Accepted => "ACCEPTED",
            ExpectedOutcome::AcceptedOrTle => "ACCEPTED_OR_TLE",
            ExpectedOutcome::WrongAnswer => "WRONG_ANSWER",
            ExpectedOutcome::Incorrect => "INCORRECT",
            ExpectedOutcome::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            ExpectedOutcome::TleOrRte => "TLE_OR_RTE",
            ExpectedOutcome::RuntimeError => "RUNTIME_ERROR",
            ExpectedOutcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ExpectedOutcome::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            ExpectedOutcome::JudgeFailed => "JUDGE_FAILED",
        };
        write!(f, "{tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_order_is_declaration_order() {
        assert!(Outcome::Accepted < Outcome::WrongAnswer);
        assert!(Outcome::WrongAnswer < Outcome::MemoryLimitExceeded);
        assert!(Outcome::MemoryLimitExceeded < Outcome::TimeLimitExceeded);
        assert!(Outcome::TimeLimitExceeded < Outcome::IdlenessLimitExceeded);
        assert!(Outcome::IdlenessLimitExceeded < Outcome::RuntimeError);
        assert!(Outcome::RuntimeError < Outcome::OutputLimitExceeded);
        assert!(Outcome::OutputLimitExceeded < Outcome::JudgeFailed);
        assert!(Outcome::JudgeFailed < Outcome::InternalError);
        assert!(Outcome::InternalError < Outcome::CompilationError);
    }

    #[test]
    fn worst_of_takes_maximum() {
        let outcomes = [
            Outcome::Accepted,
            Outcome::TimeLimitExceeded,
            Outcome::WrongAnswer,
        ];
        assert_eq!(Outcome::worst_of(outcomes), Outcome::TimeLimitExceeded);
        assert_eq!(Outcome::worst_of([]), Outcome::Accepted);
    }

    #[test]
    fn incorrect_matches_all_bad_verdicts() {
        let expected = ExpectedOutcome::Incorrect;
        for bad in [
            Outcome::WrongAnswer,
            Outcome::RuntimeError,
            Outcome::MemoryLimitExceeded,
            Outcome::OutputLimitExceeded,
            Outcome::TimeLimitExceeded,
            Outcome::IdlenessLimitExceeded,
        ] {
            assert!(expected.matches(bad), "INCORRECT should match {bad}");
        }
        assert!(!expected.matches(Outcome::Accepted));
        assert!(!expected.matches(Outcome::JudgeFailed));
    }

    #[test]
    fn accepted_or_tle_includes_idleness() {
        let expected = ExpectedOutcome::AcceptedOrTle;
        assert!(expected.matches(Outcome::Accepted));
        assert!(expected.matches(Outcome::TimeLimitExceeded));
        assert!(expected.matches(Outcome::IdlenessLimitExceeded));
        assert!(!expected.matches(Outcome::WrongAnswer));
    }

    #[test]
    fn any_matches_everything() {
        for outcome in [
            Outcome::Accepted,
            Outcome::CompilationError,
            Outcome::InternalError,
            Outcome::JudgeFailed,
        ] {
            assert!(ExpectedOutcome::Any.matches(outcome));
        }
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&Outcome::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"TIME_LIMIT_EXCEEDED\"");
        let back: Outcome = serde_json::from_str("\"WRONG_ANSWER\"").unwrap();
        assert_eq!(back, Outcome::WrongAnswer);
    }
}
