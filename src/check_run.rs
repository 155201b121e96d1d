mod controller;
mod index;
mod runner;
mod task;
mod view;

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

pub use controller::CheckRunController;
pub use index::{CheckRunIndex, CheckRunKey, TrackedCheckRun};
pub use runner::JobRunner;
pub use task::{CiJob, CommandJob, Job, JobConfig, JobReport};
#[cfg(test)]
pub use task::MockCiJob;
pub use view::{CheckRunView, FLAG_OFF_ACTION, FLAG_ON_ACTION};

// https://docs.github.com/en/rest/checks/runs?apiVersion=2022-11-28#create-a-check-run--parameters
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Conclusion {
    ActionRequired,
    Cancelled,
    Failure,
    Neutral,
    Success,
    Skipped,
    TimedOut,
    /// Only GitHub can mark a check run as stale.
    Stale,
}

impl Conclusion {
    pub const fn is_settable(self) -> bool {
        !matches!(self, Self::Stale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Waiting,
    Requested,
    Pending,
}

/// Lifecycle of a check run. The conclusion only exists on the completed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRunState {
    Queued,
    InProgress,
    Completed(Conclusion),
}

/// Whether `complete` may skip `in_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletePolicy {
    RequireStarted,
    AllowFromQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("check run cannot move from {from} to {to}")]
    Illegal { from: CheckRunState, to: JobStatus },
    #[error("conclusion {0} is assigned by GitHub only")]
    ReservedConclusion(Conclusion),
}

impl CheckRunState {
    /// State of a check run as reported by GitHub.
    pub fn from_remote(status: JobStatus, conclusion: Option<Conclusion>) -> Self {
        match (status, conclusion) {
            (JobStatus::Completed, Some(c)) => Self::Completed(c),
            // GitHub always sends a conclusion for completed runs. Treat a missing one as terminal anyway.
            (JobStatus::Completed, None) => Self::Completed(Conclusion::Stale),
            (JobStatus::InProgress, _) => Self::InProgress,
            (JobStatus::Queued | JobStatus::Waiting | JobStatus::Requested | JobStatus::Pending, _) => {
                Self::Queued
            }
        }
    }

    pub const fn status(self) -> JobStatus {
        match self {
            Self::Queued => JobStatus::Queued,
            Self::InProgress => JobStatus::InProgress,
            Self::Completed(_) => JobStatus::Completed,
        }
    }

    pub const fn conclusion(self) -> Option<Conclusion> {
        match self {
            Self::Completed(c) => Some(c),
            Self::Queued | Self::InProgress => None,
        }
    }

    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn start(self) -> Result<Self, TransitionError> {
        match self {
            Self::Queued => Ok(Self::InProgress),
            Self::InProgress | Self::Completed(_) => Err(TransitionError::Illegal {
                from: self,
                to: JobStatus::InProgress,
            }),
        }
    }

    pub fn complete(
        self,
        conclusion: Conclusion,
        policy: CompletePolicy,
    ) -> Result<Self, TransitionError> {
        if !conclusion.is_settable() {
            return Err(TransitionError::ReservedConclusion(conclusion));
        }
        match (self, policy) {
            (Self::InProgress, _) | (Self::Queued, CompletePolicy::AllowFromQueued) => {
                Ok(Self::Completed(conclusion))
            }
            (Self::Queued, CompletePolicy::RequireStarted) | (Self::Completed(_), _) => {
                Err(TransitionError::Illegal {
                    from: self,
                    to: JobStatus::Completed,
                })
            }
        }
    }
}

impl fmt::Display for CheckRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed(c) => write!(f, "completed ({c})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator as _;

    use super::*;

    fn all_states() -> Vec<CheckRunState> {
        let mut states = vec![CheckRunState::Queued, CheckRunState::InProgress];
        states.extend(Conclusion::iter().map(CheckRunState::Completed));
        states
    }

    #[test]
    fn conclusion_iff_completed() {
        for s in all_states() {
            assert_eq!(s.conclusion().is_some(), s.status() == JobStatus::Completed, "{s}");
        }
    }

    #[test]
    fn happy_path() {
        let s = CheckRunState::Queued.start().unwrap();
        assert_eq!(s, CheckRunState::InProgress);
        let s = s
            .complete(Conclusion::Success, CompletePolicy::RequireStarted)
            .unwrap();
        assert_eq!(s, CheckRunState::Completed(Conclusion::Success));
    }

    #[test]
    fn completed_is_terminal() {
        for c in Conclusion::iter() {
            let s = CheckRunState::Completed(c);
            assert!(s.start().is_err());
            for next in Conclusion::iter() {
                assert!(s.complete(next, CompletePolicy::AllowFromQueued).is_err());
                assert!(s.complete(next, CompletePolicy::RequireStarted).is_err());
            }
        }
    }

    #[test]
    fn start_twice_is_rejected() {
        let err = CheckRunState::InProgress.start().unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: CheckRunState::InProgress,
                to: JobStatus::InProgress
            }
        );
        assert_eq!(
            err.to_string(),
            "check run cannot move from in_progress to in_progress"
        );
    }

    #[test]
    fn queued_to_completed_needs_explicit_shortcut() {
        assert!(
            CheckRunState::Queued
                .complete(Conclusion::Success, CompletePolicy::RequireStarted)
                .is_err()
        );
        assert_eq!(
            CheckRunState::Queued
                .complete(Conclusion::Skipped, CompletePolicy::AllowFromQueued)
                .unwrap(),
            CheckRunState::Completed(Conclusion::Skipped)
        );
    }

    #[test]
    fn stale_is_never_settable() {
        for s in [CheckRunState::Queued, CheckRunState::InProgress] {
            assert_eq!(
                s.complete(Conclusion::Stale, CompletePolicy::AllowFromQueued),
                Err(TransitionError::ReservedConclusion(Conclusion::Stale))
            );
        }
        assert_eq!(Conclusion::iter().filter(|c| c.is_settable()).count(), 7);
    }

    #[test]
    fn remote_state() {
        assert_eq!(
            CheckRunState::from_remote(JobStatus::Completed, Some(Conclusion::Failure)),
            CheckRunState::Completed(Conclusion::Failure)
        );
        assert_eq!(
            CheckRunState::from_remote(JobStatus::InProgress, None),
            CheckRunState::InProgress
        );
        assert_eq!(
            CheckRunState::from_remote(JobStatus::Waiting, None),
            CheckRunState::Queued
        );
    }

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&Conclusion::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert_eq!(Conclusion::ActionRequired.to_string(), "action_required");
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"in_progress\"").unwrap(),
            JobStatus::InProgress
        );
    }
}
