//! Scheduling, entity reconciliation, artifact parsing, and run orchestration.

use std::time::Duration;

use elev_core::{Classify, ErrorClass, SyncTarget};
use elev_source::SourceError;
use elev_storage::{RepositoryError, RetryDisposition};
use thiserror::Error;

pub mod artifact;
pub mod config;
pub mod entity_sync;
pub mod orchestrator;
pub mod scheduler;
pub mod worker;

pub use artifact::{ArtifactParser, ArtifactPipeline, CommitHook, NoopCommitHook, ParseError, ParseOutcome};
pub use config::{load_policy_file, parse_policy_file, seed_policies, SyncConfig};
pub use entity_sync::{ChildSync, EntitySyncService};
pub use orchestrator::{RunSummary, SyncJob, SyncOrchestrator};
pub use scheduler::{SyncScheduler, TickContext, TickPlan};
pub use worker::{JobReport, WorkerPool};

pub const CRATE_NAME: &str = "elev-sync";

/// Failure of one pooled job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("artifact store: {0:#}")]
    Storage(anyhow::Error),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled before the next attempt")]
    Cancelled,
    #[error("{0} does not write hierarchy rows")]
    NotAHierarchyTarget(SyncTarget),
    #[error("{target} cannot run in scope {scope_id:?}")]
    ScopeMismatch {
        target: SyncTarget,
        scope_id: Option<i64>,
    },
}

impl Classify for JobError {
    fn class(&self) -> ErrorClass {
        match self {
            JobError::Source(err) => err.class(),
            JobError::Repository(err) => err.class(),
            JobError::Parse(err) => err.class(),
            JobError::Storage(_) => ErrorClass::Persistence,
            JobError::TimedOut(_) => ErrorClass::Transient,
            JobError::Cancelled
            | JobError::NotAHierarchyTarget(_)
            | JobError::ScopeMismatch { .. } => ErrorClass::Validation,
        }
    }
}

impl JobError {
    /// Whether the pool may run the job again within the same pass. A failed
    /// parse has already spent one try of the artifact's retry ceiling; the
    /// next tick's re-parse wave picks it up instead.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            JobError::Parse(_) => RetryDisposition::NonRetryable,
            err => err.class().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failures_are_left_to_the_reparse_wave() {
        let aborted = JobError::Parse(ParseError::Aborted("lock lost".into()));
        assert_eq!(aborted.class(), ErrorClass::Persistence);
        assert_eq!(aborted.disposition(), RetryDisposition::NonRetryable);

        let timed_out = JobError::TimedOut(Duration::from_secs(1));
        assert_eq!(timed_out.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            JobError::NotAHierarchyTarget(SyncTarget::Artifact).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
