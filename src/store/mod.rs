//! Durable state access.
//!
//! All durable state lives in an external consensus store: job
//! configuration, job runtime, per-run task history, the queued-jobs set
//! and the framework id. The `Store` trait is the only surface the rest of
//! the scheduler sees; backends:
//!
//! - `zk`: ZooKeeper, the production backend.
//! - `memory`: in-process maps, for tests and single-node development.

pub mod memory;
pub mod zk;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Job, JobConf, JobId, JobRuntime, Task};

pub use memory::MemoryStore;
pub use zk::ZkStore;

/// Errors from durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding record failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable store contract.
///
/// Runtime writes use unconditional create-or-update semantics: the single
/// elected leader is the only runtime writer. Deletes are idempotent.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Merged conf and runtime, or None if no configuration exists.
    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Full enumeration; ordering is unspecified. Records that fail to
    /// decode are skipped.
    async fn get_jobs(&self) -> StoreResult<Vec<Job>>;

    async fn get_group_jobs(&self, group: &str) -> StoreResult<Vec<Job>> {
        let jobs = self.get_jobs().await?;
        Ok(jobs.into_iter().filter(|j| j.conf.group == group).collect())
    }

    async fn get_project_jobs(&self, group: &str, project: &str) -> StoreResult<Vec<Job>> {
        let jobs = self.get_jobs().await?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.conf.group == group && j.conf.project == project)
            .collect())
    }

    /// Upsert configuration; never touches runtime.
    async fn save_job_conf(&self, conf: &JobConf) -> StoreResult<()>;

    /// Upsert runtime; never touches configuration.
    async fn save_job_runtime(&self, id: &JobId, runtime: &JobRuntime) -> StoreResult<()>;

    /// Remove configuration, runtime and all task history. Succeeds if the
    /// job does not exist.
    async fn delete_job(&self, id: &JobId) -> StoreResult<()>;

    /// Append a task history record.
    async fn add_task(&self, id: &JobId, task: &Task) -> StoreResult<()>;

    /// All history for a job, ordered by end time.
    async fn get_tasks(&self, id: &JobId) -> StoreResult<Vec<Task>>;

    /// Flag a job for immediate run. Idempotent.
    async fn queue_job(&self, id: &JobId) -> StoreResult<()>;

    /// Remove the immediate-run flag. Succeeds if not queued.
    async fn dequeue_job(&self, id: &JobId) -> StoreResult<()>;

    async fn get_queued_job_ids(&self) -> StoreResult<Vec<JobId>>;

    async fn set_framework_id(&self, id: &str) -> StoreResult<()>;

    /// None when no framework id has been assigned yet (or it was cleared).
    async fn get_framework_id(&self) -> StoreResult<Option<String>>;
}
