//! ZooKeeper store backend.
//!
//! Layout under the configured base path:
//!
//! ```text
//! /state                                  {"FrameworkID": "..."}
//! /jobs/<group>:<project>:<id>            JobConf JSON
//! /jobs/<group>:<project>:<id>/runtime    JobRuntime JSON
//! /jobs/<group>:<project>:<id>/tasks/<end-unix>@<task-id>
//! /queuedJobs/<group>:<project>:<id>      empty marker
//! ```
//!
//! Writes are unconditional create-or-update: the elected leader is the
//! only runtime writer, so version checks buy nothing. A lost session is
//! replaced with a fresh client and the failed operation retried once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use zookeeper_client as zk;

use crate::config::{ZkAuth, ZkConfig};
use crate::coordinator::Coordinator;
use crate::model::{Job, JobConf, JobId, JobRuntime, Task};

use super::{Store, StoreError, StoreResult};

const JOBS_DIR: &str = "jobs";
const QUEUED_DIR: &str = "queuedJobs";
const STATE_NODE: &str = "state";

const HISTORY_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct FrameworkState {
    #[serde(rename = "FrameworkID", default)]
    framework_id: String,
}

/// ZooKeeper-backed store.
pub struct ZkStore {
    config: ZkConfig,
    task_ttl: Duration,
    client: RwLock<zk::Client>,
}

impl ZkStore {
    /// Connect and make sure the base hierarchy exists.
    pub async fn connect(config: &ZkConfig, task_ttl: Duration) -> StoreResult<Self> {
        let client = connect_client(config).await?;
        let store = Self {
            config: config.clone(),
            task_ttl,
            client: RwLock::new(client),
        };
        store.init().await?;
        info!(dir = %store.config.dir, "Connected to ZooKeeper store");
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        self.ensure(&self.config.dir).await?;
        self.ensure(&self.path(JOBS_DIR)).await?;
        self.ensure(&self.path(QUEUED_DIR)).await?;
        let state = serde_json::to_vec(&FrameworkState::default())?;
        self.create_if_absent(&self.path(STATE_NODE), state).await?;
        Ok(())
    }

    fn path(&self, rel: &str) -> String {
        format!("{}/{}", self.config.dir, rel)
    }

    fn job_path(&self, fqid: &str) -> String {
        format!("{}/{}/{}", self.config.dir, JOBS_DIR, fqid)
    }

    fn tasks_path(&self, fqid: &str) -> String {
        format!("{}/tasks", self.job_path(fqid))
    }

    fn acls(&self) -> zk::Acls {
        match self.config.auth {
            ZkAuth::World => zk::Acls::anyone_all(),
            ZkAuth::Digest { .. } => zk::Acls::creator_all(),
        }
    }

    async fn client(&self) -> zk::Client {
        self.client.read().await.clone()
    }

    /// Replace a dead client with a freshly connected one.
    async fn reconnect(&self) -> StoreResult<()> {
        warn!("ZooKeeper session lost, reconnecting");
        let fresh = connect_client(&self.config).await?;
        *self.client.write().await = fresh;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Low-level node operations, each retried once across a reconnect.
    // -------------------------------------------------------------------------

    async fn get_node(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        for attempt in 0..2 {
            match self.client().await.get_data(path).await {
                Ok((data, _)) => return Ok(Some(data)),
                Err(zk::Error::NoNode) => return Ok(None),
                Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                Err(e) => return Err(StoreError::backend(e)),
            }
        }
        unreachable!("retry loop returns")
    }

    /// Create-or-update.
    async fn put_node(&self, path: &str, data: Vec<u8>) -> StoreResult<()> {
        for attempt in 0..2 {
            let client = self.client().await;
            match client
                .create(path, &data, &zk::CreateMode::Persistent.with_acls(self.acls()))
                .await
            {
                Ok(_) => return Ok(()),
                Err(zk::Error::NodeExists) => match client.set_data(path, &data, None).await {
                    Ok(_) => return Ok(()),
                    Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                    Err(e) => return Err(StoreError::backend(e)),
                },
                Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                Err(e) => return Err(StoreError::backend(e)),
            }
        }
        unreachable!("retry loop returns")
    }

    async fn create_if_absent(&self, path: &str, data: Vec<u8>) -> StoreResult<()> {
        for attempt in 0..2 {
            match self
                .client()
                .await
                .create(path, &data, &zk::CreateMode::Persistent.with_acls(self.acls()))
                .await
            {
                Ok(_) | Err(zk::Error::NodeExists) => return Ok(()),
                Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                Err(e) => return Err(StoreError::backend(e)),
            }
        }
        unreachable!("retry loop returns")
    }

    async fn ensure(&self, path: &str) -> StoreResult<()> {
        self.create_if_absent(path, Vec::new()).await
    }

    /// Delete a node; missing nodes are not an error.
    async fn delete_node(&self, path: &str) -> StoreResult<()> {
        for attempt in 0..2 {
            match self.client().await.delete(path, None).await {
                Ok(()) | Err(zk::Error::NoNode) => return Ok(()),
                Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                Err(e) => return Err(StoreError::backend(e)),
            }
        }
        unreachable!("retry loop returns")
    }

    /// Children of a node; a missing node has no children.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        for attempt in 0..2 {
            match self.client().await.list_children(path).await {
                Ok(children) => return Ok(children),
                Err(zk::Error::NoNode) => return Ok(Vec::new()),
                Err(e) if attempt == 0 && !is_logical(&e) => self.reconnect().await?,
                Err(e) => return Err(StoreError::backend(e)),
            }
        }
        unreachable!("retry loop returns")
    }

    async fn read_runtime(&self, fqid: &str) -> StoreResult<JobRuntime> {
        let path = format!("{}/runtime", self.job_path(fqid));
        match self.get_node(&path).await? {
            Some(data) => serde_json::from_slice(&data).map_err(|source| StoreError::Decode {
                path,
                source,
            }),
            None => Ok(JobRuntime::default()),
        }
    }

    async fn read_job(&self, fqid: &str) -> StoreResult<Option<Job>> {
        let path = self.job_path(fqid);
        let Some(data) = self.get_node(&path).await? else {
            return Ok(None);
        };
        let conf: JobConf =
            serde_json::from_slice(&data).map_err(|source| StoreError::Decode { path, source })?;
        let runtime = self.read_runtime(fqid).await?;
        Ok(Some(Job { conf, runtime }))
    }

    // -------------------------------------------------------------------------
    // Task history GC
    // -------------------------------------------------------------------------

    /// Leader-elected periodic deletion of old task records.
    ///
    /// The election runs on its own subdirectory so that history cleanup
    /// leadership is independent from scheduler leadership.
    pub fn spawn_history_gc(self: Arc<Self>, coordinator: Arc<Coordinator>) {
        tokio::spawn(async move {
            loop {
                info!("Waiting for task history cleanup leadership");
                let scope = match coordinator.wait_until_leader().await {
                    Ok(scope) => scope,
                    Err(e) => {
                        error!(error = %e, "Task cleanup election failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                info!("Elected as task history cleanup leader");
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        _ = tokio::time::sleep(HISTORY_GC_INTERVAL) => {
                            match self.cleanup_tasks().await {
                                Ok(deleted) => {
                                    debug!(deleted, "Old task cleanup finished");
                                }
                                Err(e) => error!(error = %e, "Old task cleanup failed"),
                            }
                        }
                    }
                }
            }
        });
    }

    /// Delete task records whose end time is older than the task TTL.
    /// Returns the number of deleted records.
    pub async fn cleanup_tasks(&self) -> StoreResult<u64> {
        let mut deleted = 0;
        let ttl = chrono::Duration::from_std(self.task_ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        for fqid in self.children(&self.path(JOBS_DIR)).await? {
            let tasks_path = self.tasks_path(&fqid);
            for key in self.children(&tasks_path).await? {
                let Some(end) = parse_task_key_end(&key) else {
                    warn!(key = %key, "Unparsable task history key");
                    continue;
                };
                if now - end > ttl {
                    match self.delete_node(&format!("{tasks_path}/{key}")).await {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!(key = %key, error = %e, "Failed removing old task"),
                    }
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Store for ZkStore {
    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.read_job(&id.fqid()).await
    }

    async fn get_jobs(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for fqid in self.children(&self.path(JOBS_DIR)).await? {
            match self.read_job(&fqid).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(StoreError::Decode { path, source }) => {
                    // A corrupt record must not hide the rest of the jobs.
                    error!(path = %path, error = %source, "Skipping corrupt job record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    async fn save_job_conf(&self, conf: &JobConf) -> StoreResult<()> {
        let data = serde_json::to_vec(conf)?;
        self.put_node(&self.job_path(&conf.fqid()), data).await
    }

    async fn save_job_runtime(&self, id: &JobId, runtime: &JobRuntime) -> StoreResult<()> {
        let data = serde_json::to_vec(runtime)?;
        let path = format!("{}/runtime", self.job_path(&id.fqid()));
        self.put_node(&path, data).await
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<()> {
        let fqid = id.fqid();
        let tasks_path = self.tasks_path(&fqid);
        for key in self.children(&tasks_path).await? {
            self.delete_node(&format!("{tasks_path}/{key}")).await?;
        }
        self.delete_node(&tasks_path).await?;
        self.delete_node(&format!("{}/runtime", self.job_path(&fqid)))
            .await?;
        self.delete_node(&self.job_path(&fqid)).await?;
        self.delete_node(&format!("{}/{}", self.path(QUEUED_DIR), fqid))
            .await?;
        Ok(())
    }

    async fn add_task(&self, id: &JobId, task: &Task) -> StoreResult<()> {
        let fqid = id.fqid();
        self.ensure(&self.tasks_path(&fqid)).await?;
        let key = format!("{}@{}", task.end.timestamp(), task.task_id);
        let data = serde_json::to_vec(task)?;
        self.put_node(&format!("{}/{}", self.tasks_path(&fqid), key), data)
            .await
    }

    async fn get_tasks(&self, id: &JobId) -> StoreResult<Vec<Task>> {
        let tasks_path = self.tasks_path(&id.fqid());
        let mut tasks = Vec::new();
        for key in self.children(&tasks_path).await? {
            let path = format!("{tasks_path}/{key}");
            let Some(data) = self.get_node(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<Task>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => error!(path = %path, error = %e, "Skipping corrupt task record"),
            }
        }
        tasks.sort_by_key(|t| t.end);
        Ok(tasks)
    }

    async fn queue_job(&self, id: &JobId) -> StoreResult<()> {
        let path = format!("{}/{}", self.path(QUEUED_DIR), id.fqid());
        self.create_if_absent(&path, Vec::new()).await
    }

    async fn dequeue_job(&self, id: &JobId) -> StoreResult<()> {
        let path = format!("{}/{}", self.path(QUEUED_DIR), id.fqid());
        self.delete_node(&path).await
    }

    async fn get_queued_job_ids(&self) -> StoreResult<Vec<JobId>> {
        let mut ids = Vec::new();
        for fqid in self.children(&self.path(QUEUED_DIR)).await? {
            match fqid.parse() {
                Ok(id) => ids.push(id),
                Err(e) => warn!(fqid = %fqid, error = %e, "Skipping malformed queued job id"),
            }
        }
        Ok(ids)
    }

    async fn set_framework_id(&self, id: &str) -> StoreResult<()> {
        let state = FrameworkState {
            framework_id: id.to_string(),
        };
        self.put_node(&self.path(STATE_NODE), serde_json::to_vec(&state)?)
            .await
    }

    async fn get_framework_id(&self) -> StoreResult<Option<String>> {
        let Some(data) = self.get_node(&self.path(STATE_NODE)).await? else {
            return Ok(None);
        };
        let state: FrameworkState =
            serde_json::from_slice(&data).map_err(|source| StoreError::Decode {
                path: self.path(STATE_NODE),
                source,
            })?;
        if state.framework_id.is_empty() {
            Ok(None)
        } else {
            Ok(Some(state.framework_id))
        }
    }
}

/// Connect a fresh client, applying digest auth when configured.
async fn connect_client(config: &ZkConfig) -> StoreResult<zk::Client> {
    let mut connector = zk::Client::connector();
    connector.session_timeout(config.timeout);
    if let ZkAuth::Digest { ref user, ref password } = config.auth {
        connector.auth("digest".to_string(), format!("{user}:{password}").into_bytes());
    }
    connector
        .connect(&config.cluster())
        .await
        .map_err(StoreError::backend)
}

/// Errors that indicate a caller mistake rather than a broken session.
fn is_logical(e: &zk::Error) -> bool {
    matches!(
        e,
        zk::Error::NoNode | zk::Error::NodeExists | zk::Error::NotEmpty | zk::Error::BadVersion
    )
}

/// Parse the `<end-unix>@<task-id>` history key.
fn parse_task_key_end(key: &str) -> Option<chrono::DateTime<Utc>> {
    let (prefix, _) = key.split_once('@')?;
    let secs: i64 = prefix.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_key_end() {
        let end = parse_task_key_end("1700000000@g:p:a:abcd").unwrap();
        assert_eq!(end.timestamp(), 1_700_000_000);
        assert!(parse_task_key_end("nope").is_none());
        assert!(parse_task_key_end("xyz@g:p:a:abcd").is_none());
    }

    #[test]
    fn test_framework_state_json() {
        let state = FrameworkState {
            framework_id: "fw-1".to_string(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"FrameworkID":"fw-1"}"#);
        let empty: FrameworkState = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.framework_id, "");
    }
}
