//! In-memory store backend.
//!
//! Implements the same contract as the ZooKeeper backend against process
//! memory. Used by the test suite and for single-node development runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{Job, JobConf, JobId, JobRuntime, Task};

use super::{Store, StoreResult};

#[derive(Default)]
struct Inner {
    confs: BTreeMap<String, JobConf>,
    runtimes: BTreeMap<String, JobRuntime>,
    tasks: BTreeMap<String, Vec<Task>>,
    queued: BTreeSet<String>,
    framework_id: Option<String>,
}

/// Map-backed store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn merged(inner: &Inner, fqid: &str) -> Option<Job> {
        let conf = inner.confs.get(fqid)?.clone();
        let runtime = inner.runtimes.get(fqid).cloned().unwrap_or_default();
        Some(Job { conf, runtime })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::merged(&inner, &id.fqid()))
    }

    async fn get_jobs(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .confs
            .keys()
            .filter_map(|fqid| Self::merged(&inner, fqid))
            .collect())
    }

    async fn save_job_conf(&self, conf: &JobConf) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.confs.insert(conf.fqid(), conf.clone());
        Ok(())
    }

    async fn save_job_runtime(&self, id: &JobId, runtime: &JobRuntime) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.runtimes.insert(id.fqid(), runtime.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let fqid = id.fqid();
        inner.confs.remove(&fqid);
        inner.runtimes.remove(&fqid);
        inner.tasks.remove(&fqid);
        inner.queued.remove(&fqid);
        Ok(())
    }

    async fn add_task(&self, id: &JobId, task: &Task) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .entry(id.fqid())
            .or_default()
            .push(task.clone());
        Ok(())
    }

    async fn get_tasks(&self, id: &JobId) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks = inner.tasks.get(&id.fqid()).cloned().unwrap_or_default();
        tasks.sort_by_key(|t| t.end);
        Ok(tasks)
    }

    async fn queue_job(&self, id: &JobId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.queued.insert(id.fqid());
        Ok(())
    }

    async fn dequeue_job(&self, id: &JobId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.queued.remove(&id.fqid());
        Ok(())
    }

    async fn get_queued_job_ids(&self) -> StoreResult<Vec<JobId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .queued
            .iter()
            .filter_map(|fqid| fqid.parse().ok())
            .collect())
    }

    async fn set_framework_id(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.framework_id = if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        };
        Ok(())
    }

    async fn get_framework_id(&self) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.framework_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobContainer, JobSchedule, State};
    use chrono::{Duration, Utc};

    fn conf(id: &str) -> JobConf {
        JobConf {
            group: "g".to_string(),
            project: "p".to_string(),
            id: id.to_string(),
            schedule: JobSchedule::cron("* * * * *"),
            env: Default::default(),
            secrets: Default::default(),
            container: JobContainer::docker("busybox", false),
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            cmd: "true".to_string(),
            user: String::new(),
            shell: true,
            arguments: vec![],
            labels: Default::default(),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn test_conf_roundtrip() {
        let store = MemoryStore::new();
        let c = conf("a");
        store.save_job_conf(&c).await.unwrap();
        let job = store.get_job(&c.job_id()).await.unwrap().unwrap();
        assert_eq!(job.conf, c);
        assert_eq!(job.runtime.state, State::Idle);
    }

    #[tokio::test]
    async fn test_conf_save_does_not_touch_runtime() {
        let store = MemoryStore::new();
        let c = conf("a");
        let id = c.job_id();
        store.save_job_conf(&c).await.unwrap();

        let mut rt = JobRuntime::default();
        rt.state = State::Running;
        rt.current_task_id = "g:p:a:u".to_string();
        store.save_job_runtime(&id, &rt).await.unwrap();

        let mut edited = c.clone();
        edited.cpus = 4.0;
        store.save_job_conf(&edited).await.unwrap();

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.conf.cpus, 4.0);
        assert_eq!(job.runtime.state, State::Running);
        assert_eq!(job.runtime.current_task_id, "g:p:a:u");
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let store = MemoryStore::new();
        let c = conf("a");
        let id = c.job_id();
        store.save_job_conf(&c).await.unwrap();
        store
            .add_task(
                &id,
                &Task {
                    start: Utc::now(),
                    end: Utc::now(),
                    task_id: "g:p:a:u".to_string(),
                    executor_id: String::new(),
                    agent_id: String::new(),
                    framework_id: String::new(),
                    executor_url: String::new(),
                    message: String::new(),
                    reason: String::new(),
                    source: String::new(),
                },
            )
            .await
            .unwrap();
        store.queue_job(&id).await.unwrap();

        store.delete_job(&id).await.unwrap();
        assert!(store.get_job(&id).await.unwrap().is_none());
        assert!(store.get_tasks(&id).await.unwrap().is_empty());
        assert!(store.get_queued_job_ids().await.unwrap().is_empty());

        // Deleting again succeeds.
        store.delete_job(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_is_a_set() {
        let store = MemoryStore::new();
        let id = JobId::new("g", "p", "a");
        store.queue_job(&id).await.unwrap();
        store.queue_job(&id).await.unwrap();
        assert_eq!(store.get_queued_job_ids().await.unwrap(), vec![id.clone()]);
        store.dequeue_job(&id).await.unwrap();
        store.dequeue_job(&id).await.unwrap();
        assert!(store.get_queued_job_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_ordered_by_end() {
        let store = MemoryStore::new();
        let id = JobId::new("g", "p", "a");
        let now = Utc::now();
        for offset in [3i64, 1, 2] {
            store
                .add_task(
                    &id,
                    &Task {
                        start: now,
                        end: now + Duration::seconds(offset),
                        task_id: format!("g:p:a:{offset}"),
                        executor_id: String::new(),
                        agent_id: String::new(),
                        framework_id: String::new(),
                        executor_url: String::new(),
                        message: String::new(),
                        reason: String::new(),
                        source: String::new(),
                    },
                )
                .await
                .unwrap();
        }
        let tasks = store.get_tasks(&id).await.unwrap();
        let ends: Vec<_> = tasks.iter().map(|t| t.end).collect();
        let mut sorted = ends.clone();
        sorted.sort();
        assert_eq!(ends, sorted);
    }

    #[tokio::test]
    async fn test_framework_id_clear() {
        let store = MemoryStore::new();
        assert!(store.get_framework_id().await.unwrap().is_none());
        store.set_framework_id("fw-1").await.unwrap();
        assert_eq!(
            store.get_framework_id().await.unwrap().as_deref(),
            Some("fw-1")
        );
        store.set_framework_id("").await.unwrap();
        assert!(store.get_framework_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_and_project_filters() {
        let store = MemoryStore::new();
        let mut other = conf("x");
        other.group = "g2".to_string();
        store.save_job_conf(&conf("a")).await.unwrap();
        store.save_job_conf(&conf("b")).await.unwrap();
        store.save_job_conf(&other).await.unwrap();

        assert_eq!(store.get_jobs().await.unwrap().len(), 3);
        assert_eq!(store.get_group_jobs("g").await.unwrap().len(), 2);
        assert_eq!(store.get_project_jobs("g2", "p").await.unwrap().len(), 1);
        assert!(store.get_project_jobs("g3", "p").await.unwrap().is_empty());
    }
}
