//! Job scheduler engine.
//!
//! Decides which jobs to run in response to received offers:
//!
//! - keeps an in-memory cache of all jobs, resynced from the store every
//!   30 s (configuration only for known jobs; in-memory runtime is
//!   authoritative during a session),
//! - matches runnable and queued jobs against offer resources, honoring
//!   the configured role's static reservations,
//! - synthesizes launch descriptors, resolving secrets at launch time,
//! - applies task status updates to job runtime and task history.
//!
//! A booked-jobs TTL set guards against matching a job onto two offers
//! while its STAGING write is still in flight.

mod ttl_set;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::mesos::proto::{self, Offer, TaskState, TaskStatus};
use crate::mesos::resources::Resources;
use crate::model::{ContainerKind, Job, JobId, State, Task, TaskId};
use crate::secrets::{Secrets, SecretsError};
use crate::store::Store;

use ttl_set::TtlSet;

const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const SYNC_RETRY: Duration = Duration::from_secs(1);
const BOOKED_TTL: Duration = Duration::from_secs(60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Source recorded on task rows written by the scheduler itself.
const SOURCE_SCHEDULER: &str = "Scheduler";

/// Errors while synthesizing a launch descriptor.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("reading secret failed: {0}")]
    Secret(#[from] SecretsError),

    #[error("container settings missing for {0:?} variant")]
    ContainerSettings(ContainerKind),
}

/// The scheduler engine. One instance lives per leadership session.
pub struct Scheduler {
    role: String,
    store: Arc<dyn Store>,
    secrets: Arc<dyn Secrets>,
    /// Framework id assigned by the resource manager, maintained by the
    /// session controller.
    framework_id: Arc<RwLock<Option<String>>>,
    /// Leading master URL, maintained by the session controller.
    leader_url: Arc<RwLock<String>>,
    /// In-memory cache of all jobs, keyed by fqid.
    jobs: Mutex<HashMap<String, Job>>,
    /// Jobs flagged for immediate run, keyed by fqid.
    queued: Mutex<HashSet<String>>,
    /// Jobs selected for an offer whose STAGING write has not completed.
    booked: TtlSet,
}

impl Scheduler {
    /// Build the engine, load the caches and start the resync and janitor
    /// loops. All loops stop when `scope` is cancelled.
    pub async fn start(
        role: String,
        store: Arc<dyn Store>,
        secrets: Arc<dyn Secrets>,
        framework_id: Arc<RwLock<Option<String>>>,
        leader_url: Arc<RwLock<String>>,
        scope: CancellationToken,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            role,
            store,
            secrets,
            framework_id,
            leader_url,
            jobs: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashSet::new()),
            booked: TtlSet::new(BOOKED_TTL),
        });
        scheduler.sync_until_ok(&scope).await;

        let this = Arc::clone(&scheduler);
        let sync_scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sync_scope.cancelled() => return,
                    _ = tokio::time::sleep(SYNC_INTERVAL) => this.sync_until_ok(&sync_scope).await,
                }
            }
        });

        let this = Arc::clone(&scheduler);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(JANITOR_INTERVAL) => this.booked.sweep(),
                }
            }
        });

        scheduler
    }

    /// Refresh both caches, retrying transient store errors until success
    /// or cancellation.
    async fn sync_until_ok(&self, scope: &CancellationToken) {
        loop {
            match self.resync().await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "Jobs cache sync failed"),
            }
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(SYNC_RETRY) => {}
            }
        }
    }

    /// One cache refresh from the store.
    ///
    /// New jobs are inserted whole. For known jobs only the configuration
    /// half is overwritten: the running instance has the most up-to-date
    /// runtime since store writes can trail. Jobs gone from the store are
    /// evicted.
    pub async fn resync(&self) -> Result<(), crate::store::StoreError> {
        debug!("Jobs cache syncing");
        let fresh = self.store.get_jobs().await?;
        let queued_ids = self.store.get_queued_job_ids().await?;
        {
            let mut jobs = self.jobs.lock().unwrap();
            let mut seen = HashSet::with_capacity(fresh.len());
            for job in fresh {
                let fqid = job.fqid();
                seen.insert(fqid.clone());
                match jobs.get_mut(&fqid) {
                    Some(cached) => cached.conf = job.conf,
                    None => {
                        jobs.insert(fqid, job);
                    }
                }
            }
            jobs.retain(|fqid, _| seen.contains(fqid));
        }
        {
            let mut queued = self.queued.lock().unwrap();
            *queued = queued_ids.iter().map(|id| id.fqid()).collect();
        }
        debug!("Jobs cache synced");
        Ok(())
    }

    fn get_cached(&self, fqid: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(fqid).cloned()
    }

    fn set_cached(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.fqid(), job);
    }

    /// Match jobs against one offer and return the launch descriptors.
    /// The caller issues the Accept; an empty result declines the offer.
    pub async fn find_tasks_for_offer(&self, offer: &Offer) -> Vec<proto::TaskInfo> {
        let resources = offer.resources().unallocate();
        debug!(offer = %offer.id.value, resources = %resources, "Finding tasks for offer");
        let (selected, allotments) = self.find_jobs_for_resources(resources);
        debug!(offer = %offer.id.value, jobs = selected.len(), "Found jobs for offer");
        if selected.is_empty() {
            return Vec::new();
        }
        self.build_tasks_for_offer(selected, allotments, offer).await
    }

    /// Select jobs that fit the given resources. Returns the selected jobs
    /// and, for each, the concrete resource shares to launch with.
    fn find_jobs_for_resources(&self, mut remaining: Resources) -> (Vec<Job>, Vec<Resources>) {
        let now = Utc::now();
        let mut selected = Vec::new();
        let mut allotments = Vec::new();
        let mut unreserved = remaining.to_unreserved();
        let mut jobs = self.jobs.lock().unwrap();
        let queued = self.queued.lock().unwrap();
        for job in jobs.values_mut() {
            let fqid = job.fqid();
            if self.booked.contains(&fqid) {
                continue;
            }
            if !job.is_runnable_at(now) && !queued.contains(&fqid) {
                continue;
            }
            let request = Resources::request(job.conf.cpus, job.conf.mem, job.conf.disk);
            if !unreserved.contains_all(&request) {
                continue;
            }
            if job.is_retryable() {
                job.runtime.retries += 1;
            } else {
                job.runtime.retries = 0;
            }
            let target = if self.role == "*" {
                request
            } else {
                request.push_reservation(&self.role)
            };
            let Some(allotment) = target.find(&remaining) else {
                // The containment check promised a fit; failing to carve
                // shares here is a bug, not an operational condition.
                error!(job = %fqid, remaining = %remaining, "Resources not found");
                std::process::exit(1);
            };
            remaining.subtract(&allotment);
            unreserved = remaining.to_unreserved();
            self.booked.insert(&fqid);
            debug!(job = %fqid, allotment = %allotment, "Found resources for job");
            selected.push(job.clone());
            allotments.push(allotment);
        }
        (selected, allotments)
    }

    /// Finalize the launch of the selected jobs: synthesize task infos,
    /// flip runtime to STAGING and persist it. Jobs are finalized
    /// concurrently; each one is fingerprint-locked via the booked set.
    async fn build_tasks_for_offer(
        &self,
        jobs: Vec<Job>,
        allotments: Vec<Resources>,
        offer: &Offer,
    ) -> Vec<proto::TaskInfo> {
        let launches = jobs.into_iter().zip(allotments).map(|(mut job, allotment)| {
            async move {
                job.runtime.last_start = Utc::now();
                let launch = match self.new_task_info(&job).await {
                    Ok(mut task) => {
                        job.runtime.state = State::Staging;
                        job.runtime.current_task_id = task.task_id.value.clone();
                        job.runtime.current_agent_id = offer.agent_id.value.clone();
                        task.agent_id = offer.agent_id.clone();
                        task.resources = allotment.0;
                        Some(task)
                    }
                    Err(e) => {
                        error!(job = %job.fqid(), error = %e, "Creating launch task failed");
                        job.runtime.state = State::Failed;
                        let now = Utc::now();
                        let row = Task {
                            start: now,
                            end: now,
                            task_id: String::new(),
                            executor_id: String::new(),
                            agent_id: String::new(),
                            framework_id: String::new(),
                            executor_url: String::new(),
                            message: e.to_string(),
                            reason: "Creating launch task failed".to_string(),
                            source: SOURCE_SCHEDULER.to_string(),
                        };
                        if let Err(e) = self.store.add_task(&job.job_id(), &row).await {
                            error!(job = %job.fqid(), error = %e, "Saving task failed");
                        }
                        None
                    }
                };
                if let Err(e) = self
                    .store
                    .save_job_runtime(&job.job_id(), &job.runtime)
                    .await
                {
                    error!(job = %job.fqid(), error = %e, "Updating job runtime failed");
                }
                self.set_cached(job.clone());
                self.dequeue(&job).await;
                self.booked.remove(&job.fqid());
                launch
            }
        });
        futures_util::future::join_all(launches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Drop the job from the queued set, durably and in memory.
    async fn dequeue(&self, job: &Job) {
        let fqid = job.fqid();
        let is_queued = self.queued.lock().unwrap().contains(&fqid);
        if !is_queued {
            return;
        }
        if let Err(e) = self.store.dequeue_job(&job.job_id()).await {
            error!(job = %fqid, error = %e, "Dequeuing job failed");
        }
        self.queued.lock().unwrap().remove(&fqid);
    }

    /// Synthesize the launch descriptor for a job.
    async fn new_task_info(&self, job: &Job) -> Result<proto::TaskInfo, LaunchError> {
        let task_id = TaskId::generate(&job.job_id()).to_string();
        let mut variables = vec![
            env_var("RHYTHM_TASK_ID", &task_id),
            env_var("RHYTHM_MEM", &job.conf.mem.to_string()),
            env_var("RHYTHM_DISK", &job.conf.disk.to_string()),
            env_var("RHYTHM_CPU", &job.conf.cpus.to_string()),
        ];
        for (name, value) in &job.conf.env {
            variables.push(env_var(name, value));
        }
        for (name, logical) in &job.conf.secrets {
            let path = format!("{}/{}/{}", job.conf.group, job.conf.project, logical);
            let value = self.secrets.read(&path).await?;
            variables.push(env_var(name, &value));
        }

        let container = match job.conf.container.kind {
            ContainerKind::Docker => {
                let docker = job
                    .conf
                    .container
                    .docker
                    .as_ref()
                    .ok_or(LaunchError::ContainerSettings(ContainerKind::Docker))?;
                proto::ContainerInfo::docker(&docker.image, docker.force_pull_image)
            }
            ContainerKind::Mesos => {
                let mesos = job
                    .conf
                    .container
                    .mesos
                    .as_ref()
                    .ok_or(LaunchError::ContainerSettings(ContainerKind::Mesos))?;
                proto::ContainerInfo::mesos(&mesos.image)
            }
        };

        let labels = if job.conf.labels.is_empty() {
            None
        } else {
            Some(proto::Labels {
                labels: job
                    .conf
                    .labels
                    .iter()
                    .map(|(k, v)| proto::Label {
                        key: k.clone(),
                        value: Some(v.clone()),
                    })
                    .collect(),
            })
        };

        Ok(proto::TaskInfo {
            name: format!("Task {task_id}"),
            task_id: proto::Id::new(task_id),
            // Filled in by the caller from the offer.
            agent_id: proto::Id::new(""),
            resources: Vec::new(),
            command: proto::CommandInfo {
                value: Some(job.conf.cmd.clone()),
                shell: job.conf.shell,
                arguments: job.conf.arguments.clone(),
                user: if job.conf.user.is_empty() {
                    None
                } else {
                    Some(job.conf.user.clone())
                },
                environment: proto::Environment { variables },
            },
            container: Some(container),
            labels,
        })
    }

    /// Apply one task status update to job runtime and history.
    pub async fn handle_task_update(&self, status: &TaskStatus) {
        let task_id: TaskId = match status.task_id.value.parse() {
            Ok(id) => id,
            Err(e) => {
                error!(task_id = %status.task_id.value, error = %e, "Cannot derive job id from task id");
                return;
            }
        };
        let job_id = task_id.job_id;
        debug!(task_id = %status.task_id.value, state = ?status.state, "Task state update");
        let Some(mut job) = self.get_cached(&job_id.fqid()) else {
            warn!(job = %job_id, "Update for unknown job");
            return;
        };
        match status.state {
            TaskState::Staging => job.runtime.state = State::Staging,
            TaskState::Starting => job.runtime.state = State::Starting,
            TaskState::Running => job.runtime.state = State::Running,
            TaskState::Finished => {
                debug!(task_id = %status.task_id.value, "Task finished successfully");
                self.add_task_history(status, &job, &job_id).await;
                job.runtime.state = State::Idle;
                job.runtime.current_task_id.clear();
                job.runtime.current_agent_id.clear();
            }
            TaskState::Lost
                if status.is_reconciliation()
                    && matches!(job.runtime.state, State::Idle | State::Failed) =>
            {
                // A reconciliation answer can arrive after the terminal
                // update it describes was already applied; marking the job
                // failed now would clobber the real outcome.
                debug!(task_id = %status.task_id.value, "Ignoring stale reconciliation update");
                return;
            }
            TaskState::Lost | TaskState::Failed | TaskState::Killed | TaskState::Error => {
                error!(
                    job = %job_id,
                    state = ?status.state,
                    message = status.message.as_deref().unwrap_or(""),
                    reason = status.reason.as_deref().unwrap_or(""),
                    source = status.source.as_deref().unwrap_or(""),
                    "Task failed"
                );
                self.add_task_history(status, &job, &job_id).await;
                job.runtime.state = State::Failed;
                job.runtime.current_task_id.clear();
                job.runtime.current_agent_id.clear();
            }
            TaskState::Unknown => {
                error!(task_id = %status.task_id.value, "Unknown task state");
                return;
            }
        }
        self.set_cached(job.clone());
        if let Err(e) = self.store.save_job_runtime(&job_id, &job.runtime).await {
            error!(job = %job_id, error = %e, "Saving job runtime while handling update failed");
        }
    }

    /// Record one finished or failed run in task history.
    async fn add_task_history(&self, status: &TaskStatus, job: &Job, job_id: &JobId) {
        let executor_id = status
            .executor_id
            .as_ref()
            .map(|id| id.value.clone())
            .unwrap_or_default();
        let agent_id = status
            .agent_id
            .as_ref()
            .map(|id| id.value.clone())
            .unwrap_or_default();
        let framework_id = self.framework_id.read().unwrap().clone().unwrap_or_default();
        let leader_url = self.leader_url.read().unwrap().clone();
        let mut row = Task {
            start: job.runtime.last_start,
            end: Utc::now(),
            task_id: status.task_id.value.clone(),
            executor_url: format!(
                "{leader_url}/#/agents/{agent_id}/frameworks/{framework_id}/executors/{executor_id}"
            ),
            executor_id,
            agent_id,
            framework_id,
            message: String::new(),
            reason: String::new(),
            source: String::new(),
        };
        if status.state != TaskState::Finished {
            row.message = status.message.clone().unwrap_or_default();
            row.reason = status.reason.clone().unwrap_or_default();
            row.source = status.source.clone().unwrap_or_default();
        }
        if let Err(e) = self.store.add_task(job_id, &row).await {
            error!(job = %job_id, error = %e, "Saving task failed");
        }
    }

    /// Number of cached jobs, for the session log line.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

fn env_var(name: &str, value: &str) -> proto::EnvironmentVariable {
    proto::EnvironmentVariable {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobConf, JobContainer, JobSchedule};
    use crate::secrets::NoneSecrets;
    use crate::store::MemoryStore;

    fn conf(id: &str, cpus: f64, mem: f64) -> JobConf {
        JobConf {
            group: "g".to_string(),
            project: "p".to_string(),
            id: id.to_string(),
            schedule: JobSchedule::cron("* * * * *"),
            env: Default::default(),
            secrets: Default::default(),
            container: JobContainer::docker("busybox", false),
            cpus,
            mem,
            disk: 0.0,
            cmd: "true".to_string(),
            user: String::new(),
            shell: true,
            arguments: vec![],
            labels: Default::default(),
            max_retries: 0,
        }
    }

    async fn test_scheduler(store: Arc<dyn Store>, role: &str) -> (Arc<Scheduler>, CancellationToken) {
        let scope = CancellationToken::new();
        let scheduler = Scheduler::start(
            role.to_string(),
            store,
            Arc::new(NoneSecrets),
            Arc::new(RwLock::new(Some("fw-1".to_string()))),
            Arc::new(RwLock::new("http://master:5050".to_string())),
            scope.clone(),
        )
        .await;
        (scheduler, scope)
    }

    #[tokio::test]
    async fn test_task_info_carries_env_and_secrets() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (scheduler, _scope) = test_scheduler(store, "*").await;

        let mut c = conf("a", 1.0, 256.0);
        c.env.insert("FOO".to_string(), "bar".to_string());
        c.secrets
            .insert("DB_PASSWORD".to_string(), "db".to_string());
        let job = Job::new(c);

        let task = scheduler.new_task_info(&job).await.unwrap();
        assert!(task.task_id.value.starts_with("g:p:a:"));
        let names: Vec<&str> = task
            .command
            .environment
            .variables
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert!(names.contains(&"RHYTHM_TASK_ID"));
        assert!(names.contains(&"RHYTHM_CPU"));
        assert!(names.contains(&"FOO"));
        let secret = task
            .command
            .environment
            .variables
            .iter()
            .find(|v| v.name == "DB_PASSWORD")
            .unwrap();
        // The none backend echoes the resolved path.
        assert_eq!(secret.value, "g/p/db");
    }

    #[tokio::test]
    async fn test_task_info_mesos_containerizer() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (scheduler, _scope) = test_scheduler(store, "*").await;
        let mut c = conf("a", 1.0, 256.0);
        c.container = JobContainer::mesos("img");
        let task = scheduler.new_task_info(&Job::new(c)).await.unwrap();
        let container = task.container.unwrap();
        assert_eq!(container.kind, "MESOS");
        assert_eq!(container.mesos.unwrap().image.docker.name, "img");
    }
}
