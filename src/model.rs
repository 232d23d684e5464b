//! Core data model: jobs, schedules, runtime state and task history.
//!
//! A job is split into two halves that are stored separately:
//! - `JobConf`: user-owned declarative configuration.
//! - `JobRuntime`: scheduler-owned runtime state.
//!
//! The split lets user edits land without clobbering scheduler-written
//! fields. `Job` is the in-memory merge of both halves.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing identifiers and schedules.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

/// The zero timestamp used for "never started".
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

// =============================================================================
// Identifiers
// =============================================================================

/// Job identifier: the (group, project, id) triple.
///
/// Each component is a token matching `[A-Za-z0-9_-]+`. The canonical
/// serialized form is `group:project:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub group: String,
    pub project: String,
    pub id: String,
}

impl JobId {
    pub fn new(group: &str, project: &str, id: &str) -> Self {
        Self {
            group: group.to_string(),
            project: project.to_string(),
            id: id.to_string(),
        }
    }

    /// Fully qualified identifier, unique across all groups and projects.
    pub fn fqid(&self) -> String {
        format!("{}:{}:{}", self.group, self.project, self.id)
    }

    /// Returns true if every component matches the token grammar.
    pub fn is_valid(&self) -> bool {
        [&self.group, &self.project, &self.id]
            .iter()
            .all(|part| is_token(part))
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqid())
    }
}

impl FromStr for JobId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chunks: Vec<&str> = s.split(':').collect();
        if chunks.len() != 3 {
            return Err(ModelError::InvalidJobId(s.to_string()));
        }
        Ok(Self::new(chunks[0], chunks[1], chunks[2]))
    }
}

/// Task identifier: `group:project:id:uuid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskId {
    pub job_id: JobId,
    pub uuid: String,
}

impl TaskId {
    /// Generate a fresh task id for a job.
    pub fn generate(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id.fqid(), self.uuid)
    }
}

impl FromStr for TaskId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chunks: Vec<&str> = s.split(':').collect();
        if chunks.len() != 4 {
            return Err(ModelError::InvalidTaskId(s.to_string()));
        }
        Ok(Self {
            job_id: JobId::new(chunks[0], chunks[1], chunks[2]),
            uuid: chunks[3].to_string(),
        })
    }
}

// =============================================================================
// Job configuration
// =============================================================================

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Not running; either never scheduled or the last run succeeded.
    Idle,
    /// Selected for an offer and launched, not yet picked up by an executor.
    Staging,
    /// Picked up by an executor.
    Starting,
    /// Running on an agent.
    Running,
    /// Last run failed.
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "Idle",
            State::Staging => "Staging",
            State::Starting => "Starting",
            State::Running => "Running",
            State::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Timetable genre. Only cron is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    Cron,
}

/// Job timetable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    #[serde(rename = "Type")]
    pub kind: ScheduleKind,
    /// Five-field cron expression (minute hour dom month dow).
    #[serde(rename = "Cron", default)]
    pub cron: String,
}

impl JobSchedule {
    pub fn cron(expr: &str) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            cron: expr.to_string(),
        }
    }

    /// Parse the five-field expression. The `cron` crate wants a seconds
    /// field, so a zero seconds field is prepended.
    pub fn parse(&self) -> Result<cron::Schedule, ModelError> {
        cron::Schedule::from_str(&format!("0 {}", self.cron))
            .map_err(|e| ModelError::InvalidCron(format!("{}: {e}", self.cron)))
    }

    /// Next fire time strictly after `t`, or None for an unparsable
    /// expression.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.parse().ok()?.after(&t).next()
    }
}

/// Containerizer genre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerKind {
    Docker,
    Mesos,
}

/// Docker containerizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerContainer {
    pub image: String,
    #[serde(default)]
    pub force_pull_image: bool,
}

/// Mesos containerizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MesosContainer {
    pub image: String,
}

/// Container settings. Exactly one arm matching `kind` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContainer {
    #[serde(rename = "Type")]
    pub kind: ContainerKind,
    #[serde(rename = "Docker", default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerContainer>,
    #[serde(rename = "Mesos", default, skip_serializing_if = "Option::is_none")]
    pub mesos: Option<MesosContainer>,
}

impl JobContainer {
    pub fn docker(image: &str, force_pull: bool) -> Self {
        Self {
            kind: ContainerKind::Docker,
            docker: Some(DockerContainer {
                image: image.to_string(),
                force_pull_image: force_pull,
            }),
            mesos: None,
        }
    }

    pub fn mesos(image: &str) -> Self {
        Self {
            kind: ContainerKind::Mesos,
            docker: None,
            mesos: Some(MesosContainer {
                image: image.to_string(),
            }),
        }
    }
}

fn default_shell() -> bool {
    true
}

/// User-owned declarative job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConf {
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Schedule")]
    pub schedule: JobSchedule,
    /// Literal environment variables.
    #[serde(rename = "Env", default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Environment variable name to logical secret path, resolved at launch.
    #[serde(rename = "Secrets", default)]
    pub secrets: std::collections::BTreeMap<String, String>,
    #[serde(rename = "Container")]
    pub container: JobContainer,
    #[serde(rename = "CPUs")]
    pub cpus: f64,
    /// Memory in MB.
    #[serde(rename = "Mem")]
    pub mem: f64,
    /// Disk in MB.
    #[serde(rename = "Disk")]
    pub disk: f64,
    #[serde(rename = "Cmd", default)]
    pub cmd: String,
    #[serde(rename = "User", default)]
    pub user: String,
    /// When false, `arguments` is the argv vector and `cmd` the executable.
    #[serde(rename = "Shell", default = "default_shell")]
    pub shell: bool,
    #[serde(rename = "Arguments", default)]
    pub arguments: Vec<String>,
    /// Opaque to the scheduler, copied onto launched tasks.
    #[serde(rename = "Labels", default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(rename = "MaxRetries", default)]
    pub max_retries: u32,
}

impl JobConf {
    pub fn job_id(&self) -> JobId {
        JobId::new(&self.group, &self.project, &self.id)
    }

    pub fn fqid(&self) -> String {
        self.job_id().fqid()
    }
}

// =============================================================================
// Job runtime
// =============================================================================

/// Scheduler-owned runtime state of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRuntime {
    #[serde(rename = "State")]
    pub state: State,
    /// Most recent launch attempt; the zero timestamp if never launched.
    #[serde(rename = "LastStart")]
    pub last_start: DateTime<Utc>,
    /// In-flight task id, empty when none.
    #[serde(rename = "CurrentTaskID", default)]
    pub current_task_id: String,
    /// Agent running the in-flight task, empty when none.
    #[serde(rename = "CurrentAgentID", default)]
    pub current_agent_id: String,
    /// Consecutive-failure counter.
    #[serde(rename = "Retries", default)]
    pub retries: u32,
}

impl Default for JobRuntime {
    fn default() -> Self {
        Self {
            state: State::Idle,
            last_start: zero_time(),
            current_task_id: String::new(),
            current_agent_id: String::new(),
            retries: 0,
        }
    }
}

/// In-memory merge of configuration and runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub conf: JobConf,
    #[serde(flatten)]
    pub runtime: JobRuntime,
}

impl Job {
    pub fn new(conf: JobConf) -> Self {
        Self {
            conf,
            runtime: JobRuntime::default(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.conf.job_id()
    }

    pub fn fqid(&self) -> String {
        self.conf.fqid()
    }

    /// True if the last run failed and retry budget remains.
    pub fn is_retryable(&self) -> bool {
        self.runtime.state == State::Failed && self.runtime.retries < self.conf.max_retries
    }

    /// When the job should next launch.
    ///
    /// Retryable jobs are due immediately (their last start). Otherwise the
    /// cron schedule is evaluated from the last start; a job that has never
    /// started evaluates from the zero timestamp and is therefore due at
    /// once. None means the expression does not parse.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        if self.is_retryable() {
            return Some(self.runtime.last_start);
        }
        self.conf.schedule.next_after(self.runtime.last_start)
    }

    /// True if the job should be launched now.
    pub fn is_runnable_at(&self, now: DateTime<Utc>) -> bool {
        if self.runtime.state != State::Idle && self.runtime.state != State::Failed {
            return false;
        }
        match self.next_run() {
            Some(next) => next <= now,
            None => false,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.is_runnable_at(Utc::now())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqid())
    }
}

// =============================================================================
// Task history
// =============================================================================

/// A single run (failed or successful) of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "End")]
    pub end: DateTime<Utc>,
    #[serde(rename = "TaskID", default)]
    pub task_id: String,
    #[serde(rename = "ExecutorID", default)]
    pub executor_id: String,
    #[serde(rename = "AgentID", default)]
    pub agent_id: String,
    #[serde(rename = "FrameworkID", default)]
    pub framework_id: String,
    #[serde(rename = "ExecutorURL", default)]
    pub executor_url: String,
    // Set for failed tasks only.
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Reason", default)]
    pub reason: String,
    #[serde(rename = "Source", default)]
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_conf(max_retries: u32) -> JobConf {
        JobConf {
            group: "g".to_string(),
            project: "p".to_string(),
            id: "a".to_string(),
            schedule: JobSchedule::cron("* * * * *"),
            env: Default::default(),
            secrets: Default::default(),
            container: JobContainer::docker("busybox", false),
            cpus: 1.0,
            mem: 256.0,
            disk: 0.0,
            cmd: "true".to_string(),
            user: String::new(),
            shell: true,
            arguments: vec![],
            labels: Default::default(),
            max_retries,
        }
    }

    #[test]
    fn test_job_id_roundtrip() {
        let jid = JobId::new("group", "project", "job-1");
        let parsed: JobId = jid.fqid().parse().unwrap();
        assert_eq!(parsed, jid);
    }

    #[test]
    fn test_job_id_rejects_wrong_arity() {
        assert!("a:b".parse::<JobId>().is_err());
        assert!("a:b:c:d".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_id_token_grammar() {
        assert!(JobId::new("g_1", "p-2", "A9").is_valid());
        assert!(!JobId::new("g 1", "p", "a").is_valid());
        assert!(!JobId::new("", "p", "a").is_valid());
        assert!(!JobId::new("g:x", "p", "a").is_valid());
    }

    #[test]
    fn test_task_id_roundtrip() {
        let jid = JobId::new("g", "p", "a");
        let tid = TaskId::generate(&jid);
        let parsed: TaskId = tid.to_string().parse().unwrap();
        assert_eq!(parsed.job_id, jid);
        assert_eq!(parsed.uuid, tid.uuid);
    }

    #[test]
    fn test_never_started_job_is_due_immediately() {
        let job = Job::new(test_conf(0));
        assert_eq!(job.runtime.last_start, zero_time());
        assert!(job.is_runnable());
    }

    #[test]
    fn test_cron_next_follows_last_start() {
        let mut job = Job::new(test_conf(0));
        job.conf.schedule = JobSchedule::cron("0 3 * * *");
        job.runtime.last_start = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let next = job.next_run().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_retryable_job_is_due_at_last_start() {
        let mut job = Job::new(test_conf(2));
        job.runtime.state = State::Failed;
        job.runtime.retries = 1;
        job.runtime.last_start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(job.is_retryable());
        assert_eq!(job.next_run().unwrap(), job.runtime.last_start);
        assert!(job.is_runnable());
    }

    #[test]
    fn test_exhausted_retries_follow_schedule() {
        let mut job = Job::new(test_conf(1));
        job.conf.schedule = JobSchedule::cron("0 0 1 1 *");
        job.runtime.state = State::Failed;
        job.runtime.retries = 1;
        job.runtime.last_start = Utc::now();
        assert!(!job.is_retryable());
        // Next new-year fire time is in the future, so not runnable.
        assert!(!job.is_runnable());
    }

    #[test]
    fn test_running_job_is_not_runnable() {
        let mut job = Job::new(test_conf(0));
        job.runtime.state = State::Running;
        assert!(!job.is_runnable());
    }

    #[test]
    fn test_invalid_cron_is_never_runnable() {
        let mut job = Job::new(test_conf(0));
        job.conf.schedule = JobSchedule::cron("not a cron");
        assert!(job.next_run().is_none());
        assert!(!job.is_runnable());
    }

    #[test]
    fn test_job_conf_json_field_names() {
        let conf = test_conf(3);
        let json = serde_json::to_value(&conf).unwrap();
        assert_eq!(json["Group"], "g");
        assert_eq!(json["ID"], "a");
        assert_eq!(json["CPUs"], 1.0);
        assert_eq!(json["MaxRetries"], 3);
        assert_eq!(json["Schedule"]["Type"], "Cron");
        assert_eq!(json["Container"]["Type"], "Docker");
        assert_eq!(json["Container"]["Docker"]["Image"], "busybox");
    }

    #[test]
    fn test_job_runtime_json_roundtrip() {
        let mut rt = JobRuntime::default();
        rt.state = State::Running;
        rt.current_task_id = "g:p:a:123".to_string();
        let json = serde_json::to_string(&rt).unwrap();
        assert!(json.contains("\"State\":\"Running\""));
        assert!(json.contains("\"CurrentTaskID\""));
        let back: JobRuntime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rt);
    }
}
