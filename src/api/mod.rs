//! HTTP control surface.
//!
//! Thin adapter from HTTP to the store contract: job CRUD, task history
//! reads and "run now" enqueueing. Runs on every replica; reads and writes
//! go straight to the store, only scheduling is leader-gated.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::model::{Job, JobConf, JobContainer, JobId, JobSchedule};
use crate::store::{Store, StoreError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/{group}", get(list_group_jobs))
        .route("/api/v1/jobs/{group}/{project}", get(list_project_jobs))
        .route(
            "/api/v1/jobs/{group}/{project}/{id}",
            get(get_job).put(put_job).delete(delete_job),
        )
        .route("/api/v1/jobs/{group}/{project}/{id}/tasks", get(get_tasks))
        .route(
            "/api/v1/jobs/{group}/{project}/{id}/run",
            axum::routing::post(run_job),
        )
        .with_state(state)
}

/// Serve the API until the process exits.
pub async fn serve(addr: std::net::SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

// =============================================================================
// Error mapping
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

enum ApiError {
    NotFound,
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "job not found".to_string(),
            ),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "bad_request", message)
            }
            ApiError::Store(err) => {
                error!(error = %err, "Store error serving API request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    err.to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorBody {
                code: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rhythm",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.get_jobs().await?))
}

async fn list_group_jobs(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.get_group_jobs(&group).await?))
}

async fn list_project_jobs(
    State(state): State<AppState>,
    Path((group, project)): Path<(String, String)>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.get_project_jobs(&group, &project).await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path((group, project, id)): Path<(String, String, String)>,
) -> Result<Json<Job>, ApiError> {
    let job_id = JobId::new(&group, &project, &id);
    match state.store.get_job(&job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound),
    }
}

/// Body of a job upsert; identity comes from the path.
#[derive(Debug, Deserialize)]
pub struct PutJobRequest {
    #[serde(rename = "Schedule")]
    pub schedule: JobSchedule,
    #[serde(rename = "Env", default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(rename = "Secrets", default)]
    pub secrets: std::collections::BTreeMap<String, String>,
    #[serde(rename = "Container")]
    pub container: JobContainer,
    #[serde(rename = "CPUs")]
    pub cpus: f64,
    #[serde(rename = "Mem")]
    pub mem: f64,
    #[serde(rename = "Disk", default)]
    pub disk: f64,
    #[serde(rename = "Cmd", default)]
    pub cmd: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Shell", default = "shell_default")]
    pub shell: bool,
    #[serde(rename = "Arguments", default)]
    pub arguments: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(rename = "MaxRetries", default)]
    pub max_retries: u32,
}

fn shell_default() -> bool {
    true
}

fn validate(conf: &JobConf) -> Result<(), ApiError> {
    if !conf.job_id().is_valid() {
        return Err(ApiError::BadRequest(
            "group, project and id must match [A-Za-z0-9_-]+".to_string(),
        ));
    }
    if conf.schedule.parse().is_err() {
        return Err(ApiError::BadRequest(format!(
            "invalid cron expression: {}",
            conf.schedule.cron
        )));
    }
    if conf.cpus <= 0.0 || conf.mem <= 0.0 || conf.disk < 0.0 {
        return Err(ApiError::BadRequest(
            "cpus and mem must be positive, disk non-negative".to_string(),
        ));
    }
    match conf.container.kind {
        crate::model::ContainerKind::Docker if conf.container.docker.is_none() => Err(
            ApiError::BadRequest("Docker container settings missing".to_string()),
        ),
        crate::model::ContainerKind::Mesos if conf.container.mesos.is_none() => Err(
            ApiError::BadRequest("Mesos container settings missing".to_string()),
        ),
        _ => Ok(()),
    }
}

async fn put_job(
    State(state): State<AppState>,
    Path((group, project, id)): Path<(String, String, String)>,
    Json(body): Json<PutJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let conf = JobConf {
        group,
        project,
        id,
        schedule: body.schedule,
        env: body.env,
        secrets: body.secrets,
        container: body.container,
        cpus: body.cpus,
        mem: body.mem,
        disk: body.disk,
        cmd: body.cmd,
        user: body.user,
        shell: body.shell,
        arguments: body.arguments,
        labels: body.labels,
        max_retries: body.max_retries,
    };
    validate(&conf)?;
    let existed = state.store.get_job(&conf.job_id()).await?.is_some();
    state.store.save_job_conf(&conf).await?;
    let job = state
        .store
        .get_job(&conf.job_id())
        .await?
        .ok_or(ApiError::NotFound)?;
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(job)))
}

async fn delete_job(
    State(state): State<AppState>,
    Path((group, project, id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete_job(&JobId::new(&group, &project, &id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_tasks(
    State(state): State<AppState>,
    Path((group, project, id)): Path<(String, String, String)>,
) -> Result<Json<Vec<crate::model::Task>>, ApiError> {
    let job_id = JobId::new(&group, &project, &id);
    if state.store.get_job(&job_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(state.store.get_tasks(&job_id).await?))
}

async fn run_job(
    State(state): State<AppState>,
    Path((group, project, id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let job_id = JobId::new(&group, &project, &id);
    if state.store.get_job(&job_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    state.store.queue_job(&job_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerKind;

    fn valid_conf() -> JobConf {
        JobConf {
            group: "g".to_string(),
            project: "p".to_string(),
            id: "a".to_string(),
            schedule: JobSchedule::cron("*/5 * * * *"),
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

    #[test]
    fn test_validate_accepts_valid_conf() {
        assert!(validate(&valid_conf()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_tokens() {
        let mut conf = valid_conf();
        conf.group = "has space".to_string();
        assert!(validate(&conf).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_cron() {
        let mut conf = valid_conf();
        conf.schedule = JobSchedule::cron("every day at noon");
        assert!(validate(&conf).is_err());
    }

    #[test]
    fn test_validate_rejects_nonpositive_resources() {
        let mut conf = valid_conf();
        conf.cpus = 0.0;
        assert!(validate(&conf).is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_container() {
        let mut conf = valid_conf();
        conf.container = JobContainer {
            kind: ContainerKind::Mesos,
            docker: None,
            mesos: None,
        };
        assert!(validate(&conf).is_err());
    }

    #[test]
    fn test_put_body_defaults() {
        let body: PutJobRequest = serde_json::from_str(
            r#"{
                "Schedule": {"Type": "Cron", "Cron": "0 4 * * *"},
                "Container": {"Type": "Docker", "Docker": {"Image": "busybox"}},
                "CPUs": 0.5,
                "Mem": 64,
                "Cmd": "echo hi"
            }"#,
        )
        .unwrap();
        assert!(body.shell);
        assert_eq!(body.disk, 0.0);
        assert_eq!(body.max_retries, 0);
        assert!(body.arguments.is_empty());
    }
}
