//! Mesos v1 scheduler API wire types.
//!
//! JSON shapes of the calls the scheduler sends and the events it receives
//! over the v1 HTTP API. Only the subset this framework uses is modeled;
//! unknown event types and task states decode to `Unknown` and are logged
//! by the dispatcher instead of failing the stream.

use serde::{Deserialize, Serialize};

use super::resources::{Resource, Resources};

/// Wrapper for the `{"value": "..."}` identifier shape used by framework,
/// offer, agent, executor and task ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Id {
    pub value: String,
}

impl Id {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Framework label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Framework registration info carried in SUBSCRIBE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub checkpoint: bool,
    pub failover_timeout: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webui_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub labels: Labels,
}

/// Leading master description from SUBSCRIBED.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub address: Option<MasterAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterAddress {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
}

impl MasterInfo {
    /// `host:port` of the leading master, preferring the address block's
    /// hostname, then its IP, then the legacy top-level hostname.
    pub fn leader_host(&self) -> Option<String> {
        let (host, port) = match &self.address {
            Some(addr) => (
                addr.hostname.clone().filter(|h| !h.is_empty()).or_else(|| {
                    addr.ip.clone().filter(|ip| !ip.is_empty())
                }),
                addr.port.or(self.port),
            ),
            None => (
                self.hostname.clone().filter(|h| !h.is_empty()),
                self.port,
            ),
        };
        let host = host?;
        Some(match port {
            Some(port) if port != 0 => format!("{host}:{port}"),
            _ => host,
        })
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Subscribed,
    Offers,
    Rescind,
    Update,
    Message,
    Failure,
    Error,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// One event from the subscription stream. The payload field named after
/// the type tag is set; the rest are None.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub subscribed: Option<Subscribed>,
    #[serde(default)]
    pub offers: Option<OffersEvent>,
    #[serde(default)]
    pub update: Option<UpdateEvent>,
    #[serde(default)]
    pub error: Option<ErrorEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscribed {
    pub framework_id: Id,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<f64>,
    #[serde(default)]
    pub master_info: Option<MasterInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OffersEvent {
    #[serde(default)]
    pub offers: Vec<Offer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEvent {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub message: String,
}

/// A resource offer for one agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Offer {
    pub id: Id,
    pub agent_id: Id,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    pub fn resources(&self) -> Resources {
        Resources::new(self.resources.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_ERROR")]
    Error,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(other)]
    Unknown,
}

pub const REASON_RECONCILIATION: &str = "REASON_RECONCILIATION";

/// Task status carried by UPDATE events.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub task_id: Id,
    pub state: TaskState,
    #[serde(default)]
    pub agent_id: Option<Id>,
    #[serde(default)]
    pub executor_id: Option<Id>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Present when the master expects an acknowledgement.
    #[serde(default)]
    pub uuid: Option<String>,
}

impl TaskStatus {
    pub fn is_reconciliation(&self) -> bool {
        self.reason.as_deref() == Some(REASON_RECONCILIATION)
    }
}

// =============================================================================
// Calls
// =============================================================================

/// Task launch descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: Id,
    pub agent_id: Id,
    pub resources: Vec<Resource>,
    pub command: CommandInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Environment {
    pub variables: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub shell: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesos: Option<MesosInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DockerInfo {
    pub image: String,
    pub force_pull_image: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MesosInfo {
    pub image: ImageInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub docker: ImageDocker,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageDocker {
    pub name: String,
}

impl ContainerInfo {
    pub fn docker(image: &str, force_pull: bool) -> Self {
        Self {
            kind: "DOCKER".to_string(),
            docker: Some(DockerInfo {
                image: image.to_string(),
                force_pull_image: force_pull,
            }),
            mesos: None,
        }
    }

    /// Mesos containerizer running a Docker image.
    pub fn mesos(image: &str) -> Self {
        Self {
            kind: "MESOS".to_string(),
            docker: None,
            mesos: Some(MesosInfo {
                image: ImageInfo {
                    kind: "DOCKER".to_string(),
                    docker: ImageDocker {
                        name: image.to_string(),
                    },
                },
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Call {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<Id>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Subscribe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept: Option<Accept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledge: Option<Acknowledge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<Reconcile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscribe {
    pub framework_info: FrameworkInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Accept {
    pub offer_ids: Vec<Id>,
    pub operations: Vec<Operation>,
    pub filters: Filters,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub launch: Launch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Launch {
    pub task_infos: Vec<TaskInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Filters {
    pub refuse_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Acknowledge {
    pub agent_id: Id,
    pub task_id: Id,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconcile {
    pub tasks: Vec<ReconcileTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileTask {
    pub task_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Id>,
}

impl Call {
    fn bare(kind: &'static str) -> Self {
        Self {
            framework_id: None,
            kind,
            subscribe: None,
            accept: None,
            acknowledge: None,
            reconcile: None,
        }
    }

    pub fn subscribe(framework_info: FrameworkInfo) -> Self {
        Self {
            subscribe: Some(Subscribe { framework_info }),
            ..Self::bare("SUBSCRIBE")
        }
    }

    /// Launch `tasks` on one offer; an empty launch declines the offer for
    /// `refuse_seconds`.
    pub fn accept(offer_id: Id, tasks: Vec<TaskInfo>, refuse_seconds: f64) -> Self {
        Self {
            accept: Some(Accept {
                offer_ids: vec![offer_id],
                operations: vec![Operation {
                    kind: "LAUNCH",
                    launch: Launch { task_infos: tasks },
                }],
                filters: Filters { refuse_seconds },
            }),
            ..Self::bare("ACCEPT")
        }
    }

    pub fn acknowledge(agent_id: Id, task_id: Id, uuid: String) -> Self {
        Self {
            acknowledge: Some(Acknowledge {
                agent_id,
                task_id,
                uuid,
            }),
            ..Self::bare("ACKNOWLEDGE")
        }
    }

    /// Ask for the current state of (task, agent) pairs.
    pub fn reconcile(tasks: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            reconcile: Some(Reconcile {
                tasks: tasks
                    .into_iter()
                    .map(|(task_id, agent_id)| ReconcileTask {
                        task_id: Id::new(task_id),
                        agent_id: if agent_id.is_empty() {
                            None
                        } else {
                            Some(Id::new(agent_id))
                        },
                    })
                    .collect(),
            }),
            ..Self::bare("RECONCILE")
        }
    }

    pub fn revive() -> Self {
        Self::bare("REVIVE")
    }

    pub fn suppress() -> Self {
        Self::bare("SUPPRESS")
    }

    pub fn with_framework_id(mut self, id: Option<String>) -> Self {
        self.framework_id = id.map(Id::new);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribed_event_decodes() {
        let json = r#"{
            "type": "SUBSCRIBED",
            "subscribed": {
                "framework_id": {"value": "fw-123"},
                "heartbeat_interval_seconds": 15.0,
                "master_info": {
                    "hostname": "master-1",
                    "port": 5050,
                    "address": {"hostname": "master-1", "ip": "10.0.0.1", "port": 5050}
                }
            }
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Subscribed);
        let subscribed = event.subscribed.unwrap();
        assert_eq!(subscribed.framework_id.value, "fw-123");
        assert_eq!(
            subscribed.master_info.unwrap().leader_host().unwrap(),
            "master-1:5050"
        );
    }

    #[test]
    fn test_leader_host_falls_back_to_ip() {
        let info: MasterInfo = serde_json::from_str(
            r#"{"address": {"hostname": "", "ip": "10.0.0.1", "port": 5050}}"#,
        )
        .unwrap();
        assert_eq!(info.leader_host().unwrap(), "10.0.0.1:5050");
    }

    #[test]
    fn test_update_event_decodes() {
        let json = r#"{
            "type": "UPDATE",
            "update": {
                "status": {
                    "task_id": {"value": "g:p:a:u1"},
                    "state": "TASK_LOST",
                    "agent_id": {"value": "agent-1"},
                    "reason": "REASON_RECONCILIATION",
                    "source": "SOURCE_MASTER",
                    "uuid": "YWJj"
                }
            }
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        let status = event.update.unwrap().status;
        assert_eq!(status.state, TaskState::Lost);
        assert!(status.is_reconciliation());
        assert_eq!(status.uuid.as_deref(), Some("YWJj"));
    }

    #[test]
    fn test_unknown_event_and_state_decode() {
        let event: Event =
            serde_json::from_str(r#"{"type": "GREETINGS_FROM_THE_FUTURE"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);

        let status: TaskStatus = serde_json::from_str(
            r#"{"task_id": {"value": "t"}, "state": "TASK_GONE_BY_OPERATOR"}"#,
        )
        .unwrap();
        assert_eq!(status.state, TaskState::Unknown);
    }

    #[test]
    fn test_subscribe_call_shape() {
        let call = Call::subscribe(FrameworkInfo {
            user: "root".to_string(),
            name: "rhythm".to_string(),
            id: None,
            checkpoint: true,
            failover_timeout: 604800.0,
            roles: vec!["*".to_string()],
            capabilities: vec![Capability {
                kind: "MULTI_ROLE".to_string(),
            }],
            hostname: None,
            webui_url: None,
            principal: None,
            labels: Labels::default(),
        });
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "SUBSCRIBE");
        assert_eq!(json["subscribe"]["framework_info"]["name"], "rhythm");
        assert_eq!(
            json["subscribe"]["framework_info"]["capabilities"][0]["type"],
            "MULTI_ROLE"
        );
        assert!(json.get("framework_id").is_none());
    }

    #[test]
    fn test_accept_call_shape() {
        let call = Call::accept(Id::new("offer-1"), vec![], 3600.0)
            .with_framework_id(Some("fw-1".to_string()));
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "ACCEPT");
        assert_eq!(json["framework_id"]["value"], "fw-1");
        assert_eq!(json["accept"]["offer_ids"][0]["value"], "offer-1");
        assert_eq!(json["accept"]["operations"][0]["type"], "LAUNCH");
        assert_eq!(json["accept"]["filters"]["refuse_seconds"], 3600.0);
    }

    #[test]
    fn test_reconcile_call_shape() {
        let call = Call::reconcile(vec![("t1".to_string(), "a1".to_string())])
            .with_framework_id(Some("fw-1".to_string()));
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["reconcile"]["tasks"][0]["task_id"]["value"], "t1");
        assert_eq!(json["reconcile"]["tasks"][0]["agent_id"]["value"], "a1");
    }
}
