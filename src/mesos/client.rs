//! HTTP client for the Mesos v1 scheduler API.
//!
//! A SUBSCRIBE call opens a long-lived streamed response carrying
//! RecordIO-framed JSON events (`<length>\n<json>`); the `Mesos-Stream-Id`
//! response header identifies the subscription and must be echoed on every
//! other call of the session. Non-subscribe calls are plain POSTs answered
//! with 202.
//!
//! Endpoints round-robin over the configured master list per connection
//! attempt; calls always target the endpoint of the live subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::config::MesosConfig;

use super::proto::{Call, Event, FrameworkInfo, Id, TaskInfo, TaskStatus};

const SCHEDULER_PATH: &str = "/api/v1/scheduler";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";

/// Errors from talking to the resource manager.
#[derive(Debug, Error)]
pub enum MesosClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("not subscribed")]
    NotSubscribed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

struct Session {
    endpoint: String,
    stream_id: String,
}

/// Scheduler API client. One instance lives for a framework session and is
/// shared by the controller, reconciler and tuner.
pub struct MesosClient {
    http: reqwest::Client,
    addrs: Vec<String>,
    auth: Option<(String, String)>,
    cursor: AtomicUsize,
    framework_id: RwLock<Option<String>>,
    session: RwLock<Option<Session>>,
}

impl MesosClient {
    pub fn new(config: &MesosConfig) -> Result<Self, MesosClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CALL_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            addrs: config.addrs.clone(),
            auth: config.auth.clone(),
            cursor: AtomicUsize::new(0),
            framework_id: RwLock::new(None),
            session: RwLock::new(None),
        })
    }

    /// Round-robin endpoint selection.
    fn next_endpoint(&self) -> String {
        let pos = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.addrs[pos % self.addrs.len()].clone()
    }

    pub fn set_framework_id(&self, id: Option<String>) {
        *self.framework_id.write().unwrap() = id;
    }

    pub fn framework_id(&self) -> Option<String> {
        self.framework_id.read().unwrap().clone()
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    /// Open a subscription. On success the returned stream yields events
    /// until the connection dies.
    pub async fn subscribe(
        &self,
        framework_info: FrameworkInfo,
    ) -> Result<EventStream, MesosClientError> {
        let endpoint = self.next_endpoint();
        let url = format!("{endpoint}{SCHEDULER_PATH}");
        debug!(url = %url, "Subscribing");
        let call =
            Call::subscribe(framework_info).with_framework_id(self.framework_id());
        let response = self
            .apply_auth(self.http.post(&url))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&call)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MesosClientError::Status { status, body });
        }
        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                MesosClientError::Protocol("subscribe response lacks Mesos-Stream-Id".to_string())
            })?;

        *self.session.write().unwrap() = Some(Session {
            endpoint,
            stream_id,
        });

        Ok(EventStream {
            inner: Box::pin(response.bytes_stream()),
            buf: BytesMut::new(),
        })
    }

    /// Send a non-subscribe call on the current session.
    pub async fn call(&self, call: Call) -> Result<(), MesosClientError> {
        let (endpoint, stream_id) = {
            let session = self.session.read().unwrap();
            match session.as_ref() {
                Some(s) => (s.endpoint.clone(), s.stream_id.clone()),
                None => return Err(MesosClientError::NotSubscribed),
            }
        };
        let call = call.with_framework_id(self.framework_id());
        debug!(kind = call.kind, "Sending call");
        let response = self
            .apply_auth(self.http.post(format!("{endpoint}{SCHEDULER_PATH}")))
            .header(STREAM_ID_HEADER, stream_id)
            .timeout(CALL_TIMEOUT)
            .json(&call)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MesosClientError::Status { status, body });
        }
        Ok(())
    }

    pub async fn accept(
        &self,
        offer_id: Id,
        tasks: Vec<TaskInfo>,
        refuse_seconds: f64,
    ) -> Result<(), MesosClientError> {
        self.call(Call::accept(offer_id, tasks, refuse_seconds))
            .await
    }

    /// Acknowledge a status update that carries an acknowledgement uuid.
    pub async fn acknowledge(&self, status: &TaskStatus) -> Result<(), MesosClientError> {
        let (Some(agent_id), Some(uuid)) = (status.agent_id.clone(), status.uuid.clone()) else {
            return Ok(());
        };
        self.call(Call::acknowledge(agent_id, status.task_id.clone(), uuid))
            .await
    }

    pub async fn reconcile(
        &self,
        tasks: &HashMap<String, String>,
    ) -> Result<(), MesosClientError> {
        self.call(Call::reconcile(
            tasks.iter().map(|(t, a)| (t.clone(), a.clone())),
        ))
        .await
    }

    pub async fn revive(&self) -> Result<(), MesosClientError> {
        self.call(Call::revive()).await
    }

    pub async fn suppress(&self) -> Result<(), MesosClientError> {
        self.call(Call::suppress()).await
    }
}

type ByteStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// RecordIO-framed event stream of one subscription.
pub struct EventStream {
    inner: ByteStream,
    buf: BytesMut,
}

impl EventStream {
    /// Next event, or None when the server closed the stream cleanly.
    pub async fn next_event(&mut self) -> Result<Option<Event>, MesosClientError> {
        loop {
            if let Some(event) = decode_record(&mut self.buf)? {
                return Ok(Some(event));
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(MesosClientError::Protocol(
                        "stream ended mid-record".to_string(),
                    ));
                }
            }
        }
    }
}

/// Decode one `<length>\n<json>` record if the buffer holds a full one.
fn decode_record(buf: &mut BytesMut) -> Result<Option<Event>, MesosClientError> {
    let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let length: usize = std::str::from_utf8(&buf[..newline])
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| MesosClientError::Protocol("bad record length prefix".to_string()))?;
    if buf.len() < newline + 1 + length {
        return Ok(None);
    }
    buf.advance(newline + 1);
    let payload = buf.split_to(length);
    let event: Event = serde_json::from_slice(&payload)
        .map_err(|e| MesosClientError::Protocol(format!("bad event json: {e}")))?;
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesos::proto::EventKind;

    #[test]
    fn test_decode_record_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"20\n{\"type\":\"HEART");
        assert!(decode_record(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"BEAT\"}");
        let event = decode_record(&mut buf).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Heartbeat);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_record_consumes_back_to_back_frames() {
        let first = r#"{"type":"HEARTBEAT"}"#;
        let second = r#"{"type":"ERROR","error":{"message":"boom"}}"#;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("{}\n{first}{}\n{second}", first.len(), second.len()).as_bytes());

        let event = decode_record(&mut buf).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Heartbeat);
        let event = decode_record(&mut buf).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.error.unwrap().message, "boom");
    }

    #[test]
    fn test_decode_record_rejects_garbage_prefix() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"xyz\n{}");
        assert!(decode_record(&mut buf).is_err());
    }
}
