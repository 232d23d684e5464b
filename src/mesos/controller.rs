//! Framework session controller.
//!
//! Runs the framework side of one leadership scope: subscribe to the
//! resource manager, dispatch streamed events to the scheduler engine,
//! reconciler and tuner, and resubscribe with backoff when the connection
//! dies. The whole session ends when the leadership scope is cancelled or
//! the master reports the framework as removed.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::reconciler::Reconciler;
use crate::scheduler::Scheduler;
use crate::secrets::Secrets;
use crate::store::Store;
use crate::tuner::OfferTuner;

use super::client::{EventStream, MesosClient};
use super::proto::{
    Capability, Event, EventKind, FrameworkInfo, Label, Labels, MasterInfo, Offer, TaskStatus,
};

const FRAMEWORK_NAME: &str = "rhythm";
const REGISTRATION_MIN_BACKOFF: Duration = Duration::from_secs(1);
const REGISTRATION_MAX_BACKOFF: Duration = Duration::from_secs(15);
const REFUSE_SECONDS: f64 = 3600.0;
const FRAMEWORK_REMOVED_MESSAGE: &str = "Framework has been removed";

/// Store-backed framework id, memoized in memory.
///
/// The id is assigned by the master on first subscription and survives
/// failovers; it is cleared only when the master reports the framework as
/// removed. The in-memory cell is shared with the scheduler engine for
/// history rows.
pub struct FrameworkIdStore {
    store: Arc<dyn Store>,
    cached: Arc<RwLock<Option<String>>>,
}

impl FrameworkIdStore {
    pub async fn load(store: Arc<dyn Store>) -> Result<Self> {
        let current = store.get_framework_id().await?;
        if let Some(id) = &current {
            info!(framework_id = %id, "Loaded framework id");
        }
        Ok(Self {
            store,
            cached: Arc::new(RwLock::new(current)),
        })
    }

    pub fn get(&self) -> Option<String> {
        self.cached.read().unwrap().clone()
    }

    /// Shared cell for read-only consumers.
    pub fn cell(&self) -> Arc<RwLock<Option<String>>> {
        Arc::clone(&self.cached)
    }

    /// Persist and memoize. Idempotent for an unchanged id.
    pub async fn set(&self, id: &str) -> Result<()> {
        if self.get().as_deref() == Some(id) {
            return Ok(());
        }
        info!(framework_id = %id, "Framework id assigned");
        self.store.set_framework_id(id).await?;
        *self.cached.write().unwrap() = Some(id.to_string());
        Ok(())
    }

    /// Forget the id durably; the next subscription registers fresh.
    pub async fn clear(&self) -> Result<()> {
        self.store.set_framework_id("").await?;
        *self.cached.write().unwrap() = None;
        Ok(())
    }
}

fn framework_info(config: &Config, id: Option<String>) -> FrameworkInfo {
    let mesos = &config.mesos;
    FrameworkInfo {
        user: mesos.user.clone(),
        name: FRAMEWORK_NAME.to_string(),
        id: id.map(super::proto::Id::new),
        checkpoint: mesos.checkpoint,
        failover_timeout: mesos.failover_timeout.as_secs_f64(),
        roles: vec![mesos.role.clone()],
        capabilities: vec![Capability {
            kind: "MULTI_ROLE".to_string(),
        }],
        hostname: some_nonempty(&mesos.hostname),
        webui_url: some_nonempty(&mesos.webui_url),
        principal: some_nonempty(&mesos.principal),
        labels: Labels {
            labels: mesos
                .labels
                .iter()
                .map(|(k, v)| Label {
                    key: k.clone(),
                    value: Some(v.clone()),
                })
                .collect(),
        },
    }
}

fn some_nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Scheme of the first configured master address, for building the leading
/// master URL.
fn configured_scheme(config: &Config) -> &'static str {
    if config.mesos.addrs[0].starts_with("https://") {
        "https"
    } else {
        "http"
    }
}

struct Session {
    config: Config,
    client: Arc<MesosClient>,
    framework_ids: FrameworkIdStore,
    leader_url: Arc<RwLock<String>>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    tuner: Arc<OfferTuner>,
    scope: CancellationToken,
}

/// Run the framework session for one leadership scope. Returns when the
/// scope is cancelled or the session is terminally broken.
pub async fn run_framework(
    config: &Config,
    store: Arc<dyn Store>,
    secrets: Arc<dyn Secrets>,
    scope: CancellationToken,
) -> Result<()> {
    let framework_ids = FrameworkIdStore::load(Arc::clone(&store)).await?;
    let client = Arc::new(MesosClient::new(&config.mesos)?);
    client.set_framework_id(framework_ids.get());
    let leader_url = Arc::new(RwLock::new(String::new()));

    let scheduler = Scheduler::start(
        config.mesos.role.clone(),
        Arc::clone(&store),
        secrets,
        framework_ids.cell(),
        Arc::clone(&leader_url),
        scope.clone(),
    )
    .await;
    info!(jobs = scheduler.job_count(), "Scheduler engine ready");

    let reconciler = Reconciler::new(Arc::clone(&client), Arc::clone(&store), scope.clone());
    let tuner = OfferTuner::new(
        Arc::clone(&client),
        Arc::clone(&store),
        scope.clone(),
        config.tuner_interval,
    );

    let session = Session {
        config: config.clone(),
        client,
        framework_ids,
        leader_url,
        scheduler,
        reconciler,
        tuner,
        scope,
    };
    session.run().await
}

impl Session {
    async fn run(&self) -> Result<()> {
        let mut backoff = REGISTRATION_MIN_BACKOFF;
        loop {
            if self.scope.is_cancelled() {
                return Ok(());
            }
            info!("Connecting to Mesos");
            let info = framework_info(&self.config, self.framework_ids.get());
            match self.client.subscribe(info).await {
                Ok(events) => {
                    backoff = REGISTRATION_MIN_BACKOFF;
                    if self.consume_events(events).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Subscription attempt failed");
                }
            }
            tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(REGISTRATION_MAX_BACKOFF);
        }
    }

    /// Drain one subscription. Returns true when the session is over for
    /// good (scope cancelled), false to resubscribe.
    async fn consume_events(&self, mut events: EventStream) -> bool {
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => return true,
                event = events.next_event() => match event {
                    Ok(Some(event)) => {
                        if self.dispatch(event).await.is_terminal() {
                            self.scope.cancel();
                            return true;
                        }
                    }
                    Ok(None) => {
                        info!("Connection to Mesos terminated");
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Subscription stream failed");
                        return false;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, event: Event) -> Disposition {
        match event.kind {
            EventKind::Subscribed => {
                if let Some(subscribed) = event.subscribed {
                    self.on_subscribed(subscribed.framework_id.value, subscribed.master_info)
                        .await;
                }
                Disposition::Continue
            }
            EventKind::Offers => {
                let offers = event.offers.map(|o| o.offers).unwrap_or_default();
                debug!(offers = offers.len(), "Received offers");
                for offer in offers {
                    self.on_offer(offer).await;
                }
                Disposition::Continue
            }
            EventKind::Update => {
                if let Some(update) = event.update {
                    self.on_update(update.status).await;
                }
                Disposition::Continue
            }
            EventKind::Error => {
                let message = event.error.map(|e| e.message).unwrap_or_default();
                error!(message = %message, "Error event");
                if message == FRAMEWORK_REMOVED_MESSAGE {
                    info!("Resetting framework id");
                    if let Err(e) = self.framework_ids.clear().await {
                        error!(error = %e, "Failed clearing framework id");
                    }
                    self.client.set_framework_id(None);
                    return Disposition::Terminal;
                }
                Disposition::Continue
            }
            EventKind::Heartbeat => {
                debug!("Heartbeat");
                Disposition::Continue
            }
            other => {
                debug!(kind = ?other, "Ignoring event");
                Disposition::Continue
            }
        }
    }

    async fn on_subscribed(&self, framework_id: String, master_info: Option<MasterInfo>) {
        info!(framework_id = %framework_id, "Subscribed");
        if let Err(e) = self.framework_ids.set(&framework_id).await {
            error!(error = %e, "Failed persisting framework id");
        }
        self.client.set_framework_id(Some(framework_id));

        if let Some(host) = master_info.and_then(|info| info.leader_host()) {
            let url = format!("{}://{}", configured_scheme(&self.config), host);
            info!(url = %url, "Leading master");
            *self.leader_url.write().unwrap() = url;
        }

        self.reconciler.run().await;
        self.tuner.start();
    }

    async fn on_offer(&self, offer: Offer) {
        let tasks = self.scheduler.find_tasks_for_offer(&offer).await;
        let staged = tasks.len();
        if let Err(e) = self
            .client
            .accept(offer.id.clone(), tasks, REFUSE_SECONDS)
            .await
        {
            error!(offer = %offer.id.value, error = %e, "Failed to accept offer");
            return;
        }
        if staged > 0 {
            info!(offer = %offer.id.value, staged, "Jobs staged");
        }
    }

    async fn on_update(&self, status: TaskStatus) {
        if let Err(e) = self.client.acknowledge(&status).await {
            error!(task_id = %status.task_id.value, error = %e, "Failed to acknowledge update");
        }
        self.reconciler.handle_update(&status);
        self.scheduler.handle_task_update(&status).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Continue,
    /// The session cannot continue under this leadership scope.
    Terminal,
}

impl Disposition {
    fn is_terminal(self) -> bool {
        self == Self::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MesosConfig, SecretsBackend, ZkAuth, ZkConfig};

    fn test_config() -> Config {
        Config {
            api_addr: "127.0.0.1:8000".parse().unwrap(),
            zookeeper: ZkConfig {
                addrs: vec!["127.0.0.1:2181".to_string()],
                dir: "/rhythm".to_string(),
                timeout: Duration::from_secs(10),
                auth: ZkAuth::World,
            },
            task_ttl: Duration::from_secs(86400),
            mesos: MesosConfig {
                addrs: vec!["https://master-1:5050".to_string()],
                role: "batch".to_string(),
                user: "nobody".to_string(),
                principal: "rhythm".to_string(),
                hostname: String::new(),
                webui_url: String::new(),
                checkpoint: true,
                failover_timeout: Duration::from_secs(604800),
                auth: None,
                labels: [("team".to_string(), "infra".to_string())].into(),
            },
            secrets: SecretsBackend::None,
            tuner_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_framework_info_from_config() {
        let config = test_config();
        let info = framework_info(&config, Some("fw-9".to_string()));
        assert_eq!(info.name, "rhythm");
        assert_eq!(info.id.unwrap().value, "fw-9");
        assert_eq!(info.roles, vec!["batch".to_string()]);
        assert_eq!(info.capabilities[0].kind, "MULTI_ROLE");
        assert_eq!(info.failover_timeout, 604800.0);
        assert!(info.hostname.is_none());
        assert_eq!(info.labels.labels[0].key, "team");
    }

    #[test]
    fn test_configured_scheme() {
        let mut config = test_config();
        assert_eq!(configured_scheme(&config), "https");
        config.mesos.addrs = vec!["http://master-1:5050".to_string()];
        assert_eq!(configured_scheme(&config), "http");
    }

    async fn test_session(store: Arc<dyn Store>) -> (Session, CancellationToken) {
        let config = test_config();
        let scope = CancellationToken::new();
        let framework_ids = FrameworkIdStore::load(Arc::clone(&store)).await.unwrap();
        let client = Arc::new(MesosClient::new(&config.mesos).unwrap());
        let leader_url = Arc::new(RwLock::new(String::new()));
        let scheduler = Scheduler::start(
            config.mesos.role.clone(),
            Arc::clone(&store),
            Arc::new(crate::secrets::NoneSecrets),
            framework_ids.cell(),
            Arc::clone(&leader_url),
            scope.clone(),
        )
        .await;
        let reconciler = Reconciler::new(Arc::clone(&client), Arc::clone(&store), scope.clone());
        let tuner = OfferTuner::new(
            Arc::clone(&client),
            Arc::clone(&store),
            scope.clone(),
            config.tuner_interval,
        );
        let session = Session {
            config,
            client,
            framework_ids,
            leader_url,
            scheduler,
            reconciler,
            tuner,
            scope: scope.clone(),
        };
        (session, scope)
    }

    #[tokio::test]
    async fn test_framework_removed_clears_id_and_ends_session() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        store.set_framework_id("fw-old").await.unwrap();
        let (session, scope) = test_session(Arc::clone(&store)).await;
        assert_eq!(session.framework_ids.get().as_deref(), Some("fw-old"));

        let event = Event {
            kind: EventKind::Error,
            subscribed: None,
            offers: None,
            update: None,
            error: Some(super::super::proto::ErrorEvent {
                message: FRAMEWORK_REMOVED_MESSAGE.to_string(),
            }),
        };
        let disposition = session.dispatch(event).await;
        assert!(disposition.is_terminal());
        assert!(session.framework_ids.get().is_none());
        assert!(store.get_framework_id().await.unwrap().is_none());
        scope.cancel();
    }

    #[tokio::test]
    async fn test_other_errors_keep_the_session() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let (session, scope) = test_session(Arc::clone(&store)).await;
        let event = Event {
            kind: EventKind::Error,
            subscribed: None,
            offers: None,
            update: None,
            error: Some(super::super::proto::ErrorEvent {
                message: "some transient complaint".to_string(),
            }),
        };
        assert!(!session.dispatch(event).await.is_terminal());
        scope.cancel();
    }

    #[tokio::test]
    async fn test_framework_id_store_memoizes_and_clears() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let ids = FrameworkIdStore::load(Arc::clone(&store)).await.unwrap();
        assert!(ids.get().is_none());

        ids.set("fw-1").await.unwrap();
        assert_eq!(ids.get().as_deref(), Some("fw-1"));
        assert_eq!(
            store.get_framework_id().await.unwrap().as_deref(),
            Some("fw-1")
        );

        // Idempotent for the same id.
        ids.set("fw-1").await.unwrap();
        assert_eq!(ids.get().as_deref(), Some("fw-1"));

        ids.clear().await.unwrap();
        assert!(ids.get().is_none());
        assert!(store.get_framework_id().await.unwrap().is_none());
    }
}
