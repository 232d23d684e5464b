//! Leader election over ZooKeeper.
//!
//! Election is a sequential queue: every candidate owns an
//! ephemeral-sequential ticket under an election directory and the
//! lexicographically smallest ticket is the leader. Non-leaders watch the
//! directory and re-check on every change.
//!
//! `wait_until_leader` blocks until this replica is elected and returns a
//! cancellable leadership scope. The scope is cancelled when the ZooKeeper
//! session disconnects or the leader steps down; on session expiration the
//! ticket is dropped as well, forcing re-registration on reconnect.
//!
//! Distinct leadership roles (framework session, task history cleanup) use
//! distinct election subdirectories and separate `Coordinator` instances,
//! each with its own ZooKeeper session.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::config::{ZkAuth, ZkConfig};

const TICKET_PREFIX: &str = "ticket-";
const REGISTER_RETRY: Duration = Duration::from_secs(1);

/// Errors from coordination.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("zookeeper error: {0}")]
    ZooKeeper(#[from] zk::Error),

    #[error("registration ticket vanished")]
    TicketVanished,
}

struct Session {
    client: zk::Client,
    /// Distinguishes this session from ones created after it died, so a
    /// stale watch task cannot tear down its successor.
    generation: u64,
    /// Ticket name under the election directory; None before registration
    /// and after session expiration.
    ticket: Option<String>,
    /// Scope of the current leadership, if any.
    scope: Option<CancellationToken>,
}

/// Sequential-queue leader elector for one role.
pub struct Coordinator {
    config: ZkConfig,
    election_dir: String,
    session: Mutex<Option<Session>>,
    generations: std::sync::atomic::AtomicU64,
}

impl Coordinator {
    /// Connect and make sure the election directory exists.
    pub async fn connect(config: &ZkConfig, election_dir: &str) -> Result<Arc<Self>, CoordinatorError> {
        let coordinator = Arc::new(Self {
            config: config.clone(),
            election_dir: election_dir.to_string(),
            session: Mutex::new(None),
            generations: std::sync::atomic::AtomicU64::new(0),
        });
        coordinator.ensure_session().await?;
        Ok(coordinator)
    }

    fn election_path(&self) -> String {
        format!("{}/{}", self.config.dir, self.election_dir)
    }

    fn acls(&self) -> zk::Acls {
        match self.config.auth {
            ZkAuth::World => zk::Acls::anyone_all(),
            ZkAuth::Digest { .. } => zk::Acls::creator_all(),
        }
    }

    /// Connect a fresh session if none is live, create the election
    /// hierarchy and start the session watch task.
    async fn ensure_session(self: &Arc<Self>) -> Result<zk::Client, CoordinatorError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.client.clone());
        }

        let mut connector = zk::Client::connector();
        connector.session_timeout(self.config.timeout);
        if let ZkAuth::Digest { ref user, ref password } = self.config.auth {
            connector.auth("digest".to_string(), format!("{user}:{password}").into_bytes());
        }
        let client = connector.connect(&self.config.cluster()).await?;

        // Election directory and its parent must exist before tickets can
        // be created under it.
        for path in [self.config.dir.clone(), parent_of(&self.election_path()), self.election_path()] {
            match client
                .create(&path, &[], &zk::CreateMode::Persistent.with_acls(self.acls()))
                .await
            {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let watcher = client.state_watcher();
        let generation = self
            .generations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *guard = Some(Session {
            client: client.clone(),
            generation,
            ticket: None,
            scope: None,
        });
        drop(guard);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.watch_session(watcher, generation).await;
        });

        Ok(client)
    }

    /// React to session state changes: cancel the leadership scope on any
    /// disconnect, drop the whole session on expiration. Only acts on the
    /// session it was spawned for.
    async fn watch_session(self: Arc<Self>, mut watcher: zk::StateWatcher, generation: u64) {
        loop {
            let state = watcher.changed().await;
            debug!(election = %self.election_dir, state = ?state, "ZooKeeper session state change");
            match state {
                zk::SessionState::Disconnected => {
                    let mut guard = self.session.lock().await;
                    if let Some(session) = guard.as_mut() {
                        if session.generation != generation {
                            return;
                        }
                        if let Some(scope) = session.scope.take() {
                            warn!(election = %self.election_dir, "Disconnected, cancelling leadership scope");
                            scope.cancel();
                        }
                    }
                }
                state if state.is_terminated() => {
                    warn!(election = %self.election_dir, state = ?state, "ZooKeeper session terminated");
                    let mut guard = self.session.lock().await;
                    if guard.as_ref().map(|s| s.generation) == Some(generation) {
                        if let Some(mut session) = guard.take() {
                            if let Some(scope) = session.scope.take() {
                                scope.cancel();
                            }
                        }
                    }
                    return;
                }
                _ => {}
            }
        }
    }

    /// Create the ephemeral-sequential ticket if this session has none yet.
    async fn register(&self, client: &zk::Client) -> Result<String, CoordinatorError> {
        {
            let guard = self.session.lock().await;
            if let Some(Session { ticket: Some(t), .. }) = guard.as_ref() {
                return Ok(t.clone());
            }
        }
        let path = format!("{}/{}", self.election_path(), TICKET_PREFIX);
        let (_, sequence) = client
            .create(
                &path,
                &[],
                &zk::CreateMode::EphemeralSequential.with_acls(self.acls()),
            )
            .await?;
        let ticket = format!("{TICKET_PREFIX}{sequence}");
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            session.ticket = Some(ticket.clone());
        }
        info!(election = %self.election_dir, ticket = %ticket, "Registered election ticket");
        Ok(ticket)
    }

    /// One election check: register if needed, then compare our ticket to
    /// the smallest one. Returns the leadership verdict plus a watcher that
    /// fires on the next membership change.
    async fn check(self: &Arc<Self>) -> Result<(bool, zk::OneshotWatcher), CoordinatorError> {
        let client = self.ensure_session().await?;
        let ticket = self.register(&client).await?;
        let (mut tickets, watcher) = client
            .list_and_watch_children(&self.election_path())
            .await?;
        tickets.sort();
        debug!(election = %self.election_dir, tickets = ?tickets, mine = %ticket, "Election tickets");
        if !tickets.iter().any(|t| *t == ticket) {
            // Our ephemeral node is gone: the session it belonged to died.
            let mut guard = self.session.lock().await;
            if let Some(session) = guard.as_mut() {
                session.ticket = None;
            }
            return Err(CoordinatorError::TicketVanished);
        }
        let is_leader = tickets.first().map(|t| t == &ticket).unwrap_or(false);
        Ok((is_leader, watcher))
    }

    /// Block until elected, then return the leadership scope.
    pub async fn wait_until_leader(self: &Arc<Self>) -> Result<CancellationToken, CoordinatorError> {
        loop {
            match self.check().await {
                Ok((true, _)) => {
                    info!(election = %self.election_dir, "Elected as leader");
                    let scope = CancellationToken::new();
                    let mut guard = self.session.lock().await;
                    match guard.as_mut() {
                        Some(session) => session.scope = Some(scope.clone()),
                        // Session died between the check and now.
                        None => {
                            scope.cancel();
                        }
                    }
                    return Ok(scope);
                }
                Ok((false, watcher)) => {
                    info!(election = %self.election_dir, "Not elected as leader, waiting");
                    watcher.changed().await;
                }
                Err(e) => {
                    warn!(election = %self.election_dir, error = %e, "Election check failed");
                    tokio::time::sleep(REGISTER_RETRY).await;
                }
            }
        }
    }

    /// Step down: cancel the current leadership scope without touching the
    /// ticket, so the next check is still accurate.
    pub async fn step_down(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if let Some(scope) = session.scope.take() {
                info!(election = %self.election_dir, "Stepping down from leadership");
                scope.cancel();
            }
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/rhythm/election/mesos_scheduler"), "/rhythm/election");
        assert_eq!(parent_of("/rhythm"), "/");
    }
}
