//! Task state reconciliation.
//!
//! After a leader change, a network partition or a master failover the
//! scheduler's view of in-flight tasks may diverge from the resource
//! manager's. Each reconciliation round asks the master for the state of
//! every (task, agent) pair the store believes active and waits until an
//! update with reason RECONCILIATION has arrived for each of them,
//! re-asking on an exponential backoff.
//!
//! Rounds run every 10 minutes, plus once after every successful
//! subscription; a failed round is retried after 10 seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::mesos::client::MesosClient;
use crate::mesos::proto::TaskStatus;
use crate::store::Store;

const ROUND_INTERVAL: Duration = Duration::from_secs(10 * 60);
const ROUND_RETRY: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(4);

/// Periodic and on-demand reconciliation driver.
pub struct Reconciler {
    client: Arc<MesosClient>,
    store: Arc<dyn Store>,
    scope: CancellationToken,
    round_tx: mpsc::Sender<()>,
    updates_tx: mpsc::Sender<String>,
    loop_state: Mutex<Option<LoopChannels>>,
}

struct LoopChannels {
    round_rx: mpsc::Receiver<()>,
    updates_rx: mpsc::Receiver<String>,
}

impl Reconciler {
    pub fn new(
        client: Arc<MesosClient>,
        store: Arc<dyn Store>,
        scope: CancellationToken,
    ) -> Arc<Self> {
        let (round_tx, round_rx) = mpsc::channel(1);
        let (updates_tx, updates_rx) = mpsc::channel(64);
        Arc::new(Self {
            client,
            store,
            scope,
            round_tx,
            updates_tx,
            loop_state: Mutex::new(Some(LoopChannels {
                round_rx,
                updates_rx,
            })),
        })
    }

    /// Feed one incoming status update. Anything without reason
    /// RECONCILIATION is not an answer to our questions and is dropped
    /// here; the scheduler engine processes it independently.
    pub fn handle_update(&self, status: &TaskStatus) {
        if !status.is_reconciliation() {
            return;
        }
        // Outside a round nobody drains the channel; losing answers is
        // fine, the next ask repeats the question.
        let _ = self.updates_tx.try_send(status.task_id.value.clone());
    }

    /// Start the round loop (first call only) and queue an immediate
    /// round. Called after every successful subscription.
    pub async fn run(self: &Arc<Self>) {
        if let Some(channels) = self.loop_state.lock().await.take() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.round_loop(channels).await;
            });
        }
        self.queue_round();
    }

    fn queue_round(&self) {
        let _ = self.round_tx.try_send(());
    }

    async fn round_loop(self: Arc<Self>, mut channels: LoopChannels) {
        info!("Reconciliation started");
        let mut next_round = Box::pin(tokio::time::sleep(ROUND_INTERVAL));
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => {
                    info!("Reconciliation terminated");
                    return;
                }
                _ = &mut next_round => {
                    self.queue_round();
                    next_round = Box::pin(tokio::time::sleep(ROUND_INTERVAL));
                }
                Some(()) = channels.round_rx.recv() => {
                    debug!("Reconciliation round started");
                    match self.round(&mut channels.updates_rx).await {
                        Ok(()) => {
                            debug!("Reconciliation round finished");
                            next_round = Box::pin(tokio::time::sleep(ROUND_INTERVAL));
                        }
                        Err(e) => {
                            error!(error = %e, "Reconciliation round failed");
                            next_round = Box::pin(tokio::time::sleep(ROUND_RETRY));
                        }
                    }
                }
            }
        }
    }

    /// One round: snapshot in-flight tasks, then re-ask with growing
    /// backoff until every task got an answer or the scope is cancelled.
    async fn round(&self, updates_rx: &mut mpsc::Receiver<String>) -> anyhow::Result<()> {
        let jobs = self.store.get_jobs().await?;
        let mut tasks: HashMap<String, String> = jobs
            .iter()
            .filter(|job| !job.runtime.current_task_id.is_empty())
            .map(|job| {
                (
                    job.runtime.current_task_id.clone(),
                    job.runtime.current_agent_id.clone(),
                )
            })
            .collect();
        debug!(tasks = tasks.len(), "Reconciling in-flight tasks");

        // Answers from a previous round are no longer interesting.
        while updates_rx.try_recv().is_ok() {}

        let mut backoff = INITIAL_BACKOFF;
        while !tasks.is_empty() {
            self.client.reconcile(&tasks).await?;
            let deadline = tokio::time::sleep(backoff);
            tokio::pin!(deadline);
            backoff *= 2;
            loop {
                tokio::select! {
                    _ = self.scope.cancelled() => return Ok(()),
                    _ = &mut deadline => break,
                    Some(task_id) = updates_rx.recv() => {
                        tasks.remove(&task_id);
                        if tasks.is_empty() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesos::proto::{Id, TaskState};

    fn status(task_id: &str, reason: Option<&str>) -> TaskStatus {
        TaskStatus {
            task_id: Id::new(task_id),
            state: TaskState::Lost,
            agent_id: None,
            executor_id: None,
            message: None,
            reason: reason.map(str::to_string),
            source: None,
            uuid: None,
        }
    }

    #[tokio::test]
    async fn test_only_reconciliation_updates_are_queued() {
        let client = Arc::new(
            MesosClient::new(&crate::config::MesosConfig {
                addrs: vec!["http://localhost:5050".to_string()],
                role: "*".to_string(),
                user: "root".to_string(),
                principal: String::new(),
                hostname: String::new(),
                webui_url: String::new(),
                checkpoint: true,
                failover_timeout: Duration::from_secs(60),
                auth: None,
                labels: Default::default(),
            })
            .unwrap(),
        );
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let reconciler = Reconciler::new(client, store, CancellationToken::new());

        reconciler.handle_update(&status("t1", None));
        reconciler.handle_update(&status("t2", Some("REASON_RECONCILIATION")));

        let mut channels = reconciler.loop_state.lock().await.take().unwrap();
        assert_eq!(channels.updates_rx.try_recv().unwrap(), "t2");
        assert!(channels.updates_rx.try_recv().is_err());
    }
}
