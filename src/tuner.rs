//! Offer flow tuning.
//!
//! A framework that cannot use offers should not receive them: the tuner
//! calls SUPPRESS when no job needs resources in the near future and
//! REVIVE as soon as at least one delayed job is waiting for an offer.
//! REVIVE is rate limited to one call per minute.
//!
//! On entering a new leadership scope the tuner revives unconditionally
//! (retrying every 10 s) to clear any SUPPRESS left behind by a previous
//! leader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::mesos::client::MesosClient;
use crate::model::Job;
use crate::store::Store;

const STARTUP_REVIVE_RETRY: Duration = Duration::from_secs(10);
const MIN_DELAY_TO_REVIVE: Duration = Duration::from_secs(60);
const REVIVE_TOKEN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// What one tuner round decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Revive,
    Suppress,
    Nothing,
}

/// Demand summary over the jobs cache.
#[derive(Debug, Clone, Copy)]
struct Demand {
    /// How long the most overdue job has been waiting, zero if none is.
    max_delay: Duration,
    /// How soon the nearest future run is due.
    min_deadline: Duration,
}

fn measure_demand(jobs: &[Job], queued: usize, now: DateTime<Utc>) -> Demand {
    let mut max_delay = Duration::ZERO;
    let mut min_deadline = DEFAULT_DEADLINE;
    for job in jobs {
        let Some(next) = job.next_run() else {
            continue;
        };
        match (now - next).to_std() {
            // Next run in the past: the job is overdue.
            Ok(delay) => max_delay = max_delay.max(delay),
            // Next run in the future: a deadline.
            Err(_) => {
                if let Ok(deadline) = (next - now).to_std() {
                    min_deadline = min_deadline.min(deadline);
                }
            }
        }
    }
    if queued > 0 {
        // A queued job wants an offer right now.
        max_delay = max_delay.max(MIN_DELAY_TO_REVIVE);
    }
    Demand {
        max_delay,
        min_deadline,
    }
}

/// Pure decision: revive when demand is overdue, suppress when nothing is
/// due within a quarter of the round interval.
fn plan(demand: Demand, suppressed: bool, round_interval: Duration) -> Action {
    if demand.max_delay >= MIN_DELAY_TO_REVIVE || (suppressed && demand.max_delay > Duration::ZERO)
    {
        Action::Revive
    } else if demand.max_delay == Duration::ZERO
        && demand.min_deadline > round_interval / 4
        && !suppressed
    {
        Action::Suppress
    } else {
        Action::Nothing
    }
}

/// SUPPRESS/REVIVE controller for one leadership scope.
pub struct OfferTuner {
    client: Arc<MesosClient>,
    store: Arc<dyn Store>,
    scope: CancellationToken,
    round_interval: Duration,
    started: AtomicBool,
}

impl OfferTuner {
    pub fn new(
        client: Arc<MesosClient>,
        store: Arc<dyn Store>,
        scope: CancellationToken,
        round_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            scope,
            round_interval,
            started: AtomicBool::new(false),
        })
    }

    /// Start the tuner loop. Later calls within the same scope are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        info!("Offer tuner started");
        // Clear any SUPPRESS from a previous leader before settling into
        // normal rounds.
        loop {
            match self.client.revive().await {
                Ok(()) => {
                    debug!("Revived offers");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to revive offers, retrying");
                    tokio::select! {
                        _ = self.scope.cancelled() => return,
                        _ = tokio::time::sleep(STARTUP_REVIVE_RETRY) => {}
                    }
                }
            }
        }

        let mut suppressed = false;
        let mut revive_ready_at = Instant::now();
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => {
                    info!("Offer tuner terminated");
                    return;
                }
                _ = tokio::time::sleep(self.round_interval) => {
                    match self.round(suppressed, &mut revive_ready_at).await {
                        Ok(now_suppressed) => suppressed = now_suppressed,
                        Err(e) => error!(error = %e, "Offer tuner round failed"),
                    }
                }
            }
        }
    }

    /// One round. Returns the new suppression state.
    async fn round(
        &self,
        suppressed: bool,
        revive_ready_at: &mut Instant,
    ) -> anyhow::Result<bool> {
        let jobs = self.store.get_jobs().await?;
        let queued = self.store.get_queued_job_ids().await?;
        let demand = measure_demand(&jobs, queued.len(), Utc::now());
        debug!(
            max_delay_secs = demand.max_delay.as_secs(),
            min_deadline_secs = demand.min_deadline.as_secs(),
            suppressed,
            "Offer tuner round"
        );
        match plan(demand, suppressed, self.round_interval) {
            Action::Revive => {
                // Token bucket: at most one revive per minute.
                if Instant::now() < *revive_ready_at {
                    return Ok(suppressed);
                }
                self.client.revive().await?;
                *revive_ready_at = Instant::now() + REVIVE_TOKEN_INTERVAL;
                debug!("Revived offers");
                Ok(false)
            }
            Action::Suppress => {
                self.client.suppress().await?;
                debug!("Suppressed offers");
                Ok(true)
            }
            Action::Nothing => Ok(suppressed),
        }
    }
}
