//! rhythm: fault-tolerant cron job scheduler for Mesos-class clusters.
//!
//! The service registers as a framework over the Mesos v1 HTTP scheduler
//! API, elects a single active leader across replicas via ZooKeeper and
//! launches containerized cron jobs in response to resource offers.
//!
//! ## Modules
//!
//! - `model`: jobs, schedules, runtime state, task history
//! - `store`: durable state contract with ZooKeeper and in-memory backends
//! - `coordinator`: sequential-queue leader election
//! - `mesos`: wire protocol, HTTP client and the framework session
//! - `scheduler`: the offer-matching engine
//! - `reconciler`: periodic task state reconciliation
//! - `tuner`: SUPPRESS/REVIVE offer flow control
//! - `secrets`: read-through secret resolution
//! - `api`: HTTP control surface

pub mod api;
pub mod config;
pub mod coordinator;
pub mod mesos;
pub mod model;
pub mod reconciler;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod tuner;

pub use config::Config;
