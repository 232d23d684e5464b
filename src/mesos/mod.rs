//! Mesos v1 scheduler API integration.
//!
//! - `proto`: wire types for calls and events.
//! - `resources`: offer resource arithmetic.
//! - `client`: HTTP client and the RecordIO event stream.
//! - `controller`: the framework session run under a leadership scope.

pub mod client;
pub mod controller;
pub mod proto;
pub mod resources;

pub use client::{MesosClient, MesosClientError};
pub use controller::run_framework;
