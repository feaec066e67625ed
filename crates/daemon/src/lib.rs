//! Fleetrelay daemon library
//!
//! The operational core of the relay: device executor, health tracking,
//! identity ledger, authorization orchestration, delayed retries and the
//! mesh reconciliation engine. The binary wires these together; the webhook
//! transport layer consumes [`authorize::Authorizer`] and the common
//! request verifier directly.

pub mod access;
pub mod authorize;
pub mod config;
pub mod device;
pub mod health;
pub mod jobs;
pub mod ledger;
pub mod mesh;
pub mod metrics;
pub mod reconciler;

pub use authorize::{Authorizer, RefreshRequest};
pub use config::RelayConfig;
pub use health::HealthTracker;
pub use jobs::JobQueue;
pub use ledger::IdentityLedger;
pub use metrics::Metrics;
pub use reconciler::Reconciler;
