//! Delayed job queue for authorization retries
//!
//! Jobs are durable `{id, type, payload, run_at}` rows consumed exactly once.
//! The poll loop claims due jobs and dispatches `AUTHORIZE_PENDING` payloads
//! back into the orchestrator.

use crate::authorize::Authorizer;
use fleetrelay_common::db::Job;
use fleetrelay_common::{now_ms, Result, Store};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const JOB_TYPE_AUTHORIZE_PENDING: &str = "AUTHORIZE_PENDING";

/// Retry delays by attempt index, capped at the last element
pub const AUTHORIZE_BACKOFF_MS: [i64; 8] = [2000, 5000, 10000, 20000, 40000, 60000, 120000, 240000];

/// Backoff delay for an attempt: table value plus up to 20% random jitter
pub fn backoff_delay_ms(attempt: u32) -> i64 {
    let idx = (attempt as usize).min(AUTHORIZE_BACKOFF_MS.len() - 1);
    let base = AUTHORIZE_BACKOFF_MS[idx];
    let jitter = rand::thread_rng().gen_range(0..=base / 5);
    base + jitter
}

/// Payload carried by an authorization retry job.
/// Wire field names follow the upstream payment system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPayload {
    pub sid: String,
    #[serde(rename = "pedidoId", default)]
    pub order_id: Option<String>,
    #[serde(rename = "routerId", default)]
    pub device_id: Option<String>,
    #[serde(rename = "routerHint", default)]
    pub device_hint: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

/// Durable delayed-execution queue over the shared store
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Enqueue an authorization retry after the attempt's backoff delay.
    /// Returns the scheduled delay in milliseconds.
    pub fn schedule_authorize_retry(&self, payload: &RetryPayload) -> Result<i64> {
        let delay = backoff_delay_ms(payload.attempt);
        let now = now_ms();
        let job = Job {
            id: format!("auth-{}-{}", payload.sid, Uuid::new_v4()),
            job_type: JOB_TYPE_AUTHORIZE_PENDING.to_string(),
            payload: serde_json::to_value(payload)?,
            run_at: now + delay,
            created_at: now,
        };
        self.store.add_job(&job)?;
        debug!(sid = %payload.sid, attempt = payload.attempt, delay_ms = delay, "authorization retry scheduled");
        Ok(delay)
    }

    pub fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
        self.store.claim_due_jobs(now, limit)
    }
}

/// Poll loop draining due jobs into the orchestrator
pub async fn run_job_loop(queue: JobQueue, authorizer: Arc<Authorizer>, poll_ms: u64) {
    info!(poll_ms, "job runner started");
    loop {
        match queue.claim_due(now_ms(), 32) {
            Ok(jobs) => {
                for job in jobs {
                    if job.job_type != JOB_TYPE_AUTHORIZE_PENDING {
                        error!(id = %job.id, job_type = %job.job_type, "unknown job type dropped");
                        continue;
                    }
                    let payload: RetryPayload = match serde_json::from_value(job.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(id = %job.id, error = %e, "unreadable job payload dropped");
                            continue;
                        }
                    };
                    match authorizer.retry_authorize_pending(payload).await {
                        Ok(outcome) => {
                            debug!(id = %job.id, ok = outcome.ok, code = outcome.code.as_deref().unwrap_or(""), "retry job finished")
                        }
                        Err(e) => error!(id = %job.id, error = %e, "retry job errored"),
                    }
                }
            }
            Err(e) => error!(error = %e, "job claim failed"),
        }
        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
}
