//! Authorization orchestrator
//!
//! Resolves a session's pending paid-access order to a target device and
//! applies it at most once: the ledger deduplicates, the health tracker
//! gates attempts, transient failures reschedule through the job queue with
//! exponential backoff, and terminal failures surface stable codes.

use crate::access;
use crate::config::RelayConfig;
use crate::device::CommandExecutor;
use crate::health::HealthTracker;
use crate::jobs::{JobQueue, RetryPayload, AUTHORIZE_BACKOFF_MS};
use crate::ledger::{IdentityLedger, LastSeenInput, PendingAuthorization, PendingInput, PendingStatus};
use crate::metrics::Metrics;
use fleetrelay_common::{classify, now_ms, ErrorClass, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const PRUNE_COOLDOWN_MS: i64 = 60_000;
const FAILED_COOLDOWN_MS: i64 = 10 * 60 * 1000;

pub const CODE_SID_REQUIRED: &str = "sid_required";
pub const CODE_NO_PENDING_PAYMENT: &str = "no_pending_payment";
pub const CODE_ROUTER_NOT_RESOLVED: &str = "router_not_resolved";
pub const CODE_MISSING_IP_OR_MAC: &str = "missing_ip_or_mac";
pub const CODE_AUTHORIZATION_SCHEDULED: &str = "authorization_scheduled";
pub const CODE_AUTHORIZATION_RESCHEDULED: &str = "authorization_rescheduled";
pub const CODE_ROUTER_CIRCUIT_OPEN: &str = "router_circuit_open";
pub const CODE_AUTHORIZE_FAILED: &str = "authorize_failed";
pub const CODE_FAILED_AFTER_RETRIES: &str = "authorization_failed_after_retries";

/// Orchestrator response. Wire field names follow the upstream contract.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthorizeOutcome {
    pub ok: bool,
    pub authorized: bool,
    pub pending_authorization: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub idempotent: bool,
    #[serde(rename = "pedidoId", skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(rename = "routerId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(rename = "actionKey", skip_serializing_if = "Option::is_none")]
    pub action_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "retryInMs", skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(rename = "class", skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl AuthorizeOutcome {
    fn fail(code: &str) -> Self {
        Self {
            ok: false,
            code: Some(code.to_string()),
            ..Default::default()
        }
    }

    fn success(order_id: &str, device_id: &str, action_key: &str, idempotent: bool) -> Self {
        Self {
            ok: true,
            authorized: true,
            idempotent,
            order_id: Some(order_id.to_string()),
            device_id: Some(device_id.to_string()),
            action_key: Some(action_key.to_string()),
            ..Default::default()
        }
    }
}

/// Inbound refresh/authorize request
#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    pub sid: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub device_hint: Option<String>,
    pub identity: Option<String>,
}

/// Authorization orchestrator
pub struct Authorizer {
    config: Arc<RelayConfig>,
    ledger: IdentityLedger,
    health: HealthTracker,
    queue: JobQueue,
    executor: Arc<dyn CommandExecutor>,
    metrics: Metrics,
    last_prune_at: Mutex<i64>,
}

impl Authorizer {
    pub fn new(
        config: Arc<RelayConfig>,
        ledger: IdentityLedger,
        health: HealthTracker,
        queue: JobQueue,
        executor: Arc<dyn CommandExecutor>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            ledger,
            health,
            queue,
            executor,
            metrics,
            last_prune_at: Mutex::new(0),
        }
    }

    /// Main entry: record the session sighting, then apply its pending
    /// authorization if one exists and the device can be reached.
    pub async fn refresh_and_authorize(&self, req: RefreshRequest) -> Result<AuthorizeOutcome> {
        if req.sid.is_empty() {
            return Ok(AuthorizeOutcome::fail(CODE_SID_REQUIRED));
        }

        self.ledger.upsert_last_seen(
            &req.sid,
            LastSeenInput {
                ip: req.ip.clone(),
                mac: req.mac.clone(),
                device_id: req.device_hint.clone().or_else(|| req.identity.clone()),
                identity: req.identity.clone(),
            },
        )?;
        self.maybe_prune()?;

        let Some(pending) = self.ledger.get_pending(&req.sid)? else {
            return Ok(AuthorizeOutcome::fail(CODE_NO_PENDING_PAYMENT));
        };
        let pending = match self.reset_failed_if_eligible(&req.sid, pending, true)? {
            Ok(p) => p,
            Err(outcome) => return Ok(outcome),
        };

        let last_seen = self
            .ledger
            .get_identity(&req.sid)?
            .and_then(|rec| rec.last_seen);

        let device_id = req
            .device_hint
            .clone()
            .or_else(|| req.identity.clone())
            .or_else(|| pending.device_id.clone())
            .or_else(|| last_seen.as_ref().and_then(|s| s.device_id.clone()));
        let Some(device_id) = device_id else {
            return Ok(AuthorizeOutcome::fail(CODE_ROUTER_NOT_RESOLVED));
        };

        // validate the device exists in configuration before anything else
        if let Err(e) = self.config.device_node(&device_id) {
            warn!(sid = %req.sid, device = %device_id, code = e.code().unwrap_or(""), "device not in configuration");
            return Ok(AuthorizeOutcome::fail(e.code().unwrap_or(CODE_AUTHORIZE_FAILED)));
        }

        let ip = req
            .ip
            .as_deref()
            .and_then(access::normalize_ip)
            .or_else(|| last_seen.as_ref().and_then(|s| s.ip.clone()));
        let mac = req
            .mac
            .as_deref()
            .and_then(access::normalize_mac)
            .or_else(|| last_seen.as_ref().and_then(|s| s.mac.clone()));
        let (Some(ip), Some(mac)) = (ip, mac) else {
            return Ok(AuthorizeOutcome::fail(CODE_MISSING_IP_OR_MAC));
        };

        let action_key = action_key(&device_id, &pending.order_id);
        if self.ledger.is_applied(&req.sid, &action_key)? {
            return Ok(AuthorizeOutcome::success(
                &pending.order_id,
                &device_id,
                &action_key,
                true,
            ));
        }

        let payload = RetryPayload {
            sid: req.sid.clone(),
            order_id: Some(pending.order_id.clone()),
            device_id: Some(device_id.clone()),
            device_hint: req.device_hint.clone(),
            identity: req.identity.clone(),
            ip: Some(ip.clone()),
            mac: Some(mac.clone()),
            attempt: 0,
        };

        // circuit open: schedule and report how long the caller should wait
        if !self.health.can_attempt(&device_id) {
            self.queue.schedule_authorize_retry(&payload)?;
            let health = self.health.health(&device_id);
            let retry_ms = if health.open_until > 0 {
                (health.open_until - now_ms()).max(0)
            } else {
                AUTHORIZE_BACKOFF_MS[0]
            };
            self.metrics.inc("relay.authorize_pending_total");
            return Ok(AuthorizeOutcome {
                ok: true,
                pending_authorization: true,
                code: Some(CODE_AUTHORIZATION_SCHEDULED.to_string()),
                retry_in_ms: Some(retry_ms),
                ..Default::default()
            });
        }

        self.metrics.inc("relay.authorize_attempt_total");
        match self.attempt_device_command(&req.sid, &pending, &device_id, &ip, &mac, &action_key).await? {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let cls = classify(&err);
                self.health.record_failure(&device_id, &cls);
                self.metrics
                    .inc(&format!("relay.error_class_{}_{}", cls.class, cls.code));

                if cls.class == ErrorClass::Transient {
                    let delay = self.queue.schedule_authorize_retry(&payload)?;
                    self.metrics.inc("relay.authorize_pending_total");
                    return Ok(AuthorizeOutcome {
                        ok: true,
                        pending_authorization: true,
                        code: Some(CODE_AUTHORIZATION_SCHEDULED.to_string()),
                        retry_in_ms: Some(delay),
                        ..Default::default()
                    });
                }

                self.metrics.inc("relay.authorize_failed_total");
                Ok(AuthorizeOutcome {
                    ok: false,
                    code: Some(cls.code.clone()),
                    error_class: Some(cls.class.to_string()),
                    ..Default::default()
                })
            }
        }
    }

    /// Job-runner entry: repeat the authorization with the carried attempt
    /// counter, rescheduling transient failures until the backoff table is
    /// exhausted.
    pub async fn retry_authorize_pending(&self, payload: RetryPayload) -> Result<AuthorizeOutcome> {
        if payload.sid.is_empty() {
            return Ok(AuthorizeOutcome::fail(CODE_SID_REQUIRED));
        }
        let sid = payload.sid.clone();

        let Some(pending) = self.ledger.get_pending(&sid)? else {
            return Ok(AuthorizeOutcome::fail(CODE_NO_PENDING_PAYMENT));
        };
        let pending = match self.reset_failed_if_eligible(&sid, pending, false)? {
            Ok(p) => p,
            Err(outcome) => return Ok(outcome),
        };

        let last_seen = self.ledger.get_identity(&sid)?.and_then(|rec| rec.last_seen);

        let device_id = payload
            .device_hint
            .clone()
            .or_else(|| payload.identity.clone())
            .or_else(|| pending.device_id.clone())
            .or_else(|| payload.device_id.clone())
            .or_else(|| last_seen.as_ref().and_then(|s| s.device_id.clone()));
        let Some(device_id) = device_id else {
            return Ok(AuthorizeOutcome::fail(CODE_ROUTER_NOT_RESOLVED));
        };

        let ip = payload
            .ip
            .as_deref()
            .and_then(access::normalize_ip)
            .or_else(|| last_seen.as_ref().and_then(|s| s.ip.clone()));
        let mac = payload
            .mac
            .as_deref()
            .and_then(access::normalize_mac)
            .or_else(|| last_seen.as_ref().and_then(|s| s.mac.clone()));
        let (Some(ip), Some(mac)) = (ip, mac) else {
            return Ok(AuthorizeOutcome::fail(CODE_MISSING_IP_OR_MAC));
        };

        let action_key = action_key(&device_id, &pending.order_id);
        if self.ledger.is_applied(&sid, &action_key)? {
            return Ok(AuthorizeOutcome::success(
                &pending.order_id,
                &device_id,
                &action_key,
                true,
            ));
        }

        // respect the circuit: requeue at the same attempt
        if !self.health.can_attempt(&device_id) {
            self.queue.schedule_authorize_retry(&payload)?;
            self.metrics.inc("relay.authorize_pending_total");
            return Ok(AuthorizeOutcome {
                ok: false,
                pending_authorization: true,
                code: Some(CODE_ROUTER_CIRCUIT_OPEN.to_string()),
                ..Default::default()
            });
        }

        self.metrics.inc("relay.authorize_attempt_total");
        match self.attempt_device_command(&sid, &pending, &device_id, &ip, &mac, &action_key).await? {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let cls = classify(&err);
                self.health.record_failure(&device_id, &cls);
                self.metrics
                    .inc(&format!("relay.error_class_{}_{}", cls.class, cls.code));

                if cls.class == ErrorClass::Transient {
                    let next_attempt = payload.attempt + 1;
                    if next_attempt as usize >= AUTHORIZE_BACKOFF_MS.len() {
                        self.ledger.mark_pending_failed(
                            &sid,
                            &pending.order_id,
                            CODE_FAILED_AFTER_RETRIES,
                            next_attempt,
                            Some(now_ms() + FAILED_COOLDOWN_MS),
                        )?;
                        self.metrics.inc("relay.authorize_failed_total");
                        warn!(%sid, device = %device_id, order = %pending.order_id, "authorization retries exhausted");
                        return Ok(AuthorizeOutcome {
                            ok: false,
                            code: Some(CODE_FAILED_AFTER_RETRIES.to_string()),
                            retry_in_ms: Some(FAILED_COOLDOWN_MS),
                            ..Default::default()
                        });
                    }
                    let next = RetryPayload {
                        attempt: next_attempt,
                        ..payload
                    };
                    self.queue.schedule_authorize_retry(&next)?;
                    self.metrics.inc("relay.authorize_pending_total");
                    return Ok(AuthorizeOutcome {
                        ok: false,
                        pending_authorization: true,
                        code: Some(CODE_AUTHORIZATION_RESCHEDULED.to_string()),
                        attempt: Some(next_attempt),
                        ..Default::default()
                    });
                }

                self.metrics.inc("relay.authorize_failed_total");
                Ok(AuthorizeOutcome {
                    ok: false,
                    code: Some(cls.code.clone()),
                    error_class: Some(cls.class.to_string()),
                    ..Default::default()
                })
            }
        }
    }

    /// Revoke paid access for an ip/mac pair on a device
    pub async fn revoke_session(
        &self,
        device_id: &str,
        ip: Option<&str>,
        mac: Option<&str>,
    ) -> Result<AuthorizeOutcome> {
        let ip = ip.and_then(access::normalize_ip);
        let mac = mac.and_then(access::normalize_mac);
        if device_id.is_empty() || (ip.is_none() && mac.is_none()) {
            return Ok(AuthorizeOutcome::fail(CODE_MISSING_IP_OR_MAC));
        }
        let node = match self.config.device_node(device_id) {
            Ok(n) => n,
            Err(e) => return Ok(AuthorizeOutcome::fail(e.code().unwrap_or(CODE_AUTHORIZE_FAILED))),
        };
        let commands =
            access::build_revoke_commands(&self.config.paid_access, ip.as_deref(), mac.as_deref());
        match self.executor.run(node, &commands).await {
            Ok(report) if report.ok => {
                self.health.record_success(device_id);
                info!(device = %device_id, "paid access revoked");
                Ok(AuthorizeOutcome {
                    ok: true,
                    device_id: Some(device_id.to_string()),
                    ..Default::default()
                })
            }
            Ok(_) => Ok(AuthorizeOutcome::fail(CODE_AUTHORIZE_FAILED)),
            Err(err) => {
                let cls = classify(&err);
                self.health.record_failure(device_id, &cls);
                Ok(AuthorizeOutcome {
                    ok: false,
                    code: Some(cls.code.clone()),
                    error_class: Some(cls.class.to_string()),
                    ..Default::default()
                })
            }
        }
    }

    /// Run the authorize command batch. The outer Result is a ledger/store
    /// failure; the inner one separates a completed success from a device
    /// error that still needs classification.
    async fn attempt_device_command(
        &self,
        sid: &str,
        pending: &PendingAuthorization,
        device_id: &str,
        ip: &str,
        mac: &str,
        action_key: &str,
    ) -> Result<std::result::Result<AuthorizeOutcome, fleetrelay_common::Error>> {
        let node = match self.config.device_node(device_id) {
            Ok(n) => n,
            Err(e) => return Ok(Err(e)),
        };
        let commands =
            access::build_authorize_commands(&self.config.paid_access, &pending.order_id, ip, mac);
        match self.executor.run(node, &commands).await {
            Ok(report) if report.ok => {
                self.ledger.mark_applied(
                    sid,
                    action_key,
                    serde_json::json!({ "pedidoId": pending.order_id, "routerId": device_id }),
                )?;
                self.ledger.mark_pending_applied(sid, &pending.order_id)?;
                self.health.record_success(device_id);
                self.metrics.inc("relay.authorize_success_total");
                info!(%sid, device = %device_id, order = %pending.order_id, "authorization applied");
                Ok(Ok(AuthorizeOutcome::success(
                    &pending.order_id,
                    device_id,
                    action_key,
                    false,
                )))
            }
            Ok(_) => {
                self.metrics.inc("relay.authorize_failed_total");
                Ok(Ok(AuthorizeOutcome::fail(CODE_AUTHORIZE_FAILED)))
            }
            Err(err) => Ok(Err(err)),
        }
    }

    /// A FAILED pending entry inside its cooldown reports the stored code
    /// and remaining wait; past the cooldown it resets to PENDING.
    fn reset_failed_if_eligible(
        &self,
        sid: &str,
        pending: PendingAuthorization,
        refresh_entry: bool,
    ) -> Result<std::result::Result<PendingAuthorization, AuthorizeOutcome>> {
        if pending.status != PendingStatus::Failed {
            return Ok(Ok(pending));
        }
        let now = now_ms();
        if let Some(next_at) = pending.next_eligible_at {
            let wait = next_at - now;
            if wait > 0 {
                let code = pending
                    .fail_code
                    .clone()
                    .unwrap_or_else(|| CODE_FAILED_AFTER_RETRIES.to_string());
                // the refresh entry reports the wait as a soft state, the
                // retry entry as a failure
                return Ok(Err(AuthorizeOutcome {
                    ok: refresh_entry,
                    code: Some(code),
                    retry_in_ms: Some(wait),
                    ..Default::default()
                }));
            }
        }
        let reset = self.ledger.mark_pending(
            sid,
            PendingInput {
                order_id: pending.order_id.clone(),
                plan_id: pending.plan_id.clone(),
                device_id: pending.device_id.clone(),
                expires_at: pending.expires_at,
                status: Some(PendingStatus::Pending),
                attempts: pending.attempts,
                fail_code: None,
                next_eligible_at: None,
            },
        )?;
        Ok(Ok(reset))
    }

    fn maybe_prune(&self) -> Result<()> {
        let now = now_ms();
        {
            let mut last = self.last_prune_at.lock();
            if now - *last < PRUNE_COOLDOWN_MS {
                return Ok(());
            }
            *last = now;
        }
        self.ledger.prune()?;
        Ok(())
    }
}

fn action_key(device_id: &str, order_id: &str) -> String {
    format!("{}:{}:AUTHORIZE", device_id, order_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceNode, RelayConfig};
    use crate::device::{CommandError, ExecReport};
    use async_trait::async_trait;
    use fleetrelay_common::error::codes;
    use fleetrelay_common::{Error, Store};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted executor: pops one result per run call
    struct MockExecutor {
        script: StdMutex<VecDeque<Result<ExecReport>>>,
        calls: StdMutex<Vec<Vec<String>>>,
    }

    impl MockExecutor {
        fn new(script: Vec<Result<ExecReport>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn ok_report() -> Result<ExecReport> {
            Ok(ExecReport {
                ok: true,
                host: "10.200.1.10".to_string(),
                dry_run: false,
                errors: Vec::new(),
            })
        }

        fn failed_report() -> Result<ExecReport> {
            Ok(ExecReport {
                ok: false,
                host: "10.200.1.10".to_string(),
                dry_run: false,
                errors: vec![CommandError {
                    cmd: "#1".to_string(),
                    code: codes::DEVICE_UNKNOWN_ERROR.to_string(),
                    message: "rejected".to_string(),
                }],
            })
        }

        fn timeout() -> Result<ExecReport> {
            Err(Error::device(codes::DEVICE_TIMEOUT, "connect timed out"))
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn run(&self, _node: &DeviceNode, commands: &[String]) -> Result<ExecReport> {
            self.calls.lock().unwrap().push(commands.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(Self::ok_report)
        }
    }

    struct Harness {
        authorizer: Authorizer,
        ledger: IdentityLedger,
        queue: JobQueue,
        executor: Arc<MockExecutor>,
        health: HealthTracker,
    }

    fn harness(script: Vec<Result<ExecReport>>) -> Harness {
        let mut config = RelayConfig::default();
        config.devices.push(DeviceNode {
            id: "D1".to_string(),
            host: "10.200.1.10".to_string(),
            user: "relay".to_string(),
            pass: "secret".to_string(),
            port: 8728,
            timeout_ms: 8000,
        });
        let store = Store::open_memory().unwrap();
        let ledger = IdentityLedger::new(store.clone());
        let queue = JobQueue::new(store);
        let metrics = Metrics::new();
        let health = HealthTracker::new(metrics.clone());
        let executor = MockExecutor::new(script);
        let authorizer = Authorizer::new(
            Arc::new(config),
            ledger.clone(),
            health.clone(),
            queue.clone(),
            executor.clone(),
            metrics,
        );
        Harness {
            authorizer,
            ledger,
            queue,
            executor,
            health,
        }
    }

    fn mark_pending(h: &Harness, order: &str, device: Option<&str>) {
        h.ledger
            .mark_pending(
                "sid-1",
                PendingInput {
                    order_id: order.to_string(),
                    device_id: device.map(String::from),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn refresh_req() -> RefreshRequest {
        RefreshRequest {
            sid: "sid-1".to_string(),
            ip: Some("10.0.0.5".to_string()),
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_pending_payment() {
        let h = harness(vec![]);
        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.code.as_deref(), Some(CODE_NO_PENDING_PAYMENT));
    }

    #[tokio::test]
    async fn test_successful_authorization_records_action() {
        let h = harness(vec![MockExecutor::ok_report()]);
        mark_pending(&h, "P1", Some("D1"));

        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(out.authorized);
        assert!(!out.idempotent);
        assert_eq!(out.order_id.as_deref(), Some("P1"));
        assert_eq!(out.device_id.as_deref(), Some("D1"));
        assert!(h.ledger.is_applied("sid-1", "D1:P1:AUTHORIZE").unwrap());
        // pending moved to APPLIED
        assert!(h.ledger.get_pending("sid-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_call_is_idempotent_without_device_contact() {
        let h = harness(vec![MockExecutor::ok_report()]);
        mark_pending(&h, "P1", Some("D1"));

        h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        // re-arm the pending entry as the webhook would after a duplicate event
        mark_pending(&h, "P1", Some("D1"));

        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(out.authorized);
        assert!(out.idempotent);
        assert_eq!(h.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let h = harness(vec![MockExecutor::timeout()]);
        mark_pending(&h, "P1", Some("D1"));

        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(!out.authorized);
        assert!(out.pending_authorization);
        assert_eq!(out.code.as_deref(), Some(CODE_AUTHORIZATION_SCHEDULED));
        let retry_ms = out.retry_in_ms.unwrap();
        assert!((2000..=2400).contains(&retry_ms), "retry_ms={}", retry_ms);

        // a job with attempt 0 is waiting
        let due = h.queue.claim_due(now_ms() + retry_ms, 10).unwrap();
        assert_eq!(due.len(), 1);
        let payload: RetryPayload = serde_json::from_value(due[0].payload.clone()).unwrap();
        assert_eq!(payload.attempt, 0);

        // health degraded but no circuit
        assert!(h.health.can_attempt("D1"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal_and_opens_circuit() {
        let h = harness(vec![Err(Error::device(
            codes::DEVICE_AUTH_FAILED,
            "invalid user",
        ))]);
        mark_pending(&h, "P1", Some("D1"));

        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.code.as_deref(), Some(codes::DEVICE_AUTH_FAILED));
        assert!(!h.health.can_attempt("D1"));
        // nothing scheduled for non-retryable failures
        assert!(h.queue.claim_due(now_ms() + 300_000, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_circuit_schedules_without_device_contact() {
        let h = harness(vec![]);
        mark_pending(&h, "P1", Some("D1"));
        let cls = classify(&Error::device(codes::DEVICE_AUTH_FAILED, "invalid user"));
        h.health.record_failure("D1", &cls);

        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(out.pending_authorization);
        assert_eq!(out.code.as_deref(), Some(CODE_AUTHORIZATION_SCHEDULED));
        // remaining open window, not the backoff delay
        assert!(out.retry_in_ms.unwrap() > 14 * 60 * 1000);
        assert_eq!(h.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_router_not_resolved_and_missing_identity() {
        let h = harness(vec![]);
        mark_pending(&h, "P1", None);
        let out = h
            .authorizer
            .refresh_and_authorize(RefreshRequest {
                sid: "sid-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.code.as_deref(), Some(CODE_ROUTER_NOT_RESOLVED));

        mark_pending(&h, "P1", Some("D1"));
        let out = h
            .authorizer
            .refresh_and_authorize(RefreshRequest {
                sid: "sid-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.code.as_deref(), Some(CODE_MISSING_IP_OR_MAC));
    }

    #[tokio::test]
    async fn test_unknown_device_fails_with_setup_code() {
        let h = harness(vec![]);
        mark_pending(&h, "P1", Some("D9"));
        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.code.as_deref(), Some(codes::DEVICE_NODE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_retry_reschedules_and_increments_attempt() {
        let h = harness(vec![MockExecutor::timeout()]);
        mark_pending(&h, "P1", Some("D1"));

        let out = h
            .authorizer
            .retry_authorize_pending(RetryPayload {
                sid: "sid-1".to_string(),
                ip: Some("10.0.0.5".to_string()),
                mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
                attempt: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!out.ok);
        assert!(out.pending_authorization);
        assert_eq!(out.code.as_deref(), Some(CODE_AUTHORIZATION_RESCHEDULED));
        assert_eq!(out.attempt, Some(3));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed_with_cooldown() {
        let h = harness(vec![MockExecutor::timeout(), MockExecutor::ok_report()]);
        mark_pending(&h, "P1", Some("D1"));

        let out = h
            .authorizer
            .retry_authorize_pending(RetryPayload {
                sid: "sid-1".to_string(),
                ip: Some("10.0.0.5".to_string()),
                mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
                attempt: 7,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!out.ok);
        assert_eq!(out.code.as_deref(), Some(CODE_FAILED_AFTER_RETRIES));
        assert_eq!(out.retry_in_ms, Some(FAILED_COOLDOWN_MS));

        let pending = h.ledger.get_pending("sid-1").unwrap().unwrap();
        assert_eq!(pending.status, PendingStatus::Failed);
        assert_eq!(pending.attempts, 8);
        let next_at = pending.next_eligible_at.unwrap();
        let expected = now_ms() + FAILED_COOLDOWN_MS;
        assert!((expected - next_at).abs() < 5_000);

        // inside the cooldown a refresh reports the stored code and wait
        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(!out.authorized);
        assert!(!out.pending_authorization);
        assert_eq!(out.code.as_deref(), Some(CODE_FAILED_AFTER_RETRIES));
        assert!(out.retry_in_ms.unwrap() > 0);

        // past the cooldown the entry resets and the next attempt proceeds
        h.ledger
            .mark_pending_failed("sid-1", "P1", CODE_FAILED_AFTER_RETRIES, 8, Some(now_ms() - 1))
            .unwrap();
        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(out.ok);
        assert!(out.authorized);
    }

    #[tokio::test]
    async fn test_failed_device_report_is_terminal() {
        let h = harness(vec![MockExecutor::failed_report()]);
        mark_pending(&h, "P1", Some("D1"));
        let out = h.authorizer.refresh_and_authorize(refresh_req()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.code.as_deref(), Some(CODE_AUTHORIZE_FAILED));
    }

    #[tokio::test]
    async fn test_revoke_session_requires_identity() {
        let h = harness(vec![MockExecutor::ok_report()]);
        let out = h.authorizer.revoke_session("D1", None, None).await.unwrap();
        assert_eq!(out.code.as_deref(), Some(CODE_MISSING_IP_OR_MAC));

        let out = h
            .authorizer
            .revoke_session("D1", Some("10.0.0.5"), None)
            .await
            .unwrap();
        assert!(out.ok);
        assert_eq!(h.executor.call_count(), 1);
        // revoke batch carries only the address-list removal
        let calls = h.executor.calls.lock().unwrap();
        assert_eq!(calls[0].len(), 1);
    }
}
