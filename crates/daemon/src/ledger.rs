//! Idempotent per-session ledger
//!
//! One durable document per session: the last-observed network identity, at
//! most one pending authorization, and a bounded history of applied action
//! keys. The applied list is a best-effort dedupe set, not an audit log.
//!
//! Every mutation runs a full read-modify-write cycle under one ledger-wide
//! lock; concurrent sessions are serialized rather than interleaved.

use fleetrelay_common::{now_ms, Error, Result, Store};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const LAST_SEEN_TTL_MS: i64 = 24 * 60 * 60 * 1000;
const APPLIED_MAX_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1000;
const APPLIED_MAX_ITEMS: usize = 50;

/// Pending authorization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingStatus {
    Pending,
    Failed,
    Applied,
}

/// Per-session ledger document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub sid: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_seen: Option<LastSeen>,
    #[serde(default)]
    pub pending: Option<PendingAuthorization>,
    #[serde(default)]
    pub applied: Vec<AppliedAction>,
}

/// Last-observed network identity for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastSeen {
    pub ip: Option<String>,
    pub mac: Option<String>,
    #[serde(rename = "routerId")]
    pub device_id: Option<String>,
    pub identity: Option<String>,
    pub ts: i64,
}

/// The session's single pending authorization intent.
/// Wire field names follow the upstream payment system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    #[serde(rename = "pedidoId")]
    pub order_id: String,
    #[serde(rename = "planId")]
    pub plan_id: Option<String>,
    #[serde(rename = "routerId")]
    pub device_id: Option<String>,
    pub expires_at: Option<i64>,
    pub marked_at: i64,
    pub status: PendingStatus,
    pub attempts: u32,
    pub fail_code: Option<String>,
    pub failed_at: Option<i64>,
    pub next_eligible_at: Option<i64>,
    pub applied_at: Option<i64>,
}

/// One applied action key with its context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedAction {
    pub action_key: String,
    pub meta: serde_json::Value,
    pub at: i64,
}

/// Input for marking a pending authorization
#[derive(Debug, Clone, Default)]
pub struct PendingInput {
    pub order_id: String,
    pub plan_id: Option<String>,
    pub device_id: Option<String>,
    pub expires_at: Option<i64>,
    pub status: Option<PendingStatus>,
    pub attempts: u32,
    pub fail_code: Option<String>,
    pub next_eligible_at: Option<i64>,
}

/// Input for updating a session's last-seen snapshot
#[derive(Debug, Clone, Default)]
pub struct LastSeenInput {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub device_id: Option<String>,
    pub identity: Option<String>,
}

/// Durable session ledger over the shared store
#[derive(Clone)]
pub struct IdentityLedger {
    store: Store,
    write_lock: Arc<Mutex<()>>,
}

impl IdentityLedger {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn get_identity(&self, sid: &str) -> Result<Option<IdentityRecord>> {
        match self.store.session_doc(sid)? {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// The session's pending authorization, unless already applied
    pub fn get_pending(&self, sid: &str) -> Result<Option<PendingAuthorization>> {
        Ok(self
            .get_identity(sid)?
            .and_then(|rec| rec.pending)
            .filter(|p| p.status != PendingStatus::Applied))
    }

    /// Merge new sighting data into the session's last-seen snapshot,
    /// creating the session record on first sight
    pub fn upsert_last_seen(&self, sid: &str, ctx: LastSeenInput) -> Result<IdentityRecord> {
        if sid.is_empty() {
            return Err(Error::InvalidConfig("sid required".to_string()));
        }
        let _guard = self.write_lock.lock();
        let now = now_ms();
        let mut record = self.load_or_new(sid, now)?;
        let previous = record.last_seen.take();
        let device_id = ctx
            .device_id
            .or_else(|| ctx.identity.clone())
            .or_else(|| previous.as_ref().and_then(|p| p.device_id.clone()));
        record.last_seen = Some(LastSeen {
            ip: ctx.ip.or_else(|| previous.as_ref().and_then(|p| p.ip.clone())),
            mac: ctx.mac.or_else(|| previous.as_ref().and_then(|p| p.mac.clone())),
            device_id,
            identity: ctx
                .identity
                .or_else(|| previous.as_ref().and_then(|p| p.identity.clone())),
            ts: now,
        });
        record.updated_at = now;
        self.save(&record)?;
        Ok(record)
    }

    /// Replace the session's single pending entry
    pub fn mark_pending(&self, sid: &str, input: PendingInput) -> Result<PendingAuthorization> {
        if sid.is_empty() {
            return Err(Error::InvalidConfig("sid required".to_string()));
        }
        if input.order_id.is_empty() {
            return Err(Error::InvalidConfig("order id required".to_string()));
        }
        let _guard = self.write_lock.lock();
        let now = now_ms();
        let mut record = self.load_or_new(sid, now)?;
        let pending = PendingAuthorization {
            order_id: input.order_id,
            plan_id: input.plan_id,
            device_id: input.device_id,
            expires_at: input.expires_at,
            marked_at: now,
            status: input.status.unwrap_or(PendingStatus::Pending),
            attempts: input.attempts,
            fail_code: input.fail_code,
            failed_at: None,
            next_eligible_at: input.next_eligible_at,
            applied_at: None,
        };
        record.pending = Some(pending.clone());
        record.updated_at = now;
        self.save(&record)?;
        Ok(pending)
    }

    /// Transition the matching pending entry to FAILED. Returns false when
    /// no pending entry matches the order id.
    pub fn mark_pending_failed(
        &self,
        sid: &str,
        order_id: &str,
        fail_code: &str,
        attempts: u32,
        next_eligible_at: Option<i64>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let now = now_ms();
        let Some(mut record) = self.get_identity(sid)? else {
            return Ok(false);
        };
        let Some(pending) = record.pending.as_mut().filter(|p| p.order_id == order_id) else {
            return Ok(false);
        };
        pending.status = PendingStatus::Failed;
        pending.fail_code = Some(fail_code.to_string());
        pending.failed_at = Some(now);
        pending.attempts = attempts;
        pending.next_eligible_at = next_eligible_at;
        record.updated_at = now;
        self.save(&record)?;
        Ok(true)
    }

    /// Transition the matching pending entry to APPLIED, clearing failure
    /// fields. Returns false when no pending entry matches.
    pub fn mark_pending_applied(&self, sid: &str, order_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let now = now_ms();
        let Some(mut record) = self.get_identity(sid)? else {
            return Ok(false);
        };
        let Some(pending) = record.pending.as_mut().filter(|p| p.order_id == order_id) else {
            return Ok(false);
        };
        pending.status = PendingStatus::Applied;
        pending.applied_at = Some(now);
        pending.fail_code = None;
        pending.failed_at = None;
        pending.next_eligible_at = None;
        record.updated_at = now;
        self.save(&record)?;
        Ok(true)
    }

    /// Has this action already been applied for the session?
    pub fn is_applied(&self, sid: &str, action_key: &str) -> Result<bool> {
        if sid.is_empty() || action_key.is_empty() {
            return Ok(false);
        }
        Ok(self
            .get_identity(sid)?
            .map(|rec| rec.applied.iter().any(|a| a.action_key == action_key))
            .unwrap_or(false))
    }

    /// Record an applied action key. The session must already exist: a
    /// last-seen or pending write always precedes application.
    pub fn mark_applied(&self, sid: &str, action_key: &str, meta: serde_json::Value) -> Result<()> {
        if sid.is_empty() || action_key.is_empty() {
            return Err(Error::InvalidConfig("sid and action key required".to_string()));
        }
        let _guard = self.write_lock.lock();
        let now = now_ms();
        let mut record = self.get_identity(sid)?.ok_or_else(|| Error::NotFound {
            kind: "session".to_string(),
            id: sid.to_string(),
        })?;
        record.applied.push(AppliedAction {
            action_key: action_key.to_string(),
            meta,
            at: now,
        });
        trim_applied(&mut record.applied, now);
        record.updated_at = now;
        self.save(&record)
    }

    /// Drop expired last-seen snapshots and pending entries, trim applied
    /// histories. Returns the number of sessions touched.
    pub fn prune(&self) -> Result<usize> {
        self.prune_at(now_ms())
    }

    pub fn prune_at(&self, now: i64) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let docs = self.store.all_session_docs()?;
        let count = docs.len();
        for (sid, doc) in docs {
            let mut record: IdentityRecord = match serde_json::from_str(&doc) {
                Ok(rec) => rec,
                Err(e) => {
                    debug!(%sid, error = %e, "dropping unreadable session document");
                    continue;
                }
            };
            if let Some(seen) = &record.last_seen {
                if now - seen.ts > LAST_SEEN_TTL_MS {
                    record.last_seen = None;
                }
            }
            if let Some(pending) = &record.pending {
                if pending.expires_at.map(|exp| exp < now).unwrap_or(false) {
                    record.pending = None;
                }
            }
            trim_applied(&mut record.applied, now);
            record.updated_at = now;
            self.save(&record)?;
        }
        Ok(count)
    }

    fn load_or_new(&self, sid: &str, now: i64) -> Result<IdentityRecord> {
        Ok(self.get_identity(sid)?.unwrap_or(IdentityRecord {
            sid: sid.to_string(),
            created_at: now,
            updated_at: now,
            last_seen: None,
            pending: None,
            applied: Vec::new(),
        }))
    }

    fn save(&self, record: &IdentityRecord) -> Result<()> {
        self.store
            .put_session_doc(&record.sid, &serde_json::to_string(record)?)
    }
}

fn trim_applied(applied: &mut Vec<AppliedAction>, now: i64) {
    applied.retain(|a| now - a.at <= APPLIED_MAX_AGE_MS);
    if applied.len() > APPLIED_MAX_ITEMS {
        let drop = applied.len() - APPLIED_MAX_ITEMS;
        applied.drain(..drop);
    }
}
