//! SQLite store for fleetrelay control-plane state
//!
//! Tables:
//! - tenants: isolation boundaries, `default` always present
//! - devices: router fleet, keyed by business id, one per mesh public key
//! - peers: mesh entries, each owned by exactly one device
//! - bindings: mesh identity -> device address mappings
//! - jobs: delayed-execution queue entries
//! - identity_sessions: per-session ledger documents

use crate::types::*;
use crate::{now_ms, Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Store wrapper. A single guarded connection gives every read-modify-write
/// cycle a global order.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!("Opened store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Expose the guarded connection for subsystems managing their own tables
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                bus_id TEXT NOT NULL UNIQUE,
                name TEXT,
                device_addr TEXT,
                mesh_public_key TEXT NOT NULL UNIQUE,
                mesh_addr TEXT NOT NULL,
                endpoint TEXT,
                desired_state TEXT NOT NULL DEFAULT 'PENDING',
                actual_status TEXT,
                last_handshake_at INTEGER,
                last_seen_at INTEGER,
                bytes_rx INTEGER,
                bytes_tx INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(tenant_id) REFERENCES tenants(id)
            );
            CREATE INDEX IF NOT EXISTS idx_devices_tenant ON devices(tenant_id);

            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                allowed_ips TEXT NOT NULL,
                endpoint TEXT,
                keepalive INTEGER,
                desired_state TEXT NOT NULL DEFAULT 'PENDING',
                actual_status TEXT,
                last_handshake_at INTEGER,
                bytes_rx INTEGER,
                bytes_tx INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(device_id) REFERENCES devices(id)
            );
            CREATE INDEX IF NOT EXISTS idx_peers_device ON peers(device_id);

            CREATE TABLE IF NOT EXISTS bindings (
                public_key TEXT PRIMARY KEY,
                bus_id TEXT NOT NULL,
                device_addr TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                run_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_run_at ON jobs(run_at);

            CREATE TABLE IF NOT EXISTS identity_sessions (
                sid TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("Store schema initialized");
        Ok(())
    }

    // ========================================================================
    // Tenants
    // ========================================================================

    /// Get the default tenant, creating it on first use
    pub fn default_tenant(&self) -> Result<Tenant> {
        let conn = self.conn.lock();
        if let Some(t) = Self::tenant_by_slug_locked(&conn, DEFAULT_TENANT_SLUG)? {
            return Ok(t);
        }
        let tenant = Tenant {
            id: new_id(),
            slug: DEFAULT_TENANT_SLUG.to_string(),
            name: "Default".to_string(),
            created_at: now_ms(),
        };
        conn.execute(
            "INSERT INTO tenants (id, slug, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant.id, tenant.slug, tenant.name, tenant.created_at],
        )?;
        info!("Created default tenant {}", tenant.id);
        Ok(tenant)
    }

    pub fn create_tenant(&self, slug: &str, name: &str) -> Result<Tenant> {
        let tenant = Tenant {
            id: new_id(),
            slug: slug.to_string(),
            name: name.to_string(),
            created_at: now_ms(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, slug, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant.id, tenant.slug, tenant.name, tenant.created_at],
        )?;
        Ok(tenant)
    }

    pub fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock();
        Self::tenant_by_slug_locked(&conn, slug)
    }

    fn tenant_by_slug_locked(conn: &Connection, slug: &str) -> Result<Option<Tenant>> {
        let row = conn
            .query_row(
                "SELECT id, slug, name, created_at FROM tenants WHERE slug = ?1",
                params![slug],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        slug: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// List tenants in creation order, falling back to the default tenant
    /// when the table is empty
    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT id, slug, name, created_at FROM tenants ORDER BY created_at ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        if !tenants.is_empty() {
            return Ok(tenants);
        }
        Ok(vec![self.default_tenant()?])
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Upsert a device by business id. Absent fields keep their stored
    /// values; new rows get placeholder mesh identity until provisioned.
    pub fn upsert_device(&self, up: DeviceUpsert) -> Result<Device> {
        if up.bus_id.is_empty() {
            return Err(Error::InvalidConfig("bus_id is required".to_string()));
        }
        let tenant_id = match &up.tenant_id {
            Some(id) => id.clone(),
            None => self.default_tenant()?.id,
        };
        let now = now_ms();
        let conn = self.conn.lock();
        let existing = Self::device_by_bus_id_locked(&conn, &up.bus_id)?;
        match existing {
            Some(dev) => {
                conn.execute(
                    "UPDATE devices SET
                        tenant_id = COALESCE(?1, tenant_id),
                        name = COALESCE(?2, name),
                        device_addr = COALESCE(?3, device_addr),
                        mesh_public_key = COALESCE(?4, mesh_public_key),
                        mesh_addr = COALESCE(?5, mesh_addr),
                        endpoint = COALESCE(?6, endpoint),
                        desired_state = COALESCE(?7, desired_state),
                        actual_status = COALESCE(?8, actual_status),
                        updated_at = ?9
                     WHERE id = ?10",
                    params![
                        up.tenant_id,
                        up.name,
                        up.device_addr,
                        up.mesh_public_key,
                        up.mesh_addr,
                        up.endpoint,
                        up.desired_state.map(|s| s.to_string()),
                        up.actual_status.map(|s| s.to_string()),
                        now,
                        dev.id,
                    ],
                )?;
                Self::device_by_bus_id_locked(&conn, &up.bus_id)?.ok_or_else(|| Error::NotFound {
                    kind: "device".to_string(),
                    id: up.bus_id.clone(),
                })
            }
            None => {
                let device = Device {
                    id: new_id(),
                    tenant_id,
                    bus_id: up.bus_id.clone(),
                    name: up.name,
                    device_addr: up.device_addr,
                    mesh_public_key: up
                        .mesh_public_key
                        .unwrap_or_else(|| placeholder_key(&up.bus_id)),
                    mesh_addr: up
                        .mesh_addr
                        .unwrap_or_else(|| PLACEHOLDER_MESH_ADDR.to_string()),
                    endpoint: up.endpoint,
                    desired_state: up.desired_state.unwrap_or_default(),
                    actual_status: up.actual_status,
                    last_handshake_at: None,
                    last_seen_at: None,
                    bytes_rx: None,
                    bytes_tx: None,
                    created_at: now,
                    updated_at: now,
                };
                conn.execute(
                    "INSERT INTO devices (id, tenant_id, bus_id, name, device_addr,
                        mesh_public_key, mesh_addr, endpoint, desired_state, actual_status,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        device.id,
                        device.tenant_id,
                        device.bus_id,
                        device.name,
                        device.device_addr,
                        device.mesh_public_key,
                        device.mesh_addr,
                        device.endpoint,
                        device.desired_state.to_string(),
                        device.actual_status.map(|s| s.to_string()),
                        device.created_at,
                        device.updated_at,
                    ],
                )?;
                debug!("Created device {} ({})", device.bus_id, device.id);
                Ok(device)
            }
        }
    }

    pub fn device_by_bus_id(&self, bus_id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        Self::device_by_bus_id_locked(&conn, bus_id)
    }

    fn device_by_bus_id_locked(conn: &Connection, bus_id: &str) -> Result<Option<Device>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE bus_id = ?1", DEVICE_COLS),
                params![bus_id],
                device_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_devices(&self, tenant_id: Option<&str>) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match tenant_id {
            Some(tid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices WHERE tenant_id = ?1 ORDER BY updated_at DESC",
                    DEVICE_COLS
                ))?;
                let rows = stmt.query_map(params![tid], device_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices ORDER BY updated_at DESC",
                    DEVICE_COLS
                ))?;
                let rows = stmt.query_map([], device_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Persist observed mesh state for a device
    pub fn update_device_actual(&self, update: DeviceActualUpdate) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE devices SET
                actual_status = ?1,
                last_handshake_at = ?2,
                last_seen_at = ?3,
                bytes_rx = ?4,
                bytes_tx = ?5,
                updated_at = ?6
             WHERE id = ?7",
            params![
                update.status.to_string(),
                update.last_handshake_at,
                update.last_seen_at,
                update.bytes_rx,
                update.bytes_tx,
                now_ms(),
                update.device_id,
            ],
        )?;
        if affected == 0 {
            return Err(Error::NotFound {
                kind: "device".to_string(),
                id: update.device_id,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Upsert a peer by public key
    pub fn upsert_peer(&self, up: PeerUpsert) -> Result<Peer> {
        if up.public_key.is_empty() {
            return Err(Error::InvalidConfig("public_key is required".to_string()));
        }
        if up.allowed_ips.is_empty() {
            return Err(Error::InvalidConfig("allowed_ips is required".to_string()));
        }
        let now = now_ms();
        let keepalive = up.keepalive.unwrap_or(25);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (id, device_id, public_key, allowed_ips, endpoint, keepalive,
                desired_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(public_key) DO UPDATE SET
                device_id = excluded.device_id,
                allowed_ips = excluded.allowed_ips,
                endpoint = COALESCE(excluded.endpoint, endpoint),
                keepalive = excluded.keepalive,
                desired_state = excluded.desired_state,
                updated_at = excluded.updated_at",
            params![
                new_id(),
                up.device_id,
                up.public_key,
                up.allowed_ips,
                up.endpoint,
                keepalive,
                up.desired_state.unwrap_or_default().to_string(),
                now,
                now,
            ],
        )?;
        let peer = conn
            .query_row(
                &format!("SELECT {} FROM peers WHERE public_key = ?1", PEER_COLS),
                params![up.public_key],
                peer_from_row,
            )
            .optional()?;
        peer.ok_or_else(|| Error::NotFound {
            kind: "peer".to_string(),
            id: up.public_key,
        })
    }

    /// Find a peer with its owning device, optionally scoped to one tenant
    pub fn find_peer(&self, public_key: &str, tenant_id: Option<&str>) -> Result<Option<PeerWithDevice>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, {} FROM peers p JOIN devices d ON d.id = p.device_id
             WHERE p.public_key = ?1",
            prefixed(PEER_COLS, "p"),
            prefixed(DEVICE_COLS, "d"),
        );
        let row = conn
            .query_row(&sql, params![public_key], peer_with_device_from_row)
            .optional()?;
        Ok(row.filter(|pwd| match tenant_id {
            Some(tid) => pwd.device.tenant_id == tid,
            None => true,
        }))
    }

    /// Desired peers (state != REMOVED) joined with their devices,
    /// optionally scoped to one tenant
    pub fn list_peers_desired(&self, tenant_id: Option<&str>) -> Result<Vec<PeerWithDevice>> {
        let base = format!(
            "SELECT {}, {} FROM peers p JOIN devices d ON d.id = p.device_id
             WHERE p.desired_state != 'REMOVED'",
            prefixed(PEER_COLS, "p"),
            prefixed(DEVICE_COLS, "d"),
        );
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match tenant_id {
            Some(tid) => {
                let mut stmt =
                    conn.prepare(&format!("{} AND d.tenant_id = ?1 ORDER BY p.updated_at DESC", base))?;
                let rows = stmt.query_map(params![tid], peer_with_device_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY p.updated_at DESC", base))?;
                let rows = stmt.query_map([], peer_with_device_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Every peer joined with its device (builds the peer -> tenant index)
    pub fn list_peers_with_device(&self) -> Result<Vec<PeerWithDevice>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, {} FROM peers p JOIN devices d ON d.id = p.device_id",
            prefixed(PEER_COLS, "p"),
            prefixed(DEVICE_COLS, "d"),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], peer_with_device_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persist observed mesh state for a peer
    pub fn update_peer_actual(&self, update: PeerActualUpdate) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE peers SET
                actual_status = ?1,
                last_handshake_at = ?2,
                bytes_rx = ?3,
                bytes_tx = ?4,
                updated_at = ?5
             WHERE public_key = ?6",
            params![
                update.status.to_string(),
                update.last_handshake_at,
                update.bytes_rx,
                update.bytes_tx,
                now_ms(),
                update.public_key,
            ],
        )?;
        if affected == 0 {
            return Err(Error::NotFound {
                kind: "peer".to_string(),
                id: update.public_key,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    pub fn list_bindings(&self) -> Result<Vec<Binding>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT public_key, bus_id, device_addr, created_at FROM bindings")?;
        let rows = stmt.query_map([], |row| {
            Ok(Binding {
                public_key: row.get(0)?,
                bus_id: row.get(1)?,
                device_addr: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Create or replace the binding for a mesh identity
    pub fn bind_peer(&self, public_key: &str, bus_id: &str, device_addr: &str) -> Result<Binding> {
        if public_key.is_empty() || bus_id.is_empty() || device_addr.is_empty() {
            return Err(Error::InvalidConfig(
                "public_key, bus_id and device_addr are required".to_string(),
            ));
        }
        let binding = Binding {
            public_key: public_key.to_string(),
            bus_id: bus_id.to_string(),
            device_addr: device_addr.to_string(),
            created_at: now_ms(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO bindings (public_key, bus_id, device_addr, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                binding.public_key,
                binding.bus_id,
                binding.device_addr,
                binding.created_at
            ],
        )?;
        Ok(binding)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn add_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (id, type, payload, run_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id,
                job.job_type,
                serde_json::to_string(&job.payload)?,
                job.run_at,
                job.created_at
            ],
        )?;
        Ok(())
    }

    /// Claim due jobs: select and delete in one transaction so each job is
    /// consumed exactly once
    pub fn claim_due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let jobs = {
            let mut stmt = tx.prepare(
                "SELECT id, type, payload, run_at, created_at FROM jobs
                 WHERE run_at <= ?1 ORDER BY run_at ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, job_type, payload, run_at, created_at) = row?;
                out.push(Job {
                    id,
                    job_type,
                    payload: serde_json::from_str(&payload)?,
                    run_at,
                    created_at,
                });
            }
            out
        };
        for job in &jobs {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id])?;
        }
        tx.commit()?;
        Ok(jobs)
    }

    pub fn pending_job_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // Identity session documents
    // ========================================================================

    pub fn session_doc(&self, sid: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let doc = conn
            .query_row(
                "SELECT doc FROM identity_sessions WHERE sid = ?1",
                params![sid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc)
    }

    pub fn put_session_doc(&self, sid: &str, doc: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO identity_sessions (sid, doc, updated_at) VALUES (?1, ?2, ?3)",
            params![sid, doc, now_ms()],
        )?;
        Ok(())
    }

    pub fn all_session_docs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT sid, doc FROM identity_sessions")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Delayed-execution queue entry
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub run_at: i64,
    pub created_at: i64,
}

/// Upsert input for devices; absent fields keep stored values
#[derive(Debug, Clone, Default)]
pub struct DeviceUpsert {
    pub tenant_id: Option<String>,
    pub bus_id: String,
    pub name: Option<String>,
    pub device_addr: Option<String>,
    pub mesh_public_key: Option<String>,
    pub mesh_addr: Option<String>,
    pub endpoint: Option<String>,
    pub desired_state: Option<DesiredState>,
    pub actual_status: Option<MeshStatus>,
}

/// Upsert input for peers
#[derive(Debug, Clone, Default)]
pub struct PeerUpsert {
    pub device_id: String,
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub keepalive: Option<i64>,
    pub desired_state: Option<DesiredState>,
}

/// Observed-state write-back for a peer
#[derive(Debug, Clone)]
pub struct PeerActualUpdate {
    pub public_key: String,
    pub status: MeshStatus,
    pub last_handshake_at: Option<i64>,
    pub bytes_rx: Option<i64>,
    pub bytes_tx: Option<i64>,
}

/// Observed-state write-back for a device
#[derive(Debug, Clone)]
pub struct DeviceActualUpdate {
    pub device_id: String,
    pub status: MeshStatus,
    pub last_handshake_at: Option<i64>,
    pub last_seen_at: Option<i64>,
    pub bytes_rx: Option<i64>,
    pub bytes_tx: Option<i64>,
}

const DEVICE_COLS: &str = "id, tenant_id, bus_id, name, device_addr, mesh_public_key, mesh_addr, \
     endpoint, desired_state, actual_status, last_handshake_at, last_seen_at, bytes_rx, bytes_tx, \
     created_at, updated_at";

const PEER_COLS: &str = "id, device_id, public_key, allowed_ips, endpoint, keepalive, \
     desired_state, actual_status, last_handshake_at, bytes_rx, bytes_tx, created_at, updated_at";

fn prefixed(cols: &str, alias: &str) -> String {
    cols.split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    device_from_row_at(row, 0)
}

fn device_from_row_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(base)?,
        tenant_id: row.get(base + 1)?,
        bus_id: row.get(base + 2)?,
        name: row.get(base + 3)?,
        device_addr: row.get(base + 4)?,
        mesh_public_key: row.get(base + 5)?,
        mesh_addr: row.get(base + 6)?,
        endpoint: row.get(base + 7)?,
        desired_state: row
            .get::<_, String>(base + 8)?
            .parse()
            .unwrap_or_default(),
        actual_status: row
            .get::<_, Option<String>>(base + 9)?
            .and_then(|s| s.parse().ok()),
        last_handshake_at: row.get(base + 10)?,
        last_seen_at: row.get(base + 11)?,
        bytes_rx: row.get(base + 12)?,
        bytes_tx: row.get(base + 13)?,
        created_at: row.get(base + 14)?,
        updated_at: row.get(base + 15)?,
    })
}

fn peer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    peer_from_row_at(row, 0)
}

fn peer_from_row_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get(base)?,
        device_id: row.get(base + 1)?,
        public_key: row.get(base + 2)?,
        allowed_ips: row.get(base + 3)?,
        endpoint: row.get(base + 4)?,
        keepalive: row.get(base + 5)?,
        desired_state: row
            .get::<_, String>(base + 6)?
            .parse()
            .unwrap_or_default(),
        actual_status: row
            .get::<_, Option<String>>(base + 7)?
            .and_then(|s| s.parse().ok()),
        last_handshake_at: row.get(base + 8)?,
        bytes_rx: row.get(base + 9)?,
        bytes_tx: row.get(base + 10)?,
        created_at: row.get(base + 11)?,
        updated_at: row.get(base + 12)?,
    })
}

fn peer_with_device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerWithDevice> {
    let peer = peer_from_row_at(row, 0)?;
    let device = device_from_row_at(row, 13)?;
    Ok(PeerWithDevice { peer, device })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tenant_created_once() {
        let store = Store::open_memory().unwrap();
        let a = store.default_tenant().unwrap();
        let b = store.default_tenant().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.slug, DEFAULT_TENANT_SLUG);
    }

    #[test]
    fn test_list_tenants_falls_back_to_default() {
        let store = Store::open_memory().unwrap();
        let tenants = store.list_tenants().unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].slug, "default");

        store.create_tenant("acme", "Acme").unwrap();
        let tenants = store.list_tenants().unwrap();
        assert_eq!(tenants.len(), 2);
    }

    #[test]
    fn test_device_upsert_placeholders_and_merge() {
        let store = Store::open_memory().unwrap();
        let dev = store
            .upsert_device(DeviceUpsert {
                bus_id: "hs-01".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dev.mesh_public_key, "pending:hs-01");
        assert_eq!(dev.mesh_addr, PLACEHOLDER_MESH_ADDR);
        assert_eq!(dev.desired_state, DesiredState::Pending);

        let dev2 = store
            .upsert_device(DeviceUpsert {
                bus_id: "hs-01".to_string(),
                name: Some("Hotspot 1".to_string()),
                desired_state: Some(DesiredState::Active),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dev2.id, dev.id);
        assert_eq!(dev2.name.as_deref(), Some("Hotspot 1"));
        assert_eq!(dev2.desired_state, DesiredState::Active);
        // untouched fields survive the merge
        assert_eq!(dev2.mesh_public_key, "pending:hs-01");
    }

    #[test]
    fn test_peer_upsert_and_desired_listing() {
        let store = Store::open_memory().unwrap();
        let dev = store
            .upsert_device(DeviceUpsert {
                bus_id: "hs-01".to_string(),
                ..Default::default()
            })
            .unwrap();

        store
            .upsert_peer(PeerUpsert {
                device_id: dev.id.clone(),
                public_key: "PK-A".to_string(),
                allowed_ips: "10.8.0.2/32".to_string(),
                desired_state: Some(DesiredState::Active),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_peer(PeerUpsert {
                device_id: dev.id.clone(),
                public_key: "PK-B".to_string(),
                allowed_ips: "10.8.0.3/32".to_string(),
                desired_state: Some(DesiredState::Removed),
                ..Default::default()
            })
            .unwrap();

        let desired = store.list_peers_desired(None).unwrap();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].peer.public_key, "PK-A");
        assert_eq!(desired[0].device.bus_id, "hs-01");

        let scoped = store.list_peers_desired(Some(&dev.tenant_id)).unwrap();
        assert_eq!(scoped.len(), 1);
        let scoped = store.list_peers_desired(Some("missing")).unwrap();
        assert!(scoped.is_empty());
    }

    #[test]
    fn test_peer_actual_update() {
        let store = Store::open_memory().unwrap();
        let dev = store
            .upsert_device(DeviceUpsert {
                bus_id: "hs-01".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_peer(PeerUpsert {
                device_id: dev.id.clone(),
                public_key: "PK-A".to_string(),
                allowed_ips: "10.8.0.2/32".to_string(),
                ..Default::default()
            })
            .unwrap();

        store
            .update_peer_actual(PeerActualUpdate {
                public_key: "PK-A".to_string(),
                status: MeshStatus::Online,
                last_handshake_at: Some(123),
                bytes_rx: Some(10),
                bytes_tx: Some(20),
            })
            .unwrap();

        let pwd = store.find_peer("PK-A", None).unwrap().unwrap();
        assert_eq!(pwd.peer.actual_status, Some(MeshStatus::Online));
        assert_eq!(pwd.peer.bytes_rx, Some(10));

        let err = store.update_peer_actual(PeerActualUpdate {
            public_key: "PK-MISSING".to_string(),
            status: MeshStatus::Online,
            last_handshake_at: None,
            bytes_rx: None,
            bytes_tx: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_bindings_replace() {
        let store = Store::open_memory().unwrap();
        store.bind_peer("PK-A", "hs-01", "10.200.1.10").unwrap();
        store.bind_peer("PK-A", "hs-02", "10.200.1.11").unwrap();
        let bindings = store.list_bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].bus_id, "hs-02");
    }

    #[test]
    fn test_jobs_claimed_once_in_order() {
        let store = Store::open_memory().unwrap();
        for (id, run_at) in [("j1", 100), ("j2", 50), ("j3", 9000)] {
            store
                .add_job(&Job {
                    id: id.to_string(),
                    job_type: "AUTHORIZE_PENDING".to_string(),
                    payload: serde_json::json!({"sid": id}),
                    run_at,
                    created_at: 1,
                })
                .unwrap();
        }

        let due = store.claim_due_jobs(200, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, "j2");
        assert_eq!(due[1].id, "j1");

        // claimed jobs are gone
        let again = store.claim_due_jobs(200, 10).unwrap();
        assert!(again.is_empty());
        assert_eq!(store.pending_job_count().unwrap(), 1);
    }

    #[test]
    fn test_session_docs_roundtrip() {
        let store = Store::open_memory().unwrap();
        assert!(store.session_doc("sid-1").unwrap().is_none());
        store.put_session_doc("sid-1", "{}").unwrap();
        assert_eq!(store.session_doc("sid-1").unwrap().as_deref(), Some("{}"));
        assert_eq!(store.all_session_docs().unwrap().len(), 1);
    }
}
