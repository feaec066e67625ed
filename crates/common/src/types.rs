//! Core domain types for fleetrelay

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Desired lifecycle state for devices and peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Pending,
    Active,
    Removed,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Pending => write!(f, "PENDING"),
            DesiredState::Active => write!(f, "ACTIVE"),
            DesiredState::Removed => write!(f, "REMOVED"),
        }
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "REMOVED" => Ok(Self::Removed),
            _ => Err(format!("unknown desired state: {}", s)),
        }
    }
}

/// Observed mesh liveness for a peer or device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshStatus {
    Online,
    Offline,
    NeverConnected,
    Missing,
    NoPeers,
    Unknown,
}

impl std::fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeshStatus::Online => "ONLINE",
            MeshStatus::Offline => "OFFLINE",
            MeshStatus::NeverConnected => "NEVER_CONNECTED",
            MeshStatus::Missing => "MISSING",
            MeshStatus::NoPeers => "NO_PEERS",
            MeshStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MeshStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            "NEVER_CONNECTED" => Ok(Self::NeverConnected),
            "MISSING" => Ok(Self::Missing),
            "NO_PEERS" => Ok(Self::NoPeers),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("unknown mesh status: {}", s)),
        }
    }
}

/// Aggregate per-peer statuses into a device-level status.
///
/// Priority: ONLINE > OFFLINE > NEVER_CONNECTED > MISSING, with NO_PEERS for
/// an empty set and UNKNOWN as the residual.
pub fn aggregate_device_status(statuses: &[MeshStatus]) -> MeshStatus {
    if statuses.is_empty() {
        return MeshStatus::NoPeers;
    }
    if statuses.iter().any(|s| *s == MeshStatus::Online) {
        return MeshStatus::Online;
    }
    if statuses.iter().any(|s| *s == MeshStatus::Offline) {
        return MeshStatus::Offline;
    }
    if statuses.iter().any(|s| *s == MeshStatus::NeverConnected) {
        return MeshStatus::NeverConnected;
    }
    if statuses.iter().any(|s| *s == MeshStatus::Missing) {
        return MeshStatus::Missing;
    }
    MeshStatus::Unknown
}

/// Tenant: the isolation boundary for reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub created_at: i64,
}

/// Slug of the tenant that always exists and absorbs ambiguous resolution
pub const DEFAULT_TENANT_SLUG: &str = "default";

/// A remote router-class endpoint managed by the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub tenant_id: String,
    /// Stable business identifier
    pub bus_id: String,
    pub name: Option<String>,
    /// LAN address commands are routed to
    pub device_addr: Option<String>,
    /// Mesh public key; placeholder-derived until provisioned
    pub mesh_public_key: String,
    pub mesh_addr: String,
    pub endpoint: Option<String>,
    pub desired_state: DesiredState,
    pub actual_status: Option<MeshStatus>,
    pub last_handshake_at: Option<i64>,
    pub last_seen_at: Option<i64>,
    pub bytes_rx: Option<i64>,
    pub bytes_tx: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Placeholder mesh key for a device that has not been provisioned yet
pub fn placeholder_key(bus_id: &str) -> String {
    format!("pending:{}", bus_id)
}

/// Address used for unprovisioned devices
pub const PLACEHOLDER_MESH_ADDR: &str = "0.0.0.0/32";

/// Business id assigned to auto-discovered peers
pub fn auto_bus_id(public_key: &str) -> String {
    let suffix: String = public_key.chars().take(8).collect();
    format!("auto-{}", suffix)
}

/// A mesh peer entry associated with exactly one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub device_id: String,
    pub public_key: String,
    /// Normalized, comma-joined allowed-address set
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub keepalive: Option<i64>,
    pub desired_state: DesiredState,
    pub actual_status: Option<MeshStatus>,
    pub last_handshake_at: Option<i64>,
    pub bytes_rx: Option<i64>,
    pub bytes_tx: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Peer joined with its owning device (for tenant scoping)
#[derive(Debug, Clone)]
pub struct PeerWithDevice {
    pub peer: Peer,
    pub device: Device,
}

/// Mapping between a mesh identity and the device's network address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub public_key: String,
    pub bus_id: String,
    pub device_addr: String,
    pub created_at: i64,
}

/// One peer as reported by the mesh interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPeerEntry {
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub bus_id: Option<String>,
}

/// Per-peer liveness from the mesh status dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatusInfo {
    pub public_key: String,
    pub status: MeshStatus,
    pub endpoint: Option<String>,
    pub rx: i64,
    pub tx: i64,
    /// Seconds since the last handshake, when one ever happened
    pub handshake_age: Option<i64>,
}

/// Normalize an allowed-address set into its canonical comparable form:
/// trim, drop empties, sort, rejoin with commas.
pub fn normalize_allowed(raw: &str) -> String {
    let mut parts: Vec<&str> = raw
        .split(',')
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect();
    parts.sort_unstable();
    parts.join(",")
}

/// Normalize an allowed-address set given as separate entries
pub fn normalize_allowed_list(raw: &[String]) -> String {
    normalize_allowed(&raw.join(","))
}

/// Extract the host portion of a mesh endpoint (`host:port`, `[v6]:port`)
pub fn endpoint_host(endpoint: &str) -> Option<String> {
    let raw = endpoint.trim();
    if raw.is_empty() || raw == "(none)" {
        return None;
    }
    if let Some(stripped) = raw.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            if end > 0 {
                return Some(stripped[..end].to_string());
            }
        }
    }
    match raw.rfind(':') {
        Some(idx) if idx > 0 => Some(raw[..idx].to_string()),
        _ => Some(raw.to_string()),
    }
}

/// Convert a handshake age in seconds into an absolute millisecond timestamp
pub fn handshake_at_from_age(handshake_age: Option<i64>, now_ms: i64) -> Option<i64> {
    match handshake_age {
        Some(age) if age >= 0 => Some(now_ms - age * 1000),
        _ => None,
    }
}

/// Fresh uuid string, the id form used across the store
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
