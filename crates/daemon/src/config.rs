//! Daemon configuration

use fleetrelay_common::error::codes;
use fleetrelay_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Relay daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Device fleet table
    #[serde(default)]
    pub devices: Vec<DeviceNode>,

    /// Reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Authorization pipeline configuration
    #[serde(default)]
    pub authorize: AuthorizeConfig,

    /// Webhook signature verification
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Paid-access command configuration
    #[serde(default)]
    pub paid_access: PaidAccessConfig,

    /// Mesh interface configuration
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// Mesh interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_mesh_interface")]
    pub interface: String,
}

fn default_mesh_interface() -> String {
    "wg0".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            interface: default_mesh_interface(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store_path: fleetrelay_common::default_store_path(),
            devices: Vec::new(),
            reconcile: ReconcileConfig::default(),
            authorize: AuthorizeConfig::default(),
            webhook: WebhookConfig::default(),
            paid_access: PaidAccessConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

/// One device in the managed fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceNode {
    /// Stable business id, matches the store's bus_id
    pub id: String,
    pub host: String,
    pub user: String,
    pub pass: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_port() -> u16 {
    8728
}

fn default_device_timeout_ms() -> u64 {
    8000
}

/// Reconciliation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Cycle interval in milliseconds; 0 disables the loop
    #[serde(default = "default_reconcile_interval_ms")]
    pub interval_ms: u64,

    /// Actually remove extra mesh peers (default: observe-only)
    #[serde(default)]
    pub remove_extra: bool,

    /// Multi-tenant store-backed mode; false falls back to the static
    /// registry single-tenant path
    #[serde(default = "default_true")]
    pub multi_tenant: bool,

    /// Persist observed state back to the store
    #[serde(default = "default_true")]
    pub write_store: bool,

    /// Use the static registry when the default tenant has no desired peers
    #[serde(default = "default_true")]
    pub fallback_registry: bool,

    /// Static registry file (desired-state fallback)
    pub registry_path: Option<PathBuf>,

    /// Tenant auto-discovery mode: "default" or "by-endpoint-ip"
    #[serde(default = "default_discovery_mode")]
    pub tenant_discovery_mode: String,

    /// endpoint host -> tenant slug, used by the by-endpoint-ip mode
    #[serde(default)]
    pub tenant_addr_map: HashMap<String, String>,
}

fn default_reconcile_interval_ms() -> u64 {
    60_000
}

fn default_discovery_mode() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_reconcile_interval_ms(),
            remove_extra: false,
            multi_tenant: true,
            write_store: true,
            fallback_registry: true,
            registry_path: None,
            tenant_discovery_mode: default_discovery_mode(),
            tenant_addr_map: HashMap::new(),
        }
    }
}

impl ReconcileConfig {
    /// Normalized discovery mode; unknown values fall back to "default"
    pub fn discovery_by_endpoint(&self) -> bool {
        self.tenant_discovery_mode.trim().eq_ignore_ascii_case("by-endpoint-ip")
    }
}

/// Authorization pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeConfig {
    /// Short-circuit device commands to a no-op success
    #[serde(default)]
    pub dry_run: bool,

    /// Run the delayed-job poll loop inside this daemon
    #[serde(default = "default_true")]
    pub job_runner_enabled: bool,

    /// Job poll interval in milliseconds
    #[serde(default = "default_job_poll_ms")]
    pub job_poll_ms: u64,
}

fn default_job_poll_ms() -> u64 {
    1000
}

impl Default for AuthorizeConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            job_runner_enabled: true,
            job_poll_ms: default_job_poll_ms(),
        }
    }
}

/// Webhook signature configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret; verification fails closed when unset
    pub secret: Option<String>,

    /// Accepted clock skew in milliseconds
    #[serde(default = "default_ts_skew_ms")]
    pub ts_skew_ms: i64,

    /// Nonce replay window in milliseconds
    #[serde(default = "default_nonce_ttl_ms")]
    pub nonce_ttl_ms: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ts_skew_ms: default_ts_skew_ms(),
            nonce_ttl_ms: default_nonce_ttl_ms(),
        }
    }
}

fn default_ts_skew_ms() -> i64 {
    120_000
}

fn default_nonce_ttl_ms() -> i64 {
    5 * 60_000
}

/// Paid-access firewall command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidAccessConfig {
    #[serde(default = "default_paid_list")]
    pub list_name: String,
    #[serde(default = "default_binding_type")]
    pub binding_type: String,
}

fn default_paid_list() -> String {
    "paid_clients".to_string()
}

fn default_binding_type() -> String {
    "bypassed".to_string()
}

impl Default for PaidAccessConfig {
    fn default() -> Self {
        Self {
            list_name: default_paid_list(),
            binding_type: default_binding_type(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Look up a device node by business id.
    ///
    /// Misconfiguration surfaces as setup-class coded errors so the
    /// classifier opens the circuit instead of retrying.
    pub fn device_node(&self, bus_id: &str) -> Result<&DeviceNode> {
        if self.devices.is_empty() {
            return Err(Error::NodesNotConfigured);
        }
        self.devices
            .iter()
            .find(|n| n.id == bus_id)
            .ok_or_else(|| Error::NodeNotFound {
                bus_id: bus_id.to_string(),
            })
    }
}

/// Static desired-state registry: the file-backed fallback used when the
/// store has nothing for the default tenant, and the only source in
/// single-tenant mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRegistry {
    #[serde(default)]
    pub devices: Vec<StaticRegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRegistryEntry {
    pub bus_id: String,
    pub public_key: String,
    pub allowed_ips: String,
    /// Address authorization commands are routed to
    pub device_addr: Option<String>,
}

impl StaticRegistry {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let registry: Self = serde_json::from_str(&content).map_err(|e| {
            Error::device(
                codes::DEVICE_NODES_INVALID_JSON,
                format!("static registry {}: {}", path.display(), e),
            )
        })?;
        Ok(registry)
    }
}
