//! Reconciliation loop
//!
//! Periodically converges each tenant's desired peer set (store-backed, with
//! a static-registry fallback) against the live mesh: peers are added or
//! updated, bindings repaired, observed state written back, unknown peers
//! adopted, and extras reported (removed only when explicitly enabled).

use crate::config::{RelayConfig, StaticRegistry};
use crate::mesh::{MeshControl, MeshPeerSpec};
use crate::metrics::Metrics;
use fleetrelay_common::db::{DeviceActualUpdate, DeviceUpsert, PeerActualUpdate, PeerUpsert};
use fleetrelay_common::{
    aggregate_device_status, auto_bus_id, classify, endpoint_host, handshake_at_from_age,
    normalize_allowed, now_ms, Binding, DesiredState, MeshStatus, PeerStatusInfo, PeerWithDevice,
    Result, Store, Tenant, DEFAULT_TENANT_SLUG,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SETUP_LOG_COOLDOWN_MS: i64 = 60_000;

/// One peer as desired by the store or the static registry
#[derive(Debug, Clone)]
struct DesiredPeer {
    bus_id: String,
    public_key: String,
    allowed: String,
    device_addr: Option<String>,
}

/// One peer as observed on the mesh, joined with binding and liveness
#[derive(Debug, Clone)]
struct ActualPeer {
    bus_id: Option<String>,
    public_key: String,
    allowed: String,
    endpoint: Option<String>,
    has_binding: bool,
    status: Option<PeerStatusInfo>,
}

/// Reconciler that converges mesh state with desired state per tenant
pub struct Reconciler {
    config: Arc<RelayConfig>,
    store: Store,
    mesh: Arc<dyn MeshControl>,
    metrics: Metrics,
    setup_log_at: Mutex<i64>,
}

impl Reconciler {
    pub fn new(
        config: Arc<RelayConfig>,
        store: Store,
        mesh: Arc<dyn MeshControl>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            store,
            mesh,
            metrics,
            setup_log_at: Mutex::new(0),
        }
    }

    /// Run the reconciliation loop. An interval of 0 disables it.
    pub async fn run(&self) {
        let interval = self.config.reconcile.interval_ms;
        if interval == 0 {
            info!("reconciler disabled");
            return;
        }
        info!(
            interval_ms = interval,
            remove_extra = self.config.reconcile.remove_extra,
            multi_tenant = self.config.reconcile.multi_tenant,
            write_store = self.config.reconcile.write_store,
            "reconciler started"
        );
        loop {
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "reconcile cycle failed");
            }
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
    }

    /// One full convergence cycle. Aborts wholesale when the peer listing
    /// fails; no partial convergence is attempted.
    pub async fn reconcile_once(&self) -> Result<()> {
        let now = now_ms();

        let bindings = match self.store.list_bindings() {
            Ok(b) => b,
            Err(e) => {
                self.metrics.inc("reconciler.bindings_error");
                error!(error = %e, "binding listing failed");
                Vec::new()
            }
        };

        let entries = match self.mesh.list_peers().await {
            Ok(entries) => entries,
            Err(e) => {
                let cls = classify(&e);
                self.metrics.inc(&format!("reconciler.mesh_error_{}", cls.code));
                if cls.retryable {
                    warn!(code = %cls.code, error = %e, "peer listing failed, retrying next cycle");
                } else if self.should_log_setup(now) {
                    error!(code = %cls.code, error = %e, "mesh interface not usable");
                }
                return Ok(());
            }
        };

        let status_map: HashMap<String, PeerStatusInfo> = match self.mesh.peers_status().await {
            Ok(report) => {
                if report.ok {
                    debug!(peers = report.peers.len(), "mesh status dump ok");
                } else {
                    self.metrics.inc("reconciler.status_error");
                    error!(error = report.error.as_deref().unwrap_or("status dump failed"), "mesh status dump failed");
                }
                report
                    .peers
                    .into_iter()
                    .map(|p| (p.public_key.clone(), p))
                    .collect()
            }
            Err(e) => {
                self.metrics.inc("reconciler.status_error");
                error!(error = %e, "mesh status dump failed");
                HashMap::new()
            }
        };

        let binding_map: HashMap<&str, &Binding> =
            bindings.iter().map(|b| (b.public_key.as_str(), b)).collect();
        let actual_list: Vec<ActualPeer> = entries
            .iter()
            .map(|p| {
                let binding = binding_map.get(p.public_key.as_str());
                ActualPeer {
                    bus_id: p
                        .bus_id
                        .clone()
                        .or_else(|| binding.map(|b| b.bus_id.clone())),
                    public_key: p.public_key.clone(),
                    allowed: normalize_allowed(&p.allowed_ips),
                    endpoint: p.endpoint.clone(),
                    has_binding: binding.is_some(),
                    status: status_map.get(&p.public_key).cloned(),
                }
            })
            .collect();

        if !self.config.reconcile.multi_tenant {
            return self.reconcile_single_tenant(&bindings, &actual_list).await;
        }

        let tenants = match self.store.list_tenants() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "tenant listing failed");
                match self.store.default_tenant() {
                    Ok(t) => vec![t],
                    Err(e) => {
                        error!(error = %e, "default tenant unavailable");
                        Vec::new()
                    }
                }
            }
        };
        if tenants.is_empty() {
            warn!("no tenants available");
            return Ok(());
        }

        let tenants_by_slug: HashMap<String, Tenant> =
            tenants.iter().map(|t| (t.slug.clone(), t.clone())).collect();
        let default_tenant = tenants_by_slug.get(DEFAULT_TENANT_SLUG).cloned();

        let mut known_peer_tenant: HashMap<String, String> = HashMap::new();
        match self.store.list_peers_with_device() {
            Ok(rows) => {
                for row in rows {
                    known_peer_tenant.insert(row.peer.public_key, row.device.tenant_id);
                }
            }
            Err(e) => error!(error = %e, "peer tenant index failed"),
        }

        for tenant in &tenants {
            self.reconcile_tenant(
                tenant,
                now,
                &bindings,
                &status_map,
                &actual_list,
                &mut known_peer_tenant,
                &tenants_by_slug,
                default_tenant.as_ref(),
            )
            .await;
        }

        Ok(())
    }

    /// Setup-class listing failures log once per cooldown window
    fn should_log_setup(&self, now: i64) -> bool {
        let mut last = self.setup_log_at.lock();
        if now - *last >= SETUP_LOG_COOLDOWN_MS {
            *last = now;
            true
        } else {
            false
        }
    }

    fn registry_desired(&self) -> Vec<DesiredPeer> {
        let Some(path) = &self.config.reconcile.registry_path else {
            return Vec::new();
        };
        match StaticRegistry::load(path) {
            Ok(registry) => registry
                .devices
                .into_iter()
                .filter(|d| !d.public_key.is_empty() && !d.allowed_ips.is_empty())
                .map(|d| DesiredPeer {
                    bus_id: d.bus_id,
                    allowed: normalize_allowed(&d.allowed_ips),
                    public_key: d.public_key,
                    device_addr: d.device_addr,
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "static registry unreadable");
                Vec::new()
            }
        }
    }

    /// Legacy single-tenant path: static registry desired state, diff and
    /// binding repair only. No store writes, no auto-discovery, no removal.
    async fn reconcile_single_tenant(
        &self,
        bindings: &[Binding],
        actual_list: &[ActualPeer],
    ) -> Result<()> {
        let desired = self.registry_desired();
        let actual_map: HashMap<&str, &ActualPeer> = actual_list
            .iter()
            .map(|a| (a.public_key.as_str(), a))
            .collect();
        let desired_keys: HashSet<&str> = desired.iter().map(|d| d.public_key.as_str()).collect();

        for d in &desired {
            let bound = bindings.iter().any(|b| b.public_key == d.public_key);
            if !bound {
                if let Some(addr) = &d.device_addr {
                    self.create_binding(&d.public_key, &d.bus_id, addr, None).await;
                }
            }
        }

        for d in &desired {
            let matches = actual_map
                .get(d.public_key.as_str())
                .map(|a| a.allowed == d.allowed)
                .unwrap_or(false);
            if !matches {
                self.apply_add(d, None).await;
            }
        }

        for a in actual_list {
            if !desired_keys.contains(a.public_key.as_str()) {
                self.metrics.inc("reconciler.extra_peer");
                warn!(key = %a.public_key, endpoint = a.endpoint.as_deref().unwrap_or(""), "extra peer present");
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_tenant(
        &self,
        tenant: &Tenant,
        now: i64,
        bindings: &[Binding],
        status_map: &HashMap<String, PeerStatusInfo>,
        actual_list: &[ActualPeer],
        known_peer_tenant: &mut HashMap<String, String>,
        tenants_by_slug: &HashMap<String, Tenant>,
        default_tenant: Option<&Tenant>,
    ) {
        debug!(tenant = %tenant.slug, "tenant cycle started");

        let mut used_fallback = false;
        let mut store_rows: Vec<PeerWithDevice> = Vec::new();
        let mut desired: Vec<DesiredPeer>;

        match self.store.list_peers_desired(Some(&tenant.id)) {
            Ok(rows) => {
                desired = rows
                    .iter()
                    .filter(|r| !r.peer.public_key.is_empty() && !r.peer.allowed_ips.is_empty())
                    .map(|r| DesiredPeer {
                        bus_id: r.device.bus_id.clone(),
                        public_key: r.peer.public_key.clone(),
                        allowed: normalize_allowed(&r.peer.allowed_ips),
                        device_addr: r.device.device_addr.clone(),
                    })
                    .collect();
                store_rows = rows;
                debug!(tenant = %tenant.slug, desired = desired.len(), "store read ok");

                if tenant.slug == DEFAULT_TENANT_SLUG
                    && desired.is_empty()
                    && self.config.reconcile.fallback_registry
                {
                    desired = self.registry_desired();
                    if !desired.is_empty() {
                        used_fallback = true;
                        warn!(tenant = %tenant.slug, desired = desired.len(), "store empty, using static registry");
                    }
                }
            }
            Err(e) => {
                error!(tenant = %tenant.slug, error = %e, "store read failed");
                if tenant.slug != DEFAULT_TENANT_SLUG || !self.config.reconcile.fallback_registry {
                    debug!(tenant = %tenant.slug, "tenant cycle skipped");
                    return;
                }
                desired = self.registry_desired();
                used_fallback = true;
                warn!(tenant = %tenant.slug, desired = desired.len(), "store unavailable, using static registry");
            }
        }

        // scope the actual view to this tenant
        let discovery_by_endpoint = self.config.reconcile.discovery_by_endpoint();
        let actual_scoped: Vec<&ActualPeer> = actual_list
            .iter()
            .filter(|a| {
                if let Some(known) = known_peer_tenant.get(&a.public_key) {
                    return known == &tenant.id;
                }
                let resolved = self.resolve_tenant_for_endpoint(
                    a.status
                        .as_ref()
                        .and_then(|s| s.endpoint.as_deref())
                        .or(a.endpoint.as_deref()),
                    discovery_by_endpoint,
                    tenants_by_slug,
                    default_tenant,
                );
                resolved.map(|t| t.id == tenant.id).unwrap_or(false)
            })
            .collect();

        let store_backed = self.config.reconcile.write_store && !used_fallback;
        if store_backed && !store_rows.is_empty() {
            self.persist_actual_state(tenant, &store_rows, status_map, now);
        }

        let actual_map: HashMap<&str, &ActualPeer> = actual_scoped
            .iter()
            .map(|a| (a.public_key.as_str(), *a))
            .collect();
        let desired_map: HashMap<&str, &DesiredPeer> =
            desired.iter().map(|d| (d.public_key.as_str(), d)).collect();

        let to_add: Vec<&DesiredPeer> = desired
            .iter()
            .filter(|d| {
                actual_map
                    .get(d.public_key.as_str())
                    .map(|a| a.allowed != d.allowed)
                    .unwrap_or(true)
            })
            .collect();
        let to_remove: Vec<&ActualPeer> = actual_scoped
            .iter()
            .filter(|a| !desired_map.contains_key(a.public_key.as_str()))
            .copied()
            .collect();

        // adopt unknown peers into this tenant before treating them as extras
        let mut adopted: HashSet<String> = HashSet::new();
        if store_backed {
            for candidate in &to_remove {
                match self
                    .auto_discover_peer(tenant, candidate, status_map, now, known_peer_tenant)
                    .await
                {
                    Ok(true) => {
                        adopted.insert(candidate.public_key.clone());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.metrics.inc("reconciler.auto_discovery_failed");
                        error!(tenant = %tenant.slug, key = %candidate.public_key, error = %e, "auto-discovery failed");
                    }
                }
            }
        }

        for a in &actual_scoped {
            if a.status.as_ref().map(|s| s.status) == Some(MeshStatus::Offline) {
                self.metrics.inc("reconciler.peer_offline");
                warn!(tenant = %tenant.slug, key = %a.public_key, device = a.bus_id.as_deref().unwrap_or(""), "peer offline");
            }
            if !a.has_binding && !adopted.contains(&a.public_key) {
                self.metrics.inc("reconciler.missing_binding");
                warn!(tenant = %tenant.slug, key = %a.public_key, "peer has no binding");
            }
        }

        for d in &desired {
            if !bindings.iter().any(|b| b.public_key == d.public_key) {
                self.metrics.inc("reconciler.desired_no_binding");
                warn!(tenant = %tenant.slug, key = %d.public_key, device = %d.bus_id, "desired peer has no binding");
                if let Some(addr) = &d.device_addr {
                    self.create_binding(&d.public_key, &d.bus_id, addr, Some(tenant)).await;
                }
            }
        }

        for d in &to_add {
            self.apply_add(d, Some(tenant)).await;
        }

        for item in &to_remove {
            if adopted.contains(&item.public_key) {
                continue;
            }
            if !self.config.reconcile.remove_extra {
                self.metrics.inc("reconciler.extra_peer");
                warn!(tenant = %tenant.slug, key = %item.public_key, endpoint = item.endpoint.as_deref().unwrap_or(""), "extra peer present");
                continue;
            }
            let Some(bus_id) = &item.bus_id else {
                warn!(tenant = %tenant.slug, key = %item.public_key, "extra peer has no device mapping, skipping removal");
                continue;
            };
            match self.mesh.remove_peer(bus_id, &item.public_key).await {
                Ok(()) => {
                    self.metrics.inc("reconciler.removed");
                    info!(tenant = %tenant.slug, key = %item.public_key, device = %bus_id, "peer removed");
                }
                Err(e) => {
                    self.metrics.inc("reconciler.remove_error");
                    error!(tenant = %tenant.slug, key = %item.public_key, error = %e, "peer removal failed");
                }
            }
        }

        info!(
            tenant = %tenant.slug,
            desired = desired.len(),
            actual = actual_scoped.len(),
            to_add = to_add.len(),
            to_remove = to_remove.len(),
            adopted = adopted.len(),
            used_fallback,
            "tenant cycle done"
        );
    }

    fn resolve_tenant_for_endpoint<'t>(
        &self,
        endpoint: Option<&str>,
        discovery_by_endpoint: bool,
        tenants_by_slug: &'t HashMap<String, Tenant>,
        default_tenant: Option<&'t Tenant>,
    ) -> Option<&'t Tenant> {
        let default_tenant = default_tenant?;
        if !discovery_by_endpoint {
            return Some(default_tenant);
        }
        let Some(host) = endpoint.and_then(endpoint_host) else {
            return Some(default_tenant);
        };
        let Some(slug) = self.config.reconcile.tenant_addr_map.get(&host) else {
            return Some(default_tenant);
        };
        match tenants_by_slug.get(slug) {
            Some(tenant) => Some(tenant),
            None => {
                warn!(endpoint_host = %host, slug = %slug, "tenant mapping points nowhere");
                Some(default_tenant)
            }
        }
    }

    /// Write observed per-peer state and aggregated per-device state back to
    /// the store, skipping rows that belong to another tenant.
    fn persist_actual_state(
        &self,
        tenant: &Tenant,
        store_rows: &[PeerWithDevice],
        status_map: &HashMap<String, PeerStatusInfo>,
        now: i64,
    ) {
        struct DeviceAgg {
            statuses: Vec<MeshStatus>,
            bytes_rx: i64,
            bytes_tx: i64,
            last_handshake_at: Option<i64>,
        }
        let mut agg: HashMap<String, DeviceAgg> = HashMap::new();
        let mut peer_updates = 0usize;
        let mut mismatch_skips = 0usize;

        for row in store_rows {
            if row.device.tenant_id != tenant.id {
                mismatch_skips += 1;
                self.metrics.inc("reconciler.tenant_mismatch_skip");
                warn!(tenant = %tenant.slug, key = %row.peer.public_key, other = %row.device.tenant_id, "cross-tenant peer skipped");
                continue;
            }
            let status = status_map.get(&row.peer.public_key);
            let actual_status = status.map(|s| s.status).unwrap_or(MeshStatus::Missing);
            let last_handshake_at =
                status.and_then(|s| handshake_at_from_age(s.handshake_age, now));

            match self.store.update_peer_actual(PeerActualUpdate {
                public_key: row.peer.public_key.clone(),
                status: actual_status,
                last_handshake_at,
                bytes_rx: status.map(|s| s.rx),
                bytes_tx: status.map(|s| s.tx),
            }) {
                Ok(()) => peer_updates += 1,
                Err(e) => {
                    error!(tenant = %tenant.slug, key = %row.peer.public_key, error = %e, "peer state write failed")
                }
            }

            let entry = agg.entry(row.device.id.clone()).or_insert(DeviceAgg {
                statuses: Vec::new(),
                bytes_rx: 0,
                bytes_tx: 0,
                last_handshake_at: None,
            });
            entry.statuses.push(actual_status);
            if let Some(s) = status {
                entry.bytes_rx += s.rx;
                entry.bytes_tx += s.tx;
            }
            if let Some(at) = last_handshake_at {
                if entry.last_handshake_at.map(|prev| at > prev).unwrap_or(true) {
                    entry.last_handshake_at = Some(at);
                }
            }
        }

        let mut device_updates = 0usize;
        for (device_id, data) in agg {
            match self.store.update_device_actual(DeviceActualUpdate {
                device_id: device_id.clone(),
                status: aggregate_device_status(&data.statuses),
                last_handshake_at: data.last_handshake_at,
                last_seen_at: Some(now),
                bytes_rx: Some(data.bytes_rx),
                bytes_tx: Some(data.bytes_tx),
            }) {
                Ok(()) => device_updates += 1,
                Err(e) => error!(tenant = %tenant.slug, device = %device_id, error = %e, "device state write failed"),
            }
        }

        debug!(
            tenant = %tenant.slug,
            peer_updates,
            device_updates,
            mismatch_skips,
            "observed state written"
        );
    }

    /// Adopt an observed-but-unknown peer into this tenant: placeholder
    /// device, peer row, observed state and a binding from its endpoint.
    /// Peers already owned by another tenant are never re-homed.
    async fn auto_discover_peer(
        &self,
        tenant: &Tenant,
        peer: &ActualPeer,
        status_map: &HashMap<String, PeerStatusInfo>,
        now: i64,
        known_peer_tenant: &mut HashMap<String, String>,
    ) -> Result<bool> {
        if peer.public_key.is_empty() {
            return Ok(false);
        }
        if self
            .store
            .find_peer(&peer.public_key, Some(&tenant.id))?
            .is_some()
        {
            return Ok(false);
        }
        if let Some(existing) = self.store.find_peer(&peer.public_key, None)? {
            if existing.device.tenant_id != tenant.id {
                self.metrics.inc("reconciler.tenant_mismatch_skip");
                warn!(tenant = %tenant.slug, key = %peer.public_key, other = %existing.device.tenant_id, "peer owned by another tenant, not adopted");
                return Ok(false);
            }
        }

        let status = status_map.get(&peer.public_key);
        let actual_status = status.map(|s| s.status).unwrap_or(MeshStatus::Online);
        let endpoint = status
            .and_then(|s| s.endpoint.clone())
            .or_else(|| peer.endpoint.clone());
        let allowed = if peer.allowed.is_empty() {
            "0.0.0.0/32".to_string()
        } else {
            peer.allowed.clone()
        };
        let bus_id = auto_bus_id(&peer.public_key);

        let device = self.store.upsert_device(DeviceUpsert {
            tenant_id: Some(tenant.id.clone()),
            bus_id: bus_id.clone(),
            desired_state: Some(DesiredState::Active),
            ..Default::default()
        })?;
        self.store.upsert_peer(PeerUpsert {
            device_id: device.id.clone(),
            public_key: peer.public_key.clone(),
            allowed_ips: allowed,
            endpoint: endpoint.clone(),
            desired_state: Some(DesiredState::Active),
            ..Default::default()
        })?;
        self.store.update_peer_actual(PeerActualUpdate {
            public_key: peer.public_key.clone(),
            status: actual_status,
            last_handshake_at: status.and_then(|s| handshake_at_from_age(s.handshake_age, now)),
            bytes_rx: status.map(|s| s.rx),
            bytes_tx: status.map(|s| s.tx),
        })?;
        self.store.update_device_actual(DeviceActualUpdate {
            device_id: device.id.clone(),
            status: actual_status,
            last_handshake_at: status.and_then(|s| handshake_at_from_age(s.handshake_age, now)),
            last_seen_at: Some(now),
            bytes_rx: status.map(|s| s.rx),
            bytes_tx: status.map(|s| s.tx),
        })?;

        if let Some(host) = endpoint.as_deref().and_then(endpoint_host) {
            self.create_binding(&peer.public_key, &device.bus_id, &host, Some(tenant)).await;
        }

        self.metrics.inc("reconciler.auto_discovered_peer");
        info!(
            tenant = %tenant.slug,
            key = %peer.public_key,
            device = %device.bus_id,
            endpoint = endpoint.as_deref().unwrap_or(""),
            status = %actual_status,
            "peer adopted"
        );
        known_peer_tenant.insert(peer.public_key.clone(), tenant.id.clone());
        Ok(true)
    }

    async fn create_binding(
        &self,
        public_key: &str,
        bus_id: &str,
        device_addr: &str,
        tenant: Option<&Tenant>,
    ) {
        match self.store.bind_peer(public_key, bus_id, device_addr) {
            Ok(_) => {
                self.metrics.inc("reconciler.binding_created");
                info!(tenant = tenant.map(|t| t.slug.as_str()).unwrap_or(""), key = %public_key, device = %bus_id, addr = %device_addr, "binding created");
            }
            Err(e) => {
                self.metrics.inc("reconciler.binding_error");
                error!(key = %public_key, device = %bus_id, error = %e, "binding creation failed");
            }
        }
    }

    async fn apply_add(&self, d: &DesiredPeer, tenant: Option<&Tenant>) {
        let spec = MeshPeerSpec {
            device_ref: d.bus_id.clone(),
            public_key: d.public_key.clone(),
            allowed_ips: d.allowed.clone(),
        };
        match self.mesh.add_peer(&spec).await {
            Ok(()) => {
                self.metrics.inc("reconciler.added");
                info!(tenant = tenant.map(|t| t.slug.as_str()).unwrap_or(""), key = %d.public_key, device = %d.bus_id, allowed = %d.allowed, "peer synced");
            }
            Err(e) => {
                self.metrics.inc("reconciler.add_error");
                error!(key = %d.public_key, device = %d.bus_id, error = %e, "peer sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconcileConfig, StaticRegistryEntry};
    use crate::mesh::StatusReport;
    use async_trait::async_trait;
    use fleetrelay_common::error::codes;
    use fleetrelay_common::{Error, MeshPeerEntry};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockMesh {
        peers: StdMutex<Vec<MeshPeerEntry>>,
        status: StdMutex<Vec<PeerStatusInfo>>,
        added: StdMutex<Vec<MeshPeerSpec>>,
        removed: StdMutex<Vec<(String, String)>>,
        list_fails_setup: StdMutex<bool>,
    }

    impl MockMesh {
        fn with_peers(peers: Vec<MeshPeerEntry>, status: Vec<PeerStatusInfo>) -> Arc<Self> {
            Arc::new(Self {
                peers: StdMutex::new(peers),
                status: StdMutex::new(status),
                ..Default::default()
            })
        }

        fn added_keys(&self) -> Vec<String> {
            self.added.lock().unwrap().iter().map(|s| s.public_key.clone()).collect()
        }
    }

    #[async_trait]
    impl MeshControl for MockMesh {
        async fn add_peer(&self, spec: &MeshPeerSpec) -> Result<()> {
            self.added.lock().unwrap().push(spec.clone());
            Ok(())
        }

        async fn remove_peer(&self, device_ref: &str, public_key: &str) -> Result<()> {
            self.removed
                .lock()
                .unwrap()
                .push((device_ref.to_string(), public_key.to_string()));
            Ok(())
        }

        async fn list_peers(&self) -> Result<Vec<MeshPeerEntry>> {
            if *self.list_fails_setup.lock().unwrap() {
                return Err(Error::mesh(
                    codes::MESH_INTERFACE_NOT_CONFIGURED,
                    "No such device",
                ));
            }
            Ok(self.peers.lock().unwrap().clone())
        }

        async fn peers_status(&self) -> Result<StatusReport> {
            Ok(StatusReport {
                ok: true,
                peers: self.status.lock().unwrap().clone(),
                error: None,
            })
        }
    }

    fn entry(key: &str, allowed: &str, endpoint: Option<&str>) -> MeshPeerEntry {
        MeshPeerEntry {
            public_key: key.to_string(),
            allowed_ips: allowed.to_string(),
            endpoint: endpoint.map(String::from),
            bus_id: None,
        }
    }

    fn status(key: &str, st: MeshStatus, endpoint: Option<&str>) -> PeerStatusInfo {
        PeerStatusInfo {
            public_key: key.to_string(),
            status: st,
            endpoint: endpoint.map(String::from),
            rx: 100,
            tx: 200,
            handshake_age: Some(30),
        }
    }

    struct Fixture {
        store: Store,
        metrics: Metrics,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Store::open_memory().unwrap(),
            metrics: Metrics::new(),
        }
    }

    /// Seed a desired peer owned by a device in the given tenant
    fn seed_desired(store: &Store, tenant_id: &str, bus_id: &str, key: &str, allowed: &str) {
        let device = store
            .upsert_device(DeviceUpsert {
                tenant_id: Some(tenant_id.to_string()),
                bus_id: bus_id.to_string(),
                device_addr: Some("10.200.1.10".to_string()),
                desired_state: Some(DesiredState::Active),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_peer(PeerUpsert {
                device_id: device.id,
                public_key: key.to_string(),
                allowed_ips: allowed.to_string(),
                desired_state: Some(DesiredState::Active),
                ..Default::default()
            })
            .unwrap();
    }

    fn reconciler(
        fixture: &Fixture,
        mesh: Arc<MockMesh>,
        tune: impl FnOnce(&mut ReconcileConfig),
    ) -> Reconciler {
        let mut config = RelayConfig::default();
        tune(&mut config.reconcile);
        Reconciler::new(
            Arc::new(config),
            fixture.store.clone(),
            mesh,
            fixture.metrics.clone(),
        )
    }

    #[tokio::test]
    async fn test_diff_adds_updates_and_observes_extras() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");
        seed_desired(&f.store, &tenant.id, "dev-b", "PK-B", "10.8.0.3/32,10.9.0.0/24");

        // B is present with a different allowed set, C is unknown
        let mesh = MockMesh::with_peers(
            vec![
                entry("PK-B", "10.8.0.3/32", None),
                entry("PK-C", "10.8.0.9/32", None),
            ],
            vec![status("PK-B", MeshStatus::Online, None)],
        );
        // auto-discovery off so C stays an extra
        let r = reconciler(&f, mesh.clone(), |rc| rc.write_store = false);
        r.reconcile_once().await.unwrap();

        let added = mesh.added_keys();
        assert!(added.contains(&"PK-A".to_string()));
        assert!(added.contains(&"PK-B".to_string()));
        assert_eq!(added.len(), 2);
        // extras are observe-only by default
        assert!(mesh.removed.lock().unwrap().is_empty());
        assert_eq!(f.metrics.get("reconciler.extra_peer"), 1);
    }

    #[tokio::test]
    async fn test_equal_normalized_sets_produce_no_add() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-b", "PK-B", "10.8.0.3/32,10.9.0.0/24");

        let mesh = MockMesh::with_peers(
            // same set, different order and spacing
            vec![entry("PK-B", " 10.9.0.0/24 , 10.8.0.3/32", None)],
            vec![],
        );
        let r = reconciler(&f, mesh.clone(), |rc| rc.write_store = false);
        r.reconcile_once().await.unwrap();
        assert!(mesh.added_keys().is_empty());
    }

    #[tokio::test]
    async fn test_removal_requires_flag_and_device_mapping() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");
        // binding gives PK-C a device mapping; PK-D has none
        f.store.bind_peer("PK-C", "dev-c", "10.200.1.30").unwrap();

        let mesh = MockMesh::with_peers(
            vec![
                entry("PK-A", "10.8.0.2/32", None),
                entry("PK-C", "10.8.0.9/32", None),
                entry("PK-D", "10.8.0.10/32", None),
            ],
            vec![],
        );
        let r = reconciler(&f, mesh.clone(), |rc| {
            rc.remove_extra = true;
            rc.write_store = false;
        });
        r.reconcile_once().await.unwrap();

        let removed = mesh.removed.lock().unwrap().clone();
        assert_eq!(removed, vec![("dev-c".to_string(), "PK-C".to_string())]);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_cycle() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");

        let mesh = MockMesh::with_peers(vec![], vec![]);
        *mesh.list_fails_setup.lock().unwrap() = true;
        let r = reconciler(&f, mesh.clone(), |_| {});
        r.reconcile_once().await.unwrap();
        assert!(mesh.added_keys().is_empty());
        assert_eq!(
            f.metrics
                .get("reconciler.mesh_error_MESH_INTERFACE_NOT_CONFIGURED"),
            1
        );
    }

    #[tokio::test]
    async fn test_auto_discovery_adopts_unknown_peer() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");

        let mesh = MockMesh::with_peers(
            vec![
                entry("PK-A", "10.8.0.2/32", None),
                entry("PK-NEW", "10.8.0.7/32", Some("203.0.113.9:51820")),
            ],
            vec![status("PK-NEW", MeshStatus::Online, Some("203.0.113.9:51820"))],
        );
        let r = reconciler(&f, mesh.clone(), |rc| rc.remove_extra = true);
        r.reconcile_once().await.unwrap();

        // adopted, never removed
        assert!(mesh.removed.lock().unwrap().is_empty());
        assert_eq!(f.metrics.get("reconciler.auto_discovered_peer"), 1);

        let adopted = f.store.find_peer("PK-NEW", Some(&tenant.id)).unwrap().unwrap();
        assert_eq!(adopted.device.bus_id, "auto-PK-NEW");
        assert_eq!(adopted.device.mesh_public_key, "pending:auto-PK-NEW");
        assert_eq!(adopted.peer.actual_status, Some(MeshStatus::Online));

        // binding created from the peer's mesh endpoint host
        let bindings = f.store.list_bindings().unwrap();
        assert!(bindings
            .iter()
            .any(|b| b.public_key == "PK-NEW" && b.device_addr == "203.0.113.9"));
    }

    #[tokio::test]
    async fn test_auto_discovery_respects_other_tenants() {
        let f = fixture();
        let default = f.store.default_tenant().unwrap();
        let other = f.store.create_tenant("acme", "Acme").unwrap();
        seed_desired(&f.store, &default.id, "dev-a", "PK-A", "10.8.0.2/32");
        // PK-X already belongs to acme
        seed_desired(&f.store, &other.id, "dev-x", "PK-X", "10.8.0.5/32");

        let mesh = MockMesh::with_peers(
            vec![
                entry("PK-A", "10.8.0.2/32", None),
                entry("PK-X", "10.8.0.5/32", None),
            ],
            vec![],
        );
        let r = reconciler(&f, mesh.clone(), |_| {});
        r.reconcile_once().await.unwrap();

        // PK-X stays with acme; the default tenant did not adopt it
        let row = f.store.find_peer("PK-X", None).unwrap().unwrap();
        assert_eq!(row.device.tenant_id, other.id);
        assert_eq!(row.device.bus_id, "dev-x");
    }

    #[tokio::test]
    async fn test_persist_actual_state_writes_peer_and_device() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");

        let mesh = MockMesh::with_peers(
            vec![entry("PK-A", "10.8.0.2/32", None)],
            vec![status("PK-A", MeshStatus::Online, None)],
        );
        let r = reconciler(&f, mesh.clone(), |_| {});
        r.reconcile_once().await.unwrap();

        let row = f.store.find_peer("PK-A", None).unwrap().unwrap();
        assert_eq!(row.peer.actual_status, Some(MeshStatus::Online));
        assert_eq!(row.peer.bytes_rx, Some(100));
        let device = f.store.device_by_bus_id("dev-a").unwrap().unwrap();
        assert_eq!(device.actual_status, Some(MeshStatus::Online));
        assert!(device.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_desired_peer_missing_from_mesh_marked_missing() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");

        let mesh = MockMesh::with_peers(vec![], vec![]);
        let r = reconciler(&f, mesh.clone(), |_| {});
        r.reconcile_once().await.unwrap();

        let row = f.store.find_peer("PK-A", None).unwrap().unwrap();
        assert_eq!(row.peer.actual_status, Some(MeshStatus::Missing));
        let device = f.store.device_by_bus_id("dev-a").unwrap().unwrap();
        assert_eq!(device.actual_status, Some(MeshStatus::Missing));
        // the missing desired peer is still pushed to the mesh
        assert_eq!(mesh.added_keys(), vec!["PK-A".to_string()]);
    }

    #[tokio::test]
    async fn test_desired_without_binding_gets_repaired() {
        let f = fixture();
        let tenant = f.store.default_tenant().unwrap();
        seed_desired(&f.store, &tenant.id, "dev-a", "PK-A", "10.8.0.2/32");

        let mesh = MockMesh::with_peers(vec![entry("PK-A", "10.8.0.2/32", None)], vec![]);
        let r = reconciler(&f, mesh.clone(), |_| {});
        r.reconcile_once().await.unwrap();

        let bindings = f.store.list_bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].public_key, "PK-A");
        assert_eq!(bindings[0].bus_id, "dev-a");
        assert_eq!(bindings[0].device_addr, "10.200.1.10");
    }

    #[tokio::test]
    async fn test_single_tenant_mode_uses_registry_only() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("registry.json");
        let registry = StaticRegistry {
            devices: vec![StaticRegistryEntry {
                bus_id: "dev-a".to_string(),
                public_key: "PK-A".to_string(),
                allowed_ips: "10.8.0.2/32".to_string(),
                device_addr: Some("10.200.1.10".to_string()),
            }],
        };
        std::fs::write(&registry_path, serde_json::to_string(&registry).unwrap()).unwrap();

        let mesh = MockMesh::with_peers(vec![entry("PK-Z", "10.8.0.9/32", None)], vec![]);
        let r = reconciler(&f, mesh.clone(), |rc| {
            rc.multi_tenant = false;
            rc.registry_path = Some(registry_path);
        });
        r.reconcile_once().await.unwrap();

        assert_eq!(mesh.added_keys(), vec!["PK-A".to_string()]);
        // binding repaired from the registry's device address
        assert_eq!(f.store.list_bindings().unwrap().len(), 1);
        // extras are only observed in legacy mode
        assert!(mesh.removed.lock().unwrap().is_empty());
        assert_eq!(f.metrics.get("reconciler.extra_peer"), 1);
        // no store writes in legacy mode
        assert!(f.store.find_peer("PK-A", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_registry_when_default_tenant_empty() {
        let f = fixture();
        f.store.default_tenant().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("registry.json");
        let registry = StaticRegistry {
            devices: vec![StaticRegistryEntry {
                bus_id: "dev-a".to_string(),
                public_key: "PK-A".to_string(),
                allowed_ips: "10.8.0.2/32".to_string(),
                device_addr: None,
            }],
        };
        std::fs::write(&registry_path, serde_json::to_string(&registry).unwrap()).unwrap();

        let mesh = MockMesh::with_peers(vec![], vec![]);
        let r = reconciler(&f, mesh.clone(), |rc| {
            rc.registry_path = Some(registry_path);
        });
        r.reconcile_once().await.unwrap();

        assert_eq!(mesh.added_keys(), vec!["PK-A".to_string()]);
        // fallback desired state never creates store records
        assert!(f.store.find_peer("PK-A", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tenant_scoping_excludes_other_tenants_peers() {
        let f = fixture();
        let default = f.store.default_tenant().unwrap();
        let other = f.store.create_tenant("acme", "Acme").unwrap();
        seed_desired(&f.store, &default.id, "dev-a", "PK-A", "10.8.0.2/32");
        seed_desired(&f.store, &other.id, "dev-x", "PK-X", "10.8.0.5/32");

        let mesh = MockMesh::with_peers(
            vec![
                entry("PK-A", "10.8.0.2/32", None),
                entry("PK-X", "10.8.0.5/32", None),
            ],
            vec![],
        );
        let r = reconciler(&f, mesh.clone(), |rc| rc.remove_extra = true);
        r.reconcile_once().await.unwrap();

        // each peer is in sync with its own tenant; nothing is removed
        assert!(mesh.removed.lock().unwrap().is_empty());
    }
}
