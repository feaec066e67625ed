//! Mesh interface wrapper
//!
//! Seam over the WireGuard control surface: peer add/remove, the configured
//! peer list and the liveness dump. The CLI-backed implementation shells out
//! to `wg`; reconciliation and tests depend only on the trait.

use async_trait::async_trait;
use fleetrelay_common::error::codes;
use fleetrelay_common::{now_ms, Error, MeshPeerEntry, MeshStatus, PeerStatusInfo, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A handshake younger than this counts as online
const ONLINE_HANDSHAKE_AGE_SECS: i64 = 180;

/// Peer configuration pushed to the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPeerSpec {
    pub device_ref: String,
    pub public_key: String,
    pub allowed_ips: String,
}

/// Liveness dump result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub ok: bool,
    pub peers: Vec<PeerStatusInfo>,
    pub error: Option<String>,
}

/// Mesh control surface consumed by the reconciler
#[async_trait]
pub trait MeshControl: Send + Sync {
    async fn add_peer(&self, spec: &MeshPeerSpec) -> Result<()>;

    /// Remove a peer. Callers must have resolved the owning device; peers
    /// without a device mapping are never removed.
    async fn remove_peer(&self, device_ref: &str, public_key: &str) -> Result<()>;

    async fn list_peers(&self) -> Result<Vec<MeshPeerEntry>>;

    async fn peers_status(&self) -> Result<StatusReport>;
}

/// `wg`-CLI implementation
pub struct WgCli {
    interface: String,
}

impl WgCli {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn wg(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("wg")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::mesh(codes::MESH_COMMAND_FAILED, format!("spawn wg: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = if stderr.contains("No such device") || stderr.contains("Unable to access interface") {
                codes::MESH_INTERFACE_NOT_CONFIGURED
            } else {
                codes::MESH_COMMAND_FAILED
            };
            return Err(Error::mesh(code, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl MeshControl for WgCli {
    async fn add_peer(&self, spec: &MeshPeerSpec) -> Result<()> {
        self.wg(&[
            "set",
            &self.interface,
            "peer",
            &spec.public_key,
            "allowed-ips",
            &spec.allowed_ips,
        ])
        .await?;
        debug!(device = %spec.device_ref, key = %spec.public_key, "mesh peer set");
        Ok(())
    }

    async fn remove_peer(&self, device_ref: &str, public_key: &str) -> Result<()> {
        self.wg(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        debug!(device = %device_ref, key = %public_key, "mesh peer removed");
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<MeshPeerEntry>> {
        let dump = self
            .wg(&["show", &self.interface, "dump"])
            .await
            .map_err(|e| match e {
                Error::Mesh { code, message } if code == codes::MESH_INTERFACE_NOT_CONFIGURED => {
                    Error::mesh(code, message)
                }
                other => Error::mesh(codes::MESH_LIST_PEERS_FAILED, other.to_string()),
            })?;
        Ok(parse_dump(&dump, now_ms())
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    async fn peers_status(&self) -> Result<StatusReport> {
        match self.wg(&["show", &self.interface, "dump"]).await {
            Ok(dump) => Ok(StatusReport {
                ok: true,
                peers: parse_dump(&dump, now_ms())
                    .into_iter()
                    .map(|(_, status)| status)
                    .collect(),
                error: None,
            }),
            Err(e) => Ok(StatusReport {
                ok: false,
                peers: Vec::new(),
                error: Some(e.to_string()),
            }),
        }
    }
}

/// Parse `wg show <iface> dump` output. The first line describes the
/// interface itself; each following line is one peer:
/// `pubkey psk endpoint allowed-ips latest-handshake rx tx keepalive`
fn parse_dump(dump: &str, now: i64) -> Vec<(MeshPeerEntry, PeerStatusInfo)> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let public_key = fields[0].to_string();
            let endpoint = match fields[2] {
                "" | "(none)" => None,
                other => Some(other.to_string()),
            };
            let allowed_ips = fields[3].to_string();
            let handshake_secs: i64 = fields[4].parse().unwrap_or(0);
            let rx: i64 = fields[5].parse().unwrap_or(0);
            let tx: i64 = fields[6].parse().unwrap_or(0);

            let (status, handshake_age) = if handshake_secs == 0 {
                (MeshStatus::NeverConnected, None)
            } else {
                let age = (now / 1000 - handshake_secs).max(0);
                let status = if age <= ONLINE_HANDSHAKE_AGE_SECS {
                    MeshStatus::Online
                } else {
                    MeshStatus::Offline
                };
                (status, Some(age))
            };

            let entry = MeshPeerEntry {
                public_key: public_key.clone(),
                allowed_ips,
                endpoint: endpoint.clone(),
                bus_id: None,
            };
            let info = PeerStatusInfo {
                public_key,
                status,
                endpoint,
                rx,
                tx,
                handshake_age,
            };
            Some((entry, info))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "privkey\tpubkey-self\t51820\toff\n\
        PK-A\t(none)\t203.0.113.9:51820\t10.8.0.2/32\t1700000000\t1024\t2048\t25\n\
        PK-B\t(none)\t(none)\t10.8.0.3/32,10.9.0.0/24\t0\t0\t0\toff\n";

    #[test]
    fn test_parse_dump_status_and_entries() {
        // 60 seconds after PK-A's handshake
        let now = (1_700_000_000 + 60) * 1000;
        let parsed = parse_dump(DUMP, now);
        assert_eq!(parsed.len(), 2);

        let (entry_a, status_a) = &parsed[0];
        assert_eq!(entry_a.public_key, "PK-A");
        assert_eq!(entry_a.endpoint.as_deref(), Some("203.0.113.9:51820"));
        assert_eq!(status_a.status, MeshStatus::Online);
        assert_eq!(status_a.handshake_age, Some(60));
        assert_eq!(status_a.rx, 1024);

        let (entry_b, status_b) = &parsed[1];
        assert_eq!(entry_b.allowed_ips, "10.8.0.3/32,10.9.0.0/24");
        assert!(entry_b.endpoint.is_none());
        assert_eq!(status_b.status, MeshStatus::NeverConnected);
        assert_eq!(status_b.handshake_age, None);
    }

    #[test]
    fn test_parse_dump_offline_after_threshold() {
        let now = (1_700_000_000 + ONLINE_HANDSHAKE_AGE_SECS + 1) * 1000;
        let parsed = parse_dump(DUMP, now);
        assert_eq!(parsed[0].1.status, MeshStatus::Offline);
    }
}
