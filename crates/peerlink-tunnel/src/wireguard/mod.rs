//! WireGuard tunnel driver.
//!
//! One WireGuard interface carries every remote cluster; each cluster is a
//! peer whose allowed IPs are the cluster's effective pod and external
//! CIDRs. The connection counts as established once the peer has completed
//! a handshake within [`HANDSHAKE_TIMEOUT_SECS`].

mod commands;
mod control;
pub mod fake;
mod key;

pub use control::{parse_dump, ShellWgControl, WgControl, WgPeer, WgPeerConfig};
pub use key::{ensure_private_key, is_valid_key};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_netlink::NetConfig;
use peerlink_types::{
    backend_keys, ClusterIdentity, ConnectionDescriptor, ConnectionSpec, ConnectionState,
    ConnectionStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::{DriverConstructor, TunnelDriver};

pub const BACKEND: &str = "wireguard";

pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// WireGuard rekeys every two minutes; a handshake older than this means
/// the peer is gone.
pub const HANDSHAKE_TIMEOUT_SECS: i64 = 180;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardConfig {
    pub interface: String,
    pub listen_port: u16,
    pub mtu: u32,
    pub private_key_path: PathBuf,
    /// Applied when a descriptor does not set `keepalive`; 0 disables it.
    pub keepalive: u16,
}

pub struct WireGuardDriver {
    net: Arc<dyn NetConfig>,
    wg: Arc<dyn WgControl>,
    config: WireGuardConfig,

    /// cluster -> public key configured for it. Only a cache of this run;
    /// peers left by an earlier run are found through [`superseded_by`].
    keys: Mutex<BTreeMap<ClusterIdentity, String>>,
}

/// Builds the registry entry for the WireGuard backend.
pub fn constructor(
    net: Arc<dyn NetConfig>,
    wg: Arc<dyn WgControl>,
    config: WireGuardConfig,
) -> DriverConstructor {
    Box::new(move || {
        Ok(Arc::new(WireGuardDriver::new(net.clone(), wg.clone(), config.clone()))
            as Arc<dyn TunnelDriver>)
    })
}

fn backend_field(key: &str) -> String {
    format!("backendConfig.{}", key)
}

/// Derives the peer configuration for a descriptor.
pub fn peer_config(spec: &ConnectionSpec, default_keepalive: u16) -> PeerlinkResult<WgPeerConfig> {
    let public_key = spec.backend_value(backend_keys::PUBLIC_KEY).ok_or_else(|| {
        PeerlinkError::invalid_config(backend_field(backend_keys::PUBLIC_KEY), "missing")
    })?;
    if !is_valid_key(public_key) {
        return Err(PeerlinkError::invalid_config(
            backend_field(backend_keys::PUBLIC_KEY),
            "not a WireGuard public key",
        ));
    }

    let ip = spec.endpoint_ip().ok_or_else(|| {
        PeerlinkError::invalid_config(
            backend_field(backend_keys::ENDPOINT_IP),
            "missing or invalid",
        )
    })?;
    let port = spec.endpoint_port().ok_or_else(|| {
        PeerlinkError::invalid_config(
            backend_field(backend_keys::ENDPOINT_PORT),
            "missing or invalid",
        )
    })?;
    if port == 0 {
        return Err(PeerlinkError::invalid_config(
            backend_field(backend_keys::ENDPOINT_PORT),
            "must not be 0",
        ));
    }

    let keepalive = match spec.backend_value(backend_keys::KEEPALIVE) {
        Some(v) => v.parse::<u16>().map_err(|_| {
            PeerlinkError::invalid_config(
                backend_field(backend_keys::KEEPALIVE),
                format!("'{}' is not a number of seconds", v),
            )
        })?,
        None => default_keepalive,
    };

    Ok(WgPeerConfig {
        public_key: public_key.to_string(),
        endpoint: SocketAddrV4::new(ip, port),
        allowed_ips: [
            spec.remote_pod_cidr_effective(),
            spec.remote_external_cidr_effective(),
        ]
        .into_iter()
        .collect(),
        keepalive: (keepalive > 0).then_some(keepalive),
    })
}

/// Returns true if `peer` is an older incarnation of the remote `wanted`
/// describes: another key at the same endpoint, or another key carrying
/// exactly the same allowed IPs.
pub fn superseded_by(peer: &WgPeer, wanted: &WgPeerConfig) -> bool {
    peer.public_key != wanted.public_key
        && (peer.endpoint == Some(wanted.endpoint) || peer.allowed_ips == wanted.allowed_ips)
}

/// Maps a peer's handshake age onto a connection state.
pub fn status_for(
    peer: &WgPeerConfig,
    handshake: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ConnectionStatus {
    let (state, message) = match handshake {
        Some(at) if (now - at).num_seconds() <= HANDSHAKE_TIMEOUT_SECS => (
            ConnectionState::Connected,
            format!("handshake {}s ago", (now - at).num_seconds().max(0)),
        ),
        Some(at) => (
            ConnectionState::Connecting,
            format!("last handshake {}s ago", (now - at).num_seconds()),
        ),
        None => (ConnectionState::Connecting, "waiting for first handshake".to_string()),
    };
    ConnectionStatus::new(state, message)
        .with_peer_value(backend_keys::ENDPOINT_IP, peer.endpoint.ip().to_string())
        .with_peer_value(backend_keys::ENDPOINT_PORT, peer.endpoint.port().to_string())
        .with_peer_value(backend_keys::PUBLIC_KEY, peer.public_key.clone())
}

impl WireGuardDriver {
    pub fn new(net: Arc<dyn NetConfig>, wg: Arc<dyn WgControl>, config: WireGuardConfig) -> Self {
        Self {
            net,
            wg,
            config,
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    /// Public key of this end, as peers must configure it.
    pub async fn local_public_key(&self) -> PeerlinkResult<String> {
        self.wg.public_key(&self.config.private_key_path).await
    }
}

#[async_trait]
impl TunnelDriver for WireGuardDriver {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn interface_name(&self) -> &str {
        &self.config.interface
    }

    #[instrument(skip(self), fields(interface = %self.config.interface))]
    async fn init(&self) -> PeerlinkResult<()> {
        let iface = &self.config.interface;
        if self.net.link_by_name(iface).await?.is_none() {
            self.net.add_link(iface, BACKEND).await?;
            info!("Created WireGuard interface {}", iface);
        }
        ensure_private_key(self.wg.as_ref(), &self.config.private_key_path).await?;
        self.wg
            .configure_device(iface, &self.config.private_key_path, self.config.listen_port)
            .await?;
        self.net.set_mtu(iface, self.config.mtu).await?;
        self.net.set_link_up(iface).await?;
        Ok(())
    }

    #[instrument(skip(self, descriptor), fields(cluster = %descriptor.identity()))]
    async fn connect_to_endpoint(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> PeerlinkResult<ConnectionStatus> {
        let iface = &self.config.interface;
        let cluster = descriptor.identity();
        let wanted = peer_config(&descriptor.spec, self.config.keepalive)?;

        let mut keys = self.keys.lock().await;
        let current = self.wg.peers(iface).await?;

        // Keys recorded for other clusters are never treated as stale.
        let others: BTreeSet<String> = keys
            .iter()
            .filter(|(id, _)| *id != cluster)
            .map(|(_, k)| k.clone())
            .collect();
        let recorded = keys.get(cluster).filter(|k| **k != wanted.public_key);
        let stale: Vec<String> = current
            .iter()
            .filter(|p| !others.contains(&p.public_key))
            .filter(|p| recorded == Some(&p.public_key) || superseded_by(p, &wanted))
            .map(|p| p.public_key.clone())
            .collect();
        for old in &stale {
            info!("Public key of cluster {} rotated, removing old peer {}", cluster, old);
            self.wg.remove_peer(iface, old).await?;
        }

        match current.iter().find(|p| p.public_key == wanted.public_key) {
            Some(peer) if peer.matches(&wanted) => {
                debug!("WireGuard peer for cluster {} unchanged", cluster);
            }
            _ => {
                self.wg.set_peer(iface, &wanted).await?;
                info!(
                    "Configured WireGuard peer for cluster {} at {}",
                    cluster, wanted.endpoint
                );
            }
        }
        keys.insert(cluster.clone(), wanted.public_key.clone());
        drop(keys);

        let handshake = self
            .wg
            .peers(iface)
            .await?
            .into_iter()
            .find(|p| p.public_key == wanted.public_key)
            .and_then(|p| p.latest_handshake);
        Ok(status_for(&wanted, handshake, Utc::now()))
    }

    #[instrument(skip(self, descriptor), fields(cluster = %descriptor.identity()))]
    async fn disconnect_from_endpoint(&self, descriptor: &ConnectionDescriptor) -> PeerlinkResult<()> {
        let iface = &self.config.interface;
        let cluster = descriptor.identity();

        // the recorded key wins: the descriptor may already carry a new one
        let mut keys = self.keys.lock().await;
        let key = keys.get(cluster).cloned().or_else(|| {
            descriptor
                .spec
                .backend_value(backend_keys::PUBLIC_KEY)
                .map(str::to_string)
        });
        let Some(key) = key else {
            debug!("No WireGuard key known for cluster {}", cluster);
            return Ok(());
        };

        let present = self
            .wg
            .peers(iface)
            .await?
            .iter()
            .any(|p| p.public_key == key);
        if present {
            self.wg.remove_peer(iface, &key).await?;
            info!("Removed WireGuard peer for cluster {}", cluster);
        }
        keys.remove(cluster);
        Ok(())
    }

    async fn close(&self) -> PeerlinkResult<()> {
        let iface = &self.config.interface;
        if self.net.link_by_name(iface).await?.is_some() {
            self.net.delete_link(iface).await?;
            info!("Deleted WireGuard interface {}", iface);
        }
        self.keys.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::{FakeWgControl, FAKE_PUBLIC_KEY};
    use peerlink_netlink::fake::FakeNetConfig;
    use peerlink_types::Remap;
    use pretty_assertions::assert_eq;

    const IFACE: &str = "wg-plk";
    const REMOTE_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn descriptor() -> ConnectionDescriptor {
        let mut backend_config = BTreeMap::new();
        backend_config.insert(backend_keys::PUBLIC_KEY.to_string(), REMOTE_KEY.to_string());
        backend_config.insert(backend_keys::ENDPOINT_IP.to_string(), "172.18.0.9".to_string());
        backend_config.insert(backend_keys::ENDPOINT_PORT.to_string(), "51820".to_string());
        ConnectionDescriptor::new(ConnectionSpec {
            cluster: ClusterIdentity::new("east").unwrap(),
            local_pod_cidr: "10.0.0.0/16".parse().unwrap(),
            local_remapped_pod_cidr: Remap::None,
            remote_pod_cidr: "10.0.0.0/16".parse().unwrap(),
            remote_remapped_pod_cidr: Remap::Cidr("10.50.0.0/16".parse().unwrap()),
            local_external_cidr: "10.201.0.0/16".parse().unwrap(),
            local_remapped_external_cidr: Remap::None,
            remote_external_cidr: "10.201.0.0/16".parse().unwrap(),
            remote_remapped_external_cidr: Remap::Cidr("10.60.0.0/16".parse().unwrap()),
            backend_type: BACKEND.to_string(),
            backend_config,
            gateway_pod_ip: None,
        })
    }

    struct Harness {
        _dir: tempfile::TempDir,
        net: Arc<FakeNetConfig>,
        wg: Arc<FakeWgControl>,
        driver: WireGuardDriver,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNetConfig::new());
        let wg = Arc::new(FakeWgControl::new());
        let driver = WireGuardDriver::new(
            net.clone(),
            wg.clone(),
            WireGuardConfig {
                interface: IFACE.to_string(),
                listen_port: DEFAULT_LISTEN_PORT,
                mtu: 1420,
                private_key_path: dir.path().join("wg.key"),
                keepalive: 25,
            },
        );
        driver.init().await.unwrap();
        Harness {
            _dir: dir,
            net,
            wg,
            driver,
        }
    }

    #[tokio::test]
    async fn test_init_creates_and_configures_interface() {
        let h = harness().await;
        let link = h.net.link(IFACE).unwrap();
        assert_eq!(link.kind.as_deref(), Some(BACKEND));
        assert_eq!(link.mtu, 1420);
        assert!(link.up);
        assert_eq!(h.wg.device(IFACE).unwrap().listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(h.driver.local_public_key().await.unwrap(), FAKE_PUBLIC_KEY);

        // second init reuses everything
        h.driver.init().await.unwrap();
    }

    #[test]
    fn test_peer_config_uses_effective_cidrs() {
        let peer = peer_config(&descriptor().spec, 25).unwrap();
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|c| c.to_string()).collect();
        assert_eq!(allowed, vec!["10.50.0.0/16", "10.60.0.0/16"]);
        assert_eq!(peer.keepalive, Some(25));
    }

    #[test]
    fn test_peer_config_rejects_bad_key() {
        let mut d = descriptor();
        d.spec
            .backend_config
            .insert(backend_keys::PUBLIC_KEY.to_string(), "short".to_string());
        let err = peer_config(&d.spec, 25).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let h = harness().await;
        let d = descriptor();

        let status = h.driver.connect_to_endpoint(&d).await.unwrap();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.peer_configuration[backend_keys::PUBLIC_KEY], REMOTE_KEY);
        let mutations = h.wg.mutation_count();

        h.driver.connect_to_endpoint(&d).await.unwrap();
        assert_eq!(h.wg.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_recent_handshake_reports_connected() {
        let h = harness().await;
        let d = descriptor();
        h.driver.connect_to_endpoint(&d).await.unwrap();
        h.wg.set_handshake(IFACE, REMOTE_KEY, Utc::now());

        let status = h.driver.connect_to_endpoint(&d).await.unwrap();
        assert!(status.is_connected());
    }

    #[test]
    fn test_stale_handshake_reports_connecting() {
        let peer = peer_config(&descriptor().spec, 25).unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(HANDSHAKE_TIMEOUT_SECS + 1);
        assert_eq!(status_for(&peer, Some(old), now).state, ConnectionState::Connecting);
        assert_eq!(status_for(&peer, Some(now), now).state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_endpoint_change_reconfigures_peer() {
        let h = harness().await;
        let mut d = descriptor();
        h.driver.connect_to_endpoint(&d).await.unwrap();

        d.spec
            .backend_config
            .insert(backend_keys::ENDPOINT_IP.to_string(), "172.18.0.10".to_string());
        h.driver.connect_to_endpoint(&d).await.unwrap();
        let peer = h.wg.peer(IFACE, REMOTE_KEY).unwrap();
        assert_eq!(peer.endpoint.unwrap().ip().to_string(), "172.18.0.10");
    }

    #[tokio::test]
    async fn test_key_rotation_drops_old_peer() {
        let h = harness().await;
        let mut d = descriptor();
        h.driver.connect_to_endpoint(&d).await.unwrap();

        d.spec
            .backend_config
            .insert(backend_keys::PUBLIC_KEY.to_string(), FAKE_PUBLIC_KEY.to_string());
        h.driver.connect_to_endpoint(&d).await.unwrap();
        assert!(h.wg.peer(IFACE, REMOTE_KEY).is_none());
        assert!(h.wg.peer(IFACE, FAKE_PUBLIC_KEY).is_some());
    }

    #[tokio::test]
    async fn test_key_rotated_across_restart_drops_old_peer() {
        let h = harness().await;
        let mut d = descriptor();
        h.driver.connect_to_endpoint(&d).await.unwrap();

        // a fresh driver has no memory of the old key
        let restarted = WireGuardDriver::new(h.net.clone(), h.wg.clone(), h.driver.config.clone());
        d.spec
            .backend_config
            .insert(backend_keys::PUBLIC_KEY.to_string(), FAKE_PUBLIC_KEY.to_string());
        restarted.connect_to_endpoint(&d).await.unwrap();

        assert!(h.wg.peer(IFACE, REMOTE_KEY).is_none());
        assert!(h.wg.peer(IFACE, FAKE_PUBLIC_KEY).is_some());
    }

    #[tokio::test]
    async fn test_unrelated_peer_survives_connect() {
        let h = harness().await;
        let other = WgPeerConfig {
            public_key: FAKE_PUBLIC_KEY.to_string(),
            endpoint: "172.18.0.20:51820".parse().unwrap(),
            allowed_ips: ["10.70.0.0/16".parse().unwrap()].into_iter().collect(),
            keepalive: None,
        };
        h.wg.set_peer(IFACE, &other).await.unwrap();

        h.driver.connect_to_endpoint(&descriptor()).await.unwrap();
        assert!(h.wg.peer(IFACE, FAKE_PUBLIC_KEY).is_some());
        assert!(h.wg.peer(IFACE, REMOTE_KEY).is_some());
    }

    #[test]
    fn test_superseded_by_matches_endpoint_or_allowed_ips() {
        let wanted = peer_config(&descriptor().spec, 25).unwrap();
        let mut old = WgPeer {
            public_key: FAKE_PUBLIC_KEY.to_string(),
            endpoint: Some(wanted.endpoint),
            allowed_ips: BTreeSet::new(),
            keepalive: None,
            latest_handshake: None,
        };
        assert!(superseded_by(&old, &wanted));

        old.endpoint = None;
        assert!(!superseded_by(&old, &wanted));
        old.allowed_ips = wanted.allowed_ips.clone();
        assert!(superseded_by(&old, &wanted));

        old.public_key = wanted.public_key.clone();
        assert!(!superseded_by(&old, &wanted));
    }

    #[tokio::test]
    async fn test_disconnect_absent_peer_is_ok() {
        let h = harness().await;
        let d = descriptor();
        h.driver.disconnect_from_endpoint(&d).await.unwrap();

        h.driver.connect_to_endpoint(&d).await.unwrap();
        h.driver.disconnect_from_endpoint(&d).await.unwrap();
        assert!(h.wg.peer(IFACE, REMOTE_KEY).is_none());
        h.driver.disconnect_from_endpoint(&d).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_deletes_interface() {
        let h = harness().await;
        h.driver.close().await.unwrap();
        assert!(h.net.link(IFACE).is_none());
        h.driver.close().await.unwrap();
    }
}
