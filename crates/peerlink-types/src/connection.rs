//! Connection descriptor: the declarative record of one peering.

use crate::{ClusterIdentity, Ipv4Cidr, ParseError, Remap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Finalizer that defers descriptor deletion until tunnel teardown completes.
pub const FINALIZER: &str = "peerlink.io/tunnel-cleanup";

/// Well-known keys of the backend configuration map.
pub mod backend_keys {
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const ENDPOINT_IP: &str = "endpointIP";
    pub const ENDPOINT_PORT: &str = "endpointPort";
    pub const KEEPALIVE: &str = "keepalive";
}

/// Desired state of a peering, written by the peering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    pub cluster: ClusterIdentity,
    pub local_pod_cidr: Ipv4Cidr,
    #[serde(default)]
    pub local_remapped_pod_cidr: Remap,
    pub remote_pod_cidr: Ipv4Cidr,
    #[serde(default)]
    pub remote_remapped_pod_cidr: Remap,
    pub local_external_cidr: Ipv4Cidr,
    #[serde(default)]
    pub local_remapped_external_cidr: Remap,
    pub remote_external_cidr: Ipv4Cidr,
    #[serde(default)]
    pub remote_remapped_external_cidr: Remap,
    pub backend_type: String,
    #[serde(default)]
    pub backend_config: BTreeMap<String, String>,
    /// IP of the local gateway pod, when known.
    #[serde(default)]
    pub gateway_pod_ip: Option<Ipv4Addr>,
}

impl ConnectionSpec {
    /// Checks that every remapped CIDR is disjoint from the CIDR it remaps.
    pub fn validate(&self) -> Result<(), ParseError> {
        let pairs = [
            ("localRemappedPodCIDR", self.local_pod_cidr, self.local_remapped_pod_cidr),
            ("remoteRemappedPodCIDR", self.remote_pod_cidr, self.remote_remapped_pod_cidr),
            (
                "localRemappedExternalCIDR",
                self.local_external_cidr,
                self.local_remapped_external_cidr,
            ),
            (
                "remoteRemappedExternalCIDR",
                self.remote_external_cidr,
                self.remote_remapped_external_cidr,
            ),
        ];
        for (field, original, remap) in pairs {
            if let Remap::Cidr(remapped) = remap {
                if remapped.overlaps(&original) {
                    return Err(ParseError::OverlappingRemap {
                        field: field.to_string(),
                        original: original.to_string(),
                        remapped: remapped.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Remote pod CIDR as seen from this cluster.
    pub fn remote_pod_cidr_effective(&self) -> Ipv4Cidr {
        self.remote_remapped_pod_cidr.effective(self.remote_pod_cidr)
    }

    /// Remote external CIDR as seen from this cluster.
    pub fn remote_external_cidr_effective(&self) -> Ipv4Cidr {
        self.remote_remapped_external_cidr
            .effective(self.remote_external_cidr)
    }

    /// Local pod CIDR as seen by the remote cluster.
    pub fn local_pod_cidr_effective(&self) -> Ipv4Cidr {
        self.local_remapped_pod_cidr.effective(self.local_pod_cidr)
    }

    /// Local external CIDR as seen by the remote cluster.
    pub fn local_external_cidr_effective(&self) -> Ipv4Cidr {
        self.local_remapped_external_cidr
            .effective(self.local_external_cidr)
    }

    /// Remote gateway endpoint address, once the peering layer has learned it.
    pub fn endpoint_ip(&self) -> Option<Ipv4Addr> {
        self.backend_config
            .get(backend_keys::ENDPOINT_IP)
            .and_then(|ip| ip.parse().ok())
    }

    pub fn endpoint_port(&self) -> Option<u16> {
        self.backend_config
            .get(backend_keys::ENDPOINT_PORT)
            .and_then(|port| port.parse().ok())
    }

    pub fn backend_value(&self, key: &str) -> Option<&str> {
        self.backend_config.get(key).map(String::as_str)
    }
}

/// Lifecycle phase persisted on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Ready,
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Ready => "Ready",
            Phase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Link state reported by a tunnel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    ConnectionError,
}

/// Result of `ConnectToEndpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub peer_configuration: BTreeMap<String, String>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            peer_configuration: BTreeMap::new(),
        }
    }

    /// Adds a peer configuration entry (builder pattern).
    pub fn with_peer_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.peer_configuration.insert(key.into(), value.into());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Observed state written back by the connection reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub connection: Option<ConnectionStatus>,
    #[serde(default)]
    pub tunnel_interface: Option<String>,
    /// Endpoint this cluster's gateway is reachable at, as advertised by
    /// the gateway Service.
    #[serde(default)]
    pub local_endpoint: Option<SocketAddrV4>,
}

/// One cluster-to-cluster peering as held by the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub spec: ConnectionSpec,
    #[serde(default)]
    pub status: DescriptorStatus,
    #[serde(default)]
    pub finalizers: BTreeSet<String>,
    /// Set once deletion has been requested; physical removal waits for
    /// the finalizer list to drain.
    #[serde(default)]
    pub deletion_requested: bool,
    /// Optimistic-concurrency token maintained by the store.
    #[serde(default)]
    pub resource_version: u64,
}

impl ConnectionDescriptor {
    pub fn new(spec: ConnectionSpec) -> Self {
        Self {
            spec,
            status: DescriptorStatus::default(),
            finalizers: BTreeSet::new(),
            deletion_requested: false,
            resource_version: 0,
        }
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.spec.cluster
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.contains(FINALIZER)
    }

    pub fn is_ready(&self) -> bool {
        self.status.phase == Phase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec() -> ConnectionSpec {
        ConnectionSpec {
            cluster: ClusterIdentity::new("east").unwrap(),
            local_pod_cidr: "10.0.0.0/16".parse().unwrap(),
            local_remapped_pod_cidr: Remap::None,
            remote_pod_cidr: "10.0.0.0/16".parse().unwrap(),
            remote_remapped_pod_cidr: "10.50.0.0/16".parse().unwrap(),
            local_external_cidr: "10.201.0.0/16".parse().unwrap(),
            local_remapped_external_cidr: Remap::None,
            remote_external_cidr: "10.201.0.0/16".parse().unwrap(),
            remote_remapped_external_cidr: "10.60.0.0/16".parse().unwrap(),
            backend_type: "wireguard".to_string(),
            backend_config: BTreeMap::new(),
            gateway_pod_ip: None,
        }
    }

    #[test]
    fn test_effective_cidrs() {
        let spec = spec();
        assert_eq!(spec.remote_pod_cidr_effective().to_string(), "10.50.0.0/16");
        assert_eq!(spec.remote_external_cidr_effective().to_string(), "10.60.0.0/16");
        assert_eq!(spec.local_pod_cidr_effective().to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_validate_rejects_overlapping_remap() {
        let mut spec = spec();
        assert!(spec.validate().is_ok());
        spec.local_remapped_pod_cidr = "10.0.128.0/17".parse().unwrap();
        assert!(matches!(
            spec.validate(),
            Err(ParseError::OverlappingRemap { .. })
        ));
    }

    #[test]
    fn test_endpoint_unknown_until_set() {
        let mut spec = spec();
        assert_eq!(spec.endpoint_ip(), None);
        spec.backend_config
            .insert(backend_keys::ENDPOINT_IP.to_string(), "172.18.0.4".to_string());
        assert_eq!(spec.endpoint_ip(), Some(Ipv4Addr::new(172, 18, 0, 4)));
    }

    #[test]
    fn test_descriptor_json_uses_sentinel() {
        let json = serde_json::to_value(ConnectionDescriptor::new(spec())).unwrap();
        assert_eq!(json["spec"]["localRemappedPodCidr"], "None");
        assert_eq!(json["status"]["phase"], "Pending");
    }
}
