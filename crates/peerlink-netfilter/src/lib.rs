//! Packet-filter rule engine for the peerlink fabric.
//!
//! Four top-level chains (`PLK-INPUT`, `PLK-FORWARD`, `PLK-PREROUTING`,
//! `PLK-POSTROUTING`) are hooked into the kernel built-ins. Each peered
//! cluster gets its own chains under them, reached through destination- or
//! source-matched jumps, so a packet only ever scans the dispatch rules plus
//! the chains of the one cluster it belongs to.
//!
//! - [`PacketFilter`]: kernel seam ([`ShellPacketFilter`], [`fake::FakePacketFilter`])
//! - [`chains`]: chain naming
//! - [`rules`]: desired-state computation
//! - [`RuleEngine`]: diff-and-converge against the kernel

pub mod chains;
pub mod fake;
mod filter;
mod handler;
mod rule;
pub mod rules;
pub mod shell;

pub use filter::PacketFilter;
pub use handler::{RuleEngine, SyncStats};
pub use rule::{RuleSpec, Table};
pub use rules::Baseline;
pub use shell::ShellPacketFilter;

#[cfg(test)]
pub(crate) mod testutil {
    use peerlink_types::{ClusterIdentity, ConnectionSpec, Remap};
    use std::collections::BTreeMap;

    /// A peering with both remote CIDRs remapped and nothing local remapped.
    pub fn spec(cluster: &str) -> ConnectionSpec {
        ConnectionSpec {
            cluster: ClusterIdentity::new(cluster).unwrap(),
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
}
