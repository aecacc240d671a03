//! Per-cluster NAT mapping set.

use crate::ClusterIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Translations of externally-advertised local IPs into remapped IPs,
/// scoped to one peer cluster.
///
/// Keys are old (real) addresses and are unique within the set by
/// construction. The set is written by the reflection layer and only read
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatMappingSet {
    pub cluster: ClusterIdentity,
    #[serde(default)]
    pub mappings: BTreeMap<Ipv4Addr, Ipv4Addr>,
}

impl NatMappingSet {
    pub fn new(cluster: ClusterIdentity) -> Self {
        Self {
            cluster,
            mappings: BTreeMap::new(),
        }
    }

    /// Adds a mapping (builder pattern).
    pub fn with_mapping(mut self, old_ip: Ipv4Addr, new_ip: Ipv4Addr) -> Self {
        self.mappings.insert(old_ip, new_ip);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
