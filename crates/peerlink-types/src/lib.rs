//! Common types for the peerlink inter-cluster network fabric.
//!
//! This crate provides the data model shared by every fabric component:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`Ipv4Cidr`] / [`Remap`]: IPv4 networks and the "no remap" sentinel
//! - [`ClusterIdentity`]: opaque peer cluster identity and its chain token
//! - [`ConnectionDescriptor`]: one cluster-to-cluster peering
//! - [`NatMappingSet`]: per-cluster old-IP to remapped-IP translations
//! - [`Neighbor`], [`RouteEntry`], [`PolicyRule`], [`TableId`]: kernel records

mod cidr;
mod cluster;
mod connection;
mod mac;
mod natmap;
mod neighbor;
mod route;

pub use cidr::{Ipv4Cidr, Remap};
pub use cluster::ClusterIdentity;
pub use connection::{
    backend_keys, ConnectionDescriptor, ConnectionSpec, ConnectionState, ConnectionStatus,
    DescriptorStatus, Phase, FINALIZER,
};
pub use mac::MacAddress;
pub use natmap::NatMappingSet;
pub use neighbor::Neighbor;
pub use route::{PolicyRule, RouteEntry, TableId};

/// Common error type for parsing and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("routing table ID {0} is outside the valid kernel range")]
    InvalidTableId(u32),

    #[error("remapped CIDR {remapped} for {field} overlaps {original}")]
    OverlappingRemap {
        field: String,
        original: String,
        remapped: String,
    },

    #[error("cluster identity must not be empty")]
    EmptyClusterIdentity,
}
