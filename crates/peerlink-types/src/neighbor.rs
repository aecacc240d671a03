//! Overlay forwarding-database entry.

use crate::MacAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A VXLAN FDB entry: frames for `mac` are tunnelled to VTEP `ip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Neighbor {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
}

impl Neighbor {
    pub const fn new(mac: MacAddress, ip: Ipv4Addr) -> Self {
        Self { mac, ip }
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dst {}", self.mac, self.ip)
    }
}
