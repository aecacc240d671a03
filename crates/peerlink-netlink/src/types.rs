//! Link and address records exchanged over the [`NetConfig`](crate::NetConfig) seam.

use peerlink_types::MacAddress;
use std::fmt;
use std::net::Ipv4Addr;

/// VXLAN attributes of an existing link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VxlanAttrs {
    pub vni: u32,
    pub local: Option<Ipv4Addr>,
    pub port: u16,
    pub parent: Option<String>,
}

/// A network interface as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    /// `vxlan`, `wireguard`, ... (`None` for plain devices)
    pub kind: Option<String>,
    pub mtu: u32,
    pub up: bool,
    pub mac: Option<MacAddress>,
    pub vxlan: Option<VxlanAttrs>,
}

/// Parameters for creating a VXLAN device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    /// VTEP source address.
    pub local: Ipv4Addr,
    pub port: u16,
    /// Underlay device; the kernel picks one by route when unset.
    pub parent: Option<String>,
    pub mtu: u32,
    pub mac: Option<MacAddress>,
}

impl VxlanSpec {
    /// Returns true if `link` is a VXLAN device with the same VNI, source
    /// address and port.
    pub fn matches(&self, link: &Link) -> bool {
        match &link.vxlan {
            Some(attrs) => {
                attrs.vni == self.vni
                    && attrs.local == Some(self.local)
                    && attrs.port == self.port
            }
            None => false,
        }
    }
}

/// An address assigned to an interface (host bits preserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfAddr {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl IfAddr {
    pub const fn new(ip: Ipv4Addr, prefix_len: u8) -> Self {
        Self { ip, prefix_len }
    }
}

impl fmt::Display for IfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}
