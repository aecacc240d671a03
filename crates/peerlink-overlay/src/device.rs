//! Overlay VXLAN device parameters.

use peerlink_netlink::{IfAddr, VxlanSpec};
use peerlink_types::{Ipv4Cidr, MacAddress};
use std::net::Ipv4Addr;

use crate::addressing::{overlay_ip, overlay_mac};

/// Standard IANA VXLAN port.
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDeviceConfig {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub mtu: u32,
    /// Well-known block overlay addresses are mapped into.
    pub prefix: Ipv4Cidr,
    /// This node's host IP, used as the VTEP source address.
    pub host_ip: Ipv4Addr,
    pub parent: Option<String>,
}

impl OverlayDeviceConfig {
    pub fn vxlan_spec(&self) -> VxlanSpec {
        VxlanSpec {
            name: self.name.clone(),
            vni: self.vni,
            local: self.host_ip,
            port: self.port,
            parent: self.parent.clone(),
            mtu: self.mtu,
            mac: Some(self.mac()),
        }
    }

    pub fn overlay_ip(&self) -> Ipv4Addr {
        overlay_ip(self.prefix, self.host_ip)
    }

    pub fn mac(&self) -> MacAddress {
        overlay_mac(self.prefix, self.host_ip)
    }

    /// Address assigned to the device: the overlay IP with the block's
    /// prefix length.
    pub fn address(&self) -> IfAddr {
        IfAddr::new(self.overlay_ip(), self.prefix.prefix_len())
    }
}

/// What [`OverlayManager::ensure_device`](crate::OverlayManager::ensure_device) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Created,
    /// An existing device matched VNI, source address and port.
    Reused,
    /// An existing device did not match and was deleted and recreated.
    Replaced,
}
