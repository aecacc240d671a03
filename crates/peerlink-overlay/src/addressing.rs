//! Overlay address derivation.

use peerlink_types::{Ipv4Cidr, MacAddress};
use std::net::Ipv4Addr;

/// Maps `host` into `prefix`: the network bits come from the prefix, the
/// host bits from the trailing octets of `host`.
///
/// With the default `240.0.0.0/8`, host `10.1.2.3` becomes `240.1.2.3`.
pub fn overlay_ip(prefix: Ipv4Cidr, host: Ipv4Addr) -> Ipv4Addr {
    let len = u32::from(prefix.prefix_len());
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    let net = u32::from(prefix.network()) & mask;
    Ipv4Addr::from(net | (u32::from(host) & !mask))
}

/// MAC of the overlay device on the node whose host IP is `host`.
pub fn overlay_mac(prefix: Ipv4Cidr, host: Ipv4Addr) -> MacAddress {
    MacAddress::from_ipv4(overlay_ip(prefix, host))
}
