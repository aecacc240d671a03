//! Shell command builders for `ip` and `bridge`.

use peerlink_common::shell::{shellquote, BRIDGE_CMD, IP_CMD};
use peerlink_types::{Neighbor, PolicyRule, RouteEntry, TableId};

use crate::types::{IfAddr, VxlanSpec};

pub fn build_show_link_cmd(name: &str) -> String {
    format!("{} -j -d link show dev {}", IP_CMD, shellquote(name))
}

pub fn build_add_vxlan_cmd(spec: &VxlanSpec) -> String {
    let mut cmd = format!(
        "{} link add {} type vxlan id {} local {} dstport {} nolearning",
        IP_CMD,
        shellquote(&spec.name),
        spec.vni,
        spec.local,
        spec.port
    );
    if let Some(parent) = &spec.parent {
        cmd.push_str(&format!(" dev {}", shellquote(parent)));
    }
    if let Some(mac) = spec.mac {
        cmd.push_str(&format!(" address {}", mac));
    }
    cmd
}

pub fn build_add_link_cmd(name: &str, kind: &str) -> String {
    format!(
        "{} link add dev {} type {}",
        IP_CMD,
        shellquote(name),
        shellquote(kind)
    )
}

pub fn build_del_link_cmd(name: &str) -> String {
    format!("{} link del dev {}", IP_CMD, shellquote(name))
}

pub fn build_set_link_up_cmd(name: &str) -> String {
    format!("{} link set dev {} up", IP_CMD, shellquote(name))
}

pub fn build_set_mtu_cmd(name: &str, mtu: u32) -> String {
    format!("{} link set dev {} mtu {}", IP_CMD, shellquote(name), mtu)
}

pub fn build_list_addr_cmd(name: &str) -> String {
    format!("{} -j -4 addr show dev {}", IP_CMD, shellquote(name))
}

pub fn build_add_addr_cmd(name: &str, addr: IfAddr) -> String {
    format!(
        "{} addr add {} dev {}",
        IP_CMD,
        shellquote(&addr.to_string()),
        shellquote(name)
    )
}

pub fn build_del_addr_cmd(name: &str, addr: IfAddr) -> String {
    format!(
        "{} addr del {} dev {}",
        IP_CMD,
        shellquote(&addr.to_string()),
        shellquote(name)
    )
}

pub fn build_list_fdb_cmd(dev: &str) -> String {
    format!("{} -j fdb show dev {}", BRIDGE_CMD, shellquote(dev))
}

/// `append` allows several VTEPs for the same (all-zero) MAC.
pub fn build_append_fdb_cmd(dev: &str, neighbor: &Neighbor) -> String {
    format!(
        "{} fdb append {} dev {} dst {}",
        BRIDGE_CMD,
        neighbor.mac,
        shellquote(dev),
        neighbor.ip
    )
}

pub fn build_del_fdb_cmd(dev: &str, neighbor: &Neighbor) -> String {
    format!(
        "{} fdb del {} dev {} dst {}",
        BRIDGE_CMD,
        neighbor.mac,
        shellquote(dev),
        neighbor.ip
    )
}

pub fn build_list_routes_cmd(table: TableId) -> String {
    format!("{} -j -4 route show table {}", IP_CMD, table)
}

fn route_args(route: &RouteEntry) -> String {
    let mut args = shellquote(&route.dst.to_string());
    if let Some(gw) = route.gateway {
        args.push_str(&format!(" via {}", gw));
    }
    args.push_str(&format!(
        " dev {} table {}",
        shellquote(&route.device),
        route.table
    ));
    if route.onlink {
        args.push_str(" onlink");
    }
    args
}

pub fn build_add_route_cmd(route: &RouteEntry) -> String {
    format!("{} route add {}", IP_CMD, route_args(route))
}

pub fn build_del_route_cmd(route: &RouteEntry) -> String {
    format!("{} route del {}", IP_CMD, route_args(route))
}

pub fn build_list_rules_cmd() -> String {
    format!("{} -j -4 rule show", IP_CMD)
}

fn rule_args(rule: &PolicyRule) -> String {
    let mut args = format!("pref {}", rule.priority);
    if let Some(src) = rule.src {
        args.push_str(&format!(" from {}", shellquote(&src.to_string())));
    }
    if let Some(dst) = rule.dst {
        args.push_str(&format!(" to {}", shellquote(&dst.to_string())));
    }
    args.push_str(&format!(" lookup {}", rule.table));
    args
}

pub fn build_add_rule_cmd(rule: &PolicyRule) -> String {
    format!("{} rule add {}", IP_CMD, rule_args(rule))
}

pub fn build_del_rule_cmd(rule: &PolicyRule) -> String {
    format!("{} rule del {}", IP_CMD, rule_args(rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_types::MacAddress;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn test_build_add_vxlan_cmd() {
        let spec = VxlanSpec {
            name: "vxlan.plk".to_string(),
            vni: 18952,
            local: Ipv4Addr::new(10, 0, 0, 5),
            port: 4789,
            parent: Some("eth0".to_string()),
            mtu: 1450,
            mac: Some(MacAddress::from_ipv4(Ipv4Addr::new(10, 0, 0, 5))),
        };
        assert_eq!(
            build_add_vxlan_cmd(&spec),
            "/sbin/ip link add \"vxlan.plk\" type vxlan id 18952 local 10.0.0.5 dstport 4789 \
             nolearning dev \"eth0\" address 02:50:0a:00:00:05"
        );
    }

    #[test]
    fn test_build_fdb_cmds() {
        let neighbor = Neighbor::new(MacAddress::ZERO, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(
            build_append_fdb_cmd("vxlan.plk", &neighbor),
            "/sbin/bridge fdb append 00:00:00:00:00:00 dev \"vxlan.plk\" dst 10.0.0.6"
        );
        assert!(build_del_fdb_cmd("vxlan.plk", &neighbor).starts_with("/sbin/bridge fdb del"));
    }

    #[test]
    fn test_build_route_cmds() {
        let route = RouteEntry::new(
            "10.0.1.2/32".parse().unwrap(),
            "vxlan.plk",
            TableId::new(18953).unwrap(),
        )
        .via(Ipv4Addr::new(240, 1, 0, 3))
        .onlink();
        assert_eq!(
            build_add_route_cmd(&route),
            "/sbin/ip route add \"10.0.1.2/32\" via 240.1.0.3 dev \"vxlan.plk\" table 18953 onlink"
        );
        assert!(build_del_route_cmd(&route).starts_with("/sbin/ip route del"));
    }

    #[test]
    fn test_build_rule_cmds() {
        let rule = PolicyRule::to_destination(
            "10.50.0.0/16".parse().unwrap(),
            TableId::new(18952).unwrap(),
            200,
        );
        assert_eq!(
            build_add_rule_cmd(&rule),
            "/sbin/ip rule add pref 200 to \"10.50.0.0/16\" lookup 18952"
        );
    }

    #[test]
    fn test_shellquote_safety() {
        let cmd = build_del_link_cmd("wg0; rm -rf /");
        assert!(cmd.contains("\"wg0; rm -rf /\""));
    }
}
