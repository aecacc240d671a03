//! Parsers for the JSON output of `ip -j` and `bridge -j`.

use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::{Ipv4Cidr, MacAddress, Neighbor, PolicyRule, RouteEntry, TableId};
use serde::Deserialize;
use std::net::Ipv4Addr;

use crate::types::{IfAddr, Link, VxlanAttrs};

fn from_json<'a, T: Deserialize<'a>>(operation: &str, output: &'a str) -> PeerlinkResult<Vec<T>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|e| PeerlinkError::kernel(operation, e.to_string()))
}

#[derive(Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<JsonLinkInfo>,
}

#[derive(Deserialize)]
struct JsonLinkInfo {
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<JsonVxlanData>,
}

#[derive(Deserialize)]
struct JsonVxlanData {
    id: Option<u32>,
    local: Option<Ipv4Addr>,
    port: Option<u16>,
    link: Option<String>,
}

pub fn parse_links(output: &str) -> PeerlinkResult<Vec<Link>> {
    let links: Vec<JsonLink> = from_json("link show", output)?;
    Ok(links
        .into_iter()
        .map(|l| {
            let kind = l.linkinfo.as_ref().and_then(|i| i.info_kind.clone());
            let vxlan = match (&kind, l.linkinfo.and_then(|i| i.info_data)) {
                (Some(k), Some(data)) if k == "vxlan" => Some(VxlanAttrs {
                    vni: data.id.unwrap_or(0),
                    local: data.local,
                    port: data.port.unwrap_or(0),
                    parent: data.link,
                }),
                _ => None,
            };
            Link {
                name: l.ifname,
                index: l.ifindex,
                kind,
                mtu: l.mtu,
                up: l.flags.iter().any(|f| f == "UP"),
                mac: l.address.and_then(|a| a.parse().ok()),
                vxlan,
            }
        })
        .collect())
}

#[derive(Deserialize)]
struct JsonAddrLink {
    #[serde(default)]
    addr_info: Vec<JsonAddrInfo>,
}

#[derive(Deserialize)]
struct JsonAddrInfo {
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
}

pub fn parse_addrs(output: &str) -> PeerlinkResult<Vec<IfAddr>> {
    let links: Vec<JsonAddrLink> = from_json("addr show", output)?;
    Ok(links
        .into_iter()
        .flat_map(|l| l.addr_info)
        .filter(|a| a.family.as_deref().map_or(true, |f| f == "inet"))
        .filter_map(|a| {
            let ip = a.local?.parse().ok()?;
            Some(IfAddr::new(ip, a.prefixlen.unwrap_or(32)))
        })
        .collect())
}

#[derive(Deserialize)]
struct JsonFdb {
    mac: String,
    #[serde(default)]
    dst: Option<String>,
}

/// Entries without a remote VTEP (`dst`) are local and skipped.
pub fn parse_fdb(output: &str) -> PeerlinkResult<Vec<Neighbor>> {
    let entries: Vec<JsonFdb> = from_json("fdb show", output)?;
    Ok(entries
        .into_iter()
        .filter_map(|e| {
            let mac: MacAddress = e.mac.parse().ok()?;
            let ip: Ipv4Addr = e.dst?.parse().ok()?;
            Some(Neighbor::new(mac, ip))
        })
        .collect())
}

#[derive(Deserialize)]
struct JsonRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

fn parse_route_dst(dst: &str) -> Option<Ipv4Cidr> {
    if dst == "default" {
        return Ipv4Cidr::new(Ipv4Addr::UNSPECIFIED, 0).ok();
    }
    dst.parse().ok()
}

pub fn parse_routes(output: &str, table: TableId) -> PeerlinkResult<Vec<RouteEntry>> {
    let routes: Vec<JsonRoute> = from_json("route show", output)?;
    Ok(routes
        .into_iter()
        .filter_map(|r| {
            Some(RouteEntry {
                dst: parse_route_dst(&r.dst)?,
                gateway: r.gateway,
                device: r.dev?,
                table,
                onlink: r.flags.iter().any(|f| f == "onlink"),
            })
        })
        .collect())
}

#[derive(Deserialize)]
struct JsonRule {
    priority: u32,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    srclen: Option<u8>,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    dstlen: Option<u8>,
    table: Option<String>,
}

fn parse_rule_prefix(addr: Option<String>, len: Option<u8>) -> Option<Ipv4Cidr> {
    let addr = addr?;
    if addr == "all" {
        return None;
    }
    let ip: Ipv4Addr = addr.parse().ok()?;
    Ipv4Cidr::new(ip, len.unwrap_or(32)).ok()
}

fn parse_table_name(table: &str) -> Option<TableId> {
    match table {
        "default" => TableId::new(253).ok(),
        "main" => Some(TableId::MAIN),
        "local" => TableId::new(255).ok(),
        other => other.parse().ok().and_then(|id| TableId::new(id).ok()),
    }
}

pub fn parse_rules(output: &str) -> PeerlinkResult<Vec<PolicyRule>> {
    let rules: Vec<JsonRule> = from_json("rule show", output)?;
    Ok(rules
        .into_iter()
        .filter_map(|r| {
            Some(PolicyRule {
                priority: r.priority,
                src: parse_rule_prefix(r.src, r.srclen),
                dst: parse_rule_prefix(r.dst, r.dstlen),
                table: parse_table_name(r.table.as_deref()?)?,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_vxlan_link() {
        let output = r#"[{"ifindex":7,"ifname":"vxlan.plk","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "mtu":1450,"address":"02:50:0a:00:00:05",
            "linkinfo":{"info_kind":"vxlan","info_data":{"id":18952,"local":"10.0.0.5","port":4789,"link":"eth0"}}}]"#;
        let links = parse_links(output).unwrap();
        assert_eq!(links.len(), 1);
        let link = &links[0];
        assert!(link.up);
        assert_eq!(link.index, 7);
        assert_eq!(
            link.vxlan,
            Some(VxlanAttrs {
                vni: 18952,
                local: Some(Ipv4Addr::new(10, 0, 0, 5)),
                port: 4789,
                parent: Some("eth0".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_addrs_keeps_host_bits() {
        let output = r#"[{"ifname":"vxlan.plk","addr_info":[{"family":"inet","local":"240.0.0.5","prefixlen":8}]}]"#;
        assert_eq!(
            parse_addrs(output).unwrap(),
            vec![IfAddr::new(Ipv4Addr::new(240, 0, 0, 5), 8)]
        );
    }

    #[test]
    fn test_parse_fdb_skips_local_entries() {
        let output = r#"[{"mac":"02:50:0a:00:00:05","ifname":"vxlan.plk","flags":[],"state":"permanent"},
            {"mac":"00:00:00:00:00:00","ifname":"vxlan.plk","dst":"10.0.0.6","flags":[],"state":"permanent"}]"#;
        assert_eq!(
            parse_fdb(output).unwrap(),
            vec![Neighbor::new(MacAddress::ZERO, Ipv4Addr::new(10, 0, 0, 6))]
        );
    }

    #[test]
    fn test_parse_routes() {
        let table = TableId::new(18952).unwrap();
        let output = r#"[{"dst":"default","dev":"vxlan.plk","flags":[]},
            {"dst":"10.0.1.2","gateway":"240.0.0.6","dev":"vxlan.plk","flags":["onlink"]}]"#;
        let routes = parse_routes(output, table).unwrap();
        assert_eq!(routes[0].dst.to_string(), "0.0.0.0/0");
        assert_eq!(routes[1].dst.to_string(), "10.0.1.2/32");
        assert_eq!(routes[1].gateway, Some(Ipv4Addr::new(240, 0, 0, 6)));
        assert!(routes[1].onlink);
    }

    #[test]
    fn test_parse_rules() {
        let output = r#"[{"priority":0,"src":"all","table":"local"},
            {"priority":200,"src":"all","dst":"10.50.0.0","dstlen":16,"table":"18952"},
            {"priority":32766,"src":"all","table":"main"}]"#;
        let rules = parse_rules(output).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(
            rules[1],
            PolicyRule::to_destination(
                "10.50.0.0/16".parse().unwrap(),
                TableId::new(18952).unwrap(),
                200
            )
        );
        assert_eq!(rules[2].table, TableId::MAIN);
    }

    #[test]
    fn test_garbage_is_kernel_error() {
        assert!(matches!(
            parse_links("not json"),
            Err(PeerlinkError::Kernel { .. })
        ));
        assert!(parse_links("").unwrap().is_empty());
    }
}
