//! [`NetConfig`] over the `ip` and `bridge` command-line tools.

use async_trait::async_trait;
use peerlink_common::{shell, Netns, PeerlinkError, PeerlinkResult};
use peerlink_types::{Neighbor, PolicyRule, RouteEntry, TableId};
use tracing::instrument;

use crate::commands::*;
use crate::parse;
use crate::types::{IfAddr, Link, VxlanSpec};
use crate::NetConfig;

/// Runs `ip`/`bridge` on the host or inside a network namespace.
#[derive(Debug, Clone, Default)]
pub struct ShellNetConfig {
    netns: Netns,
}

impl ShellNetConfig {
    pub fn new(netns: Netns) -> Self {
        Self { netns }
    }

    async fn exec(&self, cmd: String) -> PeerlinkResult<String> {
        shell::exec_or_throw(&self.netns.wrap(cmd)).await
    }
}

fn is_missing_device(err: &PeerlinkError) -> bool {
    matches!(
        err,
        PeerlinkError::ShellCommandFailed { output, .. } if output.contains("does not exist")
    )
}

#[async_trait]
impl NetConfig for ShellNetConfig {
    async fn link_by_name(&self, name: &str) -> PeerlinkResult<Option<Link>> {
        match self.exec(build_show_link_cmd(name)).await {
            Ok(out) => Ok(parse::parse_links(&out)?.into_iter().next()),
            Err(e) if is_missing_device(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(dev = %spec.name, vni = spec.vni))]
    async fn add_vxlan_link(&self, spec: &VxlanSpec) -> PeerlinkResult<()> {
        self.exec(build_add_vxlan_cmd(spec)).await?;
        self.exec(build_set_mtu_cmd(&spec.name, spec.mtu)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_link(&self, name: &str, kind: &str) -> PeerlinkResult<()> {
        self.exec(build_add_link_cmd(name, kind)).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, name: &str) -> PeerlinkResult<()> {
        self.exec(build_del_link_cmd(name)).await.map(drop)
    }

    async fn set_link_up(&self, name: &str) -> PeerlinkResult<()> {
        self.exec(build_set_link_up_cmd(name)).await.map(drop)
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> PeerlinkResult<()> {
        self.exec(build_set_mtu_cmd(name, mtu)).await.map(drop)
    }

    async fn list_addrs(&self, name: &str) -> PeerlinkResult<Vec<IfAddr>> {
        let out = self.exec(build_list_addr_cmd(name)).await?;
        parse::parse_addrs(&out)
    }

    async fn add_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()> {
        self.exec(build_add_addr_cmd(name, addr)).await.map(drop)
    }

    async fn del_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()> {
        self.exec(build_del_addr_cmd(name, addr)).await.map(drop)
    }

    async fn list_fdb(&self, dev: &str) -> PeerlinkResult<Vec<Neighbor>> {
        let out = self.exec(build_list_fdb_cmd(dev)).await?;
        parse::parse_fdb(&out)
    }

    #[instrument(skip(self), fields(neighbor = %neighbor))]
    async fn append_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()> {
        self.exec(build_append_fdb_cmd(dev, neighbor)).await.map(drop)
    }

    #[instrument(skip(self), fields(neighbor = %neighbor))]
    async fn del_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()> {
        self.exec(build_del_fdb_cmd(dev, neighbor)).await.map(drop)
    }

    async fn list_routes(&self, table: TableId) -> PeerlinkResult<Vec<RouteEntry>> {
        let out = self.exec(build_list_routes_cmd(table)).await?;
        parse::parse_routes(&out, table)
    }

    #[instrument(skip(self), fields(route = %route))]
    async fn add_route(&self, route: &RouteEntry) -> PeerlinkResult<()> {
        self.exec(build_add_route_cmd(route)).await.map(drop)
    }

    #[instrument(skip(self), fields(route = %route))]
    async fn del_route(&self, route: &RouteEntry) -> PeerlinkResult<()> {
        self.exec(build_del_route_cmd(route)).await.map(drop)
    }

    async fn list_rules(&self) -> PeerlinkResult<Vec<PolicyRule>> {
        let out = self.exec(build_list_rules_cmd()).await?;
        parse::parse_rules(&out)
    }

    #[instrument(skip(self), fields(rule = %rule))]
    async fn add_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()> {
        self.exec(build_add_rule_cmd(rule)).await.map(drop)
    }

    #[instrument(skip(self), fields(rule = %rule))]
    async fn del_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()> {
        self.exec(build_del_rule_cmd(rule)).await.map(drop)
    }
}
