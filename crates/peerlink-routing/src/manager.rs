//! RoutingManager - gateway and symmetric routing tables

use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_netlink::{idempotent, NetConfig};
use peerlink_types::{ClusterIdentity, ConnectionSpec, Ipv4Cidr, PolicyRule, RouteEntry, TableId};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Highest priority usable without shadowing the kernel's main rule (32766).
const MAX_RULE_PRIORITY: u32 = 32765;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub gateway_table: TableId,
    pub symmetric_table: TableId,
    /// Priority of destination rules; source rules into the symmetric table
    /// use the next value.
    pub rule_priority: u32,
    pub overlay_device: String,
}

impl RoutingConfig {
    pub fn validate(&self) -> PeerlinkResult<()> {
        for (field, table) in [
            ("routing.gateway_table", self.gateway_table),
            ("routing.symmetric_table", self.symmetric_table),
        ] {
            TableId::custom(table.as_u32())
                .map_err(|e| PeerlinkError::invalid_config(field, e.to_string()))?;
        }
        if self.gateway_table == self.symmetric_table {
            return Err(PeerlinkError::invalid_config(
                "routing.symmetric_table",
                "must differ from routing.gateway_table",
            ));
        }
        if self.rule_priority == 0 || self.rule_priority >= MAX_RULE_PRIORITY {
            return Err(PeerlinkError::invalid_config(
                "routing.rule_priority",
                format!("must be within 1..{}", MAX_RULE_PRIORITY),
            ));
        }
        Ok(())
    }

    fn symmetric_priority(&self) -> u32 {
        self.rule_priority + 1
    }
}

/// Where traffic towards a remote cluster leaves this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Directly into the tunnel device (gateway node).
    Device(String),
    /// Through the overlay to the active gateway's overlay IP.
    Overlay(Ipv4Addr),
}

/// Result of [`RoutingManager::sync_symmetric_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricChange {
    Unchanged,
    Added,
    /// The pod moved; the route through its old node was replaced.
    Replaced,
    Removed,
}

#[derive(Debug, Clone, Default)]
struct ConnectionRoutes {
    routes: Vec<RouteEntry>,
    rules: Vec<PolicyRule>,
}

type ConnectionMap = BTreeMap<ClusterIdentity, ConnectionRoutes>;

fn claimed_by_other(
    connections: &ConnectionMap,
    cluster: &ClusterIdentity,
    route: Option<&RouteEntry>,
    rule: Option<&PolicyRule>,
) -> bool {
    connections.iter().any(|(id, owned)| {
        id != cluster
            && (route.map_or(false, |r| owned.routes.iter().any(|o| o.same_destination(r)))
                || rule.map_or(false, |r| owned.rules.contains(r)))
    })
}

/// Another connection that recorded a route to the same destination as
/// `route` but with different attributes, which installing `route` replaces.
fn contested_by<'a>(
    connections: &'a ConnectionMap,
    cluster: &ClusterIdentity,
    route: &RouteEntry,
) -> Option<(&'a ClusterIdentity, &'a RouteEntry)> {
    connections
        .iter()
        .filter(|(id, _)| *id != cluster)
        .find_map(|(id, owned)| {
            owned
                .routes
                .iter()
                .find(|o| o.same_destination(route) && *o != route)
                .map(|o| (id, o))
        })
}

/// Manages the two fabric routing tables and their policy rules.
///
/// Each map is locked for the whole read-diff-apply-record sequence of a
/// writer, kernel calls included, so no caller observes a half-applied
/// update.
pub struct RoutingManager {
    net: Arc<dyn NetConfig>,
    config: RoutingConfig,

    /// local pod IP -> symmetric route installed for it
    active: Mutex<BTreeMap<Ipv4Addr, RouteEntry>>,

    /// cluster -> routes and rules installed for its connection
    connections: Mutex<ConnectionMap>,
}

impl RoutingManager {
    pub fn new(net: Arc<dyn NetConfig>, config: RoutingConfig) -> Self {
        Self {
            net,
            config,
            active: Mutex::new(BTreeMap::new()),
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    fn overlay_route(&self, dst: Ipv4Cidr, table: TableId, via: Ipv4Addr) -> RouteEntry {
        RouteEntry::new(dst, self.config.overlay_device.clone(), table)
            .via(via)
            .onlink()
    }

    /// Validates the configuration and lists both tables.
    ///
    /// Linux tables have no existence of their own; they appear with their
    /// first route. Probing confirms the kernel accepts the IDs.
    pub async fn init(&self) -> PeerlinkResult<()> {
        self.config.validate()?;
        for table in [self.config.gateway_table, self.config.symmetric_table] {
            let routes = self.net.list_routes(table).await?;
            debug!("Routing table {} holds {} routes", table, routes.len());
        }
        info!(
            "Routing tables ready (gateway {}, symmetric {})",
            self.config.gateway_table, self.config.symmetric_table
        );
        Ok(())
    }

    /// Installs the gateway table's default route through the overlay.
    #[instrument(skip(self))]
    pub async fn ensure_default_route(&self, via: Ipv4Addr) -> PeerlinkResult<bool> {
        let route = self.overlay_route(Ipv4Cidr::DEFAULT, self.config.gateway_table, via);
        let added = idempotent::add_route(self.net.as_ref(), &route).await?;
        if added {
            info!("Default overlay egress via {}", via);
        }
        Ok(added)
    }

    pub async fn remove_default_route(&self) -> PeerlinkResult<bool> {
        let route = RouteEntry::new(
            Ipv4Cidr::DEFAULT,
            self.config.overlay_device.clone(),
            self.config.gateway_table,
        );
        idempotent::del_route(self.net.as_ref(), &route).await
    }

    /// Adds a /32 route to `ip` through the overlay into the symmetric table.
    /// Returns false if it was already present.
    #[instrument(skip(self))]
    pub async fn add_host_route(&self, ip: Ipv4Addr, via: Ipv4Addr) -> PeerlinkResult<bool> {
        let route = self.overlay_route(Ipv4Cidr::host(ip), self.config.symmetric_table, via);
        idempotent::add_route(self.net.as_ref(), &route).await
    }

    /// Returns false if no route to `ip` was present.
    #[instrument(skip(self))]
    pub async fn remove_host_route(&self, ip: Ipv4Addr) -> PeerlinkResult<bool> {
        let route = RouteEntry::new(
            Ipv4Cidr::host(ip),
            self.config.overlay_device.clone(),
            self.config.symmetric_table,
        );
        idempotent::del_route(self.net.as_ref(), &route).await
    }

    /// Forces traffic towards `dst` through the gateway table.
    #[instrument(skip(self))]
    pub async fn add_policy_rule(&self, dst: Ipv4Cidr) -> PeerlinkResult<bool> {
        let rule =
            PolicyRule::to_destination(dst, self.config.gateway_table, self.config.rule_priority);
        idempotent::add_rule(self.net.as_ref(), &rule).await
    }

    #[instrument(skip(self))]
    pub async fn remove_policy_rule(&self, dst: Ipv4Cidr) -> PeerlinkResult<bool> {
        let rule =
            PolicyRule::to_destination(dst, self.config.gateway_table, self.config.rule_priority);
        idempotent::del_rule(self.net.as_ref(), &rule).await
    }

    fn desired_for(&self, spec: &ConnectionSpec, target: &RouteTarget) -> ConnectionRoutes {
        let mut cidrs = vec![
            spec.remote_pod_cidr_effective(),
            spec.remote_external_cidr_effective(),
        ];
        cidrs.sort();
        cidrs.dedup();

        let mut desired = ConnectionRoutes::default();
        for cidr in cidrs {
            let route = match target {
                RouteTarget::Device(dev) => {
                    RouteEntry::new(cidr, dev.clone(), self.config.gateway_table)
                }
                RouteTarget::Overlay(via) => {
                    self.overlay_route(cidr, self.config.gateway_table, *via)
                }
            };
            desired.routes.push(route);
            desired.rules.push(PolicyRule::to_destination(
                cidr,
                self.config.gateway_table,
                self.config.rule_priority,
            ));
            if matches!(target, RouteTarget::Device(_)) {
                desired.rules.push(PolicyRule::from_source(
                    cidr,
                    self.config.symmetric_table,
                    self.config.symmetric_priority(),
                ));
            }
        }
        desired
    }

    /// Converges the routes and rules of one connection. Returns the number
    /// of kernel objects added or removed.
    #[instrument(skip(self, spec), fields(cluster = %spec.cluster))]
    pub async fn ensure_connection(
        &self,
        spec: &ConnectionSpec,
        target: &RouteTarget,
    ) -> PeerlinkResult<usize> {
        let desired = self.desired_for(spec, target);
        let mut connections = self.connections.lock().await;
        let previous = connections.get(&spec.cluster).cloned().unwrap_or_default();
        let mut changed = 0;

        let stale_routes = previous
            .routes
            .iter()
            .filter(|r| !desired.routes.iter().any(|d| d.same_destination(r)));
        for route in stale_routes {
            if !claimed_by_other(&connections, &spec.cluster, Some(route), None)
                && idempotent::del_route(self.net.as_ref(), route).await?
            {
                changed += 1;
            }
        }
        for rule in previous.rules.iter().filter(|r| !desired.rules.contains(r)) {
            if !claimed_by_other(&connections, &spec.cluster, None, Some(rule))
                && idempotent::del_rule(self.net.as_ref(), rule).await?
            {
                changed += 1;
            }
        }

        for route in &desired.routes {
            if let Some((owner, theirs)) = contested_by(&connections, &spec.cluster, route) {
                warn!(
                    cluster = %spec.cluster,
                    owner = %owner,
                    replaced = %theirs,
                    wanted = %route,
                    "Replacing a route recorded by another connection"
                );
            }
            if idempotent::add_route(self.net.as_ref(), route).await? {
                changed += 1;
            }
        }
        for rule in &desired.rules {
            if idempotent::add_rule(self.net.as_ref(), rule).await? {
                changed += 1;
            }
        }

        connections.insert(spec.cluster.clone(), desired);
        if changed > 0 {
            info!("Routing for cluster {} converged ({} changes)", spec.cluster, changed);
        }
        Ok(changed)
    }

    /// Removes everything installed for `cluster` that no other connection
    /// still needs.
    #[instrument(skip(self))]
    pub async fn remove_connection(&self, cluster: &ClusterIdentity) -> PeerlinkResult<usize> {
        let mut connections = self.connections.lock().await;
        let Some(owned) = connections.get(cluster).cloned() else {
            debug!("No routes recorded for cluster {}", cluster);
            return Ok(0);
        };
        let mut removed = 0;
        for route in &owned.routes {
            if !claimed_by_other(&connections, cluster, Some(route), None)
                && idempotent::del_route(self.net.as_ref(), route).await?
            {
                removed += 1;
            }
        }
        for rule in &owned.rules {
            if !claimed_by_other(&connections, cluster, None, Some(rule))
                && idempotent::del_rule(self.net.as_ref(), rule).await?
            {
                removed += 1;
            }
        }
        connections.remove(cluster);
        info!("Removed routing for cluster {} ({} objects)", cluster, removed);
        Ok(removed)
    }

    /// Points the symmetric route of local pod `pod_ip` at the overlay IP of
    /// the node hosting it. `via == None` means the pod runs on this node
    /// and needs no route.
    ///
    /// The kernel is consulted on every call, so a route changed behind our
    /// back is replaced on the next sync.
    #[instrument(skip(self))]
    pub async fn sync_symmetric_route(
        &self,
        pod_ip: Ipv4Addr,
        via: Option<Ipv4Addr>,
    ) -> PeerlinkResult<SymmetricChange> {
        let mut active = self.active.lock().await;
        let Some(via) = via else {
            return Ok(if self.remove_symmetric_locked(&mut active, pod_ip).await? {
                SymmetricChange::Removed
            } else {
                SymmetricChange::Unchanged
            });
        };

        let want = self.overlay_route(Ipv4Cidr::host(pod_ip), self.config.symmetric_table, via);
        let previous = active.get(&pod_ip).cloned();
        let added = idempotent::add_route(self.net.as_ref(), &want).await?;
        active.insert(pod_ip, want);

        let change = match (added, previous) {
            (false, _) => SymmetricChange::Unchanged,
            (true, Some(prev)) if prev.gateway != Some(via) => {
                warn!("Pod {} moved from {:?} to {}", pod_ip, prev.gateway, via);
                SymmetricChange::Replaced
            }
            (true, _) => SymmetricChange::Added,
        };
        Ok(change)
    }

    pub async fn remove_symmetric_route(&self, pod_ip: Ipv4Addr) -> PeerlinkResult<bool> {
        let mut active = self.active.lock().await;
        self.remove_symmetric_locked(&mut active, pod_ip).await
    }

    async fn remove_symmetric_locked(
        &self,
        active: &mut BTreeMap<Ipv4Addr, RouteEntry>,
        pod_ip: Ipv4Addr,
    ) -> PeerlinkResult<bool> {
        let removed = self.remove_host_route(pod_ip).await?;
        active.remove(&pod_ip);
        Ok(removed)
    }

    pub async fn active_routes(&self) -> BTreeMap<Ipv4Addr, RouteEntry> {
        self.active.lock().await.clone()
    }

    /// Flushes both tables and every rule pointing at them.
    pub async fn purge(&self) -> PeerlinkResult<usize> {
        let mut active = self.active.lock().await;
        let mut connections = self.connections.lock().await;
        let mut removed = 0;
        for table in [self.config.gateway_table, self.config.symmetric_table] {
            for route in self.net.list_routes(table).await? {
                if idempotent::del_route(self.net.as_ref(), &route).await? {
                    removed += 1;
                }
            }
        }
        let ours: Vec<PolicyRule> = self
            .net
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| r.table == self.config.gateway_table || r.table == self.config.symmetric_table)
            .collect();
        for rule in ours {
            if idempotent::del_rule(self.net.as_ref(), &rule).await? {
                removed += 1;
            }
        }
        active.clear();
        connections.clear();
        info!("Purged {} routing objects", removed);
        Ok(removed)
    }
}
