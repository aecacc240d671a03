//! Daemon wiring.
//!
//! [`Gateway`] owns the shared kernel-facing managers and builds every
//! controller from them. [`Gateway::run`] waits on the startup gate, starts
//! one controller loop per watched resource plus the firewall loop, and fans
//! store events out to the queues until cancelled. The firewall loop is
//! stopped last, after every controller has exited.

use peerlink_common::{Controller, PeerlinkResult, Reconciler, WorkQueue};
use peerlink_netfilter::{PacketFilter, RuleEngine, ShellPacketFilter};
use peerlink_netlink::{NetConfig, ShellNetConfig};
use peerlink_overlay::{OverlayManager, VxlanPeers};
use peerlink_routing::RoutingManager;
use peerlink_tunnel::wireguard::{self, ShellWgControl, WgControl};
use peerlink_tunnel::{DriverRegistry, DriverSet};
use peerlink_types::ClusterIdentity;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, NodeMode};
use crate::events::{LoggingRecorder, DEFAULT_EVENT_HISTORY};
use crate::firewall::FirewallEnforcer;
use crate::gate::{LocalNetwork, StartupGate};
use crate::natmap_controller::NatMappingController;
use crate::node_controller::NodeController;
use crate::pod_controller::{ActiveGateway, PodController};
use crate::route_reconciler::RouteReconciler;
use crate::service_controller::{AdvertisedEndpoint, ServiceController};
use crate::store::{ConnectionStore, MemoryStore, NatMappingStore, ResourceEvent, TopologyStore};
use crate::tunnel_reconciler::TunnelReconciler;

/// The kernel seams every manager is built on.
#[derive(Clone)]
pub struct Kernel {
    pub net: Arc<dyn NetConfig>,
    pub filter: Arc<dyn PacketFilter>,
    pub wg: Arc<dyn WgControl>,
}

impl Kernel {
    /// Shell-backed seams, all running in the configured namespace.
    pub fn shell(config: &GatewayConfig) -> Self {
        Self {
            net: Arc::new(ShellNetConfig::new(config.netns())),
            filter: Arc::new(ShellPacketFilter::new(config.netns())),
            wg: Arc::new(ShellWgControl::new(config.netns())),
        }
    }
}

/// Registry holding the built-in WireGuard backend.
pub fn default_registry(config: &GatewayConfig, kernel: &Kernel) -> PeerlinkResult<DriverRegistry> {
    let mut registry = DriverRegistry::new();
    registry.register(
        wireguard::BACKEND,
        wireguard::constructor(kernel.net.clone(), kernel.wg.clone(), config.wireguard_config()),
    )?;
    Ok(registry)
}

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<MemoryStore>,
    gate: StartupGate,
    rules: Arc<RuleEngine>,
    routing: Arc<RoutingManager>,
    overlay: Arc<OverlayManager>,
    peers: Arc<VxlanPeers>,
    drivers: DriverSet,
    events: Arc<LoggingRecorder>,
    active: Arc<ActiveGateway>,
    advertised: Arc<AdvertisedEndpoint>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        kernel: &Kernel,
        store: Arc<MemoryStore>,
        registry: &DriverRegistry,
        gate: StartupGate,
    ) -> PeerlinkResult<Self> {
        config.validate()?;
        let routing = RoutingManager::new(kernel.net.clone(), config.routing_config()?);
        let overlay = OverlayManager::new(kernel.net.clone(), config.overlay_device_config()?);
        let drivers = registry.instantiate()?;
        Ok(Self {
            rules: Arc::new(RuleEngine::new(kernel.filter.clone())),
            routing: Arc::new(routing),
            overlay: Arc::new(overlay),
            peers: Arc::new(VxlanPeers::new()),
            drivers,
            events: Arc::new(LoggingRecorder::new(DEFAULT_EVENT_HISTORY)),
            active: Arc::new(ActiveGateway::new()),
            advertised: Arc::new(AdvertisedEndpoint::new()),
            config,
            store,
            gate,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn gate(&self) -> &StartupGate {
        &self.gate
    }

    pub fn events(&self) -> &Arc<LoggingRecorder> {
        &self.events
    }

    pub fn active_gateway(&self) -> &Arc<ActiveGateway> {
        &self.active
    }

    pub fn advertised_endpoint(&self) -> &Arc<AdvertisedEndpoint> {
        &self.advertised
    }

    pub fn tunnel_reconciler(&self) -> TunnelReconciler {
        TunnelReconciler::new(
            self.store.clone(),
            self.drivers.clone(),
            self.rules.clone(),
            self.routing.clone(),
            self.events.clone(),
            self.config.resync_interval(),
        )
        .with_advertised_endpoint(self.advertised.clone())
    }

    pub fn natmap_controller(&self) -> NatMappingController {
        NatMappingController::new(self.store.clone(), self.store.clone(), self.rules.clone())
    }

    pub fn route_reconciler(&self) -> RouteReconciler {
        RouteReconciler::new(
            self.store.clone(),
            self.routing.clone(),
            self.active.clone(),
            self.config.resync_interval(),
        )
    }

    pub fn node_controller(&self) -> NodeController {
        NodeController::new(
            self.store.clone(),
            self.peers.clone(),
            self.overlay.clone(),
            self.config.node.name.clone(),
            self.config.labels.overlay_mac_annotation.clone(),
        )
    }

    pub fn pod_controller(&self, network: LocalNetwork) -> PodController {
        PodController::new(
            self.store.clone(),
            self.peers.clone(),
            self.overlay.clone(),
            self.routing.clone(),
            self.config.node.mode,
            self.config.node.name.clone(),
            network,
            self.config.labels.clone(),
            self.active.clone(),
        )
    }

    pub fn service_controller(&self) -> ServiceController {
        ServiceController::new(
            self.store.clone(),
            self.config.labels.clone(),
            self.advertised.clone(),
        )
    }

    pub fn firewall(&self) -> FirewallEnforcer {
        FirewallEnforcer::new(
            self.rules.clone(),
            self.config.baseline(),
            self.config.enforce_interval(),
        )
    }

    /// Creates the devices, tables and chains everything else depends on.
    /// Any failure here is fatal.
    pub async fn start(&self) -> PeerlinkResult<()> {
        let outcome = self.overlay.ensure_device().await?;
        info!(device = self.overlay.device_name(), ?outcome, "Overlay device ready");
        self.routing.init().await?;
        if self.config.is_gateway() {
            self.rules.init().await?;
            self.drivers.init_all().await?;
        }
        info!(mode = ?self.config.node.mode, "Gateway started");
        Ok(())
    }

    /// Runs until `cancel` fires or the store's watch closes.
    pub async fn run(self, cancel: CancellationToken) -> PeerlinkResult<()> {
        let network = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            network = self.gate.wait() => network?,
        };
        info!(
            pod_cidr = %network.pod_cidr,
            external_cidr = %network.external_cidr,
            "Local network known, starting controllers"
        );

        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        let queues = self.spawn_controllers(network, &mut tasks, &stop);

        // Stopped only after the controllers, so its teardown is final.
        let firewall_stop = CancellationToken::new();
        let firewall = self
            .config
            .is_gateway()
            .then(|| tokio::spawn(self.firewall().run(firewall_stop.clone())));

        let mut watch = self.store.subscribe();
        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = resync.tick() => {
                    if let Err(e) = queues.resync_all(&self.store).await {
                        warn!(error = %e, "Periodic resync failed");
                    }
                }
                event = watch.recv() => match event {
                    Ok(event) => queues.dispatch(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, resyncing everything");
                        if let Err(e) = queues.resync_all(&self.store).await {
                            warn!(error = %e, "Resync after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store watch closed");
                        break;
                    }
                },
            }
        }

        stop.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Controller task panicked");
            }
        }
        if let Some(handle) = firewall {
            firewall_stop.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "Firewall task panicked");
            }
            self.drivers.close_all().await;
        }
        info!("Gateway stopped");
        Ok(())
    }

    fn spawn_controllers(
        &self,
        network: LocalNetwork,
        tasks: &mut JoinSet<()>,
        stop: &CancellationToken,
    ) -> Queues {
        let base = self.config.backoff_base();
        let max = self.config.backoff_max();

        let (connections, nat, services) = match self.config.node.mode {
            NodeMode::Gateway => {
                let tunnel = Controller::new(Arc::new(self.tunnel_reconciler()), base, max);
                let natmap = Controller::new(Arc::new(self.natmap_controller()), base, max);
                let service = Controller::new(
                    Arc::new(
                        self.service_controller()
                            .with_connection_queue(self.store.clone(), tunnel.queue()),
                    ),
                    base,
                    max,
                );
                let queues = (tunnel.queue(), Some(natmap.queue()), Some(service.queue()));
                spawn(tasks, tunnel, stop);
                spawn(tasks, natmap, stop);
                spawn(tasks, service, stop);
                queues
            }
            NodeMode::Node => {
                let route = Controller::new(Arc::new(self.route_reconciler()), base, max);
                let queue = route.queue();
                spawn(tasks, route, stop);
                (queue, None, None)
            }
        };

        let mut pod_controller = self.pod_controller(network);
        if self.config.node.mode == NodeMode::Node {
            pod_controller =
                pod_controller.with_connection_queue(self.store.clone(), connections.clone());
        }
        let pod = Controller::new(Arc::new(pod_controller), base, max);
        let pods = pod.queue();
        let node = Controller::new(
            Arc::new(self.node_controller().with_pod_queue(pods.clone())),
            base,
            max,
        );
        let nodes = node.queue();
        spawn(tasks, pod, stop);
        spawn(tasks, node, stop);

        Queues {
            connections,
            nat,
            nodes,
            pods,
            services,
        }
    }
}

fn spawn<R>(tasks: &mut JoinSet<()>, controller: Controller<R>, stop: &CancellationToken)
where
    R: Reconciler + 'static,
{
    tasks.spawn(controller.run(stop.clone()));
}

/// Where each kind of store event is delivered.
struct Queues {
    /// Connection reconciler in gateway mode, route reconciler otherwise.
    connections: Arc<WorkQueue<ClusterIdentity>>,
    nat: Option<Arc<WorkQueue<ClusterIdentity>>>,
    nodes: Arc<WorkQueue<String>>,
    pods: Arc<WorkQueue<String>>,
    /// Gateway mode only.
    services: Option<Arc<WorkQueue<String>>>,
}

impl Queues {
    fn dispatch(&self, event: ResourceEvent) {
        debug!(?event, "Store event");
        match event {
            ResourceEvent::Connection(id) => {
                // A tunnel turning Ready unblocks that cluster's NAT mappings.
                if let Some(nat) = &self.nat {
                    nat.add(id.clone());
                }
                self.connections.add(id);
            }
            ResourceEvent::NatMapping(id) => {
                if let Some(nat) = &self.nat {
                    nat.add(id);
                }
            }
            ResourceEvent::Node(name) => self.nodes.add(name),
            ResourceEvent::Pod(name) => self.pods.add(name),
            ResourceEvent::Service(name) => {
                if let Some(services) = &self.services {
                    services.add(name);
                }
            }
        }
    }

    async fn resync_all(&self, store: &MemoryStore) -> PeerlinkResult<()> {
        for descriptor in store.list_connections().await? {
            self.connections.add(descriptor.identity().clone());
        }
        if let Some(nat) = &self.nat {
            for set in store.list_nat_mappings().await? {
                nat.add(set.cluster);
            }
        }
        for node in store.list_nodes().await? {
            self.nodes.add(node.name);
        }
        for pod in store.list_pods().await? {
            self.pods.add(pod.name);
        }
        if let Some(services) = &self.services {
            for service in store.list_services().await? {
                services.add(service.name);
            }
        }
        Ok(())
    }
}
