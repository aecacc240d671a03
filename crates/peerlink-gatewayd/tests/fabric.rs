//! End-to-end scenarios over the whole gateway, against in-memory kernels.

use peerlink_common::{Reconciler, Requeue};
use peerlink_gatewayd::store::NatMappingStore;
use peerlink_gatewayd::{
    EventKind, Gateway, GatewayConfig, Kernel, MemoryStore, NodeMode, Overrides, ServicePort,
    ServiceRecord, StartupGate,
};
use peerlink_netfilter::fake::FakePacketFilter;
use peerlink_netfilter::{RuleSpec, Table};
use peerlink_netlink::fake::FakeNetConfig;
use peerlink_tunnel::fake::FakeTunnelDriver;
use peerlink_tunnel::wireguard::fake::FakeWgControl;
use peerlink_tunnel::{DriverRegistry, TunnelDriver};
use peerlink_types::{
    backend_keys, ClusterIdentity, ConnectionSpec, NatMappingSet, Phase, Remap, TableId,
    FINALIZER,
};
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Fabric {
    net: Arc<FakeNetConfig>,
    filter: Arc<FakePacketFilter>,
    driver: Arc<FakeTunnelDriver>,
    store: Arc<MemoryStore>,
    gateway: Gateway,
}

async fn fabric() -> Fabric {
    let net = Arc::new(FakeNetConfig::new().with_link("fake0"));
    let filter = Arc::new(FakePacketFilter::new());
    let kernel = Kernel {
        net: net.clone(),
        filter: filter.clone(),
        wg: Arc::new(FakeWgControl::new()),
    };

    let driver = Arc::new(FakeTunnelDriver::new("fake"));
    let shared = driver.clone();
    let mut registry = DriverRegistry::new();
    registry
        .register(
            "fake",
            Box::new(move || Ok(shared.clone() as Arc<dyn TunnelDriver>)),
        )
        .unwrap();

    let config = GatewayConfig::default().with_overrides(Overrides {
        node_name: Some("gw".to_string()),
        host_ip: Some(Ipv4Addr::new(172, 18, 0, 4)),
        mode: Some(NodeMode::Gateway),
        netns: None,
    });
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::new(config, &kernel, store.clone(), &registry, StartupGate::new()).unwrap();
    gateway.start().await.unwrap();

    Fabric {
        net,
        filter,
        driver,
        store,
        gateway,
    }
}

fn id(cluster: &str) -> ClusterIdentity {
    ClusterIdentity::new(cluster).unwrap()
}

fn spec(cluster: &str, backend: &str, remote_pod: &str, remote_external: &str) -> ConnectionSpec {
    ConnectionSpec {
        cluster: id(cluster),
        local_pod_cidr: "10.0.0.0/16".parse().unwrap(),
        local_remapped_pod_cidr: Remap::None,
        remote_pod_cidr: "10.0.0.0/16".parse().unwrap(),
        remote_remapped_pod_cidr: remote_pod.parse().unwrap(),
        local_external_cidr: "10.201.0.0/16".parse().unwrap(),
        local_remapped_external_cidr: Remap::None,
        remote_external_cidr: "10.201.0.0/16".parse().unwrap(),
        remote_remapped_external_cidr: remote_external.parse().unwrap(),
        backend_type: backend.to_string(),
        backend_config: [(backend_keys::ENDPOINT_IP.to_string(), "172.19.0.2".to_string())]
            .into_iter()
            .collect(),
        gateway_pod_ip: None,
    }
}

fn east() -> ConnectionSpec {
    spec("east", "fake", "10.50.0.0/16", "10.60.0.0/16")
}

fn west() -> ConnectionSpec {
    spec("west", "fake", "10.70.0.0/16", "10.80.0.0/16")
}

fn gateway_table() -> TableId {
    TableId::custom(18952).unwrap()
}

#[tokio::test]
async fn test_unknown_backend_touches_nothing() {
    let f = fabric().await;
    f.store
        .apply_connection(spec("east", "ipsec", "10.50.0.0/16", "10.60.0.0/16"));
    let kernel_calls = (f.net.call_count(), f.filter.call_count());

    let err = f
        .gateway
        .tunnel_reconciler()
        .reconcile(&id("east"))
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!((f.net.call_count(), f.filter.call_count()), kernel_calls);
    assert_eq!(f.driver.connect_count(), 0);
    assert_eq!(f.store.write_count(), 0);
    assert!(!f.store.connection(&id("east")).unwrap().has_finalizer());
    assert_eq!(
        f.gateway.events().reasons(&id("east")),
        vec!["UnknownBackend".to_string()]
    );
}

#[tokio::test]
async fn test_finalizer_held_until_cleanup_succeeds() {
    let f = fabric().await;
    let reconciler = f.gateway.tunnel_reconciler();
    f.store.apply_connection(east());

    reconciler.reconcile(&id("east")).await.unwrap();
    let ready = f.store.connection(&id("east")).unwrap();
    assert!(ready.finalizers.contains(FINALIZER));
    assert_eq!(ready.status.phase, Phase::Ready);

    assert!(f.store.request_deletion(&id("east")));
    f.driver.fail_disconnect(true);
    let err = reconciler.reconcile(&id("east")).await.unwrap_err();
    assert!(err.is_retryable());

    let stuck = f.store.connection(&id("east")).unwrap();
    assert!(stuck.has_finalizer());
    assert_eq!(stuck.status.phase, Phase::Terminating);
    assert!(f
        .gateway
        .events()
        .reasons(&id("east"))
        .contains(&"DisconnectFailed".to_string()));

    f.driver.fail_disconnect(false);
    assert_eq!(reconciler.reconcile(&id("east")).await.unwrap(), Requeue::Done);
    assert_eq!(f.store.connection(&id("east")), None);
    assert!(!f.filter.has_chain(Table::Filter, "PLK-FRWD-CLS-EAST"));
    assert!(f.net.routes(gateway_table()).is_empty());
}

#[tokio::test]
async fn test_nat_mappings_partitioned_per_cluster() {
    let f = fabric().await;
    let tunnels = f.gateway.tunnel_reconciler();
    let natmap = f.gateway.natmap_controller();
    f.store.apply_connection(east());
    f.store.apply_connection(west());
    f.store.put_nat_mapping(
        NatMappingSet::new(id("east"))
            .with_mapping(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 2, 4)),
    );
    f.store.put_nat_mapping(
        NatMappingSet::new(id("west"))
            .with_mapping(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 3, 7)),
    );

    // Mappings wait for the tunnel.
    assert!(natmap.reconcile(&id("east")).await.unwrap_err().is_retryable());

    for cluster in ["east", "west"] {
        tunnels.reconcile(&id(cluster)).await.unwrap();
        natmap.reconcile(&id(cluster)).await.unwrap();
    }

    assert_eq!(
        f.filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-EAST"),
        vec![RuleSpec::new("-d 10.0.2.4/32 -j DNAT --to-destination 10.0.1.2")]
    );
    assert_eq!(
        f.filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-WEST"),
        vec![RuleSpec::new("-d 10.0.3.7/32 -j DNAT --to-destination 10.0.1.2")]
    );

    // Dropping west's mappings leaves east's alone.
    f.store.remove_nat_mapping(&id("west"));
    natmap.reconcile(&id("west")).await.unwrap();
    assert!(f.filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-WEST").is_empty());
    assert_eq!(f.filter.rules(Table::Nat, "PLK-PRRT-EXT-CLS-EAST").len(), 1);
    assert_eq!(f.store.list_nat_mappings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_reconcile_converges() {
    let f = fabric().await;
    let reconciler = f.gateway.tunnel_reconciler();
    f.store.apply_connection(east());

    reconciler.reconcile(&id("east")).await.unwrap();
    let rules = f.filter.snapshot();
    let routes = f.net.routes(gateway_table());
    let writes = f.store.write_count();

    reconciler.reconcile(&id("east")).await.unwrap();
    assert_eq!(f.filter.snapshot(), rules);
    assert_eq!(f.net.routes(gateway_table()), routes);
    assert_eq!(f.store.write_count(), writes);
}

#[tokio::test]
async fn test_store_conflicts_are_not_surfaced() {
    let f = fabric().await;
    let reconciler = f.gateway.tunnel_reconciler();
    f.store.apply_connection(east());
    f.store.inject_conflicts(2);

    reconciler.reconcile(&id("east")).await.unwrap();
    assert!(f.store.connection(&id("east")).unwrap().is_ready());
    assert!(f
        .gateway
        .events()
        .events(&id("east"))
        .iter()
        .all(|e| e.kind == EventKind::Normal));
}

#[tokio::test]
async fn test_service_endpoint_follows_into_status() {
    let f = fabric().await;
    let tunnels = f.gateway.tunnel_reconciler();
    let services = f.gateway.service_controller();
    f.store.apply_connection(east());
    tunnels.reconcile(&id("east")).await.unwrap();
    assert_eq!(f.store.connection(&id("east")).unwrap().status.local_endpoint, None);

    let service = |ip: [u8; 4]| {
        ServiceRecord::new("peerlink-gateway", Some(Ipv4Addr::from(ip)))
            .with_port(ServicePort::udp("tunnel", 51820))
            .with_label("peerlink.io/gateway", "active")
    };
    f.store.put_service(service([172, 18, 0, 100]));
    services.reconcile(&"peerlink-gateway".to_string()).await.unwrap();
    tunnels.reconcile(&id("east")).await.unwrap();
    assert_eq!(
        f.store.connection(&id("east")).unwrap().status.local_endpoint,
        Some("172.18.0.100:51820".parse().unwrap())
    );

    // a new load balancer address replaces the old one
    f.store.put_service(service([172, 18, 0, 101]));
    services.reconcile(&"peerlink-gateway".to_string()).await.unwrap();
    tunnels.reconcile(&id("east")).await.unwrap();
    let ready = f.store.connection(&id("east")).unwrap();
    assert_eq!(ready.status.local_endpoint, Some("172.18.0.101:51820".parse().unwrap()));
    assert_eq!(ready.status.phase, Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_firewall_cancel_tears_everything_down() {
    let f = fabric().await;
    f.store.apply_connection(east());
    f.gateway
        .tunnel_reconciler()
        .reconcile(&id("east"))
        .await
        .unwrap();
    assert!(f.filter.has_chain(Table::Filter, "PLK-FRWD-CLS-EAST"));

    let cancel = CancellationToken::new();
    let firewall = tokio::spawn(f.gateway.firewall().run(cancel.clone()));
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;
    assert_eq!(f.filter.rules(Table::Filter, "PLK-INPUT").len(), 2);

    cancel.cancel();
    firewall.await.unwrap();
    for (table, chain) in [
        (Table::Filter, "PLK-FRWD-CLS-EAST"),
        (Table::Filter, "PLK-FORWARD"),
        (Table::Filter, "PLK-INPUT"),
        (Table::Nat, "PLK-PREROUTING"),
        (Table::Nat, "PLK-POSTROUTING"),
    ] {
        assert!(!f.filter.has_chain(table, chain), "{} still present", chain);
    }
}
