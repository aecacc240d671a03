//! Configuration file support for peerlink-gatewayd
//!
//! Loads and validates the daemon configuration from a TOML file.
//! Default location: /etc/peerlink/gatewayd.toml

use peerlink_common::{Netns, PeerlinkError, PeerlinkResult};
use peerlink_netfilter::Baseline;
use peerlink_overlay::{OverlayDeviceConfig, DEFAULT_VXLAN_PORT};
use peerlink_routing::RoutingConfig;
use peerlink_tunnel::wireguard::{self, WireGuardConfig};
use peerlink_types::{Ipv4Cidr, TableId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/peerlink/gatewayd.toml";

/// Largest VXLAN network identifier (24 bits).
const MAX_VNI: u32 = 0x00FF_FFFF;

/// Role this daemon plays on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Runs next to the tunnel: drivers, rules, NAT mappings, symmetric routes.
    #[default]
    Gateway,
    /// Ordinary node: only steers remote-cluster traffic to the active gateway.
    Node,
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Host IP used as VTEP source and base of the overlay address
    #[serde(default)]
    pub host_ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub mode: NodeMode,
}

/// Tunnel backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_tunnel_interface")]
    pub interface: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Persistent keepalive in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    #[serde(default = "default_tunnel_mtu")]
    pub mtu: u32,

    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
}

/// VXLAN overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_overlay_device")]
    pub device: String,

    #[serde(default = "default_vni")]
    pub vni: u32,

    #[serde(default = "default_vxlan_port")]
    pub port: u16,

    #[serde(default = "default_overlay_mtu")]
    pub mtu: u32,

    /// Well-known block overlay addresses are derived into
    #[serde(default = "default_overlay_prefix")]
    pub prefix: Ipv4Cidr,

    /// Underlay device the VXLAN device is bound to
    #[serde(default)]
    pub parent: Option<String>,
}

/// Custom routing tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default = "default_gateway_table")]
    pub gateway_table: u32,

    #[serde(default = "default_symmetric_table")]
    pub symmetric_table: u32,

    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
}

/// Firewall enforcement loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_enforce_interval")]
    pub enforce_interval_secs: u64,

    /// Network namespace the gateway's packet filter lives in
    #[serde(default)]
    pub netns: Option<String>,
}

/// Reconcile loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

/// Label and annotation keys read from pods, nodes and services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsConfig {
    #[serde(default = "default_gateway_label_key")]
    pub gateway_key: String,

    #[serde(default = "default_gateway_label_value")]
    pub gateway_value: String,

    /// Node annotation carrying an explicit overlay MAC
    #[serde(default = "default_overlay_mac_annotation")]
    pub overlay_mac_annotation: String,

    /// Port of the gateway Service that remote clusters connect to
    #[serde(default = "default_gateway_port_name")]
    pub gateway_port_name: String,
}

/// Complete peerlink-gatewayd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub routing: RoutingSection,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub labels: LabelsConfig,
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub node_name: Option<String>,
    pub host_ip: Option<Ipv4Addr>,
    pub mode: Option<NodeMode>,
    pub netns: Option<String>,
}

// Default functions
fn default_node_name() -> String {
    "localhost".to_string()
}

fn default_backend() -> String {
    wireguard::BACKEND.to_string()
}

fn default_tunnel_interface() -> String {
    "wg-plk".to_string()
}

fn default_listen_port() -> u16 {
    wireguard::DEFAULT_LISTEN_PORT
}

fn default_keepalive() -> u16 {
    25
}

fn default_tunnel_mtu() -> u32 {
    1420
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/etc/peerlink/wireguard/private.key")
}

fn default_overlay_device() -> String {
    "vxlan.plk".to_string()
}

fn default_vni() -> u32 {
    18952
}

fn default_vxlan_port() -> u16 {
    DEFAULT_VXLAN_PORT
}

fn default_overlay_mtu() -> u32 {
    1450
}

fn default_overlay_prefix() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(240, 0, 0, 0), 8).unwrap_or(Ipv4Cidr::DEFAULT)
}

fn default_gateway_table() -> u32 {
    18952
}

fn default_symmetric_table() -> u32 {
    18953
}

fn default_rule_priority() -> u32 {
    200
}

fn default_enforce_interval() -> u64 {
    5
}

fn default_resync_interval() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    60
}

fn default_gateway_label_key() -> String {
    "peerlink.io/gateway".to_string()
}

fn default_gateway_label_value() -> String {
    "active".to_string()
}

fn default_overlay_mac_annotation() -> String {
    "peerlink.io/overlay-mac".to_string()
}

fn default_gateway_port_name() -> String {
    "tunnel".to_string()
}

// Default implementations
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            host_ip: None,
            mode: NodeMode::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            interface: default_tunnel_interface(),
            listen_port: default_listen_port(),
            keepalive: default_keepalive(),
            mtu: default_tunnel_mtu(),
            private_key_path: default_private_key_path(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            device: default_overlay_device(),
            vni: default_vni(),
            port: default_vxlan_port(),
            mtu: default_overlay_mtu(),
            prefix: default_overlay_prefix(),
            parent: None,
        }
    }
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            gateway_table: default_gateway_table(),
            symmetric_table: default_symmetric_table(),
            rule_priority: default_rule_priority(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enforce_interval_secs: default_enforce_interval(),
            netns: None,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            gateway_key: default_gateway_label_key(),
            gateway_value: default_gateway_label_value(),
            overlay_mac_annotation: default_overlay_mac_annotation(),
            gateway_port_name: default_gateway_port_name(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> PeerlinkResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                PeerlinkError::invalid_config(
                    path.display().to_string(),
                    format!("failed to parse config file: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(PeerlinkError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    /// Applies command-line values on top of the file.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(name) = overrides.node_name {
            self.node.name = name;
        }
        if let Some(ip) = overrides.host_ip {
            self.node.host_ip = Some(ip);
        }
        if let Some(mode) = overrides.mode {
            self.node.mode = mode;
        }
        if let Some(netns) = overrides.netns {
            self.firewall.netns = Some(netns);
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> PeerlinkResult<()> {
        if self.node.name.trim().is_empty() {
            return Err(PeerlinkError::invalid_config("node.name", "must not be empty"));
        }
        self.host_ip()?;

        if self.tunnel.backend.is_empty() {
            return Err(PeerlinkError::invalid_config("tunnel.backend", "must not be empty"));
        }
        if self.tunnel.listen_port == 0 {
            return Err(PeerlinkError::invalid_config("tunnel.listen_port", "must be > 0"));
        }
        if self.tunnel.mtu == 0 {
            return Err(PeerlinkError::invalid_config("tunnel.mtu", "must be > 0"));
        }

        if self.overlay.vni == 0 || self.overlay.vni > MAX_VNI {
            return Err(PeerlinkError::invalid_config(
                "overlay.vni",
                format!("must be within 1..={}", MAX_VNI),
            ));
        }
        if self.overlay.port == 0 {
            return Err(PeerlinkError::invalid_config("overlay.port", "must be > 0"));
        }
        if self.overlay.mtu == 0 {
            return Err(PeerlinkError::invalid_config("overlay.mtu", "must be > 0"));
        }
        if self.overlay.prefix.prefix_len() > 24 {
            return Err(PeerlinkError::invalid_config(
                "overlay.prefix",
                "must leave at least 8 host bits",
            ));
        }

        self.routing_config()?.validate()?;

        if self.firewall.enforce_interval_secs == 0 {
            return Err(PeerlinkError::invalid_config(
                "firewall.enforce_interval_secs",
                "must be > 0",
            ));
        }
        if self.reconcile.resync_interval_secs == 0 {
            return Err(PeerlinkError::invalid_config(
                "reconcile.resync_interval_secs",
                "must be > 0",
            ));
        }
        if self.reconcile.backoff_base_ms == 0 {
            return Err(PeerlinkError::invalid_config(
                "reconcile.backoff_base_ms",
                "must be > 0",
            ));
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(PeerlinkError::invalid_config(
                "reconcile.backoff_max_secs",
                "must not be below reconcile.backoff_base_ms",
            ));
        }

        if self.labels.gateway_key.is_empty() {
            return Err(PeerlinkError::invalid_config("labels.gateway_key", "must not be empty"));
        }

        Ok(())
    }

    pub fn is_gateway(&self) -> bool {
        self.node.mode == NodeMode::Gateway
    }

    pub fn host_ip(&self) -> PeerlinkResult<Ipv4Addr> {
        self.node
            .host_ip
            .ok_or_else(|| PeerlinkError::invalid_config("node.host_ip", "must be set"))
    }

    pub fn netns(&self) -> Netns {
        Netns::from_config(self.firewall.netns.as_deref())
    }

    pub fn routing_config(&self) -> PeerlinkResult<RoutingConfig> {
        let table = |field: &str, id: u32| {
            TableId::custom(id).map_err(|e| PeerlinkError::invalid_config(field, e.to_string()))
        };
        Ok(RoutingConfig {
            gateway_table: table("routing.gateway_table", self.routing.gateway_table)?,
            symmetric_table: table("routing.symmetric_table", self.routing.symmetric_table)?,
            rule_priority: self.routing.rule_priority,
            overlay_device: self.overlay.device.clone(),
        })
    }

    pub fn overlay_device_config(&self) -> PeerlinkResult<OverlayDeviceConfig> {
        Ok(OverlayDeviceConfig {
            name: self.overlay.device.clone(),
            vni: self.overlay.vni,
            port: self.overlay.port,
            mtu: self.overlay.mtu,
            prefix: self.overlay.prefix,
            host_ip: self.host_ip()?,
            parent: self.overlay.parent.clone(),
        })
    }

    pub fn wireguard_config(&self) -> WireGuardConfig {
        WireGuardConfig {
            interface: self.tunnel.interface.clone(),
            listen_port: self.tunnel.listen_port,
            mtu: self.tunnel.mtu,
            private_key_path: self.tunnel.private_key_path.clone(),
            keepalive: self.tunnel.keepalive,
        }
    }

    pub fn baseline(&self) -> Baseline {
        Baseline {
            tunnel_interface: self.tunnel.interface.clone(),
            tunnel_port: self.tunnel.listen_port,
            vxlan_port: self.overlay.port,
        }
    }

    /// Get firewall enforcement interval as Duration
    pub fn enforce_interval(&self) -> Duration {
        Duration::from_secs(self.firewall.enforce_interval_secs)
    }

    /// Get full resync interval as Duration
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.resync_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconcile.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.reconcile.backoff_max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> GatewayConfig {
        GatewayConfig::default().with_overrides(Overrides {
            host_ip: Some(Ipv4Addr::new(172, 18, 0, 4)),
            ..Default::default()
        })
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.node.mode, NodeMode::Gateway);
        assert_eq!(config.tunnel.backend, "wireguard");
        assert_eq!(config.tunnel.listen_port, 51820);
        assert_eq!(config.overlay.port, 4789);
        assert_eq!(config.overlay.prefix.to_string(), "240.0.0.0/8");
        assert_eq!(config.routing.gateway_table, 18952);
        assert_eq!(config.enforce_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_requires_host_ip() {
        let err = GatewayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("node.host_ip"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_parse_toml_partial() {
        let toml_str = r#"
            [node]
            name = "worker-2"
            host_ip = "172.18.0.5"
            mode = "node"

            [routing]
            rule_priority = 300

            [firewall]
            netns = "plk-gw"
        "#;

        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.name, "worker-2");
        assert_eq!(config.node.mode, NodeMode::Node);
        assert_eq!(config.routing.rule_priority, 300);
        assert_eq!(config.routing.symmetric_table, 18953);
        assert_eq!(config.netns().name(), Some("plk-gw"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[node]\nhost_ip = \"10.1.2.3\"\n[overlay]\nvni = 42\nprefix = \"241.0.0.0/8\""
        )
        .unwrap();

        let config = GatewayConfig::load_or_default(file.path()).unwrap();
        let device = config.overlay_device_config().unwrap();
        assert_eq!(device.vni, 42);
        assert_eq!(device.overlay_ip(), Ipv4Addr::new(241, 1, 2, 3));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = GatewayConfig::load_or_default("/nonexistent/gatewayd.toml").unwrap();
        assert_eq!(config.tunnel.interface, "wg-plk");
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[overlay]\nprefix = \"not-a-cidr\"").unwrap();
        let err = GatewayConfig::load_or_default(file.path()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_table_ids() {
        let mut config = valid();
        config.routing.gateway_table = 254;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.routing.symmetric_table = config.routing.gateway_table;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("routing.symmetric_table"));
    }

    #[test]
    fn test_validate_intervals() {
        let mut config = valid();
        config.firewall.enforce_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.reconcile.backoff_base_ms = 120_000;
        config.reconcile.backoff_max_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_vni_range() {
        let mut config = valid();
        config.overlay.vni = 1 << 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let config = valid().with_overrides(Overrides {
            node_name: Some("gw-1".to_string()),
            mode: Some(NodeMode::Node),
            netns: Some("plk".to_string()),
            ..Default::default()
        });
        assert_eq!(config.node.name, "gw-1");
        assert!(!config.is_gateway());
        assert_eq!(config.baseline().tunnel_port, 51820);
        assert_eq!(config.netns().name(), Some("plk"));
    }
}
