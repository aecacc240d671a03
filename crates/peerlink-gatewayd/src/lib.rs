//! peerlink gateway daemon.
//!
//! Runs on every node of a peered cluster. In gateway mode it owns the
//! tunnel towards remote clusters together with the packet-filter rules,
//! NAT mappings and symmetric routes around it. In node mode it only keeps
//! remote-cluster traffic steered through the overlay to the active gateway.
//!
//! - [`config`]: TOML configuration plus command-line overrides
//! - [`store`]: resource store seam and the in-memory store
//! - [`tunnel_reconciler`]: per-descriptor connection state machine
//! - [`natmap_controller`]: per-cluster DNAT mappings
//! - [`node_controller`] / [`pod_controller`] / [`route_reconciler`]: overlay and routes
//! - [`service_controller`]: the endpoint advertised by the gateway Service
//! - [`firewall`]: periodic baseline enforcement and shutdown teardown
//! - [`daemon`]: wiring all of the above under one cancellation token

pub mod config;
pub mod daemon;
pub mod events;
pub mod firewall;
pub mod gate;
pub mod natmap_controller;
pub mod node_controller;
pub mod pod_controller;
pub mod route_reconciler;
pub mod service_controller;
pub mod store;
pub mod tunnel_reconciler;

pub use config::{GatewayConfig, NodeMode, Overrides, DEFAULT_CONFIG_PATH};
pub use daemon::{default_registry, Gateway, Kernel};
pub use events::{Event, EventKind, EventRecorder, LoggingRecorder};
pub use gate::{LocalNetwork, StartupGate};
pub use service_controller::AdvertisedEndpoint;
pub use store::{MemoryStore, ResourceEvent, Seed, ServicePort, ServiceRecord};
