//! Overlay network manager for peerlink.
//!
//! Every node carries one VXLAN device. Its address lives in a fixed
//! well-known block and keeps the trailing octets of the host IP, so a node
//! can compute the overlay address and MAC of any peer from that peer's
//! host IP alone. Gateway replicas are reached through FDB entries that
//! point those MACs at the peer's VTEP.

mod addressing;
mod device;
mod manager;
mod peers;

pub use addressing::{overlay_ip, overlay_mac};
pub use device::{DeviceOutcome, OverlayDeviceConfig, DEFAULT_VXLAN_PORT};
pub use manager::OverlayManager;
pub use peers::VxlanPeers;
