//! Tunnel drivers for peerlink.
//!
//! A [`TunnelDriver`] owns the encrypted point-to-point link towards remote
//! clusters for one backend type. Drivers are registered by name in a
//! [`DriverRegistry`] at startup; the connection reconciler looks them up by
//! the descriptor's `backendType`.
//!
//! # Backends
//!
//! - [`wireguard`]: kernel WireGuard driven through the `wg` utility

mod driver;
pub mod fake;
mod registry;
pub mod wireguard;

pub use driver::TunnelDriver;
pub use registry::{DriverConstructor, DriverRegistry, DriverSet};
