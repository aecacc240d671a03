//! Common infrastructure for peerlink components.
//!
//! - [`shell`]: safe shell command execution with proper quoting and
//!   optional network-namespace prefixing
//! - [`error`]: the error taxonomy shared by every crate
//! - [`Reconciler`] / [`Controller`]: level-triggered reconcile loops
//! - [`WorkQueue`] and [`Backoff`]: the plumbing beneath a controller
//!
//! # Example
//!
//! ```ignore
//! use peerlink_common::shell::{self, IP_CMD, shellquote};
//! use peerlink_common::PeerlinkResult;
//!
//! async fn set_mtu(dev: &str, mtu: u32) -> PeerlinkResult<()> {
//!     let cmd = format!("{} link set dev {} mtu {}", IP_CMD, shellquote(dev), mtu);
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod error;
pub mod reconcile;
pub mod shell;
pub mod workqueue;

pub use backoff::Backoff;
pub use error::{PeerlinkError, PeerlinkResult};
pub use reconcile::{Controller, Reconciler, Requeue};
pub use shell::Netns;
pub use workqueue::WorkQueue;
