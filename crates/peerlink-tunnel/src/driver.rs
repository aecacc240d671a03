use async_trait::async_trait;
use peerlink_common::PeerlinkResult;
use peerlink_types::{ConnectionDescriptor, ConnectionStatus};

/// One tunnel backend.
///
/// `connect_to_endpoint` and `disconnect_from_endpoint` must be idempotent:
/// the reconciler calls them on every pass for a descriptor.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Backend type this driver serves (`"wireguard"`, ...).
    fn backend(&self) -> &str;

    /// Name of the tunnel interface the driver manages.
    fn interface_name(&self) -> &str;

    /// Creates and configures the tunnel device. Called once at startup;
    /// failure aborts the daemon.
    async fn init(&self) -> PeerlinkResult<()>;

    /// Configures the tunnel towards the descriptor's remote endpoint and
    /// reports how far the connection got.
    async fn connect_to_endpoint(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> PeerlinkResult<ConnectionStatus>;

    /// Removes the descriptor's peer. An absent peer is success.
    async fn disconnect_from_endpoint(&self, descriptor: &ConnectionDescriptor) -> PeerlinkResult<()>;

    /// Tears down the tunnel device.
    async fn close(&self) -> PeerlinkResult<()>;
}
