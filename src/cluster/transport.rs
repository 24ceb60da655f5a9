//! Transport abstraction between members.

use std::net::SocketAddr;

use crate::utils::GridError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::sync::mpsc;

/// Member address type.
pub type Address = SocketAddr;

/// Receiving side of a transport: `(sender, frame)` pairs.
pub type Inbox = mpsc::UnboundedReceiver<(Address, Bytes)>;

/// Peers a transport gave up on after `send` had accepted frames for them,
/// with the cause. Whatever was queued for such a peer is lost.
pub type PeerFailures = mpsc::UnboundedReceiver<(Address, String)>;

/// Frame-level transport to other members. Frames to the same destination
/// are delivered in send order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// My own address.
    fn local_addr(&self) -> Address;

    /// Enqueues a frame for delivery to member `to`. Fails fast with
    /// `GridError::Unreachable` if the member is known to be unreachable.
    fn send(&self, to: Address, frame: Bytes) -> Result<(), GridError>;

    /// Takes the stream of delivery failures detected after `send` returned.
    /// Can be taken once. Transports that fail every undeliverable send
    /// right away have none.
    fn take_failures(&self) -> Option<PeerFailures> {
        None
    }

    /// Stops sending and receiving.
    async fn shutdown(&self);
}
