//! The pub/sub transport consumed by the registry and the call layer.
//!
//! Networking, reliable delivery and peer discovery live behind
//! [`Transport`]. A binding delivers every message and every join/leave
//! event for one subscription from a single dispatch task, in order.
//! [`LocalBus`] is the in-process binding.

mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Message, SubscriberId};
use crate::Result;

pub use local::{LocalBus, LocalNode};

/// Receives messages published on a subscribed channel.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// Handle one incoming message.
    async fn receive(&self, message: Message);
}

/// Join/leave notifications for remote subscribers on a channel.
#[async_trait]
pub trait Greeter: Send + Sync + 'static {
    /// A remote subscriber appeared on `channel`.
    async fn peer_joined(&self, channel: &str, peer: &SubscriberId);

    /// A remote subscriber on `channel` went away.
    async fn peer_left(&self, channel: &str, peer: &SubscriberId);
}

/// One attachment point to a pub/sub network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifier of this node, used in logs.
    fn node_id(&self) -> &str;

    /// Publish on `channel`. Messages with a receiver set are delivered to
    /// that subscriber only.
    async fn publish(&self, channel: &str, message: Message) -> Result<()>;

    /// Subscribe `id` to `channel`.
    ///
    /// `greeter`, when given, is told about remote subscribers already on the
    /// channel and about every later join and leave.
    async fn subscribe(
        &self,
        channel: &str,
        id: SubscriberId,
        receiver: Arc<dyn Receiver>,
        greeter: Option<Arc<dyn Greeter>>,
    ) -> Result<()>;

    /// Drop the subscription `id` on `channel`. Unknown ids are ignored.
    async fn unsubscribe(&self, channel: &str, id: &SubscriberId) -> Result<()>;

    /// Wait until `channel` has at least `count` remote subscribers or the
    /// timeout elapses; returns the count seen last.
    async fn wait_for_subscribers(&self, channel: &str, count: usize, timeout: Duration) -> usize;
}

/// Shared handle to a transport node.
pub type Node = Arc<dyn Transport>;

/// Whether two node handles refer to the same transport node.
pub(crate) fn same_node(a: &Node, b: &Node) -> bool {
    a.node_id() == b.node_id()
}
