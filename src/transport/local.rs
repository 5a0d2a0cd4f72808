//! In-process pub/sub bus.
//!
//! A [`LocalBus`] is a hub shared by any number of [`LocalNode`]s. A message
//! published through one node reaches the matching subscriptions of every
//! *other* node; greeters and subscriber counts likewise only see remote
//! subscriptions. Each subscription owns an unbounded queue drained by one
//! dispatch task, so messages and join/leave events arrive in publish order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, Instrument};

use super::{Greeter, Receiver, Transport};
use crate::message::{Message, SubscriberId};
use crate::{Error, Result};

enum Event {
    Message(Message),
    PeerJoined(SubscriberId),
    PeerLeft(SubscriberId),
}

struct Entry {
    id: SubscriberId,
    node: String,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, Vec<Entry>>,
}

impl BusState {
    fn remote_count(&self, channel: &str, node: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entries| entries.iter().filter(|e| e.node != node).count())
            .unwrap_or(0)
    }

    /// Remove a subscription and tell remote subscribers it left.
    fn remove(&mut self, channel: &str, id: &SubscriberId, node: &str) -> bool {
        let Some(entries) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !(e.id == *id && e.node == node));
        if entries.len() == before {
            return false;
        }
        for entry in entries.iter().filter(|e| e.node != node) {
            let _ = entry.tx.send(Event::PeerLeft(id.clone()));
        }
        if entries.is_empty() {
            self.channels.remove(channel);
        }
        true
    }
}

/// Shared in-process hub.
#[derive(Clone)]
pub struct LocalBus {
    state: Arc<Mutex<BusState>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            changed: Arc::new(changed),
        }
    }

    /// Create a new node attached to this bus.
    pub fn node(&self) -> Arc<LocalNode> {
        Arc::new(LocalNode {
            id: uuid::Uuid::new_v4().to_string(),
            bus: self.clone(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

/// One node on a [`LocalBus`].
pub struct LocalNode {
    id: String,
    bus: LocalBus,
    subscriptions: Mutex<Vec<(String, SubscriberId)>>,
}

impl LocalNode {
    /// Drop every subscription of this node, as if its process went away.
    ///
    /// Remote greeters see a leave for each subscription.
    pub fn disconnect(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        {
            let mut state = self.bus.state.lock();
            for (channel, id) in &subscriptions {
                state.remove(channel, id, &self.id);
            }
        }
        debug!(node = %self.id, count = subscriptions.len(), "node disconnected");
        self.bus.bump();
    }

    /// Number of remote subscribers currently on `channel`.
    pub fn remote_subscribers(&self, channel: &str) -> usize {
        self.bus.state.lock().remote_count(channel, &self.id)
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Transport for LocalNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    async fn publish(&self, channel: &str, message: Message) -> Result<()> {
        let state = self.bus.state.lock();
        let Some(entries) = state.channels.get(channel) else {
            trace!(channel, "publish with no subscribers");
            return Ok(());
        };
        let targets = entries
            .iter()
            .filter(|e| e.node != self.id)
            .filter(|e| message.receiver().map_or(true, |r| *r == e.id));
        for entry in targets {
            let _ = entry.tx.send(Event::Message(message.clone()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        id: SubscriberId,
        receiver: Arc<dyn Receiver>,
        greeter: Option<Arc<dyn Greeter>>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.bus.state.lock();
            let entries = state.channels.entry(channel.to_string()).or_default();
            if entries.iter().any(|e| e.id == id && e.node == self.id) {
                return Err(Error::transport(format!(
                    "subscriber {id} already on channel '{channel}'"
                )));
            }
            for entry in entries.iter().filter(|e| e.node != self.id) {
                let _ = tx.send(Event::PeerJoined(entry.id.clone()));
                let _ = entry.tx.send(Event::PeerJoined(id.clone()));
            }
            entries.push(Entry {
                id: id.clone(),
                node: self.id.clone(),
                tx,
            });
        }
        self.subscriptions.lock().push((channel.to_string(), id.clone()));
        self.bus.bump();

        let channel = channel.to_string();
        let span = tracing::debug_span!("local_dispatch", channel = %channel, subscriber = %id);
        tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        Event::Message(message) => receiver.receive(message).await,
                        Event::PeerJoined(peer) => {
                            if let Some(greeter) = &greeter {
                                greeter.peer_joined(&channel, &peer).await;
                            }
                        }
                        Event::PeerLeft(peer) => {
                            if let Some(greeter) = &greeter {
                                greeter.peer_left(&channel, &peer).await;
                            }
                        }
                    }
                }
                trace!("dispatch queue closed");
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, id: &SubscriberId) -> Result<()> {
        self.subscriptions
            .lock()
            .retain(|(c, s)| !(c == channel && s == id));
        let removed = self.bus.state.lock().remove(channel, id, &self.id);
        if removed {
            self.bus.bump();
        }
        Ok(())
    }

    async fn wait_for_subscribers(&self, channel: &str, count: usize, timeout: Duration) -> usize {
        let mut changed = self.bus.changed.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.remote_subscribers(channel);
            if current >= count {
                return current;
            }
            match tokio::time::timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.remote_subscribers(channel),
            }
        }
    }
}
