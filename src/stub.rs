//! Client side of the call layer.
//!
//! A [`ServiceStub`] publishes requests tagged with a fresh correlation id
//! on the service's `<channel>.listen` and completes the matching pending
//! call when a reply carrying that id comes back on `<channel>.serve`.
//! Replies nobody waits for are dropped. Only hosts subscribe to the request
//! side, so other callers never count as the service being present.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn, Instrument};

use crate::codec::{Typed, TypedPayload};
use crate::config::StubConfig;
use crate::description::ServiceDescription;
use crate::message::{keys, Message, SubscriberId};
use crate::service::{reply_channel, request_channel};
use crate::transport::{Node, Receiver};
use crate::{Error, Result};

struct StubInner {
    service_name: String,
    channel: String,
    requests: String,
    replies: String,
    id: SubscriberId,
    nodes: Vec<Node>,
    pending: DashMap<String, oneshot::Sender<Message>>,
    config: StubConfig,
    closed: AtomicBool,
}

/// Handle for calling methods on one remote service instance.
///
/// Cheap to clone; clones share the subscription and the pending calls.
/// Call [`close`](Self::close) to leave the channel.
#[derive(Clone)]
pub struct ServiceStub {
    inner: Arc<StubInner>,
}

impl ServiceStub {
    /// Bind to the service described by `desc` with default options.
    ///
    /// `desc` must come from a [`ServiceRegistry`](crate::ServiceRegistry),
    /// which records the transport nodes to bind on.
    pub async fn connect(desc: &ServiceDescription) -> Result<Self> {
        Self::connect_with(desc, StubConfig::default()).await
    }

    /// Bind to the service described by `desc`.
    pub async fn connect_with(desc: &ServiceDescription, config: StubConfig) -> Result<Self> {
        let nodes = desc.nodes();
        if nodes.is_empty() {
            return Err(Error::transport(format!(
                "description of '{}' is not bound to any transport node",
                desc.name()
            )));
        }
        Self::with_nodes(desc, nodes, config).await
    }

    /// Bind to the service described by `desc` through explicit `nodes`.
    ///
    /// Waits up to [`StubConfig::bind_timeout`] for a host to listen for
    /// requests on the service's channel.
    pub async fn with_nodes(
        desc: &ServiceDescription,
        nodes: Vec<Node>,
        config: StubConfig,
    ) -> Result<Self> {
        let inner = Arc::new(StubInner {
            service_name: desc.name().to_string(),
            channel: desc.channel().to_string(),
            requests: request_channel(desc.channel()),
            replies: reply_channel(desc.channel()),
            id: SubscriberId::random(),
            nodes,
            pending: DashMap::new(),
            config,
            closed: AtomicBool::new(false),
        });

        for node in &inner.nodes {
            let receiver = Arc::new(StubReceiver {
                inner: Arc::downgrade(&inner),
            });
            node.subscribe(&inner.replies, inner.id.clone(), receiver, None)
                .await?;
        }

        let stub = Self { inner };
        if !stub.wait_bound().await {
            stub.close().await;
            return Err(Error::NoSubscribers(stub.inner.channel.clone()));
        }
        debug!(service = %stub.inner.service_name, channel = %stub.inner.channel, "stub bound");
        Ok(stub)
    }

    async fn wait_bound(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.inner.config.bind_timeout;
        for node in &self.inner.nodes {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if node
                .wait_for_subscribers(&self.inner.requests, 1, remaining)
                .await
                >= 1
            {
                return true;
            }
        }
        false
    }

    /// Name of the remote service.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Channel of the remote service.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `method` with a typed request and decode the typed reply.
    pub async fn call<Req: Typed, Rep: Typed>(&self, method: &str, request: &Req) -> Result<Rep> {
        self.call_timeout(method, request, self.inner.config.call_timeout)
            .await
    }

    /// [`call`](Self::call) with an explicit timeout.
    pub async fn call_timeout<Req: Typed, Rep: Typed>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Rep> {
        let reply = self
            .call_raw_timeout(method, TypedPayload::encode(request), &Rep::type_tag(), timeout)
            .await?;
        reply.decode::<Rep>()
    }

    /// Call `method` with an already encoded request.
    pub async fn call_raw(
        &self,
        method: &str,
        request: TypedPayload,
        reply_type: &str,
    ) -> Result<TypedPayload> {
        self.call_raw_timeout(method, request, reply_type, self.inner.config.call_timeout)
            .await
    }

    /// [`call_raw`](Self::call_raw) with an explicit timeout.
    ///
    /// Returns [`Error::Timeout`] if no reply arrives in time; a reply that
    /// shows up later is discarded.
    pub async fn call_raw_timeout(
        &self,
        method: &str,
        request: TypedPayload,
        reply_type: &str,
        timeout: Duration,
    ) -> Result<TypedPayload> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let req_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::debug_span!("stub_call", channel = %self.inner.channel, %method, %req_id);
        async {
            let (tx, rx) = oneshot::channel();
            let previous = self.inner.pending.insert(req_id.clone(), tx);
            debug_assert!(previous.is_none(), "duplicate correlation id {req_id}");

            let mut msg = Message::new();
            msg.put_meta(keys::REQ_ID, req_id.as_str())
                .put_meta(keys::METHOD, method)
                .put_meta(keys::OUT_TYPE, reply_type);
            request.write_into(&mut msg);

            if let Err(err) = self.publish(msg).await {
                self.inner.pending.remove(&req_id);
                return Err(err);
            }
            trace!("request published");

            let reply = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => return Err(Error::Closed),
                Err(_) => {
                    self.inner.pending.remove(&req_id);
                    debug!(?timeout, "call timed out");
                    return Err(Error::Timeout(timeout));
                }
            };

            if let Some(code) = reply.meta(keys::ERROR) {
                return Err(Error::Remote {
                    code: code.to_string(),
                    message: String::from_utf8_lossy(reply.payload()).into_owned(),
                });
            }
            TypedPayload::from_message(&reply)
        }
        .instrument(span)
        .await
    }

    /// Publish through the first node that accepts the message.
    async fn publish(&self, msg: Message) -> Result<()> {
        let mut last_err = None;
        for node in &self.inner.nodes {
            match node.publish(&self.inner.requests, msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(node = node.node_id(), %err, "publish failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::transport("stub has no transport nodes")))
    }

    /// Leave the channel. Calls still waiting fail with [`Error::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for node in &self.inner.nodes {
            if let Err(err) = node.unsubscribe(&self.inner.replies, &self.inner.id).await {
                warn!(node = node.node_id(), %err, "unsubscribe failed");
            }
        }
        self.inner.pending.clear();
    }
}

impl fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceStub")
            .field("service", &self.inner.service_name)
            .field("channel", &self.inner.channel)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

struct StubReceiver {
    inner: Weak<StubInner>,
}

#[async_trait]
impl Receiver for StubReceiver {
    async fn receive(&self, message: Message) {
        let Some(resp_id) = message.meta(keys::RESP_ID) else {
            return;
        };
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match inner.pending.remove(resp_id) {
            Some((_, tx)) => {
                let _ = tx.send(message);
            }
            None => trace!(resp_id, "dropping reply without pending call"),
        }
    }
}
