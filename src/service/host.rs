use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn, Instrument};

use super::{reply_channel, request_channel, Request, Service, ServiceError};
use crate::codec::{TypeRegistry, TypedPayload};
use crate::message::{keys, Message, SubscriberId};
use crate::transport::{same_node, Node, Receiver};
use crate::Result;

struct ServiceHost {
    service: Box<dyn Service>,
    channel: String,
    requests: String,
    replies: String,
    id: SubscriberId,
    types: TypeRegistry,
    nodes: Mutex<Vec<Node>>,
}

/// A [`Service`] bound to its own channel.
///
/// Cloning yields another handle to the same hosted instance. The channel
/// name is generated once and stays fixed, so removing and re-adding the
/// handle advertises the same description.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<ServiceHost>,
}

impl ServiceHandle {
    /// Host `service` on a fresh channel.
    pub fn new(service: impl Service) -> Self {
        let mut types = TypeRegistry::new();
        service.register_types(&mut types);
        let channel = uuid::Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(ServiceHost {
                service: Box::new(service),
                requests: request_channel(&channel),
                replies: reply_channel(&channel),
                channel,
                id: SubscriberId::random(),
                types,
                nodes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        self.inner.service.name()
    }

    /// Channel advertised in the service's description.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Whether both handles refer to the same hosted instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe on `node`. Connecting twice to the same node is a no-op.
    pub(crate) async fn connect(&self, node: &Node) -> Result<()> {
        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.iter().any(|n| same_node(n, node)) {
                return Ok(());
            }
            nodes.push(node.clone());
        }
        let binding = Arc::new(HostBinding {
            host: Arc::downgrade(&self.inner),
            node: node.clone(),
        });
        if let Err(err) = node
            .subscribe(&self.inner.requests, self.inner.id.clone(), binding, None)
            .await
        {
            self.inner.nodes.lock().retain(|n| !same_node(n, node));
            return Err(err);
        }
        info!(service = %self.name(), channel = %self.inner.channel, node = node.node_id(), "service connected");
        Ok(())
    }

    /// Unsubscribe from `node`, if connected.
    pub(crate) async fn disconnect(&self, node: &Node) -> Result<()> {
        let was_connected = {
            let mut nodes = self.inner.nodes.lock();
            let before = nodes.len();
            nodes.retain(|n| !same_node(n, node));
            nodes.len() != before
        };
        if was_connected {
            node.unsubscribe(&self.inner.requests, &self.inner.id).await?;
            info!(service = %self.name(), channel = %self.inner.channel, node = node.node_id(), "service disconnected");
        }
        Ok(())
    }

    /// Unsubscribe from every node.
    pub(crate) async fn disconnect_all(&self) -> Result<()> {
        let nodes = std::mem::take(&mut *self.inner.nodes.lock());
        for node in nodes {
            node.unsubscribe(&self.inner.requests, &self.inner.id).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name())
            .field("channel", &self.inner.channel)
            .finish()
    }
}

struct HostBinding {
    host: Weak<ServiceHost>,
    node: Node,
}

#[async_trait]
impl Receiver for HostBinding {
    async fn receive(&self, message: Message) {
        let Some(method) = message.meta(keys::METHOD) else {
            trace!("ignoring message without method");
            return;
        };
        let Some(req_id) = message.meta(keys::REQ_ID) else {
            warn!(method, "request without correlation id");
            return;
        };
        let Some(host) = self.host.upgrade() else {
            return;
        };

        let method = method.to_string();
        let req_id = req_id.to_string();
        let reply_type = message.meta(keys::OUT_TYPE).map(str::to_string);
        let node = self.node.clone();
        let span = tracing::debug_span!("service_call", channel = %host.channel, %method, %req_id);
        tokio::spawn(
            async move {
                let outcome = dispatch(&host, method, reply_type, &message).await;
                let mut reply = Message::new();
                reply.put_meta(keys::RESP_ID, req_id);
                match outcome {
                    Ok(payload) => payload.write_into(&mut reply),
                    Err(err) => {
                        debug!(code = %err.code, message = %err.message, "call failed");
                        reply.put_meta(keys::ERROR, err.code.as_str());
                        reply.set_payload(err.message.into_bytes());
                    }
                }
                if let Err(err) = node.publish(&host.replies, reply).await {
                    warn!(%err, "failed to publish reply");
                }
            }
            .instrument(span),
        );
    }
}

async fn dispatch(
    host: &ServiceHost,
    method: String,
    reply_type: Option<String>,
    message: &Message,
) -> std::result::Result<TypedPayload, ServiceError> {
    let payload = TypedPayload::from_message(message)?;
    let value = if host.types.contains(&payload.type_tag) {
        Some(host.types.decode(&payload)?)
    } else {
        trace!(type_tag = %payload.type_tag, "no decoder registered, passing raw payload");
        None
    };
    host.service
        .call_method(Request::new(method, payload, value).with_reply_type(reply_type))
        .await
}
