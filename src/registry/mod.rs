//! Per-process service registry.
//!
//! A [`ServiceRegistry`] advertises locally hosted services, answers one-shot
//! lookups from its peers, serves their continuous queries and runs its own.
//! All registries meet on one discovery channel; each subscribes there with
//! its manager id, which peers use as the unicast address for replies.
//!
//! State lives behind a single mutex. Handlers compute their outbound
//! messages and listener notifications while holding it and deliver them
//! after releasing it. Each continuous query hands its events to a task of
//! its own, so a slow listener never holds up discovery traffic.

mod listener;
mod protocol;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn, Instrument};

use crate::config::RegistryConfig;
use crate::description::{NodeSet, ServiceDescription};
use crate::filter::ServiceFilter;
use crate::message::{keys, Message, SubscriberId};
use crate::service::ServiceHandle;
use crate::transport::{same_node, Greeter, Node, Receiver};
use crate::Result;

pub use listener::{QueryEvent, QueryListener, QueryStream};
use protocol::MessageKind;

struct LocalService {
    handle: ServiceHandle,
    desc: ServiceDescription,
}

struct LocalQuery {
    filter: ServiceFilter,
    events: mpsc::UnboundedSender<QueryEvent>,
}

struct RemoteQuery {
    filter: ServiceFilter,
    requesters: BTreeSet<SubscriberId>,
}

/// A service hosted by a peer, with what each local query was last told.
#[derive(Default)]
struct RemoteService {
    reported: HashMap<String, ServiceDescription>,
}

enum FindWaiter {
    First(oneshot::Sender<ServiceDescription>),
    All(mpsc::UnboundedSender<ServiceDescription>),
}

#[derive(Default)]
struct RegistryState {
    /// Hosted services by channel.
    services: BTreeMap<String, LocalService>,
    /// Outstanding lookups by request id.
    finds: HashMap<String, FindWaiter>,
    /// Our continuous queries by filter id.
    local_queries: HashMap<String, LocalQuery>,
    /// Peers' continuous queries by filter id.
    remote_queries: HashMap<String, RemoteQuery>,
    /// Services reported to our queries, by manager id then channel.
    remote_services: HashMap<SubscriberId, HashMap<String, RemoteService>>,
    /// Known peers and the nodes they were seen on.
    peers: HashMap<SubscriberId, Vec<Node>>,
    /// Replies waiting for their addressee to join.
    pending: HashMap<SubscriberId, Vec<(Instant, Message)>>,
}

enum Effect {
    Publish { node: Node, msg: Message },
    Notify {
        events: mpsc::UnboundedSender<QueryEvent>,
        event: QueryEvent,
    },
}

struct RegistryInner {
    id: SubscriberId,
    config: RegistryConfig,
    nodes: NodeSet,
    state: Mutex<RegistryState>,
}

/// Discovery endpoint of one process.
///
/// Cheap to clone; clones share state.
///
/// ```no_run
/// # async fn run() -> pubsub_rpc::Result<()> {
/// use pubsub_rpc::{LocalBus, Node, ServiceFilter, ServiceRegistry};
///
/// let bus = LocalBus::new();
/// let node: Node = bus.node();
/// let registry = ServiceRegistry::builder().node(node).build().await?;
/// if let Some(desc) = registry.find(&ServiceFilter::new("Echo")).await {
///     println!("echo lives on {}", desc.channel());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    /// Registry not yet attached to any node.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: SubscriberId::random(),
                config,
                nodes: Arc::new(RwLock::new(Vec::new())),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Manager id of this registry.
    pub fn id(&self) -> &SubscriberId {
        &self.inner.id
    }

    /// Options in effect.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Attached transport nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.read().clone()
    }

    /// Join the discovery channel on `node` and host every service there too.
    pub async fn attach(&self, node: Node) -> Result<()> {
        if self.inner.nodes.read().iter().any(|n| same_node(n, &node)) {
            return Ok(());
        }
        let binding = Arc::new(DiscoveryBinding {
            inner: Arc::downgrade(&self.inner),
            node: node.clone(),
        });
        node.subscribe(
            &self.inner.config.discovery_channel,
            self.inner.id.clone(),
            binding.clone(),
            Some(binding),
        )
        .await?;
        self.inner.nodes.write().push(node.clone());

        let services: Vec<ServiceHandle> = {
            let state = self.inner.state.lock();
            state.services.values().map(|s| s.handle.clone()).collect()
        };
        for service in services {
            service.connect(&node).await?;
        }
        info!(mgr_id = %self.inner.id, node = node.node_id(), "registry attached");
        Ok(())
    }

    /// Leave the discovery channel on `node` and stop hosting services there.
    ///
    /// Peers only reachable through `node` are treated as gone.
    pub async fn detach(&self, node: &Node) -> Result<()> {
        let was_attached = {
            let mut nodes = self.inner.nodes.write();
            let before = nodes.len();
            nodes.retain(|n| !same_node(n, node));
            nodes.len() != before
        };
        if !was_attached {
            return Ok(());
        }
        node.unsubscribe(&self.inner.config.discovery_channel, &self.inner.id)
            .await?;

        let (services, effects) = {
            let mut state = self.inner.state.lock();
            let mut effects = Vec::new();
            let peers: Vec<SubscriberId> = state
                .peers
                .iter()
                .filter(|(_, nodes)| nodes.iter().any(|n| same_node(n, node)))
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in peers {
                self.inner.drop_peer(&mut state, node, &peer, &mut effects);
            }
            let services: Vec<ServiceHandle> =
                state.services.values().map(|s| s.handle.clone()).collect();
            (services, effects)
        };
        self.inner.apply(effects).await;
        for service in services {
            service.disconnect(node).await?;
        }
        info!(mgr_id = %self.inner.id, node = node.node_id(), "registry detached");
        Ok(())
    }

    /// Advertise `service` with the properties in `desc`.
    ///
    /// Name and channel of the returned description are taken from the
    /// service. Adding an already advertised service returns its current
    /// description and changes nothing.
    pub async fn add_service(
        &self,
        service: &ServiceHandle,
        mut desc: ServiceDescription,
    ) -> Result<ServiceDescription> {
        let existing = self
            .inner
            .state
            .lock()
            .services
            .get(service.channel())
            .map(|s| s.desc.clone());
        if let Some(existing) = existing {
            return Ok(existing);
        }
        desc.bind(service.name(), service.channel());

        for node in self.nodes() {
            service.connect(&node).await?;
        }

        let effects = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.services.get(service.channel()) {
                return Ok(existing.desc.clone());
            }
            state.services.insert(
                service.channel().to_string(),
                LocalService {
                    handle: service.clone(),
                    desc: desc.clone(),
                },
            );
            let mut effects = Vec::new();
            self.inner
                .notify_remote_queries(&mut state, &desc, MessageKind::Discovered, &mut effects);
            effects
        };
        info!(service = %desc.name(), channel = %desc.channel(), "service added");
        self.inner.apply(effects).await;
        Ok(desc)
    }

    /// Withdraw `service`. Returns whether it was advertised.
    pub async fn remove_service(&self, service: &ServiceHandle) -> Result<bool> {
        let (removed, effects) = {
            let mut state = self.inner.state.lock();
            let Some(removed) = state.services.remove(service.channel()) else {
                return Ok(false);
            };
            let mut effects = Vec::new();
            self.inner.notify_remote_queries(
                &mut state,
                &removed.desc,
                MessageKind::Vanished,
                &mut effects,
            );
            (removed, effects)
        };
        self.inner.apply(effects).await;
        removed.handle.disconnect_all().await?;
        info!(service = %removed.desc.name(), channel = %removed.desc.channel(), "service removed");
        Ok(true)
    }

    /// Replace the properties of an advertised service.
    ///
    /// Peers whose queries still match see a `changed` event, peers whose
    /// queries stopped matching see `removed` and newly matching ones see
    /// `added`. Returns whether the service was advertised.
    pub async fn update_service<I, K, V>(&self, service: &ServiceHandle, properties: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let properties: BTreeMap<String, String> = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let effects = {
            let mut state = self.inner.state.lock();
            let Some(local) = state.services.get_mut(service.channel()) else {
                return false;
            };
            let old = local.desc.clone();
            local.desc.set_properties(properties);
            let new = local.desc.clone();
            if old == new {
                return true;
            }

            let mut effects = Vec::new();
            let updates: Vec<(SubscriberId, String, MessageKind)> = state
                .remote_queries
                .values()
                .filter_map(|q| {
                    let kind = if q.filter.matches(&new) {
                        MessageKind::Discovered
                    } else if q.filter.matches(&old) {
                        MessageKind::Vanished
                    } else {
                        return None;
                    };
                    Some((q, kind))
                })
                .flat_map(|(q, kind)| {
                    q.requesters
                        .iter()
                        .map(move |mgr| (mgr.clone(), q.filter.id().to_string(), kind))
                })
                .collect();
            for (mgr, filter_id, kind) in updates {
                let desc = if kind == MessageKind::Discovered { &new } else { &old };
                let msg = protocol::notify(kind, desc, &filter_id, &self.inner.id);
                self.inner.unicast(&mut state, &mgr, msg, &mut effects);
            }
            effects
        };
        debug!(channel = %service.channel(), "service properties updated");
        self.inner.apply(effects).await;
        true
    }

    /// Descriptions of hosted services matching `filter`.
    pub fn find_local(&self, filter: &ServiceFilter) -> Vec<ServiceDescription> {
        let state = self.inner.state.lock();
        state
            .services
            .values()
            .filter(|s| filter.matches(&s.desc))
            .map(|s| s.desc.clone())
            .collect()
    }

    /// Ask the peers for a service matching `filter`, waiting up to
    /// [`RegistryConfig::find_timeout`].
    pub async fn find(&self, filter: &ServiceFilter) -> Option<ServiceDescription> {
        self.find_with_timeout(filter, self.inner.config.find_timeout)
            .await
    }

    /// [`find`](Self::find) with an explicit timeout.
    ///
    /// Returns the first answer, or `None` if no peer is around or none
    /// answered in time. Answers arriving later are discarded.
    pub async fn find_with_timeout(
        &self,
        filter: &ServiceFilter,
        timeout: Duration,
    ) -> Option<ServiceDescription> {
        let deadline = tokio::time::Instant::now() + timeout;
        if !self.inner.wait_for_peers(timeout).await {
            debug!(service = %filter.service_name(), "no other registry to ask");
            return None;
        }

        let req_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::debug_span!("find", service = %filter.service_name(), %req_id);
        async {
            let (tx, rx) = oneshot::channel();
            self.inner.start_find(filter, &req_id, FindWaiter::First(tx)).await;
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(desc)) => Some(desc),
                _ => {
                    self.inner.state.lock().finds.remove(&req_id);
                    debug!("find timed out");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Collect every answer matching `filter` that arrives within `timeout`.
    pub async fn find_all(
        &self,
        filter: &ServiceFilter,
        timeout: Duration,
    ) -> Vec<ServiceDescription> {
        let deadline = tokio::time::Instant::now() + timeout;
        if !self.inner.wait_for_peers(timeout).await {
            return Vec::new();
        }

        let req_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.start_find(filter, &req_id, FindWaiter::All(tx)).await;

        let mut found: Vec<ServiceDescription> = Vec::new();
        while let Ok(Some(desc)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if !found.contains(&desc) {
                found.push(desc);
            }
        }
        self.inner.state.lock().finds.remove(&req_id);
        found
    }

    /// Start a continuous query; `listener` hears about matching services
    /// on peers until [`stop_query`](Self::stop_query).
    ///
    /// Callbacks for one query run in order on a task of their own. Starting
    /// a query with the id of an active one replaces its listener.
    pub async fn start_query(&self, filter: &ServiceFilter, listener: impl QueryListener) {
        let events = spawn_listener(filter.id(), listener);
        let effects = {
            let mut state = self.inner.state.lock();
            state.local_queries.insert(
                filter.id().to_string(),
                LocalQuery {
                    filter: filter.clone(),
                    events,
                },
            );
            let mut effects = Vec::new();
            let msg = protocol::query(MessageKind::StartDiscovery, filter, &self.inner.id);
            self.inner.broadcast(msg, &mut effects);
            effects
        };
        info!(service = %filter.service_name(), filter_id = %filter.id(), "query started");
        self.inner.apply(effects).await;
    }

    /// [`start_query`](Self::start_query) delivering events as a stream.
    pub async fn start_query_stream(&self, filter: &ServiceFilter) -> QueryStream {
        let (stream, tx) = QueryStream::new(filter.clone());
        self.start_query(filter, tx).await;
        stream
    }

    /// Stop a continuous query. Returns whether it was active.
    pub async fn stop_query(&self, filter: &ServiceFilter) -> bool {
        let effects = {
            let mut state = self.inner.state.lock();
            if state.local_queries.remove(filter.id()).is_none() {
                return false;
            }
            for services in state.remote_services.values_mut() {
                for service in services.values_mut() {
                    service.reported.remove(filter.id());
                }
                services.retain(|_, s| !s.reported.is_empty());
            }
            state.remote_services.retain(|_, s| !s.is_empty());

            let mut effects = Vec::new();
            let msg = protocol::query(MessageKind::StopDiscovery, filter, &self.inner.id);
            self.inner.broadcast(msg, &mut effects);
            effects
        };
        info!(filter_id = %filter.id(), "query stopped");
        self.inner.apply(effects).await;
        true
    }

    /// Stop every query, withdraw every service and detach from all nodes.
    pub async fn shutdown(&self) -> Result<()> {
        let filters: Vec<ServiceFilter> = {
            let state = self.inner.state.lock();
            state
                .local_queries
                .values()
                .map(|q| q.filter.clone())
                .collect()
        };
        for filter in &filters {
            self.stop_query(filter).await;
        }

        let services: Vec<ServiceHandle> = {
            let state = self.inner.state.lock();
            state.services.values().map(|s| s.handle.clone()).collect()
        };
        for service in &services {
            self.remove_service(service).await?;
        }

        for node in self.nodes() {
            self.detach(&node).await?;
        }
        self.inner.state.lock().finds.clear();
        info!(mgr_id = %self.inner.id, "registry shut down");
        Ok(())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ServiceRegistry")
            .field("id", &self.inner.id)
            .field("services", &state.services.len())
            .field("queries", &state.local_queries.len())
            .field("peers", &state.peers.len())
            .finish()
    }
}

impl RegistryInner {
    async fn wait_for_peers(&self, timeout: Duration) -> bool {
        let nodes = self.nodes.read().clone();
        let deadline = tokio::time::Instant::now() + timeout;
        for node in nodes {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if node
                .wait_for_subscribers(&self.config.discovery_channel, 1, remaining)
                .await
                >= 1
            {
                return true;
            }
        }
        false
    }

    async fn start_find(&self, filter: &ServiceFilter, req_id: &str, waiter: FindWaiter) {
        let effects = {
            let mut state = self.state.lock();
            let previous = state.finds.insert(req_id.to_string(), waiter);
            debug_assert!(previous.is_none(), "duplicate find request {req_id}");
            let mut effects = Vec::new();
            self.broadcast(protocol::discover(filter, req_id, &self.id), &mut effects);
            effects
        };
        self.apply(effects).await;
    }

    fn broadcast(&self, msg: Message, out: &mut Vec<Effect>) {
        for node in self.nodes.read().iter() {
            out.push(Effect::Publish {
                node: node.clone(),
                msg: msg.clone(),
            });
        }
    }

    /// Address `msg` to `peer`, queueing it if the peer has not joined yet.
    fn unicast(
        &self,
        state: &mut RegistryState,
        peer: &SubscriberId,
        mut msg: Message,
        out: &mut Vec<Effect>,
    ) {
        msg.set_receiver(peer.clone());
        if let Some(node) = state.peers.get(peer).and_then(|nodes| nodes.first()) {
            out.push(Effect::Publish {
                node: node.clone(),
                msg,
            });
            return;
        }
        let ttl = self.config.pending_ttl;
        state.pending.retain(|_, queued| {
            queued.retain(|(at, _)| at.elapsed() < ttl);
            !queued.is_empty()
        });
        trace!(mgr_id = %peer, "peer unknown, queueing reply");
        state
            .pending
            .entry(peer.clone())
            .or_default()
            .push((Instant::now(), msg));
    }

    /// Tell every peer whose query matches `desc` about it.
    fn notify_remote_queries(
        &self,
        state: &mut RegistryState,
        desc: &ServiceDescription,
        kind: MessageKind,
        out: &mut Vec<Effect>,
    ) {
        let targets: Vec<(SubscriberId, String)> = state
            .remote_queries
            .values()
            .filter(|q| q.filter.matches(desc))
            .flat_map(|q| {
                q.requesters
                    .iter()
                    .map(move |mgr| (mgr.clone(), q.filter.id().to_string()))
            })
            .collect();
        for (mgr, filter_id) in targets {
            let msg = protocol::notify(kind, desc, &filter_id, &self.id);
            self.unicast(state, &mgr, msg, out);
        }
    }

    async fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish { node, msg } => {
                    if let Err(err) = node.publish(&self.config.discovery_channel, msg).await {
                        warn!(node = node.node_id(), %err, "failed to publish discovery message");
                    }
                }
                Effect::Notify { events, event } => {
                    if events.send(event).is_err() {
                        trace!("query listener gone");
                    }
                }
            }
        }
    }

    async fn handle_message(&self, msg: Message) {
        if msg.meta(keys::MGR_ID) == Some(self.id.as_str()) {
            return;
        }
        if let Some(resp_id) = msg.meta(keys::RESP_ID) {
            self.complete_find(resp_id, &msg);
            return;
        }
        let Some(kind) = msg.meta(keys::TYPE) else {
            trace!("ignoring discovery message without type");
            return;
        };
        let kind: MessageKind = match kind.parse() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(%err, "dropping discovery message");
                return;
            }
        };
        let Some(mgr) = msg.meta(keys::MGR_ID).map(SubscriberId::from) else {
            warn!(%kind, "discovery message without manager id");
            return;
        };
        trace!(%kind, mgr_id = %mgr, "discovery message");

        let mut effects = Vec::new();
        {
            let mut state = self.state.lock();
            match kind {
                MessageKind::Discover => self.on_discover(&mut state, &msg, &mgr, &mut effects),
                MessageKind::StartDiscovery => {
                    self.on_start_discovery(&mut state, &msg, &mgr, &mut effects)
                }
                MessageKind::StopDiscovery => self.on_stop_discovery(&mut state, &msg, &mgr),
                MessageKind::Discovered | MessageKind::Vanished => {
                    self.on_notification(&mut state, kind, &msg, &mgr, &mut effects)
                }
            }
        }
        self.apply(effects).await;
    }

    fn complete_find(&self, resp_id: &str, msg: &Message) {
        let desc = match ServiceDescription::from_message(msg) {
            Ok(desc) => desc.with_nodes(self.nodes.clone()),
            Err(err) => {
                warn!(%err, req_id = resp_id, "dropping find reply");
                return;
            }
        };
        let mut state = self.state.lock();
        match state.finds.remove(resp_id) {
            Some(FindWaiter::First(tx)) => {
                let _ = tx.send(desc);
            }
            Some(FindWaiter::All(tx)) => {
                let _ = tx.send(desc);
                state.finds.insert(resp_id.to_string(), FindWaiter::All(tx));
            }
            None => trace!(req_id = resp_id, "dropping late or unknown find reply"),
        }
    }

    fn on_discover(
        &self,
        state: &mut RegistryState,
        msg: &Message,
        mgr: &SubscriberId,
        out: &mut Vec<Effect>,
    ) {
        let filter = match ServiceFilter::from_message(msg) {
            Ok(filter) => filter,
            Err(err) => {
                warn!(%err, mgr_id = %mgr, "ignoring find with malformed filter");
                return;
            }
        };
        let Some(req_id) = msg.meta(keys::REQ_ID) else {
            warn!(mgr_id = %mgr, "find without request id");
            return;
        };
        let replies: Vec<Message> = state
            .services
            .values()
            .filter(|s| filter.matches(&s.desc))
            .map(|s| protocol::found(&s.desc, req_id, &self.id))
            .collect();
        debug!(service = %filter.service_name(), %req_id, matches = replies.len(), "answering find");
        for reply in replies {
            self.unicast(state, mgr, reply, out);
        }
    }

    fn on_start_discovery(
        &self,
        state: &mut RegistryState,
        msg: &Message,
        mgr: &SubscriberId,
        out: &mut Vec<Effect>,
    ) {
        let filter = match ServiceFilter::from_message(msg) {
            Ok(filter) => filter,
            Err(err) => {
                warn!(%err, mgr_id = %mgr, "ignoring query with malformed filter");
                return;
            }
        };
        let matches: Vec<Message> = state
            .services
            .values()
            .filter(|s| filter.matches(&s.desc))
            .map(|s| protocol::notify(MessageKind::Discovered, &s.desc, filter.id(), &self.id))
            .collect();
        debug!(service = %filter.service_name(), filter_id = %filter.id(), mgr_id = %mgr, "remote query started");

        let query = state
            .remote_queries
            .entry(filter.id().to_string())
            .or_insert_with(|| RemoteQuery {
                filter: filter.clone(),
                requesters: BTreeSet::new(),
            });
        query.filter = filter;
        query.requesters.insert(mgr.clone());

        for reply in matches {
            self.unicast(state, mgr, reply, out);
        }
    }

    fn on_stop_discovery(&self, state: &mut RegistryState, msg: &Message, mgr: &SubscriberId) {
        let Some(filter_id) = protocol::filter_id(msg) else {
            warn!(mgr_id = %mgr, "stop without filter id");
            return;
        };
        if let Some(query) = state.remote_queries.get_mut(filter_id) {
            query.requesters.remove(mgr);
            if query.requesters.is_empty() {
                state.remote_queries.remove(filter_id);
            }
            debug!(%filter_id, mgr_id = %mgr, "remote query stopped");
        }
    }

    fn on_notification(
        &self,
        state: &mut RegistryState,
        kind: MessageKind,
        msg: &Message,
        mgr: &SubscriberId,
        out: &mut Vec<Effect>,
    ) {
        let Some(filter_id) = msg.meta(keys::FILTER_ID) else {
            warn!(%kind, mgr_id = %mgr, "notification without filter id");
            return;
        };
        let Some(events) = state
            .local_queries
            .get(filter_id)
            .map(|q| q.events.clone())
        else {
            trace!(%filter_id, "notification for inactive query");
            return;
        };
        let desc = match ServiceDescription::from_message(msg) {
            Ok(desc) => desc.with_nodes(self.nodes.clone()),
            Err(err) => {
                warn!(%err, mgr_id = %mgr, "dropping notification");
                return;
            }
        };

        let event = if kind == MessageKind::Discovered {
            let service = state
                .remote_services
                .entry(mgr.clone())
                .or_default()
                .entry(desc.channel().to_string())
                .or_default();
            match service.reported.insert(filter_id.to_string(), desc.clone()) {
                None => QueryEvent::Added(desc),
                Some(previous) if previous == desc => {
                    trace!(channel = %desc.channel(), "duplicate discovered");
                    return;
                }
                Some(_) => QueryEvent::Changed(desc),
            }
        } else {
            let Some(services) = state.remote_services.get_mut(mgr) else {
                return;
            };
            let Some(service) = services.get_mut(desc.channel()) else {
                return;
            };
            let Some(previous) = service.reported.remove(filter_id) else {
                return;
            };
            if service.reported.is_empty() {
                services.remove(desc.channel());
            }
            if services.is_empty() {
                state.remote_services.remove(mgr);
            }
            QueryEvent::Removed(previous)
        };
        debug!(%filter_id, mgr_id = %mgr, channel = %event.description().channel(), "query result");
        out.push(Effect::Notify { events, event });
    }

    async fn peer_joined(&self, node: &Node, peer: &SubscriberId) {
        if *peer == self.id {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            let nodes = state.peers.entry(peer.clone()).or_default();
            if !nodes.iter().any(|n| same_node(n, node)) {
                nodes.push(node.clone());
            }

            let mut effects = Vec::new();
            let ttl = self.config.pending_ttl;
            for (at, msg) in state.pending.remove(peer).unwrap_or_default() {
                if at.elapsed() < ttl {
                    effects.push(Effect::Publish {
                        node: node.clone(),
                        msg,
                    });
                } else {
                    debug!(mgr_id = %peer, "dropping expired queued reply");
                }
            }
            for query in state.local_queries.values() {
                let mut msg = protocol::query(MessageKind::StartDiscovery, &query.filter, &self.id);
                msg.set_receiver(peer.clone());
                effects.push(Effect::Publish {
                    node: node.clone(),
                    msg,
                });
            }
            effects
        };
        info!(mgr_id = %peer, node = node.node_id(), "peer joined");
        self.apply(effects).await;
    }

    async fn peer_left(&self, node: &Node, peer: &SubscriberId) {
        if *peer == self.id {
            return;
        }
        let effects = {
            let mut state = self.state.lock();
            let mut effects = Vec::new();
            self.drop_peer(&mut state, node, peer, &mut effects);
            effects
        };
        self.apply(effects).await;
    }

    /// Forget `peer` as seen through `node`. Once no node reaches it, every
    /// service it reported is removed from our queries and its queries are
    /// dropped.
    fn drop_peer(
        &self,
        state: &mut RegistryState,
        node: &Node,
        peer: &SubscriberId,
        out: &mut Vec<Effect>,
    ) {
        if let Some(nodes) = state.peers.get_mut(peer) {
            nodes.retain(|n| !same_node(n, node));
            if !nodes.is_empty() {
                return;
            }
        }
        state.peers.remove(peer);
        state.pending.remove(peer);
        for query in state.remote_queries.values_mut() {
            query.requesters.remove(peer);
        }
        state.remote_queries.retain(|_, q| !q.requesters.is_empty());

        if let Some(services) = state.remote_services.remove(peer) {
            for service in services.into_values() {
                for (filter_id, desc) in service.reported {
                    if let Some(query) = state.local_queries.get(&filter_id) {
                        out.push(Effect::Notify {
                            events: query.events.clone(),
                            event: QueryEvent::Removed(desc),
                        });
                    }
                }
            }
        }
        info!(mgr_id = %peer, "peer left");
    }
}

/// Run `listener` on its own task, fed in order through the returned sender.
///
/// The task ends once the sender is dropped and the queue is drained.
fn spawn_listener(
    filter_id: &str,
    listener: impl QueryListener,
) -> mpsc::UnboundedSender<QueryEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let span = tracing::debug_span!("query_listener", %filter_id);
    tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                match event {
                    QueryEvent::Added(desc) => listener.added_service(desc).await,
                    QueryEvent::Removed(desc) => listener.removed_service(desc).await,
                    QueryEvent::Changed(desc) => listener.changed_service(desc).await,
                }
            }
        }
        .instrument(span),
    );
    tx
}

/// Subscription of a registry on the discovery channel of one node.
struct DiscoveryBinding {
    inner: Weak<RegistryInner>,
    node: Node,
}

#[async_trait]
impl Receiver for DiscoveryBinding {
    async fn receive(&self, message: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_message(message).await;
        }
    }
}

#[async_trait]
impl Greeter for DiscoveryBinding {
    async fn peer_joined(&self, _channel: &str, peer: &SubscriberId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.peer_joined(&self.node, peer).await;
        }
    }

    async fn peer_left(&self, _channel: &str, peer: &SubscriberId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.peer_left(&self.node, peer).await;
        }
    }
}

/// Builder for [`ServiceRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    nodes: Vec<Node>,
}

impl RegistryBuilder {
    /// Use `config` wholesale.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the discovery channel.
    pub fn discovery_channel(mut self, channel: impl Into<String>) -> Self {
        self.config.discovery_channel = channel.into();
        self
    }

    /// Set the default find timeout.
    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.config.find_timeout = timeout;
        self
    }

    /// Set how long replies to unknown peers stay queued.
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.config.pending_ttl = ttl;
        self
    }

    /// Attach to `node` on build.
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Create the registry and attach it to every configured node.
    pub async fn build(self) -> Result<ServiceRegistry> {
        let registry = ServiceRegistry::new(self.config);
        for node in self.nodes {
            registry.attach(node).await?;
        }
        Ok(registry)
    }
}
