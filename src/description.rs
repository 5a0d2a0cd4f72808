//! Advertised identity and properties of one service instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::message::{keys, Message};
use crate::transport::Node;
use crate::{Error, Result};

const NAME_KEY: &str = "name";
const CHANNEL_KEY: &str = "channel";

/// Transport nodes shared between a registry and the descriptions it hands out.
pub(crate) type NodeSet = Arc<RwLock<Vec<Node>>>;

/// Name, channel and property bag of a service instance.
///
/// Descriptions reconstructed by a [`ServiceRegistry`](crate::ServiceRegistry)
/// also remember the registry's transport nodes, so a
/// [`ServiceStub`](crate::ServiceStub) built from them binds to the same
/// network. That link takes no part in equality.
#[derive(Clone, Default)]
pub struct ServiceDescription {
    name: String,
    channel: String,
    properties: BTreeMap<String, String>,
    nodes: Option<NodeSet>,
}

impl ServiceDescription {
    /// Description of the service `name` reachable on `channel`.
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Property bag for a service about to be registered. The registry fills
    /// in name and channel.
    pub fn with_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel the instance listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Set a property, replacing any previous value.
    ///
    /// `name` and `channel` are reserved on the wire; setting them here has
    /// no effect on a remote peer's view.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Remove a property.
    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub(crate) fn bind(&mut self, name: &str, channel: &str) {
        self.name = name.to_string();
        self.channel = channel.to_string();
    }

    pub(crate) fn set_properties(&mut self, properties: BTreeMap<String, String>) {
        self.properties = properties;
    }

    pub(crate) fn with_nodes(mut self, nodes: NodeSet) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Snapshot of the nodes this description was received on.
    pub(crate) fn nodes(&self) -> Vec<Node> {
        self.nodes
            .as_ref()
            .map(|nodes| nodes.read().clone())
            .unwrap_or_default()
    }

    /// Encode into discovery metadata.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new();
        self.write_meta(&mut msg);
        msg
    }

    /// Write the description entries into `msg`.
    pub fn write_meta(&self, msg: &mut Message) {
        let prefix = keys::DESC_PREFIX;
        for (k, v) in &self.properties {
            if k == NAME_KEY || k == CHANNEL_KEY {
                continue;
            }
            msg.put_meta(format!("{prefix}{k}"), v.as_str());
        }
        msg.put_meta(format!("{prefix}{NAME_KEY}"), self.name.as_str());
        msg.put_meta(format!("{prefix}{CHANNEL_KEY}"), self.channel.as_str());
    }

    /// Decode from discovery metadata.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut desc = Self::default();
        let mut has_name = false;
        let mut has_channel = false;
        for (key, value) in msg.meta_with_prefix(keys::DESC_PREFIX) {
            match key {
                NAME_KEY => {
                    desc.name = value.to_string();
                    has_name = true;
                }
                CHANNEL_KEY => {
                    desc.channel = value.to_string();
                    has_channel = true;
                }
                _ => {
                    desc.properties.insert(key.to_string(), value.to_string());
                }
            }
        }
        if !has_name || !has_channel {
            return Err(Error::malformed("service description without name or channel"));
        }
        Ok(desc)
    }
}

impl PartialEq for ServiceDescription {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.channel == other.channel
            && self.properties == other.properties
    }
}

impl Eq for ServiceDescription {}

impl fmt::Debug for ServiceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescription")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("properties", &self.properties)
            .finish()
    }
}
