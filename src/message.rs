//! Message envelope exchanged over pub/sub channels.
//!
//! A [`Message`] is an opaque payload plus a flat string-to-string metadata
//! map. All protocol state (discovery, correlation ids, type tags) travels in
//! the metadata; the payload is only ever touched by codecs.

use std::collections::BTreeMap;
use std::fmt;

use prost::bytes::Bytes;

/// Well-known metadata keys.
pub mod keys {
    /// Discovery message kind.
    pub const TYPE: &str = "um.rpc.type";
    /// Correlation id of a request.
    pub const REQ_ID: &str = "um.rpc.reqId";
    /// Correlation id a response answers.
    pub const RESP_ID: &str = "um.rpc.respId";
    /// Subscriber id of the sending registry.
    pub const MGR_ID: &str = "um.rpc.mgrId";
    /// Continuous query a discovery event belongs to.
    pub const FILTER_ID: &str = "um.rpc.filterId";
    /// Remote method name.
    pub const METHOD: &str = "um.rpc.method";
    /// Expected reply type tag.
    pub const OUT_TYPE: &str = "um.rpc.outType";
    /// Failure code on a reply.
    pub const ERROR: &str = "um.rpc.error";
    /// Type tag of the payload.
    pub const PAYLOAD_TYPE: &str = "um.s11n.type";
    /// Prefix of flattened service description entries.
    pub const DESC_PREFIX: &str = "um.rpc.desc.";
    /// Prefix of flattened filter entries.
    pub const FILTER_PREFIX: &str = "um.rpc.filter.";
}

/// Identifier of one subscription on a channel.
///
/// Registries use the id of their discovery subscription as their manager id,
/// so it doubles as the unicast address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// View the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Metadata plus opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    meta: BTreeMap<String, String>,
    payload: Bytes,
    receiver: Option<SubscriberId>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message carrying `payload`.
    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Set a metadata entry, replacing any previous value.
    pub fn put_meta(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Whether a metadata entry is present.
    pub fn has_meta(&self, key: &str) -> bool {
        self.meta.contains_key(key)
    }

    /// All metadata entries, ordered by key.
    pub fn meta_map(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// Entries whose key starts with `prefix`, with the prefix stripped.
    pub fn meta_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.meta
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(move |(k, v)| (&k[prefix.len()..], v.as_str()))
    }

    /// Copy all metadata entries of `other` into this message.
    pub fn merge_meta(&mut self, other: &Message) -> &mut Self {
        for (k, v) in &other.meta {
            self.meta.insert(k.clone(), v.clone());
        }
        self
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> &mut Self {
        self.payload = payload.into();
        self
    }

    /// Address the message to a single subscriber instead of broadcasting.
    pub fn set_receiver(&mut self, receiver: SubscriberId) -> &mut Self {
        self.receiver = Some(receiver);
        self
    }

    /// The single subscriber this message is addressed to, if any.
    pub fn receiver(&self) -> Option<&SubscriberId> {
        self.receiver.as_ref()
    }
}
