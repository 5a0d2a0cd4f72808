//! Typed payloads.
//!
//! Payloads are protobuf messages tagged with their fully qualified name
//! (`<package>.<name>` from [`prost::Name`]) under `um.s11n.type`. A
//! [`TypeRegistry`] maps tags back to decoders for hosts that must decode a
//! request before they know which method it is for.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use prost::bytes::Bytes;
use prost::Name;

use crate::message::{keys, Message};
use crate::{Error, Result};

/// A protobuf message with a stable type tag.
pub trait Typed: prost::Message + Default + Send + 'static {
    /// Tag carried in `um.s11n.type`.
    fn type_tag() -> String;
}

impl<T> Typed for T
where
    T: prost::Message + Name + Default + Send + 'static,
{
    fn type_tag() -> String {
        format!("{}.{}", T::PACKAGE, T::NAME)
    }
}

/// Encoded payload plus its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPayload {
    /// Type tag of `bytes`.
    pub type_tag: String,
    /// Encoded message.
    pub bytes: Bytes,
}

impl TypedPayload {
    /// Encode `value`.
    pub fn encode<T: Typed>(value: &T) -> Self {
        Self {
            type_tag: T::type_tag(),
            bytes: Bytes::from(value.encode_to_vec()),
        }
    }

    /// Decode as `T`, checking the tag first.
    pub fn decode<T: Typed>(&self) -> Result<T> {
        let expected = T::type_tag();
        if self.type_tag != expected {
            return Err(Error::TypeMismatch {
                expected,
                actual: self.type_tag.clone(),
            });
        }
        Ok(T::decode(self.bytes.clone())?)
    }

    /// Read the payload and tag of `msg`.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let type_tag = msg
            .meta(keys::PAYLOAD_TYPE)
            .ok_or_else(|| Error::malformed("payload without type tag"))?;
        Ok(Self {
            type_tag: type_tag.to_string(),
            bytes: msg.payload().clone(),
        })
    }

    /// Store payload and tag into `msg`.
    pub fn write_into(self, msg: &mut Message) {
        msg.put_meta(keys::PAYLOAD_TYPE, self.type_tag);
        msg.set_payload(self.bytes);
    }
}

/// Decoder producing a type-erased value from payload bytes.
pub type DecodeFn = Arc<dyn Fn(Bytes) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// Type tag to decoder map.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl TypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for `T` under its tag.
    pub fn register<T: Typed>(&mut self) -> &mut Self {
        self.register_decoder(T::type_tag(), |bytes| {
            let value = T::decode(bytes)?;
            Ok(Box::new(value) as Box<dyn Any + Send>)
        })
    }

    /// Register an arbitrary decoder for `tag`, replacing any earlier one.
    pub fn register_decoder<F>(&mut self, tag: impl Into<String>, decode: F) -> &mut Self
    where
        F: Fn(Bytes) -> Result<Box<dyn Any + Send>> + Send + Sync + 'static,
    {
        self.decoders.insert(tag.into(), Arc::new(decode));
        self
    }

    /// Whether a decoder exists for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode `payload` with the decoder registered for its tag.
    pub fn decode(&self, payload: &TypedPayload) -> Result<Box<dyn Any + Send>> {
        let decoder = self
            .decoders
            .get(&payload.type_tag)
            .ok_or_else(|| Error::UnknownType(payload.type_tag.clone()))?;
        decoder(payload.bytes.clone())
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("tags", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        text: String,
    }

    impl Name for Ping {
        const NAME: &'static str = "Ping";
        const PACKAGE: &'static str = "test";
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Pong {
        #[prost(uint32, tag = "1")]
        seq: u32,
    }

    impl Name for Pong {
        const NAME: &'static str = "Pong";
        const PACKAGE: &'static str = "test";
    }

    #[test]
    fn tag_is_package_qualified() {
        assert_eq!(Ping::type_tag(), "test.Ping");
    }

    #[test]
    fn decode_checks_tag() {
        let payload = TypedPayload::encode(&Ping { text: "hi".into() });
        assert!(matches!(
            payload.decode::<Pong>(),
            Err(Error::TypeMismatch { .. })
        ));
        assert_eq!(payload.decode::<Ping>().unwrap().text, "hi");
    }

    #[test]
    fn registry_decodes_registered_types_only() {
        let mut types = TypeRegistry::new();
        types.register::<Ping>();

        let ping = TypedPayload::encode(&Ping { text: "x".into() });
        let any = types.decode(&ping).unwrap();
        assert_eq!(any.downcast::<Ping>().unwrap().text, "x");

        let pong = TypedPayload::encode(&Pong { seq: 1 });
        assert!(matches!(types.decode(&pong), Err(Error::UnknownType(tag)) if tag == "test.Pong"));
    }

    #[test]
    fn message_carries_tag() {
        let mut msg = Message::new();
        TypedPayload::encode(&Pong { seq: 3 }).write_into(&mut msg);
        assert_eq!(msg.meta(keys::PAYLOAD_TYPE), Some("test.Pong"));
        let back = TypedPayload::from_message(&msg).unwrap();
        assert_eq!(back.decode::<Pong>().unwrap().seq, 3);
    }
}
