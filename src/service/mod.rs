//! Server side of the call layer.
//!
//! A [`Service`] implementation receives decoded requests by method name and
//! returns a typed reply. [`MethodRouter`] builds one from async closures.
//! Hosting (subscribing on the service channel, decoding, publishing the
//! correlated reply) is done by [`ServiceHandle`], which the registry creates
//! on [`add_service`](crate::ServiceRegistry::add_service).

mod host;
mod router;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

use crate::codec::{TypeRegistry, Typed, TypedPayload};
use crate::{Error, Result};

pub use host::ServiceHandle;
pub use router::MethodRouter;

/// Channel a service listens for requests on.
pub(crate) fn request_channel(channel: &str) -> String {
    format!("{channel}.listen")
}

/// Channel a service publishes its replies on.
pub(crate) fn reply_channel(channel: &str) -> String {
    format!("{channel}.serve")
}

/// Category of a failed call, carried under `um.rpc.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// The service has no such method.
    UnknownMethod,
    /// The request could not be decoded or had the wrong type.
    BadRequest,
    /// The method failed.
    Internal,
}

impl FailureCode {
    /// Wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownMethod => "unknown_method",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a method, sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Category.
    pub code: FailureCode,
    /// Description for the caller.
    pub message: String,
}

impl ServiceError {
    /// Failure with an explicit code.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The method does not exist.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(FailureCode::UnknownMethod, format!("no method '{method}'"))
    }

    /// The request was unusable.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(FailureCode::BadRequest, message)
    }

    /// The method failed.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Internal, message)
    }
}

/// An incoming call.
///
/// Carries the raw payload and, when the host had a decoder for its tag, the
/// decoded value.
pub struct Request {
    method: String,
    payload: TypedPayload,
    value: Option<Box<dyn Any + Send>>,
    reply_type: Option<String>,
}

impl Request {
    pub(crate) fn new(
        method: String,
        payload: TypedPayload,
        value: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            method,
            payload,
            value,
            reply_type: None,
        }
    }

    pub(crate) fn with_reply_type(mut self, reply_type: Option<String>) -> Self {
        self.reply_type = reply_type;
        self
    }

    /// Method name the caller invoked.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw payload and type tag.
    pub fn payload(&self) -> &TypedPayload {
        &self.payload
    }

    /// Type tag the caller expects the reply to carry, if it said.
    pub fn reply_type(&self) -> Option<&str> {
        self.reply_type.as_deref()
    }

    /// Take the request as `T`, reusing the host's decoded value if it has one.
    pub fn into_inner<T: Typed>(self) -> Result<T> {
        if let Some(value) = self.value {
            if let Ok(value) = value.downcast::<T>() {
                return Ok(*value);
            }
        }
        self.payload.decode::<T>()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("type_tag", &self.payload.type_tag)
            .field("decoded", &self.value.is_some())
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        match err {
            Error::Decode(_)
            | Error::Malformed(_)
            | Error::TypeMismatch { .. }
            | Error::UnknownType(_) => {
                Self::bad_request(err.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

/// A hosted service.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Service name advertised in descriptions.
    fn name(&self) -> &str;

    /// Register decoders for the request types this service accepts.
    fn register_types(&self, _types: &mut TypeRegistry) {}

    /// Handle one call.
    async fn call_method(&self, request: Request) -> std::result::Result<TypedPayload, ServiceError>;
}
