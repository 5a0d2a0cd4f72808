//! Service discovery and correlated request/reply calls over publish/subscribe
//! channels.
//!
//! Processes advertise services through a [`ServiceRegistry`], find them with
//! one-shot lookups or continuous queries evaluated by [`ServiceFilter`], and
//! call them through a [`ServiceStub`]. Everything runs over a [`Transport`];
//! [`LocalBus`] connects registries inside one process.

#![deny(missing_docs)]

pub mod codec;
pub mod config;
pub mod description;
pub mod error;
pub mod filter;
pub mod message;
pub mod registry;
pub mod service;
pub mod stub;
pub mod transport;

// Re-export key types
pub use codec::{TypeRegistry, Typed, TypedPayload};
pub use config::{RegistryConfig, StubConfig};
pub use description::ServiceDescription;
pub use error::{Error, Result};
pub use filter::{Operator, Rule, ServiceFilter};
pub use message::{Message, SubscriberId};
pub use registry::{QueryEvent, QueryListener, QueryStream, RegistryBuilder, ServiceRegistry};
pub use service::{FailureCode, MethodRouter, Request, Service, ServiceError, ServiceHandle};
pub use stub::ServiceStub;
pub use transport::{Greeter, LocalBus, LocalNode, Node, Receiver, Transport};
