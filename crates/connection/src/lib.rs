//! Connection lifecycle for cloudlink device accounts.
//!
//! One [`ConnectionRuntime`] per account owns a WebSocket, its timers and an
//! offline queue; the [`RuntimeRegistry`] supervises them by account id.

pub mod backoff;
pub mod classifier;
pub mod dispatch;
pub mod error;
pub mod probe;
mod pumps;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod socket;
#[cfg(test)]
mod testing;
pub mod types;

pub use backoff::BackoffPolicy;
pub use classifier::{DisconnectMeta, DisconnectReason, Verdict, classify};
pub use dispatch::{DeliveryKind, InboundContext, ReplyDispatcher, ReplySink};
pub use error::{ConnectionError, DispatchError, RegistryError};
pub use queue::OutboundQueue;
pub use registry::{RegistryOptions, RuntimeRegistry};
pub use runtime::ConnectionRuntime;
pub use socket::{Connector, WsConnector};
pub use types::{AccountStatus, ConnectionState, RuntimeEvent, RuntimeSnapshot};
