//! # kmux-protocol: shared contract of the kmux workspace
//!
//! Typed ids, kernel wire messages, kernelspecs, transport commands and
//! events, the error taxonomy, and the boundary ports implemented by
//! transports, lifecycle APIs and auth stores.
//!
//! ## Module Overview
//!
//! - [`ids`]: KernelId, MsgId, ClientId, CommId
//! - [`message`]: Channel, KernelMessage and its headers
//! - [`kernelspec`]: KernelSpec compatibility, KernelRecord
//! - [`transport`]: Endpoint, Directive, TransportCommand, TransportEvent
//! - [`ports`]: Transport, TransportLauncher, LifecycleApi, AuthProvider
//! - [`error`]: ClientError, ClientResult

pub mod error;
pub mod ids;
pub mod kernelspec;
pub mod message;
pub mod ports;
pub mod transport;

pub use error::{ClientError, ClientResult};
pub use ids::{ClientId, CommId, KernelId, MsgId};
pub use kernelspec::{KernelRecord, KernelSpec};
pub use message::{Channel, Header, KernelMessage, ParentHeader};
pub use ports::{
    AuthProvider, LaunchedTransport, LifecycleApi, NoAuth, StaticHeaders, Transport,
    TransportLauncher,
};
pub use transport::{
    CommEvent, Directive, Endpoint, TransportCommand, TransportConfig, TransportEvent,
    TransportEventKind,
};
