//! Realtime channel: wire events, the server-side room hub and session, and
//! the reconnecting client gateway.

pub mod backoff;
pub mod client;
pub mod dedup;
pub mod events;
pub mod hub;
pub mod session;
pub mod transport;
pub mod typing;

pub use client::{ConnectionState, GatewayClient, GatewayError, GatewayEvent, GatewayHandle};
pub use events::{ClientEvent, ServerEvent};
pub use hub::RoomHub;
pub use session::Session;
pub use transport::{LocalTransport, Transport, TransportError, TransportLink, WebSocketTransport};
