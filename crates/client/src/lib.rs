//! agentbridge client
//!
//! A resumable connection to an agentbridge server: transport with
//! reconnect, handshake, control re-acquisition, resynchronization after
//! every reconnect, and request/response correlation. Streamed assistant
//! output is reassembled into bounded per-message buffers.

pub mod backpressure;
pub mod config;
pub mod connection;
pub mod content_buffer;
pub mod events;
pub mod pending;
pub mod streaming;
pub mod transport;

pub use connection::{ClientConnection, ConnectOptions, ConnectionError, HelloInfo};
pub use events::{ClientEvent, EventQueue, ResyncSnapshot};
pub use pending::RequestError;
pub use streaming::StreamReassembler;
pub use transport::{Transport, TransportError, TransportPhase, TransportState, WsTransport};
