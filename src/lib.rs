//! pipehub - local inter-process message broker.
//!
//! This crate provides a broker that listens on a Unix domain socket,
//! accepts any number of concurrent client connections, and relays opaque
//! length-prefixed payloads between a host application and its clients.
//!
//! # Architecture
//!
//! Clients bind by sending a bare identifier as their first frame; after
//! that, every frame is an opaque payload:
//!
//! - **Framer** - the `[u32 LE length][payload]` wire codec
//! - **Connection** - one read worker and one write worker per client
//! - **Registry** - identifier → connection lookup, last bind wins
//! - **Inbox** - single server-wide queue of received messages
//! - **Broker** - composes the above behind start/stop/send/receive
//!
//! Delivery is at-most-once and best-effort: a connection that dies with
//! messages queued drops them silently.
//!
//! # Modules
//!
//! - [`broker`] - the [`PipeBroker`] server and its [`Message`] type
//! - [`client`] - [`PipeClient`], a blocking client-side connector
//! - [`config`] - [`BrokerConfig`] knobs (socket path, buffers, timeouts)
//! - [`envelope`] - the JSON vocabulary the demo application layer speaks
//! - [`framing`] - the length-prefixed wire codec
//!
//! # Example
//!
//! ```no_run
//! use pipehub::{BrokerConfig, PipeBroker, PipeClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let broker = PipeBroker::new(BrokerConfig::at_path("/tmp/demo.sock"));
//! broker.start()?;
//!
//! let mut client = PipeClient::connect(broker.socket_path(), "CLI-001")?;
//! client.send(b"ping")?;
//!
//! let msg = broker.wait_and_pop_received().expect("message");
//! assert_eq!(msg.client_id, "CLI-001");
//! broker.send_to_client(&msg.client_id, b"pong");
//! assert_eq!(client.recv()?, b"pong");
//! # Ok(())
//! # }
//! ```

// Library modules
pub mod broker;
pub mod client;
pub mod config;
pub mod envelope;
pub mod framing;

// Re-export commonly used types
pub use broker::{Message, PipeBroker};
pub use client::PipeClient;
pub use config::{default_socket_path, BrokerConfig};
pub use envelope::Envelope;
