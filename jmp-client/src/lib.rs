//! Client engine for the JNIOR Message Protocol (JMP).
//!
//! JMP is a length-prefixed, JSON-framed request/response protocol spoken to
//! a single device over a persistent TCP connection, optionally upgraded to
//! TLS via an out-of-band `[STARTTLS]` token. This crate owns the connection
//! lifecycle: framing, the login challenge/response cycle, and synchronous
//! event fan-out to registered listeners.
//!
//! ```ignore
//! use jmp_client::JmpConnection;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connection = JmpConnection::new();
//!     connection.set_credentials("jnior", "jnior");
//!     connection.add_message_listener(|message| {
//!         println!("received: {}", message.message());
//!     });
//!
//!     connection.connect_to("10.0.0.65", 9220).await.unwrap();
//!     connection.wait_for_authentication().await;
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod handshake;
pub mod tls;

pub use config::ClientConfig;
pub use connection::{ConnectionState, JmpConnection, DEFAULT_PORT};
pub use dispatch::{AuthEvent, ConnectionEvent, ListenerId};
pub use jmp_proto::{JmpMessage, ProtocolError};
