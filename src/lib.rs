//! Socketace: TCP streams tunnelled through DNS
//!
//! The engine turns a half-duplex DNS query/response channel into an ordered,
//! bidirectional byte stream. Requests ride in query names, responses in
//! answer records, and everything about the path between client and server
//! (which record types survive, which characters a resolver preserves, how
//! large an answer may be) is discovered during the handshake.
//!
//! ## Layers
//!
//! - **encoding**: byte/text codecs (Base32 through Base128, plus Raw)
//! - **records**: packs a payload into ordered answer records of one type
//! - **command**: typed requests and responses with their wire form
//! - **queue**: sequenced packets, acknowledgement windows and reassembly
//! - **handshake**: autodetection of query type, encoders and fragment size
//! - **client** / **server**: the two session ends as byte streams
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use socketace::{ClientOptions, DnsClient, DnsTransport, TunnelStream, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport: Arc<dyn DnsTransport> =
//!         Arc::new(UdpTransport::connect("8.8.8.8:53".parse()?).await?);
//!     let client = DnsClient::new(ClientOptions {
//!         domain: "t.example.org".into(),
//!         ..Default::default()
//!     });
//!
//!     let conn = client.connect(transport).await?;
//!     conn.write(b"hello").await?;
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ write ┌──────────┐  Packet queries  ┌──────────┐ read ┌──────────┐
//! │   App    │──────▶│ OutQueue │─────────────────▶│ InQueue  │─────▶│ Upstream │
//! │          │◀──────│ InQueue  │◀─────────────────│ OutQueue │◀─────│ service  │
//! └──────────┘ read  └──────────┘  answer records  └──────────┘ write└──────────┘
//!                      DnsConn       (resolvers)     ServerConn
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod dns;
pub mod encoding;
pub mod error;
pub mod handshake;
pub mod queue;
pub mod records;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use client::{ClientOptions, DnsClient, DnsConn};
pub use command::{Command, Request, Response, SessionOptions};
pub use config::TunnelConfig;
pub use encoding::Encoder;
pub use error::{DecodeError, Result, TunnelError, WireError};
pub use handshake::Overrides;
pub use queue::{InQueue, OutQueue, Packet};
pub use records::QueryType;
pub use server::{DnsServer, ServerConn, ServerOptions};
pub use session::{Channel, Serializer};
pub use stream::{relay, PacketStream, TunnelStream};
pub use transport::{DnsTransport, UdpTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
