//! devtun-client: the calling side of the tunnel protocol.
//!
//! # Example
//!
//! ```no_run
//! use devtun_client::TunnelClient;
//! use devtun_core::Tunnel;
//!
//! # async fn example() -> devtun_core::TunnelResult<()> {
//! // Inside an agent whose stdio is wired to the tunnel server.
//! let client = TunnelClient::from_stdio();
//! client.ping().await?;
//! let user = client.git_user_typed().await?;
//! println!("{} <{}>", user.name, user.email);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod forwarder;
pub mod log_layer;
pub mod reader;

pub use client::TunnelClient;
pub use forwarder::RemoteForwarder;
pub use log_layer::TunnelLogLayer;
pub use reader::{chunk_reader, ChunkReader};
