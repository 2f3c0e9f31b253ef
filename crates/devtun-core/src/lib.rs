//! devtun-core: shared protocol library for devtun.
//!
//! Provides the pipe-backed connection primitives, CBOR framing, a small
//! RPC framework, the tunnel protocol trait and its message types, the
//! error taxonomy, and the connection counter.

pub mod codec;
pub mod counter;
pub mod credentials;
pub mod error;
pub mod forward;
pub mod messages;
pub mod protocol;
pub mod result;
pub mod rpc;
pub mod stdio;
pub mod transport;

// Re-export commonly used items at crate root.
pub use counter::ConnectionCounter;
pub use error::{Code, ResultExt, Status, TunnelError, TunnelResult};
pub use forward::Forwarder;
pub use messages::{Chunk, Empty, LogLevel, LogMessage, Message, MountRequest, PortRequest};
pub use protocol::{ChunkStream, Tunnel, TunnelService};
pub use result::DevcontainerResult;
pub use stdio::{pipe, PipeReader, PipeWriter, StdioListener, StdioStream};
