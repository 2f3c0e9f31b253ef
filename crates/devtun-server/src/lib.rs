//! devtun-server: the serving side of the tunnel protocol.
//!
//! Three server variants implement [`devtun_core::Tunnel`]:
//!
//! * [`HostTunnelServer`] – bound to a workspace, brokers credentials under
//!   a [`CredentialPolicy`], forwards ports through an injected forwarder;
//! * [`RunnerTunnelServer`] – minimal, hands out nothing it is not allowed to;
//! * [`RelayTunnelServer`] – passes everything to an upstream peer while
//!   keeping a copy of the session result.
//!
//! The crate also holds the pieces that run next to a server: the
//! [`PortForwarder`], the socket-table [`Watcher`], and workspace archiving.

pub mod archive;
pub mod credentials;
pub mod forwarder;
pub mod git;
pub mod host;
pub mod netstat;
pub mod relay;
pub mod runner;
pub mod serve;
pub mod watcher;
pub mod workspace;

pub use credentials::{CredentialBroker, CredentialPolicy, GitOverride, LocalCredentialBroker};
pub use forwarder::{PortForwarder, PortRelay};
pub use git::GitSource;
pub use host::HostTunnelServer;
pub use netstat::{ProcNetEnumerator, SocketEntry, SocketEnumerator};
pub use relay::RelayTunnelServer;
pub use runner::RunnerTunnelServer;
pub use serve::{run_with_result, serve_pipes, serve_stdio, serve_tunnel, CapturesResult, ResultSlot};
pub use watcher::Watcher;
pub use workspace::{Mount, Workspace};
