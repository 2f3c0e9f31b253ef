//! devtun-cli: the orchestrating side.
//!
//! Drives a remote dev container through untrusted hops using only stdio
//! byte streams:
//!
//! * [`tunnel::run_nested`] – one hop: outer transport plus handshake plus handler;
//! * [`container::ContainerTunnel`] – host and container hops chained;
//! * [`execute::execute_command`] – host-only command execution with a
//!   tunnel server on the command's stdio;
//! * [`services::run_services`] – credentials and port forwarding for a
//!   connected container.

pub mod config;
pub mod container;
pub mod execute;
pub mod inject;
pub mod log_writer;
pub mod remote;
pub mod services;
pub mod ssh;
pub mod tunnel;

pub use config::Config;
pub use container::{AgentInfo, ContainerTunnel, WorkspaceClient};
pub use execute::{execute_command, Execution, ServerMode};
pub use inject::{Injector, ProcessInjector};
pub use log_writer::LogWriter;
pub use services::{run_services, ServicesOptions, SshPortRelay};
pub use ssh::{RunOptions, RusshConnector, SshClient, SshConnector};
pub use tunnel::{run_nested, Labels};
