//! Kernel socket table access.

use async_trait::async_trait;
use devtun_core::{TunnelError, TunnelResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `st` value of a listening socket in `/proc/net/tcp*`.
pub const TCP_LISTEN: u8 = 0x0a;

/// One row of the socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_addr: Option<IpAddr>,
    pub port: u16,
    pub state: u8,
}

impl SocketEntry {
    pub fn is_listening(&self) -> bool {
        self.state == TCP_LISTEN
    }
}

/// Lists TCP sockets (v4 and v6).
#[async_trait]
pub trait SocketEnumerator: Send + Sync {
    async fn tcp_sockets(&self) -> TunnelResult<Vec<SocketEntry>>;
}

/// Reads `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Clone, Default)]
pub struct ProcNetEnumerator;

#[async_trait]
impl SocketEnumerator for ProcNetEnumerator {
    async fn tcp_sockets(&self) -> TunnelResult<Vec<SocketEntry>> {
        let mut entries = Vec::new();
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => entries.extend(parse_table(&text)?),
                // tcp6 is absent on kernels without IPv6
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

/// Parse the contents of a `/proc/net/tcp`-style table.
pub fn parse_table(text: &str) -> TunnelResult<Vec<SocketEntry>> {
    text.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> TunnelResult<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(bad(line));
    }
    let (addr, port) = fields[1].split_once(':').ok_or_else(|| bad(line))?;
    let port = u16::from_str_radix(port, 16).map_err(|_| bad(line))?;
    let state = u8::from_str_radix(fields[3], 16).map_err(|_| bad(line))?;
    Ok(SocketEntry {
        local_addr: parse_addr(addr),
        port,
        state,
    })
}

fn bad(line: &str) -> TunnelError {
    TunnelError::Protocol(format!("malformed socket table line: {}", line.trim()))
}

/// Addresses are hex words in host (little-endian) byte order.
fn parse_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_le_bytes())))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
