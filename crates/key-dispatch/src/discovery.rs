//! One-shot discovery of the initial backend list.
//!
//! The client opens a TCP connection to the discovery endpoint, writes the
//! literal `GET`, half-closes, and reads the reply to EOF: a comma-separated
//! `host:port` list (trailing comma tolerated). Entries that fail to parse or
//! resolve are logged and skipped rather than failing the whole reply — a
//! half-broken list still seeds a working pool.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::idgen::IdGen;
use crate::server_table::{Backend, ServerTable};

/// Seed weight for a freshly discovered backend; a ballpark that is
/// overwritten by the first successful RTT measurement.
pub const INITIAL_WEIGHT: u64 = 1_000;

pub struct DiscoveryClient {
    endpoint: String,
    timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Fetch the raw `host:port` list from the discovery endpoint.
    pub fn fetch(&self) -> Result<Vec<String>> {
        let mut stream = TcpStream::connect(&self.endpoint)
            .with_context(|| format!("could not connect to discovery at {}", self.endpoint))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(b"GET").context("discovery send failed")?;
        stream.shutdown(Shutdown::Write)?;

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .context("discovery reply read failed")?;

        tracing::debug!(endpoint = %self.endpoint, %reply, "discovery reply");
        Ok(split_list(&reply))
    }

    /// Fetch, resolve, and return ready-to-use backends with fresh ids.
    pub fn backends(&self, ids: &IdGen) -> Result<Vec<Backend>> {
        Ok(resolve_backends(&self.fetch()?, ids))
    }
}

/// Split a comma-separated list, dropping empty entries (so a trailing comma
/// is harmless).
pub fn split_list(reply: &str) -> Vec<String> {
    reply
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Resolve each `host:port` entry to a single IPv4 address through the
/// system resolver; entries that fail are logged and skipped.
pub fn resolve_backends(entries: &[String], ids: &IdGen) -> Vec<Backend> {
    let mut backends = Vec::with_capacity(entries.len());

    for entry in entries {
        match resolve_one(entry) {
            Some(addr) => {
                let backend = Backend {
                    id: ids.next(),
                    addr,
                };
                tracing::debug!(%entry, %backend, "resolved backend");
                backends.push(backend);
            }
            None => {
                tracing::warn!(%entry, "skipping backend entry that did not resolve");
            }
        }
    }

    backends
}

fn resolve_one(entry: &str) -> Option<SocketAddrV4> {
    // Reject entries without an explicit port before handing them to the
    // resolver; `to_socket_addrs` needs the `host:port` shape anyway.
    entry.rfind(':')?;

    entry
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
}

/// Seed a table from resolved backends at the initial placeholder weight.
pub fn seed_table(table: &mut ServerTable, backends: &[Backend]) {
    for backend in backends {
        table.push(*backend, INITIAL_WEIGHT);
    }
}
