//! UDP worker: holds key material, answers one request datagram with one
//! reply datagram.
//!
//! The worker is deliberately silent about failure — an undecodable request,
//! an unknown fingerprint, or a failed operation produces no reply at all,
//! and the client's adaptive timeout is the failure signal. Sending an error
//! frame would only give a spoofing peer something to forge.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use crate::codec::{self, Fingerprint, Op, Padding, MAX_DATAGRAM};

/// Opaque handle an accelerator hands back for a registered key.
pub type KeyHandle = u64;

/// Capability set of an RSA accelerator backend.
///
/// Real modular-exponentiation engines (big-integer libraries, hardware
/// offload) live behind this seam and are selected once at startup; the
/// dispatch core only ever calls `perform`.
pub trait Accel: Send + Sync {
    /// Register key material, returning a handle for later operations.
    fn add_key(&self, material: &[u8]) -> Result<KeyHandle>;

    /// Release a previously registered key.
    fn destroy_key(&self, handle: KeyHandle);

    /// Upper bound on the result size for `op` under `handle`'s key.
    fn result_max_len(&self, handle: KeyHandle, op: Op) -> usize;

    /// Run the operation; `None` signals failure (the request is dropped).
    fn perform(&self, handle: KeyHandle, op: Op, pad: Padding, data: &[u8]) -> Option<Vec<u8>>;
}

/// Loopback accelerator: answers with the reversed payload.
///
/// Stands in for a real engine in the benchmark harness and integration
/// tests, where what matters is that a reply is attributable to its request.
pub struct MirrorAccel;

impl Accel for MirrorAccel {
    fn add_key(&self, _material: &[u8]) -> Result<KeyHandle> {
        Ok(0)
    }

    fn destroy_key(&self, _handle: KeyHandle) {}

    fn result_max_len(&self, _handle: KeyHandle, _op: Op) -> usize {
        MAX_DATAGRAM
    }

    fn perform(&self, _handle: KeyHandle, _op: Op, _pad: Padding, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = data.to_vec();
        out.reverse();
        Some(out)
    }
}

/// Fingerprint → key-handle registry. Keys are registered at startup and
/// never removed while the worker runs.
#[derive(Default)]
pub struct KeyStore {
    keys: HashMap<Fingerprint, KeyHandle>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fingerprint: Fingerprint, handle: KeyHandle) {
        self.keys.insert(fingerprint, handle);
    }

    pub fn find(&self, fingerprint: &Fingerprint) -> Option<KeyHandle> {
        self.keys.get(fingerprint).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: Ipv4Addr,
    /// 0 picks an ephemeral port (useful for in-process harnesses).
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 10_000,
        }
    }
}

/// The serve loop: one request datagram in, at most one reply datagram out.
pub struct Worker<A: Accel> {
    socket: UdpSocket,
    store: KeyStore,
    accel: A,
}

impl<A: Accel> Worker<A> {
    /// Bind the receive socket. Reuse-address is set so a restarted worker
    /// can reclaim its port immediately; the receive buffer is enlarged to
    /// ride out bursts from many front-ends.
    pub fn bind(config: &WorkerConfig, store: KeyStore, accel: A) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("could not create UDP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(4 * 1024 * 1024).ok();

        let bind_addr = SocketAddrV4::new(config.host, config.port);
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("could not bind UDP socket to {}", bind_addr))?;

        Ok(Self {
            socket: socket.into(),
            store,
            accel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop. Returns only on a socket error.
    pub fn run(&self) -> Result<()> {
        tracing::info!(addr = %self.socket.local_addr()?, keys = self.store.len(), "worker started");

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("recv_from failed"),
            };

            if let Some(reply) = self.process(&buf[..len], src) {
                if let Err(e) = self.socket.send_to(&reply, src) {
                    tracing::warn!(%src, error = %e, "could not send reply");
                }
            }
        }
    }

    /// Decode, look up, perform. `None` means drop: the client will time out
    /// and down-weight us, which is the entire error channel.
    fn process(&self, datagram: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        let frame = match codec::decode_request(datagram) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%src, error = %e, "dropping undecodable request");
                return None;
            }
        };

        let handle = match self.store.find(&frame.fingerprint) {
            Some(h) => h,
            None => {
                tracing::warn!(%src, fingerprint = %frame.fingerprint, "key not found");
                return None;
            }
        };

        tracing::debug!(%src, op = ?frame.op, len = frame.data.len(), "performing request");

        let result = self
            .accel
            .perform(handle, frame.op, frame.pad, frame.data)?;
        // The accelerator's own bound for this key and op, capped at what a
        // single datagram can carry.
        let max_len = self.accel.result_max_len(handle, frame.op).min(MAX_DATAGRAM);
        if result.is_empty() || result.len() > max_len {
            tracing::warn!(len = result.len(), max_len, "accelerator produced an unsendable result");
            return None;
        }
        Some(result)
    }
}
