//! The send-wait-retry state machine over UDP.
//!
//! One call = one synchronous request from a caller thread. Each attempt
//! samples a backend, sends one datagram, and waits up to that backend's
//! adaptive RTO for one reply. Every failure — send error, timeout, short or
//! wrong-source reply — rebinds the local socket: replies are
//! unauthenticated, so a fresh ephemeral port is what guarantees the kernel
//! drops any straggler addressed to an earlier attempt. A wrong-source
//! datagram only sheds the socket; the attempt keeps waiting out its RTO on
//! the same backend. Timeouts resample.
//!
//! There is no retry cap. Timeouts decay the failing backend's weight by 4×
//! each, so a pool that stops answering drives `ServerTable::choose` to
//! `None` within a handful of attempts; callers on latency-sensitive paths
//! can additionally set a wall-clock budget per call.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::clock;
use crate::codec::{self, CodecError, Fingerprint, Op, Padding, MAX_DATAGRAM};
use crate::server_table::ServerTable;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every backend's weight has decayed to zero (or none were configured).
    #[error("no backends available")]
    NoServers,
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The optional per-call wall-clock budget ran out before any backend
    /// produced a reply.
    #[error("call budget of {0:?} exhausted")]
    BudgetExhausted(Duration),
    /// Local socket creation failed; nothing to retry against.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Dispatcher {
    table: Arc<Mutex<ServerTable>>,
    call_budget: Option<Duration>,
}

impl Dispatcher {
    pub fn new(table: ServerTable) -> Self {
        Self::from_shared(Arc::new(Mutex::new(table)))
    }

    pub fn from_shared(table: Arc<Mutex<ServerTable>>) -> Self {
        Self {
            table,
            call_budget: None,
        }
    }

    /// Cap the total time one `rsa_op` call may spend across retries.
    pub fn with_call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = Some(budget);
        self
    }

    /// Shared view of the backend table (for seeding and reporting).
    pub fn table(&self) -> Arc<Mutex<ServerTable>> {
        self.table.clone()
    }

    /// Perform one RSA operation against the backend pool and return the raw
    /// reply bytes.
    pub fn rsa_op(
        &self,
        fingerprint: &Fingerprint,
        op: Op,
        pad: Padding,
        input: &[u8],
    ) -> Result<Vec<u8>, DispatchError> {
        let frame = codec::encode_request(fingerprint, op, pad, input)?;
        let deadline = self.call_budget.map(|b| (Instant::now() + b, b));

        let mut socket = bind_ephemeral()?;
        let mut buf = [0u8; MAX_DATAGRAM];

        'attempt: loop {
            if let Some((d, budget)) = deadline {
                if Instant::now() >= d {
                    return Err(DispatchError::BudgetExhausted(budget));
                }
            }

            let (backend, rto) = {
                let mut table = self.table.lock().unwrap();
                let backend = table.choose().ok_or(DispatchError::NoServers)?;
                let rto = table.timeout_for(&backend);
                (backend, rto)
            };

            let sent_at = clock::now_us();
            match socket.send_to(&frame, backend.addr) {
                Ok(n) if n == frame.len() => {}
                Ok(n) => {
                    tracing::warn!(%backend, sent = n, expected = frame.len(), "short send");
                    socket = bind_ephemeral()?;
                    continue 'attempt;
                }
                Err(e) => {
                    tracing::warn!(%backend, error = %e, "could not send request");
                    socket = bind_ephemeral()?;
                    continue 'attempt;
                }
            }

            let attempt_deadline = sent_at + rto.as_micros() as u64;

            loop {
                let now = clock::now_us();
                if now >= attempt_deadline {
                    tracing::warn!(%backend, rto_us = rto.as_micros() as u64, "timeout");
                    self.table.lock().unwrap().report_timeout(&backend);
                    socket = bind_ephemeral()?;
                    continue 'attempt;
                }

                socket.set_read_timeout(Some(Duration::from_micros(attempt_deadline - now)))?;

                match socket.recv_from(&mut buf) {
                    Ok((len, src)) => {
                        if src != SocketAddr::V4(backend.addr) {
                            tracing::warn!(%src, expected = %backend, "reply from unexpected source");
                            // Shed the stale peer but stay on this attempt:
                            // same backend, same deadline, no estimator
                            // update. The rebind also orphans the genuine
                            // reply, so the attempt ends in an ordinary
                            // timeout if nothing else arrives.
                            socket = bind_ephemeral()?;
                            continue;
                        }

                        if len == 0 {
                            tracing::warn!(%backend, "empty reply");
                            self.table.lock().unwrap().report_timeout(&backend);
                            socket = bind_ephemeral()?;
                            continue 'attempt;
                        }

                        let elapsed = clock::now_us().saturating_sub(sent_at);
                        self.table.lock().unwrap().report_rtt(&backend, elapsed);
                        tracing::debug!(%backend, elapsed_us = elapsed, len, "reply received");
                        return Ok(buf[..len].to_vec());
                    }
                    // Interrupted by a signal: retry against the same deadline.
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    // read_timeout expiry surfaces as WouldBlock on unix,
                    // TimedOut elsewhere; the deadline check above scores it.
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => {
                        tracing::warn!(%backend, error = %e, "socket error while waiting");
                        socket = bind_ephemeral()?;
                        continue 'attempt;
                    }
                }
            }
        }
    }
}

/// Fresh socket on a fresh ephemeral port. Called on entry and after every
/// failure so that late replies to earlier attempts die in the kernel.
fn bind_ephemeral() -> Result<UdpSocket, std::io::Error> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_table::Backend;
    use crate::worker::{KeyStore, MirrorAccel, Worker, WorkerConfig};
    use std::net::SocketAddrV4;

    const FP: Fingerprint = Fingerprint([7u8; 16]);

    fn spawn_mirror_worker() -> SocketAddrV4 {
        let mut store = KeyStore::new();
        store.add(FP, 0);
        let config = WorkerConfig {
            host: Ipv4Addr::LOCALHOST,
            port: 0,
        };
        let worker = Worker::bind(&config, store, MirrorAccel).unwrap();
        let addr = match worker.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };
        std::thread::Builder::new()
            .name("mirror-worker".into())
            .spawn(move || {
                let _ = worker.run();
            })
            .unwrap();
        addr
    }

    fn table_with(addr: SocketAddrV4) -> ServerTable {
        let mut table = ServerTable::with_seed(7);
        table.push(Backend { id: 1, addr }, 1_000);
        table
    }

    #[test]
    fn test_empty_table_is_no_servers() {
        let dispatcher = Dispatcher::new(ServerTable::new());
        let err = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"hi")
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoServers));
    }

    #[test]
    fn test_oversize_request_rejected_before_send() {
        let dispatcher = Dispatcher::new(ServerTable::new());
        let payload = vec![0u8; MAX_DATAGRAM];
        let err = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, &payload)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Codec(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_loopback_round_trip() {
        let addr = spawn_mirror_worker();
        let dispatcher = Dispatcher::new(table_with(addr));

        let reply = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"hello")
            .unwrap();
        assert_eq!(reply, b"olleh");

        // The round trip fed the estimator and republished the weight.
        let table = dispatcher.table();
        let table = table.lock().unwrap();
        let backend = Backend { id: 1, addr };
        let est = table.estimator(&backend).expect("estimator created");
        assert!(est.srtt_us() > 0);
        assert_eq!(table.total_weight(), est.reqs_per_sec());
    }

    #[test]
    fn test_mute_backend_decays_to_no_servers() {
        // A bound socket that is never read: every attempt times out.
        let mute = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match mute.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let dispatcher = Dispatcher::new(table_with(addr));
        let start = Instant::now();
        let err = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"hi")
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoServers));

        // Nine 200 ms RTOs decay 100_000/4^9 to zero.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_700), "elapsed {:?}", elapsed);

        let table = dispatcher.table();
        assert_eq!(table.lock().unwrap().total_weight(), 0);
    }

    #[test]
    fn test_call_budget_caps_retries() {
        let mute = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match mute.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        let dispatcher =
            Dispatcher::new(table_with(addr)).with_call_budget(Duration::from_millis(300));
        let err = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"hi")
            .unwrap_err();
        assert!(matches!(err, DispatchError::BudgetExhausted(_)));
    }

    #[test]
    fn test_wrong_source_reply_is_never_returned() {
        // A rogue worker that reads requests on one socket but replies from
        // another port: every reply fails the source check.
        let listen = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listen.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };
        std::thread::Builder::new()
            .name("rogue-worker".into())
            .spawn(move || {
                let reply_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                let mut buf = [0u8; MAX_DATAGRAM];
                while let Ok((_, src)) = listen.recv_from(&mut buf) {
                    let _ = reply_sock.send_to(b"forged", src);
                }
            })
            .unwrap();

        let dispatcher =
            Dispatcher::new(table_with(addr)).with_call_budget(Duration::from_millis(300));
        let err = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"hi")
            .unwrap_err();
        // The forged bytes never surface; each attempt waits out its RTO
        // after shedding the rogue reply, and the call dies on its budget.
        assert!(matches!(err, DispatchError::BudgetExhausted(_)));
    }

    #[test]
    fn test_weight_recovers_after_backend_returns() {
        let addr = spawn_mirror_worker();
        let mut table = table_with(addr);
        let backend = Backend { id: 1, addr };
        // Simulate a bad spell: weight decays well below the seed.
        for _ in 0..6 {
            table.report_timeout(&backend);
        }
        let decayed = table.total_weight();
        assert!(decayed < 1_000);

        let dispatcher = Dispatcher::new(table);
        let reply = dispatcher
            .rsa_op(&FP, Op::RsaPrivDecrypt, Padding::Pkcs1, b"ab")
            .unwrap();
        assert_eq!(reply, b"ba");

        let table = dispatcher.table();
        assert!(table.lock().unwrap().total_weight() > decayed);
    }
}
