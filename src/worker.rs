//! `keyrelay worker` — answer key operations over UDP.
//!
//! Registers the requested fingerprints against the built-in loopback
//! accelerator; production deployments plug a real modular-exponentiation
//! engine into the same `Accel` seam.

use anyhow::{Context, Result};
use key_dispatch::{Accel, Fingerprint, KeyStore, MirrorAccel, Worker, WorkerConfig};
use std::net::Ipv4Addr;

/// Fingerprint registered when none are given, so a freshly started worker
/// can serve the bench harness without flags.
pub const DEFAULT_TEST_FINGERPRINT: [u8; 16] = [0u8; 16];

pub fn run(host: &str, port: u16, fingerprints: &[String]) -> Result<()> {
    let host: Ipv4Addr = host
        .parse()
        .with_context(|| format!("invalid host address: {}", host))?;

    let accel = MirrorAccel;
    let mut store = KeyStore::new();

    if fingerprints.is_empty() {
        let fp = Fingerprint(DEFAULT_TEST_FINGERPRINT);
        let handle = accel.add_key(&[])?;
        tracing::info!(fingerprint = %fp, "registering default test fingerprint");
        store.add(fp, handle);
    } else {
        for hex in fingerprints {
            let fp = Fingerprint::from_hex(hex)
                .with_context(|| format!("invalid fingerprint (want 32 hex chars): {}", hex))?;
            let handle = accel.add_key(&[])?;
            store.add(fp, handle);
        }
    }

    let worker = Worker::bind(&WorkerConfig { host, port }, store, accel)?;
    worker.run()
}
