//! `keyrelay bench` — timed dispatch benchmark with structured JSON output.
//!
//! Spawns an in-process loopback worker, points a shared `ServerTable` at it
//! (plus any workers listed in relay.toml), and hammers it from N dispatcher
//! threads for a fixed duration. Per-request latencies flow over a bounded
//! channel to an aggregator; the report carries throughput and latency
//! percentiles.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use key_dispatch::{
    discovery, Backend, DispatchError, Dispatcher, Fingerprint, IdGen, KeyStore, MirrorAccel, Op,
    Padding, ServerTable, Worker, WorkerConfig,
};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::worker::DEFAULT_TEST_FINGERPRINT;

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub generated_at: String,
    pub duration_secs: f64,
    pub threads: usize,
    pub payload_bytes: usize,
    pub backends: usize,
    pub requests: u64,
    pub errors: u64,
    pub reqs_per_sec: f64,
    pub latency_p50_us: Option<u64>,
    pub latency_p95_us: Option<u64>,
    pub latency_p99_us: Option<u64>,
    pub latency_mean_us: Option<f64>,
}

/// One completed request as seen by a dispatcher thread.
enum Outcome {
    Ok { latency_us: u64 },
    Err,
}

pub fn run(
    config: &RelayConfig,
    duration_secs: u64,
    threads: usize,
    payload_bytes: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    anyhow::ensure!(threads > 0, "need at least one dispatcher thread");

    let fp = Fingerprint(DEFAULT_TEST_FINGERPRINT);

    // In-process loopback worker; always present so the bench runs with an
    // empty config.
    let mut store = KeyStore::new();
    store.add(fp, 0);
    let worker = Worker::bind(
        &WorkerConfig {
            host: Ipv4Addr::LOCALHOST,
            port: 0,
        },
        store,
        MirrorAccel,
    )?;
    let local_addr = match worker.local_addr()? {
        SocketAddr::V4(a) => a,
        other => anyhow::bail!("unexpected worker address family: {}", other),
    };
    std::thread::Builder::new()
        .name("bench-worker".into())
        .spawn(move || {
            let _ = worker.run();
        })
        .context("failed to spawn bench worker")?;

    let ids = IdGen::new();
    let mut table = ServerTable::new();
    table.push(
        Backend {
            id: ids.next(),
            addr: local_addr,
        },
        discovery::INITIAL_WEIGHT,
    );
    let configured = discovery::resolve_backends(&config.workers, &ids);
    discovery::seed_table(&mut table, &configured);

    let backends = table.len();
    eprintln!(
        "keyrelay bench — {}s, {} thread(s), {} backend(s), {}-byte payload...",
        duration_secs, threads, backends, payload_bytes
    );

    let table = Arc::new(Mutex::new(table));
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded::<Outcome>(4096);

    let mut handles = Vec::new();
    for i in 0..threads {
        let table = table.clone();
        let stop = stop.clone();
        let tx = tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("bench-dispatch-{}", i))
            .spawn(move || dispatch_loop(table, stop, tx, fp, payload_bytes))
            .context("failed to spawn dispatcher thread")?;
        handles.push(handle);
    }
    drop(tx);

    let start = Instant::now();
    let aggregator = std::thread::Builder::new()
        .name("bench-aggregate".into())
        .spawn(move || aggregate(rx))
        .context("failed to spawn aggregator")?;

    std::thread::sleep(Duration::from_secs(duration_secs));
    stop.store(true, Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    let elapsed = start.elapsed().as_secs_f64();

    let (latencies, errors) = aggregator.join().expect("aggregator panicked");
    let report = build_report(latencies, errors, elapsed, threads, payload_bytes, backends);

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    eprintln!();
    eprintln!("=== BENCH SUMMARY ({:.0}s) ===", elapsed);
    eprintln!(
        "  requests={}  errors={}  reqs/s={:.0}  p50={}  p95={}  p99={}",
        report.requests,
        report.errors,
        report.reqs_per_sec,
        fmt_us(report.latency_p50_us),
        fmt_us(report.latency_p95_us),
        fmt_us(report.latency_p99_us),
    );

    Ok(())
}

fn dispatch_loop(
    table: Arc<Mutex<ServerTable>>,
    stop: Arc<AtomicBool>,
    tx: Sender<Outcome>,
    fp: Fingerprint,
    payload_bytes: usize,
) {
    let dispatcher =
        Dispatcher::from_shared(table).with_call_budget(Duration::from_secs(2));
    let payload = vec![0x5Au8; payload_bytes];

    while !stop.load(Relaxed) {
        let start = Instant::now();
        match dispatcher.rsa_op(&fp, Op::RsaPrivDecrypt, Padding::Pkcs1, &payload) {
            Ok(_) => {
                let outcome = Outcome::Ok {
                    latency_us: start.elapsed().as_micros() as u64,
                };
                if tx.send(outcome).is_err() {
                    break;
                }
            }
            Err(DispatchError::NoServers) => {
                tracing::error!("backend pool exhausted, stopping thread");
                let _ = tx.send(Outcome::Err);
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "request failed");
                if tx.send(Outcome::Err).is_err() {
                    break;
                }
            }
        }
    }
}

fn aggregate(rx: Receiver<Outcome>) -> (Vec<u64>, u64) {
    let mut latencies = Vec::new();
    let mut errors = 0u64;
    for outcome in rx {
        match outcome {
            Outcome::Ok { latency_us } => latencies.push(latency_us),
            Outcome::Err => errors += 1,
        }
    }
    (latencies, errors)
}

fn build_report(
    mut latencies: Vec<u64>,
    errors: u64,
    elapsed: f64,
    threads: usize,
    payload_bytes: usize,
    backends: usize,
) -> BenchReport {
    latencies.sort_unstable();
    let n = latencies.len();

    let percentile = |p: usize| -> Option<u64> {
        if n == 0 {
            None
        } else {
            Some(latencies[(n * p / 100).min(n - 1)])
        }
    };

    let mean = if n == 0 {
        None
    } else {
        Some(latencies.iter().sum::<u64>() as f64 / n as f64)
    };

    BenchReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        duration_secs: elapsed,
        threads,
        payload_bytes,
        backends,
        requests: n as u64,
        errors,
        reqs_per_sec: n as f64 / elapsed,
        latency_p50_us: percentile(50),
        latency_p95_us: percentile(95),
        latency_p99_us: percentile(99),
        latency_mean_us: mean,
    }
}

fn fmt_us(v: Option<u64>) -> String {
    v.map(|us| format!("{}µs", us)).unwrap_or_else(|| "—".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_percentiles() {
        let latencies: Vec<u64> = (1..=100).collect();
        let report = build_report(latencies, 3, 10.0, 4, 256, 1);
        assert_eq!(report.requests, 100);
        assert_eq!(report.errors, 3);
        assert_eq!(report.latency_p50_us, Some(51));
        assert_eq!(report.latency_p95_us, Some(96));
        assert_eq!(report.latency_p99_us, Some(100));
        assert!((report.reqs_per_sec - 10.0).abs() < f64::EPSILON);
        assert!((report.latency_mean_us.unwrap() - 50.5).abs() < 0.1);
    }

    #[test]
    fn test_report_empty() {
        let report = build_report(Vec::new(), 0, 5.0, 1, 16, 0);
        assert_eq!(report.requests, 0);
        assert_eq!(report.latency_p50_us, None);
        assert_eq!(report.latency_mean_us, None);
    }
}
