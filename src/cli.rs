//! CLI definitions for keyrelay.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "keyrelay",
    version,
    about = "RSA private-key operation offload\n\nDispatches sign/decrypt requests to a pool of UDP workers, weighting each worker by its measured latency.",
    long_about = None
)]
pub struct Cli {
    /// Path to relay.toml config file
    #[clap(long, short, default_value = "relay.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query the discovery endpoint and print the resolved backend list
    Servers,

    /// Run a worker answering key operations over UDP
    Worker {
        /// UDP port to bind to
        #[clap(long, short, default_value = "10000")]
        port: u16,

        /// Host address to bind to
        #[clap(long, default_value = "0.0.0.0")]
        host: String,

        /// Fingerprint to register (32 hex chars; may be repeated)
        #[clap(long = "fingerprint", short = 'k')]
        fingerprints: Vec<String>,
    },

    /// Serve the backend list to dispatchers
    Discoveryd {
        /// TCP address to listen on
        #[clap(long, default_value = "127.0.0.1:9470")]
        listen: String,

        /// Worker endpoint host:port (may be repeated; adds to config)
        #[clap(long = "worker", short = 'w')]
        workers: Vec<String>,

        /// File with worker endpoints separated by whitespace or commas
        #[clap(long)]
        worker_file: Option<PathBuf>,
    },

    /// Run a timed loopback benchmark and output a structured report
    Bench {
        /// How many seconds to run the benchmark
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Number of concurrent dispatcher threads
        #[clap(long, short, default_value = "4")]
        threads: usize,

        /// Request payload size in bytes
        #[clap(long, default_value = "256")]
        payload_bytes: usize,

        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example relay.toml to stdout
    Init,
}
