//! keyrelay — RSA private-key operation offload.
//!
//! Front-ends dispatch sign/decrypt requests to a pool of stateless UDP
//! workers; backend selection is weighted by measured latency. Run
//! `keyrelay --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod config;
mod discoveryd;
mod servers;
mod worker;

use cli::{Cli, Commands};

// Exit codes: 0 normal, 1 configuration error, 2 runtime error.
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Usage errors are configuration errors (exit 1); --help/--version are
    // normal exits.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => EXIT_CONFIG,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => match load_config(&cli) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                eprintln!("configuration error: {:#}", e);
                std::process::exit(EXIT_CONFIG);
            }
        },
    };

    let result = match cli.command {
        Commands::Init => {
            let example = config::RelayConfig::default_example();
            match toml::to_string_pretty(&example) {
                Ok(text) => {
                    print!("{}", text);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Servers => servers::run(config.as_ref().unwrap()),
        Commands::Worker {
            port,
            host,
            fingerprints,
        } => worker::run(&host, port, &fingerprints),
        Commands::Discoveryd {
            listen,
            workers,
            worker_file,
        } => discoveryd::run(config.as_ref().unwrap(), &listen, workers, worker_file),
        Commands::Bench {
            duration,
            threads,
            payload_bytes,
            output,
        } => bench::run(
            config.as_ref().unwrap(),
            duration,
            threads,
            payload_bytes,
            output,
        ),
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(EXIT_RUNTIME);
    }
}

fn load_config(cli: &Cli) -> Result<config::RelayConfig> {
    if !cli.config.exists() {
        eprintln!(
            "'{}' not found — using defaults; run `keyrelay init > {}` to create it.",
            cli.config.display(),
            cli.config.display()
        );
        return Ok(config::RelayConfig::default());
    }
    config::RelayConfig::load(&cli.config)
}
