//! `keyrelay discoveryd` — serve the backend list to dispatchers.
//!
//! Workers come from the config file, repeated `--worker` flags, and/or a
//! worker file; all three are merged. Entries are resolved once at startup
//! (unresolvable ones are logged and skipped) and the surviving `ip:port`
//! list is served verbatim to every `GET` request.

use anyhow::{Context, Result};
use key_dispatch::discovery;
use key_dispatch::IdGen;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use crate::config::RelayConfig;

pub fn run(
    config: &RelayConfig,
    listen: &str,
    workers: Vec<String>,
    worker_file: Option<PathBuf>,
) -> Result<()> {
    let mut entries = config.workers.clone();
    entries.extend(workers);
    if let Some(path) = worker_file {
        entries.extend(read_worker_file(&path)?);
    }

    if entries.is_empty() {
        anyhow::bail!("no workers configured — use [workers] in relay.toml, --worker, or --worker-file");
    }

    let ids = IdGen::new();
    let backends = discovery::resolve_backends(&entries, &ids);
    if backends.is_empty() {
        anyhow::bail!("none of the {} configured workers resolved", entries.len());
    }

    // Trailing comma matches what the dispatch client tolerates.
    let reply: String = backends
        .iter()
        .map(|b| format!("{},", b.addr))
        .collect();

    let listener = TcpListener::bind(listen)
        .with_context(|| format!("could not listen on {}", listen))?;
    tracing::info!(%listen, backends = backends.len(), "discoveryd started");

    loop {
        let (mut conn, peer) = match listener.accept() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let mut request = String::new();
        if let Err(e) = conn.read_to_string(&mut request) {
            tracing::warn!(%peer, error = %e, "could not read request");
            continue;
        }

        if request.trim() == "GET" {
            tracing::debug!(%peer, %reply, "serving backend list");
            if let Err(e) = conn.write_all(reply.as_bytes()) {
                tracing::warn!(%peer, error = %e, "could not send reply");
            }
        } else {
            tracing::warn!(%peer, %request, "unknown request");
        }
    }
}

/// Worker entries separated by whitespace or commas.
fn read_worker_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read worker file: {}", path.display()))?;
    Ok(text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_worker_file_tokenization() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "10.0.0.1:9000 10.0.0.2:9001,10.0.0.3:9002\n10.0.0.4:9003\r\n").unwrap();

        let entries = read_worker_file(file.path()).unwrap();
        assert_eq!(
            entries,
            vec![
                "10.0.0.1:9000",
                "10.0.0.2:9001",
                "10.0.0.3:9002",
                "10.0.0.4:9003"
            ]
        );
    }

    #[test]
    fn test_missing_worker_file_errors() {
        assert!(read_worker_file(Path::new("/nonexistent/workers.txt")).is_err());
    }
}
