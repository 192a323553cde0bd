//! `keyrelay servers` — query discovery and print the resolved backend list.

use anyhow::Result;
use key_dispatch::{DiscoveryClient, IdGen};

use crate::config::RelayConfig;

pub fn run(config: &RelayConfig) -> Result<()> {
    let client = DiscoveryClient::new(config.discovery.clone());
    let entries = client.fetch()?;

    if entries.is_empty() {
        println!("(discovery at {} returned no backends)", config.discovery);
        return Ok(());
    }

    let ids = IdGen::new();

    println!("=== Backends from {} ===", config.discovery);
    println!("  {:<6} {:<24} {}", "ID", "ENTRY", "RESOLVED");
    println!("  {}", "-".repeat(56));
    for entry in &entries {
        let resolved = key_dispatch::discovery::resolve_backends(
            std::slice::from_ref(entry),
            &ids,
        );
        match resolved.first() {
            Some(backend) => {
                println!("  {:<6} {:<24} {}", backend.id, entry, backend.addr);
            }
            None => {
                println!("  {:<6} {:<24} (did not resolve)", "-", entry);
            }
        }
    }

    Ok(())
}
