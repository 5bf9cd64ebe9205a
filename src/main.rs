// Mockingbird - Malware C2 wire-protocol emulator
//
// Speaks the network protocols of real malware families so detection
// and response tooling can be driven with realistic, interactive
// traffic and no malicious payload on either end.

mod c2;
mod cli;
mod config;
mod hexdump;
mod logger;
mod protocol;

use c2::cert::KeyKind;
use c2::{AgentRegistry, Server};
use clap::Parser;
use cli::{Cli, Commands};
use log::{error, info};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Commands::Serve { debug: true, .. });
    logger::init_logger(debug);

    info!(
        "Starting Mockingbird v{} - C2 protocol emulator",
        env!("CARGO_PKG_VERSION")
    );

    match run_command(cli).await {
        Ok(_) => process::exit(0),
        Err(e) => {
            error!("Mockingbird failed: {e}");
            process::exit(1);
        }
    }
}

async fn run_command(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Serve {
            protocol,
            address,
            config,
            debug: _,
        } => {
            let config = config::load_config(config.as_deref())?;

            let address = config.address.clone().unwrap_or(address);
            let key_kind = match config.certificate_key.as_deref() {
                Some(name) => KeyKind::from_name(name)
                    .ok_or_else(|| format!("Unknown certificate key kind: {name}"))?,
                None => KeyKind::default(),
            };

            serve(&protocol, &address, key_kind).await
        }
        Commands::Protocols => {
            list_protocols();
            Ok(())
        }
    }
}

async fn serve(protocol: &str, address: &str, key_kind: KeyKind) -> Result<(), String> {
    let registry = Arc::new(AgentRegistry::new());

    let server = Server::bind(protocol, address, Arc::clone(&registry), key_kind)
        .await
        .map_err(|e| format!("Failed to start server: {e}"))?;

    info!(
        "Emulating {protocol} on {}; press Ctrl+C to stop",
        server.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to wait for Ctrl+C: {e}"))?;

    info!("Shutting down; waiting for live connections to finish");
    server.shutdown().await;

    info!("Done; {} agent(s) seen this run", registry.len());
    for agent in registry.agents() {
        let seen = chrono::DateTime::<chrono::Utc>::from(agent.last_seen());
        info!(
            "  {} from {} last seen {}",
            agent.id,
            agent.addr,
            seen.format("%Y-%m-%dT%H:%M:%SZ")
        );
    }

    Ok(())
}

fn list_protocols() {
    println!("Emulated malware-family protocols:\n");
    for name in protocol::protocol_names() {
        let tls = match protocol::from_name(name) {
            Some(handler) if handler.needs_tls() => " (TLS)",
            _ => "",
        };
        println!("  {name}{tls}");
    }
    println!("\nUsage:\n  mockingbird serve --protocol NAME --address IP:PORT\n");
}
