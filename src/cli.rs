// Mockingbird - CLI command interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mockingbird",
    about = "Mockingbird - Malware C2 wire-protocol emulator",
    version,
    long_about = "Emulates the network wire protocols of real malware families so \
detection and response tooling can be exercised against realistic, interactive \
traffic without any malicious payload. Each emulated family speaks its original \
framing, ciphers, and opcode tables bit-for-bit."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an emulated C2 server for a malware family
    Serve {
        /// The protocol to emulate (e.g. hotcroissant, mata, generic)
        #[arg(short, long)]
        protocol: String,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        address: String,

        /// Optional path to a JSON config file for server parameters
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable verbose traffic logging
        #[arg(long, default_value_t = false)]
        debug: bool,
    },

    /// List the malware-family protocols available for emulation
    Protocols,
}
