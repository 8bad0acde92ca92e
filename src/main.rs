//! spate - move one large file over many parallel TCP connections.
//!
//! Three subcommands, run in this order:
//! - `create` on the receiving host reserves the destination file;
//! - `recv` on the receiving host listens and assembles the file;
//! - `send` on the sending host dials in and serves blocks.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spate::cipher::KeyMaterial;
use spate::collector::{collect, CollectConfig};
use spate::error::TransferError;
use spate::prealloc;
use spate::protocol::DEFAULT_BLOCK_SIZE;
use spate::supplier::{supply, SupplyConfig};

/// Exit status for startup and runtime failures.
const EXIT_FAILURE: i32 = 3;
/// Exit status for protocol desynchronization and allocation mismatches.
const EXIT_FATAL: i32 = 4;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Move one large file over many parallel TCP connections"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preallocate the destination file on the receiving host
    Create {
        /// Destination file to reserve
        file: PathBuf,

        /// Exact size in bytes
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        size: u64,
    },

    /// Serve a file's blocks to a listening collector
    Send {
        /// Source file
        file: PathBuf,

        /// Collector address, host:port
        #[arg(long)]
        to: String,

        /// Parallel connections to keep open
        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u64).range(1..))]
        workers: u64,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Listen for suppliers and assemble the file
    Recv {
        /// Destination file (already reserved via create)
        file: PathBuf,

        /// Port to listen on (all interfaces)
        #[arg(long)]
        port: u16,

        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Settings both ends must agree on.
#[derive(clap::Args, Debug)]
struct Tuning {
    /// Block size in bytes; both ends must use the same value
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
    block_size: u64,

    /// Shared passphrase the payload keystream is derived from
    #[arg(long, default_value = "123456")]
    key: String,
}

fn main() {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        let code = if err
            .downcast_ref::<TransferError>()
            .is_some_and(TransferError::is_fatal)
        {
            EXIT_FATAL
        } else {
            EXIT_FAILURE
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Create { file, size } => prealloc::create(&file, size),
        Command::Send {
            file,
            to,
            workers,
            tuning,
        } => {
            let cfg = SupplyConfig {
                file,
                addr: to,
                workers: workers as usize,
                block_size: tuning.block_size,
                key: KeyMaterial::derive(&tuning.key),
            };
            runtime()?.block_on(supply(cfg))
        }
        Command::Recv { file, port, tuning } => {
            let cfg = CollectConfig {
                file,
                port,
                block_size: tuning.block_size,
                key: KeyMaterial::derive(&tuning.key),
            };
            runtime()?.block_on(collect(cfg))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}
