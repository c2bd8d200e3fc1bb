//! Clotho maintenance binary.
//!
//! The consensus engine itself is a library embedded by a node; this binary
//! offers offline database tooling:
//!   clotho check          # verify flush markers and DAG integrity
//!   clotho info           # print epoch, last block, heads

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use clotho::config::ClothoConfig;
use clotho::error::ClothoError;
use clotho::kvdb::{FlushablePool, SledProducer};
use clotho::store::DagStore;

/// Clotho consensus database tooling.
#[derive(Parser, Debug)]
#[command(name = "clotho", version, about = "Clotho aBFT consensus engine tools")]
struct Cli {
    /// Data directory holding the store pool.
    #[arg(long, default_value = "./clotho-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify flush-marker consistency and DAG integrity.
    Check,
    /// Print store metadata.
    Info,
}

fn open_store(data_dir: &PathBuf) -> Result<DagStore, ClothoError> {
    let config = ClothoConfig::load(data_dir);
    let producer = SledProducer::open(data_dir).map_err(clotho::store::StoreError::from)?;
    let pool = FlushablePool::open(
        producer,
        config.store.flush_interval(),
        config.store.flush_size_threshold,
    )
    .map_err(clotho::store::StoreError::from)?;
    Ok(DagStore::open(pool, config.store)?)
}

fn run(cli: Cli) -> Result<(), ClothoError> {
    match cli.command {
        Command::Check => {
            let store = open_store(&cli.data_dir)?;
            match store.check_consistency()? {
                Some(id) => println!("flush markers clean, recovery id {}", hex::encode(id)),
                None => println!("flush markers clean (empty pool)"),
            }
            let summary = store.check_integrity()?;
            println!(
                "integrity ok: epoch {}, {} events, {} heads",
                summary.epoch, summary.events, summary.heads
            );
            Ok(())
        }
        Command::Info => {
            let store = open_store(&cli.data_dir)?;
            println!("epoch: {}", store.epoch());
            match store.last_block()? {
                Some(last) => {
                    println!("last block: {}", last.index);
                    println!("last atropos: {}", last.atropos);
                }
                None => println!("last block: none"),
            }
            println!("heads: {}", store.get_heads()?.len());
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::from(err.exit_code().clamp(0, 255) as u8)
        }
    }
}
