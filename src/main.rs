//! gobuildcache entry point
//!
//! With no arguments the binary serves one GOCACHEPROG session on
//! stdin/stdout; this is how the compiler driver invokes it. The `clear`
//! subcommand wipes the configured backend. Configuration comes from the
//! environment (see [`gobuildcache::config`]); logs go to stderr because
//! stdout carries the wire protocol.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gobuildcache::backends;
use gobuildcache::config::Config;
use gobuildcache::locking;
use gobuildcache::proto::{Engine, EngineConfig, FlightOutcome};

/// External build cache helper for the Go toolchain
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Delete every entry from the configured backend
    Clear {
        /// Backend to clear (disk, s3, disk+s3, memory); defaults to the
        /// environment configuration
        #[arg(long)]
        backend: Option<String>,
        /// Cache directory for the disk backend
        #[arg(long = "cache-dir")]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_env();
    init_logging(&config);

    let code = match args.command {
        Some(CliCommand::Clear { backend, cache_dir }) => {
            run_clear(config, backend, cache_dir).await
        }
        None => run_serve(config).await,
    };
    std::process::exit(code);
}

async fn run_serve(config: Config) -> i32 {
    info!(
        backend = %config.backend_type,
        lock = %config.lock_type,
        read_only = config.read_only,
        cache_dir = %config.cache_dir.display(),
        "starting cache session"
    );

    let backend = match backends::from_config(&config).await {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, "failed to initialise backend");
            return 1;
        }
    };
    let locker = match locking::from_config::<FlightOutcome>(&config) {
        Ok(locker) => locker,
        Err(err) => {
            error!(error = %err, "failed to initialise locker");
            return 1;
        }
    };

    let mut engine_config = EngineConfig::new(config.cache_dir.join("objects"));
    engine_config.print_stats = config.print_stats;

    let engine = Engine::new(backend, locker, engine_config);
    match engine.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "cache session failed");
            1
        }
    }
}

async fn run_clear(
    mut config: Config,
    backend_override: Option<String>,
    cache_dir_override: Option<PathBuf>,
) -> i32 {
    if let Some(backend) = backend_override {
        config.backend_type = backend;
    }
    if let Some(cache_dir) = cache_dir_override {
        config.cache_dir = cache_dir;
    }

    let backend = match backends::from_config(&config).await {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("failed to initialise backend: {err}");
            return 1;
        }
    };

    if let Err(err) = backend.clear().await {
        eprintln!("failed to clear cache: {err}");
        return 1;
    }
    if let Err(err) = backend.close().await {
        eprintln!("failed to close backend: {err}");
        return 1;
    }
    println!(
        "cleared {} cache at {}",
        config.backend_type,
        config.cache_dir.display()
    );
    0
}

fn init_logging(config: &Config) {
    let default_level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(default_level.into());

    // stderr only: stdout belongs to the wire protocol.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}
