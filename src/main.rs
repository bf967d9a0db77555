use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::prelude::*;

use kgraph::config::load_config;

#[derive(Parser)]
#[command(
    name = "kgraphd",
    version,
    about = "Knowledge graph daemons: nodes watcher and warm vector server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the nodes directory and keep the derived index in sync
    Watch {
        /// Project root (directory containing kg.toml)
        root: PathBuf,
    },
    /// Serve embeddings and cosine search from a warm in-memory matrix
    VectorServer {
        /// Project root (directory containing kg.toml)
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match &cli.command {
        Command::Watch { root } | Command::VectorServer { root } => root.clone(),
    };

    let cfg = load_config(Some(&root))?;
    cfg.ensure_dirs()?;

    // Two layers: compact stdout (captured by the supervisor) and a daily
    // rotated file under <index-dir>/logs/.
    let log_dir = cfg.log_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kgraphd.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kgraph=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting; daemons run far from a terminal.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "kgraph::panic", location = %location, payload = %payload, "PANIC");
        default_panic(info);
    }));

    match cli.command {
        Command::Watch { .. } => {
            kgraph::watcher::run_watcher(&cfg)?;
            Ok(())
        }
        Command::VectorServer { .. } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(kgraph::vector_server::run_vector_server(&cfg))
        }
    }
}
