#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

mod account;
mod amount;
mod config;
mod decrypt;
mod errors;
mod fsutil;
mod keyvault;
mod kv;
mod paths;
mod registry;
mod rpc;
mod store;

#[derive(Parser, Debug)]
#[command(name = "tokenvault", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve newline-delimited JSON-RPC on stdin/stdout.
    Serve {
        /// Keep keys and tokens in memory only; no records are written under the data dir.
        #[arg(long, default_value_t = false)]
        ephemeral: bool,
    },

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &paths::VaultPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(paths::LOG_FILE_NAME);
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn build_router(paths: &paths::VaultPaths, ephemeral: bool) -> eyre::Result<rpc::router::RequestRouter> {
    let cfg = store::ConfigStore::new(paths)
        .load_or_init_default()
        .context("load config")?;
    let machine_secret = paths.ensure_machine_secret().context("load machine secret")?;

    let kv: Arc<dyn kv::KvStore> = if ephemeral {
        info!("ephemeral mode: state is kept in memory");
        Arc::new(kv::MemoryKvStore::new())
    } else {
        Arc::new(kv::FileKvStore::open(paths).context("open record store")?)
    };

    rpc::router::RequestRouter::new(kv, machine_secret, &cfg).context("invalid default_account")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::VaultPaths::discover()?;
    paths.ensure_private_dirs().context("create private dirs")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Serve { ephemeral } => {
            let router = build_router(&paths, ephemeral)?;
            rpc::server::run_stdio(&router)
                .await
                .context("stdio server failed")
        }
        Command::Paths => {
            use std::io::Write as _;
            let s = serde_json::to_string(&serde_json::json!({
              "config_dir": paths.config_dir,
              "data_dir": paths.data_dir,
              "log_file": paths.log_file,
              "records_dir": paths.records_dir(),
            }))
            .context("serialize paths")?;
            writeln!(std::io::stdout().lock(), "{s}").context("write paths")?;
            Ok(())
        }
    }
}
