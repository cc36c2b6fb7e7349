//! blockwire server daemon entry point.
//!
//! Usage:
//!   blockwired [CONFIG]               run the server
//!   blockwired hash-password PASSWORD print a passwordSha256 value
//!
//! The config path may also come from `BLOCKWIRE_CONFIG`; without one the
//! defaults are used.

mod app;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use blockwire_server::{ServerConfig, executor};

const CONFIG_ENV: &str = "BLOCKWIRE_CONFIG";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [cmd, password] = args.as_slice() {
        if cmd == "hash-password" {
            println!("{}", blockwire_server::hash_password(password));
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting blockwired");

    let config = match config_path(&args) {
        Some(path) => {
            let config = ServerConfig::load(&path)?;
            tracing::info!(path = %path.display(), "configuration loaded");
            config
        }
        None => {
            tracing::warn!("no config file given, using defaults");
            ServerConfig::default()
        }
    };
    if config.users.is_empty() {
        tracing::warn!("no users configured, every login will fail");
    }

    let rt = executor::build_runtime(config.worker_threads)?;
    rt.block_on(app::run(config))?;

    tracing::info!("blockwired shut down cleanly");
    Ok(())
}

fn config_path(args: &[String]) -> Option<PathBuf> {
    args.first()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}
