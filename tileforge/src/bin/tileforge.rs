use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info};
use serde::Deserialize;

use tileforge::args::{Args, ConfigArgs};
use tileforge::data::DataManager;
use tileforge::srv::{new_server, spawn_maintenance_watch, ServerState};
use tileforge::{TileforgeError, TileforgeResult};
use tileforge_core::config::{ConfigSource, JsonConfig};
use tileforge_core::monitor::StatusMonitor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The `app` configuration section.
#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    #[serde(default)]
    log_dir: Option<std::path::PathBuf>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

async fn start(args: Args) -> TileforgeResult<()> {
    info!("Starting Tileforge v{VERSION}");

    let config = match args.config {
        ConfigArgs::Json { path } => {
            info!("Using {}", path.display());
            JsonConfig::new(&path)
        }
        ConfigArgs::Etcd { host } => {
            error!("This build carries no key-value registry client (requested {host})");
            return Err(TileforgeError::UnsupportedConfigSource("etcd"));
        }
    };
    if !config.is_valid() {
        return Err(TileforgeError::InvalidConfig);
    }

    let japp = config
        .get("app")
        .ok_or(TileforgeError::MissingConfigSection("app"))?;
    config
        .get("server")
        .ok_or(TileforgeError::MissingConfigSection("server"))?;
    let app: AppConfig = serde_json::from_value((*japp).clone()).unwrap_or_default();
    if let Some(log_dir) = &app.log_dir {
        debug!("Logging to stderr; {} is left to the supervisor", log_dir.display());
    }

    let monitor = Arc::new(StatusMonitor::new());
    // data providers are wired in by deployment-specific builds
    let data = Arc::new(DataManager::new());
    let state = ServerState::from_config(&config, data, Arc::clone(&monitor));

    let (server, handle, addresses) = new_server(&args.host, &config, state, None)?;
    spawn_maintenance_watch(monitor, None, handle);

    let name = app.name.as_deref().unwrap_or("tileforge");
    let version = app.version.as_deref().unwrap_or(VERSION);
    info!("Running {name} {version} on {addresses}");
    server.await
}

#[actix_web::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = start(Args::parse()).await {
        error!("{e}");
        std::process::exit(1);
    }
}
