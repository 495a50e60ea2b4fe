//! HTTP handler plane: request routing over atomically swapped snapshots.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::middleware::Logger;
use actix_web::web::{self, Data};
use actix_web::{App, HttpServer};
use arc_swap::ArcSwap;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;

use tileforge_core::cacher::{Cacher, CacherConfig, MemoryCacher};
use tileforge_core::config::{ConfigObserver, ConfigSource};
use tileforge_core::monitor::{NodesMonitor, StatusMonitor};
use tileforge_core::render::{FlatBackend, RenderManager};

use crate::data::DataManager;
use crate::endpoints::{parse_endpoints, EndpointTable};
use crate::{TileforgeError, TileforgeResult};

mod mon;
mod tiles;

pub use mon::get_mon;
pub use tiles::serve_tile;

pub const DEFAULT_PORT: u16 = 8080;

/// How long maintenance mode drains in-flight requests before stopping.
pub const MAINTENANCE_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_CACHER_CAPACITY: u64 = 512 * 1024 * 1024;

/// The render manager variant this server ships with.
pub type TileRenderer = RenderManager<FlatBackend>;

/// Transport settings from the `server` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SrvConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub internal_port: Option<u16>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for SrvConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            internal_port: None,
        }
    }
}

impl SrvConfig {
    #[must_use]
    pub fn from_config(config: &dyn ConfigSource) -> Self {
        config
            .get("server")
            .and_then(|server| match serde_json::from_value((*server).clone()) {
                Ok(srv) => Some(srv),
                Err(e) => {
                    error!("Invalid server section: {e}");
                    None
                }
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn internal_port(&self) -> u16 {
        self.internal_port.unwrap_or_else(|| self.port.saturating_add(1))
    }
}

/// Everything a request handler needs, shared across the I/O threads.
///
/// The endpoint table is behind an [`ArcSwap`]: a handler loads the pointer
/// once at entry and works against that snapshot for the whole request.
pub struct ServerState {
    pub render: TileRenderer,
    pub data: Arc<DataManager>,
    pub endpoints: Arc<ArcSwap<EndpointTable>>,
    pub cacher: Option<Arc<dyn Cacher>>,
    pub monitor: Arc<StatusMonitor>,
    _observer: Arc<dyn ConfigObserver>,
}

/// Reparses `server.endpoints` on config pushes and swaps the fresh table in.
struct ServerUpdateObserver {
    endpoints: Arc<ArcSwap<EndpointTable>>,
}

impl ConfigObserver for ServerUpdateObserver {
    fn on_update(&self, value: Arc<Value>) {
        match parse_endpoints(value.get("endpoints").unwrap_or(&Value::Null)) {
            Some(table) => {
                info!("Publishing endpoint table with {} paths", table.len());
                self.endpoints.store(Arc::new(table));
            }
            None => error!("Ignoring endpoints update that is not an object"),
        }
    }
}

impl ServerState {
    /// Builds the handler plane: render manager, endpoint table (watched for
    /// updates), and the optional cacher.
    pub fn from_config(
        config: &dyn ConfigSource,
        data: Arc<DataManager>,
        monitor: Arc<StatusMonitor>,
    ) -> Self {
        let render = RenderManager::new(config, Arc::new(FlatBackend::default()));

        let endpoints = Arc::new(ArcSwap::from_pointee(EndpointTable::default()));
        let observer: Arc<dyn ConfigObserver> = Arc::new(ServerUpdateObserver {
            endpoints: Arc::clone(&endpoints),
        });
        let jserver = config.get_watched("server", &observer);
        let table = jserver
            .as_deref()
            .and_then(|server| parse_endpoints(server.get("endpoints").unwrap_or(&Value::Null)));
        match table {
            Some(table) => {
                if table.is_empty() {
                    warn!("No endpoints provided");
                }
                endpoints.store(Arc::new(table));
            }
            None => warn!("No endpoints provided"),
        }

        Self {
            render,
            data,
            endpoints,
            cacher: build_cacher(config),
            monitor,
            _observer: observer,
        }
    }
}

fn build_cacher(config: &dyn ConfigSource) -> Option<Arc<dyn Cacher>> {
    let Some(jcacher) = config.get("cacher") else {
        info!("Starting without cacher");
        return None;
    };
    match serde_json::from_value::<CacherConfig>((*jcacher).clone()) {
        Ok(cacher) => {
            if !cacher.hosts.is_empty() {
                info!(
                    "Remote cacher hosts {:?} need an external backend; serving from the \
                     in-memory cacher",
                    cacher.hosts
                );
            }
            Some(Arc::new(MemoryCacher::new(DEFAULT_CACHER_CAPACITY)))
        }
        Err(e) => {
            error!("Invalid cacher section: {e}");
            info!("Starting without cacher");
            None
        }
    }
}

/// Registers the handler plane on an actix app.
pub fn router(cfg: &mut web::ServiceConfig, state: &Data<ServerState>) {
    cfg.app_data(state.clone())
        .service(get_mon)
        .default_service(web::route().to(serve_tile));
}

pub type Server = Pin<Box<dyn Future<Output = TileforgeResult<()>>>>;

/// Creates the server future bound to the public and internal ports, plus the
/// handle the signal path uses to stop it. Node registration brackets the
/// server's lifetime.
pub fn new_server(
    host: &str,
    config: &dyn ConfigSource,
    state: ServerState,
    nodes_monitor: Option<Arc<dyn NodesMonitor>>,
) -> TileforgeResult<(Server, ServerHandle, String)> {
    let srv_config = SrvConfig::from_config(config);
    let public_addr = format!("{host}:{}", srv_config.port);
    let internal_addr = format!("{host}:{}", srv_config.internal_port());

    let state = Data::new(state);
    let factory = move || {
        App::new()
            .wrap(Logger::default())
            .configure(|cfg| router(cfg, &state))
    };
    let server = HttpServer::new(factory)
        .bind(&public_addr)
        .map_err(|e| TileforgeError::BindingError(e, public_addr.clone()))?
        .bind(&internal_addr)
        .map_err(|e| TileforgeError::BindingError(e, internal_addr.clone()))?
        .run();
    let handle = server.handle();

    let addresses = format!("{public_addr} (internal {internal_addr})");
    let server = async move {
        if let Some(nodes) = &nodes_monitor {
            nodes.register();
        }
        let result = server.await;
        if let Some(nodes) = &nodes_monitor {
            nodes.unregister();
        }
        result.map_err(TileforgeError::from)
    };
    Ok((Box::pin(server), handle, addresses))
}

/// SIGHUP flips the status to maintenance, unregisters from the cluster,
/// drains for [`MAINTENANCE_GRACE`], then stops the server.
#[cfg(unix)]
pub fn spawn_maintenance_watch(
    monitor: Arc<StatusMonitor>,
    nodes_monitor: Option<Arc<dyn NodesMonitor>>,
    server: ServerHandle,
) {
    use tileforge_core::monitor::Status;
    use tokio::signal::unix::{signal, SignalKind};

    actix_web::rt::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!("Unable to install SIGHUP handler: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if monitor.exchange(Status::Maintenance) == Status::Maintenance {
                continue;
            }
            info!("Switching to maintenance mode!");
            if let Some(nodes) = &nodes_monitor {
                nodes.unregister();
            }
            tokio::time::sleep(MAINTENANCE_GRACE).await;
            info!("Stopping server!");
            server.stop(true).await;
            return;
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_maintenance_watch(
    _monitor: Arc<StatusMonitor>,
    _nodes_monitor: Option<Arc<dyn NodesMonitor>>,
    _server: ServerHandle,
) {
    warn!("Maintenance signal handling is only available on unix");
}
