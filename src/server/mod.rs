//! The automation server.
//!
//! ## Architecture
//!
//! - `codec`: HTTP-shaped request/response framing
//! - `request`, `response`: request data, the client connection, response payloads
//! - `endpoints`: path to handler table and script module names
//! - `connection`: per-connection read, parse and dispatch
//! - `worker_pool`: threads that run handlers and send responses
//! - `run_file`: discoverability file written while listening
//!
//! One accept thread per running server drives a current-thread tokio
//! runtime. Everything that may block (handlers, UI round trips, response
//! writes) happens on the worker pool.

pub mod codec;
pub mod connection;
pub mod endpoints;
pub mod request;
pub mod response;
pub mod run_file;
pub mod worker_pool;

use std::any::Any;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::Desktop;
use crate::component::endpoints::ComponentEndpoints;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::script::{ScriptBridge, ScriptEngine};
use crate::types::TypeRegistry;
use crate::ui::UiContext;

use connection::{Dispatcher, Limits};
use endpoints::{Endpoint, EndpointRegistry};
use run_file::RunFile;
use worker_pool::{WorkerPool, WorkerPoolConfig};

pub use request::{Connection, Request};
pub use response::Response;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Collaborators supplied by the host application.
pub struct Services {
    pub types: Arc<TypeRegistry>,
    pub ui: Arc<dyn UiContext>,
    pub desktop: Arc<dyn Desktop>,
    pub scripts: Option<Box<dyn ScriptEngine>>,
}

struct Running {
    port: u16,
    shutdown: CancellationToken,
    accept_thread: JoinHandle<()>,
    pool: WorkerPool,
    run_file: Option<RunFile>,
}

pub struct AutomationServer {
    config: ServerConfig,
    endpoints: Arc<EndpointRegistry>,
    types: Arc<TypeRegistry>,
    ui: Arc<dyn UiContext>,
    desktop: Arc<dyn Desktop>,
    scripts: Arc<ScriptBridge>,
    running: Mutex<Option<Running>>,
}

impl AutomationServer {
    pub fn new(config: ServerConfig, services: Services) -> Self {
        let scripts = ScriptBridge::new(
            services.scripts,
            services.ui.clone(),
            services.types.clone(),
            services.desktop.clone(),
        );

        Self {
            config,
            endpoints: Arc::new(EndpointRegistry::new()),
            types: services.types,
            ui: services.ui,
            desktop: services.desktop,
            scripts: Arc::new(scripts),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start listening and return the bound port.
    ///
    /// With `Some(port)` only that port is tried (`0` lets the OS choose).
    /// With `None` the configured range is scanned and the first free port wins.
    pub fn start(&self, port: Option<u16>) -> Result<u16, ServerError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let listener = match port {
            Some(port) => self
                .bind(port)
                .map_err(|source| ServerError::PortUnavailable { port, source })?,
            None => self.scan()?,
        };
        listener.set_nonblocking(true).map_err(ServerError::Listener)?;
        let port = listener.local_addr().map_err(ServerError::Listener)?.port();

        let pool = WorkerPool::new(WorkerPoolConfig {
            num_workers: self.config.worker_threads,
            queue_bound: self.config.queue_bound,
        })
        .map_err(ServerError::ThreadSpawn)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            endpoints: self.endpoints.clone(),
            scripts: self.scripts.clone(),
            pool: pool.handle(),
            limits: Limits::from(&self.config),
        };

        let token = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name("uiprobe-accept".to_string())
            .spawn(move || runtime.block_on(accept_loop(listener, dispatcher, token)));

        let accept_thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                pool.shutdown(Duration::ZERO);
                return Err(ServerError::ThreadSpawn(e));
            }
        };

        let run_file = match RunFile::create(self.config.run_file_path(), port) {
            Ok(run_file) => Some(run_file),
            Err(e) => {
                warn!(error = %e, "Continuing without run file");
                None
            }
        };

        info!(port, "Automation server listening");
        *running = Some(Running {
            port,
            shutdown,
            accept_thread,
            pool,
            run_file,
        });
        Ok(port)
    }

    /// Stop listening. Does nothing when the server is idle.
    pub fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };

        info!(port = running.port, "Stopping automation server");
        running.shutdown.cancel();
        running.pool.shutdown(self.config.drain_timeout());
        drop(running.run_file);

        if running.accept_thread.join().is_err() {
            error!("Accept thread panicked");
        }
        debug!("Automation server stopped");
    }

    pub fn port(&self) -> Option<u16> {
        self.lock_running().as_ref().map(|running| running.port)
    }

    pub fn is_running(&self) -> bool {
        self.port().is_some()
    }

    pub fn register_endpoint(&self, path: impl Into<String>, endpoint: impl Endpoint + 'static) {
        self.endpoints.register(path, endpoint);
    }

    /// Install sleep plus the component exists, visible, info, click and
    /// render endpoints.
    pub fn register_default_endpoints(&self) {
        let builtins = ComponentEndpoints::new(self.desktop.clone(), self.ui.clone(), self.types.clone());
        Arc::new(builtins).register(&self.endpoints);
    }

    pub fn register_script_modules<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.add_modules(modules);
    }

    /// Report `T` by its own name instead of the base component name.
    pub fn register_component_type<T: Any>(&self) {
        self.types.register_type::<T>();
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    fn bind(&self, port: u16) -> std::io::Result<StdTcpListener> {
        StdTcpListener::bind(SocketAddr::new(self.config.bind_address, port))
    }

    fn scan(&self) -> Result<StdTcpListener, ServerError> {
        let (first, last) = (self.config.default_port, self.config.port_range_end);
        for port in first..=last {
            match self.bind(port) {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!(port, error = %e, "Port unavailable"),
            }
        }
        Err(ServerError::PortRangeExhausted { first, last })
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AutomationServer {
    fn drop(&mut self) {
        self.stop();
        self.types.clear();
    }
}

async fn accept_loop(listener: StdTcpListener, dispatcher: Dispatcher, shutdown: CancellationToken) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to register listener with runtime");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Client connected");
                    connection::handle(stream, peer, &dispatcher).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if back_off(&shutdown).await {
                        break;
                    }
                }
            },
        }
    }
}

/// Pause after a failed `accept` (e.g. out of descriptors) so the loop does
/// not spin. Returns `true` when the server was stopped meanwhile.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
    }
}
