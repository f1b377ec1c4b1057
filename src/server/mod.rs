//! Relay lifecycle: start listeners and workers, shut them down in order.
//!
//! ```text
//! Relay::start ─► bind every listener ─► spawn UpdateWorker ─► spawn serve loops
//!                      │ (any bind error aborts start)
//!                      ▼
//!                RunningRelay ── wait() ◄── fatal listener error
//!                      │
//!                  shutdown()
//!                      │ 1. stop listeners (graceful)
//!                      │ 2. Router::close_all
//!                      │ 3. stop the update worker
//!                      │ 4. cancel push sessions, evict registry
//!                      │ 5. wait up to the grace period, abort the rest
//!                      ▼
//!                   stopped
//! ```
//!
//! # Modules
//!
//! - [`handlers`] - REST and push upgrade handlers
//! - [`listeners`] - listener specs, binding, serve loops

// Rust guideline compliant 2026-02

pub mod handlers;
pub mod listeners;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::ClientRegistry;
use crate::config::RelayConfig;
use crate::dispatch::{Dispatcher, UpdateQueue, UpdateWorker};
use crate::push::PushContext;
use crate::router::inbound::{shard_routes, InboundState};
use crate::router::{RouteError, Router};
use crate::storage::ChannelStore;
use crate::tls::{load_acceptor, TlsError};

use handlers::{push_routes, rest_routes, AppState};
use listeners::{bind, listener_specs, local_addr, serve_plain, serve_tls, ListenerSpec, Service};

/// Fatal relay error.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A listener could not be bound.
    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        /// Listener name.
        name: &'static str,
        /// Configured address.
        addr: String,
        /// Bind error.
        #[source]
        source: std::io::Error,
    },
    /// A listener failed after it started.
    #[error("{name} listener failed: {source}")]
    Listener {
        /// Listener name.
        name: &'static str,
        /// Serve error.
        #[source]
        source: std::io::Error,
    },
    /// TLS material could not be loaded.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The router could not be built.
    #[error(transparent)]
    Router(#[from] RouteError),
}

/// Entry point for starting a relay.
#[derive(Debug)]
pub struct Relay;

impl Relay {
    /// Bind every listener and start serving.
    ///
    /// Nothing is spawned unless every listener binds.
    pub async fn start(
        config: RelayConfig,
        store: Arc<dyn ChannelStore>,
    ) -> Result<RunningRelay, RelayError> {
        let specs = listener_specs(&config);
        let acceptor = match config.tls.files() {
            Some((cert, key)) => Some(load_acceptor(cert, key)?),
            None => None,
        };

        let mut bound = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = bind(&spec).await?;
            let addr = local_addr(&listener, &spec)?;
            bound.push((spec, listener, addr));
        }

        let registry = Arc::new(ClientRegistry::new());
        let shards = config.shard_map();
        log::info!(
            "[Relay] Node {} in a shard map of {} node(s)",
            shards.local(),
            shards.nodes().len()
        );
        let router = Arc::new(Router::new(
            shards,
            Arc::clone(&registry),
            config.forward_settings(),
            config.push_settings().delivery_timeout,
        )?);

        let (queue, queue_rx) = UpdateQueue::new(config.router.queue_capacity);
        let worker = UpdateWorker::spawn(
            Dispatcher::new(Arc::clone(&store), Arc::clone(&router)),
            queue_rx,
        );

        let listener_token = CancellationToken::new();
        let connection_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let state = AppState {
            queue: queue.clone(),
            registry: Arc::clone(&registry),
            store: Arc::clone(&store),
            router: Arc::clone(&router),
            push: PushContext {
                registry: Arc::clone(&registry),
                shards: router.shards().clone(),
                store: Arc::clone(&store),
                settings: config.push_settings(),
                shutdown: connection_token.clone(),
            },
            connections: Arc::new(Semaphore::new(config.push.max_connections)),
            tracker: tracker.clone(),
            closing: listener_token.clone(),
        };
        let inbound = InboundState {
            router: Arc::clone(&router),
            queue: queue.clone(),
        };

        let (fatal_tx, fatal_rx) = mpsc::channel(bound.len().max(1));
        let mut addrs = Vec::with_capacity(bound.len());
        let mut listener_tasks = Vec::with_capacity(bound.len());

        for (spec, listener, addr) in bound {
            let app = Self::app_for(&spec, &state, &inbound);
            let shutdown = listener_token.clone();
            let fatal = fatal_tx.clone();
            let name = spec.name;
            let tls = if spec.tls { acceptor.clone() } else { None };
            let tracker = tracker.clone();

            listener_tasks.push(tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => serve_tls(listener, acceptor, app, shutdown, tracker).await,
                    None => serve_plain(listener, app, shutdown).await,
                };
                match result {
                    Ok(()) => log::info!("[Relay] Listener '{}' stopped", name),
                    Err(source) => {
                        log::error!("[Relay] Listener '{}' failed: {}", name, source);
                        let _ = fatal.send(RelayError::Listener { name, source }).await;
                    }
                }
            }));
            addrs.push((spec.name, addr));
        }

        log::info!("[Relay] Started pushrelay {}", crate::constants::VERSION);

        Ok(RunningRelay {
            registry,
            router,
            queue,
            worker: Mutex::new(Some(worker)),
            listener_token,
            connection_token,
            tracker,
            listener_tasks: Mutex::new(listener_tasks),
            addrs,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            grace: config.shutdown_grace(),
            stopped: AtomicBool::new(false),
        })
    }

    fn app_for(spec: &ListenerSpec, state: &AppState, inbound: &InboundState) -> axum::Router {
        let mut app = axum::Router::new();
        if spec.serves(Service::Rest) {
            app = app.merge(rest_routes(state.clone()));
        }
        if spec.serves(Service::Push) {
            app = app.merge(push_routes(state.clone()));
        }
        if spec.serves(Service::Shard) {
            app = app.merge(shard_routes(inbound.clone()));
        }
        app
    }
}

/// Handle to a started relay.
#[derive(Debug)]
pub struct RunningRelay {
    registry: Arc<ClientRegistry>,
    router: Arc<Router>,
    queue: UpdateQueue,
    worker: Mutex<Option<UpdateWorker>>,
    listener_token: CancellationToken,
    connection_token: CancellationToken,
    tracker: TaskTracker,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    addrs: Vec<(&'static str, SocketAddr)>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<RelayError>>,
    grace: Duration,
    stopped: AtomicBool,
}

impl RunningRelay {
    /// Bound address of the named listener (`main`, `push`, `shard`).
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, addr)| *addr)
    }

    /// Live connection registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Router of this node.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Intake queue of this node.
    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    /// Push sessions and TLS connections still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has completed or is in progress.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until a listener fails (`Err`) or every listener has stopped (`Ok`).
    pub async fn wait(&self) -> Result<(), RelayError> {
        match self.fatal_rx.lock().await.recv().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop everything in order. Safe to call more than once and from any task;
    /// only the first call does the work and returns `true`.
    pub async fn shutdown(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("[Relay] Shutting down");

        self.listener_token.cancel();
        self.router.close_all();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.stop(self.grace).await;
        }

        self.connection_token.cancel();
        let evicted = self.registry.evict_all();
        if evicted > 0 {
            log::info!("[Relay] Closing {} client connection(s)", evicted);
        }

        self.tracker.close();
        if tokio::time::timeout(self.grace, self.tracker.wait()).await.is_err() {
            log::warn!(
                "[Relay] {} connection task(s) still running after {:?}",
                self.tracker.len(),
                self.grace
            );
        }

        let tasks: Vec<JoinHandle<()>> = self
            .listener_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                log::warn!("[Relay] Aborting listener that did not stop within {:?}", self.grace);
                task.abort();
            }
        }

        log::info!("[Relay] Shutdown complete");
        true
    }
}
