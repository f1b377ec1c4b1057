//! Listener specs, binding, and serve loops.
//!
//! A relay runs one to three listeners, each serving a subset of services:
//!
//! ```text
//! main   host:port          Rest + Push   (Rest only when ws_port is distinct)
//! push   ws_host:ws_port    Push          (only when distinct)
//! shard  0.0.0.0:shard_port Shard         (always plain HTTP)
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service as _;

use super::RelayError;
use crate::config::RelayConfig;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Update intake and status endpoints.
    Rest,
    /// WebSocket push upgrades.
    Push,
    /// Forwarded updates from peers.
    Shard,
}

/// One listener to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Name used in logs and errors.
    pub name: &'static str,
    /// `host:port` to bind.
    pub addr: String,
    /// Services mounted on it.
    pub services: Vec<Service>,
    /// Serve TLS.
    pub tls: bool,
}

impl ListenerSpec {
    /// Whether `service` is mounted here.
    pub fn serves(&self, service: Service) -> bool {
        self.services.contains(&service)
    }
}

/// Listener specs implied by the configuration.
pub fn listener_specs(config: &RelayConfig) -> Vec<ListenerSpec> {
    let tls = config.tls.files().is_some();
    let separate_push = config.separate_push_listener();

    let mut specs = vec![ListenerSpec {
        name: "main",
        addr: format!("{}:{}", config.host, config.port),
        services: if separate_push {
            vec![Service::Rest]
        } else {
            vec![Service::Rest, Service::Push]
        },
        tls,
    }];

    if separate_push {
        if let Some(ws_port) = config.ws_port {
            specs.push(ListenerSpec {
                name: "push",
                addr: format!("{}:{}", config.push_host(), ws_port),
                services: vec![Service::Push],
                tls,
            });
        }
    }

    specs.push(ListenerSpec {
        name: "shard",
        addr: format!("0.0.0.0:{}", config.shard.port),
        services: vec![Service::Shard],
        tls: false,
    });

    specs
}

/// Bind a listener, naming it in the error.
pub async fn bind(spec: &ListenerSpec) -> Result<TcpListener, RelayError> {
    let listener = TcpListener::bind(spec.addr.as_str())
        .await
        .map_err(|source| RelayError::Bind {
            name: spec.name,
            addr: spec.addr.clone(),
            source,
        })?;
    if let Ok(local) = listener.local_addr() {
        log::info!(
            "[Relay] Listener '{}' on {} ({:?}{})",
            spec.name,
            local,
            spec.services,
            if spec.tls { ", tls" } else { "" }
        );
    }
    Ok(listener)
}

/// Serve plain HTTP until `shutdown` fires, then drain in-flight requests.
pub async fn serve_plain(
    listener: TcpListener,
    app: axum::Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Serve HTTPS until `shutdown` fires.
///
/// Each accepted connection gets its own task on `tracker`, so relay
/// shutdown waits for in-flight requests the same way it waits for push
/// sessions.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: axum::Router,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) -> io::Result<()> {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("[Relay] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let tower_service = app.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::debug!("[Relay] TLS handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    log::debug!("[Relay] TLS handshake with {} timed out", peer);
                    return;
                }
            };

            let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
                tower_service.clone().call(request)
            });

            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), hyper_service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        log::debug!("[Relay] Connection from {} ended: {}", peer, e);
                    }
                }
                () = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }

    Ok(())
}

/// Local address of a bound listener, for logs and tests.
pub fn local_addr(listener: &TcpListener, spec: &ListenerSpec) -> Result<SocketAddr, RelayError> {
    listener.local_addr().map_err(|source| RelayError::Bind {
        name: spec.name,
        addr: spec.addr.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_specs_share_main_listener() {
        let specs = listener_specs(&RelayConfig::default());
        assert_eq!(specs.len(), 2);

        assert_eq!(specs[0].name, "main");
        assert_eq!(specs[0].addr, "localhost:8080");
        assert!(specs[0].serves(Service::Rest));
        assert!(specs[0].serves(Service::Push));
        assert!(!specs[0].tls);

        assert_eq!(specs[1].name, "shard");
        assert_eq!(specs[1].addr, "0.0.0.0:3000");
        assert_eq!(specs[1].services, vec![Service::Shard]);
    }

    #[test]
    fn test_distinct_ws_port_splits_push() {
        let config = RelayConfig {
            ws_port: Some(8081),
            ..RelayConfig::default()
        };
        let specs = listener_specs(&config);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].services, vec![Service::Rest]);
        assert_eq!(specs[1].name, "push");
        assert_eq!(specs[1].addr, "localhost:8081");
        assert_eq!(specs[1].services, vec![Service::Push]);
    }

    #[test]
    fn test_tls_applies_to_public_listeners_only() {
        let mut config = RelayConfig {
            ws_port: Some(8443),
            ..RelayConfig::default()
        };
        config.tls.cert_file = Some(PathBuf::from("cert.pem"));
        config.tls.key_file = Some(PathBuf::from("key.pem"));

        let specs = listener_specs(&config);
        assert!(specs[0].tls);
        assert!(specs[1].tls);
        assert!(!specs[2].tls);
    }

    #[tokio::test]
    async fn test_bind_conflict_names_listener() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let spec = ListenerSpec {
            name: "main",
            addr: taken.local_addr().unwrap().to_string(),
            services: vec![Service::Rest],
            tls: false,
        };

        let err = bind(&spec).await.unwrap_err();
        assert!(
            matches!(err, RelayError::Bind { name: "main", .. }),
            "unexpected error: {err}"
        );
    }
}
