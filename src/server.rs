//! HTTP/1.1 front door.
//!
//! Routes:
//! - `/key`: the proxy's public keys, so clients pin the proxy instead of the
//!   real server
//! - `/ts2021`: upgrade into an intercepted secure session
//! - `/machine/<key>[/map]`: the legacy sealed protocol
//!
//! Anything else is a 404.

use crate::body::{error_response, full, ProxyBody};
use crate::config::ProxyConfig;
use crate::dump::DumpConfig;
use crate::noise::UPGRADE_PATH;
use crate::relay::{is_legacy_path, LegacyRelay};
use crate::session::Interceptor;
use crate::state::IdentityStore;
use crate::upstream::{NoiseConnector, ServerKeys, UpstreamConnector, UpstreamHttp};
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const KEY_PATH: &str = "/key";

/// Shared state of a running proxy.
pub struct Proxy {
    store: Arc<IdentityStore>,
    interceptor: Arc<Interceptor>,
    legacy: LegacyRelay,
    shutdown: CancellationToken,
}

impl Proxy {
    pub fn new(
        store: Arc<IdentityStore>,
        connector: Arc<dyn UpstreamConnector>,
        http: UpstreamHttp,
        dump: DumpConfig,
    ) -> Self {
        Self {
            interceptor: Arc::new(Interceptor::new(store.clone(), connector, dump)),
            legacy: LegacyRelay::new(store.clone(), http, dump),
            store,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop accepting connections and tear down every running session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until [`Proxy::shutdown`] is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                res = listener.accept() => res?,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream, peer_addr).await {
                    error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        debug!("New connection from {}", peer_addr);

        http1::Builder::new()
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let proxy = self.clone();
                    async move { Ok::<_, Infallible>(proxy.handle_request(req, peer_addr).await) }
                }),
            )
            .with_upgrades()
            .await
            .context("HTTP connection error")?;

        debug!("Connection closed from {}", peer_addr);
        Ok(())
    }

    async fn handle_request(&self, req: Request<Incoming>, peer_addr: SocketAddr) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();

        if path == KEY_PATH {
            self.serve_key(&req)
        } else if path == UPGRADE_PATH {
            info!("got noise connection from {}", peer_addr);
            self.interceptor.intercept(req, &self.shutdown).await
        } else if is_legacy_path(&path) {
            self.legacy.handle(req, &self.shutdown).await
        } else {
            error_response(StatusCode::NOT_FOUND, "404 page not found")
        }
    }

    /// Clients that send a `v` query parameter get both keys as JSON; older
    /// ones get the bare legacy key in hex.
    fn serve_key(&self, req: &Request<Incoming>) -> Response<ProxyBody> {
        let versioned = req
            .uri()
            .query()
            .map(|q| {
                q.split('&')
                    .filter_map(|kv| kv.strip_prefix("v="))
                    .any(|v| !v.is_empty())
            })
            .unwrap_or(false);

        if !versioned {
            return Response::new(full(self.store.legacy_key().public().untyped_hex()));
        }

        let keys = ServerKeys {
            legacy_public_key: self.store.legacy_key().public(),
            public_key: self.store.noise_key().public(),
        };
        match serde_json::to_vec(&keys) {
            Ok(mut body) => {
                body.push(b'\n');
                let mut resp = Response::new(full(body));
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                resp
            }
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to marshal keys"),
        }
    }
}

/// Run the proxy until the listener fails.
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let store = IdentityStore::load(&config.state_file)
        .with_context(|| format!("Failed to load state from {}", config.state_file.display()))?;
    let store = Arc::new(store);
    info!(
        "Proxy keys: legacy {}, noise {}",
        store.legacy_key().public().short_string(),
        store.noise_key().public().short_string()
    );

    let http = UpstreamHttp::new(&config.upstream_url)?;
    let connector = Arc::new(NoiseConnector::new(http.clone()));
    let proxy = Arc::new(Proxy::new(store, connector, http, config.dump));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Proxy listening on {}", config.bind_addr);

    proxy.serve(listener).await
}
