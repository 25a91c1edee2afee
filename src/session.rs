//! One intercepted client connection.
//!
//! The inbound handshake reveals the client's machine key. The proxy looks up
//! (or provisions) the substitute identity for that key, opens its own session
//! to the real server with it, and relays HTTP/2 requests between the two
//! until either side goes away.

use crate::body::{empty, error_response, ProxyBody};
use crate::bridge::Bridge;
use crate::dump::DumpConfig;
use crate::error::SessionError;
use crate::key::MachinePublic;
use crate::noise;
use crate::state::IdentityStore;
use crate::upstream::{UpstreamConnector, UpstreamSession};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub struct Interceptor {
    store: Arc<IdentityStore>,
    connector: Arc<dyn UpstreamConnector>,
    dump: DumpConfig,
}

impl Interceptor {
    pub fn new(
        store: Arc<IdentityStore>,
        connector: Arc<dyn UpstreamConnector>,
        dump: DumpConfig,
    ) -> Self {
        Self {
            store,
            connector,
            dump,
        }
    }

    /// Handle an upgrade request for a secure session.
    ///
    /// Both sides are established before the client is switched over, so any
    /// failure up to that point reaches the client as an error response. The
    /// session then runs in the background under a child of `shutdown`.
    pub async fn intercept(
        self: &Arc<Self>,
        mut req: Request<Incoming>,
        shutdown: &CancellationToken,
    ) -> Response<ProxyBody> {
        self.dump.headers(req.headers());

        let accepted = match noise::accept(req.headers(), self.store.noise_key()) {
            Ok(a) => a,
            Err(e) => {
                warn!("noise handshake failed: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };
        let peer = accepted.peer;
        let span = info_span!("session", peer = %peer.short_string());
        let cancel = shutdown.child_token();

        let upstream = match self
            .open_upstream(&peer, accepted.version, cancel.clone())
            .instrument(span.clone())
            .await
        {
            Ok(u) => u,
            Err(e) => {
                cancel.cancel();
                let status = match &e {
                    SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_GATEWAY,
                };
                return error_response(status, e);
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let this = self.clone();
        tokio::spawn(
            async move {
                let _guard = cancel.clone().drop_guard();
                let upgraded = match on_upgrade.await {
                    Ok(u) => u,
                    Err(e) => {
                        warn!("upgrade failed: {}", e);
                        return;
                    }
                };
                let inbound = match accepted
                    .complete(TokioIo::new(upgraded), cancel.clone())
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("failed to complete handshake: {}", e);
                        return;
                    }
                };
                info!("accepted noise connection");
                if let Err(e) = this.serve(inbound, upstream, cancel).await {
                    info!("session ended: {}", e);
                }
            }
            .instrument(span),
        );

        let mut resp = Response::new(empty());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        noise::upgrade_headers(resp.headers_mut());
        resp
    }

    async fn open_upstream(
        &self,
        peer: &MachinePublic,
        version: u16,
        cancel: CancellationToken,
    ) -> Result<UpstreamSession, SessionError> {
        let substitute = match self.store.lookup_or_provision(peer).await {
            Ok(k) => k,
            Err(e) => {
                warn!("failed to look up substitute identity: {}", e);
                return Err(e.into());
            }
        };
        info!("got MITM key: {}", substitute.public().short_string());

        let connect = self.connector.connect(&substitute, version, cancel.clone());
        let upstream = tokio::select! {
            res = connect => res,
            _ = cancel.cancelled() => Err(SessionError::handshake("cancelled")),
        };
        match upstream {
            Ok(u) => {
                info!("connected to upstream");
                Ok(u)
            }
            Err(e) => {
                warn!("failed to create upstream session: {}", e);
                Err(e)
            }
        }
    }

    /// Relay requests from `inbound` to `upstream` until the client closes,
    /// the transport fails, or `cancel` fires. Both sides are closed on return.
    pub async fn serve<IO>(
        &self,
        inbound: IO,
        upstream: UpstreamSession,
        cancel: CancellationToken,
    ) -> Result<(), SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = cancel.clone().drop_guard();
        let bridge = Arc::new(Bridge::new(upstream, self.dump, cancel.clone()));

        let service = service_fn(move |req| {
            let bridge = bridge.clone();
            async move { Ok::<_, Infallible>(bridge.handle(req).await) }
        });
        let conn = http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(inbound), service);

        let result = tokio::select! {
            res = conn => res.map_err(SessionError::from),
            _ = cancel.cancelled() => Ok(()),
        };
        info!("finished serving noise connection");
        result
    }
}
