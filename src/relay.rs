//! Relay for the pre-Noise protocol, where every request body is sealed to
//! the server's legacy key and addressed by the client's key in the path.

use crate::body::{copy_headers, error_response, full, transcode, ProxyBody};
use crate::dump::{log_val, DumpConfig};
use crate::error::CodecError;
use crate::key::{MachinePrivate, MachinePublic};
use crate::legacy::{open_json, seal_json, SealedCodec};
use crate::mappoll::wants_compression;
use crate::state::IdentityStore;
use crate::upstream::{UpstreamHttp, DEFAULT_PROTOCOL_VERSION};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

const MACHINE_PREFIX: &str = "/machine/";
const MAP_SUFFIX: &str = "/map";

/// A parsed `/machine/<key>[/map]` path.
#[derive(Debug, PartialEq)]
struct LegacyRoute {
    client: MachinePublic,
    map: bool,
}

impl LegacyRoute {
    fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(MACHINE_PREFIX)?;
        let (hex, map) = match rest.strip_suffix(MAP_SUFFIX) {
            Some(hex) => (hex, true),
            None => (rest, false),
        };
        let client = MachinePublic::from_untyped_hex(hex).ok()?;
        Some(Self { client, map })
    }

    fn upstream_path(&self, substitute: &MachinePublic) -> String {
        let suffix = if self.map { MAP_SUFFIX } else { "" };
        format!("{}{}{}", MACHINE_PREFIX, substitute.untyped_hex(), suffix)
    }
}

/// Whether `path` is addressed to the legacy relay.
pub fn is_legacy_path(path: &str) -> bool {
    LegacyRoute::parse(path).is_some()
}

pub struct LegacyRelay {
    store: Arc<IdentityStore>,
    http: UpstreamHttp,
    dump: DumpConfig,
}

impl LegacyRelay {
    pub fn new(store: Arc<IdentityStore>, http: UpstreamHttp, dump: DumpConfig) -> Self {
        Self { store, http, dump }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        shutdown: &CancellationToken,
    ) -> Response<ProxyBody> {
        let Some(route) = LegacyRoute::parse(req.uri().path()) else {
            return error_response(StatusCode::NOT_FOUND, "404 page not found");
        };
        let span = info_span!("legacy", peer = %route.client.short_string());
        self.relay(req, route, shutdown).instrument(span).await
    }

    async fn relay(
        &self,
        req: Request<Incoming>,
        route: LegacyRoute,
        shutdown: &CancellationToken,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        info!("{} {}", parts.method, parts.uri);
        self.dump.headers(&parts.headers);

        let sealed = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        };

        let request: Value = match open_json(&sealed, self.store.legacy_key(), &route.client) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to open request: {}", e);
                return error_response(StatusCode::BAD_REQUEST, e);
            }
        };
        let plain = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        };
        if route.map {
            if self.dump.mappolls {
                log_val(&plain, "req");
            }
        } else {
            self.dump.body(&plain, "req body");
        }

        let server_legacy = match self.http.fetch_server_keys(DEFAULT_PROTOCOL_VERSION).await {
            Ok(keys) => keys.legacy_public_key,
            Err(e) => return error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
        };
        let substitute = match self.store.lookup_or_provision(&route.client).await {
            Ok(k) => k,
            Err(e) => {
                warn!("failed to look up substitute identity: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };
        info!("got MITM key: {}", substitute.public().short_string());

        let resealed = match seal_json(&request, &substitute, &server_legacy) {
            Ok(b) => b,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        let path = route.upstream_path(&substitute.public());
        let resp = match self
            .http
            .request(parts.method, &path, &parts.headers, resealed.into())
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to proxy request: {:#}", e);
                return error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e));
            }
        };

        info!("upstream response: {}", resp.status());
        self.dump.headers(resp.headers());

        let (resp_parts, resp_body) = resp.into_parts();
        let mut builder = Response::builder().status(resp_parts.status);
        if let Some(headers) = builder.headers_mut() {
            copy_headers(&resp_parts.headers, headers, true);
        }

        let legacy_key = self.store.legacy_key().clone();
        let body = if route.map && resp_parts.status.is_success() {
            let codec = SealedCodec::new(
                wants_compression(&plain),
                (substitute, server_legacy),
                (legacy_key, route.client),
            );
            transcode(codec, resp_body, self.dump.mappolls, shutdown)
        } else {
            let bytes = match resp_body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return error_response(StatusCode::BAD_GATEWAY, e),
            };
            if !resp_parts.status.is_success() || bytes.is_empty() {
                // Error bodies are plain text.
                self.dump.body(&bytes, "resp body");
                full(bytes)
            } else {
                match reseal_response(&bytes, &substitute, &server_legacy, &legacy_key, &route.client) {
                    Ok((plain, sealed)) => {
                        self.dump.body(&plain, "resp body");
                        full(sealed)
                    }
                    Err(e) => {
                        warn!("failed to open upstream response: {}", e);
                        return error_response(StatusCode::BAD_GATEWAY, e);
                    }
                }
            }
        };

        match builder.body(body) {
            Ok(resp) => resp,
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
        }
    }
}

/// Open a response the server sealed for `substitute` and seal it again from
/// the proxy's legacy key to `client`. Returns the plaintext as well.
fn reseal_response(
    sealed: &[u8],
    substitute: &MachinePrivate,
    server_legacy: &MachinePublic,
    legacy_key: &MachinePrivate,
    client: &MachinePublic,
) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    let value: Value = open_json(sealed, substitute, server_legacy)?;
    let plain = serde_json::to_vec(&value)?;
    let resealed = seal_json(&value, legacy_key, client)?;
    Ok((plain, resealed))
}
