//! Relays the requests of one intercepted client to its upstream session.

use crate::body::{copy_headers, error_response, full, transcode, ProxyBody};
use crate::dump::{log_val, DumpConfig};
use crate::mappoll::{wants_compression, PlainCodec, MAP_PATH};
use crate::upstream::UpstreamSession;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Authority written into every upstream request. The secure session already
/// determines the destination.
const UPSTREAM_AUTHORITY: &str = "unused";

pub struct Bridge {
    upstream: UpstreamSession,
    dump: DumpConfig,
    cancel: CancellationToken,
    next_id: AtomicU32,
}

impl Bridge {
    pub fn new(upstream: UpstreamSession, dump: DumpConfig, cancel: CancellationToken) -> Self {
        Self {
            upstream,
            dump,
            cancel,
            next_id: AtomicU32::new(1),
        }
    }

    /// Forward one request. Failures are reported to the client as error
    /// responses and never end the session.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.forward(req, id).instrument(info_span!("req", id)).await
    }

    async fn forward(&self, req: Request<Incoming>, id: u32) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        info!("{} {}", parts.method, parts.uri);
        self.dump.headers(&parts.headers);

        let req_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read request body: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };

        let is_map = parts.uri.path() == MAP_PATH;
        if !is_map {
            self.dump.body(&req_body, "req body");
        }

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut upstream_req = match Request::builder()
            .method(parts.method.clone())
            .uri(format!("https://{}{}", UPSTREAM_AUTHORITY, path))
            .body(Full::new(req_body.clone()))
        {
            Ok(r) => r,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        };
        copy_headers(&parts.headers, upstream_req.headers_mut(), false);

        let resp = match self.upstream.send(upstream_req).await {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to proxy request: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, e);
            }
        };

        info!("upstream response: {}", resp.status());
        self.dump.headers(resp.headers());

        let (resp_parts, resp_body) = resp.into_parts();
        let mut builder = Response::builder().status(resp_parts.status);
        if let Some(headers) = builder.headers_mut() {
            copy_headers(&resp_parts.headers, headers, is_map);
        }

        let body = if is_map {
            info_span!("mappoll", id).in_scope(|| {
                if self.dump.mappolls {
                    log_val(&req_body, "req");
                }
                let codec = PlainCodec::new(wants_compression(&req_body));
                transcode(codec, resp_body, self.dump.mappolls, &self.cancel)
            })
        } else {
            match resp_body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    self.dump.body(&bytes, "resp body");
                    full(bytes)
                }
                Err(e) => {
                    warn!("failed to read response body: {}", e);
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
                }
            }
        };

        match builder.body(body) {
            Ok(resp) => resp,
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
        }
    }
}
