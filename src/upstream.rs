//! Outbound side of the proxy.
//!
//! [`UpstreamHttp`] speaks plain HTTP/1.1 (over TLS for `https` URLs) to the
//! real control server: key discovery, legacy requests, and the upgrade that
//! opens a secure session. [`UpstreamSession`] is HTTP/2 running inside such a
//! session, opened with a substitute identity.

use crate::body::copy_headers;
use crate::error::SessionError;
use crate::key::{MachinePrivate, MachinePublic};
use crate::noise::{self, Initiation, HANDSHAKE_HEADER, UPGRADE_PATH};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::{http1, http2};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Protocol version used when the client did not tell us one.
pub const DEFAULT_PROTOCOL_VERSION: u16 = 68;

/// Public keys a control server advertises on `/key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerKeys {
    pub legacy_public_key: MachinePublic,
    pub public_key: MachinePublic,
}

/// Byte stream to the upstream server, with or without TLS.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// HTTP/1.1 client for the real control server.
#[derive(Clone)]
pub struct UpstreamHttp {
    authority: String,
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
}

impl UpstreamHttp {
    pub fn new(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Invalid upstream URL {}", url))?;

        let tls = match uri.scheme_str() {
            Some("https") | None => Some(tls_connector()),
            Some("http") => None,
            Some(other) => bail!("Unsupported upstream scheme {}", other),
        };
        // IPv6 literals keep their brackets in the URI but not when dialing.
        let host = uri
            .host()
            .with_context(|| format!("Upstream URL {} has no host", url))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if tls.is_some() { 443 } else { 80 });
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| host.clone());

        Ok(Self {
            authority,
            host,
            port,
            tls,
        })
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamIo>> {
        debug!("Connecting to {}:{}", self.host, self.port);

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", self.host, self.port))?;

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let server_name = self
            .host
            .clone()
            .try_into()
            .context("Invalid server name")?;
        let tls_stream = tls
            .connect(server_name, stream)
            .await
            .context("Upstream TLS handshake failed")?;
        Ok(Box::new(tls_stream))
    }

    /// Send one request on a fresh connection. The request's `Host` is set to
    /// the upstream authority.
    pub async fn send(&self, mut request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let host = HeaderValue::from_str(&self.authority).context("Invalid upstream host")?;
        request.headers_mut().insert(HOST, host);

        let io = self.connect().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .context("Upstream HTTP handshake failed")?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection closed: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .context("Upstream request failed")
    }

    /// Forward a request, copying end-to-end headers from `headers`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(body))
            .context("Failed to build upstream request")?;
        copy_headers(headers, request.headers_mut(), true);
        self.send(request).await
    }

    /// Ask the server for its current public keys.
    pub async fn fetch_server_keys(&self, version: u16) -> Result<ServerKeys> {
        let path = format!("/key?v={}", version);
        let response = self
            .request(Method::GET, &path, &HeaderMap::new(), Bytes::new())
            .await?;

        let status = response.status();
        let body = response
            .collect()
            .await
            .context("Failed to read key response")?
            .to_bytes();
        if !status.is_success() {
            bail!(
                "Fetching server keys: {} {}",
                status,
                String::from_utf8_lossy(&body)
            );
        }
        serde_json::from_slice(&body).context("Failed to parse server keys")
    }
}

fn tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(tls_config))
}

/// Request-response channel inside an established upstream secure session.
///
/// Dropping the session tears down its connection task.
pub struct UpstreamSession {
    sender: http2::SendRequest<Full<Bytes>>,
    conn: JoinHandle<()>,
}

impl UpstreamSession {
    /// Run the HTTP/2 client handshake over an already secured stream.
    pub async fn handshake<IO>(io: IO) -> Result<Self, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
        let conn = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream session closed: {}", e);
            }
        });
        Ok(Self { sender, conn })
    }

    pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, SessionError> {
        let mut sender = self.sender.clone();
        sender
            .ready()
            .await
            .map_err(|e| SessionError::upstream(e.to_string()))?;
        sender
            .send_request(request)
            .await
            .map_err(|e| SessionError::upstream(e.to_string()))
    }

    pub fn close(self) {
        debug!("closing upstream session");
    }
}

impl Drop for UpstreamSession {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

/// Opens upstream sessions on behalf of intercepted clients.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect as `identity`, announcing the same protocol `version` the
    /// client used. Background work stops when `cancel` fires.
    async fn connect(
        &self,
        identity: &MachinePrivate,
        version: u16,
        cancel: CancellationToken,
    ) -> Result<UpstreamSession, SessionError>;
}

/// Connector that dials the real control server.
pub struct NoiseConnector {
    http: UpstreamHttp,
}

impl NoiseConnector {
    pub fn new(http: UpstreamHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl UpstreamConnector for NoiseConnector {
    async fn connect(
        &self,
        identity: &MachinePrivate,
        version: u16,
        cancel: CancellationToken,
    ) -> Result<UpstreamSession, SessionError> {
        let keys = self
            .http
            .fetch_server_keys(version)
            .await
            .map_err(|e| SessionError::handshake(format!("{:#}", e)))?;

        let init = Initiation::new(identity, &keys.public_key, version)
            .map_err(|e| SessionError::handshake(e.to_string()))?;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(UPGRADE_PATH)
            .header(HANDSHAKE_HEADER, init.header_value())
            .body(Full::new(Bytes::new()))
            .map_err(|e| SessionError::handshake(e.to_string()))?;
        noise::upgrade_headers(request.headers_mut());

        let response = self
            .http
            .send(request)
            .await
            .map_err(|e| SessionError::handshake(format!("{:#}", e)))?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(SessionError::handshake(format!(
                "unexpected upgrade status {}",
                response.status()
            )));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| SessionError::handshake(e.to_string()))?;
        let mut io = TokioIo::new(upgraded);
        let transport = init
            .finish(&mut io)
            .await
            .map_err(|e| SessionError::handshake(e.to_string()))?;

        let stream = noise::spawn_transport(io, transport, cancel);
        UpstreamSession::handshake(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::server::conn::{http1 as server_http1, http2 as server_http2};
    use hyper::service::service_fn;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    #[test]
    fn test_upstream_url_parsing() {
        let http = UpstreamHttp::new("https://controlplane.example.com").unwrap();
        assert_eq!(http.port, 443);
        assert!(http.tls.is_some());
        assert_eq!(http.authority, "controlplane.example.com");

        let http = UpstreamHttp::new("http://127.0.0.1:9000").unwrap();
        assert_eq!(http.host, "127.0.0.1");
        assert_eq!(http.port, 9000);
        assert!(http.tls.is_none());

        let http = UpstreamHttp::new("http://[::1]:9000").unwrap();
        assert_eq!(http.host, "::1");
        assert_eq!(http.authority, "[::1]:9000");

        assert!(UpstreamHttp::new("ftp://controlplane.example.com").is_err());
        assert!(UpstreamHttp::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_fetch_server_keys() {
        let keys = ServerKeys {
            legacy_public_key: MachinePrivate::generate().public(),
            public_key: MachinePrivate::generate().public(),
        };
        let body = serde_json::to_vec(&keys).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| {
                let body = body.clone();
                async move {
                    assert_eq!(req.uri().path(), "/key");
                    assert_eq!(req.uri().query(), Some("v=68"));
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                }
            });
            let _ = server_http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let http = UpstreamHttp::new(&format!("http://{}", addr)).unwrap();
        let got = http
            .fetch_server_keys(DEFAULT_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert_eq!(got, keys);
    }

    #[tokio::test]
    async fn test_session_round_trip_over_pipe() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                let path = req.uri().path().to_string();
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(path))))
            });
            let _ = server_http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(server_io), service)
                .await;
        });

        let session = UpstreamSession::handshake(client_io).await.unwrap();
        let request = Request::builder()
            .uri("https://unused/machine/whoami")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = session.send(request).await.unwrap();
        let body = response.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/machine/whoami");
        session.close();
    }
}
