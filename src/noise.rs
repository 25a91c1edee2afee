//! Noise IK secure sessions carried over an HTTP/1.1 upgrade.
//!
//! The initiator sends its handshake message in the `X-Tailscale-Handshake`
//! header of a `GET /ts2021` upgrade request. The responder answers
//! `101 Switching Protocols` and writes its handshake reply as the first bytes
//! of the upgraded stream. After that both directions carry records:
//!
//! ```text
//! initiation: [version u16 BE][type=1][len u16 BE][noise message]
//! response:   [type=2][len u16 BE][noise message]
//! record:     [type=4][len u16 BE][ciphertext]
//! ```
//!
//! Records are at most 4096 bytes on the wire. The encrypted stream is exposed
//! to callers as a plain in-memory duplex pipe with two pump tasks behind it.
//!
//! Record nonces follow the standard Noise encoding (a little-endian counter),
//! so both ends must run this adapter. Peers that put a big-endian counter in
//! the nonce, as stock control clients do, cannot decrypt these records.

use crate::key::{MachinePrivate, MachinePublic};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use snow::{HandshakeState, StatelessTransportState};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const UPGRADE_PROTOCOL: &str = "tailscale-control-protocol";
pub const HANDSHAKE_HEADER: &str = "x-tailscale-handshake";
pub const UPGRADE_PATH: &str = "/ts2021";

const NOISE_PARAMS: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";
const PROLOGUE_PREFIX: &str = "Tailscale Control Protocol v";

const MSG_INITIATION: u8 = 1;
const MSG_RESPONSE: u8 = 2;
const MSG_RECORD: u8 = 4;

const HEADER_LEN: usize = 3;
const INITIATION_HEADER_LEN: usize = 5;
const TAG_LEN: usize = 16;
const MAX_MESSAGE: usize = 4096;
const MAX_CIPHERTEXT: usize = MAX_MESSAGE - HEADER_LEN;
const MAX_PLAINTEXT: usize = MAX_CIPHERTEXT - TAG_LEN;

/// Buffer between the pump tasks and the application side.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("noise: {0}")]
    Snow(#[from] snow::Error),

    #[error("malformed handshake: {0}")]
    Malformed(&'static str),

    #[error("unexpected message type {0}")]
    UnexpectedType(u8),

    #[error("noise i/o: {0}")]
    Io(#[from] io::Error),
}

fn builder_params() -> Result<snow::params::NoiseParams, NoiseError> {
    Ok(NOISE_PARAMS.parse()?)
}

fn prologue(version: u16) -> Vec<u8> {
    format!("{PROLOGUE_PREFIX}{version}").into_bytes()
}

/// First half of an outbound handshake.
pub struct Initiation {
    state: HandshakeState,
    message: Vec<u8>,
}

impl Initiation {
    /// Start a handshake as `client` toward the server static key `server`.
    pub fn new(
        client: &MachinePrivate,
        server: &MachinePublic,
        version: u16,
    ) -> Result<Self, NoiseError> {
        let local = client.to_bytes();
        let prologue = prologue(version);
        let mut state = snow::Builder::new(builder_params()?)
            .local_private_key(&local)
            .remote_public_key(server.as_bytes())
            .prologue(&prologue)
            .build_initiator()?;

        let mut buf = vec![0u8; MAX_MESSAGE];
        let len = state.write_message(&[], &mut buf)?;

        let mut message = Vec::with_capacity(INITIATION_HEADER_LEN + len);
        message.extend_from_slice(&version.to_be_bytes());
        message.push(MSG_INITIATION);
        message.extend_from_slice(&(len as u16).to_be_bytes());
        message.extend_from_slice(&buf[..len]);

        Ok(Self { state, message })
    }

    /// Value for the handshake header of the upgrade request.
    pub fn header_value(&self) -> String {
        STANDARD.encode(&self.message)
    }

    /// Read the responder's reply from `io` and switch to transport mode.
    pub async fn finish<IO>(mut self, io: &mut IO) -> Result<StatelessTransportState, NoiseError>
    where
        IO: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        io.read_exact(&mut header).await?;
        if header[0] != MSG_RESPONSE {
            return Err(NoiseError::UnexpectedType(header[0]));
        }
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        io.read_exact(&mut payload).await?;

        let mut scratch = vec![0u8; MAX_MESSAGE];
        self.state.read_message(&payload, &mut scratch)?;
        Ok(self.state.into_stateless_transport_mode()?)
    }
}

/// Responder side of a handshake whose initiation has been processed but
/// whose reply has not been sent yet.
pub struct Accepted {
    pub peer: MachinePublic,
    pub version: u16,
    response: Vec<u8>,
    transport: StatelessTransportState,
}

impl Accepted {
    /// Write the handshake reply onto the upgraded stream and start pumping
    /// records. The returned pipe carries plaintext.
    pub async fn complete<IO>(
        self,
        mut io: IO,
        cancel: CancellationToken,
    ) -> Result<DuplexStream, NoiseError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        io.write_all(&self.response).await?;
        io.flush().await?;
        Ok(spawn_transport(io, self.transport, cancel))
    }
}

/// Check an upgrade request and process its handshake initiation as `server`.
pub fn accept(headers: &HeaderMap, server: &MachinePrivate) -> Result<Accepted, NoiseError> {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case(UPGRADE_PROTOCOL) {
        return Err(NoiseError::Malformed("missing upgrade header"));
    }

    let init = headers
        .get(HANDSHAKE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(NoiseError::Malformed("missing handshake header"))?;
    let init = STANDARD
        .decode(init)
        .map_err(|_| NoiseError::Malformed("handshake header is not base64"))?;

    respond(&init, server)
}

fn respond(init: &[u8], server: &MachinePrivate) -> Result<Accepted, NoiseError> {
    if init.len() < INITIATION_HEADER_LEN {
        return Err(NoiseError::Malformed("short initiation"));
    }
    let version = u16::from_be_bytes([init[0], init[1]]);
    if init[2] != MSG_INITIATION {
        return Err(NoiseError::UnexpectedType(init[2]));
    }
    let len = u16::from_be_bytes([init[3], init[4]]) as usize;
    let payload = &init[INITIATION_HEADER_LEN..];
    if payload.len() != len {
        return Err(NoiseError::Malformed("initiation length mismatch"));
    }

    let local = server.to_bytes();
    let prologue = prologue(version);
    let mut state = snow::Builder::new(builder_params()?)
        .local_private_key(&local)
        .prologue(&prologue)
        .build_responder()?;

    let mut scratch = vec![0u8; MAX_MESSAGE];
    state.read_message(payload, &mut scratch)?;
    let peer = state
        .get_remote_static()
        .and_then(MachinePublic::from_slice)
        .ok_or(NoiseError::Malformed("no initiator static key"))?;

    let mut buf = vec![0u8; MAX_MESSAGE];
    let len = state.write_message(&[], &mut buf)?;
    let mut response = Vec::with_capacity(HEADER_LEN + len);
    response.push(MSG_RESPONSE);
    response.extend_from_slice(&(len as u16).to_be_bytes());
    response.extend_from_slice(&buf[..len]);

    Ok(Accepted {
        peer,
        version,
        response,
        transport: state.into_stateless_transport_mode()?,
    })
}

/// Headers a responder sends along with `101 Switching Protocols`.
pub fn upgrade_headers(headers: &mut HeaderMap) {
    headers.insert(UPGRADE, hyper::header::HeaderValue::from_static(UPGRADE_PROTOCOL));
    headers.insert(CONNECTION, hyper::header::HeaderValue::from_static("upgrade"));
}

/// Run the record layer over `io` and hand back the plaintext side.
///
/// Both pumps stop when `cancel` fires, when the application side is dropped,
/// or when the wire side closes.
pub fn spawn_transport<IO>(
    io: IO,
    transport: StatelessTransportState,
    cancel: CancellationToken,
) -> DuplexStream
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (app, pump) = tokio::io::duplex(PIPE_CAPACITY);
    let transport = Arc::new(transport);
    let (wire_rx, wire_tx) = tokio::io::split(io);
    let (plain_rx, plain_tx) = tokio::io::split(pump);

    tokio::spawn({
        let transport = transport.clone();
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                res = seal_records(plain_rx, wire_tx, &transport) => {
                    if let Err(e) = res {
                        debug!("noise write side closed: {}", e);
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    tokio::spawn(async move {
        tokio::select! {
            res = open_records(wire_rx, plain_tx, &transport) => {
                if let Err(e) = res {
                    debug!("noise read side closed: {}", e);
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    app
}

async fn seal_records<R, W>(
    mut plain: R,
    mut wire: W,
    transport: &StatelessTransportState,
) -> Result<(), NoiseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_PLAINTEXT];
    let mut out = vec![0u8; MAX_MESSAGE];
    let mut nonce = 0u64;

    loop {
        let n = plain.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let len = transport.write_message(nonce, &buf[..n], &mut out[HEADER_LEN..])?;
        nonce += 1;

        out[0] = MSG_RECORD;
        out[1..HEADER_LEN].copy_from_slice(&(len as u16).to_be_bytes());
        wire.write_all(&out[..HEADER_LEN + len]).await?;
        wire.flush().await?;
    }

    wire.shutdown().await?;
    Ok(())
}

async fn open_records<R, W>(
    mut wire: R,
    mut plain: W,
    transport: &StatelessTransportState,
) -> Result<(), NoiseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ciphertext = vec![0u8; MAX_CIPHERTEXT];
    let mut out = vec![0u8; MAX_CIPHERTEXT];
    let mut nonce = 0u64;

    loop {
        let mut header = [0u8; HEADER_LEN];
        match wire.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if header[0] != MSG_RECORD {
            return Err(NoiseError::UnexpectedType(header[0]));
        }
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        if len > MAX_CIPHERTEXT {
            return Err(NoiseError::Malformed("record too large"));
        }

        wire.read_exact(&mut ciphertext[..len]).await?;
        let n = transport.read_message(nonce, &ciphertext[..len], &mut out)?;
        nonce += 1;

        plain.write_all(&out[..n]).await?;
        plain.flush().await?;
    }

    plain.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run both handshake halves over an in-memory pipe.
    async fn connected_pair(
        client: &MachinePrivate,
        server: &MachinePrivate,
    ) -> (DuplexStream, DuplexStream, MachinePublic, u16) {
        let (mut client_wire, server_wire) = tokio::io::duplex(PIPE_CAPACITY);
        let init = Initiation::new(client, &server.public(), 68).unwrap();

        let mut headers = HeaderMap::new();
        upgrade_headers(&mut headers);
        headers.insert(HANDSHAKE_HEADER, init.header_value().parse().unwrap());

        let accepted = accept(&headers, server).unwrap();
        let (peer, version) = (accepted.peer, accepted.version);
        let cancel = CancellationToken::new();
        let server_app = accepted
            .complete(server_wire, cancel.clone())
            .await
            .unwrap();

        let transport = init.finish(&mut client_wire).await.unwrap();
        let client_app = spawn_transport(client_wire, transport, cancel);
        (client_app, server_app, peer, version)
    }

    #[tokio::test]
    async fn test_handshake_reveals_initiator() {
        let client = MachinePrivate::generate();
        let server = MachinePrivate::generate();
        let (_c, _s, peer, version) = connected_pair(&client, &server).await;
        assert_eq!(peer, client.public());
        assert_eq!(version, 68);
    }

    #[tokio::test]
    async fn test_records_cross_in_both_directions() {
        let client = MachinePrivate::generate();
        let server = MachinePrivate::generate();
        let (mut c, mut s, _, _) = connected_pair(&client, &server).await;

        // Larger than one record so the payload is split.
        let big: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let expected = big.clone();
        let writer = tokio::spawn(async move {
            c.write_all(&big).await.unwrap();
            c
        });

        let mut got = vec![0u8; expected.len()];
        s.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        let mut c = writer.await.unwrap();
        s.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn test_wrong_server_key_fails_handshake() {
        let client = MachinePrivate::generate();
        let server = MachinePrivate::generate();
        let other = MachinePrivate::generate();

        let init = Initiation::new(&client, &other.public(), 1).unwrap();
        let mut headers = HeaderMap::new();
        upgrade_headers(&mut headers);
        headers.insert(HANDSHAKE_HEADER, init.header_value().parse().unwrap());

        assert!(matches!(accept(&headers, &server), Err(NoiseError::Snow(_))));
    }

    #[test]
    fn test_accept_requires_upgrade_headers() {
        let server = MachinePrivate::generate();
        let headers = HeaderMap::new();
        assert!(matches!(
            accept(&headers, &server),
            Err(NoiseError::Malformed(_))
        ));

        let mut headers = HeaderMap::new();
        upgrade_headers(&mut headers);
        headers.insert(HANDSHAKE_HEADER, "%%%".parse().unwrap());
        assert!(matches!(
            accept(&headers, &server),
            Err(NoiseError::Malformed(_))
        ));
    }
}
