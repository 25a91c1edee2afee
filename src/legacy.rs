//! Legacy sealed-message codec.
//!
//! Before the Noise transport, each message was JSON, optionally
//! zstd-compressed, then sealed with a NaCl box between the sender's private
//! key and the receiver's public key. Streamed records are additionally
//! length-prefixed; single request and response bodies are not.

use crate::error::CodecError;
use crate::frame::{read_frame, write_frame};
use crate::key::{MachinePrivate, MachinePublic};
use crate::mappoll::{marshal, unmarshal, MapResponse, RecordCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

/// Open one sealed payload and decode it.
pub fn open_record<T: DeserializeOwned>(
    sealed: &[u8],
    compress: bool,
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<T, CodecError> {
    let opened = private
        .open_from(peer, sealed)
        .ok_or(CodecError::Decrypt)?;
    unmarshal(&opened, compress)
}

/// Encode one value and seal it for `peer`.
pub fn seal_record<T: Serialize>(
    value: &T,
    compress: bool,
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<Vec<u8>, CodecError> {
    let data = marshal(value, compress)?;
    private.seal_to(peer, &data).map_err(|_| CodecError::Seal)
}

/// Read and open one framed record. `Ok(None)` marks a clean end of stream.
pub async fn read_sealed<R, T>(
    reader: &mut R,
    compress: bool,
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<Option<T>, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(sealed) => open_record(&sealed, compress, private, peer).map(Some),
        None => Ok(None),
    }
}

/// Seal and write one framed record.
pub async fn write_sealed<W, T>(
    writer: &mut W,
    value: &T,
    compress: bool,
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let sealed = seal_record(value, compress, private, peer)?;
    write_frame(writer, &sealed).await?;
    Ok(())
}

/// JSON-encode `value` and seal it for `peer`, without framing.
pub fn seal_json<T: Serialize>(
    value: &T,
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<Vec<u8>, CodecError> {
    seal_record(value, false, private, peer)
}

/// Open an unframed sealed body from `peer` and JSON-decode it.
pub fn open_json<T: DeserializeOwned>(
    sealed: &[u8],
    private: &MachinePrivate,
    peer: &MachinePublic,
) -> Result<T, CodecError> {
    open_record(sealed, false, private, peer)
}

/// Map poll records on the legacy protocol.
///
/// Upstream records are opened with the substitute identity and re-sealed
/// with the proxy's legacy server identity for the client.
pub struct SealedCodec {
    compress: bool,
    /// Substitute identity and the real server's legacy key.
    upstream: (MachinePrivate, MachinePublic),
    /// Proxy legacy identity and the client's key.
    downstream: (MachinePrivate, MachinePublic),
}

impl SealedCodec {
    pub fn new(
        compress: bool,
        upstream: (MachinePrivate, MachinePublic),
        downstream: (MachinePrivate, MachinePublic),
    ) -> Self {
        Self {
            compress,
            upstream,
            downstream,
        }
    }
}

impl RecordCodec for SealedCodec {
    fn decode(&self, payload: &[u8]) -> Result<MapResponse, CodecError> {
        let (private, peer) = &self.upstream;
        open_record(payload, self.compress, private, peer)
    }

    fn encode(&self, resp: &MapResponse) -> Result<Vec<u8>, CodecError> {
        let (private, peer) = &self.downstream;
        seal_record(resp, self.compress, private, peer)
    }
}
