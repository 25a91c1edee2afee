//! Map poll transcoding.
//!
//! A map poll is the one long-lived streaming exchange: upstream writes a
//! sequence of framed map responses and the client consumes them as they
//! arrive. Each record is decoded, has its dial plan removed, re-encoded and
//! flushed downstream before the next one is read.

use crate::dump::log_val;
use crate::error::{CodecError, FrameError};
use crate::frame::{read_frame, write_frame, MAX_FRAME_LEN};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Read};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Request path of the streaming endpoint.
pub const MAP_PATH: &str = "/machine/map";

const ZSTD_MARKER: &[u8] = br#""Compress":"zstd""#;

/// Largest record accepted after decompression.
pub const MAX_DECODED_LEN: usize = 16 * MAX_FRAME_LEN;

/// Whether the map request asked for zstd-compressed records.
///
/// This is a literal substring match on the raw request body, kept as-is for
/// compatibility with how clients spell the field.
pub fn wants_compression(request_body: &[u8]) -> bool {
    request_body
        .windows(ZSTD_MARKER.len())
        .any(|w| w == ZSTD_MARKER)
}

/// One streamed state update. Only the dial plan is interpreted; every other
/// field passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapResponse {
    #[serde(
        rename = "ControlDialPlan",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub control_dial_plan: Option<Value>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// JSON-encode `value`, then zstd-compress it when `compress` is set.
pub fn marshal<T: Serialize>(value: &T, compress: bool) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value)?;
    if compress {
        return zstd::stream::encode_all(json.as_slice(), 0).map_err(CodecError::Compression);
    }
    Ok(json)
}

/// Inverse of [`marshal`].
pub fn unmarshal<T: DeserializeOwned>(data: &[u8], compress: bool) -> Result<T, CodecError> {
    if compress {
        return Ok(serde_json::from_slice(&decompress(data)?)?);
    }
    Ok(serde_json::from_slice(data)?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let decoder = zstd::stream::read::Decoder::new(data).map_err(CodecError::Compression)?;
    let mut decoded = Vec::new();
    decoder
        .take(MAX_DECODED_LEN as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(CodecError::Compression)?;
    if decoded.len() > MAX_DECODED_LEN {
        return Err(CodecError::Compression(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record decompresses past {} bytes", MAX_DECODED_LEN),
        )));
    }
    Ok(decoded)
}

/// Turns frame payloads into map responses and back.
pub trait RecordCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<MapResponse, CodecError>;
    fn encode(&self, resp: &MapResponse) -> Result<Vec<u8>, CodecError>;
}

/// Records carried inside an already encrypted transport.
#[derive(Debug, Clone, Copy)]
pub struct PlainCodec {
    compress: bool,
}

impl PlainCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }
}

impl RecordCodec for PlainCodec {
    fn decode(&self, payload: &[u8]) -> Result<MapResponse, CodecError> {
        unmarshal(payload, self.compress)
    }

    fn encode(&self, resp: &MapResponse) -> Result<Vec<u8>, CodecError> {
        marshal(resp, self.compress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Running,
    /// Upstream closed the stream at a record boundary
    Done,
    /// A read, decode or write failed; nothing further was emitted
    Failed,
    /// The owning session went away
    Cancelled,
}

/// Record-by-record relay for one map poll.
pub struct MapPoll<C> {
    codec: C,
    dump: bool,
    state: PollState,
    records: usize,
}

impl<C: RecordCodec> MapPoll<C> {
    pub fn new(codec: C, dump: bool) -> Self {
        Self {
            codec,
            dump,
            state: PollState::Running,
            records: 0,
        }
    }

    /// Records written downstream so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Relay records from `src` to `dst` until the stream ends, something
    /// fails, or `cancel` fires.
    pub async fn run<R, W>(
        &mut self,
        src: &mut R,
        dst: &mut W,
        cancel: &CancellationToken,
    ) -> PollState
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while self.state == PollState::Running {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                step = self.step(src, dst) => Some(step),
            };

            match step {
                None => {
                    debug!("map poll cancelled after {} records", self.records);
                    self.state = PollState::Cancelled;
                }
                Some(Ok(true)) => self.records += 1,
                Some(Ok(false)) => {
                    debug!("map poll finished after {} records", self.records);
                    self.state = PollState::Done;
                }
                Some(Err(e)) => {
                    warn!("map poll: {}", e);
                    self.state = PollState::Failed;
                }
            }
        }
        self.state
    }

    /// Relay a single record. Returns `Ok(false)` on clean end of stream.
    async fn step<R, W>(&self, src: &mut R, dst: &mut W) -> Result<bool, CodecError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(payload) = read_frame(src).await? else {
            return Ok(false);
        };

        let mut resp = self.codec.decode(&payload)?;

        // Upstream addressing is meaningless once the proxy sits in between.
        resp.control_dial_plan = None;

        if self.dump {
            log_val(&marshal(&resp, false)?, "resp");
        }

        let out = self.codec.encode(&resp)?;
        write_frame(dst, &out).await?;
        dst.flush().await.map_err(FrameError::from)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn record(seq: u64) -> Value {
        json!({
            "KeepAlive": false,
            "Seq": seq,
            "Node": { "Name": format!("node-{seq}") },
            "ControlDialPlan": { "Candidates": [{ "IP": "10.0.0.1", "Priority": 1 }] },
            "Domain": "example.ts.net",
        })
    }

    async fn upstream_stream(records: &[Value], compress: bool) -> Vec<u8> {
        let mut wire = Vec::new();
        for r in records {
            write_frame(&mut wire, &marshal(r, compress).unwrap())
                .await
                .unwrap();
        }
        wire
    }

    async fn decode_all(wire: &[u8], compress: bool) -> Vec<Value> {
        let mut reader = wire;
        let mut out = Vec::new();
        while let Some(payload) = read_frame(&mut reader).await.unwrap() {
            out.push(unmarshal(&payload, compress).unwrap());
        }
        out
    }

    /// Sink that records how many bytes had been written at each flush.
    #[derive(Default)]
    struct FlushLog {
        data: Vec<u8>,
        flushes: Vec<usize>,
    }

    impl AsyncWrite for FlushLog {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            let len = self.data.len();
            self.flushes.push(len);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_wants_compression() {
        assert!(wants_compression(br#"{"Version":68,"Compress":"zstd","Stream":true}"#));
        assert!(!wants_compression(br#"{"Version":68,"Compress":""}"#));
        assert!(!wants_compression(br#"{"Compress": "zstd"}"#));
        assert!(!wants_compression(b""));
    }

    #[test]
    fn test_dial_plan_only_field_dropped() {
        let input = record(7);
        let mut resp: MapResponse = serde_json::from_value(input.clone()).unwrap();
        assert!(resp.control_dial_plan.is_some());
        resp.control_dial_plan = None;

        let mut expected = input;
        expected.as_object_mut().unwrap().remove("ControlDialPlan");
        assert_eq!(serde_json::to_value(&resp).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_three_records_then_close() {
        for compress in [false, true] {
            let input: Vec<_> = (1..=3).map(record).collect();
            let wire = upstream_stream(&input, compress).await;

            let mut poll = MapPoll::new(PlainCodec::new(compress), false);
            let mut src = wire.as_slice();
            let mut dst = FlushLog::default();
            let state = poll.run(&mut src, &mut dst, &CancellationToken::new()).await;

            assert_eq!(state, PollState::Done);
            assert_eq!(poll.records(), 3);

            let output = decode_all(&dst.data, compress).await;
            assert_eq!(output.len(), 3);
            for (out, mut inp) in output.into_iter().zip(input) {
                inp.as_object_mut().unwrap().remove("ControlDialPlan");
                assert_eq!(out, inp);
            }

            // One flush per record, each after that record's bytes landed.
            assert_eq!(dst.flushes.len(), 3);
            let mut reader = dst.data.as_slice();
            let mut offset = 0;
            for flushed_at in &dst.flushes {
                let payload = read_frame(&mut reader).await.unwrap().unwrap();
                offset += 4 + payload.len();
                assert_eq!(*flushed_at, offset);
            }
        }
    }

    #[tokio::test]
    async fn test_corrupt_compressed_record_fails() {
        let good = upstream_stream(&[record(1)], true).await;
        let mut wire = good.clone();
        write_frame(&mut wire, b"definitely not zstd").await.unwrap();
        wire.extend_from_slice(&good);

        let mut poll = MapPoll::new(PlainCodec::new(true), false);
        let mut src = wire.as_slice();
        let mut dst = Vec::new();
        let state = poll.run(&mut src, &mut dst, &CancellationToken::new()).await;

        assert_eq!(state, PollState::Failed);
        assert_eq!(poll.records(), 1);
        assert_eq!(decode_all(&dst, true).await.len(), 1);
    }

    #[test]
    fn test_decompression_is_bounded() {
        let bomb = zstd::stream::encode_all(&vec![b' '; MAX_DECODED_LEN + 1][..], 3).unwrap();
        assert!(bomb.len() <= MAX_FRAME_LEN);
        let err = unmarshal::<Value>(&bomb, true).unwrap_err();
        assert!(matches!(err, CodecError::Compression(_)));

        let at_limit = vec![b' '; MAX_DECODED_LEN - 2];
        let mut json = b"1".to_vec();
        json.extend_from_slice(&at_limit);
        let packed = zstd::stream::encode_all(json.as_slice(), 0).unwrap();
        assert_eq!(unmarshal::<Value>(&packed, true).unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_oversized_record_fails() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((2u32 << 20).to_le_bytes()));

        let mut poll = MapPoll::new(PlainCodec::new(false), false);
        let mut src = wire.as_slice();
        let mut dst = Vec::new();
        assert_eq!(
            poll.run(&mut src, &mut dst, &CancellationToken::new()).await,
            PollState::Failed
        );
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_poll() {
        let (_upstream, mut src) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut poll = MapPoll::new(PlainCodec::new(false), false);

        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });

        let mut dst = Vec::new();
        assert_eq!(
            poll.run(&mut src, &mut dst, &cancel).await,
            PollState::Cancelled
        );
    }
}
