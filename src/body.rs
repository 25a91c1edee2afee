//! Response bodies and header handling shared by every route.

use crate::mappoll::{MapPoll, PollState, RecordCodec};
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Response, StatusCode};
use std::fmt::Display;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument, Span};

pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Room for a few records between the transcoder and the client connection.
const STREAM_BUFFER: usize = 256 * 1024;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text error reply carrying `msg` verbatim.
pub fn error_response(status: StatusCode, msg: impl Display) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{msg}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Expose an incoming body as a byte stream.
pub fn body_reader(body: Incoming) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Copy end-to-end headers from `from` into `to`.
///
/// Hop-by-hop headers and `Host` never cross the proxy. `Content-Length` is
/// dropped when the body is rewritten on the way through.
pub fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, body_rewritten: bool) {
    for (name, value) in from {
        if is_hop_by_hop(name.as_str()) || *name == HOST {
            continue;
        }
        if body_rewritten && *name == CONTENT_LENGTH {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Run a map poll in the background and stream its output as a body.
///
/// The poll stops when `cancel` fires or when the returned body is dropped.
/// Either way the upstream body is released with it.
pub fn transcode<C>(codec: C, upstream: Incoming, dump: bool, cancel: &CancellationToken) -> ProxyBody
where
    C: RecordCodec + 'static,
{
    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
    let cancel = cancel.child_token();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(
        async move {
            let mut src = body_reader(upstream);
            let mut poll = MapPoll::new(codec, dump);
            let state = poll.run(&mut src, &mut writer, &cancel).await;
            if state != PollState::Done {
                info!("map poll ended {:?} after {} records", state, poll.records());
            }
        }
        .instrument(Span::current()),
    );

    let stream = ReaderStream::new(reader).map_ok(move |chunk| {
        let _alive = &guard;
        Frame::data(chunk)
    });
    StreamBody::new(stream).boxed_unsync()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
