//! Server-Sent Events (SSE) relay.
//!
//! The upstream event stream is re-framed line by line: blank lines are
//! dropped and every other line is forwarded as its own body frame followed
//! by a blank line. Each frame is handed to the transport separately, so every
//! event is flushed to the client before the next upstream line is read.
//!
//! The first event line is read before the response is committed. A failure
//! up to that point is still retryable on another backend; after it the
//! response belongs to the client and errors only terminate the body.

use crate::api::disconnect::{DisconnectStream, RelayProgress};
use crate::core::error::{BoxError, RelayError};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

/// Longest accepted upstream line, excluding the terminator.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Splits an upstream byte stream into non-blank lines.
pub struct LineReader {
    upstream: ChunkStream,
    buffer: BytesMut,
    finished: bool,
}

impl LineReader {
    pub fn new<S, E>(upstream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            upstream: Box::pin(upstream.map(|chunk| chunk.map_err(Into::<BoxError>::into))),
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    /// Next non-blank line without its terminator, `None` at end of stream.
    ///
    /// A trailing `\r` is stripped. A final line without a terminator is
    /// returned when the upstream closes.
    pub async fn next_line(&mut self) -> Option<Result<Bytes, RelayError>> {
        loop {
            while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.len() > MAX_LINE_BYTES {
                    return Some(Err(self.fail_line_too_long()));
                }
                if !line.is_empty() {
                    return Some(Ok(line.freeze()));
                }
            }

            // A pending `\r` may still be the first half of a CRLF terminator.
            let pending = match self.buffer.last() {
                Some(&b'\r') => self.buffer.len() - 1,
                _ => self.buffer.len(),
            };
            if pending > MAX_LINE_BYTES {
                return Some(Err(self.fail_line_too_long()));
            }

            if self.finished {
                return self.take_trailing_line();
            }

            match self.upstream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(RelayError::Upstream(e)));
                }
                None => self.finished = true,
            }
        }
    }

    fn take_trailing_line(&mut self) -> Option<Result<Bytes, RelayError>> {
        let mut line = self.buffer.split();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.is_empty() {
            None
        } else {
            Some(Ok(line.freeze()))
        }
    }

    fn fail_line_too_long(&mut self) -> RelayError {
        self.finished = true;
        self.buffer.clear();
        RelayError::LineTooLong {
            limit: MAX_LINE_BYTES,
        }
    }
}

/// Wrap a line as one SSE frame.
pub fn event_frame(line: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(line.len() + 2);
    frame.extend_from_slice(line);
    frame.extend_from_slice(b"\n\n");
    frame.freeze()
}

/// An event stream whose first line has already been read.
pub struct PrimedRelay {
    first: Option<Bytes>,
    reader: LineReader,
}

impl PrimedRelay {
    /// Read up to the first non-blank line.
    ///
    /// Errors here happen before anything reached the client.
    pub async fn prime(mut reader: LineReader) -> Result<Self, RelayError> {
        let first = reader.next_line().await.transpose()?;
        Ok(Self { first, reader })
    }

    /// The relayed frames: one per non-blank upstream line.
    pub fn into_frames(self) -> impl Stream<Item = Result<Bytes, RelayError>> + Send {
        let PrimedRelay { first, mut reader } = self;
        async_stream::stream! {
            if let Some(line) = first {
                yield Ok(event_frame(&line));
            }
            while let Some(line) = reader.next_line().await {
                match line {
                    Ok(line) => yield Ok(event_frame(&line)),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Commit the streaming response.
    pub fn into_response(self, backend: &str) -> Response {
        let progress = RelayProgress::new(backend, true);
        let body = DisconnectStream::new(Box::pin(self.into_frames()), progress);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Copy a non-streaming upstream body verbatim.
pub fn relay_full_body<S, E>(upstream: S, backend: &str) -> Response
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError>,
{
    let chunks = upstream.map(|chunk| chunk.map_err(|e| RelayError::Upstream(e.into())));
    let progress = RelayProgress::new(backend, false);
    let body = DisconnectStream::new(Box::pin(chunks), progress);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect_frames(reader: LineReader) -> Vec<Result<String, String>> {
        let relay = PrimedRelay::prime(reader).await.unwrap();
        relay
            .into_frames()
            .map(|f| {
                f.map(|b| String::from_utf8(b.to_vec()).unwrap())
                    .map_err(|e| e.to_string())
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_blank_lines_skipped_and_frames_separated() {
        let reader = LineReader::new(chunks(&["data: a\n", "\n", "data: b"]));
        let frames = collect_frames(reader).await;
        assert_eq!(
            frames,
            vec![Ok("data: a\n\n".to_string()), Ok("data: b\n\n".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let reader = LineReader::new(chunks(&["da", "ta: {\"x\":", "1}\n\nda", "ta: [DONE]\n\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(
            frames,
            vec![
                Ok("data: {\"x\":1}\n\n".to_string()),
                Ok("data: [DONE]\n\n".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_crlf_terminators() {
        let reader = LineReader::new(chunks(&["data: a\r\n\r\ndata: b\r\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(
            frames,
            vec![Ok("data: a\n\n".to_string()), Ok("data: b\n\n".to_string())]
        );
    }

    #[tokio::test]
    async fn test_one_frame_per_line_in_single_chunk() {
        let reader = LineReader::new(chunks(&["data: 1\ndata: 2\ndata: 3\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Ok("data: 3\n\n".to_string()));
    }

    #[tokio::test]
    async fn test_empty_upstream_yields_nothing() {
        let reader = LineReader::new(chunks(&["\n\n", "\r\n"]));
        let frames = collect_frames(reader).await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_line_at_limit_accepted() {
        let line = "x".repeat(MAX_LINE_BYTES);
        let reader = LineReader::new(chunks(&[line.as_str(), "\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[tokio::test]
    async fn test_line_at_limit_with_split_crlf_accepted() {
        let line = "x".repeat(MAX_LINE_BYTES);
        let split = format!("{}\r", line);
        let reader = LineReader::new(chunks(&[split.as_str(), "\n", "data: next\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok(format!("{}\n\n", line)));
        assert_eq!(frames[1], Ok("data: next\n\n".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_line_ending_in_cr_rejected() {
        let line = format!("{}\r", "x".repeat(MAX_LINE_BYTES + 1));
        let reader = LineReader::new(chunks(&[line.as_str(), "\n"]));
        let err = PrimedRelay::prime(reader).await.err().unwrap();
        assert!(matches!(err, RelayError::LineTooLong { .. }));
    }

    #[tokio::test]
    async fn test_oversized_first_line_fails_priming() {
        let line = "x".repeat(MAX_LINE_BYTES + 1);
        let reader = LineReader::new(chunks(&[line.as_str()]));
        let err = PrimedRelay::prime(reader).await.err().unwrap();
        assert!(matches!(err, RelayError::LineTooLong { .. }));
    }

    #[tokio::test]
    async fn test_oversized_later_line_ends_stream_with_error() {
        let line = "y".repeat(MAX_LINE_BYTES + 10);
        let reader = LineReader::new(chunks(&["data: ok\n", line.as_str(), "\ndata: never\n"]));
        let frames = collect_frames(reader).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok("data: ok\n\n".to_string()));
        assert!(frames[1].is_err());
    }

    #[tokio::test]
    async fn test_upstream_error_before_first_line() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"data: partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let err = PrimedRelay::prime(LineReader::new(upstream)).await.err().unwrap();
        assert!(matches!(err, RelayError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_upstream_error_after_first_line() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: b\n")),
        ]);
        let frames = collect_frames(LineReader::new(upstream)).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok("data: a\n\n".to_string()));
        assert!(frames[1].as_ref().unwrap_err().contains("reset"));
    }

    #[tokio::test]
    async fn test_streaming_response_headers() {
        let relay = PrimedRelay::prime(LineReader::new(chunks(&["data: a\n"])))
            .await
            .unwrap();
        let response = relay.into_response("alpha");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[header::CONNECTION], "keep-alive");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: a\n\n");
    }

    #[tokio::test]
    async fn test_full_body_copied_verbatim() {
        let response = relay_full_body(chunks(&["{\"id\":", "\"x\"}"]), "alpha");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"id\":\"x\"}");
    }
}
