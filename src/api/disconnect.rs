//! Body stream wrapper that tracks relay progress and detects client disconnects.
//!
//! Dropping the wrapper drops the upstream stream with it, which releases the
//! upstream connection as soon as the client goes away.

use axum::body::Bytes;
use futures::stream::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Debug)]
struct ProgressInner {
    backend: String,
    streaming: bool,
    frames: AtomicU64,
    bytes: AtomicU64,
    completed: AtomicBool,
    failed: AtomicBool,
}

/// Shared record of what has been handed to the client for one response.
#[derive(Clone, Debug)]
pub struct RelayProgress {
    inner: Arc<ProgressInner>,
}

impl RelayProgress {
    pub fn new(backend: &str, streaming: bool) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                backend: backend.to_string(),
                streaming,
                frames: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                completed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether any byte has been released to the client.
    pub fn has_delivered(&self) -> bool {
        self.inner.frames.load(Ordering::SeqCst) > 0
    }

    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    fn record_frame(&self, len: usize) {
        self.inner.frames.fetch_add(1, Ordering::SeqCst);
        self.inner.bytes.fetch_add(len as u64, Ordering::SeqCst);
    }

    fn mark_completed(&self) {
        self.inner.completed.store(true, Ordering::SeqCst);
    }

    fn mark_failed(&self) {
        self.inner.failed.store(true, Ordering::SeqCst);
    }
}

/// A stream wrapper that records delivered frames and logs how the relay ended.
pub struct DisconnectStream<S> {
    stream: S,
    progress: RelayProgress,
}

impl<S> DisconnectStream<S> {
    pub fn new(stream: S, progress: RelayProgress) -> Self {
        Self { stream, progress }
    }

    pub fn progress(&self) -> &RelayProgress {
        &self.progress
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.stream).poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(bytes))) => self.progress.record_frame(bytes.len()),
            Poll::Ready(Some(Err(e))) => {
                self.progress.mark_failed();
                // Bytes may already be with the client, so this is terminal.
                tracing::error!(
                    backend = %self.progress.inner.backend,
                    stream = self.progress.inner.streaming,
                    frames_delivered = self.progress.frames(),
                    delivered = self.progress.has_delivered(),
                    error = %e,
                    "Relay failed after response was committed"
                );
            }
            Poll::Ready(None) => {
                if !self.progress.is_completed() {
                    self.progress.mark_completed();
                    tracing::debug!(
                        backend = %self.progress.inner.backend,
                        stream = self.progress.inner.streaming,
                        frames = self.progress.frames(),
                        bytes = self.progress.inner.bytes.load(Ordering::SeqCst),
                        "Relay completed"
                    );
                }
            }
            Poll::Pending => {}
        }
        poll
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if !self.progress.is_completed() && !self.progress.is_failed() {
            tracing::info!(
                backend = %self.progress.inner.backend,
                stream = self.progress.inner.streaming,
                frames_delivered = self.progress.frames(),
                "Client disconnected before relay finished, closing upstream"
            );
        }
    }
}
