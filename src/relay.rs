//! Forwarding upstream frames to the client.
//!
//! The relay is pull-based: it asks upstream for the next frame only when the
//! response body is polled for its next chunk, so nothing is read ahead of the
//! client and a slow client stalls only its own upstream read. Each frame is
//! yielded as its own body chunk.
//!
//! When the client goes away hyper drops the body, which drops the relay and
//! with it the upstream stream and its connection slot.

use crate::frame::Frame;
use crate::logging::Outcome;
use crate::session::ProxySession;
use crate::upstream::FrameStream;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

/// Closes out the session however the relay ends, including by being dropped.
struct RelayGuard {
    session: Option<ProxySession>,
    outcome: Option<Outcome>,
    error: Option<String>,
    frames: usize,
    bytes: usize,
}

impl RelayGuard {
    fn new(session: ProxySession) -> Self {
        Self {
            session: Some(session),
            outcome: None,
            error: None,
            frames: 0,
            bytes: 0,
        }
    }

    fn count(&mut self, frame: &Frame) {
        self.frames += 1;
        self.bytes += frame.len();
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let outcome = self.outcome.unwrap_or(Outcome::Disconnected);
            session.finish_stream(outcome, self.frames, self.bytes, self.error.take());
        }
    }
}

/// Relay `frames` to the client in arrival order.
///
/// Ends when upstream ends, after one terminal error event if upstream
/// breaks, or as soon as the session is cancelled.
pub fn relay(
    frames: FrameStream,
    session: ProxySession,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let cancel = session.token();
        let dialect = session.dialect();
        let mut guard = RelayGuard::new(session);
        let mut frames = frames;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    guard.outcome = Some(Outcome::Cancelled);
                    break;
                }
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    guard.count(&frame);
                    yield Ok(frame.into_bytes());
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    let terminal = dialect.stream_error_frame(&message);
                    guard.bytes += terminal.len();
                    guard.outcome = Some(Outcome::Interrupted);
                    guard.error = Some(message);
                    yield Ok(Bytes::from(terminal));
                    break;
                }
                None => {
                    guard.outcome = Some(Outcome::Completed);
                    break;
                }
            }
        }

        // Release the upstream read before the session is closed out.
        drop(frames);
        drop(guard);
    }
}
