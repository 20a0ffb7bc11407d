//! Splitting an upstream byte stream into SSE frames.
//!
//! A [`Frame`] is one event exactly as the provider sent it, terminating blank
//! line included. The decoder never rewrites bytes, it only decides where one
//! event ends and the next begins, so concatenating every frame reproduces the
//! upstream body.

use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};

/// One upstream event, forwarded to the client as an indivisible chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Incremental event-boundary splitter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Bytes already scanned without finding a boundary.
    scanned: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and take every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.find_boundary() {
            frames.push(Frame::new(self.buffer.split_to(end).freeze()));
            self.scanned = 0;
        }
        frames
    }

    /// Whatever is left once upstream closes, if anything.
    pub fn finish(&mut self) -> Option<Frame> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            None
        } else {
            Some(Frame::new(self.buffer.split().freeze()))
        }
    }

    /// End offset (exclusive) of the first complete event in the buffer.
    fn find_boundary(&mut self) -> Option<usize> {
        let buf = &self.buffer[..];
        // Step back so a delimiter split across chunks is still seen.
        let start = self.scanned.saturating_sub(3);

        for i in start..buf.len() {
            let rest = &buf[i..];
            if rest.starts_with(b"\r\n\r\n") {
                return Some(i + 4);
            }
            if rest.starts_with(b"\n\n") || rest.starts_with(b"\r\r") {
                return Some(i + 2);
            }
        }

        self.scanned = buf.len();
        None
    }
}

/// Turn a byte stream into a frame stream. Errors pass through in order.
pub fn frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<Frame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Send,
{
    async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in decoder.push(&chunk) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(rest) = decoder.finish() {
            yield Ok(rest);
        }
    }
}
