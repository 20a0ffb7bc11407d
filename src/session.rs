//! Per-request proxy session.
//!
//! A [`ProxySession`] is opened for every chat request. It carries the id that
//! ties log lines together, a cancellation token derived from the server's
//! shutdown token, and a handle on the shared connection pool. Whoever ends the
//! request (the dispatcher for buffered replies, the relay for streams) calls
//! one of the `finish` methods, which writes the access log entry.

use crate::error::ProxyError;
use crate::logging::{AccessEntry, Outcome, SharedAccessLog};
use crate::pool::ConnectionPool;
use crate::providers::Dialect;

use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ProxySession {
    id: Uuid,
    dialect: Dialect,
    model: Option<String>,
    streaming: bool,
    cancel: CancellationToken,
    pool: ConnectionPool,
    access_log: SharedAccessLog,
    started: Instant,
}

impl ProxySession {
    pub fn new(
        dialect: Dialect,
        cancel: CancellationToken,
        pool: ConnectionPool,
        access_log: SharedAccessLog,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dialect,
            model: None,
            streaming: false,
            cancel,
            pool,
            access_log,
            started: Instant::now(),
        }
    }

    /// Record what the client asked for once the body has been parsed.
    pub fn describe(&mut self, model: Option<&str>, streaming: bool) {
        self.model = model.map(str::to_string);
        self.streaming = streaming;
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Token that fires when the session must stop writing.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A buffered reply (2xx or relayed non-2xx) is about to be written.
    pub fn finish_buffered(self, status: u16, bytes: usize) {
        let outcome = if (200..300).contains(&status) {
            Outcome::Completed
        } else {
            Outcome::UpstreamStatus
        };
        if outcome == Outcome::UpstreamStatus {
            tracing::warn!(session = %self.id, status, "Upstream returned non-success status, relaying verbatim");
        } else {
            tracing::info!(session = %self.id, status, bytes, "Buffered response relayed");
        }
        self.record(status, outcome, None, bytes, None);
    }

    /// A stream relay ended.
    pub fn finish_stream(self, outcome: Outcome, frames: usize, bytes: usize, error: Option<String>) {
        match outcome {
            Outcome::Completed => {
                tracing::info!(session = %self.id, frames, bytes, "Stream completed");
            }
            Outcome::Disconnected => {
                tracing::info!(session = %self.id, frames, "Client disconnected, upstream read cancelled");
            }
            Outcome::Cancelled => {
                tracing::info!(session = %self.id, frames, "Stream cancelled by shutdown");
            }
            _ => {
                tracing::warn!(session = %self.id, frames, error = error.as_deref().unwrap_or(""), "Stream interrupted");
            }
        }
        self.record(200, outcome, Some(frames), bytes, error);
    }

    /// The request failed before any response bytes were written.
    pub fn fail(self, error: ProxyError) -> Response {
        let status = error.status_code();
        if status.is_client_error() {
            tracing::warn!(session = %self.id, %error, "Rejected request");
        } else {
            tracing::error!(session = %self.id, %error, "Proxy error");
        }
        self.record(status.as_u16(), Outcome::Failed, None, 0, Some(error.to_string()));
        error.into_response()
    }

    fn record(
        &self,
        status: u16,
        outcome: Outcome,
        frames: Option<usize>,
        bytes: usize,
        error: Option<String>,
    ) {
        tracing::debug!(
            session = %self.id,
            pool_available = self.pool.available(),
            pool_capacity = self.pool.capacity(),
            "Session closed"
        );
        self.access_log.record(AccessEntry {
            timestamp: Utc::now(),
            session_id: self.id.to_string(),
            dialect: self.dialect.to_string(),
            model: self.model.clone(),
            streaming: self.streaming,
            status,
            outcome,
            frames,
            bytes,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
        });
    }
}
