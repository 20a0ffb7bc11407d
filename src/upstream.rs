//! The outbound half of the proxy.
//!
//! [`UpstreamClient::send`] takes a transformed body, leases a connection slot,
//! attaches the configured key and returns either the whole reply or a lazy
//! [`FrameStream`]. Non-2xx replies are not errors here: they come back as
//! [`UpstreamResponse::Buffered`] with the provider's own status and body.

use crate::config::UpstreamTarget;
use crate::error::{ProxyError, Result};
use crate::frame::{self, Frame};
use crate::pool::ConnectionPool;
use crate::providers::{Dialect, DEFAULT_ANTHROPIC_VERSION};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::sync::Arc;

/// Inbound headers forwarded as-is to an Anthropic upstream.
const ANTHROPIC_FORWARDED_HEADERS: &[&str] = &["anthropic-beta", "user-agent"];

/// Reply headers relayed to the client along with a buffered body.
const RELAYED_HEADERS: &[&str] = &["content-type", "retry-after", "request-id", "x-request-id"];
const RELAYED_HEADER_PREFIXES: &[&str] = &["anthropic-ratelimit-", "x-ratelimit-"];

/// Upstream events in arrival order. Dropping it cancels the upstream read and
/// frees the connection slot.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

pub enum UpstreamResponse {
    Buffered {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    Streaming(FrameStream),
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered {
                status,
                headers,
                body,
            } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("headers", headers)
                .field("body_len", &body.len())
                .finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    target: Arc<UpstreamTarget>,
    pool: ConnectionPool,
}

impl UpstreamClient {
    /// Build the shared HTTP client and pool for a target.
    pub fn new(target: UpstreamTarget) -> Result<Self> {
        let client = ConnectionPool::build_client(
            target.pool_capacity,
            target.connect_timeout,
            target.idle_timeout,
        )?;
        let pool = ConnectionPool::new(client, target.pool_capacity, target.acquire_timeout);
        Ok(Self::with_pool(target, pool))
    }

    pub fn with_pool(target: UpstreamTarget, pool: ConnectionPool) -> Self {
        Self {
            target: Arc::new(target),
            pool,
        }
    }

    #[must_use]
    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Forward a body upstream.
    ///
    /// With `streaming` set, this returns as soon as response headers arrive
    /// and the caller must drain or drop the returned stream. Otherwise it
    /// waits for the complete body.
    ///
    /// # Errors
    /// `PoolExhausted` if no slot frees up in time, `UpstreamUnavailable` on
    /// connect/DNS/TLS failure, reset, or when headers do not arrive within
    /// the first-byte timeout.
    pub async fn send(
        &self,
        body: &serde_json::Value,
        streaming: bool,
        inbound: &HeaderMap,
    ) -> Result<UpstreamResponse> {
        let lease = self.pool.acquire().await?;
        let target = &self.target;

        let request = self.build_request(lease.client(), body, inbound);

        tracing::debug!(endpoint = %target.endpoint, streaming, "Forwarding request upstream");

        let response = match tokio::time::timeout(target.first_byte_timeout, request.send()).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ProxyError::unavailable(describe_send_error(&e))),
            Err(_) => {
                return Err(ProxyError::unavailable(format!(
                    "No response from upstream within {}s",
                    target.first_byte_timeout.as_secs()
                )))
            }
        };

        let status = response.status();

        if !streaming || !status.is_success() {
            let headers = relayed_headers(response.headers());
            let body = response.bytes().await.map_err(|e| {
                ProxyError::unavailable(format!("Failed to read upstream response: {e}"))
            })?;
            lease.release();

            tracing::debug!(status = status.as_u16(), len = body.len(), "Upstream response received");

            return Ok(UpstreamResponse::Buffered {
                status: status.as_u16(),
                headers,
                body,
            });
        }

        tracing::debug!(status = status.as_u16(), "Upstream stream opened");

        let byte_stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProxyError::interrupted(e.to_string())));

        let frames = async_stream::stream! {
            // Held until the consumer drops the stream.
            let _lease = lease;
            let frames = frame::frames(byte_stream);
            futures::pin_mut!(frames);
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        };

        Ok(UpstreamResponse::Streaming(Box::pin(frames)))
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        body: &serde_json::Value,
        inbound: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let target = &self.target;
        let mut builder = client
            .post(&target.endpoint)
            .header(CONTENT_TYPE, "application/json");

        match target.dialect {
            Dialect::Anthropic => {
                let version = inbound
                    .get("anthropic-version")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
                builder = builder
                    .header("x-api-key", &target.api_key)
                    .header("anthropic-version", version);
                for name in ANTHROPIC_FORWARDED_HEADERS {
                    if let Some(value) = inbound.get(*name) {
                        builder = builder.header(*name, value.as_bytes());
                    }
                }
            }
            Dialect::OpenAi => {
                builder = builder.bearer_auth(&target.api_key);
            }
        }

        for (name, value) in &target.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder.json(body)
    }
}

fn relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    upstream
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            RELAYED_HEADERS.contains(&name)
                || RELAYED_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn describe_send_error(e: &reqwest::Error) -> String {
    let kind = if e.is_connect() {
        "connection failed"
    } else if e.is_timeout() {
        "timed out"
    } else {
        "request failed"
    };
    format!("Upstream {kind}: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_relayed_headers_keep_rate_limit_info_only() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("retry-after", HeaderValue::from_static("17"));
        upstream.insert("request-id", HeaderValue::from_static("req_01"));
        upstream.insert(
            "anthropic-ratelimit-requests-remaining",
            HeaderValue::from_static("0"),
        );
        upstream.insert("x-ratelimit-reset-tokens", HeaderValue::from_static("6s"));
        upstream.insert("set-cookie", HeaderValue::from_static("session=abc"));
        upstream.insert("content-length", HeaderValue::from_static("24"));

        let relayed = relayed_headers(&upstream);

        assert_eq!(relayed.len(), 5);
        assert_eq!(relayed["retry-after"], "17");
        assert_eq!(relayed["anthropic-ratelimit-requests-remaining"], "0");
        assert!(relayed.get("set-cookie").is_none());
        assert!(relayed.get("content-length").is_none());
    }
}
