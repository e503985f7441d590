//! Ingest transport
//!
//! `EventSink` is the seam between the delivery client's retry/breaker
//! logic and the wire. `HttpSink` posts over HTTP(S) with reqwest; tests
//! substitute scripted sinks.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use smallvec::SmallVec;
use std::time::Duration;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_TENANT: &str = "X-Capsight-Tenant";
pub const HEADER_SIGNATURE: &str = "X-Capsight-Signature";
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";

pub type Headers = SmallVec<[(&'static str, String); 6]>;

/// One signed POST, identical across retries
#[derive(Debug, Clone)]
pub struct SinkRequest {
    pub body: Bytes,
    pub headers: Headers,
}

impl SinkRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SinkResponse {
    pub status: u16,
    /// Truncated response body, kept for 4xx diagnostics
    pub body: String,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn post(&self, request: &SinkRequest) -> Result<SinkResponse, TransportError>;
}

const MAX_BODY_CHARS: usize = 512;

pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    /// Client is created once and reused (connection pooling)
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url: url.into(), client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn post(&self, request: &SinkRequest) -> Result<SinkResponse, TransportError> {
        let mut builder = self.client.post(&self.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        // A body read failure after a status line still counts as a response
        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(MAX_BODY_CHARS).collect();

        Ok(SinkResponse { status, body })
    }
}
