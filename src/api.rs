//! HTTP client for the query service.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::{ChatError, Result};
use crate::protocol::{HealthStatus, QueryRequest, QueryResponse, StreamEvent};

/// Error body shapes the backend uses: `{"error": ...}` or FastAPI's `{"detail": ...}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

impl ErrorBody {
    fn message(self) -> Option<String> {
        self.error.or_else(|| {
            self.detail.map(|d| match d {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        })
    }
}

pub struct QueryClient {
    client: Client,
    config: ApiConfig,
}

impl QueryClient {
    pub fn new(config: ApiConfig) -> Self {
        // Client::builder() only fails on TLS backend init; fall back to defaults.
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, url: &str) -> Result<Response> {
        let resp = self.authorize(req).send().await.map_err(|e| ChatError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::Unauthorized { url: url.to_string() });
        }
        let detail = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(ErrorBody::message);
        warn!(status = status.as_u16(), url = %url, detail = ?detail, "query service returned an error status");
        Err(ChatError::Http {
            status: status.as_u16(),
            url: url.to_string(),
            detail,
        })
    }

    /// `POST {query_path}`. A `success: false` answer becomes `ChatError::Application`.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let url = self.url(&self.config.query_path);
        debug!(url = %url, query_type = %request.query_type, "sending query");
        let resp = self.send(self.client.post(&url).json(request), &url).await?;
        let body: QueryResponse = resp.json().await.map_err(|e| ChatError::Decode {
            context: "query response".into(),
            detail: e.to_string(),
        })?;
        if !body.success {
            return Err(ChatError::Application(body.error.unwrap_or_default()));
        }
        Ok(body)
    }

    /// `POST /query/stream`, calling `on_event` for each NDJSON line.
    ///
    /// Lines that fail to parse are skipped. A line that is not valid UTF-8
    /// ends the stream with `ChatError::Decode`, an `error` event with
    /// `ChatError::Application`.
    pub async fn query_stream<F>(&self, request: &QueryRequest, mut on_event: F) -> Result<()>
    where
        F: FnMut(StreamEvent),
    {
        let url = self.url("/query/stream");
        let resp = self.send(self.client.post(&url).json(request), &url).await?;

        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ChatError::Transport {
                url: url.clone(),
                detail: e.to_string(),
            })?;
            buffer.extend_from_slice(&chunk);

            // Decode whole lines only; a character may straddle two reads.
            while let Some(line_end) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=line_end).collect();
                if let Some(event) = parse_stream_line(decode_line(&line[..line_end])?)? {
                    on_event(event);
                }
            }
        }

        // A final line without a trailing newline.
        if let Some(event) = parse_stream_line(decode_line(&buffer)?)? {
            on_event(event);
        }
        Ok(())
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthStatus> {
        let url = self.url("/health");
        let resp = self.send(self.client.get(&url), &url).await?;
        resp.json().await.map_err(|e| ChatError::Decode {
            context: "health response".into(),
            detail: e.to_string(),
        })
    }

    pub async fn is_healthy(&self) -> bool {
        match self.health().await {
            Ok(h) => h.is_healthy(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// `GET /query-types`, returned as the backend sends it.
    pub async fn query_types(&self) -> Result<serde_json::Value> {
        let url = self.url("/query-types");
        let resp = self.send(self.client.get(&url), &url).await?;
        resp.json().await.map_err(|e| ChatError::Decode {
            context: "query types".into(),
            detail: e.to_string(),
        })
    }
}

fn decode_line(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|e| ChatError::Decode {
            context: "stream line".into(),
            detail: e.to_string(),
        })
}

/// Parse one NDJSON line. Blank and unparseable lines yield `Ok(None)`.
pub fn parse_stream_line(line: &str) -> Result<Option<StreamEvent>> {
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(StreamEvent::Error { error }) => Err(ChatError::Application(error.unwrap_or_default())),
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            debug!(error = %e, line = %line, "skipping unparseable stream line");
            Ok(None)
        }
    }
}
