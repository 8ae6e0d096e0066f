// crates/core/src/upstream/http.rs
//! REST client for the racing data API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use super::source::UpstreamSource;
use super::types::{FetchOutcome, UpstreamError};

/// `GET {base_url}/{entity}/{id}` with optional bearer auth.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| UpstreamError::NotConfigured(format!("bad base_url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(UpstreamError::NotConfigured(format!(
                "base_url {base_url} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("darkhorses/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            timeout,
        })
    }

    fn entity_url(&self, entity: &str, id: &str) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in `new`
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(entity).push(id);
        }
        url
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_entity(&self, entity: &str, id: &str) -> Result<FetchOutcome, UpstreamError> {
        let mut request = self
            .client
            .get(self.entity_url(entity, id))
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(entity, id, "upstream entity not found");
            return Ok(FetchOutcome::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(UpstreamError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        match resp
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?
        {
            Value::Object(record) => Ok(FetchOutcome::Found(record)),
            other => Err(UpstreamError::Decode(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
