use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Status code and raw body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    /// The API signals success with exactly 200.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn parse_json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).context("response body is not valid JSON")
    }
}

/// Blocking HTTP seam used by the submitter, poller, materializer and the
/// finetune client. Non-2xx answers are replies, not errors; `Err` is
/// reserved for transport failures.
pub trait FluxTransport: Send + Sync {
    fn post_json(&self, url: &str, api_key: &str, payload: &Value) -> Result<HttpReply>;
    fn get(&self, url: &str, api_key: Option<&str>) -> Result<HttpReply>;
}

pub struct HttpTransport {
    http: HttpClient,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, download_timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            request_timeout,
            download_timeout,
        })
    }
}

impl FluxTransport for HttpTransport {
    fn post_json(&self, url: &str, api_key: &str, payload: &Value) -> Result<HttpReply> {
        let response = self
            .http
            .post(url)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .json(payload)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Flux request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .with_context(|| format!("Flux response body read failed ({url})"))?;
        Ok(HttpReply::new(status, body.to_vec()))
    }

    fn get(&self, url: &str, api_key: Option<&str>) -> Result<HttpReply> {
        let mut request = self.http.get(url);
        request = match api_key {
            Some(key) => request
                .header("accept", "application/json")
                .header("x-key", key)
                .timeout(self.request_timeout),
            None => request.timeout(self.download_timeout),
        };
        let response = request
            .send()
            .with_context(|| format!("Flux GET failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .with_context(|| format!("Flux response body read failed ({url})"))?;
        Ok(HttpReply::new(status, body.to_vec()))
    }
}

/// `url` with `params` appended as an encoded query string.
pub fn with_query(url: &str, params: &[(&str, &str)]) -> Result<String> {
    let parsed = reqwest::Url::parse_with_params(url, params)
        .with_context(|| format!("invalid URL '{url}'"))?;
    Ok(parsed.to_string())
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
