use bfl_contracts::config::ResolvedConfig;
use bfl_contracts::events::{EventWriter, JobEvent};
use bfl_contracts::nodes::Payload;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::transport::{truncate_text, FluxTransport};

/// A remote job accepted by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub polling_url: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submit rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("submit response missing job id")]
    MissingId,
    #[error("submit failed: {0:#}")]
    Transport(#[from] anyhow::Error),
}

/// Event sink for one node invocation. Write failures are logged and
/// never affect the invocation itself.
#[derive(Debug, Clone)]
pub struct JobLog {
    writer: Option<EventWriter>,
    invocation_id: String,
}

impl JobLog {
    pub fn new(writer: Option<EventWriter>) -> Self {
        Self {
            writer,
            invocation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn record(&self, event: JobEvent) {
        let Some(writer) = &self.writer else {
            return;
        };
        if let Err(err) = writer.emit(&self.invocation_id, &event) {
            warn!(path = %writer.path().display(), "event write failed: {err:#}");
        }
    }
}

/// POST `payload` to `endpoint` (regional when `region` is set) and return
/// the issued job. No retry at this layer.
pub fn submit(
    transport: &dyn FluxTransport,
    config: &ResolvedConfig,
    endpoint: &str,
    payload: &Payload,
    region: Option<&str>,
) -> Result<JobHandle, SubmitError> {
    let url = config.url(endpoint, region);
    let reply = transport.post_json(&url, &config.api_key, &Value::Object(payload.clone()))?;
    if !reply.is_ok() {
        let body = truncate_text(&reply.text(), 512);
        warn!(%url, status = reply.status, %body, "error initiating request");
        return Err(SubmitError::Rejected {
            status: reply.status,
            body,
        });
    }
    let parsed = reply.parse_json()?;
    let id = parsed
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(SubmitError::MissingId)?;
    let polling_url = parsed
        .get("polling_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    info!(job_id = %id, %url, "task submitted");
    Ok(JobHandle {
        id,
        polling_url,
        region: region.map(str::to_string),
    })
}

/// Hex SHA-256 of the serialized payload; events carry this instead of the
/// payload, which may hold base64 images.
pub fn payload_digest(payload: &Payload) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
