use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bfl_contracts::config::ResolvedConfig;
use bfl_contracts::events::JobEvent;
use bfl_contracts::nodes::Payload;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::jobs::JobLog;
use crate::transport::{with_query, FluxTransport, HttpReply};

pub const DEFAULT_LEARNING_RATE: f64 = 0.00001;
pub const LORA_LEARNING_RATE: f64 = 0.0001;

/// Finetune management calls: one request, one answer, no polling. Results
/// are text for the host, error bodies included.
pub struct FinetuneClient<'a> {
    transport: &'a dyn FluxTransport,
    config: &'a ResolvedConfig,
    region: String,
    log: &'a JobLog,
}

/// Output triple of a status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinetuneStatus {
    pub status: String,
    pub progress: String,
    pub result: String,
}

impl FinetuneStatus {
    fn error(progress: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            status: "Error".to_string(),
            progress: progress.into(),
            result: result.into(),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        vec![self.status, self.progress, self.result]
    }
}

impl<'a> FinetuneClient<'a> {
    pub fn new(
        transport: &'a dyn FluxTransport,
        config: &'a ResolvedConfig,
        region: &str,
        log: &'a JobLog,
    ) -> Self {
        Self {
            transport,
            config,
            region: region.to_string(),
            log,
        }
    }

    /// `payload` holds the node fields; `zip_file_path` is replaced by the
    /// base64 archive as `file_data`.
    pub fn create(&self, mut payload: Payload) -> String {
        let zip_path = payload
            .remove("zip_file_path")
            .and_then(|value| value.as_str().map(str::trim).map(str::to_string))
            .unwrap_or_default();
        if zip_path.is_empty() {
            warn!("ZIP file path is required");
            return "Error: ZIP file path is required".to_string();
        }
        let file_data = match encode_archive(Path::new(&zip_path)) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("error reading ZIP file: {err:#}");
                return "Error: Could not read ZIP file".to_string();
            }
        };
        info!(path = %zip_path, chars = file_data.len(), "ZIP file encoded");
        payload.insert("file_data".to_string(), Value::String(file_data));
        adjust_learning_rate(&mut payload);

        let url = self.config.url("finetune", Some(self.region.as_str()));
        let response = self.post("create", &url, &Value::Object(payload));
        if let Ok(reply) = &response {
            if reply.is_ok() {
                info!(
                    region = %self.region,
                    "finetune created; use the same region for inference"
                );
            }
        }
        render_response(response)
    }

    pub fn status(&self, finetune_id: &str) -> FinetuneStatus {
        let finetune_id = finetune_id.trim();
        if finetune_id.is_empty() {
            return FinetuneStatus::error("No finetune ID provided", "");
        }
        let reply = with_query(
            &self.config.url("get_result", Some(self.region.as_str())),
            &[("id", finetune_id)],
        )
        .and_then(|url| self.get("status", &url));
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => return FinetuneStatus::error("Exception occurred", format!("{err:#}")),
        };
        if !reply.is_ok() {
            return FinetuneStatus::error(format!("HTTP {}", reply.status), reply.text());
        }
        let parsed = match reply.parse_json() {
            Ok(parsed) => parsed,
            Err(err) => return FinetuneStatus::error("Exception occurred", format!("{err:#}")),
        };
        FinetuneStatus {
            status: parsed
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            progress: text_of(parsed.get("progress")),
            result: text_of(parsed.get("result")),
        }
    }

    pub fn list(&self) -> String {
        let url = self.config.url("my_finetunes", Some(self.region.as_str()));
        render_response(self.get("list", &url))
    }

    pub fn details(&self, finetune_id: &str) -> String {
        let finetune_id = finetune_id.trim();
        if finetune_id.is_empty() {
            return "Error: No finetune ID provided".to_string();
        }
        let response = with_query(
            &self.config.url("finetune_details", Some(self.region.as_str())),
            &[("finetune_id", finetune_id)],
        )
        .and_then(|url| self.get("details", &url));
        render_response(response)
    }

    pub fn delete(&self, finetune_id: &str) -> String {
        let finetune_id = finetune_id.trim();
        if finetune_id.is_empty() {
            return "Error: No finetune ID provided".to_string();
        }
        let url = self.config.url("delete_finetune", Some(self.region.as_str()));
        render_response(self.post("delete", &url, &json!({ "finetune_id": finetune_id })))
    }

    fn post(&self, operation: &str, url: &str, body: &Value) -> Result<HttpReply> {
        let response = self.transport.post_json(url, &self.config.api_key, body);
        self.record(operation, &response);
        response
    }

    fn get(&self, operation: &str, url: &str) -> Result<HttpReply> {
        let response = self.transport.get(url, Some(&self.config.api_key));
        self.record(operation, &response);
        response
    }

    fn record(&self, operation: &str, response: &Result<HttpReply>) {
        self.log.record(JobEvent::FinetuneRequest {
            operation: operation.to_string(),
            region: self.region.clone(),
            http_status: response.as_ref().ok().map(|reply| reply.status),
        });
    }
}

fn encode_archive(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

/// LoRA runs want a 10x higher rate; only applied when the user left the
/// learning rate at its default.
fn adjust_learning_rate(payload: &mut Payload) {
    let is_lora = payload.get("finetune_type").and_then(Value::as_str) == Some("lora");
    let at_default = payload
        .get("learning_rate")
        .and_then(Value::as_f64)
        .is_some_and(|rate| (rate - DEFAULT_LEARNING_RATE).abs() < 1e-12);
    if is_lora && at_default {
        info!(learning_rate = LORA_LEARNING_RATE, "auto-adjusted learning rate for LoRA finetune");
        payload.insert("learning_rate".to_string(), json!(LORA_LEARNING_RATE));
    }
}

/// Pretty JSON for any JSON body (success or API error), otherwise
/// `HTTP <code>: <body>`.
fn render_response(response: Result<HttpReply>) -> String {
    let reply = match response {
        Ok(reply) => reply,
        Err(err) => {
            warn!("finetune request failed: {err:#}");
            return format!("Error: {err:#}");
        }
    };
    if !reply.is_ok() {
        warn!(status = reply.status, "finetune request returned an error");
    }
    match reply.parse_json() {
        Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| parsed.to_string()),
        Err(_) if reply.is_ok() => reply.text(),
        Err(_) => format!("HTTP {}: {}", reply.status, reply.text()),
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other @ (Value::Object(_) | Value::Array(_))) => {
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        }
        Some(other) => other.to_string(),
    }
}
