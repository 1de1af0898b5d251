use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One line of the job event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobSubmitted {
        node: String,
        endpoint: String,
        job_id: String,
        region: Option<String>,
        payload_digest: String,
    },
    SubmitFailed {
        node: String,
        endpoint: String,
        reason: String,
    },
    JobPolled {
        job_id: String,
        attempt: u32,
        max_attempts: u32,
        status: Option<String>,
    },
    JobFinished {
        node: String,
        job_id: Option<String>,
        outcome: String,
        placeholder: bool,
    },
    FinetuneRequest {
        operation: String,
        region: String,
        http_status: Option<u16>,
    },
}

/// Append-only JSONL writer shared by every invocation of an engine.
///
/// Each line is the serialized event plus `invocation_id` and `ts`.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(&self, invocation_id: &str, event: &JobEvent) -> anyhow::Result<Value> {
        let mut line_obj = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("event".to_string(), other);
                map
            }
        };
        line_obj.insert(
            "invocation_id".to_string(),
            Value::String(invocation_id.to_string()),
        );
        line_obj.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&line_obj)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line_obj))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_tagged_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path);

        let emitted = writer.emit(
            "inv-1",
            &JobEvent::JobPolled {
                job_id: "job-9".to_string(),
                attempt: 2,
                max_attempts: 20,
                status: Some("Pending".to_string()),
            },
        )?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "job_polled");
        assert_eq!(parsed["invocation_id"], "inv-1");
        assert_eq!(parsed["attempt"], 2);
        assert_eq!(parsed["status"], "Pending");
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn emit_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path);

        writer.emit(
            "inv-1",
            &JobEvent::SubmitFailed {
                node: "FluxDev_BFL".to_string(),
                endpoint: "flux-dev".to_string(),
                reason: "HTTP 401".to_string(),
            },
        )?;
        writer.emit(
            "inv-1",
            &JobEvent::JobFinished {
                node: "FluxDev_BFL".to_string(),
                job_id: None,
                outcome: "submit_failed".to_string(),
                placeholder: true,
            },
        )?;

        let content = fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types, vec!["submit_failed", "job_finished"]);
        Ok(())
    }
}
