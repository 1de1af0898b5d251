use bfl_contracts::config::ResolvedConfig;
use bfl_contracts::events::JobEvent;
use bfl_contracts::nodes::Payload;
use serde_json::Value;
use tracing::{info, warn};

use crate::jobs::{payload_digest, submit, JobLog};
use crate::materialize::try_materialize;
use crate::poller::{PollOutcome, PollPolicy, Poller, Sleeper};
use crate::tensor::ImageTensor;
use crate::transport::FluxTransport;

pub const DEFAULT_OUTPUT_FORMAT: &str = "jpeg";

/// How a generation ended. Everything but `Ready` comes with the
/// placeholder image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready { job_id: String },
    SubmitFailed { reason: String },
    JobFailed { job_id: String, status: String },
    UnknownStatus { job_id: String, status: String },
    Exhausted { job_id: String, attempts: u32 },
    MaterializeFailed { job_id: String, reason: String },
}

impl Outcome {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Outcome::SubmitFailed { .. } => None,
            Outcome::Ready { job_id }
            | Outcome::JobFailed { job_id, .. }
            | Outcome::UnknownStatus { job_id, .. }
            | Outcome::Exhausted { job_id, .. }
            | Outcome::MaterializeFailed { job_id, .. } => Some(job_id),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ready { .. } => "ready",
            Outcome::SubmitFailed { .. } => "submit_failed",
            Outcome::JobFailed { .. } => "job_failed",
            Outcome::UnknownStatus { .. } => "unknown_status",
            Outcome::Exhausted { .. } => "exhausted",
            Outcome::MaterializeFailed { .. } => "materialize_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub image: ImageTensor,
    pub outcome: Outcome,
}

impl Generation {
    pub fn is_placeholder(&self) -> bool {
        !matches!(self.outcome, Outcome::Ready { .. })
    }
}

/// Inputs of one submit/poll/materialize run.
pub struct GenerationRequest<'a> {
    pub node: &'a str,
    pub endpoint: &'a str,
    pub payload: &'a Payload,
    pub region: Option<&'a str>,
}

pub struct Pipeline<'a> {
    pub transport: &'a dyn FluxTransport,
    pub sleeper: &'a dyn Sleeper,
    pub policy: PollPolicy,
    pub config: &'a ResolvedConfig,
    pub log: &'a JobLog,
}

impl Pipeline<'_> {
    /// Submit, poll and materialize. Remote failures never escape: they
    /// are logged, recorded and turned into the placeholder image.
    pub fn run(&self, request: &GenerationRequest<'_>) -> Generation {
        let generation = match self.execute(request) {
            Ok((job_id, image)) => {
                info!(node = request.node, %job_id, "generation ready");
                Generation {
                    image,
                    outcome: Outcome::Ready { job_id },
                }
            }
            Err(outcome) => {
                warn!(node = request.node, outcome = outcome.label(), "returning placeholder image");
                Generation {
                    image: ImageTensor::placeholder(),
                    outcome,
                }
            }
        };
        self.log.record(JobEvent::JobFinished {
            node: request.node.to_string(),
            job_id: generation.outcome.job_id().map(str::to_string),
            outcome: generation.outcome.label().to_string(),
            placeholder: generation.is_placeholder(),
        });
        generation
    }

    fn execute(&self, request: &GenerationRequest<'_>) -> Result<(String, ImageTensor), Outcome> {
        let job = match submit(
            self.transport,
            self.config,
            request.endpoint,
            request.payload,
            request.region,
        ) {
            Ok(job) => job,
            Err(err) => {
                let reason = err.to_string();
                self.log.record(JobEvent::SubmitFailed {
                    node: request.node.to_string(),
                    endpoint: request.endpoint.to_string(),
                    reason: reason.clone(),
                });
                return Err(Outcome::SubmitFailed { reason });
            }
        };
        self.log.record(JobEvent::JobSubmitted {
            node: request.node.to_string(),
            endpoint: request.endpoint.to_string(),
            job_id: job.id.clone(),
            region: job.region.clone(),
            payload_digest: payload_digest(request.payload),
        });

        let status_url = Poller::status_url(self.config, &job).map_err(|err| Outcome::JobFailed {
            job_id: job.id.clone(),
            status: format!("unpollable: {err:#}"),
        })?;
        let poller = Poller::new(self.transport, self.sleeper, self.policy);
        let payload = match poller.poll(&status_url, &self.config.api_key, &job, self.log) {
            PollOutcome::Ready { payload, .. } => payload,
            PollOutcome::Failed { status, .. } => {
                return Err(Outcome::JobFailed {
                    job_id: job.id,
                    status: status.to_string(),
                })
            }
            PollOutcome::UnknownStatus { status, .. } => {
                return Err(Outcome::UnknownStatus {
                    job_id: job.id,
                    status,
                })
            }
            PollOutcome::Exhausted { attempts, .. } => {
                return Err(Outcome::Exhausted {
                    job_id: job.id,
                    attempts,
                })
            }
        };

        let output_format = request
            .payload
            .get("output_format")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_OUTPUT_FORMAT);
        match try_materialize(self.transport, &payload, output_format) {
            Ok(image) => Ok((job.id, image)),
            Err(err) => {
                warn!(job_id = %job.id, "error processing image result: {err:#}");
                Err(Outcome::MaterializeFailed {
                    job_id: job.id,
                    reason: format!("{err:#}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bfl_contracts::events::EventWriter;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;

    use super::*;
    use crate::materialize::tests::encoded;
    use crate::poller::tests::RecordingSleeper;
    use crate::transport::fake::ScriptedTransport;
    use crate::transport::HttpReply;

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            api_key: "secret".to_string(),
            base_url: "https://api.test/v1".to_string(),
            regions: [("us".to_string(), "https://api.us1.test".to_string())]
                .into_iter()
                .collect(),
            default_region: None,
        }
    }

    fn payload(format: &str) -> Payload {
        json!({"prompt": "lighthouse", "width": 64, "height": 32, "output_format": format})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    fn run(
        transport: &ScriptedTransport,
        sleeper: &RecordingSleeper,
        payload: &Payload,
        region: Option<&str>,
        log: &JobLog,
    ) -> Generation {
        let config = config();
        let pipeline = Pipeline {
            transport,
            sleeper,
            policy: PollPolicy {
                interval: Duration::from_secs(5),
                max_attempts: 3,
                ..PollPolicy::default()
            },
            config: &config,
            log,
        };
        pipeline.run(&GenerationRequest {
            node: "FluxDev_BFL",
            endpoint: "flux-dev",
            payload,
            region,
        })
    }

    fn script_success(transport: &ScriptedTransport) {
        let image = RgbImage::from_pixel(64, 32, Rgb([0, 255, 0]));
        transport
            .push_post(HttpReply::json(200, &json!({"id": "job-1"})))
            .push_get(HttpReply::json(200, &json!({"status": "Pending"})))
            .push_get(HttpReply::json(200, &json!({"status": "Pending"})))
            .push_get(HttpReply::json(
                200,
                &json!({"status": "Ready", "result": {"sample": "https://cdn.test/job-1.png"}}),
            ))
            .serve_download(
                "https://cdn.test/job-1.png",
                HttpReply::new(200, encoded(&image, ImageFormat::Png)),
            );
    }

    #[test]
    fn ready_job_yields_downloaded_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = temp.path().join("events.jsonl");
        let log = JobLog::new(Some(EventWriter::new(&events)));
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let sleeper = RecordingSleeper::default();

        let generation = run(&transport, &sleeper, &payload("png"), None, &log);
        assert_eq!(
            generation.outcome,
            Outcome::Ready {
                job_id: "job-1".to_string()
            }
        );
        assert!(!generation.is_placeholder());
        assert_eq!(generation.image.shape(), [1, 32, 64, 3]);
        assert_eq!(generation.image.as_array()[[0, 0, 0, 1]], 1.0);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(5); 2]);

        let calls = transport.calls();
        assert_eq!(calls[1].url, "https://api.test/v1/get_result?id=job-1");

        let raw = std::fs::read_to_string(&events)?;
        let kinds = raw
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).map(|row| row["type"].clone()))
            .collect::<Result<Vec<Value>, _>>()?;
        assert_eq!(
            kinds,
            vec![
                json!("job_submitted"),
                json!("job_polled"),
                json!("job_polled"),
                json!("job_polled"),
                json!("job_finished"),
            ]
        );
        Ok(())
    }

    #[test]
    fn submit_failure_returns_placeholder_without_polling() {
        let transport = ScriptedTransport::new();
        transport.push_post(HttpReply::new(401, "{\"detail\": \"bad key\"}"));
        let sleeper = RecordingSleeper::default();

        let generation = run(&transport, &sleeper, &payload("jpeg"), None, &JobLog::disabled());
        assert!(generation.is_placeholder());
        assert!(matches!(generation.outcome, Outcome::SubmitFailed { .. }));
        assert_eq!(generation.image, ImageTensor::placeholder());
        assert_eq!(transport.count("GET"), 0);
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn moderated_job_returns_placeholder() {
        let transport = ScriptedTransport::new();
        transport
            .push_post(HttpReply::json(200, &json!({"id": "job-2"})))
            .push_get(HttpReply::json(200, &json!({"status": "Content Moderated"})));
        let sleeper = RecordingSleeper::default();

        let generation = run(&transport, &sleeper, &payload("jpeg"), None, &JobLog::disabled());
        assert_eq!(
            generation.outcome,
            Outcome::JobFailed {
                job_id: "job-2".to_string(),
                status: "Content Moderated".to_string(),
            }
        );
        assert_eq!(generation.image, ImageTensor::placeholder());
    }

    #[test]
    fn exhausted_and_broken_results_return_placeholder() {
        let transport = ScriptedTransport::new();
        transport.push_post(HttpReply::json(200, &json!({"id": "job-3"})));
        for _ in 0..3 {
            transport.push_get(HttpReply::json(200, &json!({"status": "Pending"})));
        }
        let sleeper = RecordingSleeper::default();
        let generation = run(&transport, &sleeper, &payload("jpeg"), None, &JobLog::disabled());
        assert_eq!(
            generation.outcome,
            Outcome::Exhausted {
                job_id: "job-3".to_string(),
                attempts: 3,
            }
        );
        assert_eq!(sleeper.delays().len(), 2);

        let transport = ScriptedTransport::new();
        transport
            .push_post(HttpReply::json(200, &json!({"id": "job-4"})))
            .push_get(HttpReply::json(200, &json!({"status": "Ready", "result": {}})));
        let generation = run(
            &transport,
            &RecordingSleeper::default(),
            &payload("jpeg"),
            None,
            &JobLog::disabled(),
        );
        assert!(matches!(generation.outcome, Outcome::MaterializeFailed { .. }));
        assert_eq!(generation.image, ImageTensor::placeholder());

        let transport = ScriptedTransport::new();
        transport
            .push_post(HttpReply::json(200, &json!({"id": "job-6"})))
            .push_get(HttpReply::json(
                200,
                &json!({"status": "Ready", "result": {"sample": "https://cdn.test/gone.png"}}),
            ))
            .serve_download("https://cdn.test/gone.png", HttpReply::new(404, "gone"));
        let generation = run(
            &transport,
            &RecordingSleeper::default(),
            &payload("png"),
            None,
            &JobLog::disabled(),
        );
        assert!(matches!(generation.outcome, Outcome::MaterializeFailed { .. }));
        assert_eq!(generation.image, ImageTensor::placeholder());
    }

    #[test]
    fn regional_job_polls_same_region() {
        let transport = ScriptedTransport::new();
        transport
            .push_post(HttpReply::json(200, &json!({"id": "job-5"})))
            .push_get(HttpReply::json(200, &json!({"status": "Error"})));
        run(
            &transport,
            &RecordingSleeper::default(),
            &payload("jpeg"),
            Some("us"),
            &JobLog::disabled(),
        );
        let calls = transport.calls();
        assert_eq!(calls[0].url, "https://api.us1.test/v1/flux-dev");
        assert_eq!(calls[1].url, "https://api.us1.test/v1/get_result?id=job-5");
    }
}
