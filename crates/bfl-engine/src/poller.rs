use std::thread;
use std::time::Duration;

use anyhow::Result;
use bfl_contracts::config::ResolvedConfig;
use bfl_contracts::events::JobEvent;
use bfl_contracts::status::Status;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::jobs::{JobHandle, JobLog};
use crate::transport::{truncate_text, with_query, FluxTransport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// What to do with a status string outside the known enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownStatusPolicy {
    #[default]
    Retry,
    Fail,
}

/// Fixed-interval, bounded retry policy shared by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub unknown_status: UnknownStatusPolicy,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unknown_status: UnknownStatusPolicy::default(),
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready { payload: Value, attempts: u32 },
    Failed { status: Status, payload: Value, attempts: u32 },
    UnknownStatus { status: String, attempts: u32 },
    Exhausted { attempts: u32, last_status: Option<String> },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. }
            | PollOutcome::Failed { attempts, .. }
            | PollOutcome::UnknownStatus { attempts, .. }
            | PollOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

enum Check {
    Ready(Value),
    Pending,
    Terminal(Status, Value),
    Unknown(String),
    Retry(String),
}

pub struct Poller<'a> {
    transport: &'a dyn FluxTransport,
    sleeper: &'a dyn Sleeper,
    policy: PollPolicy,
}

impl<'a> Poller<'a> {
    pub fn new(transport: &'a dyn FluxTransport, sleeper: &'a dyn Sleeper, policy: PollPolicy) -> Self {
        Self {
            transport,
            sleeper,
            policy,
        }
    }

    /// Prefer the `polling_url` handed back on submit; otherwise
    /// `get_result?id=` on the region the job was submitted to.
    pub fn status_url(config: &ResolvedConfig, job: &JobHandle) -> Result<String> {
        if let Some(url) = &job.polling_url {
            return Ok(url.clone());
        }
        with_query(
            &config.url("get_result", job.region.as_deref()),
            &[("id", job.id.as_str())],
        )
    }

    /// Poll until a terminal status or `max_attempts`. Sleeps between
    /// attempts only, never after the last one.
    pub fn poll(&self, status_url: &str, api_key: &str, job: &JobHandle, log: &JobLog) -> PollOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let check = self.check_once(status_url, api_key);
            let reported = match &check {
                Check::Ready(_) => Some(Status::Ready.to_string()),
                Check::Pending => Some(Status::Pending.to_string()),
                Check::Terminal(status, _) => Some(status.to_string()),
                Check::Unknown(raw) => Some(raw.clone()),
                Check::Retry(_) => None,
            };
            log.record(JobEvent::JobPolled {
                job_id: job.id.clone(),
                attempt,
                max_attempts,
                status: reported.clone(),
            });
            if reported.is_some() {
                last_status = reported;
            }

            match check {
                Check::Ready(payload) => {
                    info!(job_id = %job.id, attempt, "job ready");
                    return PollOutcome::Ready {
                        payload,
                        attempts: attempt,
                    };
                }
                Check::Terminal(status, payload) => {
                    warn!(job_id = %job.id, %status, "terminal status; stopping retries");
                    return PollOutcome::Failed {
                        status,
                        payload,
                        attempts: attempt,
                    };
                }
                Check::Unknown(raw) => match self.policy.unknown_status {
                    UnknownStatusPolicy::Fail => {
                        warn!(job_id = %job.id, status = %raw, "unknown status; giving up");
                        return PollOutcome::UnknownStatus {
                            status: raw,
                            attempts: attempt,
                        };
                    }
                    UnknownStatusPolicy::Retry => {
                        warn!(job_id = %job.id, status = %raw, attempt, max_attempts, "unknown status; retrying");
                    }
                },
                Check::Pending => {
                    debug!(job_id = %job.id, attempt, max_attempts, "job pending");
                }
                Check::Retry(reason) => {
                    warn!(job_id = %job.id, attempt, max_attempts, %reason, "poll attempt failed");
                }
            }

            if attempt < max_attempts {
                self.sleeper.sleep(self.policy.interval);
            }
        }

        warn!(job_id = %job.id, max_attempts, "all attempts exhausted");
        PollOutcome::Exhausted {
            attempts: max_attempts,
            last_status,
        }
    }

    fn check_once(&self, status_url: &str, api_key: &str) -> Check {
        let reply = match self.transport.get(status_url, Some(api_key)) {
            Ok(reply) => reply,
            Err(err) => return Check::Retry(format!("{err:#}")),
        };
        if !reply.is_ok() {
            return Check::Retry(format!(
                "HTTP {}: {}",
                reply.status,
                truncate_text(&reply.text(), 512)
            ));
        }
        let payload = match reply.parse_json() {
            Ok(payload) => payload,
            Err(err) => return Check::Retry(format!("{err:#}")),
        };
        let Some(raw) = payload.get("status").and_then(Value::as_str).map(str::to_string) else {
            return Check::Retry("response has no status".to_string());
        };
        match Status::parse(&raw) {
            Some(status) if status.is_success() => Check::Ready(payload),
            Some(status) if status.is_terminal() => Check::Terminal(status, payload),
            Some(_) => Check::Pending,
            None => Check::Unknown(raw),
        }
    }
}
