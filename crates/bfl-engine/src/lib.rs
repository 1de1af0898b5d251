use std::time::Duration;

use anyhow::Result;
use bfl_contracts::config::{ConfigOverride, ConfigResolver, ResolvedConfig, DEFAULT_BASE_URL};
use bfl_contracts::events::EventWriter;
use bfl_contracts::nodes::{NodeAction, NodeInputs, NodeRegistry, NodeSpec, Payload};
use bfl_contracts::{FluxError, FluxResult};
use serde_json::Value;
use tracing::{debug, info};

pub mod finetune;
pub mod jobs;
pub mod materialize;
pub mod pipeline;
pub mod poller;
pub mod tensor;
pub mod transport;

pub use finetune::{FinetuneClient, FinetuneStatus};
pub use jobs::{JobHandle, JobLog, SubmitError};
pub use pipeline::{Generation, GenerationRequest, Outcome, Pipeline};
pub use poller::{PollOutcome, PollPolicy, Poller, Sleeper, ThreadSleeper, UnknownStatusPolicy};
pub use tensor::ImageTensor;
pub use transport::{FluxTransport, HttpReply, HttpTransport};

/// Finetune calls fall back to this region when nothing else picks one.
pub const DEFAULT_FINETUNE_REGION: &str = "us";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub poll: PollPolicy,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            request_timeout: transport::DEFAULT_REQUEST_TIMEOUT,
            download_timeout: transport::DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

/// What a node hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Image(Generation),
    Text(Vec<String>),
    Config(ConfigOverride),
}

/// Runs nodes from a [`NodeRegistry`]. One engine serves many invocations;
/// each one resolves its own config and carries its own event log id.
pub struct NodeEngine {
    registry: NodeRegistry,
    resolver: ConfigResolver,
    transport: Box<dyn FluxTransport>,
    sleeper: Box<dyn Sleeper>,
    poll: PollPolicy,
    events: Option<EventWriter>,
}

impl NodeEngine {
    pub fn new(resolver: ConfigResolver, options: EngineOptions) -> Result<Self> {
        let transport = HttpTransport::new(options.request_timeout, options.download_timeout)?;
        Ok(Self::with_transport(
            resolver,
            options.poll,
            Box::new(transport),
            Box::new(ThreadSleeper),
        ))
    }

    pub fn with_transport(
        resolver: ConfigResolver,
        poll: PollPolicy,
        transport: Box<dyn FluxTransport>,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        Self {
            registry: NodeRegistry::default(),
            resolver,
            transport,
            sleeper,
            poll,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Run `node` with host `inputs`. Errors are reserved for problems the
    /// caller can fix (unknown node, bad inputs, missing key); remote
    /// failures surface as the placeholder image or error text.
    ///
    /// Widget ranges and choices are the host's job ([`NodeSpec::validate`]);
    /// only types and the multiple-of-32 dimension rule are checked here.
    pub fn invoke(
        &self,
        node: &str,
        inputs: &NodeInputs,
        override_config: Option<&ConfigOverride>,
    ) -> FluxResult<NodeValue> {
        let spec = self.spec(node)?;
        let payload = spec.build_payload(inputs)?;
        debug!(node, fields = payload.len(), "node inputs accepted");

        match &spec.action {
            NodeAction::CreateConfig => Ok(NodeValue::Config(config_from(&payload))),
            NodeAction::Generate { endpoint } => self
                .run_generation(spec, endpoint, inputs, payload, override_config)
                .map(NodeValue::Image),
            action => self.run_finetune(spec, action, inputs, payload, override_config),
        }
    }

    /// Image nodes only; anything else is a validation error.
    pub fn generate(
        &self,
        node: &str,
        inputs: &NodeInputs,
        override_config: Option<&ConfigOverride>,
    ) -> FluxResult<Generation> {
        let spec = self.spec(node)?;
        let Some(endpoint) = spec.endpoint() else {
            return Err(FluxError::Validation(format!(
                "node '{node}' does not generate images"
            )));
        };
        let payload = spec.build_payload(inputs)?;
        self.run_generation(spec, endpoint, inputs, payload, override_config)
    }

    fn spec(&self, node: &str) -> FluxResult<&NodeSpec> {
        self.registry
            .get(node)
            .ok_or_else(|| FluxError::UnknownNode(node.to_string()))
    }

    fn run_generation(
        &self,
        spec: &NodeSpec,
        endpoint: &str,
        inputs: &NodeInputs,
        payload: Payload,
        override_config: Option<&ConfigOverride>,
    ) -> FluxResult<Generation> {
        let config = self.resolver.resolve(override_config)?;
        let region = routed_region(&config, spec.region_input(inputs))?;
        let log = JobLog::new(self.events.clone());
        info!(
            node = %spec.name,
            endpoint,
            region = region.as_deref().unwrap_or("-"),
            invocation_id = log.invocation_id(),
            "generating"
        );

        let pipeline = Pipeline {
            transport: self.transport.as_ref(),
            sleeper: self.sleeper.as_ref(),
            policy: self.poll,
            config: &config,
            log: &log,
        };
        Ok(pipeline.run(&GenerationRequest {
            node: &spec.name,
            endpoint,
            payload: &payload,
            region: region.as_deref(),
        }))
    }

    fn run_finetune(
        &self,
        spec: &NodeSpec,
        action: &NodeAction,
        inputs: &NodeInputs,
        payload: Payload,
        override_config: Option<&ConfigOverride>,
    ) -> FluxResult<NodeValue> {
        let config = self.resolver.resolve(override_config)?;
        let region = routed_region(&config, spec.region_input(inputs))?
            .unwrap_or_else(|| DEFAULT_FINETUNE_REGION.to_string());
        let log = JobLog::new(self.events.clone());
        let client = FinetuneClient::new(self.transport.as_ref(), &config, &region, &log);
        let finetune_id = text_field(&payload, "finetune_id");

        let lines = match action {
            NodeAction::FinetuneCreate => vec![client.create(payload)],
            NodeAction::FinetuneStatus => client.status(&finetune_id).into_vec(),
            NodeAction::FinetuneList => vec![client.list()],
            NodeAction::FinetuneDetails => vec![client.details(&finetune_id)],
            NodeAction::FinetuneDelete => vec![client.delete(&finetune_id)],
            NodeAction::Generate { .. } | NodeAction::CreateConfig => {
                return Err(FluxError::Validation(format!(
                    "node '{}' is not a finetune node",
                    spec.name
                )))
            }
        };
        Ok(NodeValue::Text(lines))
    }
}

/// Effective region for a call, checked against the known endpoints.
///
/// An override's `default_region` routes every node, the plain API nodes
/// included, not just the finetune ones.
fn routed_region(config: &ResolvedConfig, requested: Option<String>) -> FluxResult<Option<String>> {
    let region = config.effective_region(requested.as_deref());
    if let Some(region) = &region {
        config.regional_endpoint(region)?;
    }
    Ok(region)
}

fn config_from(payload: &Payload) -> ConfigOverride {
    let base_url = payload
        .get("base_url")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_BASE_URL);
    let region = payload.get("region").and_then(Value::as_str);
    ConfigOverride::new(&text_field(payload, "x_key"), base_url, region)
}

fn text_field(payload: &Payload, name: &str) -> String {
    payload
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
