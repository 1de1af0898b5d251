use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bfl_contracts::config::{ConfigOverride, ConfigResolver, ConfigStore, NO_REGION};
use bfl_contracts::events::EventWriter;
use bfl_contracts::nodes::{NodeInputs, NodeOutput, NodeRegistry, NodeSpec, REGION_INPUT};
use bfl_engine::{EngineOptions, NodeEngine, NodeValue, PollPolicy};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bfl-nodes", version, about = "Run BFL Flux generation nodes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered nodes.
    Nodes(NodesArgs),
    /// Print a node's input schema as JSON.
    Schema(SchemaArgs),
    /// Invoke a node.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct NodesArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct SchemaArgs {
    node: String,
}

#[derive(Debug, Parser)]
struct RunArgs {
    node: String,
    /// Node input as `name=value`; repeatable.
    #[arg(long = "input", short = 'i')]
    inputs: Vec<String>,
    /// Image input as `name=path`, sent base64-encoded.
    #[arg(long = "image")]
    images: Vec<String>,
    /// Where image outputs are written (PNG).
    #[arg(long, default_value = "output.png")]
    out: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    x_key: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("bfl-nodes error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Nodes(args) => run_nodes(args),
        Command::Schema(args) => run_schema(args),
        Command::Run(args) => run_node(args),
    }
}

fn run_nodes(args: NodesArgs) -> Result<i32> {
    let registry = NodeRegistry::default();
    let nodes: Vec<&NodeSpec> = match &args.category {
        Some(category) => registry.by_category(category),
        None => registry.list().collect(),
    };
    if args.json {
        let rows: Vec<Value> = nodes
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "display_name": spec.display_name,
                    "category": spec.category,
                    "endpoint": spec.endpoint(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    for spec in nodes {
        println!(
            "{:<32} {:<14} {}",
            spec.name, spec.category, spec.display_name
        );
    }
    Ok(0)
}

fn run_schema(args: SchemaArgs) -> Result<i32> {
    let registry = NodeRegistry::default();
    let spec = registry
        .get(&args.node)
        .ok_or_else(|| anyhow!("unknown node '{}'", args.node))?;
    println!("{}", serde_json::to_string_pretty(&spec.input_schema())?);
    Ok(0)
}

fn run_node(args: RunArgs) -> Result<i32> {
    let config_path = args.config.clone().unwrap_or_else(ConfigStore::default_path);
    let store = ConfigStore::load(&config_path)?;
    let resolver = ConfigResolver::new(store);

    let options = EngineOptions {
        poll: poll_policy(&args),
        ..EngineOptions::default()
    };
    let mut engine = NodeEngine::new(resolver, options)?;
    if let Some(path) = &args.events {
        engine = engine.with_events(EventWriter::new(path));
    }

    let spec = engine
        .registry()
        .get(&args.node)
        .ok_or_else(|| anyhow!("unknown node '{}'", args.node))?;
    let inputs = parse_inputs(spec, &args.inputs, &args.images)?;
    let override_config = config_override(&args);

    let value = engine.invoke(&args.node, &inputs, override_config.as_ref())?;
    match value {
        NodeValue::Image(generation) => {
            generation.image.save_png(&args.out)?;
            if generation.is_placeholder() {
                warn!(
                    outcome = generation.outcome.label(),
                    out = %args.out.display(),
                    "wrote placeholder image"
                );
                return Ok(2);
            }
            info!(out = %args.out.display(), "image written");
        }
        NodeValue::Text(lines) => {
            let names = match &spec.output {
                NodeOutput::Text { names } => names.clone(),
                _ => Vec::new(),
            };
            for (index, line) in lines.iter().enumerate() {
                match names.get(index).filter(|_| lines.len() > 1) {
                    Some(name) => println!("{name}: {line}"),
                    None => println!("{line}"),
                }
            }
        }
        NodeValue::Config(config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(0)
}

fn poll_policy(args: &RunArgs) -> PollPolicy {
    let mut policy = PollPolicy::default();
    if let Some(max_attempts) = args.max_attempts.filter(|value| *value > 0) {
        policy.max_attempts = max_attempts;
    }
    if let Some(seconds) = args.poll_interval_secs {
        policy.interval = Duration::from_secs(seconds);
    }
    policy
}

/// Only built when a flag asks for it; unset flags leave the file and env
/// values in charge.
fn config_override(args: &RunArgs) -> Option<ConfigOverride> {
    if args.x_key.is_none() && args.base_url.is_none() && args.region.is_none() {
        return None;
    }
    Some(ConfigOverride {
        x_key: args.x_key.clone(),
        base_url: args.base_url.clone(),
        default_region: args.region.clone().filter(|region| region != NO_REGION),
    })
}

fn parse_inputs(spec: &NodeSpec, raw_inputs: &[String], images: &[String]) -> Result<NodeInputs> {
    let mut inputs = NodeInputs::new();
    for raw in raw_inputs {
        let (name, value) = split_pair(raw)?;
        let parsed = match spec.field(name) {
            Some(field) => field.parse_text(value)?,
            None if name == REGION_INPUT && spec.accepts_region => Value::String(value.to_string()),
            None => bail!("node '{}' has no input '{name}'", spec.name),
        };
        inputs.insert(name.to_string(), parsed);
    }
    for raw in images {
        let (name, path) = split_pair(raw)?;
        if spec.field(name).is_none() {
            bail!("node '{}' has no input '{name}'", spec.name);
        }
        inputs.insert(name.to_string(), Value::String(encode_file(Path::new(path))?));
    }
    spec.validate(&inputs)?;
    Ok(inputs)
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("input name is empty in '{raw}'");
    }
    Ok((name, value))
}

fn encode_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}
