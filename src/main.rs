//! Run a workflow file and print its event stream as JSON lines.
//!
//! ```text
//! xworkflow-engine <workflow.{yaml,json,toml}> [inputs.json] [--config <engine.{yaml,json,toml}>]
//! ```

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use xworkflow_engine::{
    parse_dsl, ConfigFormat, DslFormat, EngineConfig, ExecutionStatus, RunRequest, WorkflowRunner,
};

fn format_of(path: &Path) -> Result<DslFormat> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    DslFormat::from_extension(ext).with_context(|| format!("unsupported file type: {}", path.display()))
}

struct Args {
    workflow: String,
    inputs: Option<String>,
    config: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config = Some(args.next().context("--config needs a path")?);
        } else {
            positional.push(arg);
        }
    }
    let mut positional = positional.into_iter();
    let Some(workflow) = positional.next() else {
        bail!("usage: xworkflow-engine <workflow> [inputs.json] [--config <file>]");
    };
    Ok(Args {
        workflow,
        inputs: positional.next(),
        config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => {
            let path = Path::new(path);
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let format: ConfigFormat = format_of(path)?;
            EngineConfig::from_str(&content, format)?
        }
        None => EngineConfig::default().with_env_overrides(|k| std::env::var(k).ok())?,
    };

    let workflow_path = Path::new(&args.workflow);
    let content = std::fs::read_to_string(workflow_path)
        .with_context(|| format!("reading workflow {}", workflow_path.display()))?;
    let schema = parse_dsl(&content, format_of(workflow_path)?)?;
    tracing::info!(nodes = schema.nodes.len(), edges = schema.edges.len(), "workflow parsed");

    let inputs: HashMap<String, Value> = match &args.inputs {
        Some(path) => serde_json::from_str(
            &std::fs::read_to_string(path).with_context(|| format!("reading inputs {}", path))?,
        )?,
        None => HashMap::new(),
    };

    let runner = WorkflowRunner::builder(schema)
        .config(config)
        .collect_events(false)
        .build()?;
    let handle = runner.run(RunRequest::new(inputs)).await?;

    if let Some(mut listener) = handle.take_listener() {
        while let Some(message) = listener.next_message().await {
            println!("{}", serde_json::to_string(&message)?);
        }
    }

    match handle.wait().await {
        ExecutionStatus::Failed(error) => bail!("workflow failed: {}", error),
        status => tracing::info!(?status, "workflow finished"),
    }
    Ok(())
}
