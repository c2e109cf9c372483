// crates/flowcli/src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    BatchFlowRequest, ExecutionEvent, Flow, InputRow, RunMode, RunStorage, SubmissionData,
    SubmissionOutcome, SubmissionResult, SubmitFlowRequest, ToolEvent, Value,
};
use flowruntime::{
    validate_flow, ConnectionManager, ExecutionContext, FlowExecutor, FlowRuntime,
    InMemoryRunStorage, RunTracker, RuntimeConfig, ToolRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow execution CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a submission request document
    Submit {
        /// Path to the request JSON file
        #[arg(short, long)]
        request: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show run events as they happen
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run a flow file once over a single input line
    Test {
        /// Path to flow.yaml
        #[arg(short, long)]
        file: PathBuf,

        /// Input line as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Pick a node variant, as `node.variant_id`
        #[arg(long)]
        variant: Option<String>,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file and resolve its tools
    Validate {
        /// Path to flow.yaml
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List tool types and package tools
    Tools,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    flownodes::register_all(&mut registry)?;
    Ok(registry)
}

fn build_runtime(config: RuntimeConfig) -> Result<FlowRuntime> {
    let connections = ConnectionManager::from_env()?;
    Ok(FlowRuntime::new(build_registry()?, config).with_connections(connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            request,
            output,
            verbose,
        } => {
            init_logging(verbose);
            submit(request, output, verbose).await?;
        }

        Commands::Test {
            file,
            input,
            variant,
            verbose,
        } => {
            init_logging(verbose);
            test_flow(file, input, variant, verbose).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate(file)?;
        }

        Commands::Tools => {
            list_tools()?;
        }
    }

    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⏹️  Cancelling, waiting for running nodes to finish...");
            token.cancel();
        }
    });
}

fn print_events(runtime: &FlowRuntime) -> tokio::task::JoinHandle<()> {
    let mut events = runtime.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowRunStarted {
                    run_id, parent_run_id, ..
                } => {
                    if parent_run_id.is_none() {
                        eprintln!("▶️  Flow run {} started", run_id);
                    }
                }
                ExecutionEvent::FlowRunCompleted {
                    run_id,
                    status,
                    duration_ms,
                    ..
                } => {
                    eprintln!("  🏁 Flow run {} {} in {}ms", run_id, status, duration_ms);
                }
                ExecutionEvent::NodeRunStarted { run_id, node, .. } => {
                    eprintln!("  ⚡ Starting node {} ({})", node, run_id);
                }
                ExecutionEvent::NodeRunCompleted {
                    node,
                    cached,
                    duration_ms,
                    ..
                } => {
                    let suffix = if cached { " (cached)" } else { "" };
                    eprintln!("  ✅ Node {} completed in {}ms{}", node, duration_ms, suffix);
                }
                ExecutionEvent::NodeRunBypassed { node, .. } => {
                    eprintln!("  ⏭️  Node {} bypassed", node);
                }
                ExecutionEvent::NodeRunFailed { node, error, .. } => {
                    eprintln!("  ❌ Node {} failed: {}", node, error.message);
                }
                ExecutionEvent::RequestRejected { flow_run_id, error, .. } => {
                    eprintln!("💥 Request {} rejected: {}", flow_run_id, error.message);
                }
                ExecutionEvent::ToolEvent { node, event, .. } => match event {
                    ToolEvent::Info { message } => eprintln!("     ℹ️  [{}] {}", node, message),
                    ToolEvent::Warning { message } => eprintln!("     ⚠️  [{}] {}", node, message),
                    ToolEvent::Progress { percent, message } => match message {
                        Some(msg) => eprintln!("     📊 [{}] {}% - {}", node, percent, msg),
                        None => eprintln!("     📊 [{}] {}%", node, percent),
                    },
                    ToolEvent::Data { .. } => {}
                },
            }
        }
    })
}

async fn submit(request: PathBuf, output: Option<PathBuf>, verbose: bool) -> Result<()> {
    let content = std::fs::read_to_string(&request)
        .with_context(|| format!("reading {}", request.display()))?;
    let doc: Value = serde_json::from_str(&content)?;
    let request = SubmitFlowRequest::from_value(doc)?;
    tracing::info!(
        flow_id = %request.flow_id,
        flow_run_id = %request.flow_run_id,
        run_mode = ?request.run_mode,
        "Submitting request"
    );

    let runtime = build_runtime(RuntimeConfig::from_env())?;
    let events = verbose.then(|| print_events(&runtime));
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let result = runtime.submit_with_cancellation(request, token).await;
    if let Some(task) = events {
        tokio::task::yield_now().await;
        task.abort();
    }
    let result = result?;

    let rendered = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            std::fs::write(&path, rendered)?;
            eprintln!("📤 Result written to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    report_outcome(&result)
}

fn report_outcome(result: &SubmissionResult) -> Result<()> {
    match result.outcome() {
        SubmissionOutcome::Succeeded => Ok(()),
        SubmissionOutcome::PartiallyFailed => {
            eprintln!("⚠️  Some runs failed");
            Ok(())
        }
        SubmissionOutcome::Failed => bail!("submission failed"),
    }
}

/// Point the variant-bearing node at `node.variant_id`.
fn select_variant(flow: &mut Flow, selector: &str) -> Result<()> {
    let (node, variant_id) = selector
        .split_once('.')
        .ok_or_else(|| anyhow!("variant must be given as node.variant_id, got '{}'", selector))?;
    let variants = flow
        .node_variants
        .get_mut(node)
        .ok_or_else(|| anyhow!("node '{}' has no variants", node))?;
    if !variants.variants.contains_key(variant_id) {
        let mut known: Vec<&String> = variants.variants.keys().collect();
        known.sort();
        bail!("node '{}' has no variant '{}' (known: {:?})", node, variant_id, known);
    }
    variants.default_variant_id = variant_id.to_string();
    Ok(())
}

fn parse_input(input: Option<String>) -> Result<InputRow> {
    let Some(input) = input else {
        return Ok(InputRow::new());
    };
    match serde_json::from_str(&input)? {
        Value::Object(obj) => Ok(obj.into_iter().collect()),
        _ => bail!("input must be a JSON object"),
    }
}

fn flow_id_for(flow: &Flow, file: &Path) -> String {
    if !flow.name.is_empty() {
        return flow.name.clone();
    }
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flow".to_string())
}

async fn test_flow(
    file: PathBuf,
    input: Option<String>,
    variant: Option<String>,
    verbose: bool,
) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let mut flow = Flow::from_yaml(&file, None)?;
    if let Some(selector) = &variant {
        select_variant(&mut flow, selector)?;
    }
    let row = parse_input(input)?;

    // Templates and scripts are relative to the flow file.
    let mut config = RuntimeConfig::from_env();
    if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
        config = config.with_working_dir(dir);
    }
    let runtime = build_runtime(config)?;
    let events = verbose.then(|| print_events(&runtime));

    let flow_id = flow_id_for(&flow, &file);
    let run_id = uuid::Uuid::new_v4().to_string();
    println!("📋 Flow: {} ({} nodes)", flow_id, flow.nodes.len());

    let request = SubmitFlowRequest::new(
        flow_id,
        run_id.clone(),
        RunMode::Flow,
        SubmissionData::Batch(BatchFlowRequest::new(flow, vec![row])),
    );
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let result = runtime.submit_with_cancellation(request, token).await;
    if let Some(task) = events {
        tokio::task::yield_now().await;
        task.abort();
    }
    let result = result?;

    println!();
    println!("📊 Run {}:", run_id);
    for run in result.node_runs.iter() {
        match &run.error {
            Some(error) => println!("   {} {}: {}", run.node, run.status, error.message),
            None => println!("   {} {}", run.node, run.status),
        }
    }
    if let Some(root) = result.flow_runs.iter().find(|r| r.is_root()) {
        if let Some(output) = &root.output {
            println!();
            println!("📤 Outputs:");
            println!("{}", serde_json::to_string_pretty(output)?);
        }
    }
    report_outcome(&result)
}

fn validate(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());
    let mut flow = Flow::from_yaml(&file, None)?;
    flow.apply_default_node_variants();
    let order = validate_flow(&flow)?;

    // Resolving the tools catches unknown tools and missing connections.
    let storage: Arc<dyn RunStorage> = Arc::new(InMemoryRunStorage::new());
    let tracker = Arc::new(RunTracker::new(
        storage,
        Arc::new(flowcore::EventBus::new(16)),
    ));
    let mut config = RuntimeConfig::from_env();
    if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
        config = config.with_working_dir(dir);
    }
    let ctx = ExecutionContext::new(Arc::new(build_registry()?), tracker, config)
        .with_connections(ConnectionManager::from_env()?.to_map());
    FlowExecutor::create(flow.clone(), &ctx)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", flow.name);
    println!("   Nodes: {}", order.join(" → "));
    if !flow.node_variants.is_empty() {
        let mut nodes: Vec<&String> = flow.node_variants.keys().collect();
        nodes.sort();
        for node in nodes {
            let variants = &flow.node_variants[node];
            let mut ids: Vec<&String> = variants.variants.keys().collect();
            ids.sort();
            println!(
                "   Variants of {}: {:?} (default {})",
                node, ids, variants.default_variant_id
            );
        }
    }
    Ok(())
}

fn list_tools() -> Result<()> {
    let registry = build_registry()?;

    println!("📦 Tool types:");
    for tool_type in registry.list_tool_types() {
        match registry.factory(tool_type).map(|f| f.description()) {
            Some(description) if !description.is_empty() => {
                println!("  • {} - {}", tool_type, description)
            }
            _ => println!("  • {}", tool_type),
        }
    }

    println!();
    println!("📦 Package tools:");
    for tool in registry.list_package_tools() {
        println!("  • {}", tool.name);
        if let Some(description) = &tool.description {
            println!("    {}", description);
        }
        if !tool.deprecated_tools.is_empty() {
            println!("    aliases: {}", tool.deprecated_tools.join(", "));
        }
    }
    Ok(())
}
