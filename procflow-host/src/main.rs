//! procflow command line host
//!
//! Usage:
//!   procflow validate definitions/order-flow.yaml
//!   procflow run order-flow --definitions definitions \
//!     --var amount=250 --business-key order-7 --message payment-received
//!
//! `run` drives a single instance to rest: tasks are completed by `--actor`,
//! queued signals and messages are published once the instance waits, and
//! pending timers are awaited. The final instance and its execution history
//! are printed as JSON.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use procflow_core::definition::load_graph_yaml;
use procflow_core::{
    Actor, DirectoryGraphProvider, EngineConfig, GraphProvider, MemoryStore, Orchestrator,
    ProcessGraph, TaskAccessPolicy, Variables,
};

#[derive(Parser, Debug)]
#[command(name = "procflow")]
#[command(about = "Validate and run process definitions")]
struct Args {
    /// Engine config file (YAML)
    #[arg(long, global = true, env = "PROCFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a definition file
    Validate {
        file: PathBuf,
    },

    /// Start an instance and drive it until it ends or stalls
    Run {
        /// Definition id (file stem under the definitions directory)
        definition: String,

        /// Definitions directory (overrides the config file)
        #[arg(long, short = 'd')]
        definitions: Option<PathBuf>,

        /// Initial variables, key=value; values parse as JSON, else as strings
        #[arg(long = "var", short = 'v', value_parser = parse_key_val)]
        vars: Vec<(String, String)>,

        #[arg(long)]
        business_key: Option<String>,

        /// Actor that starts the instance and completes its tasks
        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long = "role")]
        roles: Vec<String>,

        #[arg(long = "group")]
        groups: Vec<String>,

        /// Signals to publish, in order, whenever the instance waits
        #[arg(long = "signal")]
        signals: Vec<String>,

        /// Messages to publish (correlated on the business key), in order
        #[arg(long = "message")]
        messages: Vec<String>,

        /// Longest single timer wait before giving up, in seconds
        #[arg(long, default_value_t = 300)]
        max_wait_secs: u64,
    },
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn to_variables(pairs: Vec<(String, String)>) -> Variables {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
            (k, value)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Validate { file } => validate(&file),
        Command::Run {
            definition,
            definitions,
            vars,
            business_key,
            actor,
            roles,
            groups,
            signals,
            messages,
            max_wait_secs,
        } => {
            let dir = definitions
                .or_else(|| config.definitions_dir.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            let actor = Actor::new(actor).with_roles(roles).with_groups(groups);
            let run = RunRequest {
                definition,
                variables: to_variables(vars),
                business_key,
                actor,
                signals: signals.into(),
                messages: messages.into(),
                max_wait: Duration::from_secs(max_wait_secs),
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let result = tokio::select! {
                result = run_instance(config, dir, run, shutdown_rx) => result,
                _ = tokio::signal::ctrl_c() => Err(anyhow!("Interrupted")),
            };
            shutdown_tx.send(true).ok();
            result
        }
    }
}

fn validate(file: &std::path::Path) -> Result<()> {
    let yaml = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let graph = load_graph_yaml(&yaml)?;
    println!(
        "{}: ok ({} nodes, {} edges, fingerprint {})",
        graph.id(),
        graph.nodes().len(),
        graph.edges().len(),
        hex::encode(graph.fingerprint())
    );
    Ok(())
}

struct RunRequest {
    definition: String,
    variables: Variables,
    business_key: Option<String>,
    actor: Actor,
    signals: VecDeque<String>,
    messages: VecDeque<String>,
    max_wait: Duration,
}

async fn run_instance(
    config: EngineConfig,
    dir: PathBuf,
    mut run: RunRequest,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let graphs = Arc::new(DirectoryGraphProvider::new(&dir));
    let graph = graphs
        .load_graph(&run.definition)
        .await?
        .ok_or_else(|| anyhow!("No definition '{}' in {}", run.definition, dir.display()))?;
    let policy = TaskAccessPolicy::new(config.task_access.clone());
    let max_rounds = config.max_steps_per_advance;
    let engine = Orchestrator::new(
        graphs,
        Arc::new(MemoryStore::new()),
        Arc::new(policy),
        config,
    );
    let _compactor = engine.spawn_compactor(shutdown);

    let instance = engine
        .start(
            &run.definition,
            &run.actor.id,
            std::mem::take(&mut run.variables),
            run.business_key.clone(),
        )
        .await?;
    let id = instance.id;

    for _ in 0..max_rounds {
        let instance = engine.get_instance(id).await?;
        if !instance.is_active() {
            break;
        }

        if let Some(node_id) = instance
            .current_nodes
            .iter()
            .find(|n| is_completable(&graph, n))
        {
            engine
                .complete_task(id, node_id, &run.actor, Variables::new())
                .await?;
            continue;
        }
        if let Some(name) = run.signals.pop_front() {
            let delivered = engine.publish_signal(&name, Variables::new()).await;
            tracing::info!(signal = %name, delivered, "Signal published");
            continue;
        }
        if let Some(name) = run.messages.pop_front() {
            let delivered = engine
                .publish_message(&name, run.business_key.as_deref(), Variables::new())
                .await;
            tracing::info!(message = %name, delivered, "Message published");
            continue;
        }
        if !wait_for_timer(&engine, id, run.max_wait).await? {
            tracing::warn!(
                instance_id = %id,
                current = ?instance.current_nodes,
                "Instance is waiting on nothing the CLI can provide"
            );
            break;
        }
    }

    let instance = engine.get_instance(id).await?;
    let executions = engine.executions(id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "instance": instance,
            "executions": executions,
        }))?
    );
    Ok(())
}

/// Nodes the CLI completes on the actor's behalf. Triggered waits are left
/// to the queued signals, messages and timers.
fn is_completable(graph: &ProcessGraph, node_id: &str) -> bool {
    graph.node(node_id).is_some_and(|node| node.is_completable())
}

/// Sleep until the instance's next timer is due. Returns false when none is pending.
async fn wait_for_timer(engine: &Orchestrator, id: Uuid, max_wait: Duration) -> Result<bool> {
    let Some(next) = engine
        .triggers()
        .timers_for_instance(id)
        .into_iter()
        .map(|t| t.fire_at)
        .min()
    else {
        return Ok(false);
    };
    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    if wait > max_wait {
        bail!("next timer is due in {:?}, beyond --max-wait-secs", wait);
    }
    tracing::info!(instance_id = %id, wait_ms = wait.as_millis() as u64, "Waiting for timer");
    tokio::time::sleep(wait + Duration::from_millis(50)).await;
    Ok(true)
}
