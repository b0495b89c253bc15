// SPDX-License-Identifier: MIT

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use stepgraph_rs::config::EngineConfig;
use stepgraph_rs::sdk::progress::LogEmitter;
use stepgraph_rs::workflow::builder::Builder;
use stepgraph_rs::workflow::graph::dag::DependencyGraph;
use stepgraph_rs::workflow::graph::executor::WorkflowExecutor;
use stepgraph_rs::workflow::state::{WorkflowState, WorkflowStatus};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run DAG workflows with retries and checkpoints", long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow from a file
    Run {
        /// Path to the workflow file
        #[arg(short, long)]
        file: PathBuf,

        /// Workflow input as JSON
        #[arg(short, long, default_value = "null")]
        input: String,

        /// Workflow id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Resume a persisted workflow
    Resume {
        /// Path to the workflow file the run was started from
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        id: String,
    },
    /// Print the persisted state of a workflow
    Status {
        #[arg(long)]
        id: String,
    },
    /// Check a workflow file and print its execution layers
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// List persisted workflows
    List,
    /// Delete a persisted workflow
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref())?;
    let store = config.open_store().await?;

    match args.command {
        Commands::Run { file, input, id } => {
            let input: Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let (def, steps) = Builder::default().build_file(&file).await?;
            let id = id.unwrap_or_else(|| format!("{}-{}", def.name, uuid::Uuid::new_v4()));

            let executor = Arc::new(executor(&config, store));
            log::info!("Running workflow '{}' as {}", def.name, id);
            let _ctrl_c = cancel_on_ctrl_c(executor.clone(), id.clone());
            let state = executor.execute(&id, steps, input).await?;
            report(&state)?;
        }
        Commands::Resume { file, id } => {
            let (_, steps) = Builder::default().build_file(&file).await?;
            let executor = Arc::new(executor(&config, store));
            let _ctrl_c = cancel_on_ctrl_c(executor.clone(), id.clone());
            let state = executor.resume_with_steps(&id, steps).await?;
            report(&state)?;
        }
        Commands::Status { id } => {
            let state = store.load(&id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Validate { file } => {
            let (def, steps) = Builder::default().build_file(&file).await?;
            let graph = DependencyGraph::from_steps(&steps)?;
            println!("{}: {} steps", def.name, graph.len());
            for (i, layer) in graph.layers().iter().enumerate() {
                println!("  layer {}: {}", i, layer.join(", "));
            }
        }
        Commands::List => {
            for id in store.list().await? {
                match store.load(&id).await {
                    Ok(state) => println!("{}\t{:?}", id, state.status),
                    Err(e) => println!("{}\t<unreadable: {}>", id, e),
                }
            }
        }
        Commands::Delete { id } => {
            store.delete(&id).await?;
            println!("Deleted {}", id);
        }
    }

    Ok(())
}

fn executor(
    config: &EngineConfig,
    store: Arc<dyn stepgraph_rs::workflow::state::StateStore>,
) -> WorkflowExecutor {
    WorkflowExecutor::new(store, config.executor_config())
        .with_retry_policy(config.retry_policy())
        .with_emitter(Arc::new(LogEmitter))
}

/// Cancel the run on Ctrl-C; the handle aborts the watcher when dropped
fn cancel_on_ctrl_c(executor: Arc<WorkflowExecutor>, id: String) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling {}", id);
            if let Err(e) = executor.cancel(&id).await {
                log::error!("Failed to cancel {}: {}", id, e);
            }
        }
    }))
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn report(state: &WorkflowState) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    match state.status {
        WorkflowStatus::Completed => Ok(()),
        status => bail!("workflow {} finished as {:?}", state.workflow_id, status),
    }
}
