//! ob-stage-worker: stage progress sync and condition actions against the
//! onboarding database.
//!
//! Reads config from env vars (a `.env` file is honoured):
//!   OB_STAGE_DATABASE_URL        Postgres connection string (or --database-url)
//!   OB_STAGE_DB_MAX_CONNECTIONS  pool size (default: 5)
//!   OB_STAGE_SUCCESS_POLICY      any | all (default: any)
//!   OB_STAGE_EVENTS_ENABLED      audit log on/off (default: true)
//!   OB_STAGE_EVENTS_PATH         JSONL audit log (default: data/stage_events.jsonl)
//!
//! ```bash
//! ob-stage-worker stages-changed --workflow-id 7
//! ob-stage-worker stages-merged --workflow-id 7 --source-ids 31,32 --new-stage-id 40
//! ob-stage-worker execute --onboarding-id 1200 --actions @actions.json
//! ```

mod config;
mod drain;
mod event_log;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ob_stage_core::{
    ActionExecutionContext, ActionExecutor, EventEmitter, PgStageStore, ProgressReconciler,
    SharedEmitter,
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::drain::spawn_drain;
use crate::event_log::EventLog;

#[derive(Parser)]
#[command(name = "ob-stage-worker")]
#[command(about = "Reconcile onboarding stage progress and run condition actions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides OB_STAGE_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Do not write the audit event log
    #[arg(long, global = true)]
    no_events: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every instance of a workflow
    SyncWorkflow {
        #[arg(long)]
        workflow_id: i64,

        /// Exit non-zero if any instance failed
        #[arg(long)]
        strict: bool,
    },

    /// Reconcile one instance
    SyncInstance {
        #[arg(long)]
        onboarding_id: i64,
    },

    /// After a stage was created, updated or reordered
    StagesChanged {
        #[arg(long)]
        workflow_id: i64,
    },

    /// After a stage was deleted
    StageDeleted {
        #[arg(long)]
        workflow_id: i64,

        #[arg(long)]
        stage_id: i64,
    },

    /// After stages were merged into a new stage
    StagesMerged {
        #[arg(long)]
        workflow_id: i64,

        #[arg(long, value_delimiter = ',', required = true)]
        source_ids: Vec<i64>,

        #[arg(long)]
        new_stage_id: i64,
    },

    /// Run a condition's action list against one instance
    Execute {
        #[arg(long)]
        onboarding_id: i64,

        /// Stage whose condition fired
        #[arg(long)]
        stage_id: Option<i64>,

        #[arg(long)]
        tenant_id: Option<String>,

        /// Action list JSON, or @path to read it from a file
        #[arg(long)]
        actions: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ob_stage_core=debug,ob_stage_worker=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    if cli.no_events {
        config.events.enabled = false;
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let store = Arc::new(PgStageStore::new(pool));

    let (emitter, drain) = if config.events.enabled {
        let (emitter, receiver) = EventEmitter::new(config.events.buffer_size);
        let drain = spawn_drain(
            receiver,
            EventLog::new(config.events.path.clone()),
            &config.events.drain,
        );
        (Some(Arc::new(emitter)), Some(drain))
    } else {
        (None, None)
    };

    let outcome = run(cli.command, &config, store, emitter.clone()).await;

    if let Some(emitter) = emitter {
        let stats = emitter.stats();
        if stats.dropped > 0 {
            warn!(
                emitted = stats.emitted,
                dropped = stats.dropped,
                "Audit events dropped; raise OB_STAGE_EVENT_BUFFER"
            );
        }
    }
    if let Some(drain) = drain {
        drain.shutdown().await;
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    command: Commands,
    config: &WorkerConfig,
    store: Arc<PgStageStore>,
    emitter: Option<SharedEmitter>,
) -> Result<Value> {
    let mut reconciler = ProgressReconciler::new(store.clone(), store.clone());
    if let Some(emitter) = &emitter {
        reconciler = reconciler.with_events(emitter.clone());
    }

    let output = match command {
        Commands::SyncWorkflow { workflow_id, strict } => {
            let report = reconciler.sync_workflow(workflow_id).await?;
            let value = serde_json::to_value(&report)?;
            if strict {
                report.into_result()?;
            }
            value
        }
        Commands::SyncInstance { onboarding_id } => {
            serde_json::to_value(reconciler.sync_instance(onboarding_id).await?)?
        }
        Commands::StagesChanged { workflow_id } => {
            serde_json::to_value(reconciler.on_stages_changed(workflow_id).await?)?
        }
        Commands::StageDeleted { workflow_id, stage_id } => {
            serde_json::to_value(reconciler.on_stage_deleted(workflow_id, stage_id).await?)?
        }
        Commands::StagesMerged {
            workflow_id,
            source_ids,
            new_stage_id,
        } => serde_json::to_value(
            reconciler
                .on_stages_merged(workflow_id, &source_ids, new_stage_id)
                .await?,
        )?,
        Commands::Execute {
            onboarding_id,
            stage_id,
            tenant_id,
            actions,
        } => {
            let actions = read_actions(&actions).await?;
            let mut executor =
                ActionExecutor::new(store.clone(), store.clone(), store.clone(), store.clone())
                    .with_config(config.executor());
            if let Some(emitter) = &emitter {
                executor = executor.with_events(emitter.clone());
            }

            let ctx = ActionExecutionContext {
                onboarding_id,
                stage_id,
                tenant_id,
            };
            serde_json::to_value(executor.execute(Some(&actions), &ctx).await)?
        }
    };

    Ok(output)
}

/// Inline JSON, or `@path` for a file.
async fn read_actions(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read actions from {}", path)),
        None => Ok(arg.to_string()),
    }
}
