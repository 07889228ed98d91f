use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tempo_config::TempoConfig;
use tempo_fanout::FanOutCoordinator;
use tempo_planning::{
  JsonFileSubjectRepository, LogPlanNotifier, TemplateGenerator, weekly_plan_workflow,
};
use tempo_store::{SqliteStore, Store};
use tempo_trigger::{ScheduleRunner, TriggerDispatcher};
use tempo_workflow::{
  ChannelNotifier, ExecutionError, ExecutionEvent, ExecutorConfig, RunOutcome, WorkflowExecutor,
};

/// Tempo - durable scheduled plan generation
#[derive(Parser)]
#[command(name = "tempo")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.tempo)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to the config file (default: <data_dir>/tempo.json)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the scheduler and execute runs until interrupted
  Serve,

  /// Publish an event and execute the run it starts (payload JSON on stdin)
  Trigger {
    /// Event name (default: the first event registered in the config)
    #[arg(long)]
    event: Option<String>,
  },

  /// Continue a run after its last recorded step
  Resume { run_id: String },

  /// Re-run a failed run from its first step without a recorded result
  Retry { run_id: String },

  /// Cancel a pending or running run
  Cancel { run_id: String },

  /// List runs of the configured workflow, newest first
  Runs,

  /// Show a run with its steps and summary
  Show { run_id: String },
}

struct App {
  config: TempoConfig,
  store: Arc<SqliteStore>,
  dispatcher: Arc<TriggerDispatcher>,
  executor: Arc<WorkflowExecutor<ChannelNotifier>>,
}

fn main() -> Result<()> {
  init_tracing();
  let cli = Cli::parse();

  let Some(command) = cli.command else {
    println!("tempo - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let app = build_app(cli.data_dir, cli.config).await?;
    run_command(app, command).await
  })
}

fn init_tracing() {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tempo=debug"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_writer(io::stderr)
    .init();
}

async fn build_app(data_dir: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<App> {
  let data_dir = match data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".tempo"),
  };
  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let config_path = config_path.unwrap_or_else(|| data_dir.join("tempo.json"));
  let mut config = TempoConfig::load_or_default(&config_path)
    .with_context(|| format!("failed to load config: {}", config_path.display()))?;
  config
    .apply_env()
    .context("invalid environment override")?;

  let database_path = config.database_path(&data_dir);
  let store = Arc::new(
    SqliteStore::open(&database_path)
      .await
      .with_context(|| format!("failed to open database: {}", database_path.display()))?,
  );

  let workflow = weekly_plan_workflow(
    config.workflow_id.clone(),
    Arc::new(JsonFileSubjectRepository::new(config.subjects_path(&data_dir))),
    Arc::new(TemplateGenerator::default()),
    Arc::new(LogPlanNotifier),
    FanOutCoordinator::new(config.fanout.concurrency, config.fanout.subject_retries),
  )
  .context("failed to assemble workflow")?;

  let dispatcher = TriggerDispatcher::new(store.clone(), config.workflow_id.clone(), &config.triggers)
    .context("invalid trigger configuration")?;

  let (events_tx, events_rx) = mpsc::unbounded_channel();
  tokio::spawn(log_run_summaries(events_rx));

  let executor = WorkflowExecutor::with_notifier(
    Arc::new(workflow),
    store.clone(),
    ExecutorConfig::from_config(&config),
    ChannelNotifier::new(events_tx),
  );

  info!(
    workflow_id = %config.workflow_id,
    database = %database_path.display(),
    "tempo_initialized"
  );

  Ok(App {
    config,
    store,
    dispatcher: Arc::new(dispatcher),
    executor: Arc::new(executor),
  })
}

async fn run_command(app: App, command: Commands) -> Result<()> {
  match command {
    Commands::Serve => serve(app).await,
    Commands::Trigger { event } => {
      let event = match event {
        Some(event) => event,
        None => app
          .config
          .event_names()
          .next()
          .map(str::to_string)
          .context("no event trigger is configured")?,
      };
      let payload = read_payload_from_stdin()?;

      let request = app
        .dispatcher
        .on_event(&event, payload)
        .await
        .context("failed to publish event")?;
      eprintln!("Created run: {}", request.run_id);

      let outcome = app
        .executor
        .start(&request, CancellationToken::new())
        .await
        .context("run execution failed")?;
      print_outcome(&outcome)
    }
    Commands::Resume { run_id } => {
      let outcome = app
        .executor
        .resume(&run_id, CancellationToken::new())
        .await
        .context("run execution failed")?;
      print_outcome(&outcome)
    }
    Commands::Retry { run_id } => {
      let outcome = app
        .executor
        .retry_run(&run_id, CancellationToken::new())
        .await
        .context("run execution failed")?;
      print_outcome(&outcome)
    }
    Commands::Cancel { run_id } => {
      let cancelled = app
        .executor
        .cancel_run(&run_id)
        .await
        .context("failed to cancel run")?;
      if cancelled {
        eprintln!("Cancelled run: {run_id}");
      } else {
        eprintln!("Run {run_id} had already finished");
      }
      Ok(())
    }
    Commands::Runs => {
      let runs = app.store.list_runs(&app.config.workflow_id).await?;
      println!("{}", serde_json::to_string_pretty(&runs)?);
      Ok(())
    }
    Commands::Show { run_id } => {
      let run = app.store.get_run(&run_id).await?;
      let summary = app.store.get_summary(&run_id).await?;
      let output = serde_json::json!({ "run": run, "summary": summary });
      println!("{}", serde_json::to_string_pretty(&output)?);
      Ok(())
    }
  }
}

/// Run the schedule runner and execute requests one at a time until Ctrl-C.
///
/// Unfinished runs are rescanned at startup, after every request and once per
/// lease period, so a run blocked by another executor's lease or interrupted
/// by a store error is picked up without a restart.
async fn serve(app: App) -> Result<()> {
  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown_requested");
        cancel.cancel();
      }
    });
  }

  let (sender, mut receiver) = mpsc::channel(16);
  let runner = ScheduleRunner::new(app.dispatcher.clone());
  let runner_handle = {
    let cancel = cancel.clone();
    tokio::spawn(async move { runner.run(sender, cancel).await })
  };

  // The first tick fires immediately and doubles as the startup scan.
  let mut rescan = time::interval(app.config.lease_ttl().max(Duration::from_secs(1)));
  rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = rescan.tick() => resume_unfinished(&app, &cancel).await,
      request = receiver.recv() => {
        let Some(request) = request else { break };
        match app.executor.start(&request, cancel.clone()).await {
          Ok(outcome) => info!(run_id = %outcome.run_id, status = ?outcome.status, "run_finished"),
          Err(ExecutionError::Interrupted { run_id }) => {
            info!(run_id = %run_id, "run_interrupted_by_shutdown");
            continue;
          }
          Err(e) => warn!(run_id = %request.run_id, error = %e, "run_execution_deferred"),
        }
        resume_unfinished(&app, &cancel).await;
      }
    }
  }

  runner_handle
    .await
    .context("schedule runner panicked")?
    .context("schedule runner failed")?;
  Ok(())
}

async fn resume_unfinished(app: &App, cancel: &CancellationToken) {
  if let Err(e) = app.executor.resume_unfinished(cancel).await {
    error!(error = %e, "run_rescan_failed");
  }
}

/// Log the summary of every run that reaches a terminal state.
async fn log_run_summaries(mut events: mpsc::UnboundedReceiver<ExecutionEvent>) {
  while let Some(event) = events.recv().await {
    match event {
      ExecutionEvent::RunCompleted { run_id, summary } => info!(
        run_id = %run_id,
        generated = summary.generated,
        skipped = summary.skipped,
        failed = summary.failed,
        "run_summary"
      ),
      ExecutionEvent::RunFailed {
        run_id,
        error,
        summary,
      } => warn!(
        run_id = %run_id,
        error = %error,
        generated = summary.generated,
        skipped = summary.skipped,
        failed = summary.failed,
        "run_summary"
      ),
      _ => {}
    }
  }
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
  let output = serde_json::json!({
    "run_id": outcome.run_id,
    "status": outcome.status,
    "error": outcome.error,
    "summary": outcome.summary,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
