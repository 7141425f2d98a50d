//! pulse CLI: operator interface to the scoring pipeline.

use clap::{Parser, Subcommand};
use pulse_rs::broker::{Broker, ConsumerConfig};
use pulse_rs::config::Config;
use pulse_rs::db::Db;
use pulse_rs::model::job::{Job, JobId, JobPayload};
use pulse_rs::model::score::join_reasons;
use pulse_rs::scheduler::{Scheduler, score_user_options};
use pulse_rs::scoring::ScoringEngine;
use pulse_rs::store::ScoreLedger;
use pulse_rs::telemetry::{TelemetryConfig, init_telemetry};
use pulse_rs::worker::Worker;
use secrecy::ExposeSecret;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pulse", about = "Activity scoring pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker (and, by default, the fan-out scheduler) until Ctrl-C
    Serve {
        /// Only consume jobs; do not register the repeatable fan-out
        #[arg(long)]
        no_scheduler: bool,
        /// Jobs to run at once (overrides PULSE_WORKER_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Request asynchronous scoring of one user
    Score {
        user_id: i64,
    },
    /// Score one user now and print the result
    Evaluate {
        user_id: i64,
    },
    /// Show a user's score history, newest first
    Scores {
        user_id: i64,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Job queue inspection
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs that failed permanently
    Failed,
    /// Count jobs by status
    Counts,
    /// Show one job
    Show {
        /// Full job UUID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            no_scheduler,
            concurrency,
        } => cmd_serve(config, no_scheduler, concurrency).await,
        Command::Score { user_id } => {
            let db = connect(&config).await?;
            cmd_score(&db, &config, user_id).await
        }
        Command::Evaluate { user_id } => cmd_evaluate(&connect(&config).await?, user_id).await,
        Command::Scores { user_id, limit } => {
            cmd_scores(&connect(&config).await?, user_id, limit).await
        }
        Command::Jobs { action } => {
            let db = connect(&config).await?;
            let broker = db.broker(config.visibility_timeout);
            match action {
                JobsAction::Failed => cmd_jobs_failed(&broker).await,
                JobsAction::Counts => cmd_jobs_counts(&broker).await,
                JobsAction::Show { id } => cmd_jobs_show(&broker, id).await,
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(
    config: Config,
    no_scheduler: bool,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig::from_config(&config, "pulse"))?;
    tracing::info!(exporting = telemetry.is_exporting(), "telemetry initialized");

    let db = connect(&config).await?;

    let scheduler = if no_scheduler {
        None
    } else {
        let handle: Arc<dyn Broker> = Arc::new(db.broker(config.visibility_timeout));
        Some(Scheduler::start(handle, config.score_all_interval).await?)
    };

    let store = Arc::new(db.clone());
    let engine = Arc::new(ScoringEngine::new(store.clone(), store.clone()));
    let worker = Arc::new(Worker::new(
        Arc::new(db.broker(config.visibility_timeout)),
        store,
        engine,
    ));
    let consumer = worker.consumer(ConsumerConfig {
        concurrency: concurrency.unwrap_or(config.worker_concurrency),
        poll_interval: config.poll_interval,
    });

    let stop = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.shutdown();
    });

    consumer.run().await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    worker.close().await?;
    Ok(())
}

async fn cmd_score(db: &Db, config: &Config, user_id: i64) -> anyhow::Result<()> {
    let broker = db.broker(config.visibility_timeout);
    let id = broker
        .enqueue(JobPayload::score_user(user_id), score_user_options())
        .await?;
    broker.close().await?;
    println!("Enqueued: {} (user {user_id})", id.0);
    Ok(())
}

async fn cmd_evaluate(db: &Db, user_id: i64) -> anyhow::Result<()> {
    let store = Arc::new(db.clone());
    let engine = ScoringEngine::new(store.clone(), store);
    let evaluation = engine.score_user(user_id).await?;

    println!("User:            {user_id}");
    println!("Classification:  {}", evaluation.classification);
    println!("Confidence:      {}", evaluation.confidence);
    println!(
        "Reasons:         {}",
        if evaluation.reasons.is_empty() {
            "-".to_string()
        } else {
            join_reasons(&evaluation.reasons)
        }
    );
    Ok(())
}

async fn cmd_scores(db: &Db, user_id: i64, limit: i64) -> anyhow::Result<()> {
    let records = db.scores_for_user(user_id, limit).await?;

    if records.is_empty() {
        println!("No score records for user {user_id}.");
        return Ok(());
    }

    println!("{:<8}  {:<5}  {:<10}  {:<16}  REASONS", "ID", "SCORE", "CONFIDENCE", "CREATED");
    println!("{}", "-".repeat(80));
    for record in &records {
        println!(
            "{:<8}  {:<5}  {:<10}  {:<16}  {}",
            record.id,
            record.score,
            record.confidence,
            record.created_at.format("%Y-%m-%d %H:%M"),
            join_reasons(&record.reasons)
        );
    }

    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_jobs_failed(broker: &dyn Broker) -> anyhow::Result<()> {
    let jobs = broker.failed_jobs().await?;

    if jobs.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<8}  {:<16}  ERROR",
        "ID", "KIND", "ATTEMPTS", "FAILED"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        println!(
            "{:<8}  {:<16}  {:<8}  {:<16}  {}",
            job.id,
            job.kind,
            format!("{}/{}", job.attempts, job.max_attempts),
            job.finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            job.last_error.as_deref().unwrap_or("-")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_jobs_counts(broker: &dyn Broker) -> anyhow::Result<()> {
    let counts = broker.counts().await?;
    println!("Waiting:  {}", counts.waiting);
    println!("Active:   {}", counts.active);
    println!("Failed:   {}", counts.failed);
    Ok(())
}

async fn cmd_jobs_show(broker: &dyn Broker, id_str: String) -> anyhow::Result<()> {
    let id = JobId(uuid::Uuid::parse_str(&id_str)?);
    let Some(job) = broker.get(id).await? else {
        anyhow::bail!("no job {id_str} (completed jobs are purged)");
    };
    print_job(&job)?;
    Ok(())
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("ID:         {}", job.id.0);
    println!("Kind:       {}", job.kind);
    println!("Status:     {}", job.status);
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Attempts:   {}/{}", job.attempts, job.max_attempts);
    println!("Backoff:    {:?}", job.backoff);
    if let Some(every) = job.repeat_every_ms {
        println!("Repeat:     every {every}ms");
    }
    println!("Run At:     {}", job.run_at);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref err) = job.last_error {
        println!("Error:      {err}");
    }
    Ok(())
}
