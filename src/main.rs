mod checkpoint;
mod client;
mod db;
mod enrich;
mod error;
mod merge;
mod pipeline;
mod retry;
mod scheduler;
mod settings;
mod table;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use client::{ChatBackend, OpenAiClient};
use enrich::price::PriceEnricher;
use enrich::translate::TranslateEnricher;
use enrich::Enricher;
use pipeline::{StageOptions, StageReport};
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "product_enricher",
    about = "Normalize prices and translate product names in extracted product tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StageArgs {
    /// Input CSV (default: from configuration)
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Output CSV, rewritten at every checkpoint (default: from configuration)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Keep rows already finished in an existing output file
    #[arg(long)]
    resume: bool,
    /// With --resume, enrich rows that previously fell back again
    #[arg(long)]
    retry_fallbacks: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer numeric price and currency from the Price column
    Price {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Translate the Name column to English
    Translate {
        #[command(flatten)]
        args: StageArgs,
        /// Only translate names that look non-English
        #[arg(long)]
        filter: bool,
    },
    /// Price then translate, using the configured paths
    Run {
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        retry_fallbacks: bool,
        /// Only translate names that look non-English
        #[arg(long)]
        filter: bool,
    },
    /// Show recent runs
    Stats {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;
    info!(
        pool_size = settings.pool_size,
        checkpoint_every = settings.checkpoint_every,
        model = %settings.model,
        "configuration loaded"
    );

    let result = match cli.command {
        Commands::Stats { limit } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            print_runs(&db::fetch_recent_runs(&conn, limit)?);
            Ok(())
        }
        Commands::Price { args } => {
            let session = Session::open(settings)?;
            let opts = session.options(
                args.input.unwrap_or_else(|| session.settings.raw_input.clone()),
                args.output.unwrap_or_else(|| session.settings.price_output.clone()),
                args.resume,
                args.retry_fallbacks,
                false,
            );
            let report = session.price(opts).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Translate { args, filter } => {
            let session = Session::open(settings)?;
            let opts = session.options(
                args.input.unwrap_or_else(|| session.settings.price_output.clone()),
                args.output.unwrap_or_else(|| session.settings.final_output.clone()),
                args.resume,
                args.retry_fallbacks,
                filter,
            );
            let report = session.translate(opts).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Run {
            resume,
            retry_fallbacks,
            filter,
        } => {
            let session = Session::open(settings)?;
            let opts = session.options(
                session.settings.raw_input.clone(),
                session.settings.price_output.clone(),
                resume,
                retry_fallbacks,
                false,
            );
            let priced = session.price(opts).await?;
            print_report(&priced);

            if session.cancel.is_cancelled() {
                println!("Cancelled; translation not started.");
                return Ok(());
            }
            let opts = session.options(
                priced.output.clone(),
                session.settings.final_output.clone(),
                resume,
                retry_fallbacks,
                filter,
            );
            let translated = session.translate(opts).await?;
            print_report(&translated);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Everything one invocation shares across stages.
struct Session {
    settings: Settings,
    backend: Arc<dyn ChatBackend>,
    cancel: CancellationToken,
    conn: Connection,
    run_id: String,
}

impl Session {
    fn open(settings: Settings) -> anyhow::Result<Self> {
        let backend: Arc<dyn ChatBackend> = Arc::new(OpenAiClient::new(
            settings.api_key()?,
            &settings.api_base,
            &settings.model,
        ));
        let conn = db::connect(&settings.db_path)?;
        db::init_schema(&conn)?;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight rows");
                trigger.cancel();
            }
        });

        Ok(Session {
            settings,
            backend,
            cancel,
            conn,
            run_id: db::new_run_id(),
        })
    }

    fn options(
        &self,
        input: PathBuf,
        output: PathBuf,
        resume: bool,
        retry_fallbacks: bool,
        only_non_english: bool,
    ) -> StageOptions {
        StageOptions {
            input,
            output,
            pool_size: self.settings.pool_size,
            checkpoint: self.settings.checkpoint_schedule(),
            resume,
            retry_fallbacks,
            only_non_english,
        }
    }

    async fn price(&self, opts: StageOptions) -> anyhow::Result<StageReport> {
        let enricher = PriceEnricher::new(Arc::clone(&self.backend));
        self.stage(enricher, self.settings.price_max_attempts, opts)
            .await
    }

    async fn translate(&self, opts: StageOptions) -> anyhow::Result<StageReport> {
        let enricher = TranslateEnricher::new(Arc::clone(&self.backend));
        self.stage(enricher, self.settings.translate_max_attempts, opts)
            .await
    }

    /// Run one stage and record it in the ledger, failed or not.
    async fn stage<E: Enricher>(
        &self,
        enricher: E,
        max_attempts: u32,
        opts: StageOptions,
    ) -> anyhow::Result<StageReport> {
        let stage = enricher.name();
        let started_at = chrono::Utc::now().to_rfc3339();
        db::start_run(
            &self.conn,
            &self.run_id,
            stage,
            &opts.input,
            &opts.output,
            &started_at,
        )?;

        let result = pipeline::run_stage(
            Arc::new(enricher),
            self.settings.retry_policy(max_attempts),
            &opts,
            self.cancel.clone(),
        )
        .await;

        let mut row = db::RunRow {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            input_path: opts.input.display().to_string(),
            output_path: opts.output.display().to_string(),
            total_rows: 0,
            tasks: 0,
            succeeded: 0,
            fallback: 0,
            skipped: 0,
            cancelled: 0,
            checkpoints: 0,
            error: None,
            started_at,
            finished_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        match &result {
            Ok(r) => {
                row.output_path = r.output.display().to_string();
                row.total_rows = r.total_rows;
                row.tasks = r.tasks;
                row.succeeded = r.succeeded;
                row.fallback = r.fallback;
                row.skipped = r.skipped;
                row.cancelled = r.cancelled;
                row.checkpoints = r.checkpoints;
            }
            Err(e) => row.error = Some(format!("{:#}", e)),
        }
        if let Err(e) = db::finish_run(&self.conn, &row) {
            warn!("could not record run: {:#}", e);
        }
        result
    }
}

fn print_report(r: &StageReport) {
    println!(
        "{}: {} rows, {} tasks ({} ok, {} fallback, {} cancelled), {} restored, {} skipped, {} pending.",
        r.stage,
        r.total_rows,
        r.tasks,
        r.succeeded,
        r.fallback,
        r.cancelled,
        r.restored,
        r.skipped,
        r.pending,
    );
    println!(
        "  wrote {} ({} periodic checkpoints)",
        r.output.display(),
        r.checkpoints
    );
}

fn print_runs(rows: &[db::RunRow]) {
    if rows.is_empty() {
        println!("No runs recorded.");
        return;
    }
    println!(
        "{:<36} | {:<11} | {:>7} | {:>7} | {:>7} | {:>8} | {:>7} | {:<25}",
        "Run", "Stage", "Rows", "Tasks", "Ok", "Fallback", "Cancel", "Finished"
    );
    println!("{}", "-".repeat(126));
    for r in rows {
        let finished = match (&r.error, &r.finished_at) {
            (Some(_), _) => "failed".to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => "running/aborted".to_string(),
        };
        println!(
            "{:<36} | {:<11} | {:>7} | {:>7} | {:>7} | {:>8} | {:>7} | {:<25}",
            r.run_id, r.stage, r.total_rows, r.tasks, r.succeeded, r.fallback, r.cancelled, finished
        );
    }

    // Paths and checkpoint detail (separate section to keep the table narrow)
    println!("\n--- Files ---");
    for r in rows {
        println!(
            "  {} {} (started {}): {} -> {} | {} skipped, {} checkpoints",
            r.run_id, r.stage, r.started_at, r.input_path, r.output_path, r.skipped, r.checkpoints
        );
    }

    let failed: Vec<_> = rows.iter().filter(|r| r.error.is_some()).collect();
    if !failed.is_empty() {
        println!("\n--- Errors ---");
        for r in failed {
            println!("  {} {}: {}", r.run_id, r.stage, r.error.as_deref().unwrap_or(""));
        }
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
