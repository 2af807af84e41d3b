use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

use student_sync::config::{SyncConfig, TargetConfig};
use student_sync::db;
use student_sync::pipeline::{self, RunOptions, RunReport};
use student_sync::report;
use student_sync::sources::CsvSourceDir;
use student_sync::table::{CsvTable, TargetTable};
use student_sync::upsert::PlanAction;

#[derive(Parser)]
#[command(name = "student-sync")]
#[command(
    about = "Merge student records from many exports into one published table",
    long_about = None
)]
struct Cli {
    /// TOML config; built-in defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the directory holding the source CSV exports
    #[arg(long, global = true)]
    sources_dir: Option<PathBuf>,
    /// Evaluate dates as of this day (YYYY-MM-DD) instead of today
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the published table (CSV file or Postgres schema)
    InitDb,
    /// Import an exported published CSV into the Postgres table
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Merge sources and write the published table
    Run {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show what a run would change without writing
    Plan,
    /// Write a markdown report of a dry run
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set for a postgres target")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn open_target(target: &TargetConfig) -> anyhow::Result<Box<dyn TargetTable>> {
    match target {
        TargetConfig::Csv { path } => {
            let table =
                CsvTable::open(path).context("published table unavailable; run init-db first")?;
            Ok(Box::new(table))
        }
        TargetConfig::Postgres => {
            let pool = connect().await?;
            let table = db::PgTable::open(pool)
                .await
                .context("published table unavailable; run init-db first")?;
            Ok(Box::new(table))
        }
    }
}

async fn execute(
    config: &SyncConfig,
    today: NaiveDate,
    dry_run: bool,
) -> anyhow::Result<RunReport> {
    let loader = CsvSourceDir::new(&config.sources_dir);
    info!(sources_dir = %loader.root().display(), %today, dry_run, "starting sync");

    let mut table = open_target(&config.target).await?;
    let options = RunOptions { today, dry_run };
    let report = pipeline::run_merge(config, &loader, table.as_mut(), options).await?;
    Ok(report)
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    println!(
        "Processed {} students: {} updated, {} inserted, {} preserved.",
        summary.students_processed, summary.updated, summary.inserted, summary.preserved
    );
    println!(
        "Eligibility: {} included, {} reinstated, {} withdrawn, {} without a roster entry.",
        summary.included, summary.reinstated, summary.excluded_withdrawn, summary.excluded_other
    );
    if summary.error_rows > 0 {
        println!("{} rows could not be built and were written as error rows.", summary.error_rows);
    }
    for duplicate in &summary.duplicate_keys {
        println!("Duplicate key {} at rows {:?}.", duplicate.key, duplicate.positions);
    }
    if summary.dry_run {
        println!("Dry run: nothing was written.");
    } else {
        println!("{} rows written.", summary.rows_written);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    if let Some(dir) = cli.sources_dir {
        config.sources_dir = dir;
    }
    let today = cli.today.unwrap_or_else(|| chrono::Local::now().date_naive());

    match cli.command {
        Commands::InitDb => match &config.target {
            TargetConfig::Csv { path } => {
                if path.exists() {
                    println!("{} already exists.", path.display());
                } else {
                    CsvTable::create(path)?;
                    println!("Created {}.", path.display());
                }
            }
            TargetConfig::Postgres => {
                let pool = connect().await?;
                db::init_db(&pool).await?;
                println!("Schema ready.");
            }
        },
        Commands::Import { csv } => {
            if config.target != TargetConfig::Postgres {
                bail!("import only applies to a postgres target");
            }
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Imported {inserted} rows from {}.", csv.display());
        }
        Commands::Run { dry_run, json } => {
            let report = execute(&config, today, dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report.summary)?);
            } else {
                print_summary(&report);
            }
        }
        Commands::Plan => {
            let report = execute(&config, today, true).await?;
            let plan = &report.plan;
            if plan.is_noop() {
                println!("Published table is up to date.");
            }
            for entry in plan.entries.iter().filter(|entry| entry.action != PlanAction::Preserve) {
                match entry.position {
                    Some(position) => {
                        println!("{:?} {} at row {}", entry.action, entry.key, position)
                    }
                    None => println!("{:?} {}", entry.action, entry.key),
                }
            }
            println!(
                "{} updates, {} inserts, {} preserved.",
                plan.count(PlanAction::Update),
                plan.count(PlanAction::Insert),
                plan.count(PlanAction::Preserve)
            );
        }
        Commands::Report { out } => {
            let report = execute(&config, today, true).await?;
            std::fs::write(&out, report::build_report(&report))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
