use std::{path::PathBuf, process::ExitCode};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use archive_ingest::{
    audit::{drain, AuditReport, Auditor},
    config::Config,
    service::{build_catalog, build_source, build_store},
    source::mock::MOCK_TOPIC,
    store::keys::parse_year_month,
};

/// Consistency checks and housekeeping for the message archive.
///
/// Backends are configured with the same environment variables as the ingest service.
/// The exit status is the number of anomalies found, capped at 255.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Print results as JSON lines instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every cataloged object exists with the recorded size
    VerifyDbToStore {
        /// SQL LIKE pattern selecting topics
        #[arg(long, default_value = "%")]
        topic: String,
        /// Check a random sample of rows instead of all of them
        #[arg(long, num_args = 0..=1, default_missing_value = "100")]
        sample: Option<i64>,
    },
    /// Check that every stored object has exactly one version and a catalog row
    VerifyStoreToDb {
        /// SQL LIKE pattern selecting topics
        #[arg(long, default_value = "%")]
        topic: String,
        /// Restrict to one month, as YYYY/M
        #[arg(long)]
        year_month: Option<String>,
    },
    /// Show the catalog rows and decoded bundle for a uuid
    Inspect {
        uuid: String,
        /// Write the raw bundle to <uuid>.bundle
        #[arg(short, long)]
        write: bool,
        /// Directory the bundle is written to
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Don't print the bundle
        #[arg(short, long)]
        quiet: bool,
    },
    /// List rows that share a client uuid or a server content identity
    Duplicates {
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Fetch bundles and compare payloads for every candidate group
        #[arg(long)]
        confirm: bool,
    },
    /// Deep delete test and mock data from the store and the catalog
    CleanTestData {
        /// Also acknowledge every message left on the test topic
        #[arg(long)]
        drain: bool,
    },
    /// Per-topic totals since start, over the last day and the last hour
    Status,
}

fn print_report(report: &AuditReport, json: bool) -> Result<()> {
    for anomaly in &report.anomalies {
        if json {
            println!("{}", serde_json::to_string(anomaly)?);
        } else {
            println!("** {anomaly}");
        }
    }
    info!(
        checked = report.checked,
        anomalies = report.anomalies.len(),
        "Audit finished"
    );
    Ok(())
}

fn format_ms(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

async fn run(cli: Cli) -> Result<u8> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    let store = build_store(&config.store).await;
    let catalog = build_catalog(&config.catalog).await?;
    let auditor = Auditor::new(store, catalog);

    match cli.command {
        Commands::VerifyDbToStore { topic, sample } => {
            let report = auditor.verify_db_to_store(&topic, sample).await?;
            print_report(&report, cli.json)?;
            Ok(report.exit_code())
        }
        Commands::VerifyStoreToDb { topic, year_month } => {
            let year_month = year_month
                .map(|ym| {
                    parse_year_month(&ym)
                        .ok_or_else(|| anyhow!("Invalid --year-month {ym}, expected YYYY/M"))
                })
                .transpose()?;
            let report = auditor.verify_store_to_db(&topic, year_month).await?;
            print_report(&report, cli.json)?;
            Ok(report.exit_code())
        }
        Commands::Inspect {
            uuid,
            write,
            out_dir,
            quiet,
        } => {
            let objects = auditor.inspect(&uuid).await?;
            let mut anomalies = 0usize;
            for object in &objects {
                if write {
                    if let Some(path) = object.write_to(&out_dir, objects.len() > 1)? {
                        info!(path = %path.display(), "Wrote bundle");
                    }
                }
                if let Some(anomaly) = &object.anomaly {
                    anomalies += 1;
                    println!("** {anomaly}");
                }
                if !quiet {
                    println!("{}", serde_json::to_string_pretty(object)?);
                }
            }
            Ok(u8::try_from(anomalies).unwrap_or(u8::MAX))
        }
        Commands::Duplicates { limit, confirm } => {
            let report = auditor.duplicates(limit, confirm).await?;
            print_report(&report, cli.json)?;
            Ok(report.exit_code())
        }
        Commands::CleanTestData { drain: drain_topic } => {
            let topics = vec![config.source.source_test_topic.clone(), MOCK_TOPIC.to_string()];
            let summary = auditor.clean_test_data(&topics).await?;
            println!(
                "deleted {} catalog rows, {} objects ({} versions)",
                summary.rows_deleted, summary.objects_deleted, summary.versions_deleted
            );
            if drain_topic {
                let mut source_config = config.source.clone();
                source_config.source_test_mode = true;
                source_config.source_until_eos = true;
                source_config.source_test_max_messages = 0;
                let mut source = build_source(&source_config)?;
                let drained = drain(source.as_mut()).await?;
                println!("drained {drained} messages from {}", source_config.source_test_topic);
            }
            Ok(0)
        }
        Commands::Status => {
            let now = chrono::Utc::now().timestamp_millis();
            for section in auditor.status(now).await? {
                if cli.json {
                    println!("{}", serde_json::to_string(&section)?);
                    continue;
                }
                println!("{}", section.label);
                println!("| topic | messages | bytes | sample uuid | earliest (UTC) | latest (UTC) |");
                for t in &section.topics {
                    println!(
                        "| {} | {} | {} | {} | {} | {} |",
                        t.topic,
                        t.messages,
                        t.bytes,
                        t.sample_uuid,
                        format_ms(t.earliest),
                        format_ms(t.latest)
                    );
                }
                println!();
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let anomalies = run(Cli::parse()).await?;
    Ok(ExitCode::from(anomalies))
}
