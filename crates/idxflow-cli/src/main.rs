//! 🚀 idxflow-cli — the front door, the bouncer, the maitre d' of idxflow.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary loads config, sets up logging, replays an NDJSON change log
//! through the indexing pipeline, and prints what happened as a table. Like a
//! manager, it mostly delegates. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use idxflow::{ExecutionReport, SynchronizationStrategy};
use serde_json::json;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📜 Replay a change log into a search backend.
#[derive(Debug, Parser)]
#[command(name = "idxflow", version, about)]
struct Args {
    /// NDJSON change log: one {"op","index","id","document"} object per line.
    change_log: PathBuf,

    /// TOML config file. Without it, only IDXFLOW_* environment variables are used.
    #[arg(short, long, default_value = "idxflow.toml")]
    config: PathBuf,

    /// Override the configured synchronization strategy.
    #[arg(short, long, value_parser = parse_synchronization)]
    sync: Option<SynchronizationStrategy>,

    /// Print the report as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

fn parse_synchronization(raw: &str) -> Result<SynchronizationStrategy, String> {
    serde_json::from_value(json!(raw)).map_err(|_| {
        format!(
            "'{raw}' is not one of: async, write_sync, read_sync, sync \
             (or fire_and_forget, wait_for_ack, wait_for_searchability)"
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // 🔒 a missing default config is fine, a missing explicit one is the user's
    // business to know about
    let config_file = args
        .config
        .try_exists()
        .with_context(|| {
            format!("💀 Could not check whether '{}' exists", args.config.display())
        })?
        .then_some(args.config.as_path());

    let mut app_config = idxflow::load_config(config_file).context(
        "💀 In idxflow-cli, main, we couldn't load the config. \
         Take a look at the file and the IDXFLOW_* variables.",
    )?;
    if let Some(sync) = args.sync {
        app_config.pipeline.synchronization = sync;
    }

    match idxflow::run(app_config, &args.change_log).await {
        Ok(report) => {
            if args.json {
                print_json(&report)?;
            } else {
                print_table(&report);
            }
            if !report.is_success() {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("onnection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the search backend isn't reachable. \
                    Double-check that Elasticsearch/OpenSearch is actually running and that \
                    the configured url is right. If you're using Docker, try `docker ps`. ☕"
                );
            }
            std::process::exit(1);
        }
    }
}

fn print_table(report: &ExecutionReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["", "detail"]);

    let (status, color) = if report.is_success() {
        ("✅ success", Color::Green)
    } else {
        ("💀 failed", Color::Red)
    };
    table.add_row(vec![Cell::new("status"), Cell::new(status).fg(color)]);
    table.add_row(vec![
        Cell::new("failing entities"),
        Cell::new(report.failing_entities().len()),
    ]);
    for entity in report.failing_entities() {
        table.add_row(vec![Cell::new("  entity"), Cell::new(entity)]);
    }
    if let Some(failure) = report.failure() {
        for (position, cause) in failure.causes().enumerate() {
            let label = if position == 0 { "cause" } else { "  suppressed" };
            table.add_row(vec![Cell::new(label), Cell::new(format!("{cause:#}"))]);
        }
    }
    println!("{table}");
}

fn print_json(report: &ExecutionReport) -> Result<()> {
    let causes: Vec<String> = report
        .failure()
        .map(|failure| failure.causes().map(|cause| format!("{cause:#}")).collect())
        .unwrap_or_default();
    let summary = json!({
        "success": report.is_success(),
        "failing_entities": report.failing_entities(),
        "causes": causes,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("💀 The report refused to become JSON")?
    );
    Ok(())
}
