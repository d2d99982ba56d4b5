use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sparvi_client::HttpAutomationApi;
use sparvi_core::{project_runs, ScheduleEntry, ScheduleType};
use sparvi_poller::{CoordinatorConfig, NextRunCoordinator, PollState};
use sparvi_web::NextRunSummary;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sparvi")]
#[command(about = "Sparvi automation next-run command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll next-run times and log every change until Ctrl-C.
    Watch {
        #[arg(long, env = "SPARVI_CONNECTION_ID")]
        connection: Option<String>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Fetch next-run times once and print a summary.
    Status {
        #[arg(long, env = "SPARVI_CONNECTION_ID")]
        connection: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Ask the backend to run an automation now.
    Trigger {
        #[arg(long)]
        connection: String,
        #[arg(long)]
        automation: String,
        #[arg(long)]
        refresh_after_ms: Option<u64>,
    },
    /// Print projected run times for a schedule.
    Preview {
        #[arg(long, default_value = "daily")]
        schedule_type: ScheduleType,
        #[arg(long)]
        time: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Serve the next-run JSON api backed by a live coordinator.
    Serve {
        #[arg(long, env = "SPARVI_BIND", default_value = "127.0.0.1:8088")]
        bind: SocketAddr,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn coordinator_config(connection: Option<String>) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::from_env();
    config.connection_id = connection.or(config.connection_id);
    config
}

fn api() -> Result<Arc<HttpAutomationApi>> {
    Ok(Arc::new(HttpAutomationApi::from_env().context("building automation api client")?))
}

fn describe(state: &PollState) -> String {
    let mut lines = Vec::new();
    for (conn, automation_type, info) in state.next_runs.entries() {
        let when = info
            .next_run_at()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "unscheduled".to_string());
        let status = info.status();
        match conn {
            Some(conn) => lines.push(format!("{conn}\t{automation_type}\t{status}\t{when}")),
            None => lines.push(format!("{automation_type}\t{status}\t{when}")),
        }
    }
    if lines.is_empty() {
        lines.push("no scheduled automations".to_string());
    }
    if let Some(err) = &state.error {
        lines.push(format!("error: {err}"));
    }
    if state.circuit_open {
        lines.push("polling paused after repeated failures".to_string());
    }
    lines.join("\n")
}

async fn watch(connection: Option<String>, interval_ms: Option<u64>) -> Result<()> {
    let mut config = coordinator_config(connection);
    if let Some(ms) = interval_ms {
        config = config.with_refresh_interval(Duration::from_millis(ms));
    }
    let coordinator = NextRunCoordinator::with_error_callback(api()?, config, |err| {
        warn!(category = %err.category, "{}", err.message);
    });
    let mut updates = coordinator.subscribe();
    coordinator.start();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                if state.loading {
                    continue;
                }
                let summary = NextRunSummary::from_coordinator(&coordinator);
                info!(
                    entries = state.next_runs.len(),
                    overdue = summary.overdue_count,
                    running = summary.running_count,
                    next = summary.next_upcoming.as_ref().map(|u| u.automation_type.as_str()).unwrap_or("-"),
                    circuit_open = state.circuit_open,
                    "next-run state updated"
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    coordinator.stop();
    Ok(())
}

async fn status(connection: Option<String>, json: bool) -> Result<()> {
    let config = coordinator_config(connection)
        .with_enabled(true)
        .with_settle_delay(Duration::from_secs(3600));
    let coordinator = NextRunCoordinator::spawn(api()?, config);
    coordinator.refresh().await;
    let summary = NextRunSummary::from_coordinator(&coordinator);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", describe(&coordinator.state()));
        if let Some(next) = &summary.next_upcoming {
            println!(
                "next: {} {} {}",
                next.connection_id.as_deref().unwrap_or(""),
                next.automation_type,
                next.info.next_run_iso.as_deref().unwrap_or("")
            );
        }
        println!("overdue: {}", summary.overdue_count);
    }
    coordinator.stop();
    Ok(())
}

async fn trigger(connection: String, automation: String, refresh_after_ms: Option<u64>) -> Result<()> {
    let config = CoordinatorConfig::for_connection(connection).with_settle_delay(Duration::from_secs(3600));
    let coordinator = NextRunCoordinator::spawn(api()?, config);
    let accepted = coordinator.trigger_manual_run(&automation).await;
    println!("trigger {automation}: {}", if accepted { "accepted" } else { "failed" });
    if accepted {
        if let Some(ms) = refresh_after_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            coordinator.refresh().await;
            println!("{}", describe(&coordinator.state()));
        }
    }
    coordinator.stop();
    if !accepted {
        anyhow::bail!("manual run for {automation} was not accepted");
    }
    Ok(())
}

fn preview(
    schedule_type: ScheduleType,
    time: String,
    timezone: String,
    days: Vec<String>,
    count: usize,
) -> Result<()> {
    let entry = ScheduleEntry {
        automation_type: "preview".to_string(),
        enabled: true,
        schedule_type,
        scheduled_time: time,
        timezone,
        days: (!days.is_empty()).then_some(days),
    };
    let now: DateTime<Utc> = Utc::now();
    let runs = project_runs(&entry, now, count).context("projecting schedule")?;
    for run in runs {
        println!("{}", run.to_rfc3339());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Watch {
        connection: None,
        interval_ms: None,
    }) {
        Commands::Watch {
            connection,
            interval_ms,
        } => watch(connection, interval_ms).await?,
        Commands::Status { connection, json } => status(connection, json).await?,
        Commands::Trigger {
            connection,
            automation,
            refresh_after_ms,
        } => trigger(connection, automation, refresh_after_ms).await?,
        Commands::Preview {
            schedule_type,
            time,
            timezone,
            days,
            count,
        } => preview(schedule_type, time, timezone, days, count)?,
        Commands::Serve { bind } => sparvi_web::serve_from_env(bind).await?,
    }

    Ok(())
}
