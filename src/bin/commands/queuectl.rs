// src/bin/commands/queuectl.rs
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::ArgMatches;
use colored::*;
use tokio::signal;

use queuectl::dashboard::metrics::serve;
use queuectl::queue::{enqueue, enqueue_in, parse_request, ScheduleAt};
use queuectl::utils::pagination::Pagination;
use queuectl::{JobState, QueueConfig};

pub async fn enqueue_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let source = matches.get_one::<String>("job").context("missing job")?;
    let raw = if Path::new(source).is_file() {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))?
    } else {
        source.clone()
    };

    let mut request = parse_request(&raw)?;
    let store = config.open_store().await?;

    let job = if let Some(delay) = matches.get_one::<u64>("delay") {
        enqueue_in(&store, request, *delay).await?
    } else {
        if let Some(run_at) = matches.get_one::<String>("run-at") {
            request.scheduled_at = Some(ScheduleAt::Text(run_at.clone()));
            request.delay = None;
        }
        enqueue(&store, request).await?
    };

    println!("{} {}", "Enqueued job".green(), job.id.bold());
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn worker_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let Some(("start", sub_matches)) = matches.subcommand() else {
        bail!("unknown worker command");
    };

    let mut config = config.clone();
    if let Some(count) = sub_matches.get_one::<usize>("count") {
        config = config.with_concurrency(*count);
    }

    let pool = config.initialize().await?;
    println!(
        "{} {} worker(s) on {}",
        "Started".green().bold(),
        config.concurrency,
        config.database_url
    );
    for id in pool.worker_ids() {
        println!("  • {id}");
    }
    println!("{}", "Press Ctrl+C to stop.".blue());

    signal::ctrl_c().await?;
    println!(
        "\n{}",
        "Finishing owned jobs, press Ctrl+C again to stop immediately...".yellow()
    );

    let graceful = pool.stop(true);
    tokio::pin!(graceful);
    tokio::select! {
        result = &mut graceful => result?,
        _ = signal::ctrl_c() => {
            println!("{}", "Stopping immediately.".red());
            pool.stop(false).await?;
            graceful.await?;
        }
    }

    println!("{}", "Workers stopped.".green());
    Ok(())
}

pub async fn status_command(config: &QueueConfig) -> Result<()> {
    let store = config.open_store().await?;
    let counts = store.count_by_state().await?;
    let workers = store.active_workers().await?;

    println!("{}", "queuectl status".blue().bold());
    println!("{}", "=".repeat(40).blue());
    for state in JobState::ALL {
        println!("{:<12} {}", state.as_str(), paint_state(state, counts.get(state).to_string()));
    }
    println!("{:<12} {}", "dlq", counts.dlq_count.to_string().red());

    println!("\n{} {}", "Busy workers:".bold(), workers.len().to_string().green());
    for worker in workers {
        println!("  • {} ({} job(s) since {})", worker.worker_id, worker.jobs, worker.since);
    }
    Ok(())
}

pub async fn list_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let state = matches
        .get_one::<String>("state")
        .map(|raw| raw.parse::<JobState>())
        .transpose()?;
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(20);

    let store = config.open_store().await?;
    let jobs = store.list_jobs(state, &Pagination::first(limit)).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".blue());
        return Ok(());
    }

    println!(
        "{:<24} {:<11} {:>8} {:>8}  {}",
        "ID".bold(),
        "STATE".bold(),
        "ATTEMPTS".bold(),
        "PRIORITY".bold(),
        "COMMAND".bold()
    );
    for job in jobs {
        println!(
            "{:<24} {:<11} {:>8} {:>8}  {}",
            job.id,
            paint_state(job.state, job.state.to_string()),
            format!("{}/{}", job.attempts, job.max_retries),
            job.priority,
            job.command
        );
        if let Some(error) = job.last_error.filter(|_| job.state != JobState::Completed) {
            println!("{:<24} {}", "", error.dimmed());
        }
    }
    Ok(())
}

pub async fn dlq_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let store = config.open_store().await?;

    match matches.subcommand() {
        Some(("list", sub_matches)) => {
            let limit = sub_matches.get_one::<usize>("limit").copied().unwrap_or(20);
            let entries = store.list_dead_letters(&Pagination::first(limit)).await?;
            if entries.is_empty() {
                println!("{}", "The dead-letter queue is empty.".blue());
            }
            for entry in entries {
                println!(
                    "{} {} attempts={} failed_at={}",
                    entry.id.bold(),
                    entry.command,
                    entry.attempts,
                    entry.failed_at.to_rfc3339()
                );
                if let Some(error) = entry.last_error {
                    println!("    {}", error.red());
                }
            }
        }
        Some(("retry", sub_matches)) => {
            let id = sub_matches.get_one::<String>("id").context("missing id")?;
            let job = store.retry_dead_letter(id).await?;
            println!("{} {} {}", "Requeued".green(), job.id.bold(), "with zero attempts".green());
        }
        _ => bail!("unknown dlq command"),
    }
    Ok(())
}

pub async fn config_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let store = config.open_store().await?;

    match matches.subcommand() {
        Some(("get", sub_matches)) => {
            let key = sub_matches.get_one::<String>("key").context("missing key")?;
            match store.get_config(key).await? {
                Some(value) => println!("{value}"),
                None => bail!("config key '{key}' is not set"),
            }
        }
        Some(("set", sub_matches)) => {
            let key = sub_matches.get_one::<String>("key").context("missing key")?;
            let value = sub_matches.get_one::<String>("value").context("missing value")?;
            store.set_config(key, value).await?;
            println!("{} {key} = {value}", "Set".green());
        }
        _ => bail!("unknown config command"),
    }
    Ok(())
}

pub async fn recover_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let secs = matches.get_one::<u64>("older-than").copied().unwrap_or(300);
    let cutoff = chrono::Duration::try_seconds(i64::try_from(secs)?)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .context("--older-than is out of range")?;

    let store = config.open_store().await?;
    let requeued = store.requeue_stale(cutoff).await?;
    println!("{} {requeued} stale job(s)", "Requeued".green());
    Ok(())
}

pub async fn dashboard_command(config: &QueueConfig, matches: &ArgMatches) -> Result<()> {
    let host = matches.get_one::<String>("host").context("missing host")?;
    let port = matches.get_one::<u16>("port").copied().unwrap_or(4567);

    let store = config.open_store().await?;
    println!("{}", format!("Dashboard at http://{host}:{port}").blue().bold());
    serve(store, host, port).await?;
    Ok(())
}

fn paint_state(state: JobState, text: String) -> ColoredString {
    match state {
        JobState::Pending => text.yellow(),
        JobState::Processing => text.cyan(),
        JobState::Completed => text.green(),
        JobState::Dead => text.red(),
    }
}
