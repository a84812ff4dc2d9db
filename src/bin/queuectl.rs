// src/bin/queuectl.rs
use clap::{value_parser, Arg, Command};
use std::process;
use anyhow::Result;
use tracing_subscriber::EnvFilter;

use queuectl::QueueConfig;

mod commands;
use commands::*;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let app = Command::new("queuectl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("queuectl - SQLite-backed background job queue for shell commands")
        .arg(Arg::new("database")
            .long("database")
            .value_name("URL")
            .global(true)
            .help("SQLite database URL (overrides QUEUECTL_DATABASE_URL)"))
        .subcommand(
            Command::new("enqueue")
                .about("Add a job from JSON text or a JSON file")
                .arg(Arg::new("job")
                    .value_name("JSON|FILE")
                    .help("Job description, e.g. '{\"command\":\"echo hi\"}'")
                    .required(true))
                .arg(Arg::new("delay")
                    .long("delay")
                    .value_name("SECONDS")
                    .help("Run no earlier than this many seconds from now")
                    .value_parser(value_parser!(u64))
                    .conflicts_with("run-at"))
                .arg(Arg::new("run-at")
                    .long("run-at")
                    .value_name("RFC3339")
                    .help("Run no earlier than this timestamp"))
        )
        .subcommand(
            Command::new("worker")
                .about("Run workers")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start")
                        .about("Start workers in the foreground (Ctrl+C drains, twice aborts)")
                        .arg(Arg::new("count")
                            .short('c')
                            .long("count")
                            .value_name("NUMBER")
                            .help("Number of concurrent workers")
                            .value_parser(value_parser!(usize)))
                )
        )
        .subcommand(
            Command::new("status")
                .about("Show job counts and busy workers")
        )
        .subcommand(
            Command::new("list")
                .about("List jobs, newest first")
                .arg(Arg::new("state")
                    .short('s')
                    .long("state")
                    .value_name("STATE")
                    .help("Filter by state (pending, processing, completed, dead)"))
                .arg(Arg::new("limit")
                    .short('l')
                    .long("limit")
                    .value_name("NUMBER")
                    .default_value("20")
                    .value_parser(value_parser!(usize)))
        )
        .subcommand(
            Command::new("dlq")
                .about("Inspect and retry dead-lettered jobs")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list")
                        .about("List dead letters")
                        .arg(Arg::new("limit")
                            .short('l')
                            .long("limit")
                            .value_name("NUMBER")
                            .default_value("20")
                            .value_parser(value_parser!(usize)))
                )
                .subcommand(
                    Command::new("retry")
                        .about("Move a dead letter back to pending with zero attempts")
                        .arg(Arg::new("id").required(true))
                )
        )
        .subcommand(
            Command::new("config")
                .about("Read or change operator settings")
                .subcommand_required(true)
                .subcommand(
                    Command::new("get")
                        .arg(Arg::new("key").required(true))
                )
                .subcommand(
                    Command::new("set")
                        .arg(Arg::new("key").required(true))
                        .arg(Arg::new("value").required(true))
                )
        )
        .subcommand(
            Command::new("recover")
                .about("Requeue processing jobs left behind by a crashed worker")
                .arg(Arg::new("older-than")
                    .long("older-than")
                    .value_name("SECONDS")
                    .help("Only jobs not updated for this long")
                    .default_value("300")
                    .value_parser(value_parser!(u64)))
        )
        .subcommand(
            Command::new("dashboard")
                .about("Serve the web dashboard")
                .arg(Arg::new("host")
                    .long("host")
                    .value_name("HOST")
                    .default_value("127.0.0.1"))
                .arg(Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .default_value("4567")
                    .value_parser(value_parser!(u16)))
        );

    let matches = app.get_matches();

    let mut config = QueueConfig::from_env()?;
    if let Some(url) = matches.get_one::<String>("database") {
        config.database_url = url.clone();
    }

    match matches.subcommand() {
        Some(("enqueue", sub_matches)) => enqueue_command(&config, sub_matches).await,
        Some(("worker", sub_matches)) => worker_command(&config, sub_matches).await,
        Some(("status", _)) => status_command(&config).await,
        Some(("list", sub_matches)) => list_command(&config, sub_matches).await,
        Some(("dlq", sub_matches)) => dlq_command(&config, sub_matches).await,
        Some(("config", sub_matches)) => config_command(&config, sub_matches).await,
        Some(("recover", sub_matches)) => recover_command(&config, sub_matches).await,
        Some(("dashboard", sub_matches)) => dashboard_command(&config, sub_matches).await,
        _ => {
            println!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
