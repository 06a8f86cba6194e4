// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use multicast_pim::logging::{Facility, LogRegistry, Severity};
use multicast_pim::protocols::pim::stats;
use multicast_pim::supervisor::{event_loop_with_channel, run_scenario, Scenario};
use multicast_pim::{log_error, log_info, log_warning, CoreConfig, PimCore, PimEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Minimum log severity (emergency..debug)
    #[arg(long, default_value = "notice", global = true)]
    log_level: Severity,

    /// Log as plain text instead of JSON lines
    #[arg(long, global = true)]
    text_log: bool,

    /// Append plain text log lines to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Load and validate a configuration file
    CheckConfig { file: PathBuf },
    /// Run a scenario on logical time and print its actions as JSON lines
    Replay { scenario: PathBuf },
    /// Read events as JSON lines from stdin and print actions as JSON lines
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let registry = if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        LogRegistry::text_writer(file, args.log_level)
    } else if args.text_log {
        LogRegistry::stderr_text(args.log_level)
    } else {
        LogRegistry::stderr_json(args.log_level)
    };
    let logger = registry
        .get_logger(Facility::Supervisor)
        .context("no supervisor logger")?;
    stats::describe_metrics();

    match args.command {
        Command::CheckConfig { file } => {
            let config = CoreConfig::load_from_file(&file)?;
            config.validate()?;
            println!("{}", config.to_json5());
        }
        Command::Replay { scenario } => {
            let scenario = Scenario::load_from_file(&scenario)?;
            let records = run_scenario(scenario, logger)?;
            let mut out = std::io::stdout().lock();
            for record in records {
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
            }
        }
        Command::Run { config } => {
            let config = CoreConfig::load_from_file(&config)?;
            config.validate()?;
            let core = PimCore::new(config, logger.clone(), Instant::now());
            let (event_tx, mut action_rx, event_loop) = event_loop_with_channel(core, logger.clone());

            let reader_logger = logger.clone();
            let reader = tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match serde_json::from_str::<PimEvent>(&line) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log_warning!(
                                reader_logger,
                                Facility::Supervisor,
                                &format!("bad event line: {}", e)
                            ),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            log_error!(reader_logger, Facility::Supervisor, &format!("stdin: {}", e));
                            break;
                        }
                    }
                }
            });
            let printer = tokio::spawn(async move {
                while let Some(action) = action_rx.recv().await {
                    match serde_json::to_string(&action) {
                        Ok(line) => println!("{}", line),
                        Err(e) => eprintln!("unprintable action: {}", e),
                    }
                }
            });

            let (_core, loop_stats) = event_loop.run().await;
            reader.await?;
            printer.await?;
            log_info!(
                logger,
                Facility::Supervisor,
                &format!("{} events ({} rejected)", loop_stats.events, loop_stats.rejected)
            );
        }
    }

    Ok(())
}
