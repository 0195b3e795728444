mod commands;
mod logging;
mod progress;
mod sink;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{CalibrationAction, Cli, Commands};
use crossbeam_channel::Receiver;
use dotenv::dotenv;
use intake_core::paths::analyze_paths;
use intake_core::{
    scanner, AppConfig, FileStatus, IntakeQueue, QueueEvent, QueuePhase, SharedHandle,
    ThreadWorkerFactory,
};
use progress::CliReporter;
use sink::DirectorySink;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const POLL_TICK: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.verbose);

    let config = match intake_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            std::process::exit(1);
        }
    };

    match args.command {
        Some(Commands::Scan { dir, timings_csv }) => {
            let queue = run_scan(&config, &dir)?;
            print_summary(&queue);
            if let (Some(path), Some(timings)) = (timings_csv, queue.last_timings()) {
                timings
                    .write_csv(&path)
                    .with_context(|| format!("writing timings to {}", path.display()))?;
                info!("Timings appended to {}", path.display());
            }
        }
        Some(Commands::Estimate { dir }) => run_estimate(&config, &dir)?,
        Some(Commands::Upload { dir, dest }) => {
            let mut queue = run_scan(&config, &dir)?;
            if queue.phase() != QueuePhase::Ready {
                anyhow::bail!("queue ended in phase {}, nothing uploaded", queue.phase());
            }
            let sink = DirectorySink::new(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            let events = queue.subscribe();
            let mut reporter = CliReporter::starting_at(queue.phase());
            let summary = queue.upload_ready(&sink);
            drain(&events, &mut reporter);
            reporter.finish();

            println!();
            println!(
                "{} uploaded, {} failed, {} duplicates skipped",
                format!("{}", summary.uploaded).green(),
                format!("{}", summary.failed).red(),
                format!("{}", summary.skipped).yellow(),
            );
            print_errors(&queue);
        }
        Some(Commands::Calibration { action }) => {
            let mut store = config.calibration_store();
            match action {
                CalibrationAction::Show => {
                    let samples = store.samples();
                    for sample in &samples {
                        let when = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(sample.timestamp)
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| sample.timestamp.to_string());
                        println!("{}  {:.4} files/ms", when, sample.h_factor);
                    }
                    println!(
                        "{} samples, factor {}",
                        samples.len(),
                        format!("{:.4}", store.calibration_factor()).cyan()
                    );
                }
                CalibrationAction::Reset => {
                    store.reset();
                    println!("Calibration reset to baseline");
                }
            }
        }
        Some(Commands::PrintConfig) => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{}", rendered);
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn collect_handles(config: &AppConfig, dir: &Path) -> anyhow::Result<Vec<SharedHandle>> {
    let files = scanner::collect_files(dir, &config.ignore_patterns)
        .with_context(|| format!("scanning {}", dir.display()))?;
    Ok(files
        .into_iter()
        .map(|f| Arc::new(f) as SharedHandle)
        .collect())
}

fn run_scan(config: &AppConfig, dir: &Path) -> anyhow::Result<IntakeQueue> {
    let handles = collect_handles(config, dir)?;
    let factory = ThreadWorkerFactory::new(Duration::from_millis(config.worker.progress_interval_ms));
    let mut queue = IntakeQueue::new(config.build_context(), Box::new(factory));
    let events = queue.subscribe();
    let mut reporter = CliReporter::new();

    queue.drop_folder(handles)?;
    drain(&events, &mut reporter);
    while queue.phase() == QueuePhase::Hashing {
        queue.poll(POLL_TICK);
        drain(&events, &mut reporter);
    }
    reporter.finish();
    Ok(queue)
}

fn run_estimate(config: &AppConfig, dir: &Path) -> anyhow::Result<()> {
    let handles = collect_handles(config, dir)?;
    let paths: Vec<String> = handles
        .iter()
        .map(|h| {
            h.relative_path()
                .map(str::to_string)
                .unwrap_or_else(|| h.name().to_string())
        })
        .collect();
    let stats = analyze_paths(paths.iter().map(String::as_str));

    let metas: Vec<_> = handles
        .iter()
        .zip(&paths)
        .enumerate()
        .map(|(idx, (h, path))| intake_core::model::CandidateMeta {
            id: intake_core::RecordId(idx as u64),
            path: path.clone(),
            size: h.size(),
            last_modified: h.last_modified(),
            original_index: idx,
        })
        .collect();
    let partition = intake_core::dedup::partition_by_size(&metas);
    let analysis = intake_core::analysis::BatchAnalysis::new(&stats, &partition);

    let mut store = config.calibration_store();
    let factor = store.calibration_factor();
    let estimator = intake_core::estimate::Estimator::new(config.estimator);
    let estimate = estimator.estimate(&analysis.estimate_input(), factor);

    println!(
        "{} files in {} directories (avg depth {:.1}, max {})",
        format!("{}", analysis.total_files).cyan(),
        analysis.directory_count,
        analysis.avg_depth,
        analysis.max_depth
    );
    println!(
        "{} duplicate candidates ({:.1}%, {:.1} MB)",
        format!("{}", analysis.candidate_count).yellow(),
        analysis.candidate_percent,
        analysis.candidate_size_mb
    );
    println!(
        "Estimate: {} (analyze {:.0} ms, hash {:.0} ms, queue {:.0} ms) at {:.4} files/ms",
        format!("{:.2}s", estimate.total_ms / 1000.0).green(),
        estimate.phase1_ms,
        estimate.phase2_ms,
        estimate.phase3_ms,
        factor
    );
    Ok(())
}

fn drain(events: &Receiver<QueueEvent>, reporter: &mut CliReporter) {
    for event in events.try_iter() {
        reporter.handle(&event);
    }
}

fn print_summary(queue: &IntakeQueue) {
    let counts = queue.counts();
    println!();
    println!(
        "{} ready, {} duplicates, {} errors",
        format!("{}", counts.ready).green(),
        format!("{}", counts.duplicate).yellow(),
        format!("{}", counts.error).red(),
    );
    for record in queue.records() {
        if record.status == FileStatus::Duplicate {
            println!("  {} {}", "duplicate".yellow(), record.path);
        }
    }
    print_errors(queue);
    if let Some(timings) = queue.last_timings() {
        info!(
            "Scan: {}, Hash: {}, estimate {} ({:.1}% accurate)",
            format!("{:.2}s", timings.scanning_ms / 1000.0).green(),
            format!("{:.2}s", timings.hashing_ms / 1000.0).green(),
            format!("{:.2}s", timings.estimated_total_ms / 1000.0).cyan(),
            timings.accuracy_percent
        );
    }
}

fn print_errors(queue: &IntakeQueue) {
    for record in queue.records() {
        if record.status == FileStatus::Error {
            println!(
                "  {} {}: {}",
                "error".red(),
                record.path,
                record.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
