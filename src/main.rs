//! CLI entry point for the folio downloader.

use std::fs;
use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use folio_core::config::{EngineConfig, normalize_ext};
use folio_core::download::{DownloadManager, ManagerError, RunSummary, VolumeSpec};
use folio_core::layout::PageRange;
use tracing::{debug, error, info};

mod cli;
mod input;
mod progress;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args)?;
    let mut manager = DownloadManager::from_config(&config)?;

    if let Some(path) = &args.task_file {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file '{}'", path.display()))?;
        let tasks = input::parse_task_file(
            &contents,
            &config.save_root,
            config.effective_segment_concurrency(0),
        )
        .with_context(|| format!("Failed to parse task file '{}'", path.display()))?;
        for task in tasks {
            manager.add_task(task.with_overwrite(args.overwrite));
        }
    } else if !args.urls.is_empty() {
        manager.add_volume(&VolumeSpec {
            book_id: args.book_id.clone(),
            volume_id: args.volume_id.clone(),
            uris: args.urls.clone(),
            ext: config.file_ext.clone(),
            page_range: config.page_range,
            overwrite: args.overwrite,
            ..VolumeSpec::default()
        });
    } else {
        info!("No input provided. Pass page URLs as arguments or a task file with --input.");
        return Ok(ExitCode::SUCCESS);
    }

    if manager.pending() == 0 {
        info!("No tasks to download");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = manager.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing running downloads");
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let (progress_handle, progress_stop) = progress::spawn_progress_ui(
        progress::should_draw(io::stderr().is_terminal(), args.quiet),
        manager.progress(),
    );

    let result = manager.start().await;

    progress_stop.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let (summary, aborted) = match result {
        Ok(summary) => (summary, None),
        Err(ManagerError::Aborted { source, summary }) => (*summary, Some(source)),
        Err(err) => return Err(err.into()),
    };

    print_summary(&summary, args.quiet);
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write report '{}'", path.display()))?;
    }

    if let Some(source) = aborted {
        error!(error = %source, "Run aborted");
        return Ok(ExitCode::FAILURE);
    }
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Loads the config file and applies command-line overrides.
fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(output) = &args.output {
        config.save_root.clone_from(output);
    }
    if let Some(cookie) = &args.cookie {
        config.cookie_file = Some(cookie.clone());
    }
    if let Some(threads) = args.threads {
        config.threads = usize::from(threads);
    }
    if let Some(segments) = args.segments {
        config.segment_concurrency = usize::from(segments);
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = u32::from(retries);
    }
    if let Some(speed) = args.speed {
        config.speed_secs = speed;
    }
    if let Some(seq) = &args.seq {
        config.page_range = PageRange::parse(seq)?;
    }
    if let Some(ext) = &args.ext {
        config.file_ext = normalize_ext(ext);
    }
    if let Some(user_agent) = &args.user_agent {
        config.user_agent.clone_from(user_agent);
    }
    if let Some(command) = &args.reauth_command {
        config.reauth_command = Some(command.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_summary(summary: &RunSummary, quiet: bool) {
    for failure in &summary.failures {
        let status = failure
            .status
            .map_or_else(String::new, |status| format!(" [{status}]"));
        println!(
            "FAILED {} -> {}{status}: {}",
            failure.uri, failure.destination, failure.reason
        );
    }
    if !quiet {
        println!(
            "{} downloaded, {} skipped, {} failed, {} not started ({} bytes)",
            summary.downloaded, summary.skipped, summary.failed, summary.not_started, summary.bytes
        );
    }
}
