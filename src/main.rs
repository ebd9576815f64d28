mod backend;
mod bmp;
mod capture;
mod cli;
mod diagnostics;
mod fps;
mod snapshot;

use std::process::{self, ExitCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use capture::StopReason;
use cli::Command;

/// 128 + SIGINT, what the shell reports for a process killed by Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = match cli::parse_args()? {
        Command::Help => {
            cli::print_usage();
            return Ok(());
        }
        Command::Capture(config) => config,
    };

    info!(
        stream_uri = %config.stream_uri,
        img_folder = %config.img_folder.display(),
        "stream2img starting"
    );
    info!(os = %diagnostics::os_description(), "host");

    std::fs::create_dir_all(&config.img_folder)
        .with_context(|| format!("Failed to create {}", config.img_folder.display()))?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        if handler_stop.swap(true, Ordering::SeqCst) {
            warn!("second interrupt, exiting without cleanup");
            process::exit(INTERRUPTED_EXIT_CODE);
        }
        info!("interrupt received, stopping after the current packet (Ctrl-C again to quit)");
    })
    .context("Failed to install Ctrl-C handler")?;

    let summary = backend::capture(&config, &stop)?;
    let stats = summary.stats;
    let last_fps = stats
        .last_fps
        .map(|fps| format!("{fps:.2}"))
        .unwrap_or_else(|| "-".to_string());

    let reason = match summary.reason {
        StopReason::EndOfStream => "end of stream",
        StopReason::FrameLimit => "frame limit",
        StopReason::Interrupted => "interrupted",
    };
    info!(
        reason,
        frames = stats.frames,
        jpeg_written = stats.jpeg_written,
        jpeg_failed = stats.jpeg_failed,
        bmp_written = stats.bitmap_written,
        bmp_failed = stats.bitmap_failed,
        last_fps = %last_fps,
        "capture finished"
    );

    Ok(())
}
