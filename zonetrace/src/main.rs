//! # zonetrace-capture - Main Entry Point
//!
//! Connects to an instrumented process, streams its trace until the client
//! terminates, `--duration` elapses or Ctrl+C is pressed, then prints a
//! summary and optionally writes a Chrome trace.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, TryRecvError};
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zonetrace::capture::{Capture, CaptureEnd, CollectorConnection};
use zonetrace::cli::Args;
use zonetrace::domain::CaptureError;
use zonetrace::export::ChromeTraceExporter;
use zonetrace::preflight::check_export_target;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_SUCCESS };
            e.print().ok();
            std::process::exit(code);
        }
    };
    std::process::exit(match run(args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

/// What the capture thread hands back
struct Finished {
    capture: Capture,
    end: CaptureEnd,
    program: String,
    pid: u64,
}

fn capture_thread(args: &Args, stop: &AtomicBool) -> Result<Finished, CaptureError> {
    let timeout = Duration::from_secs(args.connect_timeout);
    let mut conn = CollectorConnection::connect((args.host.as_str(), args.port), timeout)?;
    if let Some(on_demand) = conn.on_demand() {
        info!("On-demand client, {} frames before we attached", on_demand.frames);
    }
    let mut capture = Capture::new();
    let end = capture.run(&mut conn, stop)?;
    Ok(Finished { capture, end, program: conn.program_name(), pid: conn.welcome().pid })
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let quiet = args.quiet;
    if let Some(path) = &args.export {
        check_export_target(path)?;
    }
    if !quiet {
        println!("zonetrace-capture v{}", env!("CARGO_PKG_VERSION"));
        println!("client: {}:{}", args.host, args.port);
        if let Some(path) = &args.export {
            println!("export: {}", path.display());
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = bounded(1);
    let handle = {
        let stop = Arc::clone(&stop);
        let args = args.clone();
        std::thread::Builder::new()
            .name("zonetrace-capture".into())
            .spawn(move || {
                done_tx.send(capture_thread(&args, &stop)).ok();
            })
            .context("Failed to spawn capture thread")?
    };

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit = if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

    // Track why we stopped
    let mut stop_reason = None;

    let finished = loop {
        match done_rx.try_recv() {
            Ok(result) => break result,
            Err(TryRecvError::Disconnected) => anyhow::bail!("Capture thread exited without a result"),
            Err(TryRecvError::Empty) => {}
        }

        if stop_reason.is_none() && duration_limit.is_some_and(|limit| started.elapsed() >= limit) {
            stop_reason = Some("duration limit reached");
            stop.store(true, Ordering::Relaxed);
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c, if stop_reason.is_none() => {
                stop_reason = Some("interrupted");
                stop.store(true, Ordering::Relaxed);
            }
        }
    };
    handle.join().ok();

    let Finished { capture, end, program, pid } = finished.context("Capture failed")?;
    let exit_reason = match end {
        CaptureEnd::Terminated => "client terminated",
        CaptureEnd::Disconnected => "connection lost",
        CaptureEnd::Stopped => stop_reason.unwrap_or("stopped"),
    };

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} from {} (pid {}): {} records, {} zones, {} messages, {} threads",
            exit_reason,
            started.elapsed().as_secs_f64(),
            if capture.unanswered() == 0 { "complete" } else { "partial" },
            program,
            pid,
            capture.records().len(),
            capture.zones().len(),
            capture.messages().len(),
            capture.threads().len(),
        );
    }

    if let Some(export_path) = &args.export {
        let exporter = ChromeTraceExporter::new(&capture, pid);
        let file = File::create(export_path).context("Failed to create trace output file")?;
        let writer = BufWriter::new(file);
        exporter.export(writer).context("Failed to export trace")?;

        if !quiet {
            println!("saved: {} ({} events)", export_path.display(), exporter.event_count());
        }
    }

    Ok(())
}
