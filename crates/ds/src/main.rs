//! ds - droidscope CLI
//!
//! Record Android input sessions with UI element context, replay them.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use droidscope::device::{Adb, AdbDevice};
use droidscope::error::Error;
use droidscope::prelude::*;

use crate::config::Settings;
use crate::logging::{LogConfig, LogFormat};

const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ds")]
#[command(about = "droidscope - record and replay Android input with UI context")]
#[command(version)]
struct Cli {
    /// Settings file with [recorder] and [replay] tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// adb executable (default: $ADB, then adb on PATH)
    #[arg(long, global = true)]
    adb: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(short, long, global = true)]
    quiet: bool,
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices
    Devices,
    /// Record input events until Ctrl+C
    Record {
        /// Device serial (default: the only connected device)
        #[arg(short, long)]
        serial: Option<String>,
        #[arg(short, long, default_value = "recording")]
        name: String,
        /// Write here instead of ~/.droidscope
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Parse unprefixed getevent values as hex
        #[arg(long)]
        hex_values: bool,
    },
    /// Replay a recording
    Replay {
        file: String,
        #[arg(short, long)]
        serial: Option<String>,
        /// Wait the recorded gaps (clamped) instead of a fixed delay
        #[arg(long)]
        original_timing: bool,
    },
    /// List saved recordings
    List,
    /// Show recording info
    Show {
        file: String,
        #[arg(long)]
        all: bool,
    },
    /// Delete a recording
    Delete {
        file: String,
    },
}

#[derive(Serialize)]
struct Output<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl<T: Serialize> Output<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
    fn err(e: Error) -> Output<()> {
        Output { success: false, data: None, error: Some(e) }
    }
}

fn print_json<T: Serialize>(output: &T) {
    match serde_json::to_string_pretty(output) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Error: {}", e),
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    logging::init(&LogConfig::from_cli(cli.verbose, cli.quiet, cli.log_format));

    let result = Settings::load(cli.config.as_deref()).and_then(|settings| {
        let adb = settings.adb(cli.adb.as_deref());
        match cli.command {
            Commands::Devices => devices(&adb),
            Commands::Record { serial, name, output, hex_values } => {
                let mut config = settings.recorder.clone();
                config.bare_hex_values |= hex_values;
                record(&adb, serial.as_deref(), &name, output.as_deref(), config)
            }
            Commands::Replay { file, serial, original_timing } => {
                let mut config = settings.replay.clone();
                config.use_original_timing |= original_timing;
                replay(&adb, &file, serial.as_deref(), config)
            }
            Commands::List => list(),
            Commands::Show { file, all } => show(&file, all),
            Commands::Delete { file } => delete(&file),
        }
    });

    if let Err(e) = result {
        if let Some(err) = e.downcast_ref::<Error>() {
            print_json(&Output::<()>::err(err.clone()));
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn connect(adb: &Adb, serial: Option<&str>) -> Result<AdbDevice> {
    let device = match serial {
        Some(s) => adb.device(s, DEVICE_TIMEOUT)?,
        None => adb.default_device(DEVICE_TIMEOUT)?,
    };
    Ok(device)
}

/// Sets the returned flag on Ctrl+C.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl+C handler")?;
    Ok(interrupted)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn devices(adb: &Adb) -> Result<()> {
    let serials = adb.list_connected(DEVICE_TIMEOUT)?;
    print_json(&Output::ok(serials));
    Ok(())
}

fn record(
    adb: &Adb,
    serial: Option<&str>,
    name: &str,
    output: Option<&Path>,
    config: RecorderConfig,
) -> Result<()> {
    let device = connect(adb, serial)?;
    let recorder = Recorder::with_config(Arc::new(device), config);

    let mut path = PathBuf::new();
    let handle = recorder.start_with(|_| {
        let writer = match output {
            Some(p) => JsonArrayWriter::create(p)?,
            None => RecordingStorage::new()?.create(name)?,
        };
        path = writer.path().to_path_buf();
        Ok(Box::new(writer) as Box<dyn RecordSink>)
    })?;
    let interrupted = interrupt_flag()?;
    let live = handle.receiver().clone();

    let info = handle.info();
    eprintln!(
        "Recording {} ({} input devices, foreground {}) to {} - Ctrl+C to stop",
        info.serial,
        info.input_devices.len(),
        info.context,
        path.display()
    );

    while !interrupted.load(Ordering::SeqCst) && handle.is_running() {
        if let Some(record) = handle.recv_timeout(Duration::from_millis(100)) {
            println!("{}", record.console_line());
        }
    }

    let written = handle.stop();
    for record in live.try_iter() {
        println!("{}", record.console_line());
    }
    eprintln!("{} events recorded", written);
    eprintln!("Saved: {}", path.display());
    Ok(())
}

fn replay(adb: &Adb, file: &str, serial: Option<&str>, config: ReplayConfig) -> Result<()> {
    let storage = RecordingStorage::new()?;
    let records = storage.load(file)?;
    let device = connect(adb, serial)?;

    eprintln!("Replaying {} ({} events) on {}...", file, records.len(), device.serial());
    let mut replayer = Replayer::with_config(Arc::new(device), config);
    let cancel = replayer.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
        .context("installing Ctrl+C handler")?;

    let stats = replayer.play(&records);
    match &stats.launch {
        Some(LaunchOutcome::Failed { found }) => eprintln!("Warning: target app not launched (foreground: {})", found),
        Some(LaunchOutcome::Launched { exact: false, .. }) => eprintln!("Warning: target app launched on a different screen"),
        _ => {}
    }
    let status = if stats.cancelled { "Cancelled" } else { "Done" };
    eprintln!(
        "{}! {} taps, {} keys, {} skipped, {} failed commands",
        status, stats.taps, stats.keys, stats.skipped, stats.failed_commands
    );
    Ok(())
}

fn list() -> Result<()> {
    let storage = RecordingStorage::new()?;
    let files = storage.list()?;
    if files.is_empty() {
        println!("No recordings saved.");
    } else {
        for f in files {
            println!("{}", f);
        }
    }
    Ok(())
}

fn show(file: &str, all: bool) -> Result<()> {
    let storage = RecordingStorage::new()?;
    let records = storage.load(file)?;
    let summary = Summary::of(&records);

    println!("File: {}", storage.resolve(file).display());
    println!("Events: {}", records.len());
    if let Some(span) = summary.span {
        println!("Duration: {:.1}s", span.as_secs_f64());
    }
    let kinds: Vec<String> = summary.kinds.iter().map(|(k, n)| format!("{} {}", n, k)).collect();
    println!("\nSummary: {}", kinds.join(", "));
    println!("Apps: {}", summary.packages.join(", "));
    if all {
        for record in &records {
            println!("{}: {}", record.event_id, record.console_line());
        }
    }
    Ok(())
}

fn delete(file: &str) -> Result<()> {
    let storage = RecordingStorage::new()?;
    storage.delete(file)?;
    println!("Deleted: {}", file);
    Ok(())
}

// ── Summary ─────────────────────────────────────────────────────────────────

struct Summary {
    kinds: BTreeMap<&'static str, usize>,
    /// Distinct known packages, first-seen order
    packages: Vec<String>,
    span: Option<Duration>,
}

impl Summary {
    fn of(records: &[FinishedRecord]) -> Self {
        let mut kinds = BTreeMap::new();
        let mut packages: Vec<String> = Vec::new();
        for record in records {
            *kinds.entry(record.event_type.as_str()).or_insert(0) += 1;
            if record.package != "unknown" && !packages.contains(&record.package) {
                packages.push(record.package.clone());
            }
        }
        let span = match (records.first(), records.last()) {
            (Some(first), Some(last)) => time_between(&first.timestamp, &last.timestamp),
            _ => None,
        };
        Self { kinds, packages, span }
    }
}

fn time_between(start: &str, end: &str) -> Option<Duration> {
    let parse = |s: &str| chrono::NaiveTime::parse_from_str(s, "%H:%M:%S%.3f").ok();
    let (start, end) = (parse(start)?, parse(end)?);
    let mut delta = end.signed_duration_since(start);
    if delta < chrono::Duration::zero() {
        delta += chrono::Duration::days(1);
    }
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, ts: &str, kind: EventKind, package: &str) -> FinishedRecord {
        FinishedRecord {
            timestamp: ts.to_string(),
            device: "/dev/input/event1".to_string(),
            package: package.to_string(),
            activity: ".Main".to_string(),
            event_type: kind,
            coordinates: Coordinates::default(),
            resource_id: "unknown".to_string(),
            extra_info: String::new(),
            event_id: id,
        }
    }

    #[test]
    fn summary_counts_kinds_and_apps() {
        let records = vec![
            record(0, "10:00:00.000", EventKind::TouchDown, "unknown"),
            record(1, "10:00:00.100", EventKind::TouchDown, "com.example"),
            record(2, "10:00:01.500", EventKind::KeyDown, "com.example"),
            record(3, "10:00:02.000", EventKind::Motion, "com.other"),
        ];
        let summary = Summary::of(&records);
        assert_eq!(summary.kinds["TOUCH_DOWN"], 2);
        assert_eq!(summary.kinds["KEY_DOWN"], 1);
        assert_eq!(summary.packages, vec!["com.example", "com.other"]);
        assert_eq!(summary.span, Some(Duration::from_secs(2)));
    }

    #[test]
    fn span_wraps_midnight() {
        assert_eq!(
            time_between("23:59:59.000", "00:00:01.000"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(time_between("garbage", "00:00:01.000"), None);
    }

    #[test]
    fn cli_parses_record_flags() {
        let cli = Cli::try_parse_from([
            "ds", "record", "-s", "emulator-5554", "-n", "login", "--hex-values", "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Record { serial, name, hex_values, output } => {
                assert_eq!(serial.as_deref(), Some("emulator-5554"));
                assert_eq!(name, "login");
                assert!(hex_values);
                assert!(output.is_none());
            }
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["ds", "--log-format", "xml", "list"]).is_err());
    }
}
