//! Capture session - getevent stream in, correlated records out
//!
//! Three threads per session:
//!
//! - **reader**: owns the line stream and the tokenizer, applies fragments
//!   and queries the foreground app on TouchDown/KeyDown
//! - **flusher**: ticks every `tick_ms`, flushes due events to the sink and
//!   the live channel
//! - **refresher**: re-dumps the UI hierarchy every `hierarchy_interval_ms`,
//!   or on the next tick after an app switch
//!
//! The aggregator sits behind one mutex; the hierarchy snapshot is swapped
//! whole behind its own lock, so a 5 s dump never holds up a flush.

use crate::aggregator::{wall_stamp, Aggregator};
use crate::events::FinishedRecord;
use crate::storage::RecordSink;
use crate::tokenizer::Tokenizer;
use anyhow::{Context, Result};
pub use crossbeam_channel::{Receiver, Sender};
use crossbeam_channel::{bounded, select, tick};
use droidscope_core::apps::{self, AppContext};
use droidscope_core::device::{Device, LineStream, StreamTerminator};
use droidscope_core::hierarchy::{DumpConfig, HierarchyTracker};
use droidscope_core::Error;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Max time an incomplete event waits before it is flushed anyway
    pub buffer_timeout_ms: u64,
    /// Flush evaluation interval
    pub tick_ms: u64,
    /// Periodic hierarchy refresh when the foreground app is unchanged
    pub hierarchy_interval_ms: u64,
    /// Foreground app query on TouchDown/KeyDown
    pub context_timeout_ms: u64,
    /// Cheap device checks (ls, getprop, rm)
    pub quick_timeout_ms: u64,
    /// `uiautomator dump` and pull
    pub dump_timeout_ms: u64,
    /// Live record channel capacity
    pub max_buffer: usize,
    /// Parse unprefixed getevent values as hex
    pub bare_hex_values: bool,
    pub remote_dump_path: String,
    /// Defaults to a per-serial file in the temp dir
    pub local_dump_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_timeout_ms: 100,
            tick_ms: 50,
            hierarchy_interval_ms: 1000,
            context_timeout_ms: 3000,
            quick_timeout_ms: 1000,
            dump_timeout_ms: 5000,
            max_buffer: 10000,
            bare_hex_values: false,
            remote_dump_path: "/sdcard/window_dump.xml".to_string(),
            local_dump_path: None,
        }
    }
}

impl RecorderConfig {
    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn hierarchy_interval(&self) -> Duration {
        Duration::from_millis(self.hierarchy_interval_ms)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_timeout_ms)
    }

    pub fn dump_config(&self, serial: &str) -> DumpConfig {
        let mut dump = DumpConfig::for_serial(serial);
        dump.remote_path = self.remote_dump_path.clone();
        if let Some(local) = &self.local_dump_path {
            dump.local_path = local.clone();
        }
        dump.quick_timeout = self.quick_timeout();
        dump.dump_timeout = Duration::from_millis(self.dump_timeout_ms);
        dump
    }
}

/// What setup found on the device.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub serial: String,
    pub input_devices: Vec<String>,
    pub sdk: u32,
    pub context: AppContext,
    pub hierarchy_nodes: Option<usize>,
}

impl SessionInfo {
    /// `exec-out` keeps getevent output unbuffered on API 23+.
    pub fn getevent_args(&self) -> [&'static str; 3] {
        if self.sdk >= 23 {
            ["exec-out", "getevent", "-lt"]
        } else {
            ["shell", "getevent", "-lt"]
        }
    }
}

/// Recording handle - owns the capture threads
pub struct RecordingHandle {
    info: SessionInfo,
    stop: Arc<AtomicBool>,
    terminator: StreamTerminator,
    done_tx: Sender<()>,
    records_rx: Receiver<FinishedRecord>,
    reader: Option<thread::JoinHandle<()>>,
    flusher: Option<thread::JoinHandle<u64>>,
    refresher: Option<thread::JoinHandle<()>>,
    buffer_timeout: Duration,
    written: u64,
}

impl RecordingHandle {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// False once stopped or once the device stream has ended.
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Live records, in flush order. Bounded; a slow consumer misses records
    /// but the sink never does.
    pub fn receiver(&self) -> &Receiver<FinishedRecord> {
        &self.records_rx
    }

    pub fn try_recv(&self) -> Option<FinishedRecord> {
        self.records_rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<FinishedRecord> {
        self.records_rx.recv_timeout(timeout).ok()
    }

    /// Stop the reader, give in-flight events one buffer timeout, flush what
    /// remains and close the sink. Returns the number of records written.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        let Some(flusher) = self.flusher.take() else {
            return self.written;
        };
        self.stop.store(true, Ordering::SeqCst);
        self.terminator.terminate();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        thread::sleep(self.buffer_timeout);
        let _ = self.done_tx.send(());
        self.written = flusher.join().unwrap_or_else(|_| {
            warn!("flusher thread panicked");
            0
        });

        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.join();
        }
        info!(serial = %self.info.serial, records = self.written, "recording stopped");
        self.written
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The recorder
pub struct Recorder {
    device: Arc<dyn Device>,
    config: RecorderConfig,
}

impl Recorder {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self::with_config(device, RecorderConfig::default())
    }

    pub fn with_config(device: Arc<dyn Device>, config: RecorderConfig) -> Self {
        Self { device, config }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Probe the device before capture. Missing input devices are fatal;
    /// an unknown app context or failed first dump only degrade the session.
    pub fn setup(&self, tracker: &HierarchyTracker) -> droidscope_core::Result<SessionInfo> {
        let device = self.device.as_ref();
        let serial = device.serial().to_string();

        let input_devices = apps::list_input_devices(device, self.config.quick_timeout())?;
        if input_devices.is_empty() {
            return Err(Error::no_input_devices(&serial));
        }
        debug!(serial = %serial, devices = ?input_devices, "input devices");

        let sdk = apps::sdk_version(device, self.config.quick_timeout());

        let context = match apps::query_app_context(device, self.config.context_timeout()) {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!(serial = %serial, error = %e, "foreground app query failed");
                AppContext::unknown()
            }
        };
        if context.is_unknown() {
            warn!(serial = %serial, "foreground app unknown at start");
        }

        let hierarchy_nodes = match tracker.refresh(device) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(serial = %serial, error = %e, "initial hierarchy dump failed");
                None
            }
        };

        Ok(SessionInfo { serial, input_devices, sdk, context, hierarchy_nodes })
    }

    /// Run setup and start capturing into `sink`.
    pub fn start(&self, sink: Box<dyn RecordSink>) -> Result<RecordingHandle> {
        self.start_with(|_| Ok(sink))
    }

    /// Run setup, then open the sink with `open`. Nothing is opened when
    /// setup fails, so a session that never starts leaves no output behind.
    pub fn start_with<F>(&self, open: F) -> Result<RecordingHandle>
    where
        F: FnOnce(&SessionInfo) -> Result<Box<dyn RecordSink>>,
    {
        let tracker = Arc::new(HierarchyTracker::new(
            self.config.dump_config(self.device.serial()),
        ));
        let info = self.setup(&tracker).context("recording setup failed")?;

        let stream = self
            .device
            .stream(&info.getevent_args())
            .context("failed to start getevent")?;
        let terminator = stream.terminator();
        // dropping the stream on error stops getevent
        let sink = open(&info)?;

        let aggregator = Arc::new(Mutex::new(Aggregator::new(
            self.config.buffer_timeout(),
            info.context.clone(),
        )));
        let stop = Arc::new(AtomicBool::new(false));
        let (records_tx, records_rx) = bounded::<FinishedRecord>(self.config.max_buffer);
        let (done_tx, done_rx) = bounded::<()>(1);

        info!(
            serial = %info.serial,
            sdk = info.sdk,
            app = %info.context,
            "recording started"
        );

        // Thread 1: stream reader
        let reader = {
            let device = self.device.clone();
            let aggregator = aggregator.clone();
            let tracker = tracker.clone();
            let stop = stop.clone();
            let tokenizer = Tokenizer::new(self.config.bare_hex_values);
            let timeout = self.config.context_timeout();
            thread::spawn(move || {
                run_reader(stream, tokenizer, device, aggregator, tracker, stop, timeout)
            })
        };

        // Thread 2: flush ticker
        let flusher = {
            let aggregator = aggregator.clone();
            let tracker = tracker.clone();
            let ticker = tick(self.config.tick());
            thread::spawn(move || run_flusher(aggregator, tracker, sink, records_tx, ticker, done_rx))
        };

        // Thread 3: hierarchy refresh
        let refresher = {
            let device = self.device.clone();
            let stop = stop.clone();
            let ticker = tick(self.config.tick());
            let interval = self.config.hierarchy_interval();
            thread::spawn(move || run_refresher(device, tracker, stop, ticker, interval))
        };

        Ok(RecordingHandle {
            info,
            stop,
            terminator,
            done_tx,
            records_rx,
            reader: Some(reader),
            flusher: Some(flusher),
            refresher: Some(refresher),
            buffer_timeout: self.config.buffer_timeout(),
            written: 0,
        })
    }
}

// ============================================================================
// Threads
// ============================================================================

fn run_reader(
    stream: LineStream,
    mut tokenizer: Tokenizer,
    device: Arc<dyn Device>,
    aggregator: Arc<Mutex<Aggregator>>,
    tracker: Arc<HierarchyTracker>,
    stop: Arc<AtomicBool>,
    context_timeout: Duration,
) {
    for line in stream {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let Some(fragment) = tokenizer.parse_line(&line) else {
            continue;
        };

        let stamp = wall_stamp();
        let significant = {
            let mut agg = aggregator.lock();
            agg.apply(fragment, tokenizer.current_device(), &stamp, Instant::now())
        };

        // Query outside the lock; flushes of other events keep running
        if let Some(key) = significant {
            match apps::query_app_context(device.as_ref(), context_timeout) {
                Ok(ctx) => {
                    if aggregator.lock().update_context(&key, &ctx, Instant::now()) {
                        debug!(app = %ctx, "foreground app changed");
                        tracker.request_refresh();
                    }
                }
                Err(e) => {
                    debug!(error = %e, "app context query failed");
                    aggregator.lock().settle_context(&key, Instant::now());
                }
            }
        }
    }

    if !stop.swap(true, Ordering::SeqCst) {
        info!("event stream ended");
    }
}

fn run_flusher(
    aggregator: Arc<Mutex<Aggregator>>,
    tracker: Arc<HierarchyTracker>,
    mut sink: Box<dyn RecordSink>,
    records_tx: Sender<FinishedRecord>,
    ticker: Receiver<Instant>,
    done: Receiver<()>,
) -> u64 {
    let mut written = 0u64;
    let resolve = |x: i32, y: i32| tracker.resolve(x, y);

    loop {
        select! {
            recv(ticker) -> _ => {
                let records = aggregator.lock().flush_due(Instant::now(), resolve);
                written += emit(records, sink.as_mut(), &records_tx);
            }
            recv(done) -> _ => {
                let records = aggregator.lock().drain(resolve);
                written += emit(records, sink.as_mut(), &records_tx);
                break;
            }
        }
    }

    if let Err(e) = sink.close() {
        warn!(error = %e, "failed to close recording output");
    }
    written
}

fn emit(records: Vec<FinishedRecord>, sink: &mut dyn RecordSink, live: &Sender<FinishedRecord>) -> u64 {
    let mut written = 0;
    for record in records {
        match sink.write(&record) {
            Ok(()) => written += 1,
            Err(e) => warn!(event_id = record.event_id, error = %e, "failed to write record"),
        }
        if live.try_send(record).is_err() {
            debug!("live record channel full or closed");
        }
    }
    written
}

fn run_refresher(
    device: Arc<dyn Device>,
    tracker: Arc<HierarchyTracker>,
    stop: Arc<AtomicBool>,
    ticker: Receiver<Instant>,
    interval: Duration,
) {
    let mut last_attempt = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        if ticker.recv().is_err() {
            break;
        }
        let now = Instant::now();
        let requested = tracker.take_refresh_request();
        if !requested && now.duration_since(last_attempt) < interval {
            continue;
        }
        last_attempt = now;
        match tracker.refresh(device.as_ref()) {
            Ok(nodes) => debug!(nodes, requested, "hierarchy updated"),
            // stale-but-valid: keep the previous snapshot
            Err(e) => debug!(error = %e, "hierarchy refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RecorderConfig::default();
        assert_eq!(config.buffer_timeout(), Duration::from_millis(100));
        assert_eq!(config.tick(), Duration::from_millis(50));
        assert_eq!(config.max_buffer, 10000);
        assert!(!config.bare_hex_values);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{"buffer_timeout_ms": 250, "bare_hex_values": true}"#).unwrap();
        assert_eq!(config.buffer_timeout_ms, 250);
        assert!(config.bare_hex_values);
        assert_eq!(config.hierarchy_interval_ms, 1000);
    }

    #[test]
    fn dump_config_overrides() {
        let config = RecorderConfig {
            local_dump_path: Some(PathBuf::from("/tmp/x.xml")),
            dump_timeout_ms: 7000,
            ..Default::default()
        };
        let dump = config.dump_config("emulator-5554");
        assert_eq!(dump.local_path, PathBuf::from("/tmp/x.xml"));
        assert_eq!(dump.dump_timeout, Duration::from_secs(7));
        assert_eq!(dump.remote_path, "/sdcard/window_dump.xml");
    }

    #[test]
    fn getevent_transport_depends_on_sdk() {
        let mut info = SessionInfo {
            serial: "s".to_string(),
            input_devices: vec!["/dev/input/event0".to_string()],
            sdk: 30,
            context: AppContext::unknown(),
            hierarchy_nodes: None,
        };
        assert_eq!(info.getevent_args()[0], "exec-out");
        info.sdk = 19;
        assert_eq!(info.getevent_args()[0], "shell");
    }
}
