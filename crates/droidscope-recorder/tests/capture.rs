//! End-to-end capture against a scripted device

use droidscope_core::device::{CommandOutput, Device, LineStream};
use droidscope_core::{ErrorCode, Result};
use droidscope_recorder::prelude::*;
use parking_lot::Mutex;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" bounds="[0,0][1080,1920]">
    <node index="0" text="Welcome" resource-id="com.example:id/banner" class="android.widget.TextView" package="com.example" content-desc="" bounds="[0,0][400,120]" />
  </node>
</hierarchy>"#;

const MAIN: &str = "com.example/com.example.MainActivity";

struct FakeDevice {
    lines: Vec<String>,
    input_devices: &'static str,
    commands: Mutex<Vec<String>>,
    /// Focus reported by successive `dumpsys window` calls; the last repeats
    focus: Vec<&'static str>,
    queries: AtomicUsize,
    dumpsys_delay: Duration,
    /// Keep the event stream open this long after the last line
    linger: Duration,
}

impl FakeDevice {
    fn builder(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            input_devices: "event0\nevent1\n",
            commands: Mutex::new(Vec::new()),
            focus: vec![MAIN],
            queries: AtomicUsize::new(0),
            dumpsys_delay: Duration::ZERO,
            linger: Duration::ZERO,
        }
    }

    fn new(lines: &[&str]) -> Arc<Self> {
        Arc::new(Self::builder(lines))
    }

    fn issued(&self, needle: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.contains(needle)).count()
    }
}

/// Script bytes, then a pause before EOF like a device that goes quiet.
struct Lingering {
    data: Cursor<Vec<u8>>,
    linger: Duration,
    lingered: bool,
}

impl Read for Lingering {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.data.read(buf)?;
        if n == 0 && !self.lingered {
            self.lingered = true;
            std::thread::sleep(self.linger);
        }
        Ok(n)
    }
}

impl Device for FakeDevice {
    fn serial(&self) -> &str {
        "fake-5554"
    }

    fn run(&self, args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
        let line = args.join(" ");
        self.commands.lock().push(line.clone());
        let stdout = if line.contains("ls /dev/input") {
            self.input_devices.to_string()
        } else if line.contains("getprop ro.build.version.sdk") {
            "30\n".to_string()
        } else if line.contains("dumpsys window") {
            std::thread::sleep(self.dumpsys_delay);
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            let focus = self.focus[n.min(self.focus.len() - 1)];
            format!("  mCurrentFocus=Window{{1f2e u0 {}}}\n", focus)
        } else {
            String::new()
        };
        Ok(CommandOutput { status: 0, stdout, stderr: String::new() })
    }

    fn stream(&self, args: &[&str]) -> Result<LineStream> {
        self.commands.lock().push(args.join(" "));
        let mut script = self.lines.join("\n");
        script.push('\n');
        Ok(LineStream::from_reader(BufReader::new(Lingering {
            data: Cursor::new(script.into_bytes()),
            linger: self.linger,
            lingered: false,
        })))
    }

    fn pull(&self, _remote: &str, local: &Path, _timeout: Duration) -> Result<()> {
        std::fs::write(local, DUMP)?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemorySink {
    records: Arc<Mutex<Vec<FinishedRecord>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &FinishedRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        tick_ms: 10,
        hierarchy_interval_ms: 60_000,
        local_dump_path: Some(dir.join("window_dump.xml")),
        ..Default::default()
    }
}

fn wait_for_stream_end(handle: &RecordingHandle) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn frame_and_bare_touch_become_records() {
    let dir = tempfile::tempdir().unwrap();
    let device = FakeDevice::new(&[
        "add device 1: /dev/input/event1",
        "  name:     \"virtio_input_multi_touch_1\"",
        "[   100.000001] /dev/input/event1: EV_ABS       ABS_MT_POSITION_X    0x64",
        "[   100.000002] /dev/input/event1: EV_ABS       ABS_MT_POSITION_Y    0x32",
        "[   100.000003] /dev/input/event1: EV_SYN       SYN_REPORT           00000000",
        "[   100.500000] /dev/input/event1: EV_KEY       BTN_TOUCH            DOWN",
    ]);
    let sink = MemorySink::default();
    let recorder = Recorder::with_config(device.clone(), config(dir.path()));

    let handle = recorder.start(Box::new(sink.clone())).unwrap();
    assert_eq!(handle.info().sdk, 30);
    assert_eq!(handle.info().hierarchy_nodes, Some(2));

    let live = handle.recv_timeout(Duration::from_secs(5)).expect("motion record");
    assert_eq!(live.event_type, EventKind::Motion);

    wait_for_stream_end(&handle);
    assert!(!handle.is_running());
    assert_eq!(handle.stop(), 2);

    let records = sink.records.lock().clone();
    assert_eq!(records.len(), 2);
    assert!(*sink.closed.lock());

    let motion = &records[0];
    assert_eq!(motion.event_type, EventKind::Motion);
    assert_eq!(motion.coordinates, Coordinates::new(100, 50));
    assert_eq!(motion.resource_id, "com.example:id/banner");
    assert_eq!(motion.device, "/dev/input/event1");
    assert_eq!(motion.event_id, 0);

    let touch = &records[1];
    assert_eq!(touch.event_type, EventKind::TouchDown);
    assert_eq!(touch.coordinates, Coordinates::default());
    assert_eq!(touch.resource_id, "unknown");
    assert_eq!(touch.package, "com.example");
    assert_eq!(touch.activity, "com.example.MainActivity");
    assert_eq!(touch.event_id, 1);

    let commands = device.commands.lock().clone();
    assert!(commands.iter().any(|c| c == "exec-out getevent -lt"));
}

#[test]
fn session_writes_terminated_json_array() {
    let dir = tempfile::tempdir().unwrap();
    let device = FakeDevice::new(&[
        "/dev/input/event1: EV_ABS ABS_MT_TRACKING_ID 0x5",
        "/dev/input/event1: EV_ABS ABS_MT_POSITION_X 0x1f4",
        "/dev/input/event1: EV_ABS ABS_MT_POSITION_Y 0x3e8",
        "/dev/input/event1: EV_ABS ABS_MT_TRACKING_ID ffffffff",
    ]);
    let storage = RecordingStorage::with_dir(dir.path().join("recordings")).unwrap();
    let writer = storage.create("session").unwrap();
    let path = writer.path().to_path_buf();

    let recorder = Recorder::with_config(device, config(dir.path()));
    let handle = recorder.start(Box::new(writer)).unwrap();
    wait_for_stream_end(&handle);
    handle.stop();

    let records = load_records(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event_type, EventKind::TouchDown);
    assert_eq!(records[0].coordinates, Coordinates::new(500, 1000));
    assert_eq!(records[0].extra_info, "TrackID:5");
    assert_eq!(records[1].event_type, EventKind::TouchUp);
    assert!(records.windows(2).all(|w| w[1].event_id == w[0].event_id + 1));
}

#[test]
fn missing_input_devices_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(FakeDevice { input_devices: "mice\n", ..FakeDevice::builder(&[]) });
    let recorder = Recorder::with_config(device.clone(), config(dir.path()));

    let err = recorder.start(Box::new(MemorySink::default())).err().expect("setup must fail");
    let core = err.downcast_ref::<droidscope_core::Error>().expect("typed error");
    assert_eq!(core.code, ErrorCode::NoInputDevices);
    assert!(core.is_fatal());
    assert!(!device.commands.lock().iter().any(|c| c.contains("getevent")));
}

#[test]
fn setup_failure_opens_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(FakeDevice { input_devices: "mice\n", ..FakeDevice::builder(&[]) });
    let storage = RecordingStorage::with_dir(dir.path().join("recordings")).unwrap();
    let opened = AtomicBool::new(false);

    let recorder = Recorder::with_config(device, config(dir.path()));
    let result = recorder.start_with(|_| {
        opened.store(true, Ordering::SeqCst);
        Ok(Box::new(storage.create("session")?) as Box<dyn RecordSink>)
    });

    assert!(result.is_err());
    assert!(!opened.load(Ordering::SeqCst));
    assert!(storage.list().unwrap().is_empty());
}

#[test]
fn slow_app_query_keeps_touch_down_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(FakeDevice {
        focus: vec![MAIN, "com.other/com.other.Settings"],
        dumpsys_delay: Duration::from_millis(250),
        ..FakeDevice::builder(&[
            "/dev/input/event1: EV_ABS ABS_MT_TRACKING_ID 0x1",
            "/dev/input/event1: EV_ABS ABS_MT_POSITION_X 0x64",
            "/dev/input/event1: EV_ABS ABS_MT_POSITION_Y 0x32",
            "/dev/input/event1: EV_SYN SYN_REPORT 00000000",
        ])
    });
    let sink = MemorySink::default();
    let recorder = Recorder::with_config(device.clone(), config(dir.path()));
    assert!(recorder.config().buffer_timeout() < device.dumpsys_delay);

    let handle = recorder.start(Box::new(sink.clone())).unwrap();
    wait_for_stream_end(&handle);
    handle.stop();

    let records = sink.records.lock().clone();
    let touch = records
        .iter()
        .find(|r| r.event_type == EventKind::TouchDown)
        .expect("touch down recorded");
    assert_eq!(touch.coordinates, Coordinates::new(100, 50));
    assert_eq!(touch.extra_info, "TrackID:1");
    assert_eq!(touch.package, "com.other");
    assert_eq!(touch.resource_id, "com.example:id/banner");
}

#[test]
fn app_switch_triggers_eager_hierarchy_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(FakeDevice {
        focus: vec![MAIN, "com.other/com.other.Settings"],
        linger: Duration::from_millis(500),
        ..FakeDevice::builder(&["/dev/input/event1: EV_KEY BTN_TOUCH DOWN"])
    });
    let recorder = Recorder::with_config(device.clone(), config(dir.path()));
    assert_eq!(recorder.config().hierarchy_interval_ms, 60_000);

    let handle = recorder.start(Box::new(MemorySink::default())).unwrap();
    wait_for_stream_end(&handle);
    handle.stop();

    // one at setup, one for the switch
    assert_eq!(device.issued("uiautomator dump"), 2);
}

#[test]
fn unchanged_app_waits_for_interval() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(FakeDevice {
        linger: Duration::from_millis(300),
        ..FakeDevice::builder(&["/dev/input/event1: EV_KEY BTN_TOUCH DOWN"])
    });
    let recorder = Recorder::with_config(device.clone(), config(dir.path()));

    let handle = recorder.start(Box::new(MemorySink::default())).unwrap();
    wait_for_stream_end(&handle);
    handle.stop();

    assert_eq!(device.issued("uiautomator dump"), 1);
}
