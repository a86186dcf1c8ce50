//! UI hierarchy snapshots and point hit-testing
//!
//! A snapshot is the flat list of node rectangles from one `uiautomator dump`.
//! Snapshots are replaced whole; a failed refresh keeps the previous one.

use crate::apps::UNKNOWN;
use crate::device::Device;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Bounds {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    pub fn area(&self) -> i64 {
        (self.x2 - self.x1) as i64 * (self.y2 - self.y1) as i64
    }
}

/// One rectangle from a hierarchy dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiNode {
    pub bounds: Bounds,
    pub resource_id: String,
    pub text: String,
    pub content_desc: String,
    pub class_name: String,
    pub package_name: String,
}

impl UiNode {
    /// Human-readable target name: resource id, else class plus
    /// description or text, else the bare class name.
    pub fn label(&self) -> String {
        if !self.resource_id.is_empty() {
            return self.resource_id.clone();
        }
        if !self.content_desc.is_empty() {
            return format!("{} '{}'", self.class_name, self.content_desc);
        }
        if !self.text.is_empty() {
            return format!("{} '{}'", self.class_name, self.text);
        }
        match self.class_name.rsplit('.').next() {
            Some(short) if !short.is_empty() => short.to_string(),
            _ => UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub nodes: Vec<UiNode>,
}

impl Snapshot {
    pub fn new(nodes: Vec<UiNode>) -> Self {
        Self { nodes }
    }

    /// Smallest-area node containing the point; first match wins ties.
    pub fn hit_test(&self, x: i32, y: i32) -> Option<&UiNode> {
        let mut best: Option<&UiNode> = None;
        for node in self.nodes.iter().filter(|n| n.bounds.contains(x, y)) {
            match best {
                Some(b) if b.bounds.area() <= node.bounds.area() => {}
                _ => best = Some(node),
            }
        }
        best
    }

    pub fn resolve(&self, x: i32, y: i32) -> String {
        self.hit_test(x, y)
            .map(UiNode::label)
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

// ============================================================================
// Parsing
// ============================================================================

static NODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<node\b([^>]*)>").unwrap());
static ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"([\w:-]+)="([^"]*)""#).unwrap());
static BOUNDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").unwrap());

/// Parse a `uiautomator dump` document into a flat node list.
///
/// Nodes without parseable bounds are skipped. A document without a
/// `<hierarchy>` root is an error.
pub fn parse_hierarchy(xml: &str) -> Result<Vec<UiNode>> {
    if !xml.contains("<hierarchy") {
        return Err(Error::parse("hierarchy dump", "missing <hierarchy> root"));
    }

    let mut nodes = Vec::new();
    for node in NODE.captures_iter(xml) {
        let mut parsed = ParsedAttrs::default();
        for attr in ATTR.captures_iter(&node[1]) {
            let value = unescape(&attr[2]);
            match &attr[1] {
                "bounds" => parsed.bounds = parse_bounds(&value),
                "resource-id" => parsed.resource_id = value,
                "text" => parsed.text = value,
                "content-desc" => parsed.content_desc = value,
                "class" => parsed.class_name = value,
                "package" => parsed.package_name = value,
                _ => {}
            }
        }
        if let Some(bounds) = parsed.bounds {
            nodes.push(UiNode {
                bounds,
                resource_id: parsed.resource_id,
                text: parsed.text,
                content_desc: parsed.content_desc,
                class_name: parsed.class_name,
                package_name: parsed.package_name,
            });
        }
    }
    Ok(nodes)
}

#[derive(Default)]
struct ParsedAttrs {
    bounds: Option<Bounds>,
    resource_id: String,
    text: String,
    content_desc: String,
    class_name: String,
    package_name: String,
}

/// `[x1,y1][x2,y2]`
pub fn parse_bounds(s: &str) -> Option<Bounds> {
    let c = BOUNDS.captures(s.trim())?;
    Some(Bounds {
        x1: c[1].parse().ok()?,
        y1: c[2].parse().ok()?,
        x2: c[3].parse().ok()?,
        y2: c[4].parse().ok()?,
    })
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                .and_then(|n| n.ok())
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// ============================================================================
// Tracker
// ============================================================================

/// Where and how long to dump the hierarchy.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub quick_timeout: Duration,
    pub dump_timeout: Duration,
}

impl DumpConfig {
    pub fn for_serial(serial: &str) -> Self {
        let safe: String = serial
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            remote_path: "/sdcard/window_dump.xml".to_string(),
            local_path: std::env::temp_dir().join(format!("droidscope_{}_window_dump.xml", safe)),
            quick_timeout: Duration::from_secs(1),
            dump_timeout: Duration::from_secs(5),
        }
    }
}

/// Latest-known hierarchy snapshot, shared between the capture threads.
pub struct HierarchyTracker {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh_requested: AtomicBool,
    config: DumpConfig,
}

impl HierarchyTracker {
    pub fn new(config: DumpConfig) -> Self {
        Self {
            snapshot: RwLock::new(None),
            refresh_requested: AtomicBool::new(false),
            config,
        }
    }

    /// Dump, pull and parse the device's current hierarchy.
    ///
    /// On success the snapshot is replaced and the node count returned. On
    /// any failure the previous snapshot stays in place.
    pub fn refresh(&self, device: &dyn Device) -> Result<usize> {
        let cfg = &self.config;
        // A stale dump left behind would be pulled if the new dump fails
        let _ = device.shell(&["rm", "-f", &cfg.remote_path], cfg.quick_timeout);

        device.run_ok(
            &["shell", "uiautomator", "dump", &cfg.remote_path],
            cfg.dump_timeout,
        )?;
        device.pull(&cfg.remote_path, &cfg.local_path, cfg.dump_timeout)?;

        let xml = std::fs::read_to_string(&cfg.local_path)?;
        let nodes = parse_hierarchy(&xml)?;
        let count = nodes.len();
        self.replace(nodes);
        debug!(serial = device.serial(), nodes = count, "hierarchy refreshed");
        Ok(count)
    }

    /// Install a new snapshot.
    pub fn replace(&self, nodes: Vec<UiNode>) {
        *self.snapshot.write() = Some(Arc::new(Snapshot::new(nodes)));
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().clone()
    }

    /// Label of the smallest node containing the point, or `unknown`.
    pub fn resolve(&self, x: i32, y: i32) -> String {
        match self.snapshot() {
            Some(s) => s.resolve(x, y),
            None => UNKNOWN.to_string(),
        }
    }

    /// Ask for an out-of-cycle refresh (app context changed).
    pub fn request_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending refresh request.
    pub fn take_refresh_request(&self) -> bool {
        self.refresh_requested.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandOutput, LineStream};
    use parking_lot::Mutex;
    use std::path::Path;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" bounds="[0,0][1080,1920]">
    <node index="0" text="Sign in" resource-id="com.example:id/login" class="android.widget.Button" package="com.example" content-desc="" bounds="[100,200][500,300]" />
    <node index="1" text="Tom &amp; Jerry" resource-id="" class="android.widget.TextView" package="com.example" content-desc="" bounds="[100,400][500,450]" />
    <node index="2" text="" resource-id="" class="android.widget.ImageButton" package="com.example" content-desc="Navigate up" bounds="[0,0][96,96]" />
    <node index="3" text="" resource-id="" class="android.view.View" package="com.example" content-desc="" bounds="[600,600][700,700]" />
  </node>
</hierarchy>"#;

    fn node(bounds: [i32; 4], resource_id: &str, text: &str, class: &str) -> UiNode {
        UiNode {
            bounds: Bounds { x1: bounds[0], y1: bounds[1], x2: bounds[2], y2: bounds[3] },
            resource_id: resource_id.to_string(),
            text: text.to_string(),
            content_desc: String::new(),
            class_name: class.to_string(),
            package_name: "com.example".to_string(),
        }
    }

    #[test]
    fn parses_dump_into_flat_nodes() {
        let nodes = parse_hierarchy(DUMP).unwrap();
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[1].resource_id, "com.example:id/login");
        assert_eq!(nodes[1].bounds, Bounds { x1: 100, y1: 200, x2: 500, y2: 300 });
        assert_eq!(nodes[2].text, "Tom & Jerry");
        assert_eq!(nodes[3].content_desc, "Navigate up");
        assert_eq!(nodes[0].package_name, "com.example");
    }

    #[test]
    fn rejects_document_without_root() {
        assert!(parse_hierarchy("ERROR: could not get idle state.").is_err());
        assert!(parse_hierarchy("").is_err());
    }

    #[test]
    fn skips_nodes_with_bad_bounds() {
        let xml = r#"<hierarchy><node class="a.B" bounds="[0,0][10]" /><node class="a.C" bounds="[0,0][10,10]" /></hierarchy>"#;
        let nodes = parse_hierarchy(xml).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].class_name, "a.C");
    }

    #[test]
    fn label_priority() {
        let snap = Snapshot::new(parse_hierarchy(DUMP).unwrap());
        assert_eq!(snap.resolve(150, 250), "com.example:id/login");
        assert_eq!(snap.resolve(150, 420), "android.widget.TextView 'Tom & Jerry'");
        assert_eq!(snap.resolve(10, 10), "android.widget.ImageButton 'Navigate up'");
        assert_eq!(snap.resolve(650, 650), "View");
        assert_eq!(snap.resolve(900, 1000), "FrameLayout");
    }

    #[test]
    fn resolves_button_text_label() {
        let snap = Snapshot::new(vec![node([0, 0, 100, 40], "", "OK", "android.widget.Button")]);
        assert_eq!(snap.resolve(50, 20), "android.widget.Button 'OK'");
    }

    #[test]
    fn smaller_overlapping_node_wins() {
        let snap = Snapshot::new(vec![
            node([0, 0, 1000, 1000], "outer", "", "a.Outer"),
            node([10, 10, 60, 60], "inner", "", "a.Inner"),
        ]);
        assert_eq!(snap.resolve(20, 20), "inner");
        assert_eq!(snap.resolve(500, 500), "outer");
    }

    #[test]
    fn equal_areas_keep_first_match() {
        let snap = Snapshot::new(vec![
            node([0, 0, 10, 10], "first", "", "a.A"),
            node([0, 0, 10, 10], "second", "", "a.A"),
        ]);
        assert_eq!(snap.resolve(5, 5), "first");
    }

    #[test]
    fn edges_are_inclusive() {
        let snap = Snapshot::new(vec![node([0, 0, 100, 40], "btn", "", "a.B")]);
        assert_eq!(snap.resolve(100, 40), "btn");
        assert_eq!(snap.resolve(101, 40), "unknown");
    }

    #[test]
    fn tracker_without_snapshot_is_unknown() {
        let tracker = HierarchyTracker::new(DumpConfig::for_serial("emulator-5554"));
        assert_eq!(tracker.resolve(1, 1), "unknown");
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn refresh_requests_are_consumed_once() {
        let tracker = HierarchyTracker::new(DumpConfig::for_serial("emulator-5554"));
        assert!(!tracker.take_refresh_request());
        tracker.request_refresh();
        assert!(tracker.take_refresh_request());
        assert!(!tracker.take_refresh_request());
    }

    /// Serves `dump` on pull, or fails the dump command when `None`.
    struct DumpDevice {
        dump: Mutex<Option<String>>,
    }

    impl Device for DumpDevice {
        fn serial(&self) -> &str {
            "fake"
        }

        fn run(&self, args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
            if args.contains(&"uiautomator") && self.dump.lock().is_none() {
                return Err(Error::timeout("uiautomator dump", 5000));
            }
            Ok(CommandOutput::default())
        }

        fn stream(&self, _args: &[&str]) -> Result<LineStream> {
            Ok(LineStream::from_lines(Vec::<String>::new()))
        }

        fn pull(&self, _remote: &str, local: &Path, _timeout: Duration) -> Result<()> {
            let dump = self.dump.lock().clone().unwrap_or_default();
            std::fs::write(local, dump)?;
            Ok(())
        }
    }

    #[test]
    fn refresh_failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DumpConfig::for_serial("fake");
        config.local_path = dir.path().join("dump.xml");
        let tracker = HierarchyTracker::new(config);
        let device = DumpDevice { dump: Mutex::new(Some(DUMP.to_string())) };

        assert_eq!(tracker.refresh(&device).unwrap(), 5);
        assert_eq!(tracker.resolve(150, 250), "com.example:id/login");

        *device.dump.lock() = None;
        assert!(tracker.refresh(&device).is_err());
        assert_eq!(tracker.resolve(150, 250), "com.example:id/login");

        *device.dump.lock() = Some("garbage".to_string());
        assert!(tracker.refresh(&device).is_err());
        assert_eq!(tracker.resolve(150, 250), "com.example:id/login");
    }
}
