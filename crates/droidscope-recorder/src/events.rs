//! Record types - one JSON object per flushed input event

use serde::{Deserialize, Serialize};

/// Logical input event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TouchDown,
    TouchUp,
    /// One complete low-level frame (SYN_REPORT), not necessarily movement
    Motion,
    KeyDown,
    KeyUp,
}

impl EventKind {
    /// Kinds that start an interaction and may follow an app switch.
    pub fn is_significant(self) -> bool {
        matches!(self, EventKind::TouchDown | EventKind::KeyDown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TouchDown => "TOUCH_DOWN",
            EventKind::TouchUp => "TOUCH_UP",
            EventKind::Motion => "MOTION",
            EventKind::KeyDown => "KEY_DOWN",
            EventKind::KeyUp => "KEY_UP",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screen position; either axis may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: Option<i32>,
    pub y: Option<i32>,
}

impl Coordinates {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x: Some(x), y: Some(y) }
    }

    pub fn is_complete(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    pub fn point(&self) -> Option<(i32, i32)> {
        Some((self.x?, self.y?))
    }
}

/// A flushed, immutable event. Field order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedRecord {
    /// Wall-clock `HH:MM:SS.mmm`
    pub timestamp: String,
    pub device: String,
    pub package: String,
    pub activity: String,
    pub event_type: EventKind,
    pub coordinates: Coordinates,
    pub resource_id: String,
    pub extra_info: String,
    /// Flush sequence number, from 0
    pub event_id: u64,
}

impl FinishedRecord {
    /// Key name from `Key:<name>` extra info.
    pub fn key_name(&self) -> Option<&str> {
        self.extra_info.strip_prefix("Key:")
    }

    /// One-line console rendering.
    pub fn console_line(&self) -> String {
        let axis = |v: Option<i32>| v.map(|v| v.to_string()).unwrap_or_else(|| "None".to_string());
        format!(
            "{} | {} | {}/{} | {} | X:{} Y:{} | {} | {}",
            self.timestamp,
            self.device,
            self.package,
            self.activity,
            self.event_type,
            axis(self.coordinates.x),
            axis(self.coordinates.y),
            self.resource_id,
            self.extra_info,
        )
    }
}

/// Milliseconds since midnight for an `HH:MM:SS.mmm` stamp.
pub fn parse_timestamp_ms(stamp: &str) -> Option<u64> {
    let mut parts = stamp.trim().splitn(3, ':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if h > 23 || m > 59 || !(0.0..60.0).contains(&s) {
        return None;
    }
    Some(h * 3_600_000 + m * 60_000 + (s * 1000.0).round() as u64)
}
