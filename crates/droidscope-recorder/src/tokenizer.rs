//! `getevent -lt` line tokenizer
//!
//! Turns one line of the raw input stream into at most one [`Fragment`].
//! The only state carried between lines is the current device path.
//!
//! Shapes understood (after the optional `[ seconds.micros]` prefix):
//!
//! ```text
//! add device 1: /dev/input/event1
//! /dev/input/event1: EV_ABS       ABS_MT_POSITION_X    0x0000021c
//! /dev/input/event1: EV_ABS       ABS_MT_TRACKING_ID   ffffffff
//! /dev/input/event1: EV_KEY       BTN_TOUCH            DOWN
//! /dev/input/event0: EV_KEY       KEY_VOLUMEDOWN       UP
//! /dev/input/event1: EV_SYN       SYN_REPORT           00000000
//! ```

use crate::events::EventKind;
use once_cell::sync::Lazy;
use regex::Regex;

static KEY_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^KEY_(\w+)$").unwrap());

const DEVICE_PREFIX: &str = "/dev/input/";

/// Partial event information from one stream line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub kind: Option<EventKind>,
    pub extra: Option<String>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.kind.is_none() && self.extra.is_none()
    }

    fn x(x: i32) -> Self {
        Self { x: Some(x), ..Default::default() }
    }

    fn y(y: i32) -> Self {
        Self { y: Some(y), ..Default::default() }
    }

    fn kind(kind: EventKind) -> Self {
        Self { kind: Some(kind), ..Default::default() }
    }

    fn extra(extra: String) -> Self {
        Self { extra: Some(extra), ..Default::default() }
    }
}

/// Line tokenizer; remembers which input device the stream is talking about.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    current_device: String,
    bare_hex: bool,
}

impl Tokenizer {
    /// `bare_hex` parses unprefixed values (`0000021c`) as hex, which is
    /// what `getevent` prints. Without it only `0x` values are hex.
    pub fn new(bare_hex: bool) -> Self {
        Self { current_device: String::new(), bare_hex }
    }

    pub fn current_device(&self) -> &str {
        &self.current_device
    }

    /// Tokenize one line. Unrecognized or malformed lines give `None`.
    pub fn parse_line(&mut self, line: &str) -> Option<Fragment> {
        let mut rest = strip_timestamp(line.trim());

        if let Some(announced) = rest.strip_prefix("add device") {
            if let Some(idx) = announced.find(DEVICE_PREFIX) {
                self.current_device = announced[idx..].trim().to_string();
            }
            return None;
        }

        if rest.starts_with(DEVICE_PREFIX) {
            let (path, tail) = match rest.find(':') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            self.current_device = path.trim().to_string();
            rest = tail.trim();
            if rest.is_empty() {
                return None;
            }
        }

        let fragment = self.parse_fields(rest)?;
        (!fragment.is_empty()).then_some(fragment)
    }

    fn parse_fields(&self, fields: &str) -> Option<Fragment> {
        let tokens: Vec<&str> = fields.split_whitespace().collect();
        let value = *tokens.last()?;
        let has = |name: &str| tokens.contains(&name);

        if has("ABS_MT_POSITION_X") || has("ABS_X") {
            return Some(Fragment::x(self.coordinate(value)?));
        }
        if has("ABS_MT_POSITION_Y") || has("ABS_Y") {
            return Some(Fragment::y(self.coordinate(value)?));
        }
        if has("ABS_MT_PRESSURE") || has("ABS_PRESSURE") {
            let pressure = parse_value(value, self.bare_hex)?;
            return Some(Fragment::extra(format!("Pressure:{}", pressure)));
        }
        if has("BTN_TOUCH") {
            return match value {
                "DOWN" => Some(Fragment::kind(EventKind::TouchDown)),
                "UP" => Some(Fragment::kind(EventKind::TouchUp)),
                _ => None,
            };
        }
        if has("ABS_MT_TRACKING_ID") {
            if is_release(value) {
                return Some(Fragment::kind(EventKind::TouchUp));
            }
            let mut fragment = Fragment::kind(EventKind::TouchDown);
            fragment.extra = parse_value(value, self.bare_hex).map(|id| format!("TrackID:{}", id));
            return Some(fragment);
        }
        if has("EV_SYN") && has("SYN_REPORT") {
            return Some(Fragment::kind(EventKind::Motion));
        }
        if has("EV_KEY") {
            let name = tokens
                .iter()
                .find_map(|t| KEY_NAME.captures(t).map(|c| c[1].to_string()))?;
            let kind = match value {
                "DOWN" => EventKind::KeyDown,
                "UP" => EventKind::KeyUp,
                // REPEAT and raw numeric values
                _ => return None,
            };
            return Some(Fragment {
                kind: Some(kind),
                extra: Some(format!("Key:{}", name)),
                ..Default::default()
            });
        }
        None
    }

    fn coordinate(&self, token: &str) -> Option<i32> {
        parse_value(token, self.bare_hex).and_then(|v| i32::try_from(v).ok())
    }
}

/// Parse a value token: `0x` prefix means hex, otherwise decimal, or hex
/// throughout when `bare_hex` is set.
pub fn parse_value(token: &str, bare_hex: bool) -> Option<i64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if bare_hex {
        i64::from_str_radix(token, 16).ok()
    } else {
        token.parse().ok()
    }
}

/// Tracking id -1 ends the contact.
fn is_release(token: &str) -> bool {
    let t = token.trim_start_matches("0x").trim_start_matches("0X");
    t.eq_ignore_ascii_case("ffffffff") || token == "-1"
}

fn strip_timestamp(line: &str) -> &str {
    if line.starts_with('[') {
        if let Some(end) = line.find(']') {
            return line[end + 1..].trim_start();
        }
    }
    line
}
