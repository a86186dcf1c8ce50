//! Foreground app context and app lifecycle commands

use crate::device::Device;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const UNKNOWN: &str = "unknown";

/// Focused package/activity pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContext {
    pub package: String,
    pub activity: String,
}

impl AppContext {
    pub fn new(package: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            activity: activity.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    pub fn is_unknown(&self) -> bool {
        self.package == UNKNOWN && self.activity == UNKNOWN
    }

    /// Merge a fresh query result, keeping known values over `unknown` ones.
    /// Returns true when package or activity changed.
    pub fn update(&mut self, fresh: &AppContext) -> bool {
        let before = self.clone();
        if fresh.package != UNKNOWN {
            self.package = fresh.package.clone();
        }
        if fresh.activity != UNKNOWN {
            self.activity = fresh.activity.clone();
        }
        *self != before
    }

    /// True when `other` names the same screen, accepting the `.Short` form
    /// of the activity.
    pub fn matches(&self, other: &AppContext) -> bool {
        self.package == other.package
            && normalize_activity(&self.package, &self.activity)
                == normalize_activity(&other.package, &other.activity)
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::unknown()
    }
}

impl std::fmt::Display for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.package, self.activity)
    }
}

/// `.Main` under `com.example` -> `com.example.Main`.
pub fn normalize_activity(package: &str, activity: &str) -> String {
    if activity.starts_with('.') {
        format!("{}{}", package, activity)
    } else {
        activity.to_string()
    }
}

// Window{a1b2c3 u0 com.example/com.example.MainActivity}
static CURRENT_FOCUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"mCurrentFocus=[^{\n]*\{(?:[^\s}]+\s+)*?([^\s/{}]+)/([^\s}]+)").unwrap()
});

// mResumedActivity: ActivityRecord{e1 u0 com.example/.Main t42}
static RESUMED_ACTIVITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:mResumedActivity|ResumedActivity)[:=][^{\n]*\{(?:[^\s}]+\s+)*?([^\s/{}]+)/([^\s}]+)")
        .unwrap()
});

/// Extract the focused app from `dumpsys window` output.
pub fn parse_current_focus(dumpsys: &str) -> Option<AppContext> {
    CURRENT_FOCUS
        .captures(dumpsys)
        .map(|c| AppContext::new(&c[1], &c[2]))
}

/// Extract the resumed activity from `dumpsys activity activities` output.
pub fn parse_resumed_activity(dumpsys: &str) -> Option<AppContext> {
    RESUMED_ACTIVITY
        .captures(dumpsys)
        .map(|c| AppContext::new(&c[1], &c[2]))
}

/// Ask the device which app is in the foreground.
///
/// Tries the focused window first, then the resumed activity. Each query is
/// bounded by `timeout`.
pub fn query_app_context(device: &dyn Device, timeout: Duration) -> Result<AppContext> {
    let window = device.shell(&["dumpsys", "window", "windows"], timeout)?;
    if let Some(ctx) = parse_current_focus(&window.stdout) {
        return Ok(ctx);
    }

    let activities = device.shell(&["dumpsys", "activity", "activities"], timeout)?;
    parse_resumed_activity(&activities.stdout)
        .ok_or_else(|| Error::parse("foreground app", "no focused window or resumed activity"))
}

/// Paths of `event*` nodes under /dev/input.
pub fn list_input_devices(device: &dyn Device, timeout: Duration) -> Result<Vec<String>> {
    let out = device.shell(&["ls", "/dev/input/"], timeout)?;
    Ok(out
        .stdout
        .split_whitespace()
        .filter(|name| name.starts_with("event"))
        .map(|name| format!("/dev/input/{}", name))
        .collect())
}

/// `ro.build.version.sdk`, or 0 when unreadable.
pub fn sdk_version(device: &dyn Device, timeout: Duration) -> u32 {
    device
        .shell(&["getprop", "ro.build.version.sdk"], timeout)
        .ok()
        .and_then(|out| out.stdout.trim().parse().ok())
        .unwrap_or(0)
}

/// Ways to bring a package to the foreground, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStrategy {
    /// Fire the launcher intent for the package, like tapping its icon.
    Activate,
    /// `am start -n package/activity` with an explicit MAIN/LAUNCHER intent.
    ExplicitIntent,
}

impl LaunchStrategy {
    pub const ALL: [LaunchStrategy; 2] = [LaunchStrategy::Activate, LaunchStrategy::ExplicitIntent];
}

/// Issue one launch attempt. Does not wait or verify.
pub fn launch_app(
    device: &dyn Device,
    target: &AppContext,
    strategy: LaunchStrategy,
    timeout: Duration,
) -> Result<()> {
    let component;
    let args: Vec<&str> = match strategy {
        LaunchStrategy::Activate => vec![
            "monkey",
            "-p",
            &target.package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ],
        LaunchStrategy::ExplicitIntent => {
            component = format!("{}/{}", target.package, target.activity);
            vec![
                "am",
                "start",
                "-n",
                &component,
                "-a",
                "android.intent.action.MAIN",
                "-c",
                "android.intent.category.LAUNCHER",
                "-f",
                "0x10200000",
            ]
        }
    };
    let out = device.shell(&args, timeout)?;
    // am start reports failures on stdout with a zero exit code on older builds
    if !out.success() || out.stdout.contains("Error:") {
        return Err(Error::command_failed(&args.join(" "), out.status, &format!("{}{}", out.stdout, out.stderr)));
    }
    Ok(())
}

/// `am force-stop <package>`.
pub fn force_stop(device: &dyn Device, package: &str, timeout: Duration) -> Result<()> {
    device.run_ok(&["shell", "am", "force-stop", package], timeout)?;
    Ok(())
}
