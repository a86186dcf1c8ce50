//! Structured errors, serializable so the CLI can report them as JSON

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("[{code:?}] {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DeviceNotFound,
    DeviceUnreachable,
    Timeout,
    CommandFailed,
    PullFailed,
    ParseFailed,
    NoInputDevices,
    OutputUnavailable,
    LaunchFailed,
    Io,
    Unknown,
}

/// How a failure is treated by a capture or replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Device unreachable, timed out, pull failed. "No data this cycle".
    Transport,
    /// Malformed stream line or hierarchy document. The unit is skipped.
    Parse,
    /// Session cannot start.
    Setup,
    /// Replay launched something other than the target. Reported, not fatal.
    Verification,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::DeviceUnreachable
            | ErrorCode::Timeout
            | ErrorCode::CommandFailed
            | ErrorCode::PullFailed
            | ErrorCode::Io
            | ErrorCode::Unknown => ErrorCategory::Transport,
            ErrorCode::ParseFailed => ErrorCategory::Parse,
            ErrorCode::DeviceNotFound
            | ErrorCode::NoInputDevices
            | ErrorCode::OutputUnavailable => ErrorCategory::Setup,
            ErrorCode::LaunchFailed => ErrorCategory::Verification,
        }
    }
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestions: Vec::new(),
            context: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Setup
    }

    pub fn device_not_found(serial: &str, connected: &[String]) -> Self {
        Self::new(
            ErrorCode::DeviceNotFound,
            format!("Device not connected: {}", serial),
        )
        .with_suggestions(vec![
            "Start the emulator or plug in the device".to_string(),
            "Run `adb devices` to check the serial".to_string(),
        ])
        .with_context(serde_json::json!({ "connected": connected }))
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeviceUnreachable, reason)
    }

    pub fn timeout(what: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Timeout after {}ms: {}", timeout_ms, what),
        )
    }

    pub fn command_failed(command: &str, status: i32, stderr: &str) -> Self {
        Self::new(
            ErrorCode::CommandFailed,
            format!("`{}` exited with {}: {}", command, status, stderr.trim()),
        )
    }

    pub fn pull_failed(remote: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::PullFailed,
            format!("Failed to pull {}: {}", remote, reason.trim()),
        )
    }

    pub fn parse(what: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::ParseFailed, format!("{}: {}", what, reason))
    }

    pub fn no_input_devices(serial: &str) -> Self {
        Self::new(
            ErrorCode::NoInputDevices,
            format!("No input devices found under /dev/input on {}", serial),
        )
    }

    pub fn output_unavailable(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::OutputUnavailable,
            format!("Cannot create output {}: {}", path.display(), reason),
        )
    }

    pub fn launch_failed(package: &str, activity: &str, actual: &str) -> Self {
        Self::new(
            ErrorCode::LaunchFailed,
            format!("Expected {}/{} in foreground, found {}", package, activity, actual),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::ParseFailed, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::PullFailed.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::ParseFailed.category(), ErrorCategory::Parse);
        assert_eq!(ErrorCode::NoInputDevices.category(), ErrorCategory::Setup);
        assert_eq!(ErrorCode::LaunchFailed.category(), ErrorCategory::Verification);
    }

    #[test]
    fn only_setup_errors_are_fatal() {
        assert!(Error::no_input_devices("emulator-5554").is_fatal());
        assert!(!Error::timeout("dumpsys window", 3000).is_fatal());
    }

    #[test]
    fn serializes_code_in_screaming_case() {
        let e = Error::timeout("uiautomator dump", 5000);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["code"], "TIMEOUT");
        assert!(json.get("suggestions").is_none());
        assert_eq!(e.to_string(), "[Timeout] Timeout after 5000ms: uiautomator dump");
    }
}
