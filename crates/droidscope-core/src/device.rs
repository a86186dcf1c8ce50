//! Device capability - the only way capture and replay touch a device
//!
//! Everything goes through [`Device`]: one-shot commands with a hard timeout,
//! a terminable line stream, and file pulls. [`AdbDevice`] is the real
//! implementation; tests substitute scripted fakes.

use crate::error::{Error, ErrorCode, Result};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Operations the capture and replay logic may issue against one device.
pub trait Device: Send + Sync {
    fn serial(&self) -> &str;

    /// Run a command to completion, killing it when `timeout` elapses.
    fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput>;

    /// Start a long-running command and iterate its stdout line by line.
    fn stream(&self, args: &[&str]) -> Result<LineStream>;

    /// Copy a file off the device.
    fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<()>;

    /// `run` that treats a non-zero exit as an error.
    fn run_ok(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let out = self.run(args, timeout)?;
        if !out.success() {
            return Err(Error::command_failed(&args.join(" "), out.status, &out.stderr));
        }
        Ok(out)
    }

    /// `adb shell <args>`.
    fn shell(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        self.run(&full, timeout)
    }
}

impl<D: Device + ?Sized> Device for Arc<D> {
    fn serial(&self) -> &str {
        (**self).serial()
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        (**self).run(args, timeout)
    }

    fn stream(&self, args: &[&str]) -> Result<LineStream> {
        (**self).stream(args)
    }

    fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<()> {
        (**self).pull(remote, local, timeout)
    }
}

// ============================================================================
// Line stream
// ============================================================================

type ChildSlot = Arc<Mutex<Option<Child>>>;

/// Lines from a running command. Ends at EOF or the first read error.
pub struct LineStream {
    lines: Box<dyn Iterator<Item = std::io::Result<String>> + Send>,
    child: ChildSlot,
}

/// Kills the process behind a [`LineStream`] from another thread so a
/// blocked reader observes EOF.
#[derive(Clone)]
pub struct StreamTerminator {
    child: ChildSlot,
}

impl LineStream {
    /// Stream over any reader, with nothing to terminate.
    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            lines: Box::new(reader.lines()),
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Stream over a fixed set of lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<std::io::Result<String>> = lines.into_iter().map(|l| Ok(l.into())).collect();
        Self {
            lines: Box::new(lines.into_iter()),
            child: Arc::new(Mutex::new(None)),
        }
    }

    fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::unreachable("Failed to capture stdout"))?;
        // getevent output is ASCII but may carry garbage on a flaky link
        let lines = BufReader::new(stdout).split(b'\n').map(|chunk| {
            chunk.map(|bytes| String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string())
        });
        Ok(Self {
            lines: Box::new(lines),
            child: Arc::new(Mutex::new(Some(child))),
        })
    }

    pub fn terminator(&self) -> StreamTerminator {
        StreamTerminator {
            child: self.child.clone(),
        }
    }
}

impl Iterator for LineStream {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next()? {
            Ok(line) => Some(line),
            Err(e) => {
                debug!(error = %e, "line stream read failed");
                None
            }
        }
    }
}

impl StreamTerminator {
    pub fn terminate(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.terminator().terminate();
    }
}

// ============================================================================
// adb
// ============================================================================

/// The adb host binary.
#[derive(Debug, Clone)]
pub struct Adb {
    program: PathBuf,
}

impl Adb {
    pub fn new() -> Self {
        let program = std::env::var_os("ADB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("adb"));
        Self { program }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Serials of devices in the `device` state.
    pub fn list_connected(&self, timeout: Duration) -> Result<Vec<String>> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("devices");
        let out = run_with_timeout(cmd, "adb devices", timeout)?;
        if !out.success() {
            return Err(Error::command_failed("adb devices", out.status, &out.stderr));
        }
        Ok(parse_devices(&out.stdout))
    }

    /// A handle for `serial`, verified to be connected.
    pub fn device(&self, serial: &str, timeout: Duration) -> Result<AdbDevice> {
        let connected = self.list_connected(timeout)?;
        if !connected.iter().any(|s| s == serial) {
            return Err(Error::device_not_found(serial, &connected));
        }
        Ok(AdbDevice::new(self.clone(), serial))
    }

    /// The only connected device, if there is exactly one.
    pub fn default_device(&self, timeout: Duration) -> Result<AdbDevice> {
        let connected = self.list_connected(timeout)?;
        match connected.as_slice() {
            [only] => Ok(AdbDevice::new(self.clone(), only)),
            [] => Err(Error::new(ErrorCode::DeviceNotFound, "No device connected")),
            _ => Err(Error::new(
                ErrorCode::DeviceNotFound,
                format!("{} devices connected, pick one with --serial", connected.len()),
            )
            .with_context(serde_json::json!({ "connected": connected }))),
        }
    }
}

impl Default for Adb {
    fn default() -> Self {
        Self::new()
    }
}

/// One device reached through adb.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: Adb,
    serial: String,
}

impl AdbDevice {
    pub fn new(adb: Adb, serial: impl Into<String>) -> Self {
        Self {
            adb,
            serial: serial.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(self.adb.program());
        cmd.arg("-s").arg(&self.serial).args(args);
        cmd
    }
}

impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_with_timeout(self.command(args), &args.join(" "), timeout)
    }

    fn stream(&self, args: &[&str]) -> Result<LineStream> {
        let child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::unreachable(format!("Failed to start adb: {}", e)))?;
        LineStream::from_child(child)
    }

    fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<()> {
        let local_str = local.to_string_lossy();
        let out = self.run(&["pull", remote, &local_str], timeout)?;
        if !out.success() {
            let reason = if out.stderr.trim().is_empty() { &out.stdout } else { &out.stderr };
            return Err(Error::pull_failed(remote, reason));
        }
        Ok(())
    }
}

/// Parse `adb devices` output.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Spawn `cmd`, collect its output, kill it if it outlives `timeout`.
pub fn run_with_timeout(mut cmd: Command, label: &str, timeout: Duration) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::unreachable(format!("Failed to run {}: {}", label, e)))?;

    // Drain pipes on helper threads so a chatty child never blocks on a full pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::timeout(label, timeout.as_millis() as u64));
            }
            None => thread::sleep(Duration::from_millis(10)),
        }
    };

    let collect = |h: Option<thread::JoinHandle<String>>| {
        h.and_then(|h| h.join().ok()).unwrap_or_default()
    };

    Ok(CommandOutput {
        status: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_devices_keeps_ready_devices_only() {
        let out = "List of devices attached\n\
                   emulator-5554\tdevice\n\
                   0123456789ABCDEF\tunauthorized\n\
                   emulator-5556\toffline\n\
                   R58M12345\tdevice\n\n";
        assert_eq!(parse_devices(out), vec!["emulator-5554", "R58M12345"]);
    }

    #[test]
    fn parse_devices_skips_daemon_banner() {
        let out = "* daemon not running; starting now at tcp:5037\n\
                   * daemon started successfully\n\
                   List of devices attached\n";
        assert!(parse_devices(out).is_empty());
    }

    #[test]
    fn line_stream_from_lines() {
        let stream = LineStream::from_lines(["a", "b"]);
        let terminator = stream.terminator();
        terminator.terminate();
        assert_eq!(stream.collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_hung_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout(cmd, "sleep 5", Duration::from_millis(100)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_collects_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = run_with_timeout(cmd, "sh", Duration::from_secs(5)).unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }
}
