//! Recording storage - one JSON array per session, appended as records flush

use crate::events::FinishedRecord;
use anyhow::{Context, Result};
use droidscope_core::Error;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where flushed records go. Writes happen in flush order.
pub trait RecordSink: Send {
    fn write(&mut self, record: &FinishedRecord) -> droidscope_core::Result<()>;

    /// Finish the output. Further writes are an error.
    fn close(&mut self) -> droidscope_core::Result<()>;
}

/// Append-only JSON array file.
///
/// `[` is written on open and `]` on close; every record is flushed to disk
/// as it arrives, so a crash leaves at most an unterminated array, which
/// [`load_records`] repairs.
pub struct JsonArrayWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    written: u64,
}

impl JsonArrayWriter {
    pub fn create(path: impl AsRef<Path>) -> droidscope_core::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::output_unavailable(&path, e))?;
        }
        let file = File::create(&path).map_err(|e| Error::output_unavailable(&path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(b"[")?;
        out.flush()?;
        Ok(Self { path, out: Some(out), written: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonArrayWriter {
    fn write(&mut self, record: &FinishedRecord) -> droidscope_core::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::output_unavailable(&self.path, "already closed"))?;
        let separator: &[u8] = if self.written == 0 { b"\n" } else { b",\n" };
        out.write_all(separator)?;
        serde_json::to_writer_pretty(&mut *out, record)?;
        out.flush()?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> droidscope_core::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.write_all(b"\n]\n")?;
            out.flush()?;
            debug!(path = %self.path.display(), records = self.written, "recording closed");
        }
        Ok(())
    }
}

impl Drop for JsonArrayWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to terminate recording");
        }
    }
}

/// Read a recording, repairing an array left unterminated by a crash.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<FinishedRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_records(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_records(text: &str) -> Result<Vec<FinishedRecord>> {
    match serde_json::from_str(text) {
        Ok(records) => Ok(records),
        Err(first) => {
            let repaired = repair(text);
            serde_json::from_str(&repaired).map_err(|_| first.into())
        }
    }
}

fn repair(text: &str) -> String {
    let mut body = text.trim_end().to_string();
    if body.ends_with(']') {
        return body;
    }
    if body.ends_with(',') {
        body.pop();
    }
    if body.trim().is_empty() {
        return "[]".to_string();
    }
    body.push_str("\n]");
    body
}

/// Directory of recordings, `~/.droidscope` unless told otherwise.
pub struct RecordingStorage {
    dir: PathBuf,
}

impl RecordingStorage {
    pub fn new() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME not set")?;
        Self::with_dir(PathBuf::from(home).join(".droidscope"))
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Open a new `<name>_<YYYYmmdd_HHMMSS>.json` writer.
    pub fn create(&self, name: &str) -> Result<JsonArrayWriter> {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{}_{}.json", sanitize(name), ts));
        Ok(JsonArrayWriter::create(path)?)
    }

    pub fn load(&self, file: &str) -> Result<Vec<FinishedRecord>> {
        load_records(self.resolve(file))
    }

    /// Recording file names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(s) = name.to_str() {
                if s.ends_with(".json") {
                    files.push(s.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn delete(&self, file: &str) -> Result<()> {
        let path = self.resolve(file);
        fs::remove_file(&path).with_context(|| format!("deleting {}", path.display()))?;
        Ok(())
    }

    /// An existing path is used as-is; anything else names a stored file,
    /// with or without the `.json` extension.
    pub fn resolve(&self, file: &str) -> PathBuf {
        let direct = PathBuf::from(file);
        if direct.is_file() {
            return direct;
        }
        let stored = self.dir.join(file);
        if stored.is_file() || file.ends_with(".json") {
            return stored;
        }
        self.dir.join(format!("{}.json", file))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
