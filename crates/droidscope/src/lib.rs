//! # DROIDSCOPE
//!
//! Record what a person does on an Android device, with the UI element each
//! touch landed on, and play it back later.
//!
//! ## Features
//!
//! - **Recording**: `getevent` capture correlated with the foreground app and
//!   the `uiautomator` hierarchy
//! - **Replay**: taps and key events re-issued over adb, with app launch
//!   and bounded timing
//! - **Storage**: one JSON array per session, readable even after a crash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use droidscope::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let device = Adb::new().default_device(Duration::from_secs(5))?;
//! let storage = RecordingStorage::new()?;
//! let writer = storage.create("login")?;
//!
//! let recorder = Recorder::new(Arc::new(device));
//! let handle = recorder.start(Box::new(writer))?;
//! while let Some(record) = handle.recv_timeout(Duration::from_secs(10)) {
//!     println!("{}", record.console_line());
//! }
//! handle.stop();
//! # Ok::<(), anyhow::Error>(())
//! ```

// Re-export device primitives
pub use droidscope_core::*;

// Re-export recorder module
pub use droidscope_recorder as recorder;

pub use droidscope_recorder::{
    load_records, Coordinates, EventKind, FinishedRecord, JsonArrayWriter, LaunchOutcome,
    RecordSink, Recorder, RecorderConfig, RecordingHandle, RecordingStorage, ReplayConfig,
    ReplayStats, Replayer,
};

/// Prelude - import everything you need
pub mod prelude {
    pub use droidscope_core::prelude::*;
    pub use droidscope_recorder::prelude::*;
}
