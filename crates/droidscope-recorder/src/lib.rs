//! droidscope-recorder - Android input recording and replay
//!
//! Capture turns `getevent -lt` output into correlated records: each touch
//! or key event carries the foreground app and the UI element under it.
//!
//! ## Pipeline
//!
//! - **tokenizer**: one stream line -> one partial fragment
//! - **aggregator**: fragments -> pending events -> finished records
//! - **recorder**: the capture session (reader, flush ticker, hierarchy refresh)
//! - **storage**: JSON array output and the recordings directory
//! - **replay**: re-issue a recording as taps and key events

pub mod aggregator;
pub mod events;
pub mod recorder;
pub mod replay;
pub mod storage;
pub mod tokenizer;

pub use aggregator::{Aggregator, EventKey, PendingEvent};
pub use events::*;
pub use recorder::{Receiver, Recorder, RecorderConfig, RecordingHandle, Sender, SessionInfo};
pub use replay::{LaunchOutcome, ReplayConfig, ReplayState, ReplayStats, Replayer};
pub use storage::{load_records, JsonArrayWriter, RecordSink, RecordingStorage};
pub use tokenizer::{Fragment, Tokenizer};

pub mod prelude {
    pub use crate::events::*;
    pub use crate::recorder::{Recorder, RecorderConfig, RecordingHandle, SessionInfo};
    pub use crate::replay::{LaunchOutcome, ReplayConfig, ReplayStats, Replayer};
    pub use crate::storage::{load_records, JsonArrayWriter, RecordSink, RecordingStorage};
}
