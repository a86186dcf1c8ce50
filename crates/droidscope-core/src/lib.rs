//! droidscope-core - Android device primitives for input capture and replay
//!
//! Everything here talks to a device only through the [`Device`] trait:
//!
//! - **device**: the capability plus its adb implementation
//! - **apps**: foreground app context, launch and force-stop
//! - **input**: taps and key events, key-name table
//! - **hierarchy**: `uiautomator` snapshots and point hit-testing

pub mod apps;
pub mod device;
pub mod error;
pub mod hierarchy;
pub mod input;

pub use apps::{AppContext, LaunchStrategy};
pub use device::{Adb, AdbDevice, CommandOutput, Device, LineStream, StreamTerminator};
pub use error::{Error, ErrorCategory, ErrorCode, Result};
pub use hierarchy::{Bounds, DumpConfig, HierarchyTracker, Snapshot, UiNode};

pub mod prelude {
    pub use crate::apps::{AppContext, LaunchStrategy};
    pub use crate::device::{Adb, AdbDevice, CommandOutput, Device, LineStream};
    pub use crate::error::{Error, ErrorCategory, ErrorCode, Result};
    pub use crate::hierarchy::{HierarchyTracker, Snapshot, UiNode};
}
