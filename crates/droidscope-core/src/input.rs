//! Input injection through `adb shell input`

use crate::device::Device;
use crate::error::Result;
use std::time::Duration;

/// Android `KEYCODE_*` values for the keys replay knows how to press
pub mod key_codes {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const VOLUME_UP: u32 = 24;
    pub const VOLUME_DOWN: u32 = 25;
    pub const ENTER: u32 = 66;
    pub const MENU: u32 = 82;
}

/// Map a recorded key name (`ENTER`, `BACK`, ...) to its key code.
///
/// Accepts the names `getevent` prints for the volume keys (`VOLUMEUP`)
/// as well as the keycode spelling (`VOLUME_UP`). Case-insensitive.
pub fn key_code(name: &str) -> Option<u32> {
    let code = match name.trim().to_ascii_uppercase().as_str() {
        "ENTER" => key_codes::ENTER,
        "BACK" => key_codes::BACK,
        "HOME" => key_codes::HOME,
        "MENU" => key_codes::MENU,
        "VOLUME_UP" | "VOLUMEUP" => key_codes::VOLUME_UP,
        "VOLUME_DOWN" | "VOLUMEDOWN" => key_codes::VOLUME_DOWN,
        _ => return None,
    };
    Some(code)
}

/// Tap at screen coordinates. One tap is a full down/up pair.
pub fn tap(device: &dyn Device, x: i32, y: i32, timeout: Duration) -> Result<()> {
    let (x, y) = (x.to_string(), y.to_string());
    device.run_ok(&["shell", "input", "tap", &x, &y], timeout)?;
    Ok(())
}

/// Send a key press by key code.
pub fn key_event(device: &dyn Device, code: u32, timeout: Duration) -> Result<()> {
    let code = code.to_string();
    device.run_ok(&["shell", "input", "keyevent", &code], timeout)?;
    Ok(())
}
