//! Linux evdev/uinput plumbing: exclusive grabs of physical keyboards,
//! per-device reader threads, and the two synthetic output devices.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::Sender;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, Device, EventType, InputEvent, InputId, Key, RelativeAxisType};
use parking_lot::Mutex;

use crate::cfg::MouseButton;
use crate::keyevent::KeyEvent;
use crate::keys;

pub const VIRT_KEYBOARD_NAME: &str = "mouseless keyboard";
pub const VIRT_MOUSE_NAME: &str = "mouseless";

/// Wheel events are emitted both as legacy single steps and as
/// high-resolution steps of 1/120 of a detent.
pub const HI_RES_WHEEL_UNITS_PER_CLICK: i32 = 120;

// ------------------------- synthetic keyboard -------------------------

pub struct KbdOut {
    device: VirtualDevice,
}

impl KbdOut {
    pub fn new() -> io::Result<Self> {
        let mut key_set = AttributeSet::new();
        for code in 0..256u16 {
            key_set.insert(Key(code));
        }
        let device = VirtualDeviceBuilder::new()?
            .name(VIRT_KEYBOARD_NAME)
            .input_id(InputId::new(BusType::BUS_USB, 1, 1, 1))
            .with_keys(&key_set)?
            .build()?;
        Ok(Self { device })
    }

    pub fn press_key(&mut self, code: u16) -> io::Result<()> {
        self.write_key(code, 1)
    }

    pub fn release_key(&mut self, code: u16) -> io::Result<()> {
        self.write_key(code, 0)
    }

    fn write_key(&mut self, code: u16, value: i32) -> io::Result<()> {
        self.device
            .emit(&[InputEvent::new(EventType::KEY, code, value)])
    }
}

// --------------------------- synthetic mouse ---------------------------

pub struct MouseOut {
    device: VirtualDevice,
}

impl MouseOut {
    pub fn new() -> io::Result<Self> {
        let mut buttons = AttributeSet::new();
        buttons.insert(Key::BTN_LEFT);
        buttons.insert(Key::BTN_RIGHT);
        buttons.insert(Key::BTN_MIDDLE);
        let mut axes = AttributeSet::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_WHEEL);
        axes.insert(RelativeAxisType::REL_HWHEEL);
        axes.insert(RelativeAxisType::REL_WHEEL_HI_RES);
        axes.insert(RelativeAxisType::REL_HWHEEL_HI_RES);
        let device = VirtualDeviceBuilder::new()?
            .name(VIRT_MOUSE_NAME)
            .input_id(InputId::new(BusType::BUS_USB, 1, 2, 1))
            .with_keys(&buttons)?
            .with_relative_axes(&axes)?
            .build()?;
        Ok(Self { device })
    }

    pub fn move_rel(&mut self, dx: i32, dy: i32) -> io::Result<()> {
        self.device.emit(&[
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_X.0, dx),
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_Y.0, dy),
        ])
    }

    pub fn scroll_vertical(&mut self, clicks: i32) -> io::Result<()> {
        self.device.emit(&[
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, clicks),
            InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_WHEEL_HI_RES.0,
                clicks * HI_RES_WHEEL_UNITS_PER_CLICK,
            ),
        ])
    }

    pub fn scroll_horizontal(&mut self, clicks: i32) -> io::Result<()> {
        self.device.emit(&[
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_HWHEEL.0, clicks),
            InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_HWHEEL_HI_RES.0,
                clicks * HI_RES_WHEEL_UNITS_PER_CLICK,
            ),
        ])
    }

    pub fn press_button(&mut self, button: MouseButton) -> io::Result<()> {
        self.write_button(button, 1)
    }

    pub fn release_button(&mut self, button: MouseButton) -> io::Result<()> {
        self.write_button(button, 0)
    }

    fn write_button(&mut self, button: MouseButton, value: i32) -> io::Result<()> {
        let code = match button {
            MouseButton::Left => keys::BTN_LEFT,
            MouseButton::Right => keys::BTN_RIGHT,
            MouseButton::Middle => keys::BTN_MIDDLE,
        };
        self.device
            .emit(&[InputEvent::new(EventType::KEY, code, value)])
    }
}

// --------------------------- physical devices ---------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NotOpen,
    OpenFailed,
    Open,
}

/// A grabbed physical keyboard. Reading happens on a dedicated thread that
/// pushes key events onto the shared input channel; when the device file
/// vanishes the thread marks the state `NotOpen` and exits, and the device
/// watcher may trigger a re-grab later.
pub struct InputDevice {
    path: PathBuf,
    name: String,
    state: Arc<Mutex<DeviceState>>,
    last_open_error: Arc<Mutex<String>>,
    events: Sender<KeyEvent>,
}

impl InputDevice {
    pub fn new(path: PathBuf, name: String, events: Sender<KeyEvent>) -> Self {
        Self {
            path,
            name,
            state: Arc::new(Mutex::new(DeviceState::NotOpen)),
            last_open_error: Arc::new(Mutex::new(String::new())),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == DeviceState::Open
    }

    pub fn last_open_error(&self) -> String {
        self.last_open_error.lock().clone()
    }

    /// Opens and grabs the device exclusively and starts its reader thread.
    /// Failures are recorded and logged; the device can be retried later.
    pub fn grab(&self) {
        let mut device = match Device::open(&self.path) {
            Ok(device) => device,
            Err(e) => {
                self.open_failed(format!("failed to open: {e}"));
                return;
            }
        };
        if let Err(e) = device.grab() {
            self.open_failed(format!("failed to grab: {e}"));
            return;
        }
        log::debug!("grabbed device {} ({})", self.path.display(), self.name);
        *self.state.lock() = DeviceState::Open;

        let path = self.path.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("read {}", self.path.display()))
            .spawn(move || read_loop(device, path, state, events));
        if let Err(e) = spawned {
            log::warn!("failed to spawn the reader thread: {e}");
            *self.state.lock() = DeviceState::NotOpen;
        }
    }

    /// Marks the device as gone; the reader thread stops at its next read.
    pub fn disconnected(&self) {
        *self.state.lock() = DeviceState::NotOpen;
    }

    fn open_failed(&self, msg: String) {
        log::warn!("device {}: {msg}", self.path.display());
        *self.state.lock() = DeviceState::OpenFailed;
        *self.last_open_error.lock() = msg;
    }
}

fn read_loop(
    mut device: Device,
    path: PathBuf,
    state: Arc<Mutex<DeviceState>>,
    events: Sender<KeyEvent>,
) {
    loop {
        if *state.lock() != DeviceState::Open {
            return;
        }
        let fetched = match device.fetch_events() {
            Ok(fetched) => fetched,
            Err(e) => {
                // a vanished device file just means the keyboard was
                // unplugged
                if path.exists() {
                    log::warn!("failed to read from {}: {e}", path.display());
                } else {
                    log::debug!("device {} vanished: {e}", path.display());
                }
                *state.lock() = DeviceState::NotOpen;
                return;
            }
        };
        for event in fetched {
            // only key transitions pass; value 2 is auto-repeat
            if event.event_type() != EventType::KEY {
                continue;
            }
            let is_press = match event.value() {
                0 => false,
                1 => true,
                _ => continue,
            };
            log::debug!(
                "{} {} ({})",
                if is_press { "pressed: " } else { "released:" },
                keys::display_name(event.code()),
                event.code()
            );
            let key_event = KeyEvent {
                code: event.code(),
                is_press,
                time: Instant::now(),
            };
            if events.try_send(key_event).is_err() {
                log::warn!("input event channel is full, dropping {key_event:?}");
            }
        }
    }
}

// ------------------------- discovery & filtering -------------------------

/// True iff the device looks like a keyboard: it reports the A key or the
/// keypad 1 key.
pub fn is_keyboard(device: &Device) -> bool {
    device
        .supported_keys()
        .is_some_and(|keys| keys.contains(Key::KEY_A) || keys.contains(Key::KEY_KP1))
}

/// All `/dev/input/event*` devices, with their names.
pub fn enumerate_devices() -> Vec<(PathBuf, Device)> {
    let mut devices: Vec<(PathBuf, Device)> = evdev::enumerate()
        .filter(|(path, _)| {
            path.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("event"))
        })
        .collect();
    devices.sort_by(|a, b| a.0.cmp(&b.0));
    devices
}

pub fn device_name(device: &Device) -> String {
    device.name().unwrap_or("?").to_string()
}

/// The include/exclude lists from the config. Entries match a device by
/// name, by path, or by resolved symlink (so `/dev/input/by-id/...` links
/// work).
pub struct DeviceFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl DeviceFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// An empty include list selects every auto-detected keyboard.
    pub fn matches(&self, path: &Path, name: &str, auto_detected_keyboard: bool) -> bool {
        if Self::matches_list(&self.exclude, path, name) {
            return false;
        }
        if self.include.is_empty() {
            return auto_detected_keyboard;
        }
        Self::matches_list(&self.include, path, name)
    }

    fn matches_list(list: &[String], path: &Path, name: &str) -> bool {
        list.iter().any(|entry| {
            entry == name
                || Path::new(entry) == path
                || std::fs::canonicalize(entry).is_ok_and(|resolved| resolved == path)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_empty_include_selects_keyboards() {
        let filter = DeviceFilter::new(vec![], vec![]);
        assert!(filter.matches(Path::new("/dev/input/event0"), "kbd", true));
        assert!(!filter.matches(Path::new("/dev/input/event1"), "mouse", false));
    }

    #[test]
    fn filter_include_list_matches_name_or_path() {
        let filter = DeviceFilter::new(
            vec!["AT Translated Set 2 keyboard".into(), "/dev/input/event3".into()],
            vec![],
        );
        assert!(filter.matches(
            Path::new("/dev/input/event0"),
            "AT Translated Set 2 keyboard",
            true
        ));
        assert!(filter.matches(Path::new("/dev/input/event3"), "other", false));
        assert!(!filter.matches(Path::new("/dev/input/event5"), "other", true));
    }

    #[test]
    fn filter_exclude_wins() {
        let filter = DeviceFilter::new(vec![], vec!["noisy keyboard".into()]);
        assert!(!filter.matches(Path::new("/dev/input/event0"), "noisy keyboard", true));
        assert!(filter.matches(Path::new("/dev/input/event1"), "kbd", true));
    }
}
