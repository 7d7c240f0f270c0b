//! The synthetic keyboard: presses keys on behalf of bindings and tracks
//! which synthesized keys belong to which physical key, so that releasing
//! the physical key releases everything it caused.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::keys;
use crate::oskbd::KbdOut;

pub struct VirtualKeyboard {
    out: KbdOut,
    is_pressed: FxHashSet<u16>,
    pressed_modifiers: FxHashSet<u16>,
    triggered_keys: FxHashMap<u16, Vec<u16>>,
}

impl VirtualKeyboard {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            out: KbdOut::new()?,
            is_pressed: FxHashSet::default(),
            pressed_modifiers: FxHashSet::default(),
            triggered_keys: FxHashMap::default(),
        })
    }

    /// Presses the given key sequence and remembers it under `cause` so the
    /// keys are released automatically when the causing key is released.
    /// All but the last code count as modifiers and stay down until the
    /// next sequence or their owning release.
    pub fn press_keys(&mut self, cause: u16, codes: &[u16]) {
        self.triggered_keys
            .entry(cause)
            .or_default()
            .extend_from_slice(codes);

        // start from a clean modifier state
        let held: Vec<u16> = self.pressed_modifiers.iter().copied().collect();
        for code in held {
            self.release_key(code);
        }

        for (i, code) in codes.iter().enumerate() {
            self.press_key(*code);
            if i < codes.len() - 1 {
                self.pressed_modifiers.insert(*code);
            }
        }
    }

    /// Presses a key without ownership tracking; the caller is responsible
    /// for the matching `release_key_manually`.
    pub fn press_key_manually(&mut self, code: u16) {
        self.press_key(code);
    }

    pub fn release_key_manually(&mut self, code: u16) {
        self.release_key(code);
    }

    /// Releases every still-pressed key that `cause` triggered.
    pub fn original_key_up(&mut self, cause: u16) {
        if let Some(codes) = self.triggered_keys.remove(&cause) {
            for code in codes {
                if self.is_pressed.contains(&code) {
                    self.release_key(code);
                }
            }
        }
    }

    fn press_key(&mut self, code: u16) {
        log::debug!("keyboard: pressing {} ({})", keys::display_name(code), code);
        if let Err(e) = self.out.press_key(code) {
            log::warn!("keyboard: failed to press key {code}: {e}");
        }
        self.is_pressed.insert(code);
    }

    fn release_key(&mut self, code: u16) {
        log::debug!("keyboard: releasing {} ({})", keys::display_name(code), code);
        if let Err(e) = self.out.release_key(code) {
            log::warn!("keyboard: failed to release key {code}: {e}");
        }
        self.is_pressed.remove(&code);
        self.pressed_modifiers.remove(&code);
    }
}
