//! Key aliases for the binding language.
//!
//! Aliases follow the Linux `KEY_*` names from input-event-codes.h,
//! lowercased and without the prefix, so that `leftshift+a` reads the way
//! `evtest` prints it. A key in the config file may also be given as the
//! numeric code directly.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// Sentinel code for the `*` key: a universal fallback in a layer and a
/// placeholder inside key sequences that is substituted with the cause code
/// at execution time.
pub const WILDCARD_KEY: u16 = u16::MAX;

pub const KEY_ESC: u16 = 1;
pub const KEY_A: u16 = 30;
pub const KEY_KP1: u16 = 79;

pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_MIDDLE: u16 = 0x112;

/// Alias table. Where two aliases share a code, the first one listed is the
/// canonical spelling used when converting codes back to names.
static KEY_ALIASES: &[(&str, u16)] = &[
    ("esc", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("minus", 12),
    ("equal", 13),
    ("backspace", 14),
    ("tab", 15),
    ("q", 16),
    ("w", 17),
    ("e", 18),
    ("r", 19),
    ("t", 20),
    ("y", 21),
    ("u", 22),
    ("i", 23),
    ("o", 24),
    ("p", 25),
    ("leftbrace", 26),
    ("rightbrace", 27),
    ("enter", 28),
    ("leftctrl", 29),
    ("a", 30),
    ("s", 31),
    ("d", 32),
    ("f", 33),
    ("g", 34),
    ("h", 35),
    ("j", 36),
    ("k", 37),
    ("l", 38),
    ("semicolon", 39),
    ("apostrophe", 40),
    ("grave", 41),
    ("leftshift", 42),
    ("backslash", 43),
    ("z", 44),
    ("x", 45),
    ("c", 46),
    ("v", 47),
    ("b", 48),
    ("n", 49),
    ("m", 50),
    ("comma", 51),
    ("dot", 52),
    ("slash", 53),
    ("rightshift", 54),
    ("kpasterisk", 55),
    ("leftalt", 56),
    ("space", 57),
    ("capslock", 58),
    ("f1", 59),
    ("f2", 60),
    ("f3", 61),
    ("f4", 62),
    ("f5", 63),
    ("f6", 64),
    ("f7", 65),
    ("f8", 66),
    ("f9", 67),
    ("f10", 68),
    ("numlock", 69),
    ("scrolllock", 70),
    ("kp7", 71),
    ("kp8", 72),
    ("kp9", 73),
    ("kpminus", 74),
    ("kp4", 75),
    ("kp5", 76),
    ("kp6", 77),
    ("kpplus", 78),
    ("kp1", 79),
    ("kp2", 80),
    ("kp3", 81),
    ("kp0", 82),
    ("kpdot", 83),
    ("102nd", 86),
    ("f11", 87),
    ("f12", 88),
    ("kpenter", 96),
    ("rightctrl", 97),
    ("kpslash", 98),
    ("sysrq", 99),
    ("rightalt", 100),
    ("home", 102),
    ("up", 103),
    ("pageup", 104),
    ("left", 105),
    ("right", 106),
    ("end", 107),
    ("down", 108),
    ("pagedown", 109),
    ("insert", 110),
    ("delete", 111),
    ("mute", 113),
    ("volumedown", 114),
    ("volumeup", 115),
    ("power", 116),
    ("kpequal", 117),
    ("pause", 119),
    ("kpcomma", 121),
    ("leftmeta", 125),
    ("rightmeta", 126),
    ("compose", 127),
    ("stop", 128),
    ("again", 129),
    ("props", 130),
    ("undo", 131),
    ("front", 132),
    ("copy", 133),
    ("open", 134),
    ("paste", 135),
    ("find", 136),
    ("cut", 137),
    ("help", 138),
    ("menu", 139),
    ("calc", 140),
    ("sleep", 142),
    ("wakeup", 143),
    ("mail", 155),
    ("bookmarks", 156),
    ("computer", 157),
    ("back", 158),
    ("forward", 159),
    ("nextsong", 163),
    ("playpause", 164),
    ("previoussong", 165),
    ("stopcd", 166),
    ("homepage", 172),
    ("refresh", 173),
    ("f13", 183),
    ("f14", 184),
    ("f15", 185),
    ("f16", 186),
    ("f17", 187),
    ("f18", 188),
    ("f19", 189),
    ("f20", 190),
    ("f21", 191),
    ("f22", 192),
    ("f23", 193),
    ("f24", 194),
    ("search", 217),
    ("brightnessdown", 224),
    ("brightnessup", 225),
    ("*", WILDCARD_KEY),
];

static ALIAS_TO_CODE: Lazy<FxHashMap<&'static str, u16>> =
    Lazy::new(|| KEY_ALIASES.iter().copied().collect());

static CODE_TO_ALIAS: Lazy<FxHashMap<u16, &'static str>> = Lazy::new(|| {
    let mut map = FxHashMap::default();
    for (name, code) in KEY_ALIASES {
        map.entry(*code).or_insert(*name);
    }
    map
});

pub fn code_from_alias(name: &str) -> Option<u16> {
    ALIAS_TO_CODE.get(name).copied()
}

pub fn alias_from_code(code: u16) -> Option<&'static str> {
    CODE_TO_ALIAS.get(&code).copied()
}

/// Alias for logging: falls back to the decimal code for unnamed keys.
pub fn display_name(code: u16) -> String {
    match alias_from_code(code) {
        Some(name) => name.to_string(),
        None => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_round_trip() {
        assert_eq!(code_from_alias("a"), Some(30));
        assert_eq!(alias_from_code(30), Some("a"));
        assert_eq!(code_from_alias("*"), Some(WILDCARD_KEY));
        assert_eq!(code_from_alias("nosuchkey"), None);
    }

    #[test]
    fn display_name_falls_back_to_code() {
        assert_eq!(display_name(30), "a");
        assert_eq!(display_name(599), "599");
    }
}
