//! Configuration: the YAML file model, the binding mini-language, and the
//! parsed layer tables the pipeline works with.
//!
//! The file is deserialized into [`RawConfig`] with serde and then lowered
//! into [`Cfg`], resolving key aliases, validating layers, and parsing each
//! binding string into a [`Binding`]. Bindings implement `Display` with the
//! same syntax they are parsed from, so a parsed config can be printed back
//! out for logging and diffing.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::keys::{self, WILDCARD_KEY};

pub const DEFAULT_MOUSE_LOOP_INTERVAL_MS: u64 = 20;
pub const DEFAULT_COMBO_TIME_MS: u64 = 25;

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("failed to read the config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse layer {index}: {msg}")]
    Layer { index: usize, msg: String },
    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> CfgError {
    CfgError::Invalid(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MouseButton::Left => write!(f, "left"),
            MouseButton::Middle => write!(f, "middle"),
            MouseButton::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TapHoldBinding {
    pub tap: Binding,
    pub hold: Binding,
    pub timeout_ms: u64,
    pub tap_on_next: bool,
    pub tap_on_next_release: bool,
}

/// One action a key can be bound to. `Key` is a sequence of codes where the
/// last one is the main key and the preceding ones are modifiers; a
/// `WILDCARD_KEY` inside the sequence is replaced with the cause code when
/// the binding executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Key(Vec<u16>),
    KeyPress(u16),
    KeyRelease(u16),
    Multi(Vec<Binding>),
    TapHold(Box<TapHoldBinding>),
    Layer(String),
    ToggleLayer(String),
    ModLayer { modifier: u16, layer: String },
    Move { x: f64, y: f64 },
    Scroll { x: f64, y: f64 },
    Speed(f64),
    Button(MouseButton),
    Exec(String),
    ExecPressRelease { press: String, release: String },
    ReloadConfig,
    Nop,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Key(combo) => {
                let names: Vec<String> = combo.iter().map(|c| keys::display_name(*c)).collect();
                write!(f, "{}", names.join("+"))
            }
            Binding::KeyPress(code) => write!(f, "key-press {}", keys::display_name(*code)),
            Binding::KeyRelease(code) => write!(f, "key-release {}", keys::display_name(*code)),
            Binding::Multi(children) => {
                let parts: Vec<String> = children.iter().map(|b| b.to_string()).collect();
                write!(f, "multi {}", parts.join(" ; "))
            }
            Binding::TapHold(th) => {
                let action = if th.tap_on_next {
                    "tap-hold-next"
                } else if th.tap_on_next_release {
                    "tap-hold-next-release"
                } else {
                    "tap-hold"
                };
                write!(f, "{} {} ; {} ; {}", action, th.tap, th.hold, th.timeout_ms)
            }
            Binding::Layer(name) => write!(f, "layer {name}"),
            Binding::ToggleLayer(name) => write!(f, "toggle-layer {name}"),
            Binding::ModLayer { modifier, layer } => {
                write!(f, "mod-layer {} {}", keys::display_name(*modifier), layer)
            }
            Binding::Move { x, y } => write!(f, "move {x} {y}"),
            Binding::Scroll { x, y } => {
                let direction = if *y < 0.0 {
                    "up"
                } else if *y > 0.0 {
                    "down"
                } else if *x < 0.0 {
                    "left"
                } else {
                    "right"
                };
                write!(f, "scroll {direction}")
            }
            Binding::Speed(s) => write!(f, "speed {s}"),
            Binding::Button(b) => write!(f, "button {b}"),
            Binding::Exec(cmd) => write!(f, "exec {cmd}"),
            Binding::ExecPressRelease { press, release } => {
                write!(f, "exec-press-release {press} ; {release}")
            }
            Binding::ReloadConfig => write!(f, "reload-config"),
            Binding::Nop => write!(f, "nop"),
        }
    }
}

/// A named set of key bindings. Combo tables are symmetric:
/// `combo_bindings[a][b]` and `combo_bindings[b][a]` hold the same binding.
#[derive(Debug, Default)]
pub struct Layer {
    pub name: String,
    pub pass_through: bool,
    pub enter_command: Option<String>,
    pub exit_command: Option<String>,
    pub bindings: FxHashMap<u16, Binding>,
    pub combo_bindings: FxHashMap<u16, FxHashMap<u16, Binding>>,
    pub wildcard_binding: Option<Binding>,
}

#[derive(Debug)]
pub struct Cfg {
    pub devices: Vec<String>,
    pub devices_exclude: Vec<String>,
    pub start_command: Option<String>,
    pub mouse_loop_interval_ms: u64,
    pub base_mouse_speed: f64,
    pub start_mouse_speed: f64,
    pub mouse_acceleration_curve: f64,
    pub mouse_acceleration_time: f64,
    pub mouse_deceleration_curve: f64,
    pub mouse_deceleration_time: f64,
    pub base_scroll_speed: f64,
    pub quick_tap_time_ms: u64,
    pub combo_time_ms: u64,
    /// Layer 0 is the base layer.
    pub layers: Vec<Arc<Layer>>,
}

/// Mirror of the YAML file structure before any validation.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default, rename = "devicesExclude")]
    devices_exclude: Vec<String>,
    #[serde(default, rename = "startCommand")]
    start_command: Option<String>,
    #[serde(default, rename = "mouseLoopInterval")]
    mouse_loop_interval: Option<u64>,
    #[serde(default, rename = "baseMouseSpeed")]
    base_mouse_speed: f64,
    #[serde(default, rename = "startMouseSpeed")]
    start_mouse_speed: f64,
    #[serde(default, rename = "mouseAccelerationCurve")]
    mouse_acceleration_curve: Option<f64>,
    #[serde(default, rename = "mouseAccelerationTime")]
    mouse_acceleration_time: f64,
    #[serde(default, rename = "mouseDecelerationCurve")]
    mouse_deceleration_curve: Option<f64>,
    #[serde(default, rename = "mouseDecelerationTime")]
    mouse_deceleration_time: f64,
    #[serde(default, rename = "baseScrollSpeed")]
    base_scroll_speed: f64,
    #[serde(default, rename = "quickTapTime")]
    quick_tap_time: Option<u64>,
    #[serde(default, rename = "comboTime")]
    combo_time: Option<u64>,
    #[serde(default)]
    layers: Vec<RawLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLayer {
    // layer names and binding keys/values may be written as bare YAML
    // scalars (`name: 1`), so they are coerced from Value
    #[serde(default)]
    name: Value,
    #[serde(default, rename = "passThrough")]
    pass_through: Option<bool>,
    #[serde(default, rename = "enterCommand")]
    enter_command: Option<String>,
    #[serde(default, rename = "exitCommand")]
    exit_command: Option<String>,
    #[serde(default)]
    bindings: serde_yaml::Mapping,
}

/// Coerces a scalar YAML value (string, number, bool) into its string form.
fn scalar_to_string(value: &Value) -> Result<String, CfgError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(invalid(format!("expected a scalar value, got {other:?}"))),
    }
}

impl Cfg {
    pub fn from_file(path: &Path) -> Result<Self, CfgError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_str(&contents)
    }

    pub fn parse_str(contents: &str) -> Result<Self, CfgError> {
        let raw: RawConfig = serde_yaml::from_str(contents)?;

        let acceleration_curve = parse_curve(raw.mouse_acceleration_curve, "mouseAccelerationCurve")?;
        let deceleration_curve = parse_curve(raw.mouse_deceleration_curve, "mouseDecelerationCurve")?;

        let mut layers = Vec::with_capacity(raw.layers.len());
        for (index, raw_layer) in raw.layers.iter().enumerate() {
            let layer = parse_layer(raw_layer)
                .map_err(|e| CfgError::Layer { index, msg: e.to_string() })?;
            layers.push(Arc::new(layer));
        }
        if layers.is_empty() {
            return Err(invalid("at least one layer is required"));
        }
        for (i, layer) in layers.iter().enumerate() {
            if layers[..i].iter().any(|l| l.name == layer.name) {
                return Err(invalid(format!("duplicate layer name '{}'", layer.name)));
            }
        }

        let cfg = Cfg {
            devices: raw.devices,
            devices_exclude: raw.devices_exclude,
            start_command: raw.start_command,
            mouse_loop_interval_ms: raw
                .mouse_loop_interval
                .unwrap_or(DEFAULT_MOUSE_LOOP_INTERVAL_MS),
            base_mouse_speed: raw.base_mouse_speed,
            start_mouse_speed: raw.start_mouse_speed,
            mouse_acceleration_curve: acceleration_curve,
            mouse_acceleration_time: raw.mouse_acceleration_time,
            mouse_deceleration_curve: deceleration_curve,
            mouse_deceleration_time: raw.mouse_deceleration_time,
            base_scroll_speed: raw.base_scroll_speed,
            quick_tap_time_ms: raw.quick_tap_time.unwrap_or(0),
            combo_time_ms: raw.combo_time.unwrap_or(DEFAULT_COMBO_TIME_MS),
            layers,
        };
        log::debug!("parsed config: {cfg:?}");
        Ok(cfg)
    }

    pub fn base_layer(&self) -> &Arc<Layer> {
        &self.layers[0]
    }

    pub fn layer(&self, name: &str) -> Option<&Arc<Layer>> {
        self.layers.iter().find(|l| l.name == name)
    }
}

fn parse_curve(value: Option<f64>, field: &str) -> Result<f64, CfgError> {
    match value {
        None => Ok(1.0),
        Some(v) if v > 0.0 => Ok(v),
        Some(v) => Err(invalid(format!("{field} must be greater than 0, got {v}"))),
    }
}

fn parse_layer(raw: &RawLayer) -> Result<Layer, CfgError> {
    let name = match &raw.name {
        Value::Null => String::new(),
        other => scalar_to_string(other)?,
    };
    if name.is_empty() {
        return Err(invalid("no name given"));
    }

    let mut layer = Layer {
        name,
        pass_through: raw.pass_through.unwrap_or(true),
        enter_command: raw.enter_command.clone(),
        exit_command: raw.exit_command.clone(),
        ..Layer::default()
    };

    for (key, value) in &raw.bindings {
        let key = scalar_to_string(key)
            .map_err(|e| invalid(format!("invalid binding key: {e}")))?;
        let value = scalar_to_string(value)
            .map_err(|e| invalid(format!("invalid binding for '{key}': {e}")))?;
        let codes = parse_key_combo(&key)
            .map_err(|e| invalid(format!("failed to parse the key '{key}': {e}")))?;
        let binding = parse_binding(&value)
            .map_err(|e| invalid(format!("failed to parse the binding '{value}': {e}")))?;
        match codes.as_slice() {
            [code] => {
                if *code == WILDCARD_KEY {
                    layer.wildcard_binding = Some(binding);
                } else {
                    layer.bindings.insert(*code, binding);
                }
            }
            [a, b] => {
                layer
                    .combo_bindings
                    .entry(*a)
                    .or_default()
                    .insert(*b, binding.clone());
                layer
                    .combo_bindings
                    .entry(*b)
                    .or_default()
                    .insert(*a, binding);
            }
            _ => {
                return Err(invalid(format!(
                    "combos with more than 2 keys are not supported: '{key}'"
                )));
            }
        }
    }

    Ok(layer)
}

/// Parses a single binding string, e.g. `tap-hold f ; layer mouse ; 200`.
pub fn parse_binding(raw: &str) -> Result<Binding, CfgError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid("binding is empty"));
    }
    let action = raw.split_whitespace().next().unwrap_or_default();
    let arg_string = raw[action.len()..].trim();
    let args: Vec<&str> = arg_string.split_whitespace().collect();

    let binding = match action {
        "multi" => {
            let meta_args: Vec<&str> = arg_string.split(';').collect();
            if meta_args.len() < 2 {
                return Err(invalid(
                    "action requires at least two meta arguments (separated by ;)",
                ));
            }
            let mut children = Vec::with_capacity(meta_args.len());
            for arg in meta_args {
                children.push(parse_binding(arg)?);
            }
            Binding::Multi(children)
        }
        "tap-hold" => Binding::TapHold(Box::new(parse_tap_hold(arg_string, false, false)?)),
        "tap-hold-next" => Binding::TapHold(Box::new(parse_tap_hold(arg_string, true, false)?)),
        "tap-hold-next-release" => {
            Binding::TapHold(Box::new(parse_tap_hold(arg_string, false, true)?))
        }
        "layer" => match args.as_slice() {
            [name] => Binding::Layer(name.to_string()),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "toggle-layer" => match args.as_slice() {
            [name] => Binding::ToggleLayer(name.to_string()),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "mod-layer" => match args.as_slice() {
            [key, name] => Binding::ModLayer {
                modifier: parse_key(key)?,
                layer: name.to_string(),
            },
            _ => return Err(invalid("action requires exactly two arguments")),
        },
        "key-press" => match args.as_slice() {
            [key] => Binding::KeyPress(parse_key(key)?),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "key-release" => match args.as_slice() {
            [key] => Binding::KeyRelease(parse_key(key)?),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "reload-config" => match args.as_slice() {
            [] => Binding::ReloadConfig,
            _ => return Err(invalid("action requires zero arguments")),
        },
        "move" => match args.as_slice() {
            [x, y] => {
                let x: f64 = x
                    .parse()
                    .map_err(|_| invalid("first argument must be a number"))?;
                let y: f64 = y
                    .parse()
                    .map_err(|_| invalid("second argument must be a number"))?;
                Binding::Move { x, y }
            }
            _ => return Err(invalid("action requires exactly two arguments")),
        },
        "scroll" => match args.as_slice() {
            ["up"] => Binding::Scroll { x: 0.0, y: -1.0 },
            ["down"] => Binding::Scroll { x: 0.0, y: 1.0 },
            ["left"] => Binding::Scroll { x: -1.0, y: 0.0 },
            ["right"] => Binding::Scroll { x: 1.0, y: 0.0 },
            _ => {
                return Err(invalid(
                    "first argument must be one of up, down, left or right",
                ))
            }
        },
        "speed" => match args.as_slice() {
            [factor] => Binding::Speed(
                factor
                    .parse()
                    .map_err(|_| invalid("first argument must be a number"))?,
            ),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "button" => match args.as_slice() {
            ["left"] => Binding::Button(MouseButton::Left),
            ["middle"] => Binding::Button(MouseButton::Middle),
            ["right"] => Binding::Button(MouseButton::Right),
            [other] => return Err(invalid(format!("unknown button '{other}'"))),
            _ => return Err(invalid("action requires exactly one argument")),
        },
        "exec" => {
            if args.is_empty() {
                return Err(invalid("action requires at least one argument"));
            }
            Binding::Exec(arg_string.to_string())
        }
        "exec-press-release" => {
            let meta_args: Vec<&str> = arg_string.split(';').collect();
            match meta_args.as_slice() {
                [press, release] if !press.trim().is_empty() && !release.trim().is_empty() => {
                    Binding::ExecPressRelease {
                        press: press.trim().to_string(),
                        release: release.trim().to_string(),
                    }
                }
                _ => {
                    return Err(invalid(
                        "action requires exactly two meta arguments (separated by ;)",
                    ))
                }
            }
        }
        "nop" => match args.as_slice() {
            [] => Binding::Nop,
            _ => return Err(invalid("action does not take any argument")),
        },
        _ => {
            let combo = parse_key_combo(raw)
                .map_err(|_| invalid("neither a valid action nor a valid key sequence"))?;
            Binding::Key(combo)
        }
    };

    Ok(binding)
}

fn parse_tap_hold(
    arg_string: &str,
    tap_on_next: bool,
    tap_on_next_release: bool,
) -> Result<TapHoldBinding, CfgError> {
    let meta_args: Vec<&str> = arg_string.split(';').collect();
    let [tap, hold, timeout] = meta_args.as_slice() else {
        return Err(invalid(
            "action requires exactly 3 meta arguments (separated by ;)",
        ));
    };
    let timeout = timeout.trim();
    let timeout_ms: u64 = timeout
        .parse()
        .map_err(|_| invalid(format!("third argument must be a number: {timeout}")))?;
    Ok(TapHoldBinding {
        tap: parse_binding(tap)?,
        hold: parse_binding(hold)?,
        timeout_ms,
        tap_on_next,
        tap_on_next_release,
    })
}

/// Parses a key combination of the form `key1+key2+...`.
fn parse_key_combo(raw: &str) -> Result<Vec<u16>, CfgError> {
    raw.split('+').map(parse_key).collect()
}

/// A key is either an alias or the decimal code itself.
fn parse_key(key: &str) -> Result<u16, CfgError> {
    let key = key.trim();
    if let Some(code) = keys::code_from_alias(key) {
        return Ok(code);
    }
    key.parse()
        .map_err(|_| invalid(format!("'{key}' is neither an integer nor a key alias")))
}
