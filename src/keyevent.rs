//! The event record that flows through the pipeline.

use std::time::Instant;

use crate::cfg::Binding;
use crate::keys;

/// A single key transition read from a physical device. Auto-repeat events
/// are filtered out before this type is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u16,
    pub is_press: bool,
    pub time: Instant,
}

impl KeyEvent {
    pub fn press(code: u16) -> Self {
        Self {
            code,
            is_press: true,
            time: Instant::now(),
        }
    }

    pub fn release(code: u16) -> Self {
        Self {
            code,
            is_press: false,
            time: Instant::now(),
        }
    }
}

impl std::fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = if self.is_press { "P" } else { "R" };
        write!(f, "{}{}", prefix, keys::display_name(self.code))
    }
}

/// The carrier passed between pipeline stages: an event plus the binding
/// that has been resolved for it so far. The binding starts out unset and
/// only the first resolver that sees it unset may attach one; `Nop` is a
/// real binding (suppress execution), not the same as unset.
#[derive(Debug, Clone)]
pub struct EventBinding {
    pub event: KeyEvent,
    pub binding: Option<Binding>,
}

impl EventBinding {
    pub fn new(event: KeyEvent) -> Self {
        Self {
            event,
            binding: None,
        }
    }

    pub fn with_binding(event: KeyEvent, binding: Binding) -> Self {
        Self {
            event,
            binding: Some(binding),
        }
    }
}

impl std::fmt::Display for EventBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.binding {
            Some(b) => write!(f, "{}:{}", self.event, b),
            None => write!(f, "{}", self.event),
        }
    }
}
