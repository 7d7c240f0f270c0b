//! Combo resolution: two keys pressed within the combo time window resolve
//! to a single binding registered in the current layer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cfg::{Binding, Layer};
use crate::handlers::timer::{self, TimerSlot};
use crate::handlers::{EventHandler, SharedHandler, SharedLayers};
use crate::keyevent::EventBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComboState {
    Idle,
    Wait,
    NoCombo,
    Combo,
}

pub struct ComboHandler {
    combo_time_ms: u64,

    queue: Vec<EventBinding>,
    position: usize,

    state: ComboState,
    timer: TimerSlot,
    /// Layer and trigger key captured when the hold-back started; the
    /// candidate table is `layer.combo_bindings[trigger]`.
    candidates: Option<(Arc<Layer>, u16)>,

    layers: SharedLayers,
    next: SharedHandler,
    self_ref: Weak<Mutex<ComboHandler>>,
}

impl EventHandler for ComboHandler {
    fn handle_event(&mut self, event: EventBinding) {
        self.queue.push(event);
        self.handle_events();
    }
}

impl ComboHandler {
    pub fn new_shared(
        combo_time_ms: u64,
        layers: SharedLayers,
        next: SharedHandler,
    ) -> Arc<Mutex<Self>> {
        timer::new_shared(|self_ref| Self {
            combo_time_ms,
            queue: Vec::new(),
            position: 0,
            state: ComboState::Idle,
            timer: TimerSlot::new(),
            candidates: None,
            layers,
            next,
            self_ref,
        })
    }

    pub fn set_combo_time(&mut self, combo_time_ms: u64) {
        self.combo_time_ms = combo_time_ms;
    }

    fn handle_events(&mut self) {
        while self.position < self.queue.len() {
            self.handle_next_event();
        }
    }

    fn on_timeout(&mut self, token: u64) {
        if !self.timer.is_current(token) {
            return;
        }
        if self.state == ComboState::Wait {
            log::debug!("ComboHandler: combo timed out");
            self.state = ComboState::NoCombo;
            self.resolve();
            self.handle_events();
        }
    }

    fn handle_next_event(&mut self) {
        let event = self.queue[self.position].event;
        log::debug!("ComboHandler: handling event: {}", self.queue[self.position]);

        if event.is_press {
            if let Some(layer) = self.check_for_combo_binding(self.position) {
                if self.state != ComboState::Wait {
                    log::debug!("ComboHandler: activating hold back");
                    self.state = ComboState::Wait;
                    self.candidates = Some((layer, event.code));

                    // time already spent since the press counts against the
                    // combo window
                    let timeout = Duration::from_millis(self.combo_time_ms)
                        .saturating_sub(event.time.elapsed());
                    let token = self.timer.arm();
                    timer::schedule(timeout, self.self_ref.clone(), move |h| {
                        h.on_timeout(token)
                    });
                }
            }
        } else if self.state == ComboState::Wait && self.queue[0].event.code == event.code {
            // the first key was released before a second key completed the
            // combo
            self.state = ComboState::NoCombo;
        }

        // a second key decides between combo and no combo
        if self.state == ComboState::Wait && event.code != self.queue[0].event.code {
            if event.is_press {
                match self.candidate_binding(event.code) {
                    Some(binding) => {
                        self.queue[0].binding = Some(binding);
                        self.queue[self.position].binding = Some(Binding::Nop);
                        self.state = ComboState::Combo;
                    }
                    None => self.state = ComboState::NoCombo,
                }
            } else {
                self.state = ComboState::NoCombo;
            }
        }

        match self.state {
            ComboState::NoCombo | ComboState::Combo => self.resolve(),
            ComboState::Idle => {
                let eb = self.queue.remove(self.position);
                self.next.lock().handle_event(eb);
            }
            ComboState::Wait => self.position += 1,
        }
    }

    /// Forwards the first queued event (the combo trigger) with whatever
    /// binding was attached and restarts processing from the front of the
    /// queue.
    fn resolve(&mut self) {
        self.timer.disarm();

        let eb = self.queue.remove(0);
        match self.state {
            ComboState::Combo => log::debug!("ComboHandler: combo binding activated"),
            _ => log::debug!("ComboHandler: no combo"),
        }
        self.next.lock().handle_event(eb);

        self.state = ComboState::Idle;
        self.candidates = None;
        self.position = 0;
    }

    /// Returns the current layer if the queued event at `position` has no
    /// binding yet and the layer registers combos for its key.
    fn check_for_combo_binding(&self, position: usize) -> Option<Arc<Layer>> {
        let eb = &self.queue[position];
        if eb.binding.is_some() {
            return None;
        }
        let layer = self.layers.lock().current_layer();
        if layer.combo_bindings.contains_key(&eb.event.code) {
            Some(layer)
        } else {
            None
        }
    }

    fn candidate_binding(&self, code: u16) -> Option<Binding> {
        let (layer, trigger) = self.candidates.as_ref()?;
        layer.combo_bindings.get(trigger)?.get(&code).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::check_scenarios;

    fn combo_handler(combo_time_ms: u64) -> impl Fn(SharedLayers, SharedHandler) -> SharedHandler {
        move |layers, next| {
            let handler: SharedHandler = ComboHandler::new_shared(combo_time_ms, layers, next);
            handler
        }
    }

    #[test]
    fn unmapped_keys_pass_through() {
        let config = "
layers:
- name: 1
  bindings:
    a+b: x
";
        check_scenarios(
            config,
            combo_handler(10),
            &[
                ("Pc Rc", "Pc Rc"),
                ("Pd Pc Rd Rc", "Pd Pc Rd Rc"),
                // an event that already carries a binding cannot start a combo
                ("Pa:Km 15 Ra", "Pa:Km Ra"),
            ],
        );
    }

    #[test]
    fn combo_detection() {
        let config = "
layers:
- name: 1
  bindings:
    a+b: x
    c: c
";
        check_scenarios(
            config,
            combo_handler(10),
            &[
                ("Pa Ra", "Pa Ra"), // not triggered
                ("Pb Rb", "Pb Rb"),
                ("Pa Ra Pb Rb", "Pa Ra Pb Rb"),
                ("Pa 15 Pb Ra Rb", "Pa Pb Ra Rb"), // too slow
                ("Pa Pc Pb Ra Rb Rc", "Pa Pc Pb Ra Rb Rc"), // interrupted by another key
                ("Pc Pa Rc Pb Ra Rb", "Pc Pa Rc Pb Ra Rb"),
                ("Pa Pb Ra Rb", "Pa:Kx Pb:N Ra Rb"), // triggered
                ("Pb Pa Rb Ra", "Pb:Kx Pa:N Rb Ra"),
                ("Pb Pa Ra Rb", "Pb:Kx Pa:N Ra Rb"),
            ],
        );
    }

    #[test]
    fn combo_with_layer_switch() {
        let config = "
layers:
- name: 1
  bindings:
    a+b: toggle-layer 2
    c: c
- name: 2
  bindings:
    d: d
    e+f: y
";
        check_scenarios(
            config,
            combo_handler(10),
            &[
                ("Pa Pb Ra Rb", "Pa:L2 Pb:N Ra Rb"),
                ("Pa Pb Pd Ra Rb Rd", "Pa:L2 Pb:N Pd Ra Rb Rd"),
                ("Pa Pb Pe Pf Re Rf Ra Rb", "Pa:L2 Pb:N Pe:Ky Pf:N Re Rf Ra Rb"),
                ("Pa Pb 15 Pe Pf Re Rf Ra Rb", "Pa:L2 Pb:N Pe:Ky Pf:N Re Rf Ra Rb"),
            ],
        );
    }
}
