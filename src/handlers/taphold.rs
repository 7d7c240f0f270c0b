//! Tap-hold resolution: a key bound to `tap-hold` gets its tap or hold
//! binding depending on the release timing, the configured timeout, and
//! (for the `-next` variants) what other keys do while the decision is
//! pending. Undecided events are held back in a queue and replayed once
//! the decision is made.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cfg::{Binding, TapHoldBinding};
use crate::handlers::timer::{self, TimerSlot};
use crate::handlers::{EventHandler, SharedHandler, SharedLayers};
use crate::keyevent::{EventBinding, KeyEvent};
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapHoldState {
    Idle,
    Wait,
    Tap,
    Hold,
}

pub struct TapHoldHandler {
    quick_tap_time_ms: u64,

    queue: Vec<EventBinding>,
    position: usize,

    /// Keys that are physically down, as seen by the stages downstream of
    /// this one. Updated exactly when an event is forwarded.
    is_pressed: FxHashSet<u16>,
    last_pressed: FxHashMap<u16, Instant>,

    state: TapHoldState,
    active: Option<TapHoldBinding>,
    timer: TimerSlot,
    /// Snapshot of `is_pressed` taken when the hold-back started. Releases
    /// of these keys do not decide tap-on-next-release and are forwarded
    /// out of order to avoid auto-repeat on the physical keyboard.
    hold_back_start_is_pressed: FxHashSet<u16>,

    layers: SharedLayers,
    next: SharedHandler,
    self_ref: Weak<Mutex<TapHoldHandler>>,
}

impl EventHandler for TapHoldHandler {
    fn handle_event(&mut self, event: EventBinding) {
        self.queue.push(event);
        self.handle_events();
    }
}

impl TapHoldHandler {
    pub fn new_shared(
        quick_tap_time_ms: u64,
        layers: SharedLayers,
        next: SharedHandler,
    ) -> Arc<Mutex<Self>> {
        timer::new_shared(|self_ref| Self {
            quick_tap_time_ms,
            queue: Vec::new(),
            position: 0,
            is_pressed: FxHashSet::default(),
            last_pressed: FxHashMap::default(),
            state: TapHoldState::Idle,
            active: None,
            timer: TimerSlot::new(),
            hold_back_start_is_pressed: FxHashSet::default(),
            layers,
            next,
            self_ref,
        })
    }

    pub fn set_quick_tap_time(&mut self, quick_tap_time_ms: u64) {
        self.quick_tap_time_ms = quick_tap_time_ms;
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
        log::debug!("TapHoldHandler: tap-hold timed out");
        self.state = TapHoldState::Hold;
        self.resolve_tap_hold();
        self.handle_events();
    }

    fn handle_next_event(&mut self) {
        let event = self.queue[self.position].event;
        log::debug!(
            "TapHoldHandler: handling event: {}",
            self.queue[self.position]
        );

        if event.is_press {
            if let Some(binding) = self.check_for_tap_hold_binding(self.position) {
                // a second tap-hold press while one is pending stays queued
                // and is handled after the current one resolves
                if self.state != TapHoldState::Wait {
                    log::debug!("TapHoldHandler: activating hold back");
                    self.state = TapHoldState::Wait;
                    self.hold_back_start_is_pressed = self.is_pressed.clone();

                    if binding.timeout_ms > 0 {
                        // time already spent since the press counts against
                        // the timeout
                        let timeout = Duration::from_millis(binding.timeout_ms)
                            .saturating_sub(event.time.elapsed());
                        let token = self.timer.arm();
                        timer::schedule(timeout, self.self_ref.clone(), move |h| {
                            h.on_timeout(token)
                        });
                    }

                    // a quick re-tap forces the tap outcome
                    let recently_pressed = self.last_pressed.get(&event.code).is_some_and(|t| {
                        event.time < *t + Duration::from_millis(self.quick_tap_time_ms)
                    });
                    self.active = Some(binding);
                    if recently_pressed {
                        log::debug!("TapHoldHandler: quick tap detected");
                        self.state = TapHoldState::Tap;
                    }
                }
            }
        } else if self.state == TapHoldState::Wait
            && self.active.is_some()
            && self.queue[0].event.code == event.code
        {
            // the tap-hold key itself was released
            self.state = TapHoldState::Tap;
        }

        if self.state == TapHoldState::Wait && event.code != self.queue[0].event.code {
            if let Some(active) = &self.active {
                if event.is_press {
                    if active.tap_on_next {
                        self.state = TapHoldState::Hold;
                    }
                } else if active.tap_on_next_release
                    && !self.hold_back_start_is_pressed.contains(&event.code)
                {
                    // releases of keys that were already down before the
                    // hold back started do not count
                    self.state = TapHoldState::Hold;
                }
            }
        }

        match self.state {
            TapHoldState::Tap | TapHoldState::Hold => self.resolve_tap_hold(),
            TapHoldState::Idle => self.event_handled(self.position),
            TapHoldState::Wait => {
                let was_pressed = self.hold_back_start_is_pressed.contains(&event.code);
                if !event.is_press && was_pressed {
                    // forward out of queue order so the key does not stay
                    // down on the output until the decision is made
                    log::debug!(
                        "TapHoldHandler: forwarding release of {} which was pressed before \
                         the hold back started",
                        keys::display_name(event.code)
                    );
                    self.event_handled(self.position);
                } else {
                    self.position += 1;
                }
            }
        }
    }

    /// Attaches the decided binding to the tap-hold press (the first queued
    /// event), forwards it, and replays the rest of the queue.
    fn resolve_tap_hold(&mut self) {
        if self.state != TapHoldState::Tap && self.state != TapHoldState::Hold {
            log::error!("TapHoldHandler: resolve called in state {:?}", self.state);
            self.state = TapHoldState::Idle;
            return;
        }

        self.timer.disarm();

        if self.queue.is_empty() {
            log::error!("TapHoldHandler: resolve called with an empty queue");
            self.state = TapHoldState::Idle;
            self.active = None;
            self.position = 0;
            return;
        }
        let Some(active) = self.active.take() else {
            log::error!("TapHoldHandler: resolve without an active binding");
            self.state = TapHoldState::Idle;
            self.position = 0;
            return;
        };

        let binding = if self.state == TapHoldState::Hold {
            log::debug!("TapHoldHandler: activated hold binding");
            active.hold
        } else {
            log::debug!("TapHoldHandler: activated tap binding");
            active.tap
        };
        self.queue[0].binding = Some(binding);
        self.event_handled(0);

        self.state = TapHoldState::Idle;
        self.position = 0;
    }

    /// The binding a press would resolve to: either one already attached
    /// upstream or the current layer's mapping for the key. Only returns
    /// tap-hold bindings.
    fn check_for_tap_hold_binding(&self, position: usize) -> Option<TapHoldBinding> {
        let eb = &self.queue[position];
        let mapped = match &eb.binding {
            Some(binding) => Some(binding.clone()),
            None => {
                let layer = self.layers.lock().current_layer();
                layer.bindings.get(&eb.event.code).cloned()
            }
        };
        match mapped {
            Some(Binding::TapHold(binding)) => Some(*binding),
            _ => None,
        }
    }

    /// Forwards the event at `position`, removing it from the queue and
    /// updating the pressed-key accounting.
    fn event_handled(&mut self, position: usize) {
        if position >= self.queue.len() {
            log::error!(
                "TapHoldHandler: event_handled called with position {position} but the queue \
                 holds {} events",
                self.queue.len()
            );
            return;
        }
        let eb = self.queue.remove(position);
        self.set_key_pressed(&eb.event);
        self.next.lock().handle_event(eb);
    }

    fn set_key_pressed(&mut self, event: &KeyEvent) {
        if event.is_press {
            self.is_pressed.insert(event.code);
            self.last_pressed.insert(event.code, event.time);
        } else {
            self.is_pressed.remove(&event.code);
            self.hold_back_start_is_pressed.remove(&event.code);
        }
    }
}
