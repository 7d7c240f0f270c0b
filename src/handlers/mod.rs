//! The event-transformation pipeline.
//!
//! Events flow through a chain of handlers, each of which may hold events
//! back, attach a binding, or forward them downstream:
//!
//! combo -> tap-hold -> mod-layer -> default -> executor
//!
//! Handlers are shared behind `Arc<Mutex<_>>` so that timer callbacks can
//! re-enter them. Locks are only ever taken in chain order (upstream to
//! downstream), which keeps the chain deadlock free.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cfg::Layer;
use crate::keyevent::EventBinding;

mod combo;
mod default;
mod modlayer;
mod taphold;
pub mod timer;

pub use combo::ComboHandler;
pub use default::DefaultHandler;
pub use modlayer::ModLayerHandler;
pub use taphold::TapHoldHandler;

/// A stage in the pipeline. Forwarding an event means calling
/// `handle_event` on the next stage.
pub trait EventHandler: Send {
    fn handle_event(&mut self, event: EventBinding);
}

/// Read access to the layer state owned by the executor. Resolvers consult
/// this to look up bindings in the current layer.
pub trait LayerManager: Send {
    fn current_layer(&self) -> Arc<Layer>;
    fn base_layer(&self) -> Arc<Layer>;
    fn layer(&self, name: &str) -> Option<Arc<Layer>>;
}

pub type SharedHandler = Arc<Mutex<dyn EventHandler>>;
pub type SharedLayers = Arc<Mutex<dyn LayerManager>>;

#[cfg(test)]
mod tests {
    //! Tests of the staged chain: the combo resolver feeding the tap-hold
    //! resolver. A binding attached by an earlier stage must be preserved
    //! downstream, including combos that resolve to tap-hold bindings.

    use super::testutil::check_scenarios;
    use super::*;

    fn combo_then_tap_hold(
        combo_time_ms: u64,
        quick_tap_time_ms: u64,
    ) -> impl Fn(SharedLayers, SharedHandler) -> SharedHandler {
        move |layers, next| {
            let tap_hold: SharedHandler =
                TapHoldHandler::new_shared(quick_tap_time_ms, layers.clone(), next);
            let combo: SharedHandler = ComboHandler::new_shared(combo_time_ms, layers, tap_hold);
            combo
        }
    }

    #[test]
    fn combo_and_tap_hold_compose() {
        let config = "
layers:
- name: 1
  bindings:
    a+b: x
    c: tap-hold c ; z ; 10
    d+e: tap-hold m ; x ; 10
";
        check_scenarios(
            config,
            combo_then_tap_hold(10, 50),
            &[
                // each stage on its own
                ("Pa Pb Ra Rb", "Pa:Kx Pb:N Ra Rb"),
                ("Pc Rc", "Pc:Kc Rc"),
                ("Pc 15 Rc", "Pc:Kz Rc"),
                // a combo that resolves to a tap-hold binding: the second
                // stage must pick up the attached binding, not the layer's
                ("Pd Pe Rd Re", "Pd:Km Pe:N Rd Re"),
                ("Pd Pe 15 Rd Re", "Pd:Kx Pe:N Rd Re"),
                // no combo, both keys get their individual treatment
                ("Pa 15 Ra Pc Rc", "Pa Ra Pc:Kc Rc"),
            ],
        );
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scenario-table test harness shared by the handler tests.
    //!
    //! Events are written as a space separated string: `P<key>` is a press,
    //! `R<key>` a release, and a bare number sleeps that many milliseconds.
    //! Expected outputs additionally carry the resolved binding after a
    //! colon: `:K<key>` for a key binding, `:L<layer>` for toggle-layer and
    //! `:N` for nop, e.g. `"Pa:Kx Pb:N Ra Rb"`.

    use super::*;
    use crate::cfg::{Binding, Cfg};
    use crate::keyevent::KeyEvent;
    use crate::keys;

    /// Stands in for the rest of the chain: records everything forwarded to
    /// it and tracks the layer state the way the executor would, so that
    /// toggle-layer bindings chosen by a handler are reflected in later
    /// lookups.
    pub struct HandlerMock {
        layers: Vec<Arc<Layer>>,
        current: String,
        toggle_keys: Vec<u16>,
        toggle_previous: Vec<String>,
        pub outputs: Vec<EventBinding>,
    }

    impl HandlerMock {
        pub fn new(cfg: &Cfg) -> Self {
            Self {
                layers: cfg.layers.clone(),
                current: cfg.layers[0].name.clone(),
                toggle_keys: Vec::new(),
                toggle_previous: Vec::new(),
                outputs: Vec::new(),
            }
        }
    }

    impl EventHandler for HandlerMock {
        fn handle_event(&mut self, eb: EventBinding) {
            self.outputs.push(eb.clone());
            if eb.event.is_press {
                if let Some(Binding::ToggleLayer(name)) = &eb.binding {
                    self.toggle_keys.push(eb.event.code);
                    self.toggle_previous.push(self.current.clone());
                    self.current = name.clone();
                }
            } else if let Some(i) = self.toggle_keys.iter().position(|k| *k == eb.event.code) {
                self.current = self.toggle_previous[i].clone();
                self.toggle_keys.truncate(i);
                self.toggle_previous.truncate(i);
            }
        }
    }

    impl LayerManager for HandlerMock {
        fn current_layer(&self) -> Arc<Layer> {
            self.layer(&self.current)
                .unwrap_or_else(|| panic!("non existing layer: {}", self.current))
        }

        fn base_layer(&self) -> Arc<Layer> {
            self.layers[0].clone()
        }

        fn layer(&self, name: &str) -> Option<Arc<Layer>> {
            self.layers.iter().find(|l| l.name == name).cloned()
        }
    }

    fn parse_event_binding(s: &str) -> EventBinding {
        let (ev, binding) = match s.split_once(':') {
            Some((ev, b)) => (ev, Some(b)),
            None => (s, None),
        };
        let code = keys::code_from_alias(&ev[1..])
            .unwrap_or_else(|| panic!("unknown key alias in '{s}'"));
        let event = match &ev[..1] {
            "P" => KeyEvent::press(code),
            "R" => KeyEvent::release(code),
            other => panic!("unexpected event prefix '{other}'"),
        };
        let binding = binding.map(|b| match (&b[..1], &b[1..]) {
            ("K", alias) => Binding::Key(vec![keys::code_from_alias(alias).unwrap()]),
            ("L", layer) => Binding::ToggleLayer(layer.to_string()),
            ("N", "") => Binding::Nop,
            _ => panic!("unexpected binding notation '{b}'"),
        });
        EventBinding { event, binding }
    }

    fn feed_events_in(handler: &SharedHandler, events: &str) {
        for token in events.split_whitespace() {
            if token.starts_with('P') || token.starts_with('R') {
                let eb = parse_event_binding(token);
                handler.lock().handle_event(eb);
            } else {
                let ms: u64 = token
                    .parse()
                    .unwrap_or_else(|_| panic!("failed to parse milliseconds: {token}"));
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
        }
    }

    /// Runs every `(input, expected)` scenario against a fresh handler.
    pub fn check_scenarios<F>(config_str: &str, make_handler: F, cases: &[(&str, &str)])
    where
        F: Fn(SharedLayers, SharedHandler) -> SharedHandler,
    {
        let cfg = Cfg::parse_str(config_str).expect("config parses");
        for (input, expected) in cases {
            let mock = Arc::new(Mutex::new(HandlerMock::new(&cfg)));
            let layers: SharedLayers = mock.clone();
            let next: SharedHandler = mock.clone();
            let handler = make_handler(layers, next);

            feed_events_in(&handler, input);

            let expected: Vec<EventBinding> = expected
                .split_whitespace()
                .map(parse_event_binding)
                .collect();
            let outputs = mock.lock().outputs.clone();
            let rendered = |ebs: &[EventBinding]| {
                ebs.iter()
                    .map(|eb| eb.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            assert_eq!(
                outputs.len(),
                expected.len(),
                "scenario ({input}) expected [{}] but got [{}]",
                rendered(&expected),
                rendered(&outputs),
            );
            for (i, (exp, act)) in expected.iter().zip(outputs.iter()).enumerate() {
                assert!(
                    exp.event.code == act.event.code
                        && exp.event.is_press == act.event.is_press
                        && exp.binding == act.binding,
                    "scenario ({input}) expected {exp} but got {act} at index {i}",
                );
            }
        }
    }
}
