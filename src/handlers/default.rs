//! The last resolver: presses that are still unbound get the current
//! layer's mapping, the escape-to-base fallback, the wildcard binding, or
//! an identity pass-through.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cfg::Binding;
use crate::handlers::{EventHandler, SharedHandler, SharedLayers};
use crate::keyevent::EventBinding;
use crate::keys;

pub struct DefaultHandler {
    layers: SharedLayers,
    next: SharedHandler,
}

impl DefaultHandler {
    pub fn new_shared(layers: SharedLayers, next: SharedHandler) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { layers, next }))
    }
}

impl EventHandler for DefaultHandler {
    fn handle_event(&mut self, mut eb: EventBinding) {
        log::debug!("DefaultHandler: handling event: {eb}");
        let event = eb.event;

        if event.is_press && eb.binding.is_none() {
            let (current, base) = {
                let lm = self.layers.lock();
                (lm.current_layer(), lm.base_layer())
            };

            let mut binding = current.bindings.get(&event.code).cloned();

            // escape always leads back to the base layer, unless mapped to
            // something else
            if binding.is_none()
                && event.code == keys::KEY_ESC
                && !Arc::ptr_eq(&current, &base)
            {
                binding = Some(Binding::Layer(base.name.clone()));
            }

            if binding.is_none() {
                binding = current.wildcard_binding.clone();
            }

            if binding.is_none() && current.pass_through {
                binding = Some(Binding::Key(vec![event.code]));
            }

            eb.binding = binding;
        }

        self.next.lock().handle_event(eb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::handlers::testutil::{check_scenarios, HandlerMock};
    use crate::keyevent::KeyEvent;

    fn default_handler() -> impl Fn(SharedLayers, SharedHandler) -> SharedHandler {
        |layers, next| {
            let handler: SharedHandler = DefaultHandler::new_shared(layers, next);
            handler
        }
    }

    #[test]
    fn resolution_order() {
        let config = "
layers:
- name: 1
  bindings:
    s: toggle-layer 2
    x: y
- name: 2
  passThrough: false
  bindings:
    a: m
";
        check_scenarios(
            config,
            default_handler(),
            &[
                ("Px Rx", "Px:Ky Rx"),           // mapped key
                ("Pc Rc", "Pc:Kc Rc"),           // pass-through synthesizes identity
                ("Ps Pa Ra Rs", "Ps:L2 Pa:Km Ra Rs"), // lookup follows the current layer
                ("Ps Pc Rc Rs", "Ps:L2 Pc Rc Rs"), // no pass-through: stays unbound
            ],
        );
    }

    #[test]
    fn wildcard_binding() {
        let config = "
layers:
- name: 1
  bindings:
    s: toggle-layer 2
- name: 2
  passThrough: false
  bindings:
    '*': nop
    a: m
";
        check_scenarios(
            config,
            default_handler(),
            &[
                ("Ps Pc Rc Rs", "Ps:L2 Pc:N Rc Rs"),
                ("Ps Pa Ra Rs", "Ps:L2 Pa:Km Ra Rs"), // direct mapping wins over wildcard
            ],
        );
    }

    #[test]
    fn escape_leads_back_to_the_base_layer() {
        let cfg = Cfg::parse_str(
            "
layers:
- name: 1
  bindings:
    s: toggle-layer 2
- name: 2
  passThrough: false
",
        )
        .unwrap();
        let mock = Arc::new(Mutex::new(HandlerMock::new(&cfg)));
        let handler = DefaultHandler::new_shared(mock.clone(), mock.clone());

        // escape in the base layer just passes through
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(keys::KEY_ESC)));
        // switch to layer 2, escape now resolves to a layer binding
        let s = keys::code_from_alias("s").unwrap();
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(s)));
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(keys::KEY_ESC)));

        let outputs = mock.lock().outputs.clone();
        assert_eq!(outputs[0].binding, Some(Binding::Key(vec![keys::KEY_ESC])));
        assert_eq!(outputs[2].binding, Some(Binding::Layer("1".into())));
    }
}
