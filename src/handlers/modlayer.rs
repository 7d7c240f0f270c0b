//! Mod-layer handling: a key that acts as a modifier while held, except
//! that keys mapped in the associated layer temporarily lift the modifier
//! and execute their layer binding instead.
//!
//! Unlike toggle-layer this never changes the current layer; the handler
//! intercepts presses of mapped keys itself.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cfg::{Binding, Layer};
use crate::handlers::{EventHandler, SharedHandler, SharedLayers};
use crate::keyevent::EventBinding;
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModLayerState {
    Idle,
    /// The modifier is down and no layer key is pressed.
    ModActive,
    /// At least one layer key is pressed; the modifier has been lifted.
    LayerActive,
}

pub struct ModLayerHandler {
    state: ModLayerState,
    modifier: u16,
    trigger_key: u16,
    layer: Option<Arc<Layer>>,
    original_layer: Option<Arc<Layer>>,
    pressed_layer_keys: rustc_hash::FxHashSet<u16>,

    layers: SharedLayers,
    next: SharedHandler,
}

impl ModLayerHandler {
    pub fn new_shared(layers: SharedLayers, next: SharedHandler) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            state: ModLayerState::Idle,
            modifier: 0,
            trigger_key: 0,
            layer: None,
            original_layer: None,
            pressed_layer_keys: rustc_hash::FxHashSet::default(),
            layers,
            next,
        }))
    }

    fn handle_press(&mut self, eb: &mut EventBinding) {
        let event = eb.event;

        if let Some((modifier, layer_name)) = self.check_for_mod_layer_binding(eb) {
            log::debug!("ModLayerHandler: pressing modifier {}", keys::display_name(modifier));
            eb.binding = Some(Binding::Key(vec![modifier]));

            // only one mod binding can be active at a time
            if self.state == ModLayerState::Idle {
                let found_layer = self.layers.lock().layer(&layer_name);
                match found_layer {
                    None => log::warn!("ModLayerHandler: layer does not exist: {layer_name}"),
                    Some(layer) => {
                        self.state = ModLayerState::ModActive;
                        self.modifier = modifier;
                        self.trigger_key = event.code;
                        self.layer = Some(layer);
                        self.original_layer = Some(self.layers.lock().current_layer());
                        self.pressed_layer_keys.clear();
                    }
                }
            }
            return;
        }

        if self.state == ModLayerState::Idle {
            return;
        }
        // a layer switch since the trigger press disables interception
        let current = self.layers.lock().current_layer();
        if !self
            .original_layer
            .as_ref()
            .is_some_and(|l| Arc::ptr_eq(l, &current))
        {
            return;
        }
        let Some(binding) = self
            .layer
            .as_ref()
            .and_then(|l| l.bindings.get(&event.code).cloned())
        else {
            return;
        };

        self.pressed_layer_keys.insert(event.code);
        if self.state == ModLayerState::ModActive {
            // lift the modifier before the layer binding executes
            self.state = ModLayerState::LayerActive;
            eb.binding = Some(Binding::Multi(vec![
                Binding::KeyRelease(self.modifier),
                binding,
            ]));
        } else {
            eb.binding = Some(binding);
        }
    }

    fn handle_release(&mut self, eb: &mut EventBinding) {
        if self.state == ModLayerState::Idle {
            return;
        }
        let event = eb.event;

        // once no layer key is held anymore the modifier goes back down
        if self.pressed_layer_keys.remove(&event.code)
            && self.state == ModLayerState::LayerActive
            && self.pressed_layer_keys.is_empty()
        {
            self.state = ModLayerState::ModActive;
            eb.binding = Some(Binding::KeyPress(self.modifier));
        }

        if self.trigger_key == event.code {
            log::debug!("ModLayerHandler: done due to release of the modifier key");
            self.state = ModLayerState::Idle;
            self.layer = None;
            self.original_layer = None;
            self.pressed_layer_keys.clear();
        }
    }

    /// The mod-layer binding a press resolves to: either attached upstream
    /// or mapped in the current layer.
    fn check_for_mod_layer_binding(&self, eb: &EventBinding) -> Option<(u16, String)> {
        let mapped = match &eb.binding {
            Some(binding) => Some(binding.clone()),
            None => {
                let layer = self.layers.lock().current_layer();
                layer.bindings.get(&eb.event.code).cloned()
            }
        };
        match mapped {
            Some(Binding::ModLayer { modifier, layer }) => Some((modifier, layer)),
            _ => None,
        }
    }
}

impl EventHandler for ModLayerHandler {
    fn handle_event(&mut self, mut eb: EventBinding) {
        log::debug!("ModLayerHandler: handling event: {eb}");
        if eb.event.is_press {
            self.handle_press(&mut eb);
        } else {
            self.handle_release(&mut eb);
        }
        self.next.lock().handle_event(eb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::handlers::testutil::HandlerMock;
    use crate::keyevent::KeyEvent;

    const CONFIG: &str = "
layers:
- name: 1
  bindings:
    capslock: mod-layer leftctrl ctrl
- name: ctrl
  bindings:
    j: down
";

    fn setup() -> (Arc<Mutex<HandlerMock>>, SharedHandler) {
        let cfg = Cfg::parse_str(CONFIG).unwrap();
        let mock = Arc::new(Mutex::new(HandlerMock::new(&cfg)));
        let handler: SharedHandler = ModLayerHandler::new_shared(mock.clone(), mock.clone());
        (mock, handler)
    }

    fn key(alias: &str) -> u16 {
        keys::code_from_alias(alias).unwrap()
    }

    #[test]
    fn modifier_press_and_release() {
        let (mock, handler) = setup();
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("capslock"))));
        handler.lock().handle_event(EventBinding::new(KeyEvent::release(key("capslock"))));

        let outputs = mock.lock().outputs.clone();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].binding, Some(Binding::Key(vec![key("leftctrl")])));
        // the release is forwarded unchanged; the executor pairs it up
        assert_eq!(outputs[1].binding, None);
    }

    #[test]
    fn layer_key_lifts_the_modifier() {
        let (mock, handler) = setup();
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("capslock"))));
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("j"))));
        handler.lock().handle_event(EventBinding::new(KeyEvent::release(key("j"))));
        handler.lock().handle_event(EventBinding::new(KeyEvent::release(key("capslock"))));
        // after the trigger is released the handler is idle again and j is
        // not intercepted anymore
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("j"))));

        let outputs = mock.lock().outputs.clone();
        assert_eq!(outputs.len(), 5);
        assert_eq!(
            outputs[1].binding,
            Some(Binding::Multi(vec![
                Binding::KeyRelease(key("leftctrl")),
                Binding::Key(vec![key("down")]),
            ]))
        );
        assert_eq!(outputs[2].binding, Some(Binding::KeyPress(key("leftctrl"))));
        assert_eq!(outputs[3].binding, None);
        assert_eq!(outputs[4].binding, None);
    }

    #[test]
    fn keys_outside_the_layer_pass_through() {
        let (mock, handler) = setup();
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("capslock"))));
        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("h"))));

        let outputs = mock.lock().outputs.clone();
        assert_eq!(outputs[1].binding, None);
    }

    #[test]
    fn unknown_layer_still_presses_the_modifier() {
        let cfg = Cfg::parse_str(
            "
layers:
- name: 1
  bindings:
    capslock: mod-layer leftctrl nosuch
",
        )
        .unwrap();
        let mock = Arc::new(Mutex::new(HandlerMock::new(&cfg)));
        let handler = ModLayerHandler::new_shared(mock.clone(), mock.clone());

        handler.lock().handle_event(EventBinding::new(KeyEvent::press(key("capslock"))));
        let outputs = mock.lock().outputs.clone();
        assert_eq!(outputs[0].binding, Some(Binding::Key(vec![key("leftctrl")])));
    }
}
