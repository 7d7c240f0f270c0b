//! The end of the pipeline: executes resolved bindings against the
//! synthetic devices, runs commands, and owns the layer state.

use std::process::Command;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cfg::{Binding, Cfg, Layer};
use crate::handlers::{EventHandler, LayerManager};
use crate::keyevent::EventBinding;
use crate::keys::{self, WILDCARD_KEY};
use crate::vkbd::VirtualKeyboard;
use crate::vmouse::VirtualMouse;

/// Temporary layer switches, newest last. Releasing any entry's trigger
/// key drops that entry and everything stacked on top of it.
#[derive(Default)]
struct ToggleStack {
    keys: Vec<u16>,
    previous: Vec<Arc<Layer>>,
}

impl ToggleStack {
    fn push(&mut self, key: u16, previous: Arc<Layer>) {
        self.keys.push(key);
        self.previous.push(previous);
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.previous.clear();
    }

    /// The layer to restore when `key` is released, unwinding every toggle
    /// stacked after it.
    fn pop_for_release(&mut self, key: u16) -> Option<Arc<Layer>> {
        let index = self.keys.iter().position(|k| *k == key)?;
        let restore = self.previous[index].clone();
        self.keys.truncate(index);
        self.previous.truncate(index);
        Some(restore)
    }
}

pub struct BindingExecutor {
    cfg: Arc<Cfg>,
    keyboard: VirtualKeyboard,
    mouse: Arc<VirtualMouse>,
    reload_requests: Sender<()>,

    current_layer: Arc<Layer>,
    toggle_stack: ToggleStack,
    /// Release commands of active exec-press-release bindings, keyed by
    /// the code that triggered them.
    exec_press_release_active: FxHashMap<u16, String>,
}

impl BindingExecutor {
    pub fn new_shared(
        cfg: Arc<Cfg>,
        keyboard: VirtualKeyboard,
        mouse: Arc<VirtualMouse>,
        reload_requests: Sender<()>,
    ) -> Arc<Mutex<Self>> {
        let current_layer = cfg.base_layer().clone();
        Arc::new(Mutex::new(Self {
            cfg,
            keyboard,
            mouse,
            reload_requests,
            current_layer,
            toggle_stack: ToggleStack::default(),
            exec_press_release_active: FxHashMap::default(),
        }))
    }

    /// Swaps in a reloaded configuration. The current layer carries over by
    /// name when it still exists; queued events upstream keep their `Arc`
    /// references to the old layers until they drain.
    pub fn set_config(&mut self, cfg: Arc<Cfg>) {
        self.toggle_stack.clear();
        self.exec_press_release_active.clear();
        self.current_layer = match cfg.layer(&self.current_layer.name) {
            Some(layer) => layer.clone(),
            None => cfg.base_layer().clone(),
        };
        self.cfg = cfg;
    }

    fn execute_binding(&mut self, binding: &Binding, cause: u16) {
        log::debug!("executing {binding} (caused by {})", keys::display_name(cause));

        match binding {
            Binding::Multi(children) => {
                for child in children {
                    self.execute_binding(child, cause);
                }
            }
            Binding::Key(combo) => {
                // any wildcard stands for the key that was pressed
                let codes: Vec<u16> = combo
                    .iter()
                    .map(|c| if *c == WILDCARD_KEY { cause } else { *c })
                    .collect();
                self.keyboard.press_keys(cause, &codes);
            }
            Binding::KeyPress(code) => self.keyboard.press_key_manually(*code),
            Binding::KeyRelease(code) => self.keyboard.release_key_manually(*code),
            Binding::Move { x, y } => self.mouse.set_move(cause, *x, *y),
            Binding::Scroll { x, y } => self.mouse.set_scroll(cause, *x, *y),
            Binding::Speed(factor) => self.mouse.set_speed_factor(cause, *factor),
            Binding::Button(button) => self.mouse.button_press(cause, *button),
            Binding::Layer(name) => {
                // a permanent switch discards all temporary toggles
                self.toggle_stack.clear();
                match self.cfg.layer(name).cloned() {
                    Some(layer) => self.go_to_layer(layer),
                    None => log::warn!("layer does not exist: {name}"),
                }
            }
            Binding::ToggleLayer(name) => match self.cfg.layer(name).cloned() {
                Some(layer) => {
                    self.toggle_stack.push(cause, self.current_layer.clone());
                    self.go_to_layer(layer);
                }
                None => log::warn!("layer does not exist: {name}"),
            },
            Binding::ModLayer { .. } => {
                // rewritten into key bindings by the mod-layer handler
                log::warn!("mod-layer binding reached the executor unresolved");
            }
            Binding::Exec(command) => run_command(command.clone(), Some(cause)),
            Binding::ExecPressRelease { press, release } => {
                self.exec_press_release_active
                    .insert(cause, release.clone());
                run_command(press.clone(), Some(cause));
            }
            Binding::ReloadConfig => {
                // coalesced: a pending request is good enough
                let _ = self.reload_requests.try_send(());
            }
            Binding::TapHold(_) => {
                log::warn!("tap-hold binding reached the executor unresolved");
            }
            Binding::Nop => {}
        }
    }

    fn key_released(&mut self, code: u16) {
        if let Some(layer) = self.toggle_stack.pop_for_release(code) {
            self.go_to_layer(layer);
        }

        if let Some(release_command) = self.exec_press_release_active.remove(&code) {
            run_command(release_command, Some(code));
        }

        // release everything this key caused on the synthetic devices
        self.keyboard.original_key_up(code);
        self.mouse.original_key_up(code);
    }

    fn go_to_layer(&mut self, layer: Arc<Layer>) {
        if let Some(command) = &self.current_layer.exit_command {
            run_command(command.clone(), None);
        }
        log::debug!("switching to layer {}", layer.name);
        self.current_layer = layer;
        if let Some(command) = &self.current_layer.enter_command {
            run_command(command.clone(), None);
        }
    }
}

impl EventHandler for BindingExecutor {
    fn handle_event(&mut self, eb: EventBinding) {
        if let Some(binding) = &eb.binding {
            self.execute_binding(binding, eb.event.code);
        }
        if !eb.event.is_press {
            self.key_released(eb.event.code);
        }
    }
}

impl LayerManager for BindingExecutor {
    fn current_layer(&self) -> Arc<Layer> {
        self.current_layer.clone()
    }

    fn base_layer(&self) -> Arc<Layer> {
        self.cfg.base_layer().clone()
    }

    fn layer(&self, name: &str) -> Option<Arc<Layer>> {
        self.cfg.layer(name).cloned()
    }
}

/// Runs a shell command in the background and logs failures with their
/// stderr. Exec bindings pass the triggering key through the environment.
fn run_command(command: String, cause: Option<u16>) {
    log::debug!("executing command: {command}");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command);
    if let Some(code) = cause {
        cmd.env("key", keys::alias_from_code(code).unwrap_or("unknown"))
            .env("key_code", code.to_string());
    }
    let spawned = thread::Builder::new().name("exec".into()).spawn(move || {
        match cmd.output() {
            Ok(output) if !output.status.success() => {
                log::warn!(
                    "execution of command '{command}' failed: {}, stderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("execution of command '{command}' failed: {e}"),
        }
    });
    if let Err(e) = spawned {
        log::warn!("failed to spawn a command thread: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> Arc<Layer> {
        Arc::new(Layer {
            name: name.to_string(),
            pass_through: true,
            ..Layer::default()
        })
    }

    #[test]
    fn toggle_stack_restores_in_order() {
        let mut stack = ToggleStack::default();
        let base = layer("base");
        let nav = layer("nav");

        stack.push(10, base.clone());
        stack.push(11, nav.clone());

        // releasing the newest toggle restores its previous layer
        let restored = stack.pop_for_release(11).unwrap();
        assert!(Arc::ptr_eq(&restored, &nav));
        // the older entry is still there
        let restored = stack.pop_for_release(10).unwrap();
        assert!(Arc::ptr_eq(&restored, &base));
        assert!(stack.pop_for_release(10).is_none());
    }

    #[test]
    fn toggle_stack_release_unwinds_everything_above() {
        let mut stack = ToggleStack::default();
        let base = layer("base");
        let nav = layer("nav");
        let num = layer("num");

        stack.push(10, base.clone());
        stack.push(11, nav);
        stack.push(12, num);

        // releasing the oldest trigger drops the two newer entries as well
        let restored = stack.pop_for_release(10).unwrap();
        assert!(Arc::ptr_eq(&restored, &base));
        assert!(stack.pop_for_release(11).is_none());
        assert!(stack.pop_for_release(12).is_none());
    }

    #[test]
    fn toggle_stack_ignores_unrelated_releases() {
        let mut stack = ToggleStack::default();
        stack.push(10, layer("base"));
        assert!(stack.pop_for_release(99).is_none());
        assert!(stack.pop_for_release(10).is_some());
    }
}
