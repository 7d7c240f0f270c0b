//! The synthetic mouse: integrates the move/scroll/speed intents declared
//! by active bindings into pointer and wheel events.
//!
//! A dedicated loop thread ticks at the configured interval while there is
//! anything to do. When all intents are gone and the velocity has decayed
//! to zero the timer is left unarmed and the loop blocks on a wake channel
//! that is pulsed whenever an intent changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cfg::{Cfg, MouseButton};
use crate::oskbd::MouseOut;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Vec2 {
    x: f64,
    y: f64,
}

impl Vec2 {
    fn add(&mut self, other: Vec2) {
        self.x += other.x;
        self.y += other.y;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MouseParams {
    pub loop_interval: Duration,
    pub base_mouse_speed: f64,
    pub start_mouse_speed: f64,
    pub acceleration_curve: f64,
    pub acceleration_time: f64,
    pub deceleration_curve: f64,
    pub deceleration_time: f64,
    pub base_scroll_speed: f64,
}

impl MouseParams {
    pub fn from_cfg(cfg: &Cfg) -> Self {
        Self {
            loop_interval: Duration::from_millis(cfg.mouse_loop_interval_ms),
            base_mouse_speed: cfg.base_mouse_speed,
            start_mouse_speed: cfg.start_mouse_speed,
            acceleration_curve: cfg.mouse_acceleration_curve,
            acceleration_time: cfg.mouse_acceleration_time,
            deceleration_curve: cfg.mouse_deceleration_curve,
            deceleration_time: cfg.mouse_deceleration_time,
            base_scroll_speed: cfg.base_scroll_speed,
        }
    }
}

struct MouseState {
    out: MouseOut,
    params: MouseParams,

    buttons_by_keys: FxHashMap<u16, MouseButton>,
    is_button_pressed: FxHashSet<MouseButton>,
    move_by_keys: FxHashMap<u16, Vec2>,
    scroll_by_keys: FxHashMap<u16, Vec2>,
    speed_by_keys: FxHashMap<u16, f64>,

    velocity: Vec2,
    move_fraction: Vec2,
    scroll_fraction: Vec2,
    timer_armed: bool,
}

pub struct VirtualMouse {
    state: Mutex<MouseState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    running: AtomicBool,
}

impl VirtualMouse {
    pub fn new(params: MouseParams) -> std::io::Result<Arc<Self>> {
        let (wake_tx, wake_rx) = bounded(1);
        Ok(Arc::new(Self {
            state: Mutex::new(MouseState {
                out: MouseOut::new()?,
                params,
                buttons_by_keys: FxHashMap::default(),
                is_button_pressed: FxHashSet::default(),
                move_by_keys: FxHashMap::default(),
                scroll_by_keys: FxHashMap::default(),
                speed_by_keys: FxHashMap::default(),
                velocity: Vec2::default(),
                move_fraction: Vec2::default(),
                scroll_fraction: Vec2::default(),
                timer_armed: false,
            }),
            wake_tx,
            wake_rx,
            running: AtomicBool::new(true),
        }))
    }

    pub fn start_loop(self: Arc<Self>) {
        if let Err(e) = thread::Builder::new()
            .name("mouse-loop".into())
            .spawn(move || self.run_loop())
        {
            log::error!("failed to spawn the mouse loop: {e}");
        }
    }

    pub fn set_params(&self, params: MouseParams) {
        self.state.lock().params = params;
    }

    pub fn set_move(&self, cause: u16, x: f64, y: f64) {
        self.state.lock().move_by_keys.insert(cause, Vec2 { x, y });
        self.notify_change();
    }

    pub fn set_scroll(&self, cause: u16, x: f64, y: f64) {
        self.state.lock().scroll_by_keys.insert(cause, Vec2 { x, y });
        self.notify_change();
    }

    pub fn set_speed_factor(&self, cause: u16, factor: f64) {
        self.state.lock().speed_by_keys.insert(cause, factor);
        self.notify_change();
    }

    pub fn button_press(&self, cause: u16, button: MouseButton) {
        let mut state = self.state.lock();
        state.buttons_by_keys.insert(cause, button);
        state.is_button_pressed.insert(button);
        log::debug!("mouse: pressing {button}");
        if let Err(e) = state.out.press_button(button) {
            log::warn!("mouse: button press failed: {e}");
        }
    }

    /// Withdraws every intent owned by `cause` and releases its button.
    pub fn original_key_up(&self, cause: u16) {
        let mut state = self.state.lock();
        state.move_by_keys.remove(&cause);
        state.scroll_by_keys.remove(&cause);
        state.speed_by_keys.remove(&cause);

        if let Some(button) = state.buttons_by_keys.remove(&cause) {
            if state.is_button_pressed.remove(&button) {
                log::debug!("mouse: releasing {button}");
                if let Err(e) = state.out.release_button(button) {
                    log::warn!("mouse: button release failed: {e}");
                }
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    fn notify_change(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn run_loop(&self) {
        let mut last_update = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let (armed, interval) = {
                let state = self.state.lock();
                (state.timer_armed, state.params.loop_interval)
            };
            if armed {
                thread::sleep(interval);
            } else {
                // idle: only a change of intents can resume the loop
                if self.wake_rx.recv().is_err() {
                    return;
                }
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                // rewind so the first tick advances motion immediately
                last_update = Instant::now().checked_sub(interval).unwrap_or(last_update);
            }

            let now = Instant::now();
            let dt = now - last_update;
            last_update = now;
            self.state.lock().move_and_scroll(dt);
        }
    }
}

impl MouseState {
    fn move_and_scroll(&mut self, dt: Duration) {
        let mut move_dir = Vec2::default();
        let mut scroll_dir = Vec2::default();
        let mut speed_factor = 1.0;

        for dir in self.move_by_keys.values() {
            move_dir.add(*dir);
        }
        for dir in self.scroll_by_keys.values() {
            scroll_dir.add(*dir);
        }
        for speed in self.speed_by_keys.values() {
            speed_factor *= speed;
        }

        if !self.move_by_keys.is_empty() || !self.scroll_by_keys.is_empty() || self.is_moving() {
            let tick = dt.as_secs_f64();
            let move_speed = self.params.base_mouse_speed * tick;
            let scroll_speed = self.params.base_scroll_speed * tick;
            let acceleration_step = tick * 1000.0 / self.params.acceleration_time;
            let deceleration_step = tick * 1000.0 / self.params.deceleration_time;
            self.scroll(
                scroll_dir.x * scroll_speed * speed_factor,
                scroll_dir.y * scroll_speed * speed_factor,
            );
            self.do_move(
                move_dir.x * move_speed,
                move_dir.y * move_speed,
                self.params.start_mouse_speed * tick,
                move_speed,
                acceleration_step,
                deceleration_step,
                speed_factor,
            );
            self.timer_armed = true;
        } else {
            self.timer_armed = false;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn do_move(
        &mut self,
        x: f64,
        y: f64,
        start_speed: f64,
        max_speed: f64,
        acceleration_step: f64,
        deceleration_step: f64,
        speed_factor: f64,
    ) {
        self.velocity.x = move_towards(
            self.velocity.x,
            x,
            max_speed,
            start_speed,
            self.params.acceleration_curve,
            acceleration_step,
            self.params.deceleration_curve,
            deceleration_step,
        );
        self.velocity.y = move_towards(
            self.velocity.y,
            y,
            max_speed,
            start_speed,
            self.params.acceleration_curve,
            acceleration_step,
            self.params.deceleration_curve,
            deceleration_step,
        );

        self.move_fraction.x += self.velocity.x * speed_factor;
        self.move_fraction.y += self.velocity.y * speed_factor;
        // emit only whole pixels, keep the fraction
        let dx = take_whole_steps(&mut self.move_fraction.x);
        let dy = take_whole_steps(&mut self.move_fraction.y);
        if dx != 0 || dy != 0 {
            log::debug!("mouse: move {dx} {dy}");
            if let Err(e) = self.out.move_rel(dx, dy) {
                log::warn!("mouse: move failed: {e}");
            }
        }
    }

    fn scroll(&mut self, x: f64, y: f64) {
        let dx = accumulate_scroll(&mut self.scroll_fraction.x, x);
        let dy = accumulate_scroll(&mut self.scroll_fraction.y, y);
        if dx != 0 {
            log::debug!("mouse: scroll horizontal {dx}");
            if let Err(e) = self.out.scroll_horizontal(dx) {
                log::warn!("mouse: scroll failed: {e}");
            }
        }
        if dy != 0 {
            log::debug!("mouse: scroll vertical {dy}");
            if let Err(e) = self.out.scroll_vertical(-dy) {
                log::warn!("mouse: scroll failed: {e}");
            }
        }
    }

    fn is_moving(&self) -> bool {
        self.velocity.x != 0.0 || self.velocity.y != 0.0
    }
}

/// Splits the integer part off an accumulated fraction.
fn take_whole_steps(fraction: &mut f64) -> i32 {
    let steps = *fraction as i32;
    *fraction -= f64::from(steps);
    steps
}

/// Accumulates a scroll delta. A direction change discards the fraction
/// built up so far, so reversing always restarts the integration from
/// zero.
fn accumulate_scroll(fraction: &mut f64, delta: f64) -> i32 {
    if delta * *fraction < 0.0 {
        *fraction = 0.0;
    }
    *fraction += delta;
    take_whole_steps(fraction)
}

/// Advances `current` one step along the configured speed curve towards
/// `target`.
///
/// The integration variable is the normalized position `(current/max)`
/// mapped through the inverse curve, which makes the shape of the ramp
/// independent of the tick rate. A curve of 1 gives a linear ramp; other
/// values give ease-in/ease-out.
#[allow(clippy::too_many_arguments)]
pub fn move_towards(
    current: f64,
    target: f64,
    max: f64,
    start: f64,
    acceleration_curve: f64,
    acceleration_step: f64,
    deceleration_curve: f64,
    deceleration_step: f64,
) -> f64 {
    if target < 0.0 || (target == 0.0 && current < 0.0) {
        return -move_towards(
            -current,
            -target,
            max,
            start,
            acceleration_curve,
            acceleration_step,
            deceleration_curve,
            deceleration_step,
        );
    }
    let mut current = current;
    if current <= 0.0 && target > 0.0 {
        current = start;
    }
    if current < target {
        let t = (current / max).powf(1.0 / acceleration_curve) + acceleration_step;
        target.min(target * t.powf(acceleration_curve))
    } else {
        let t = (current / max).powf(1.0 / deceleration_curve) - deceleration_step;
        if t <= 0.0 {
            target
        } else {
            target.max(max * t.powf(deceleration_curve))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // baseMouseSpeed=1000, startMouseSpeed=100, accTime=100, decTime=100,
    // loopInterval=20 translated to per-tick values with dt = 0.02s
    const MAX: f64 = 20.0;
    const START: f64 = 2.0;
    const STEP: f64 = 0.2;

    fn step(current: f64, target: f64) -> f64 {
        move_towards(current, target, MAX, START, 1.0, STEP, 1.0, STEP)
    }

    #[test]
    fn acceleration_ramps_up_strictly_until_saturation() {
        let mut v = 0.0;
        let mut seen = Vec::new();
        for _ in 0..10 {
            v = step(v, MAX);
            seen.push(v);
        }
        // strictly increasing until the target is reached
        let saturated = seen.iter().position(|x| (x - MAX).abs() < 1e-9).unwrap();
        for w in seen[..=saturated].windows(2) {
            assert!(w[1] > w[0] - 1e-9, "not increasing: {seen:?}");
        }
        // acceleration time of 100ms is 5 ticks of 20ms
        assert!(saturated <= 5, "saturated too late: {seen:?}");
        assert_eq!(seen.last(), Some(&MAX));
    }

    #[test]
    fn deceleration_decays_strictly_to_zero() {
        let mut v = MAX;
        let mut ticks = 0;
        while v != 0.0 {
            let next = step(v, 0.0);
            assert!(next < v, "not decreasing at {v}");
            v = next;
            ticks += 1;
            assert!(ticks < 100, "failed to converge");
        }
        // deceleration time of 100ms is 5 ticks of 20ms
        assert!(ticks <= 5, "decayed too slowly: {ticks} ticks");
    }

    #[test]
    fn converges_for_curved_ramps() {
        for curve in [0.5, 1.0, 2.0, 3.0] {
            let mut v = 0.0;
            for _ in 0..1000 {
                v = move_towards(v, MAX, MAX, START, curve, STEP, curve, STEP);
            }
            assert!((v - MAX).abs() < 1e-6, "curve {curve} did not converge: {v}");

            for _ in 0..1000 {
                v = move_towards(v, 0.0, MAX, START, curve, STEP, curve, STEP);
            }
            assert!(v.abs() < 1e-6, "curve {curve} did not decay: {v}");
        }
    }

    #[test]
    fn negative_targets_mirror_positive_ones() {
        let mut pos = 0.0;
        let mut neg = 0.0;
        for _ in 0..8 {
            pos = step(pos, MAX);
            neg = step(neg, -MAX);
            assert!((pos + neg).abs() < 1e-9, "asymmetric: {pos} vs {neg}");
        }
    }

    #[test]
    fn start_speed_seeds_the_ramp() {
        // from standstill the first step starts at the start speed, not at
        // zero
        let first = step(0.0, MAX);
        let from_start = step(START, MAX);
        assert_eq!(first, from_start);
        assert!(first > START);
    }

    #[test]
    fn whole_steps_keep_the_fraction() {
        let mut fraction = 0.0;
        fraction += 1.7;
        assert_eq!(take_whole_steps(&mut fraction), 1);
        assert!((fraction - 0.7).abs() < 1e-9);

        let mut fraction = -2.3;
        assert_eq!(take_whole_steps(&mut fraction), -2);
        assert!((fraction + 0.3).abs() < 1e-9);
    }

    #[test]
    fn scroll_accumulates_across_ticks() {
        let mut fraction = 0.0;
        assert_eq!(accumulate_scroll(&mut fraction, 0.4), 0);
        assert_eq!(accumulate_scroll(&mut fraction, 0.4), 0);
        assert_eq!(accumulate_scroll(&mut fraction, 0.4), 1);
        assert!((fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn scroll_direction_change_restarts_integration() {
        let mut fraction = 0.0;
        assert_eq!(accumulate_scroll(&mut fraction, 0.9), 0);
        // reversing discards the accumulated 0.9
        assert_eq!(accumulate_scroll(&mut fraction, -0.3), 0);
        assert!((fraction + 0.3).abs() < 1e-9);
        assert_eq!(accumulate_scroll(&mut fraction, -0.8), -1);
    }
}
