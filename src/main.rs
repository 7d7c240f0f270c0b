use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::info;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use mouseless::cfg::Cfg;
use mouseless::device_watcher;
use mouseless::executor::BindingExecutor;
use mouseless::handlers::{
    ComboHandler, DefaultHandler, EventHandler, ModLayerHandler, SharedHandler, SharedLayers,
    TapHoldHandler,
};
use mouseless::keyevent::{EventBinding, KeyEvent};
use mouseless::oskbd::{self, DeviceFilter, InputDevice, VIRT_KEYBOARD_NAME, VIRT_MOUSE_NAME};
use mouseless::vkbd::VirtualKeyboard;
use mouseless::vmouse::{MouseParams, VirtualMouse};

#[derive(Parser, Debug)]
#[command(name = "mouseless")]
/// mouseless: control the mouse and remap keys with your keyboard
///
/// mouseless grabs your keyboard devices exclusively and re-emits the keys
/// through a synthetic keyboard and mouse, transformed according to the
/// layers defined in the config file.
struct Args {
    /// Show the version
    #[arg(short = 'v', long)]
    version: bool,

    /// Show verbose debug information
    #[arg(short, long)]
    debug: bool,

    /// The config file (defaults to ~/.config/mouseless/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List the auto-detected keyboard devices and exit
    #[arg(short = 'l', long)]
    list_devices: bool,

    /// List all input devices and exit
    #[arg(short = 'L', long)]
    list_all_devices: bool,
}

fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut log_cfg = ConfigBuilder::new();
    if let Err(e) = log_cfg.set_time_offset_to_local() {
        eprintln!("WARNING: could not set log TZ to local: {e:?}");
    };
    log_cfg.set_time_format_rfc3339();
    CombinedLogger::init(vec![TermLogger::new(
        level,
        log_cfg.build(),
        TerminalMode::Mixed,
        ColorChoice::AlwaysAnsi,
    )])
    .expect("logger can init");
}

fn default_config_path() -> Result<PathBuf> {
    match dirs::config_dir() {
        Some(dir) => Ok(dir.join("mouseless").join("config.yaml")),
        None => bail!("could not determine the config directory; pass -c/--config"),
    }
}

fn list_input_devices(all: bool) {
    for (path, device) in oskbd::enumerate_devices() {
        if all || oskbd::is_keyboard(&device) {
            println!("{}: {}", path.display(), oskbd::device_name(&device));
        }
    }
}

/// The grabbed keyboards, re-evaluated on hotplug and config reload.
struct DeviceManager {
    filter: DeviceFilter,
    devices: Vec<ManagedDevice>,
    events: Sender<KeyEvent>,
}

struct ManagedDevice {
    device: InputDevice,
    auto_detected_keyboard: bool,
}

impl DeviceManager {
    fn new(filter: DeviceFilter, events: Sender<KeyEvent>) -> Self {
        Self {
            filter,
            devices: Vec::new(),
            events,
        }
    }

    /// Registers newly visible matching devices and (re-)grabs everything
    /// that is not currently open.
    fn rescan(&mut self) {
        for (path, device) in oskbd::enumerate_devices() {
            let name = oskbd::device_name(&device);
            // never grab our own synthetic devices
            if name == VIRT_KEYBOARD_NAME || name == VIRT_MOUSE_NAME {
                continue;
            }
            let auto_detected = oskbd::is_keyboard(&device);
            if !self.filter.matches(&path, &name, auto_detected) {
                continue;
            }
            if !self.devices.iter().any(|d| d.device.path() == path) {
                log::debug!("registering device {}: {name}", path.display());
                self.devices.push(ManagedDevice {
                    device: InputDevice::new(path, name, self.events.clone()),
                    auto_detected_keyboard: auto_detected,
                });
            }
        }

        for managed in &self.devices {
            if !managed.device.is_open() && managed.device.path().exists() {
                managed.device.grab();
            }
        }
    }

    /// Applies a new filter, dropping devices it no longer selects.
    fn set_filter(&mut self, filter: DeviceFilter) {
        self.filter = filter;
        let filter = &self.filter;
        self.devices.retain(|managed| {
            let keep = filter.matches(
                managed.device.path(),
                managed.device.name(),
                managed.auto_detected_keyboard,
            );
            if !keep {
                log::info!("releasing device {}", managed.device.path().display());
                managed.device.disconnected();
            }
            keep
        });
    }

    fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn warn_if_none_open(&self) {
        if self.devices.iter().any(|d| d.device.is_open()) {
            return;
        }
        log::warn!("no keyboard device could be opened:");
        for (i, managed) in self.devices.iter().enumerate() {
            log::warn!(
                "device {}: {} ({}): {}",
                i + 1,
                managed.device.path().display(),
                managed.device.name(),
                managed.device.last_open_error()
            );
        }
    }
}

fn main_impl() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("mouseless {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logger(args.debug);

    if args.list_devices || args.list_all_devices {
        list_input_devices(args.list_all_devices);
        return Ok(());
    }

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    log::debug!("using config file: {}", config_path.display());
    let cfg = match Cfg::from_file(&config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => bail!("failed to read the config file: {e}"),
    };

    // an input device with our keyboard name means another instance is
    // already running
    for (_, device) in oskbd::enumerate_devices() {
        if oskbd::device_name(&device) == VIRT_KEYBOARD_NAME {
            bail!(
                "found an input device named '{VIRT_KEYBOARD_NAME}', which probably means \
                 that another instance of mouseless is already running"
            );
        }
    }

    let (event_tx, event_rx) = bounded::<KeyEvent>(1000);
    let (reload_tx, reload_rx) = bounded::<()>(1);
    let (devwatch_tx, devwatch_rx) = bounded::<()>(1);

    let mouse = match VirtualMouse::new(MouseParams::from_cfg(&cfg)) {
        Ok(mouse) => mouse,
        Err(e) => {
            log::error!(
                "failed to create the virtual mouse; make sure you have permission to access \
                 /dev/uinput"
            );
            bail!(e);
        }
    };
    let keyboard = match VirtualKeyboard::new() {
        Ok(keyboard) => keyboard,
        Err(e) => {
            log::error!("failed to create the virtual keyboard");
            bail!(e);
        }
    };

    // build the pipeline back to front
    let executor = BindingExecutor::new_shared(cfg.clone(), keyboard, mouse.clone(), reload_tx);
    let layers: SharedLayers = executor.clone();
    let executor_sink: SharedHandler = executor.clone();
    let default = DefaultHandler::new_shared(layers.clone(), executor_sink);
    let mod_layer = ModLayerHandler::new_shared(layers.clone(), default);
    let tap_hold = TapHoldHandler::new_shared(cfg.quick_tap_time_ms, layers.clone(), mod_layer);
    let combo = ComboHandler::new_shared(cfg.combo_time_ms, layers, tap_hold.clone());

    let filter = DeviceFilter::new(cfg.devices.clone(), cfg.devices_exclude.clone());
    let mut devices = DeviceManager::new(filter, event_tx);
    devices.rescan();
    if devices.is_empty() && cfg.devices.is_empty() {
        bail!("no keyboard devices found");
    }

    let _watcher = match device_watcher::start(devwatch_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log::warn!("could not watch /dev/input, hotplug will not work: {e}");
            None
        }
    };

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {signal}, exiting");
            std::process::exit(0);
        }
    });

    if let Some(command) = &cfg.start_command {
        log::debug!("executing start command: {command}");
        let status = Command::new("sh").arg("-c").arg(command).status()?;
        if !status.success() {
            bail!("execution of the start command failed: {status}");
        }
    }

    mouse.clone().start_loop();
    info!("mouseless v{} started", env!("CARGO_PKG_VERSION"));

    // the main pipeline loop
    let device_check = tick(Duration::from_secs(10));
    loop {
        select! {
            recv(event_rx) -> event => match event {
                Ok(event) => combo.lock().handle_event(EventBinding::new(event)),
                Err(_) => bail!("the input event channel closed unexpectedly"),
            },
            recv(reload_rx) -> _ => {
                reload_config(&config_path, &executor, &mouse, &tap_hold, &combo, &mut devices);
            }
            recv(devwatch_rx) -> _ => {
                // give udev a moment to set up permissions on new nodes
                thread::sleep(Duration::from_millis(200));
                devices.rescan();
            }
            recv(device_check) -> _ => devices.warn_if_none_open(),
        }
    }
}

fn reload_config(
    path: &Path,
    executor: &Arc<Mutex<BindingExecutor>>,
    mouse: &Arc<VirtualMouse>,
    tap_hold: &Arc<Mutex<TapHoldHandler>>,
    combo: &Arc<Mutex<ComboHandler>>,
    devices: &mut DeviceManager,
) {
    info!("reloading the configuration");
    let cfg = match Cfg::from_file(path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            log::warn!("failed to reload the config file, keeping the running one: {e}");
            return;
        }
    };
    executor.lock().set_config(cfg.clone());
    mouse.set_params(MouseParams::from_cfg(&cfg));
    tap_hold.lock().set_quick_tap_time(cfg.quick_tap_time_ms);
    combo.lock().set_combo_time(cfg.combo_time_ms);
    devices.set_filter(DeviceFilter::new(
        cfg.devices.clone(),
        cfg.devices_exclude.clone(),
    ));
    devices.rescan();
    info!("configuration reloaded");
}

fn main() -> Result<()> {
    let ret = main_impl();
    if let Err(ref e) = ret {
        log::error!("{e}");
    }
    ret
}
