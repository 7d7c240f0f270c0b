pub mod cfg;
pub mod device_watcher;
pub mod executor;
pub mod handlers;
pub mod keyevent;
pub mod keys;
pub mod oskbd;
pub mod vkbd;
pub mod vmouse;

pub use executor::BindingExecutor;
pub use keyevent::{EventBinding, KeyEvent};
pub use vkbd::VirtualKeyboard;
pub use vmouse::{MouseParams, VirtualMouse};
