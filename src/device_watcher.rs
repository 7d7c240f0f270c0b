//! Watches `/dev/input` so unplugged keyboards are noticed and re-plugged
//! ones are grabbed again.

use std::path::Path;

use crossbeam_channel::Sender;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Starts watching `/dev/input` and pulses `signal` whenever an event
/// device appears or disappears. The signal channel has a single slot, so
/// bursts of udev activity coalesce into one rescan. The returned watcher
/// must be kept alive.
pub fn start(signal: Sender<()>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Remove(_)) {
                    return;
                }
                let affects_event_device = event.paths.iter().any(|path| {
                    path.file_name()
                        .is_some_and(|name| name.to_string_lossy().starts_with("event"))
                });
                if affects_event_device {
                    log::debug!("device change in /dev/input: {:?}", event.paths);
                    let _ = signal.try_send(());
                }
            }
            Err(e) => log::warn!("device watcher error: {e}"),
        }
    })?;
    watcher.watch(Path::new("/dev/input"), RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
