//! Hot reload of the servers config file.
//!
//! A dedicated thread watches the file's parent directory through the
//! platform notifier (inotify/kqueue), debounces bursts of events (editors
//! and atomic renames produce several per save), and re-parses the file.
//! A successful parse is published atomically; a failed one keeps the
//! previous routing plane. Watching errors never take the proxy down.

use crate::dispatch::AppState;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_PERIOD: Duration = Duration::from_millis(500);
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Handle to the watcher thread; dropping it does not stop the thread,
/// call [`ConfigWatcher::stop`].
pub struct ConfigWatcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Starts watching `path` and publishing reloads into `state`.
    pub fn spawn(path: PathBuf, state: Arc<AppState>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::spawn(move || watch_loop(&path, &state, &thread_stop));
        Self { stop, handle }
    }

    /// Signals the thread to exit and waits for it.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

fn watch_loop(path: &Path, state: &AppState, stop: &AtomicBool) {
    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(tx) {
        Ok(watcher) => watcher,
        Err(error) => {
            tracing::error!(%error, "Failed to create config watcher");
            return;
        }
    };

    // Watch the directory, not the file: editors and config management
    // tools replace the file by rename, which retires the old inode.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(error) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        tracing::error!(%error, dir = %dir.display(), "Failed to watch config directory");
        return;
    }
    tracing::info!(path = %path.display(), "Watching config file for changes");

    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(POLL_PERIOD) {
            Ok(Ok(event)) if touches(&event, path) => {
                // Drain the burst before reloading once.
                while let Ok(_ignored) = rx.recv_timeout(DEBOUNCE) {}
                if path.exists() {
                    state.reload_from(path);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::warn!(%error, "Config watch error");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    let file_name = path.file_name();
    event
        .paths
        .iter()
        .any(|event_path| event_path.file_name() == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use crate::testutils::test_settings;
    use std::fs;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("apiproxy-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn reload_publishes_a_new_plane() {
        let path = scratch_file("reload.conf");
        fs::write(&path, "* http://one:8001/\n").unwrap();

        let state = AppState::new(&test_settings(Mode::Accounts));
        assert!(state.current_config().is_none());

        state.reload_from(&path);
        let first = state.current_config().unwrap();

        fs::write(&path, "0.* http://one:8001/\n1.* http://two:8001/\n").unwrap();
        state.reload_from(&path);
        let second = state.current_config().unwrap();

        assert_ne!(first.version(), second.version());
        assert_eq!(second.server_count(), 2);
    }

    #[test]
    fn failed_reload_keeps_the_previous_plane() {
        let path = scratch_file("broken.conf");
        fs::write(&path, "* http://one:8001/\n").unwrap();

        let state = AppState::new(&test_settings(Mode::Accounts));
        state.reload_from(&path);
        let before = state.current_config().unwrap();

        // Incomplete coverage: the reload must be rejected.
        fs::write(&path, "0.* http://one:8001/\n").unwrap();
        state.reload_from(&path);
        let after = state.current_config().unwrap();
        assert_eq!(before.version(), after.version());

        // So must a missing file.
        state.reload_from(Path::new("/nonexistent/apiproxy.conf"));
        assert_eq!(state.current_config().unwrap().version(), before.version());
    }

    #[test]
    fn event_matching_is_by_file_name() {
        let event = Event::new(notify::EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/apiproxy/apiproxy.conf"));
        assert!(touches(&event, Path::new("/etc/apiproxy/apiproxy.conf")));
        assert!(touches(&event, Path::new("apiproxy.conf")));
        assert!(!touches(&event, Path::new("other.conf")));
    }

    #[test]
    fn watcher_thread_stops_cleanly() {
        let path = scratch_file("watched.conf");
        fs::write(&path, "* http://one:8001/\n").unwrap();

        let state = Arc::new(AppState::new(&test_settings(Mode::Accounts)));
        let watcher = ConfigWatcher::spawn(path, state);
        watcher.stop();
    }
}
