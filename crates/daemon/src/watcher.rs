//! # Filesystem Watcher
//!
//! A thin inotify wrapper that turns directory changes into callbacks.
//! The trust store subscribes for `.crt`/`.yaml` changes so that
//! out-of-band edits to the trust directory (another member's entry
//! delivered by the replication layer, an operator removing a node)
//! are picked up without polling.
//!
//! ## Model
//!
//! One background thread owns a non-blocking inotify instance watching
//! each requested directory (non-recursive). Events collapse to
//! [`FileEvent::Added`] / [`FileEvent::Removed`]; a kernel-side queue
//! overflow collapses to [`FileEvent::Rescan`], telling subscribers to
//! do a full re-read rather than trusting the event stream.
//!
//! Subscribers register `(suffix, callback)` pairs. Callbacks run on
//! the watcher thread and must not block for long; the trust store's
//! refresh is a directory scan, which is fine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::WatchError;

/// How often the watcher thread checks the shutdown flag when the
/// event queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(400);

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Added,
    Removed,
    /// The event queue overflowed; the path is the watched directory
    /// and subscribers should rescan it.
    Rescan,
}

/// Callback invoked on the watcher thread for matching events.
pub type WatchCallback = Arc<dyn Fn(&Path, FileEvent) + Send + Sync>;

struct Subscription {
    suffix: String,
    callback: WatchCallback,
}

struct WatcherShared {
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

/// Directory watcher with suffix-keyed subscriptions.
pub struct FsWatcher {
    shared: Arc<WatcherShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FsWatcher {
    /// Starts watching the given directories.
    pub fn new(dirs: &[PathBuf]) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| WatchError::Init(e.to_string()))?;

        let mask = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_FROM
            | AddWatchFlags::IN_MOVED_TO;

        let mut watches = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let wd = inotify.add_watch(dir, mask).map_err(|e| WatchError::AddWatch {
                path: dir.clone(),
                message: e.to_string(),
            })?;
            watches.push((wd, dir.clone()));
        }

        let shared = Arc::new(WatcherShared {
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("syndic-fswatch".into())
            .spawn(move || watch_loop(inotify, watches, thread_shared))
            .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self { shared, thread: Mutex::new(Some(thread)) })
    }

    /// Registers a callback for files ending in `suffix`.
    pub fn watch_suffix(&self, suffix: &str, callback: WatchCallback) {
        self.shared.subscriptions.lock().push(Subscription {
            suffix: suffix.to_string(),
            callback,
        });
    }

    /// Stops the watcher thread. Idempotent; pending events are
    /// dropped.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn watch_loop(
    inotify: Inotify,
    watches: Vec<(nix::sys::inotify::WatchDescriptor, PathBuf)>,
    shared: Arc<WatcherShared>,
) {
    while !shared.closed.load(Ordering::SeqCst) {
        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(err) => {
                warn!(error = %err, "directory watch failed, stopping watcher");
                return;
            }
        };

        for event in events {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                warn!("inotify queue overflow, forcing subscriber rescan");
                for (_, dir) in &watches {
                    dispatch(&shared, dir, FileEvent::Rescan, true);
                }
                continue;
            }

            let Some((_, dir)) = watches.iter().find(|(wd, _)| *wd == event.wd) else {
                continue;
            };

            let Some(name) = &event.name else { continue };
            let path = dir.join(name);

            let kind = if event
                .mask
                .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM)
            {
                FileEvent::Removed
            } else {
                FileEvent::Added
            };

            debug!(path = %path.display(), ?kind, "watched file changed");
            dispatch(&shared, &path, kind, false);
        }
    }
}

fn dispatch(shared: &WatcherShared, path: &Path, event: FileEvent, all: bool) {
    let subs = shared.subscriptions.lock();
    let name = path.to_string_lossy();
    for sub in subs.iter() {
        if all || name.ends_with(&sub.suffix) {
            (sub.callback)(path, event);
        }
    }
}
