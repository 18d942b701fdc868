//! Cooperative shutdown flag shared by every blocking wait.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Engine-wide cancellation flag.
///
/// The atomic answers "has shutdown been requested". The gate channel turns
/// the flag into a wake-up: while the engine is live the gate's sender is
/// held open, so `recv` on a watcher blocks; [`QuitFlag::request`] drops the
/// sender and every watcher's `recv` fails immediately. Blocking waits use
/// a watcher as one arm of a `select!`.
pub struct QuitFlag {
    requested: AtomicBool,
    gate: Mutex<Gate>,
}

struct Gate {
    keeper: Option<Sender<()>>,
    watcher: Receiver<()>,
}

impl QuitFlag {
    pub fn new() -> Self {
        let (keeper, watcher) = unbounded();
        Self {
            requested: AtomicBool::new(false),
            gate: Mutex::new(Gate {
                keeper: Some(keeper),
                watcher,
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Requests shutdown and wakes every watcher. Returns true if shutdown
    /// had already been requested, so the caller can skip teardown.
    pub fn request(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.gate.lock().unwrap().keeper = None;
        false
    }

    /// Re-arms the flag so the engine can be reused after a shutdown.
    pub fn reset(&self) {
        let (keeper, watcher) = unbounded();
        let mut gate = self.gate.lock().unwrap();
        gate.keeper = Some(keeper);
        gate.watcher = watcher;
        self.requested.store(false, Ordering::SeqCst);
    }

    /// A receiver that blocks while the engine is live and errors once
    /// shutdown is requested.
    pub fn watcher(&self) -> Receiver<()> {
        self.gate.lock().unwrap().watcher.clone()
    }
}

impl Default for QuitFlag {
    fn default() -> Self {
        Self::new()
    }
}
