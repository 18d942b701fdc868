//! Producer/consumer scan queues with blocking and non-blocking polls.
//!
//! Each queue pairs a FIFO buffer with a "scan finished" flag and a
//! wait/notify signal. Producers are detached async tasks; consumers are
//! foreign caller threads that may block inside [`ScanQueue::poll`]. The
//! device, service, characteristic and notification-data queues are all
//! instances of this one type.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::quit::QuitFlag;

/// Outcome of one poll against a scan queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus<T> {
    /// The scan is still running and nothing is buffered yet.
    Processing,
    /// The next buffered item, in production order.
    Available(T),
    /// The queue is empty and the scan has finished or was cancelled.
    Finished,
}

struct State<T> {
    items: VecDeque<T>,
    finished: bool,
}

pub struct ScanQueue<T> {
    state: Mutex<State<T>>,
    signal: Condvar,
    quit: Arc<QuitFlag>,
}

impl<T> ScanQueue<T> {
    pub fn new(quit: Arc<QuitFlag>) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                finished: false,
            }),
            signal: Condvar::new(),
            quit,
        }
    }

    /// Clears buffered items and re-opens the queue for a new scan.
    pub fn begin(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.finished = false;
    }

    /// Appends an item and wakes one waiting poller. Returns false if the
    /// item was dropped because the scan already finished or shutdown was
    /// requested.
    pub fn push(&self, item: T) -> bool {
        if self.quit.is_set() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return false;
        }
        state.items.push_back(item);
        self.signal.notify_one();
        true
    }

    /// Marks the scan finished and wakes every waiting poller. Items pushed
    /// before this are still delivered before `poll` reports `Finished`.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        self.signal.notify_all();
    }

    /// Shutdown path: discards buffered items, marks the queue finished and
    /// wakes every waiting poller.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.finished = true;
        self.signal.notify_all();
    }

    /// Pops the next item. When `block` is set and the queue is empty but
    /// the scan still running, the calling thread sleeps until an item
    /// arrives, the scan finishes or shutdown is requested; the shutdown
    /// case returns `Finished` without consuming anything. The quit flag is
    /// checked before every sleep and again on every wake.
    pub fn poll(&self, block: bool) -> ScanStatus<T> {
        let mut state = self.state.lock().unwrap();
        if block {
            loop {
                if self.quit.is_set() {
                    return ScanStatus::Finished;
                }
                if !state.items.is_empty() || state.finished {
                    break;
                }
                state = self.signal.wait(state).unwrap();
            }
        }
        match state.items.pop_front() {
            Some(item) => ScanStatus::Available(item),
            None if state.finished => ScanStatus::Finished,
            None => ScanStatus::Processing,
        }
    }
}
