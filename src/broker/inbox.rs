//! Shared inbound message queue.
//!
//! Every read worker pushes decoded messages here; consumers drain them via
//! [`Inbox::try_pop`] or the blocking [`Inbox::wait_pop`]. A single queue
//! serves all connections, so consumers see one merged, FIFO-per-connection
//! stream.
//!
//! The queue carries an `open` flag rather than relying on an external
//! running check: the flag is flipped under the queue mutex, which closes
//! the check-then-wait race where a consumer could otherwise sleep through
//! the shutdown notification.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::broker::Message;

/// How long a blocked consumer sleeps before re-checking the open flag.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct InboxState {
    queue: VecDeque<Message>,
    open: bool,
}

/// Blocking MPMC queue of received messages.
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    available: Condvar,
}

impl Inbox {
    /// A new inbox starts closed, mirroring the broker's stopped state:
    /// `wait_pop` on a never-started broker returns `None` immediately
    /// instead of parking forever.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                open: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a message and wake one waiting consumer.
    pub(crate) fn push(&self, msg: Message) {
        let mut state = self.state.lock().expect("inbox mutex poisoned");
        state.queue.push_back(msg);
        drop(state);
        self.available.notify_one();
    }

    /// Pop the oldest message without blocking.
    pub(crate) fn try_pop(&self) -> Option<Message> {
        let mut state = self.state.lock().expect("inbox mutex poisoned");
        state.queue.pop_front()
    }

    /// Block until a message is available or the inbox closes.
    ///
    /// Returns `None` only when the inbox is closed *and* drained: messages
    /// queued before shutdown are still handed out afterwards.
    pub(crate) fn wait_pop(&self) -> Option<Message> {
        let mut state = self.state.lock().expect("inbox mutex poisoned");
        loop {
            if let Some(msg) = state.queue.pop_front() {
                return Some(msg);
            }
            if !state.open {
                return None;
            }
            // Bounded wait so a missed notification can never strand us.
            let (guard, _timeout) = self
                .available
                .wait_timeout(state, WAIT_SLICE)
                .expect("inbox mutex poisoned");
            state = guard;
        }
    }

    /// Close the inbox and wake every blocked consumer.
    ///
    /// The flag is stored under the mutex so no consumer can re-check
    /// `open` and then sleep past the wakeup.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().expect("inbox mutex poisoned");
        state.open = false;
        drop(state);
        self.available.notify_all();
    }

    /// Open the inbox for blocking consumers. Called on broker start;
    /// undrained messages from a previous run stay poppable.
    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock().expect("inbox mutex poisoned");
        state.open = true;
    }
}
