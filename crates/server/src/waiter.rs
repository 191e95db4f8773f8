use std::sync::{Arc, Weak};

use bayeux_server_primitives::BrowserId;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::broker::Broker;

/// Why a held `/meta/connect` was woken before its timer expired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WakeReason {
    /// A message was queued for the session; complete normally.
    Message,
    /// A newer connect arrived for the same session; the held request is
    /// preempted and answers with the configured duplicate status.
    Duplicate,
}

/// The wake side of one suspended `/meta/connect`.
///
/// The request handler owns the receiving end and is the only completer of
/// the response; this object carries the one-shot wake signal and the
/// browser hold-slot accounting. The sender is consumed on first use, so of
/// all terminating events (message, duplicate connect, timer, client
/// disconnect) exactly one wins, releases the hold slot, and the rest are
/// no-ops. On the timer and disconnect paths the handler wakes the waiter
/// itself so the slot is still released exactly once.
pub(crate) struct LongPollWaiter {
    tx: Mutex<Option<oneshot::Sender<WakeReason>>>,
    broker: Weak<Broker>,
    browser: BrowserId,
}

impl LongPollWaiter {
    pub(crate) fn new(
        broker: Weak<Broker>,
        browser: BrowserId,
    ) -> (Arc<Self>, oneshot::Receiver<WakeReason>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            broker,
            browser,
        });
        (waiter, rx)
    }

    /// Wakes the held request and releases its browser hold slot. Returns
    /// `false` if the waiter already fired.
    pub(crate) fn wake(&self, reason: WakeReason) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // The receiver may already be gone (request dropped); the hold slot
        // is released regardless.
        let _ = tx.send(reason);
        if let Some(broker) = self.broker.upgrade() {
            broker.release_hold(&self.browser);
        }
        true
    }
}
