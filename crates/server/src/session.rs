use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use bayeux_server_primitives::{BrowserId, ChannelId, Message, SessionId};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::extension::{fold_sender_outgoing, fold_session_outgoing, SessionExtension};
use crate::waiter::{LongPollWaiter, WakeReason};

struct SessionInner {
    handshaken: bool,
    queue: VecDeque<Message>,
    subscriptions: HashSet<ChannelId>,
    extensions: Vec<Arc<dyn SessionExtension>>,
    batch_depth: u32,
    client_timeout: i64,
    client_interval: i64,
    schedule_time: Instant,
    expire_time: Option<Instant>,
    waiter: Option<Arc<LongPollWaiter>>,
    meta_connect_delivery_only: bool,
}

/// One logical client, alive across many HTTP requests.
///
/// All mutable state sits behind one lock that is never held across an
/// await; async work (extension folds) operates on snapshots.
pub struct Session {
    id: SessionId,
    browser_id: BrowserId,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(browser_id: BrowserId) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::random(),
            browser_id,
            inner: Mutex::new(SessionInner {
                handshaken: false,
                queue: VecDeque::new(),
                subscriptions: HashSet::new(),
                extensions: Vec::new(),
                batch_depth: 0,
                client_timeout: -1,
                client_interval: -1,
                schedule_time: Instant::now(),
                expire_time: None,
                waiter: None,
                meta_connect_delivery_only: false,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn browser_id(&self) -> BrowserId {
        self.browser_id
    }

    pub fn is_handshaken(&self) -> bool {
        self.inner.lock().handshaken
    }

    pub(crate) fn set_handshaken(&self, handshaken: bool) {
        self.inner.lock().handshaken = handshaken;
    }

    pub fn add_extension(&self, extension: Arc<dyn SessionExtension>) {
        self.inner.lock().extensions.push(extension);
    }

    pub fn remove_extension(&self, extension: &Arc<dyn SessionExtension>) {
        self.inner
            .lock()
            .extensions
            .retain(|e| !Arc::ptr_eq(e, extension));
    }

    pub(crate) fn extensions(&self) -> Vec<Arc<dyn SessionExtension>> {
        self.inner.lock().extensions.clone()
    }

    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.inner.lock().subscriptions.iter().cloned().collect()
    }

    pub(crate) fn add_subscription(&self, channel: ChannelId) -> bool {
        self.inner.lock().subscriptions.insert(channel)
    }

    pub(crate) fn remove_subscription(&self, channel: &ChannelId) -> bool {
        self.inner.lock().subscriptions.remove(channel)
    }

    /// Queues a message for this session, running the sender's outgoing
    /// chain and then this session's own. Either chain may rewrite or drop
    /// the message. Outside a batch, a queued message immediately wakes any
    /// held connect.
    pub async fn deliver(self: &Arc<Self>, sender: Option<&Arc<Session>>, message: Message) {
        let mut message = message;

        if let Some(sender) = sender {
            if !fold_sender_outgoing(sender, &mut message).await {
                return;
            }
        }
        if !fold_session_outgoing(self, &mut message).await {
            return;
        }

        let _ = message.serialized();

        let waiter = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(message);
            if inner.batch_depth == 0 {
                inner.waiter.take()
            } else {
                None
            }
        };
        if let Some(waiter) = waiter {
            let _ = waiter.wake(WakeReason::Message);
        }
    }

    pub fn queue_is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub(crate) fn drain_queue(&self) -> Vec<Message> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Runs every session extension's `dequeue` hook over a drained queue
    /// bound for a `/meta/connect` response.
    pub(crate) async fn apply_dequeue_hooks(
        self: &Arc<Self>,
        drained: Vec<Message>,
        connect_reply: &Message,
    ) -> Vec<Message> {
        let mut drained = drained;
        for extension in self.extensions() {
            drained = extension.dequeue(self, drained, connect_reply).await;
        }
        drained
    }

    pub(crate) fn start_batch(&self) {
        self.inner.lock().batch_depth += 1;
    }

    /// Leaves a batch; at depth zero with a non-empty queue the held connect
    /// (if any) is handed back for waking.
    pub(crate) fn end_batch(&self) -> Option<Arc<LongPollWaiter>> {
        let mut inner = self.inner.lock();
        inner.batch_depth = inner.batch_depth.saturating_sub(1);
        if inner.batch_depth == 0 && !inner.queue.is_empty() {
            inner.waiter.take()
        } else {
            None
        }
    }

    pub fn is_batching(&self) -> bool {
        self.inner.lock().batch_depth > 0
    }

    /// Defers queue flushing for the duration of `f`. Messages delivered
    /// inside flush when the batch exits, whether `f` succeeded or not.
    pub async fn batch<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.start_batch();
        let out = f().await;
        if let Some(waiter) = self.end_batch() {
            let _ = waiter.wake(WakeReason::Message);
        }
        out
    }

    pub(crate) fn set_client_advice(&self, timeout: i64, interval: i64) {
        let mut inner = self.inner.lock();
        inner.client_timeout = timeout;
        inner.client_interval = interval;
    }

    /// The effective connect hold, preferring the client-advertised value.
    pub fn calculate_timeout(&self, server_default: u64) -> u64 {
        match self.inner.lock().client_timeout {
            t if t >= 0 => t as u64,
            _ => server_default,
        }
    }

    pub fn calculate_interval(&self, server_default: u64) -> u64 {
        match self.inner.lock().client_interval {
            i if i >= 0 => i as u64,
            _ => server_default,
        }
    }

    /// Arms the sweep deadline: now + interval + max_interval.
    pub(crate) fn schedule_expiration(&self, default_interval: u64, max_interval: u64) {
        let interval = self.calculate_interval(default_interval);
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.schedule_time = now;
        inner.expire_time = Some(now + Duration::from_millis(interval + max_interval));
    }

    /// Called when a request for this session enters the pipeline. A held or
    /// in-flight `/meta/connect` exempts the session from sweeping entirely;
    /// other traffic pushes the deadline out by the in-flight wall time.
    pub(crate) fn cancel_expiration(&self, is_meta_connect: bool) {
        let mut inner = self.inner.lock();
        if is_meta_connect {
            inner.expire_time = None;
            return;
        }
        if let Some(expire) = inner.expire_time {
            let now = Instant::now();
            let in_flight = now.saturating_duration_since(inner.schedule_time);
            inner.expire_time = Some(expire + in_flight);
            inner.schedule_time = now;
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.inner.lock().expire_time.is_some_and(|at| now > at)
    }

    pub(crate) fn attach_waiter(&self, waiter: &Arc<LongPollWaiter>) {
        self.inner.lock().waiter = Some(Arc::clone(waiter));
    }

    pub(crate) fn take_waiter(&self) -> Option<Arc<LongPollWaiter>> {
        self.inner.lock().waiter.take()
    }

    /// Detaches `waiter` if it is still the attached one; a newer waiter is
    /// left alone.
    pub(crate) fn take_waiter_if(&self, waiter: &Arc<LongPollWaiter>) -> bool {
        let mut inner = self.inner.lock();
        match &inner.waiter {
            Some(current) if Arc::ptr_eq(current, waiter) => {
                inner.waiter = None;
                true
            }
            _ => false,
        }
    }

    pub fn meta_connect_delivery_only(&self) -> bool {
        self.inner.lock().meta_connect_delivery_only
    }

    pub fn set_meta_connect_delivery_only(&self, value: bool) {
        self.inner.lock().meta_connect_delivery_only = value;
    }
}
