//! Acknowledged-message delivery: batch-numbered outbound log with replay on
//! client reconnect, giving at-least-once semantics over broken connections.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bayeux_server_primitives::protocol;
use bayeux_server_primitives::Message;
use eyre::Result as EyreResult;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::broker::Broker;
use crate::extension::{Extension, SessionExtension};
use crate::session::Session;

/// Outbound messages tagged with the batch they were delivered under. A
/// batch closes every time a `/meta/connect` reply is written; the client
/// acknowledges batches by number and acknowledged entries are dropped.
pub(crate) struct BatchQueue {
    entries: VecDeque<(u64, Message)>,
    batch: u64,
}

impl BatchQueue {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            batch: 0,
        }
    }

    fn store(&mut self, message: Message) {
        self.entries.push_back((self.batch, message));
    }

    /// Closes the current batch, returning the number just closed.
    fn close_batch(&mut self) -> u64 {
        let closed = self.batch;
        self.batch += 1;
        closed
    }

    /// Drops every entry acknowledged by batch number `n`.
    fn ack(&mut self, n: u64) {
        self.entries.retain(|(tag, _)| *tag > n);
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Everything still unacknowledged up to and including `batch`.
    fn slice_to_batch(&self, batch: u64) -> Vec<Message> {
        self.entries
            .iter()
            .filter(|(tag, _)| *tag <= batch)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[derive(Default)]
struct ReplyBatches {
    /// Connect reply id -> the batch closed when that reply was written.
    by_reply: HashMap<String, u64>,
}

impl ReplyBatches {
    fn key(reply: &Message) -> String {
        reply.id().map(Value::to_string).unwrap_or_default()
    }

    fn record(&mut self, reply: &Message, batch: u64) {
        let _ = self.by_reply.insert(Self::key(reply), batch);
    }

    fn take(&mut self, reply: &Message) -> Option<u64> {
        self.by_reply.remove(&Self::key(reply))
    }
}

struct AckState {
    queue: BatchQueue,
    replies: ReplyBatches,
}

/// The per-session half: stores deliveries, stamps connect replies, and
/// swaps the drained queue for the unacknowledged replay slice.
struct AckSessionExtension {
    state: Mutex<AckState>,
}

impl AckSessionExtension {
    fn new() -> Self {
        Self {
            state: Mutex::new(AckState {
                queue: BatchQueue::new(),
                replies: ReplyBatches::default(),
            }),
        }
    }
}

#[async_trait]
impl SessionExtension for AckSessionExtension {
    async fn incoming(&self, session: &Arc<Session>, message: &mut Message) -> EyreResult<bool> {
        if message.channel() != Some(protocol::META_CONNECT) {
            return Ok(true);
        }

        let acked = message
            .ext()
            .and_then(|ext| ext.get("ack"))
            .and_then(Value::as_i64);

        let mut state = self.state.lock();
        if let Some(n) = acked {
            if n >= 0 {
                state.queue.ack(n as u64);
            }
        }

        // Unacknowledged backlog with nothing live queued: answer at once so
        // the replay goes out instead of being held for the full timeout.
        if !state.queue.is_empty() && session.queue_is_empty() {
            drop(state);
            let _ = message.advice_mut().insert("timeout".to_owned(), json!(0));
        }

        Ok(true)
    }

    async fn outgoing(&self, session: &Arc<Session>, message: &mut Message) -> EyreResult<bool> {
        if message.channel() == Some(protocol::META_CONNECT) && message.successful().is_some() {
            // Writing a connect reply closes the current batch.
            let mut state = self.state.lock();
            let closed = state.queue.close_batch();
            state.replies.record(message, closed);
            drop(state);
            let _ = message.ext_mut().insert("ack".to_owned(), json!(closed));
            return Ok(true);
        }

        let broadcast = message
            .channel()
            .map_or(false, |c| !c.starts_with("/meta/") && !c.starts_with("/service/"));
        if broadcast && message.successful().is_none() {
            self.state.lock().queue.store(message.clone());
            debug!(session_id = %session.id(), channel = ?message.channel(), "stored for ack replay");
        }

        Ok(true)
    }

    async fn dequeue(
        &self,
        _session: &Arc<Session>,
        drained: Vec<Message>,
        connect_reply: &Message,
    ) -> Vec<Message> {
        let mut state = self.state.lock();
        match state.replies.take(connect_reply) {
            // Resend from the earliest unacked batch through the one this
            // connect just closed.
            Some(batch) => state.queue.slice_to_batch(batch),
            None => drained,
        }
    }
}

/// Server extension activating acknowledged delivery for clients that ask
/// for it (`ext.ack: true` in the handshake).
pub struct AckExtension;

#[async_trait]
impl Extension for AckExtension {
    async fn incoming(
        &self,
        _broker: &Broker,
        session: &Arc<Session>,
        message: &mut Message,
    ) -> EyreResult<bool> {
        if message.channel() == Some(protocol::META_HANDSHAKE) {
            let wants_ack = message
                .ext()
                .and_then(|ext| ext.get("ack"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if wants_ack {
                session.add_extension(Arc::new(AckSessionExtension::new()));
                // Broadcasts must only drain on connect responses or the
                // replay discipline breaks.
                session.set_meta_connect_delivery_only(true);
                debug!(session_id = %session.id(), "ack extension enabled");
            }
        }
        Ok(true)
    }

    async fn outgoing(
        &self,
        _broker: &Broker,
        _sender: Option<&Arc<Session>>,
        session: Option<&Arc<Session>>,
        message: &mut Message,
    ) -> EyreResult<bool> {
        if message.channel() == Some(protocol::META_HANDSHAKE)
            && message.successful() == Some(true)
            && session.is_some_and(|s| s.meta_connect_delivery_only())
        {
            let _ = message.ext_mut().insert("ack".to_owned(), json!(true));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use bayeux_server_primitives::BrowserId;
    use serde_json::json;

    use super::*;

    fn message(value: Value) -> Message {
        Message::from_value(value).expect("message object")
    }

    #[test]
    fn batch_queue_acks_by_tag() {
        let mut queue = BatchQueue::new();
        queue.store(message(json!({"channel": "/a", "data": 1})));
        assert_eq!(queue.close_batch(), 0);
        queue.store(message(json!({"channel": "/a", "data": 2})));
        assert_eq!(queue.close_batch(), 1);

        assert_eq!(queue.slice_to_batch(1).len(), 2);
        queue.ack(0);
        assert_eq!(queue.slice_to_batch(1).len(), 1);
        queue.ack(1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn connect_reply_closes_a_batch_and_replays_it() {
        let session = Session::new(BrowserId::random());
        let extension = AckSessionExtension::new();

        // A broadcast delivered under batch 0.
        let mut delivery = message(json!({"channel": "/foo", "data": "d"}));
        assert!(extension.outgoing(&session, &mut delivery).await.expect("outgoing"));

        // The connect reply stamps ack=0 and closes the batch.
        let mut reply = message(json!({"channel": "/meta/connect", "id": 9, "successful": true}));
        assert!(extension.outgoing(&session, &mut reply).await.expect("outgoing"));
        assert_eq!(reply.ext().and_then(|e| e.get("ack")), Some(&json!(0)));

        // The drained queue is replaced by the replay slice.
        let replay = extension.dequeue(&session, Vec::new(), &reply).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].channel(), Some("/foo"));
    }

    #[tokio::test]
    async fn acked_batches_are_dropped_and_backlog_forces_immediate_reply() {
        let session = Session::new(BrowserId::random());
        let extension = AckSessionExtension::new();

        let mut delivery = message(json!({"channel": "/foo", "data": "d"}));
        let _ = extension.outgoing(&session, &mut delivery).await.expect("outgoing");

        // Client acks nothing yet; backlog exists and the live queue is
        // empty, so the connect is told not to hold.
        let mut connect =
            message(json!({"channel": "/meta/connect", "ext": {"ack": -1}}));
        let _ = extension.incoming(&session, &mut connect).await.expect("incoming");
        assert_eq!(connect.advice_ms("timeout"), 0);

        // Acking batch 0 clears the backlog; nothing forces the timeout.
        {
            let mut state = extension.state.lock();
            let _ = state.queue.close_batch();
        }
        let mut connect = message(json!({"channel": "/meta/connect", "ext": {"ack": 0}}));
        let _ = extension.incoming(&session, &mut connect).await.expect("incoming");
        assert_eq!(connect.advice_ms("timeout"), -1);
    }
}
