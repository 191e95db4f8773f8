use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bayeux_server_primitives::{ChannelId, Message, SessionId};
use eyre::Result as EyreResult;
use parking_lot::Mutex;

use crate::broker::Broker;
use crate::session::Session;

/// A callback observing (and possibly vetoing) every message published to a
/// channel. Listeners registered on wildcard channels see matching publishes
/// on their descendants.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Returning `Ok(false)` vetoes the publish: no further listeners run
    /// and the message is not dispatched.
    async fn on_message(
        &self,
        broker: &Broker,
        channel: &ChannelId,
        sender: Option<&Arc<Session>>,
        message: &Message,
    ) -> EyreResult<bool>;
}

/// Registration handle returned by [`Channel::add_listener`].
pub type ListenerId = u64;

#[derive(Default)]
struct ChannelInner {
    subscribers: HashSet<SessionId>,
    listeners: Vec<(ListenerId, Arc<dyn MessageListener>)>,
    next_listener: ListenerId,
}

/// One node of the channel space, holding its subscribers and listeners.
pub struct Channel {
    id: ChannelId,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::default(),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Snapshot of the listeners, in registration order.
    pub(crate) fn listeners(&self) -> Vec<Arc<dyn MessageListener>> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn insert_subscriber(&self, session: SessionId) -> bool {
        self.inner.lock().subscribers.insert(session)
    }

    pub(crate) fn remove_subscriber(&self, session: &SessionId) -> bool {
        self.inner.lock().subscribers.remove(session)
    }

    pub fn subscribers(&self) -> Vec<SessionId> {
        self.inner.lock().subscribers.iter().copied().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Meta channels are never swept; others go once nothing references them.
    pub(crate) fn is_sweepable(&self) -> bool {
        if self.id.is_meta() {
            return false;
        }
        let inner = self.inner.lock();
        inner.subscribers.is_empty() && inner.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl MessageListener for Nop {
        async fn on_message(
            &self,
            _broker: &Broker,
            _channel: &ChannelId,
            _sender: Option<&Arc<Session>>,
            _message: &Message,
        ) -> EyreResult<bool> {
            Ok(true)
        }
    }

    fn chan(name: &str) -> Arc<Channel> {
        Channel::new(ChannelId::new(name).expect(name))
    }

    #[test]
    fn meta_channels_are_never_sweepable() {
        assert!(!chan("/meta/connect").is_sweepable());
        assert!(chan("/chat").is_sweepable());
    }

    #[test]
    fn subscribers_and_listeners_pin_a_channel() {
        let channel = chan("/chat");

        let session = SessionId::random();
        assert!(channel.insert_subscriber(session));
        assert!(!channel.is_sweepable());
        assert!(channel.remove_subscriber(&session));
        assert!(channel.is_sweepable());

        let id = channel.add_listener(Arc::new(Nop));
        assert!(!channel.is_sweepable());
        channel.remove_listener(id);
        assert!(channel.is_sweepable());
    }
}
