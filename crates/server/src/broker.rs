use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bayeux_server_primitives::protocol::{self, error_code};
use bayeux_server_primitives::{BrowserId, ChannelId, ChannelKind, Message, SessionId};
use eyre::Result as EyreResult;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::channel::Channel;
use crate::config::Options;
use crate::error::PublishError;
use crate::events::ServerEvent;
use crate::extension::{fold_session_outgoing, Extension};
use crate::policy::{PermitAll, SecurityPolicy};
use crate::session::Session;
use crate::sweeper;
use crate::waiter::WakeReason;

#[derive(Default)]
struct BrowserGroup {
    sessions: HashSet<SessionId>,
    holds: u32,
}

/// The aggregate root: owns the channel and session registries, runs the
/// message pipeline, and produces replies. There is no process-wide state;
/// everything hangs off one `Broker`.
pub struct Broker {
    options: Options,
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    browsers: Mutex<HashMap<BrowserId, BrowserGroup>>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    policy: RwLock<Arc<dyn SecurityPolicy>>,
    events: broadcast::Sender<ServerEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Builds a broker with the five meta channels in place and the sweeper
    /// running. Must be called within a tokio runtime.
    pub fn new(options: Options) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let sweep_period = Duration::from_millis(options.sweep_period.max(1));

        let broker = Arc::new(Self {
            options,
            channels: RwLock::default(),
            sessions: RwLock::default(),
            browsers: Mutex::default(),
            extensions: RwLock::default(),
            policy: RwLock::new(Arc::new(PermitAll)),
            events,
            sweeper: Mutex::default(),
        });

        {
            let mut channels = broker.channels.write();
            for name in protocol::META_CHANNELS {
                let id = ChannelId::new(name).expect("static meta channel name");
                let _ = channels.insert(id.clone(), Channel::new(id));
            }
        }

        *broker.sweeper.lock() = Some(sweeper::spawn(&broker, sweep_period));

        broker
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Subscribes to lifecycle events (sessions, channels, subscriptions,
    /// connect suspensions).
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Stops the sweeper. Held connects are left to the owning HTTP server.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().get(id).cloned()
    }

    /// The channel registered under `id`, created if absent.
    pub fn create_channel(&self, id: ChannelId) -> Arc<Channel> {
        if let Some(channel) = self.channel(&id) {
            return channel;
        }
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(&id) {
            return Arc::clone(channel);
        }
        let channel = Channel::new(id.clone());
        let _ = channels.insert(id.clone(), Arc::clone(&channel));
        drop(channels);
        self.emit(ServerEvent::ChannelAdded { channel: id });
        channel
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Resolves a `clientId` against the sessions owned by `browser`.
    pub(crate) fn session_for(&self, client_id: &str, browser: &BrowserId) -> Option<Arc<Session>> {
        let id: SessionId = client_id.parse().ok()?;
        self.session(&id)
            .filter(|session| session.browser_id() == *browser)
    }

    pub fn set_policy(&self, policy: Arc<dyn SecurityPolicy>) {
        *self.policy.write() = policy;
    }

    fn policy(&self) -> Arc<dyn SecurityPolicy> {
        Arc::clone(&self.policy.read())
    }

    pub fn add_extension(&self, extension: Arc<dyn Extension>) {
        self.extensions.write().push(extension);
    }

    pub fn remove_extension(&self, extension: &Arc<dyn Extension>) {
        self.extensions
            .write()
            .retain(|e| !Arc::ptr_eq(e, extension));
    }

    fn extensions_snapshot(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.read().clone()
    }

    /// One concurrent suspended connect slot per browser, capped by
    /// `max_sessions_per_browser` (-1 unlimited, 0 forbid).
    pub(crate) fn try_acquire_hold(&self, browser: &BrowserId) -> bool {
        let max = self.options.max_sessions_per_browser;
        if max == 0 {
            return false;
        }
        let mut browsers = self.browsers.lock();
        let group = browsers.entry(*browser).or_default();
        if max < 0 || u64::from(group.holds) < max as u64 {
            group.holds += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn release_hold(&self, browser: &BrowserId) {
        let mut browsers = self.browsers.lock();
        if let Some(group) = browsers.get_mut(browser) {
            group.holds = group.holds.saturating_sub(1);
            if group.holds == 0 && group.sessions.is_empty() {
                let _ = browsers.remove(browser);
            }
        }
    }

    fn register_session(&self, session: &Arc<Session>) {
        let _ = self
            .sessions
            .write()
            .insert(session.id(), Arc::clone(session));
        let _ = self
            .browsers
            .lock()
            .entry(session.browser_id())
            .or_default()
            .sessions
            .insert(session.id());
        debug!(session_id = %session.id(), "session registered");
        self.emit(ServerEvent::SessionAdded {
            session: session.id(),
        });
    }

    /// Takes the session out of the registry and unsubscribes a snapshot of
    /// its channels. `timeout` distinguishes sweeper expiry from an orderly
    /// disconnect.
    pub(crate) fn remove_session(&self, session: &Arc<Session>, timeout: bool) {
        let removed = self.sessions.write().remove(&session.id()).is_some();

        {
            let mut browsers = self.browsers.lock();
            if let Some(group) = browsers.get_mut(&session.browser_id()) {
                let _ = group.sessions.remove(&session.id());
                if group.sessions.is_empty() && group.holds == 0 {
                    let _ = browsers.remove(&session.browser_id());
                }
            }
        }

        session.set_handshaken(false);

        for channel_id in session.subscriptions() {
            if let Some(channel) = self.channel(&channel_id) {
                if channel.remove_subscriber(&session.id()) {
                    self.emit(ServerEvent::Unsubscribed {
                        session: session.id(),
                        channel: channel_id.clone(),
                    });
                }
            }
            let _ = session.remove_subscription(&channel_id);
        }

        if removed {
            self.emit(ServerEvent::SessionRemoved {
                session: session.id(),
                timeout,
            });
        }
    }

    /// Publishes `data` on a broadcast channel from server-side code, outside
    /// any HTTP request.
    pub async fn publish(
        self: &Arc<Self>,
        channel: &str,
        data: Value,
    ) -> Result<(), PublishError> {
        let channel_id = ChannelId::new(channel)?;
        if !channel_id.is_broadcast() {
            return Err(PublishError::NotBroadcast(channel_id));
        }

        let mut message = Message::new();
        message.set_channel(channel);
        message.set_data(data);

        let channel = self.create_channel(channel_id);
        if let Err(err) = self.dispatch(None, &channel, &mut message, None).await {
            error!(channel = %channel.id(), %err, "local publish failed");
        }
        Ok(())
    }

    /// Runs one inbound message through the pipeline and returns its reply.
    ///
    /// `session` is `None` when the transport could not resolve the client;
    /// replies to `/meta/connect` are *not* folded through the outgoing
    /// chains here — the transport finalizes them when the response is
    /// actually assembled, which for a held connect is after the resume.
    pub(crate) async fn process(
        self: &Arc<Self>,
        session: Option<&Arc<Session>>,
        mut message: Message,
    ) -> EyreResult<Message> {
        let mut reply = Message::reply_to(&message);
        let channel_name = message.channel().map(str::to_owned);

        let Some(session) = session else {
            reply.set_error(error_code::SESSION_UNKNOWN);
            if let Some(protocol::META_HANDSHAKE | protocol::META_CONNECT) =
                channel_name.as_deref()
            {
                let advice = reply.advice_mut();
                let _ = advice.insert("reconnect".to_owned(), json!(protocol::reconnect::HANDSHAKE));
                let _ = advice.insert("interval".to_owned(), json!(0));
            }
            return Ok(reply);
        };

        let channel_id = channel_name
            .as_deref()
            .and_then(|name| ChannelId::new(name).ok());
        let Some(channel_id) = channel_id else {
            reply.set_error(error_code::CHANNEL_MISSING);
            self.finalize_reply(session, &mut reply).await;
            return Ok(reply);
        };

        let is_connect = channel_id.as_str() == protocol::META_CONNECT;
        session.cancel_expiration(is_connect);

        debug!(session_id = %session.id(), channel = %channel_id, "processing message");

        let mut deleted = false;
        for extension in self.extensions_snapshot() {
            if !extension.incoming(self, session, &mut message).await? {
                deleted = true;
                break;
            }
        }
        if !deleted {
            for extension in session.extensions() {
                match extension.incoming(session, &mut message).await {
                    Ok(true) => {}
                    Ok(false) => {
                        deleted = true;
                        break;
                    }
                    Err(err) => {
                        error!(session_id = %session.id(), %err, "session incoming extension failed");
                    }
                }
            }
        }

        if deleted {
            reply.set_error(error_code::MESSAGE_DELETED);
        } else if let Some(channel) = self.resolve_channel(session, &channel_id, &message).await? {
            let permitted = channel_id.is_meta()
                || self
                    .policy()
                    .can_publish(self, session, &channel_id, &message)
                    .await?;
            if permitted {
                self.dispatch(Some(session), &channel, &mut message, Some(&mut reply))
                    .await?;
            } else {
                reply.set_error(error_code::PUBLISH_DENIED);
            }
        } else {
            reply.set_error(error_code::CHANNEL_DENIED);
        }

        if !is_connect {
            self.finalize_reply(session, &mut reply).await;
        }
        Ok(reply)
    }

    async fn resolve_channel(
        self: &Arc<Self>,
        session: &Arc<Session>,
        channel_id: &ChannelId,
        message: &Message,
    ) -> EyreResult<Option<Arc<Channel>>> {
        if let Some(channel) = self.channel(channel_id) {
            return Ok(Some(channel));
        }
        if self
            .policy()
            .can_create(self, session, channel_id, message)
            .await?
        {
            Ok(Some(self.create_channel(channel_id.clone())))
        } else {
            Ok(None)
        }
    }

    /// The publish step: wildcard-ancestor listener walk, outgoing extension
    /// fold, then meta dispatch or broadcast fan-out.
    async fn dispatch(
        self: &Arc<Self>,
        sender: Option<&Arc<Session>>,
        channel: &Arc<Channel>,
        message: &mut Message,
        mut reply: Option<&mut Message>,
    ) -> EyreResult<()> {
        let channel_id = channel.id().clone();

        let mut walk = channel_id.wild_parents();
        walk.push(channel_id.clone());

        for link in &walk {
            let Some(node) = self.channel(link) else {
                continue;
            };
            for listener in node.listeners() {
                match listener.on_message(self, &channel_id, sender, message).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Some(reply) = reply.as_deref_mut() {
                            reply.set_error(error_code::MESSAGE_DELETED);
                        }
                        return Ok(());
                    }
                    Err(err) => {
                        error!(channel = %channel_id, %err, "channel listener failed");
                    }
                }
            }
        }

        for extension in self.extensions_snapshot().iter().rev() {
            match extension.outgoing(self, sender, None, message).await {
                Ok(true) => {}
                Ok(false) => {
                    // Delivery suppressed; the publish itself still succeeded.
                    if let Some(reply) = reply.as_deref_mut() {
                        reply.set_successful(true);
                    }
                    return Ok(());
                }
                Err(err) => error!(channel = %channel_id, %err, "server outgoing extension failed"),
            }
        }

        match channel_id.kind() {
            ChannelKind::Meta => {
                if let (Some(session), Some(reply)) = (sender, reply.as_deref_mut()) {
                    self.handle_meta(session, &channel_id, message, reply).await?;
                }
            }
            ChannelKind::Service => {
                if let Some(reply) = reply.as_deref_mut() {
                    reply.set_successful(true);
                }
            }
            ChannelKind::Broadcast => {
                if let Some(reply) = reply.as_deref_mut() {
                    reply.set_successful(true);
                }
                self.fan_out(sender, &walk, message).await;
            }
        }

        Ok(())
    }

    /// Serializes the message once and queues it on every subscriber found
    /// across the channel and its wildcard ancestors.
    async fn fan_out(&self, sender: Option<&Arc<Session>>, walk: &[ChannelId], message: &Message) {
        let _ = message.serialized();

        let mut seen = HashSet::new();
        for link in walk {
            let Some(node) = self.channel(link) else {
                continue;
            };
            for subscriber in node.subscribers() {
                if !seen.insert(subscriber) {
                    continue;
                }
                let Some(target) = self.session(&subscriber) else {
                    continue;
                };
                target.deliver(sender, message.clone()).await;
            }
        }
    }

    async fn handle_meta(
        self: &Arc<Self>,
        session: &Arc<Session>,
        channel_id: &ChannelId,
        message: &Message,
        reply: &mut Message,
    ) -> EyreResult<()> {
        match channel_id.as_str() {
            protocol::META_HANDSHAKE => self.handle_handshake(session, message, reply).await,
            protocol::META_CONNECT => {
                self.handle_connect(session, message, reply);
                Ok(())
            }
            protocol::META_SUBSCRIBE => self.handle_subscribe(session, message, reply).await,
            protocol::META_UNSUBSCRIBE => {
                self.handle_unsubscribe(session, message, reply);
                Ok(())
            }
            protocol::META_DISCONNECT => {
                self.handle_disconnect(session, reply);
                Ok(())
            }
            _ => {
                // Only the five built-in meta channels process traffic.
                reply.set_error(error_code::CHANNEL_DENIED);
                Ok(())
            }
        }
    }

    async fn handle_handshake(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message: &Message,
        reply: &mut Message,
    ) -> EyreResult<()> {
        if !self.policy().can_handshake(self, session, message).await? {
            reply.set_error(error_code::HANDSHAKE_DENIED);
            let _ = reply
                .advice_mut()
                .insert("reconnect".to_owned(), json!(protocol::reconnect::NONE));
            return Ok(());
        }

        session.set_handshaken(true);
        self.register_session(session);

        reply.set_successful(true);
        reply.set_client_id(session.id().to_string());
        reply.set_version(protocol::VERSION);
        reply.set_supported_connection_types(&[protocol::LONG_POLLING]);
        let advice = reply.advice_mut();
        let _ = advice.insert("reconnect".to_owned(), json!(protocol::reconnect::RETRY));
        let _ = advice.insert("timeout".to_owned(), json!(self.options.timeout));
        let _ = advice.insert("interval".to_owned(), json!(self.options.interval));
        Ok(())
    }

    fn handle_connect(&self, session: &Arc<Session>, message: &Message, reply: &mut Message) {
        // A newer connect preempts whatever the session had on hold.
        if let Some(waiter) = session.take_waiter() {
            let _ = waiter.wake(WakeReason::Duplicate);
        }

        session.set_client_advice(message.advice_ms("timeout"), message.advice_ms("interval"));
        reply.set_successful(true);
    }

    async fn handle_subscribe(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message: &Message,
        reply: &mut Message,
    ) -> EyreResult<()> {
        if let Some(subscription) = message.subscription() {
            reply.insert("subscription", subscription.clone());
        }

        let channels = match Self::subscription_channels(message) {
            Ok(channels) => channels,
            Err(code) => {
                reply.set_error(code);
                return Ok(());
            }
        };

        // All-or-nothing: no subscription commits unless every one is
        // permitted.
        for channel in &channels {
            if channel.is_meta() {
                continue;
            }
            if !self
                .policy()
                .can_subscribe(self, session, channel, message)
                .await?
            {
                reply.set_error(error_code::SUBSCRIBE_DENIED);
                return Ok(());
            }
        }

        if !session.is_handshaken() {
            reply.set_error(error_code::SUBSCRIBE_FAILED);
            return Ok(());
        }

        for channel_id in channels {
            if channel_id.is_meta() {
                continue;
            }
            let channel = self.create_channel(channel_id.clone());
            if channel.insert_subscriber(session.id()) {
                let _ = session.add_subscription(channel_id.clone());
                self.emit(ServerEvent::Subscribed {
                    session: session.id(),
                    channel: channel_id,
                });
            }
        }

        reply.set_successful(true);
        Ok(())
    }

    fn handle_unsubscribe(&self, session: &Arc<Session>, message: &Message, reply: &mut Message) {
        if let Some(subscription) = message.subscription() {
            reply.insert("subscription", subscription.clone());
        }

        let channels = match Self::subscription_channels(message) {
            Ok(channels) => channels,
            Err(code) => {
                reply.set_error(if code == error_code::SUBSCRIBE_FAILED {
                    error_code::UNSUBSCRIBE_FAILED
                } else {
                    code
                });
                return;
            }
        };

        for channel_id in channels {
            // Unknown channels are silently skipped.
            let Some(channel) = self.channel(&channel_id) else {
                continue;
            };
            if channel.remove_subscriber(&session.id()) {
                let _ = session.remove_subscription(&channel_id);
                self.emit(ServerEvent::Unsubscribed {
                    session: session.id(),
                    channel: channel_id,
                });
            }
        }

        reply.set_successful(true);
    }

    fn handle_disconnect(&self, session: &Arc<Session>, reply: &mut Message) {
        reply.set_successful(true);
        self.remove_session(session, false);

        // Flush a held connect so the client's pending request returns.
        if let Some(waiter) = session.take_waiter() {
            let _ = waiter.wake(WakeReason::Message);
        }
    }

    fn subscription_channels(message: &Message) -> Result<Vec<ChannelId>, &'static str> {
        let Some(names) = message.subscription_channels() else {
            return Err(error_code::SUBSCRIPTION_MISSING);
        };
        if names.is_empty() {
            return Err(error_code::SUBSCRIPTION_MISSING);
        }
        names
            .iter()
            .map(|name| ChannelId::new(name))
            .collect::<Result<_, _>>()
            .map_err(|_| error_code::SUBSCRIBE_FAILED)
    }

    /// Folds the outgoing chains over a reply, newest extension first.
    /// Replies are always emitted; a veto here only logs.
    pub(crate) async fn finalize_reply(&self, session: &Arc<Session>, reply: &mut Message) {
        for extension in self.extensions_snapshot().iter().rev() {
            if let Err(err) = extension
                .outgoing(self, Some(session), Some(session), reply)
                .await
            {
                error!(session_id = %session.id(), %err, "server outgoing extension failed");
            }
        }
        let _ = fold_session_outgoing(session, reply).await;
    }

    /// One pass of the periodic reaper: drop empty non-meta channels, expire
    /// overdue sessions.
    pub(crate) fn sweep(&self) {
        let sweepable: Vec<Arc<Channel>> = self
            .channels
            .read()
            .values()
            .filter(|channel| channel.is_sweepable())
            .cloned()
            .collect();
        if !sweepable.is_empty() {
            let mut channels = self.channels.write();
            for channel in sweepable {
                if channel.is_sweepable() && channels.remove(channel.id()).is_some() {
                    self.emit(ServerEvent::ChannelRemoved {
                        channel: channel.id().clone(),
                    });
                }
            }
        }

        let now = Instant::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.is_expired(now))
            .cloned()
            .collect();
        for session in expired {
            warn!(session_id = %session.id(), "sweeping expired session");
            if let Some(waiter) = session.take_waiter() {
                let _ = waiter.wake(WakeReason::Message);
            }
            self.remove_session(&session, true);
        }
    }

    /// A fresh, not-yet-registered session for an incoming handshake.
    pub(crate) fn new_session(&self, browser: BrowserId) -> Arc<Session> {
        Session::new(browser)
    }
}
