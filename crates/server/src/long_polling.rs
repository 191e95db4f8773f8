use core::fmt::Write as _;
use std::sync::Arc;

use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{post, MethodRouter};
use axum::Extension;
use bayeux_server_primitives::protocol;
use bayeux_server_primitives::{BrowserId, Message};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::config::{Options, ServerConfig};
use crate::events::ServerEvent;
use crate::session::Session;
use crate::waiter::{LongPollWaiter, WakeReason};

pub(crate) struct ServiceState {
    broker: Arc<Broker>,
}

/// Mounts the Bayeux long-polling endpoint. Only POST is served; anything
/// else is a protocol violation and answers 400.
pub fn service(
    config: &ServerConfig,
    broker: Arc<Broker>,
) -> Option<(&'static str, MethodRouter)> {
    if let Some(lp) = &config.long_polling {
        if !lp.enabled {
            info!("Long-polling transport is disabled");
            return None;
        }
    }

    let path = "/bayeux";

    for listen in &config.listen {
        info!("Bayeux long-polling server listening on {}{{{}}}", listen, path);
    }

    let state = Arc::new(ServiceState { broker });

    Some((
        path,
        post(handle_request)
            .fallback(unsupported_method)
            .layer(Extension(state)),
    ))
}

async fn unsupported_method() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn handle_request(
    Extension(state): Extension<Arc<ServiceState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let messages: Vec<Message> = match serde_json::from_str(&body) {
        Ok(messages) => messages,
        Err(err) => {
            debug!(%err, "failed to parse request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if messages.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    // A handshake must be the only message in its request.
    if messages.len() > 1
        && messages
            .iter()
            .any(|m| m.channel() == Some(protocol::META_HANDSHAKE))
    {
        debug!("handshake bundled with other messages");
        return StatusCode::BAD_REQUEST.into_response();
    }

    state.handle_batch(&headers, messages).await
}

impl ServiceState {
    async fn handle_batch(&self, headers: &HeaderMap, messages: Vec<Message>) -> Response {
        let broker = &self.broker;
        let options = broker.options();

        let existing_browser = cookie_value(headers, &options.browser_cookie_name)
            .and_then(|value| value.parse::<BrowserId>().ok());
        let browser_id = existing_browser.unwrap_or_else(BrowserId::random);

        let first_channel = messages[0].channel().unwrap_or_default().to_owned();
        let is_handshake = first_channel == protocol::META_HANDSHAKE;
        let is_connect = first_channel == protocol::META_CONNECT;

        let session: Option<Arc<Session>> = if is_handshake {
            Some(broker.new_session(browser_id))
        } else {
            messages[0]
                .client_id()
                .and_then(|client_id| broker.session_for(client_id, &browser_id))
        };

        // Non-connect requests batch their deliveries so the queue drains
        // into this response rather than waking a concurrent held connect
        // midway through the fold.
        let entered_batch = !is_connect && session.is_some();
        if entered_batch {
            if let Some(session) = &session {
                session.start_batch();
            }
        }

        let mut replies: Vec<Message> = Vec::with_capacity(messages.len());
        let mut send_queue = false;
        let mut schedule_expiration = false;
        let mut connect_index: Option<usize> = None;

        for message in messages {
            let channel = message.channel().unwrap_or_default().to_owned();
            let reply = match broker.process(session.as_ref(), message).await {
                Ok(reply) => reply,
                Err(err) => {
                    error!(%err, "message processing failed");
                    self.exit_batch(entered_batch, session.as_ref());
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };

            match channel.as_str() {
                protocol::META_HANDSHAKE => schedule_expiration = true,
                protocol::META_CONNECT => {
                    send_queue = true;
                    schedule_expiration = true;
                    connect_index = Some(replies.len());
                }
                _ => {
                    if let Some(session) = &session {
                        send_queue |= !session.meta_connect_delivery_only();
                    }
                }
            }
            replies.push(reply);
        }

        if let (Some(index), Some(session)) = (connect_index, session.as_ref()) {
            let sole = replies.len() == 1;
            let successful = replies[index].successful() == Some(true);
            let idle = session.queue_is_empty() || session.is_batching();
            let effective_timeout = session.calculate_timeout(options.timeout);

            if sole && successful && idle {
                if !broker.try_acquire_hold(&browser_id) {
                    multiple_clients_advice(&mut replies[index], options);
                } else if effective_timeout == 0 {
                    broker.release_hold(&browser_id);
                } else if !self.hold(session, &browser_id, effective_timeout).await {
                    // Preempted by a newer connect: the duplicate status with
                    // no body, and nothing else happens to this session here.
                    let status =
                        StatusCode::from_u16(options.duplicate_meta_connect_http_response_code)
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    return status.into_response();
                }
            }

            broker.finalize_reply(session, &mut replies[index]).await;
        }

        self.exit_batch(entered_batch, session.as_ref());

        let mut payload: Vec<Message> = Vec::new();
        if send_queue {
            if let Some(session) = &session {
                let drained = session.drain_queue();
                let drained = match connect_index {
                    Some(index) => session.apply_dequeue_hooks(drained, &replies[index]).await,
                    None => drained,
                };
                payload.extend(drained);
            }
        }

        // The connect reply always closes its response array.
        if let Some(index) = connect_index {
            let connect_reply = replies.remove(index);
            replies.push(connect_reply);
        }
        payload.extend(replies);

        if schedule_expiration {
            if let Some(session) = &session {
                session.schedule_expiration(options.interval, options.max_interval);
            }
        }

        let set_cookie = (is_handshake
            && existing_browser.is_none()
            && payload.last().and_then(Message::successful) == Some(true))
        .then(|| browser_cookie(options, &browser_id));

        let mut response = json_response(StatusCode::OK, &payload);
        if let Some(cookie) = set_cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                let _ = response.headers_mut().insert(SET_COOKIE, value);
            }
        }
        response
    }

    /// Suspends a `/meta/connect` until a message arrives, a newer connect
    /// preempts it, or the timeout lapses. Returns `false` on preemption.
    async fn hold(&self, session: &Arc<Session>, browser_id: &BrowserId, timeout_ms: u64) -> bool {
        let broker = &self.broker;

        let (waiter, rx) = LongPollWaiter::new(Arc::downgrade(broker), *browser_id);
        session.attach_waiter(&waiter);
        broker.emit(ServerEvent::Suspended {
            session: session.id(),
            timeout: timeout_ms,
        });
        debug!(session_id = %session.id(), timeout_ms, "meta connect suspended");

        let options = broker.options();
        let guard = SuspendGuard {
            session: Arc::clone(session),
            waiter: Arc::clone(&waiter),
            interval: options.interval,
            max_interval: options.max_interval,
            armed: true,
        };

        let (normal, timed_out) = match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(WakeReason::Message)) => (true, false),
            Ok(Ok(WakeReason::Duplicate)) | Ok(Err(_)) => (false, false),
            Err(_) => {
                // Expired on our own clock; consume the waiter so the hold
                // slot is released and late flushes become no-ops.
                let _ = session.take_waiter_if(&waiter);
                let _ = waiter.wake(WakeReason::Message);
                (true, true)
            }
        };
        guard.complete();

        if normal {
            debug!(session_id = %session.id(), timed_out, "meta connect resumed");
            broker.emit(ServerEvent::Resumed {
                session: session.id(),
                timed_out,
            });
        }
        normal
    }

    fn exit_batch(&self, entered: bool, session: Option<&Arc<Session>>) {
        if !entered {
            return;
        }
        if let Some(session) = session {
            if let Some(waiter) = session.end_batch() {
                let _ = waiter.wake(WakeReason::Message);
            }
        }
    }
}

/// Covers one held connect from arming to completion. If the handler future
/// is dropped mid-hold (client hung up), the waiter is consumed so its hold
/// slot frees up and the session goes back on the sweeper's clock.
struct SuspendGuard {
    session: Arc<Session>,
    waiter: Arc<LongPollWaiter>,
    interval: u64,
    max_interval: u64,
    armed: bool,
}

impl SuspendGuard {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self.session.take_waiter_if(&self.waiter);
        if self.waiter.wake(WakeReason::Message) {
            debug!(session_id = %self.session.id(), "held connect abandoned by client");
        }
        self.session
            .schedule_expiration(self.interval, self.max_interval);
    }
}

fn multiple_clients_advice(reply: &mut Message, options: &Options) {
    let multi_session_interval = options.multi_session_interval;
    let advice = reply.advice_mut();
    let _ = advice.insert("multiple-clients".to_owned(), serde_json::json!(true));
    if multi_session_interval > 0 {
        let _ = advice.insert(
            "reconnect".to_owned(),
            serde_json::json!(protocol::reconnect::RETRY),
        );
        let _ = advice.insert(
            "interval".to_owned(),
            serde_json::json!(multi_session_interval),
        );
    } else {
        let _ = advice.insert(
            "reconnect".to_owned(),
            serde_json::json!(protocol::reconnect::NONE),
        );
        reply.set_successful(false);
    }
}

/// Serializes the payload from each message's cached wire form, so queued
/// messages go out with the exact bytes they were accepted with.
fn json_response(status: StatusCode, payload: &[Message]) -> Response {
    let mut body = String::from("[");
    for (i, message) in payload.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(message.serialized());
    }
    body.push(']');

    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get_all(COOKIE).iter().find_map(|value| {
        let value = value.to_str().ok()?;
        value.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    })
}

fn browser_cookie(options: &Options, browser: &BrowserId) -> String {
    let mut cookie = format!("{}={browser}; Path=/", options.browser_cookie_name);
    if options.browser_cookie_http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.browser_cookie_secure {
        cookie.push_str("; Secure");
    }
    if let Some(same_site) = options.browser_cookie_same_site {
        let _ = write!(cookie, "; SameSite={same_site}");
    }
    cookie
}
