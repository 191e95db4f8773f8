use std::sync::Arc;

use async_trait::async_trait;
use bayeux_server_primitives::Message;
use eyre::Result as EyreResult;
use tracing::error;

use crate::broker::Broker;
use crate::session::Session;

/// A server-wide message hook. `incoming` runs on every message entering the
/// pipeline, `outgoing` on every message leaving it (broadcasts and replies).
/// Returning `Ok(false)` vetoes the message.
///
/// Incoming errors propagate and fail the request; outgoing hooks should not
/// fail, and errors there are logged and ignored.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn incoming(
        &self,
        broker: &Broker,
        session: &Arc<Session>,
        message: &mut Message,
    ) -> EyreResult<bool> {
        let _ = (broker, session, message);
        Ok(true)
    }

    async fn outgoing(
        &self,
        broker: &Broker,
        sender: Option<&Arc<Session>>,
        session: Option<&Arc<Session>>,
        message: &mut Message,
    ) -> EyreResult<bool> {
        let _ = (broker, sender, session, message);
        Ok(true)
    }
}

/// A per-session message hook, registered on one session.
///
/// Unlike server extensions, a failing session `incoming` hook never drops
/// the user's message: the error is logged and processing continues.
#[async_trait]
pub trait SessionExtension: Send + Sync {
    async fn incoming(&self, session: &Arc<Session>, message: &mut Message) -> EyreResult<bool> {
        let _ = (session, message);
        Ok(true)
    }

    async fn outgoing(&self, session: &Arc<Session>, message: &mut Message) -> EyreResult<bool> {
        let _ = (session, message);
        Ok(true)
    }

    /// Sender-side filtering pass: runs on the *sending* session's chain
    /// before a delivery reaches the receiver's `outgoing` chain.
    async fn outgoing_from(&self, session: &Arc<Session>, message: &mut Message) -> EyreResult<bool> {
        let _ = (session, message);
        Ok(true)
    }

    /// Rewrites the queue drained into a `/meta/connect` response.
    async fn dequeue(
        &self,
        session: &Arc<Session>,
        drained: Vec<Message>,
        connect_reply: &Message,
    ) -> Vec<Message> {
        let _ = (session, connect_reply);
        drained
    }
}

/// Folds a session's outgoing extensions over a message, newest first.
/// Returns `false` when an extension vetoed the message.
pub(crate) async fn fold_session_outgoing(session: &Arc<Session>, message: &mut Message) -> bool {
    for extension in session.extensions().iter().rev() {
        match extension.outgoing(session, message).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                error!(session_id = %session.id(), %err, "session outgoing extension failed");
            }
        }
    }
    true
}

/// The sender-side pass of a delivery, over the sending session's chain.
pub(crate) async fn fold_sender_outgoing(session: &Arc<Session>, message: &mut Message) -> bool {
    for extension in session.extensions().iter().rev() {
        match extension.outgoing_from(session, message).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                error!(session_id = %session.id(), %err, "sender outgoing extension failed");
            }
        }
    }
    true
}
