use std::sync::Arc;

use async_trait::async_trait;
use bayeux_server_primitives::{ChannelId, Message};
use eyre::Result as EyreResult;

use crate::broker::Broker;
use crate::session::Session;

/// Authorization hooks consulted by the pipeline. A missing override means
/// "permitted"; a returned error fails the whole request.
#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    async fn can_handshake(
        &self,
        broker: &Broker,
        session: &Arc<Session>,
        message: &Message,
    ) -> EyreResult<bool> {
        let _ = (broker, session, message);
        Ok(true)
    }

    async fn can_create(
        &self,
        broker: &Broker,
        session: &Arc<Session>,
        channel: &ChannelId,
        message: &Message,
    ) -> EyreResult<bool> {
        let _ = (broker, session, channel, message);
        Ok(true)
    }

    async fn can_subscribe(
        &self,
        broker: &Broker,
        session: &Arc<Session>,
        channel: &ChannelId,
        message: &Message,
    ) -> EyreResult<bool> {
        let _ = (broker, session, channel, message);
        Ok(true)
    }

    async fn can_publish(
        &self,
        broker: &Broker,
        session: &Arc<Session>,
        channel: &ChannelId,
        message: &Message,
    ) -> EyreResult<bool> {
        let _ = (broker, session, channel, message);
        Ok(true)
    }
}

/// The default policy: everything is allowed.
pub(crate) struct PermitAll;

#[async_trait]
impl SecurityPolicy for PermitAll {}
