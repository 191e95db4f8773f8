use bayeux_server_primitives::{ChannelId, SessionId};

/// Lifecycle notifications published on the broker's broadcast channel.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    SessionAdded {
        session: SessionId,
    },
    SessionRemoved {
        session: SessionId,
        /// `true` when the sweeper expired the session rather than the
        /// client disconnecting.
        timeout: bool,
    },
    ChannelAdded {
        channel: ChannelId,
    },
    ChannelRemoved {
        channel: ChannelId,
    },
    Subscribed {
        session: SessionId,
        channel: ChannelId,
    },
    Unsubscribed {
        session: SessionId,
        channel: ChannelId,
    },
    /// A `/meta/connect` was put on hold for up to `timeout` ms.
    Suspended {
        session: SessionId,
        timeout: u64,
    },
    Resumed {
        session: SessionId,
        timed_out: bool,
    },
}
