//! Bayeux 1.0 wire constants.

pub const VERSION: &str = "1.0";
pub const LONG_POLLING: &str = "long-polling";

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

pub const META_CHANNELS: [&str; 5] = [
    META_HANDSHAKE,
    META_CONNECT,
    META_SUBSCRIBE,
    META_UNSUBSCRIBE,
    META_DISCONNECT,
];

/// Error code strings carried in unsuccessful replies, `code::tag` form.
pub mod error_code {
    pub const CHANNEL_MISSING: &str = "400::channel_missing";
    pub const SESSION_UNKNOWN: &str = "402::session_unknown";
    pub const HANDSHAKE_DENIED: &str = "403::handshake_denied";
    pub const CHANNEL_DENIED: &str = "403::channel_denied";
    pub const PUBLISH_DENIED: &str = "403::publish_denied";
    pub const SUBSCRIBE_DENIED: &str = "403::subscribe_denied";
    pub const SUBSCRIBE_FAILED: &str = "403::subscribe_failed";
    pub const UNSUBSCRIBE_FAILED: &str = "403::unsubscribe_failed";
    pub const SUBSCRIPTION_MISSING: &str = "403::subscription_missing";
    pub const MESSAGE_DELETED: &str = "404::message_deleted";
}

/// `advice.reconnect` values.
pub mod reconnect {
    pub const RETRY: &str = "retry";
    pub const HANDSHAKE: &str = "handshake";
    pub const NONE: &str = "none";
}
