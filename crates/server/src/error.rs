//! Error types

use bayeux_server_primitives::{ChannelId, InvalidChannel};
use thiserror::Error as ThisError;

/// Failure of a server-side local publish.
#[derive(Debug, ThisError)]
pub enum PublishError {
    #[error("channel `{0}` is not a broadcast channel")]
    NotBroadcast(ChannelId),
    #[error(transparent)]
    InvalidChannel(#[from] InvalidChannel),
}
