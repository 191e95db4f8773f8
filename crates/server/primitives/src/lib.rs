pub mod channel;
pub mod id;
pub mod message;
pub mod protocol;

pub use channel::{ChannelId, ChannelKind, InvalidChannel};
pub use id::{BrowserId, InvalidId, SessionId};
pub use message::Message;
