//! Chat transport: inbound update decoding and outbound replies.

pub mod events;
pub mod sender;

pub use events::{decode_update, decode_update_str};
pub use sender::{GuardedChatSender, HttpChatSender, LogChatSender};
