pub mod error;
pub mod handler;
pub mod message;
pub mod reply;

pub use error::{BotError, Result};
pub use handler::{build_inbound_body, find_account, BotHandler, BotQuery};
pub use message::{parse_inbound_message, InboundMessage, InboundPayload};
