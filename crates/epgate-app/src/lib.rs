pub mod dedupe;
pub mod error;
pub mod handler;
pub mod message;

pub use dedupe::DedupeCache;
pub use error::{AppError, Result};
pub use handler::{AppHandler, AppQuery};
pub use message::{parse_envelope, parse_message, EnvelopeXml, InboundMessage, InboundPayload, RawXmlMessage};
