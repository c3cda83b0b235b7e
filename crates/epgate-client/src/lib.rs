pub mod error;
pub mod http;
pub mod media;
pub mod outbound;
pub mod target;
pub mod token;

pub use error::{ClientError, Result};
pub use outbound::{Addressing, DownloadedMedia, OutboundClient};
pub use target::{resolve_target, Target};
pub use token::{HttpTokenFetcher, TokenCache, TokenFetcher};
