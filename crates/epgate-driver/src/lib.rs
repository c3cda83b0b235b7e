//! Agent driver and cross-channel failover policy.
//!
//! This crate owns the [`FlushHandler`](epgate_store::FlushHandler)
//! implementation the conversation store invokes once a batch's debounce
//! timer fires — everything from routing and command authorization through
//! streamed block delivery to Bot-window timeout/media failover lives in
//! [`driver::Driver`].

pub mod commands;
pub mod driver;
pub mod error;
pub mod markdown;
pub mod media;
pub mod template_card;

pub use driver::Driver;
pub use error::{DriverError, Result};
pub use markdown::TableMode;
