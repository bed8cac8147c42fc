//! # Outreach Core
//!
//! Shared domain types, the channel adapter trait, error taxonomy, and
//! configuration for the Outreach retention engine.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::OutreachConfig;
pub use error::{OutreachError, Result};
pub use traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
pub use types::*;
