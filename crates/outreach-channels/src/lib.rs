//! # Outreach Channels
//! Send adapters, one per channel, behind the `ChannelAdapter` trait.
//!
//! | Channel | Provider |
//! |---|---|
//! | CALL | VAPI |
//! | SMS | Twilio-compatible gateway |
//! | EMAIL | Postmark, falling back to Instantly |
//! | PUSH | PwaFlow |

pub mod email;
pub mod http;
pub mod instantly;
pub mod postmark;
pub mod push;
pub mod registry;
pub mod sms;
pub mod template;
pub mod vapi;

pub use email::EmailAdapter;
pub use registry::AdapterRegistry;
pub use vapi::{CallLog, CallRecord, VapiAdapter};
