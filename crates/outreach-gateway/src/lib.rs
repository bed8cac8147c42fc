//! # Outreach Gateway
//! HTTP surface over the Outreach engine: the cron trigger, normalized
//! provider webhooks, inbound leads, test sends, sequence and enrollment
//! lifecycle, A/B evaluation and queue stats.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
