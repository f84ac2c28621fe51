//! Multi-tenant WhatsApp messaging gateway.
//!
//! Inbound webhook ingestion and outbound dispatch over the WhatsApp Cloud
//! API, with per-tenant tables, the session window policy, template credit
//! metering and a media relay into durable storage.

pub mod app;
pub mod config;
pub mod effects;
pub mod error;
pub mod graph;
pub mod inbound;
pub mod media;
pub mod outbound;
pub mod policy;
pub mod store;
pub mod tenant;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
