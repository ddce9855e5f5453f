//! chatdesk: multi-platform chat auto-reply service.
//!
//! Inbound messages from Telegram, Facebook Messenger and Instagram are
//! normalized, deduplicated against the store, run through a staged
//! pipeline and answered by an AI generator. A periodic reconciliation scan
//! picks up anything the live path left unanswered.

pub mod cache;
pub mod config;
pub mod error;
pub mod experiment;
pub mod history;
pub mod identity;
pub mod llm;
pub mod model;
pub mod monitoring;
pub mod pipeline;
pub mod platforms;
pub mod store;
pub mod util;
pub mod worker;
