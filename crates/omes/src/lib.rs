//! 🚀 omes — the core library crate, the beating heart, the engine room
//! where rendered log events become `_bulk` requests and `_bulk` requests
//! become somebody else's storage problem.
//!
//! 📦 This crate contains the bulk batch engine, the health-checked
//! round-robin transport, the reply analyzer with its outcome table, the
//! error file, the retry reinjector, and the worker lifecycle that ties
//! them into transactions. 🦆
//!
//! 🧠 Knowledge graph — who talks to whom:
//! ```text
//!   Record → Worker(do_action) → Batch → POST /_bulk → analyze_reply
//!                                                        ├─ stats (response.*)
//!                                                        ├─ ErrorSink (error file)
//!                                                        └─ RetryRuleset (reinjection)
//! ```
//!
//! Embedding hosts use [`action::Module`] / [`action::Worker`] directly and
//! feed [`event::Record`]s; the bundled CLI drives the same machinery
//! through [`run`].

pub mod action;
pub mod app_config;
pub mod bulk;
pub mod event;
pub mod ratelimit;
pub mod retry;
pub mod stats;

pub(crate) mod error_file;
pub(crate) mod health;
pub(crate) mod pipeline;
pub(crate) mod progress;
pub(crate) mod response;
pub(crate) mod transport;
pub(crate) mod url;

use std::sync::Arc;

use anyhow::Result;

pub use transport::Suspended;

/// 🚀 The grand entry point for the CLI: ship every event the input file
/// holds, return the final scoreboard.
pub async fn run(app_config: app_config::AppConfig) -> Result<Arc<stats::Stats>> {
    pipeline::run(app_config).await
}
