//! # rotary
//!
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use call_store;
pub use chrono;
pub use redis_coordination;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::engine::Engine;

pub mod breaker;
pub mod broker;
pub mod campaign;
pub mod cold_start;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod env;
pub mod janitor;
pub mod metrics;
pub mod promoter;
pub mod reconciler;
pub mod telephony;
