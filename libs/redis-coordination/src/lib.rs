//! # redis-coordination
//!
//! Atomic per-campaign slot coordination for the rotary dispatcher: leases,
//! reservation bookkeeping, priority waitlists, promotion gating, cold-start
//! flags, and circuit-breaker state.
//!
//! This library provides:
//! - **Typed models** for waitlist items, lease tokens, ledger entries, and
//!   promotion batches.
//! - **Key builder** with the per-campaign hash tag; no key strings in
//!   runtime paths.
//! - **The [`CoordinationStore`] trait**, whose methods are the atomic units
//!   of the admission protocol.
//! - **Two backends**: [`MemoryStore`] for single-process deployments and
//!   tests, [`RedisStore`] for distributed deployments (one Lua script per
//!   multi-key transition).
//!
//! ## Design Principles
//!
//! - Contention is data, not errors: full campaign, lost race, and duplicate
//!   claim all come back as values the caller can branch on.
//! - The admission invariant `card(leases) + reserved <= limit` is enforced
//!   only inside atomic store operations; client code stays retriable.
//! - Backends are interchangeable: the memory store is the executable
//!   specification the Lua scripts must match.

pub mod error;
pub mod keys;
pub mod memory;
pub mod models;
pub mod redis;
pub mod store;

// Re-export key types for convenient access
pub use error::{CoordinationError, CoordinationResult};
pub use keys::{lease_member, parse_slot_channel, slot_channel, CampaignKeys};
pub use memory::MemoryStore;
pub use models::{
    dial_job_id, ledger_member, CallId, CampaignId, ColdStart, LeaseKind, LeaseToken, LedgerEntry,
    Priority, PromoteBatch, PromotedJob, SlotCounts, WaitlistItem, RECOVERED_TOKEN,
};
pub use crate::redis::RedisStore;
pub use store::CoordinationStore;
