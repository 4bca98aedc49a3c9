//! Sponsorship ledger & budget engine
//!
//! Financial core of a student-sponsorship payment platform: sponsors deposit
//! funds by electronic transfer, an administrator reviews and approves each
//! deposit, sponsors allocate the resulting credit into per-student,
//! per-category budgets, and students spend against those budgets at
//! registered merchants. This crate maintains an auditable, append-only
//! ledger alongside denormalized aggregates that answer balance and
//! availability queries in O(1).
//!
//! The HTTP router, JWT issuance, merchant onboarding, and outbound
//! event/email fan-out are external collaborators and are not implemented
//! here; this crate receives an authenticated principal and merchant
//! metadata by id from its caller.

pub mod aggregates;
pub mod categories;
pub mod config;
pub mod deposits;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod lots;
pub mod merchants;
pub mod rate_limit;
pub mod refunds;
pub mod sponsorship;
pub mod store;
pub mod transactions;

pub use error::{CoreError, Result};
pub use store::StoreAdapter;

/// Monetary amounts are always non-negative integers in minor currency units.
pub type Cents = i64;
