//! fleetcheck-state — durable health records for fleetcheck.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for per-instance health records and autoscaling membership.
//!
//! # Layout
//!
//! ```text
//! <table_name>                     instance_id → HealthRecord (JSON)
//! <table_name>.by_group_last_seen  {group}/{last_seen:020}/{instance_id} → ()
//! memberships                      instance_id → Membership (JSON)
//! provisioning                     table_name → Provisioning (JSON)
//! ```
//!
//! The secondary index is maintained in the same write transaction as the
//! record it points at, so the sweeper's range query never sees a record
//! without its index entry or the reverse.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. It offers single-key atomic
//! operations only; there are no multi-record transactions.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{RecordStore, StateStore};
pub use types::*;
