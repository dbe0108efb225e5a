//! fleetcheck-autoscale — applies health verdicts to scaling group membership.
//!
//! Each instance's standing in its autoscaling group is kept as a
//! `Membership` record in the state store. The `MembershipPublisher`
//! implements the health crate's `HealthPublisher` seam over it.
//!
//! # Grace periods
//!
//! ```text
//! verdict == Unhealthy
//!   && respect_grace_period
//!   && now < launched_at + grace_period_secs
//!       → Deferred (membership untouched)
//!
//! membership.health == verdict → Unchanged
//! otherwise                    → Applied
//! ```
//!
//! A `Healthy` verdict is never deferred, so recovery always lands.

pub mod membership;

pub use membership::MembershipPublisher;
