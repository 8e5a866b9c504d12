//! Data types for the courier transport session.
//!
//! This crate contains the plain values exchanged between the session core,
//! its collaborators (transports, credential stores, reachability probes) and
//! callers. Nothing here owns behavior beyond small predicates.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: no runtime, no locking, no I/O
//! * Shared: both the core and the concrete transports depend on them
//! * Stable: changes only when the session contract changes
//!
//! Scheduling, renewal and connection state machines live in `courier`.

pub mod background;
pub mod credential;
pub mod push;
pub mod response;
pub mod types;

pub use background::*;
pub use credential::*;
pub use push::*;
pub use response::*;
pub use types::*;
