//! Pure state-transition functions for the three stage protocols.
//!
//! Each reducer is total: unknown events are no-ops, events referencing
//! entities that do not exist yet create them, and iteration-scoped fields
//! key on the iteration number rather than arrival order. Reducers perform
//! no I/O; the session controller owns the state they mutate.

pub mod build;
pub mod deploy;
pub mod simulate;
