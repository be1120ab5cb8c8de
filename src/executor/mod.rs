//! Durable Executor Module
//!
//! Runs tasks on the member that owns the task's partition and keeps each
//! result in a replicated, fixed-size ring so it can be retrieved later by
//! task id, from any member, even after the owner is gone.
//!
//! ## Architecture Overview
//! 1. **Submission**: the client-side `service` encodes the task once and the
//!    `invocation` layer routes it to the partition primary.
//! 2. **Admission**: the primary's `partition` container assigns the next task
//!    id and asks the worker `pool` to run or queue it; a saturated pool
//!    rejects.
//! 3. **Retention**: every slot write lands in the `ring` and is pushed to the
//!    partition backups before the caller hears about it.
//! 4. **Completion**: clients wait through a `future` that fires callbacks
//!    exactly once.
//! 5. **Handover**: the `engine` moves partitions between members on
//!    membership changes; a promoted backup re-runs what was still in flight.
//!
//! ## Submodules
//! - **`task`** / **`registry`**: the task trait, capabilities, and the
//!   type-erased runners keyed by task type name.
//! - **`lifecycle`**: per-name shutdown/termination state and local stats.
//! - **`protocol`**: internal operations and the public JSON API.

pub mod engine;
pub mod future;
pub mod handlers;
pub mod invocation;
pub mod lifecycle;
pub mod partition;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod service;
pub mod task;
pub mod types;
