//! Durable Executor Library
//!
//! A partition-routed, replicated task executor for a cluster of members.
//!
//! ## Architecture Modules
//! - **`cluster`**: membership (UDP gossip for the binary, in-process for
//!   tests), partition ownership, and the transports operations travel over.
//! - **`executor`**: the durable executor itself: admission, execution,
//!   result retention, futures, lifecycle and partition handover.
//! - **`node`**: the per-member handle that ties both together.

pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod node;
pub mod tasks;
