//! Cluster Layer
//!
//! Everything the executor needs to know about other members.
//!
//! ## Submodules
//! - **`membership`**: the membership view consumed by the partitioner, and
//!   the UDP gossip implementation used by the binary (Alive -> Suspect ->
//!   Dead, incarnation-based merge).
//! - **`partitioner`**: key hashing and the partition table (primary plus
//!   backups per partition) derived from the member list.
//! - **`transport`**: the seam operations cross between members, with the
//!   bincode framing shared by every implementation.
//! - **`http`**: transport over HTTP and the internal route serving it.
//! - **`local`**: an in-process cluster used by tests.

pub mod http;
pub mod local;
pub mod membership;
pub mod partitioner;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;
