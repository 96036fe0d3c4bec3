#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

//! A tiered storage engine for a BGP Routing Information Base (RIB).
//!
//! The engine stores one current route per prefix, in memory, on disk, or
//! in both, as selected by a [StorageConfig](rib::config::StorageConfig).
//! With both tiers active, a placement policy decides which tier holds a
//! route, and a background worker migrates routes between the tiers as they
//! get hot or cold. Every write creates a new version of a prefix.
//! Superseded and withdrawn versions on disk are cleaned up by periodic
//! compaction.
//!
//! The disk tier is a log-structured merge tree, provided by the `lsm_tree`
//! crate - the crate that powers `fjall`.
//!
//! ```
//! use std::str::FromStr;
//! use rotonda_tiered_store::addr::Prefix;
//! use rotonda_tiered_store::rib::TieredRib;
//! use rotonda_tiered_store::RouteOperation;
//!
//! let rib = TieredRib::try_default()?;
//! let prefix = Prefix::from_str("10.0.0.0/24")?;
//! let version = rib.apply(prefix, RouteOperation::Insert, "P1")?;
//! assert_eq!(version, 1);
//!
//! let entry = rib.get(&prefix)?.unwrap();
//! assert_eq!(entry.payload.as_bytes(), b"P1");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
mod disk_tier;
mod hot_cache;
mod memory_tier;
mod types;

// re-exports
pub use inetnum::addr;

// Public Interfaces on the root of the crate

/// The tiered RIB, its configuration and its background tasks
pub mod rib;

/// Placement policies for the hybrid backend
pub mod placement;

/// Error types returned by a RIB
pub use types::errors;

/// Statistics and metrics types returned by a RIB
pub use types::stats;

/// Routes, their payloads and the events that change them
pub use types::{
    Payload, RouteEntry, RouteEvent, RouteOperation, TierLocation,
};

/// Helpers for walking the prefixes that cover an address
pub use types::{covering_prefix, max_len};
