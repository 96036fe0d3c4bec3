pub(crate) mod prefix_key;
pub(crate) mod route;

pub mod errors;
pub mod stats;

pub use prefix_key::{covering_prefix, max_len};
#[cfg(test)]
pub(crate) use prefix_key::{range_id, KEY_RANGES};
pub use route::{Payload, RouteEntry, RouteEvent, RouteOperation, TierLocation};
pub(crate) use route::now_ms;
