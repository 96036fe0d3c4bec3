mod backend;
mod compaction;
mod index;
mod migration;
mod tiered_rib;
mod worker;

pub mod config;

pub use compaction::{CompactionReport, CompactionState, CompactionTask};
pub use migration::{
    MigrationReport, MigrationState, MigrationTask, MigrationTrigger,
    MAX_ATTEMPTS,
};
pub use tiered_rib::TieredRib;

#[cfg(test)]
mod tests;
