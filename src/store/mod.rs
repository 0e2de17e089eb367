//! Persistent stores: KV collections, run history, grimoire, telemetry,
//! and the migration log.

pub mod grimoire;
pub mod history;
pub mod kv;
pub mod migrate;
pub mod profile;
pub mod telemetry;
pub mod versions;

pub use grimoire::{Grimoire, GrimoireEntry, GrimoireQuery, GrimoireStats, Inscription};
pub use history::{History, HistoryEntry, HistoryStats, ListOptions, RunRecord};
pub use kv::KvStore;
pub use migrate::{AppliedMigration, Migration, Migrator};
pub use profile::{Profile, ProfileData};
pub use telemetry::{DayRollup, Telemetry, TelemetryRecord, MAX_RECORDS};
pub use versions::{PromptVersion, PromptVersions};

/// A short opaque identifier: the first 12 hex chars of a v4 UUID.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
