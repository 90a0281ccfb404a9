//! redb table definitions for the Convoy object store.
//!
//! Resource values are JSON-serialized domain types. Composite keys follow
//! the pattern `{kind}/{namespace}/{name}` so a kind is a key prefix.

use redb::TableDefinition;

/// Resources keyed by `{kind}/{namespace}/{name}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Store-wide counters: the resource version and the sample sequence.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Metric samples keyed by `{resource_key}:{metric}:{timestamp:020}:{seq:020}`.
pub const SAMPLES: TableDefinition<&str, &[u8]> = TableDefinition::new("samples");

/// Key in [`META`] holding the last issued resource version.
pub const VERSION_KEY: &str = "resource_version";

/// Key in [`META`] holding the last issued sample sequence number.
pub const SAMPLE_SEQ_KEY: &str = "sample_seq";
