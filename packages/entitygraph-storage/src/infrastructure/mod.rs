//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process adapters for tests and throwaway runs
//! - `ttl`: moka-backed expiring markers
//! - `sqlite`: durable adapter (feature `sqlite`)

pub mod memory;
pub mod ttl;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryCanonicalStore, InMemoryKeyValueStore};
pub use ttl::MokaTtlCache;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCanonicalStore, SqliteKeyValueStore};
