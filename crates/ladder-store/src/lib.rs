//! # ladder-store
//! Persistent [`CascadeStore`](ladder_core::store::CascadeStore) backed by
//! RocksDB. Commits are single write batches checked by the same
//! validation as the in-memory store.

pub mod config;
pub mod storage;

pub use config::StoreConfig;
pub use storage::RocksStore;

use ladder_core::error::StoreError;

/// Open the store described by `config`, creating it if missing.
pub fn open(config: &StoreConfig) -> Result<RocksStore, StoreError> {
    RocksStore::open(config.db_path())
}
