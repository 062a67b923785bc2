//! Storage location for a persistent cascade.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a [`RocksStore`](crate::RocksStore) keeps its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ladder");
        Self { data_dir }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// Path to the RocksDB cascade directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cascade")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_data_dir_ends_with_ladder() {
        let cfg = StoreConfig::default();
        assert!(cfg.data_dir.ends_with("ladder"), "got {:?}", cfg.data_dir);
    }

    #[test]
    fn db_path_is_under_data_dir() {
        let cfg = StoreConfig::new("/tmp/ladder-test");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/ladder-test/cascade"));
    }
}
