//! RocksDB-backed persistent cascade storage.
//!
//! Implements [`CascadeStore`] using RocksDB column families for placements,
//! child slots, tree roots, activations, ledger lines, the reconciliation
//! journal, and metadata. Every commit is one atomic [`WriteBatch`].
//!
//! Keys are big-endian composites so related rows are contiguous:
//!
//! | CF | Key | Value |
//! |---|---|---|
//! | `placements` | track · tier · member | `Placement` |
//! | `children` | track · tier · parent | `Children` |
//! | `roots` | track · tier | `MemberId` |
//! | `activations` | member · track · tier | `Activation` |
//! | `ledger` | member · track · tier · seq | `HoldingEntry` |
//! | `unresolved` | id | `UnresolvedEvent` |
//! | `metadata` | name | raw |

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options, WriteBatch, DB};
use tracing::debug;

use ladder_core::error::StoreError;
use ladder_core::store::{validate_write_set, CascadeStore, CommitSummary, WriteSet};
use ladder_core::types::{
    Activation, Children, HoldingEntry, MemberId, Placement, TierKey, TrackId, TreeKey,
    UnresolvedEvent,
};

// --- Column family names ---

const CF_PLACEMENTS: &str = "placements";
const CF_CHILDREN: &str = "children";
const CF_ROOTS: &str = "roots";
const CF_ACTIVATIONS: &str = "activations";
const CF_LEDGER: &str = "ledger";
const CF_UNRESOLVED: &str = "unresolved";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_PLACEMENTS,
    CF_CHILDREN,
    CF_ROOTS,
    CF_ACTIVATIONS,
    CF_LEDGER,
    CF_UNRESOLVED,
    CF_METADATA,
];

// --- Metadata keys ---

const META_LAST_SEQ: &[u8] = b"last_seq";

/// Persistent cascade state.
pub struct RocksStore {
    db: DB,
    /// Last allocated sequence number, persisted on every allocation.
    last_seq: Mutex<u64>,
}

impl RocksStore {
    /// Open or create a database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(map_rocks)?;

        let mut store = Self { db, last_seq: Mutex::new(0) };
        let last = store.get_meta_u64(META_LAST_SEQ)?;
        *store.last_seq.get_mut() = last;
        debug!(path = %path.as_ref().display(), last_seq = last, "cascade store opened");
        Ok(store)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in ALL_CFS {
            let cf = self.cf_handle(name)?;
            self.db.flush_cf(cf).map_err(map_rocks)?;
        }
        Ok(())
    }

    // --- Internal helpers ---

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, key).map_err(map_rocks)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Codec("invalid metadata value length".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    fn get<T: bincode::Decode<()>>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        self.db
            .get_cf(cf, key)
            .map_err(map_rocks)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan<T: bincode::Decode<()>>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(map_rocks)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

impl CascadeStore for RocksStore {
    fn placement(&self, key: &TierKey) -> Result<Option<Placement>, StoreError> {
        self.get(CF_PLACEMENTS, &placement_key(key))
    }

    fn children(&self, parent: &TierKey) -> Result<Children, StoreError> {
        Ok(self.get(CF_CHILDREN, &placement_key(parent))?.unwrap_or_default())
    }

    fn tree_root(&self, tree: &TreeKey) -> Result<Option<MemberId>, StoreError> {
        self.get(CF_ROOTS, &tree_key(tree))
    }

    fn placements_in_tree(&self, tree: &TreeKey) -> Result<Vec<Placement>, StoreError> {
        let mut out: Vec<Placement> = self.scan(CF_PLACEMENTS, &tree_key(tree))?;
        out.sort_by_key(Placement::order_key);
        Ok(out)
    }

    fn activation(&self, key: &TierKey) -> Result<Option<Activation>, StoreError> {
        self.get(CF_ACTIVATIONS, &member_key(key))
    }

    fn activations_for(&self, member: MemberId, track: TrackId) -> Result<Vec<Activation>, StoreError> {
        let mut prefix = Vec::with_capacity(12);
        prefix.extend_from_slice(&member.to_be_bytes());
        prefix.extend_from_slice(&track.0.to_be_bytes());
        self.scan(CF_ACTIVATIONS, &prefix)
    }

    fn holding_entries(&self, key: &TierKey) -> Result<Vec<HoldingEntry>, StoreError> {
        self.scan(CF_LEDGER, &member_key(key))
    }

    fn unresolved_events(&self) -> Result<Vec<UnresolvedEvent>, StoreError> {
        self.scan(CF_UNRESOLVED, &[])
    }

    fn unresolved_event(&self, id: u64) -> Result<Option<UnresolvedEvent>, StoreError> {
        self.get(CF_UNRESOLVED, &id.to_be_bytes())
    }

    fn next_seq(&self) -> Result<u64, StoreError> {
        let mut last = self.last_seq.lock();
        let next = *last + 1;
        let cf = self.cf_handle(CF_METADATA)?;
        self.db
            .put_cf(cf, META_LAST_SEQ, next.to_be_bytes())
            .map_err(map_rocks)?;
        *last = next;
        Ok(next)
    }

    fn commit(&mut self, writes: WriteSet) -> Result<CommitSummary, StoreError> {
        validate_write_set(self, &writes)?;
        let summary = CommitSummary::from(&writes);

        let cf_placements = self.cf_handle(CF_PLACEMENTS)?;
        let cf_children = self.cf_handle(CF_CHILDREN)?;
        let cf_roots = self.cf_handle(CF_ROOTS)?;
        let cf_activations = self.cf_handle(CF_ACTIVATIONS)?;
        let cf_ledger = self.cf_handle(CF_LEDGER)?;
        let cf_unresolved = self.cf_handle(CF_UNRESOLVED)?;

        let mut batch = WriteBatch::default();

        // Placements and the parent rows they touch, staged so a parent
        // placed earlier in the same set gets its counter bumped too.
        let mut staged: HashMap<TierKey, Placement> = HashMap::new();
        let mut slots: HashMap<TierKey, Children> = HashMap::new();
        for placement in writes.placements {
            let key = placement.key();
            match (placement.tree_parent_id, placement.side) {
                (Some(parent), Some(side)) => {
                    let parent_key = TierKey::new(parent, placement.track, placement.tier_no);
                    if !slots.contains_key(&parent_key) {
                        slots.insert(parent_key, self.children(&parent_key)?);
                    }
                    if let Some(children) = slots.get_mut(&parent_key) {
                        children.set(side, placement.member_id);
                    }
                    let parent_row = match staged.remove(&parent_key) {
                        Some(row) => Some(row),
                        None => self.placement(&parent_key)?,
                    };
                    if let Some(mut row) = parent_row {
                        row.filled = row.filled.saturating_add(1);
                        staged.insert(parent_key, row);
                    }
                }
                _ => {
                    batch.put_cf(cf_roots, tree_key(&key.tree()), encode(&placement.member_id)?);
                }
            }
            staged.insert(key, placement);
        }
        for (key, placement) in &staged {
            batch.put_cf(cf_placements, placement_key(key), encode(placement)?);
        }
        for (parent, children) in &slots {
            batch.put_cf(cf_children, placement_key(parent), encode(children)?);
        }

        for activation in &writes.activations {
            batch.put_cf(cf_activations, member_key(&activation.key()), encode(activation)?);
        }
        for entry in &writes.entries {
            let mut key = member_key(&entry.key()).to_vec();
            key.extend_from_slice(&entry.seq.to_be_bytes());
            batch.put_cf(cf_ledger, key, encode(entry)?);
        }
        for event in &writes.raised {
            batch.put_cf(cf_unresolved, event.id.to_be_bytes(), encode(event)?);
        }
        for id in &writes.resolved {
            batch.delete_cf(cf_unresolved, id.to_be_bytes());
        }

        self.db.write(batch).map_err(map_rocks)?;
        Ok(summary)
    }
}

// --- Key and value encoding ---

fn tree_key(tree: &TreeKey) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&tree.track.0.to_be_bytes());
    key[4..].copy_from_slice(&tree.tier.to_be_bytes());
    key
}

/// track · tier · member, so a tree's placements are one prefix.
fn placement_key(key: &TierKey) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&tree_key(&key.tree()));
    out[8..].copy_from_slice(&key.member.to_be_bytes());
    out
}

/// member · track · tier, so a member's rows in a track are one prefix.
fn member_key(key: &TierKey) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&key.member.to_be_bytes());
    out[8..12].copy_from_slice(&key.track.0.to_be_bytes());
    out[12..].copy_from_slice(&key.tier.to_be_bytes());
    out
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

/// Lock contention and timeouts may clear on retry; everything else may not.
fn map_rocks(e: rocksdb::Error) -> StoreError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => StoreError::Transient(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}
