//! Persisted per-node reputation journal (feature `disk-reputation`).
//!
//! Grounded directly on `peer_list/disk_cache.rs`'s `DiskCache`: one RocksDB
//! column family, synchronous reads, `spawn_blocking`-wrapped flush. Keys
//! are node IDs instead of IP addresses; values are this crate's own wire
//! encoding (`wire::codec::Serializer`) rather than `tos_common::serializer`.

use std::sync::Arc;

use log::info;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use thiserror::Error;
use tokio::task::spawn_blocking;

use crate::identity::NodeId;
use crate::wire::{CodecError, Reader, Serializer, Writer};

type DB = DBWithThreadMode<MultiThreaded>;

const REPUTATION_CF: &str = "reputation";

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("column family {0} missing")]
    MissingColumnFamily(&'static str),
    #[error("blocking task failed: {0}")]
    Join(String),
}

pub type ReputationResult<T> = Result<T, ReputationError>;

/// A node's reputation score plus bookkeeping for when it was last updated.
/// `score` can go negative; very negative scores are the caller's cue to
/// route the node through `ban::BanCache` rather than dial it again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationEntry {
    pub score: i64,
    pub updated_at_unix: u64,
}

impl Serializer for ReputationEntry {
    fn read(reader: &mut Reader) -> crate::wire::CodecResult<Self> {
        Ok(Self {
            score: reader.read_i64()?,
            updated_at_unix: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_i64(self.score);
        writer.write_u64(self.updated_at_unix);
    }

    fn size(&self) -> usize {
        8 + 8
    }
}

pub struct ReputationStore {
    db: Arc<DB>,
}

impl ReputationStore {
    pub fn open(path: &str) -> ReputationResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(16 * 1024);
        opts.set_max_write_buffer_number(2);

        let cf_descriptor = ColumnFamilyDescriptor::new(REPUTATION_CF, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_descriptor])?;
        Ok(Self { db: Arc::new(db) })
    }

    fn column_family(&self) -> ReputationResult<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(REPUTATION_CF)
            .ok_or(ReputationError::MissingColumnFamily(REPUTATION_CF))
    }

    pub fn get(&self, node_id: &NodeId) -> ReputationResult<Option<ReputationEntry>> {
        let cf = self.column_family()?;
        match self.db.get_cf(&cf, node_id.as_bytes())? {
            Some(bytes) => Ok(Some(ReputationEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, node_id: &NodeId, entry: ReputationEntry) -> ReputationResult<()> {
        let cf = self.column_family()?;
        self.db.put_cf(&cf, node_id.as_bytes(), entry.to_bytes())?;
        Ok(())
    }

    pub fn remove(&self, node_id: &NodeId) -> ReputationResult<()> {
        let cf = self.column_family()?;
        self.db.delete_cf(&cf, node_id.as_bytes())?;
        Ok(())
    }

    pub fn all_entries(&self) -> ReputationResult<Vec<(NodeId, ReputationEntry)>> {
        let cf = self.column_family()?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let node_id = NodeId::from_slice(&key).map_err(|_| ReputationError::Codec(CodecError::InvalidValue))?;
            entries.push((node_id, ReputationEntry::from_bytes(&value)?));
        }
        Ok(entries)
    }

    pub async fn clear(&self) -> ReputationResult<()> {
        let cf = self.column_family()?;
        let keys: Vec<Vec<u8>> = self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .filter_map(|r| r.ok().map(|(k, _)| k.to_vec()))
            .collect();
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, &key);
        }
        self.db.write(batch)?;
        self.flush().await
    }

    pub async fn flush(&self) -> ReputationResult<()> {
        info!("flushing reputation store");
        let db = self.db.clone();
        spawn_blocking(move || db.flush())
            .await
            .map_err(|e| ReputationError::Join(e.to_string()))??;
        Ok(())
    }
}
