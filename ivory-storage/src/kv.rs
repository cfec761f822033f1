// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transactional secondary index for one node and one index version.
//!
//! Two logical tables back every node:
//!
//! - `records`: tag (`u64`, big-endian key) → record id (`u32`) plus an
//!   optional trailing cluster id (`u16`); the presence of the trailing
//!   two bytes distinguishes "indexed" from "not indexed yet".
//! - `index`: the inverted file. Duplicate-sorted keys are emulated with
//!   composite big-endian `(cluster id, record id)` keys and empty
//!   values, so a prefix range scan yields each record id of a cluster
//!   exactly once, in ascending order.
//!
//! Writers buffer their operations in an [`IndexTxn`] and apply them in a
//! single multi-tree transaction on [`IndexTxn::commit`]; both tables of
//! a record modification therefore commit atomically. A transaction is
//! used only by the worker that created it.

use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use ivory_core::{Error, Result, INVALID_CLUSTER};

const RECORDS_TREE: &str = "records";
const INDEX_TREE: &str = "index";

fn tag_key(tag: u64) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u64(&mut key, tag);
    key
}

fn cluster_key(cluster_id: u16, record_id: u32) -> [u8; 6] {
    let mut key = [0u8; 6];
    BigEndian::write_u16(&mut key[..2], cluster_id);
    BigEndian::write_u32(&mut key[2..], record_id);
    key
}

fn record_value(record_id: u32, cluster_id: u16) -> ([u8; 6], usize) {
    let mut value = [0u8; 6];
    LittleEndian::write_u32(&mut value[..4], record_id);
    if cluster_id == INVALID_CLUSTER {
        (value, 4)
    } else {
        LittleEndian::write_u16(&mut value[4..], cluster_id);
        (value, 6)
    }
}

fn decode_record_value(value: &[u8]) -> Result<(u32, u16)> {
    if value.len() < 4 {
        return Err(Error::Invariant(format!(
            "records table value has invalid length {}",
            value.len()
        )));
    }
    let record_id = LittleEndian::read_u32(&value[..4]);
    let cluster_id = if value.len() >= 6 {
        LittleEndian::read_u16(&value[4..6])
    } else {
        INVALID_CLUSTER
    };
    Ok((record_id, cluster_id))
}

fn kv_err(e: impl std::fmt::Display) -> Error {
    Error::Index(e.to_string())
}

pub struct NodeIndex {
    db: sled::Db,
    records: sled::Tree,
    clusters: sled::Tree,
}

impl NodeIndex {
    /// Creates an empty index under `dir` (both trees materialised).
    pub fn create(dir: &Path) -> Result<()> {
        let index = Self::open(dir)?;
        index.db.flush().map_err(kv_err)?;
        Ok(())
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::Config::new().path(dir).open().map_err(kv_err)?;
        let records = db.open_tree(RECORDS_TREE).map_err(kv_err)?;
        let clusters = db.open_tree(INDEX_TREE).map_err(kv_err)?;
        Ok(NodeIndex {
            db,
            records,
            clusters,
        })
    }

    /// Point read of the primary table.
    pub fn read(&self, tag: u64) -> Result<Option<(u32, u16)>> {
        match self.records.get(tag_key(tag)).map_err(kv_err)? {
            Some(value) => Ok(Some(decode_record_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Ascending cursor over every record id assigned to `cluster_id`.
    pub fn cluster_cursor(&self, cluster_id: u16) -> impl Iterator<Item = Result<u32>> + '_ {
        let lo = cluster_key(cluster_id, 0);
        let hi = cluster_key(cluster_id, u32::MAX);
        self.clusters.range(lo..=hi).map(|entry| {
            let (key, _) = entry.map_err(kv_err)?;
            if key.len() != 6 {
                return Err(Error::Invariant(format!(
                    "index table key has invalid length {}",
                    key.len()
                )));
            }
            Ok(BigEndian::read_u32(&key[2..]))
        })
    }

    /// Starts a buffered write transaction.
    pub fn begin(&self) -> IndexTxn<'_> {
        IndexTxn {
            index: self,
            ops: Vec::new(),
        }
    }
}

enum TxnOp {
    Write {
        tag: u64,
        record_id: u32,
        cluster_id: u16,
    },
    Delete {
        tag: u64,
        record_id: u32,
        cluster_id: u16,
    },
    DeleteIndex {
        cluster_id: u16,
        record_id: u32,
    },
}

/// Buffered write-set over both tables. Dropping it without `commit` is
/// an abort; nothing touches disk until `commit`.
pub struct IndexTxn<'a> {
    index: &'a NodeIndex,
    ops: Vec<TxnOp>,
}

impl IndexTxn<'_> {
    /// Upserts the primary row and, for a valid cluster id, the inverted
    /// row as well.
    pub fn write_record(&mut self, tag: u64, record_id: u32, cluster_id: u16) {
        self.ops.push(TxnOp::Write {
            tag,
            record_id,
            cluster_id,
        });
    }

    /// Removes a record from both tables. Commit fails if the primary row
    /// does not exist.
    pub fn delete_record(&mut self, tag: u64, record_id: u32, cluster_id: u16) {
        self.ops.push(TxnOp::Delete {
            tag,
            record_id,
            cluster_id,
        });
    }

    /// Removes only the inverted entry; used when an update re-assigns a
    /// record to a different cluster.
    pub fn delete_index(&mut self, cluster_id: u16, record_id: u32) {
        self.ops.push(TxnOp::DeleteIndex {
            cluster_id,
            record_id,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn abort(self) {}

    /// Applies the whole write-set atomically across both tables.
    pub fn commit(self) -> Result<()> {
        let IndexTxn { index, ops } = self;

        (&index.records, &index.clusters)
            .transaction(|(records, clusters)| {
                for op in &ops {
                    match *op {
                        TxnOp::Write {
                            tag,
                            record_id,
                            cluster_id,
                        } => {
                            let (value, len) = record_value(record_id, cluster_id);
                            records.insert(&tag_key(tag), &value[..len])?;
                            if cluster_id != INVALID_CLUSTER {
                                clusters.insert(&cluster_key(cluster_id, record_id), &[][..])?;
                            }
                        }
                        TxnOp::Delete {
                            tag,
                            record_id,
                            cluster_id,
                        } => {
                            if records.remove(&tag_key(tag))?.is_none() {
                                return Err(ConflictableTransactionError::Abort(format!(
                                    "tag {tag} missing from records table on delete"
                                )));
                            }
                            if cluster_id != INVALID_CLUSTER {
                                clusters.remove(&cluster_key(cluster_id, record_id))?;
                            }
                        }
                        TxnOp::DeleteIndex {
                            cluster_id,
                            record_id,
                        } => {
                            if cluster_id != INVALID_CLUSTER {
                                clusters.remove(&cluster_key(cluster_id, record_id))?;
                            }
                        }
                    }
                }
                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<String>| match e {
                sled::transaction::TransactionError::Abort(msg) => Error::Invariant(msg),
                sled::transaction::TransactionError::Storage(e) => kv_err(e),
            })?;

        index.db.flush().map_err(kv_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index(dir: &Path) -> NodeIndex {
        NodeIndex::create(dir).unwrap();
        NodeIndex::open(dir).unwrap()
    }

    #[test]
    fn write_then_read_with_and_without_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        txn.write_record(10, 3, 7);
        txn.write_record(11, 4, INVALID_CLUSTER);
        txn.commit().unwrap();

        assert_eq!(index.read(10).unwrap(), Some((3, 7)));
        assert_eq!(index.read(11).unwrap(), Some((4, INVALID_CLUSTER)));
        assert_eq!(index.read(12).unwrap(), None);
    }

    #[test]
    fn cursor_yields_ascending_unique_record_ids() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        for record_id in [9u32, 2, 5, 2] {
            txn.write_record(100 + record_id as u64, record_id, 1);
        }
        txn.write_record(200, 77, 2); // different cluster, must not leak
        txn.commit().unwrap();

        let ids: Vec<u32> = index
            .cluster_cursor(1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![2, 5, 9]);

        let other: Vec<u32> = index
            .cluster_cursor(2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(other, vec![77]);

        assert!(index.cluster_cursor(3).next().is_none());
    }

    #[test]
    fn delete_removes_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        txn.write_record(5, 1, 4);
        txn.commit().unwrap();

        let mut txn = index.begin();
        txn.delete_record(5, 1, 4);
        txn.commit().unwrap();

        assert_eq!(index.read(5).unwrap(), None);
        assert!(index.cluster_cursor(4).next().is_none());
    }

    #[test]
    fn delete_of_missing_tag_fails_commit() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        txn.delete_record(999, 0, INVALID_CLUSTER);
        assert!(matches!(txn.commit(), Err(Error::Invariant(_))));
    }

    #[test]
    fn delete_index_keeps_primary_row() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        txn.write_record(5, 1, 4);
        txn.commit().unwrap();

        let mut txn = index.begin();
        txn.delete_index(4, 1);
        txn.write_record(5, 1, 9);
        txn.commit().unwrap();

        assert_eq!(index.read(5).unwrap(), Some((1, 9)));
        assert!(index.cluster_cursor(4).next().is_none());
        let ids: Vec<u32> = index.cluster_cursor(9).collect::<Result<_>>().unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn abort_discards_buffered_ops() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(dir.path());

        let mut txn = index.begin();
        txn.write_record(1, 1, 1);
        txn.abort();

        assert_eq!(index.read(1).unwrap(), None);
    }

    #[test]
    fn reopen_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(dir.path());
            let mut txn = index.begin();
            txn.write_record(1, 2, 3);
            txn.commit().unwrap();
        }
        let index = NodeIndex::open(dir.path()).unwrap();
        assert_eq!(index.read(1).unwrap(), Some((2, 3)));
    }
}
