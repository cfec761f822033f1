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

//! One shard of a dataset.
//!
//! A node owns the record store and the KV index of its shard and runs the
//! bulk operations the coordinator fans out: the two-phase load, dump,
//! scans, exact kNN and probe-based ANN. Everything here executes on a
//! thread-pool worker, never on the coordinator's thread.
//!
//! Records are assigned to nodes by `tag % nodes_count`, fixed at dataset
//! creation.

use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::error;

use ivory_core::{
    DatasetMeta, DistItem, ElementType, Error, KnnMetric, Reply, Result, INVALID_CLUSTER,
    INVALID_RECORD_ID,
};
use ivory_index::{kernels, CentroidTable};
use ivory_storage::{InputData, NodeIndex, ParsedVector, RecordStore, Scan};

use crate::report::LoadReport;

pub(crate) const DATA_FILE: &str = "data.bin";

pub struct NodeWorker {
    id: u64,
    dir_path: PathBuf,
    elem: ElementType,
    dim: usize,
    record_size: u64,
    store: RecordStore,
    kv: NodeIndex,
}

impl NodeWorker {
    pub(crate) fn node_dir(dataset_path: &Path, id: u64) -> PathBuf {
        dataset_path.join(format!("node_{id}"))
    }

    pub(crate) fn index_dir(dir_path: &Path, index_id: u64) -> PathBuf {
        dir_path.join(format!("index_{index_id}"))
    }

    /// Creates the node directory, its version-0 KV index and its record
    /// store sized for `initial_count` slots.
    pub fn create(
        id: u64,
        dataset_path: &Path,
        meta: &DatasetMeta,
        initial_count: u64,
    ) -> Result<()> {
        let dir_path = Self::node_dir(dataset_path, id);
        if dir_path.exists() {
            return Err(Error::Validation(format!(
                "dataset node directory '{}' already exists",
                dir_path.display()
            )));
        }
        fs::create_dir_all(&dir_path).map_err(|e| Error::io(&dir_path, e))?;

        let index_path = Self::index_dir(&dir_path, 0);
        fs::create_dir(&index_path).map_err(|e| Error::io(&index_path, e))?;
        NodeIndex::create(&index_path)?;

        RecordStore::create(&dir_path.join(DATA_FILE), meta.record_size(), initial_count)
    }

    /// Opens the shard at the metadata's current index version.
    pub fn open(id: u64, dataset_path: &Path, meta: &DatasetMeta) -> Result<Self> {
        let dir_path = Self::node_dir(dataset_path, id);
        let kv = NodeIndex::open(&Self::index_dir(&dir_path, meta.index_id))?;
        let store = RecordStore::open(&dir_path.join(DATA_FILE), meta.record_size())?;

        Ok(NodeWorker {
            id,
            dir_path,
            elem: meta.elem,
            dim: meta.dim,
            record_size: meta.record_size(),
            store,
            kv,
        })
    }

    /// Flushes the store's sidecar state. The KV index needs no step here;
    /// every transaction flushes on commit.
    pub fn uninit(&self) -> Result<()> {
        self.store.uninit()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn elem(&self) -> ElementType {
        self.elem
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn record_size(&self) -> u64 {
        self.record_size
    }

    pub(crate) fn store(&self) -> &RecordStore {
        &self.store
    }

    pub(crate) fn kv(&self) -> &NodeIndex {
        &self.kv
    }

    pub(crate) fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    /// Load phase 1: one pass over the whole input, keeping only this
    /// shard's tags, and a binary stage record per kept item carrying the
    /// prior `(record id, cluster id)` from the KV index. Staging avoids
    /// holding per-record state in memory between the phases.
    pub fn prepare_load(
        &self,
        stage_path: &Path,
        nodes_count: u64,
        report: &LoadReport,
        input: &InputData,
    ) -> Result<()> {
        let file = File::create(stage_path).map_err(|e| Error::io(stage_path, e))?;
        let mut out = BufWriter::new(file);
        let io = |e| Error::io(stage_path, e);

        let mut counter = 0u64;
        for index in 0..input.len() {
            let tag = input.tag(index)?;
            if tag % nodes_count != self.id {
                continue;
            }

            let (record_id, cluster_id) = self
                .kv
                .read(tag)?
                .unwrap_or((INVALID_RECORD_ID, INVALID_CLUSTER));

            out.write_u64::<LittleEndian>(counter).map_err(io)?;
            out.write_u64::<LittleEndian>(tag).map_err(io)?;
            out.write_u32::<LittleEndian>(record_id).map_err(io)?;
            out.write_u16::<LittleEndian>(cluster_id).map_err(io)?;
            out.write_u64::<LittleEndian>(index as u64).map_err(io)?;
            counter += 1;
        }
        out.flush().map_err(io)?;

        LoadReport::add(&report.staged_count, counter);
        LoadReport::bump(&report.nodes_count);
        Ok(())
    }

    /// Load phase 2: sequential read of the stage file, one KV write
    /// transaction for the whole pass.
    ///
    /// Per entry: an empty vector deletes (the prior record id must
    /// exist), a prior record id updates in place, anything else inserts.
    /// Inserts and updates get their nearest cluster when a centroid
    /// table is present, otherwise they stay unindexed.
    pub fn load(
        &self,
        stage_path: &Path,
        report: &LoadReport,
        input: &InputData,
        centroids: Option<&CentroidTable>,
    ) -> Result<()> {
        let file = File::open(stage_path).map_err(|e| Error::io(stage_path, e))?;
        let mut stage = BufReader::new(file);

        let mut txn = self.kv.begin();
        let mut slot = vec![0u8; self.record_size as usize];
        let mut expected = 0u64;

        loop {
            let counter = match stage.read_u64::<LittleEndian>() {
                Ok(value) => value,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::io(stage_path, e)),
            };
            LoadReport::bump(&report.staged_read_count);

            if counter != expected {
                return Err(Error::Invariant(format!(
                    "stage file '{}' has counter {counter}, expected {expected}",
                    stage_path.display()
                )));
            }
            expected += 1;

            let io = |e| Error::io(stage_path, e);
            let tag = stage.read_u64::<LittleEndian>().map_err(io)?;
            let record_id = stage.read_u32::<LittleEndian>().map_err(io)?;
            let cluster_id = stage.read_u16::<LittleEndian>().map_err(io)?;
            let index = stage.read_u64::<LittleEndian>().map_err(io)? as usize;

            let parsed = match input.vector(index) {
                Ok(parsed) => parsed,
                Err(e) => {
                    LoadReport::bump(&report.conversion_errors_count);
                    return Err(e);
                }
            };

            match parsed {
                ParsedVector::Empty => {
                    if record_id == INVALID_RECORD_ID {
                        return Err(Error::Invariant(format!(
                            "delete requested for tag {tag} which has no record"
                        )));
                    }
                    self.store.delete(record_id as u64)?;
                    txn.delete_record(tag, record_id, cluster_id);
                    LoadReport::bump(&report.removed_count);
                }
                ParsedVector::Values(values) => {
                    slot.fill(0);
                    if let Err(e) = kernels::encode_values(self.elem, &values, self.dim, &mut slot)
                    {
                        LoadReport::bump(&report.conversion_errors_count);
                        return Err(e);
                    }

                    let record_id = if record_id != INVALID_RECORD_ID {
                        self.store.update(record_id as u64, &slot)?;
                        // The cluster may change; only the inverted entry
                        // is dropped, the primary row is rewritten below.
                        txn.delete_index(cluster_id, record_id);
                        LoadReport::bump(&report.updated_count);
                        record_id
                    } else {
                        let id = self.store.put(tag, &slot)?;
                        LoadReport::bump(&report.added_count);
                        id
                    };

                    let cluster_id = match centroids {
                        Some(table) => table.nearest(self.elem, self.dim, &slot),
                        None => INVALID_CLUSTER,
                    };
                    txn.write_record(tag, record_id, cluster_id);
                }
            }

            LoadReport::bump(&report.processed_count);
        }

        txn.commit()
    }

    /// Writes every live record as an input-format line, to
    /// `dump_node_<id>` under `dump_dir` or to stdout without one.
    pub fn dump(&self, dump_dir: Option<&Path>) -> Result<()> {
        let mut out: Box<dyn Write> = match dump_dir {
            Some(dir) => {
                let path = dir.join(format!("dump_node_{}", self.id));
                Box::new(BufWriter::new(
                    File::create(&path).map_err(|e| Error::io(&path, e))?,
                ))
            }
            None => Box::new(std::io::stdout().lock()),
        };

        for record_id in 0.. {
            let record = match self.store.scan(record_id) {
                Scan::Finished => break,
                Scan::Deleted => continue,
                Scan::Ok(record) => record,
            };

            let (kv_record_id, _) = self.kv.read(record.tag)?.ok_or_else(|| {
                Error::Invariant(format!(
                    "tag {} is live in the store but missing from the records table",
                    record.tag
                ))
            })?;
            if kv_record_id as u64 != record_id {
                return Err(Error::Invariant(format!(
                    "tag {} maps to record id {kv_record_id}, store slot is {record_id}",
                    record.tag
                )));
            }

            writeln!(
                out,
                "{} : [ {} ]",
                record.tag,
                kernels::format_vector(self.elem, record.data, self.dim, self.dim)
            )
            .map_err(|e| Error::io(&self.dir_path, e))?;
        }

        out.flush().map_err(|e| Error::io(&self.dir_path, e))
    }

    /// Full-scan tag lookup.
    pub fn find_tag(&self, tag: u64) -> Result<Reply> {
        for record_id in 0.. {
            match self.store.scan(record_id) {
                Scan::Finished => break,
                Scan::Deleted => continue,
                Scan::Ok(record) => {
                    if record.tag == tag {
                        return Ok(Reply::content(format!("Tag {tag} found")));
                    }
                }
            }
        }
        Err(Error::NotFound(format!("Tag {tag} not found")))
    }

    /// Full-scan lookup of the tag storing exactly these vector bytes.
    pub fn find_data(&self, data: &[u8]) -> Result<Reply> {
        for record_id in 0.. {
            match self.store.scan(record_id) {
                Scan::Finished => break,
                Scan::Deleted => continue,
                Scan::Ok(record) => {
                    if record.data.len() >= data.len() && &record.data[..data.len()] == data {
                        return Ok(Reply::content(record.tag.to_string()));
                    }
                }
            }
        }
        Err(Error::NotFound("Data not found".into()))
    }

    /// Exact kNN over every live slot of this shard. The returned heap
    /// contents are unordered; the coordinator re-merges globally.
    pub fn knn(&self, metric: KnnMetric, count: u64, query: &[u8], skip_tag: u64) -> Vec<DistItem> {
        let mut heap = BinaryHeap::new();

        for record_id in 0.. {
            let record = match self.store.scan(record_id) {
                Scan::Finished => break,
                Scan::Deleted => continue,
                Scan::Ok(record) => record,
            };
            if record.tag == skip_tag {
                continue;
            }

            heap.push(DistItem {
                dist: kernels::distance(metric, self.elem, record.data, query, self.dim),
                record_id,
                tag: record.tag,
            });
            if heap.len() as u64 > count {
                heap.pop();
            }
        }

        heap.into_vec()
    }

    /// ANN over the requested probe clusters: walks each cluster's
    /// inverted-index cursor and ranks the live records by squared L2.
    pub fn ann(
        &self,
        cluster_ids: &[u16],
        count: u64,
        query: &[u8],
        skip_tag: u64,
    ) -> Result<Vec<DistItem>> {
        let mut heap = BinaryHeap::new();

        for &cluster_id in cluster_ids {
            for record_id in self.kv.cluster_cursor(cluster_id) {
                let record_id = record_id?;
                let record = match self.store.scan(record_id as u64) {
                    Scan::Ok(record) => record,
                    _ => continue,
                };
                if record.tag == skip_tag {
                    continue;
                }

                heap.push(DistItem {
                    dist: kernels::l2_sq(self.elem, record.data, query, self.dim),
                    record_id: record_id as u64,
                    tag: record.tag,
                });
                if heap.len() as u64 > count {
                    heap.pop();
                }
            }
        }

        Ok(heap.into_vec())
    }

    /// Drops this shard's KV directories for index versions older than
    /// `current - 1`; current and its predecessor stay for in-flight
    /// readers.
    pub fn gc(&self, current_index_id: u64) -> Result<()> {
        for stale in 0..current_index_id.saturating_sub(1) {
            let index_path = Self::index_dir(&self.dir_path, stale);
            if index_path.exists() {
                fs::remove_dir_all(&index_path).map_err(|e| {
                    error!(node = self.id, version = stale, "gc failed: {e}");
                    Error::io(&index_path, e)
                })?;
            }
        }
        Ok(())
    }
}
