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

//! Dataset coordinator.
//!
//! Entry point for every dataset operation. Each public operation runs
//! under the access discipline: refuse when shutting down, hold the
//! in-use counter for the whole call, then take the reader/writer gate —
//! readers for queries, the writer for `load`, `gc` and index rotation.
//! The gate is writer-preferred, so a continuous stream of queries cannot
//! starve a load.
//!
//! Bulk work is split per node and submitted to the engine's thread pool;
//! the coordinator blocks on the handles in submission order and reports
//! the first failure only after every node has finished.

use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use ivory_core::{
    DatasetMeta, DistItem, Error, KnnMetric, Reply, Result, TaskHandle, ThreadPool,
};
use ivory_index::CentroidTable;
use ivory_storage::{InputData, InputGenerator};

use crate::node::NodeWorker;
use crate::report::LoadReport;

const LOAD_DIR: &str = "load";
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);
const SHUTDOWN_ATTEMPTS: usize = 100;

pub struct Dataset {
    name: String,
    path: PathBuf,
    pub(crate) meta: RwLock<DatasetMeta>,
    /// Lazily opened node handles; an empty slot re-opens at the current
    /// index version on next access.
    pub(crate) nodes: Vec<Mutex<Option<Arc<NodeWorker>>>>,
    pub(crate) centroids: RwLock<Option<Arc<CentroidTable>>>,
    pub(crate) pq_centroids: RwLock<Vec<Arc<CentroidTable>>>,
    /// Operation gate; independent of the in-use counter.
    pub(crate) gate: RwLock<()>,
    in_use: AtomicU64,
    shutting_down: AtomicBool,
}

/// Decrements the in-use counter on every exit path.
pub(crate) struct InUseGuard<'a> {
    counter: &'a AtomicU64,
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dataset {
    /// Creates the on-disk layout: metadata plus one record store and one
    /// version-0 KV index per node. The caller opens the dataset
    /// afterwards; creation itself keeps nothing in memory.
    pub fn create(path: &Path, meta: &DatasetMeta, node_slot_capacity: u64) -> Result<()> {
        if path.exists() {
            return Err(Error::Validation(format!(
                "dataset directory '{}' exists already",
                path.display()
            )));
        }
        fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
        meta.write_to(path)?;

        for id in 0..meta.nodes_count as u64 {
            NodeWorker::create(id, path, meta, node_slot_capacity)?;
        }
        Ok(())
    }

    /// Opens a dataset directory: metadata, and the current version's
    /// centroid and PQ tables when they exist. Node shards open lazily.
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        let meta = DatasetMeta::read_from(path)?;

        let centroids_path = Self::index_dir_for(path, meta.index_id).join("centroids");
        let centroids = if centroids_path.exists() {
            Some(Arc::new(CentroidTable::open(&centroids_path)?))
        } else {
            None
        };

        let dataset = Dataset {
            name: name.to_string(),
            path: path.to_path_buf(),
            meta: RwLock::new(meta),
            nodes: (0..meta.nodes_count).map(|_| Mutex::new(None)).collect(),
            centroids: RwLock::new(centroids),
            pq_centroids: RwLock::new(Vec::new()),
            gate: RwLock::new(()),
            in_use: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        };
        dataset.load_pq_centroids()?;
        Ok(dataset)
    }

    /// Drains in-flight operations (bounded poll), then releases every
    /// node, flushing their sidecar state.
    pub fn uninit(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        for _ in 0..SHUTDOWN_ATTEMPTS {
            if self.in_use.load(Ordering::SeqCst) == 0 {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        for slot in &self.nodes {
            if let Some(node) = slot.lock().take() {
                if let Err(e) = node.uninit() {
                    error!(dataset = %self.name, node = node.id(), "uninit failed: {e}");
                }
            }
        }
        *self.centroids.write() = None;
        self.pq_centroids.write().clear();
        Ok(())
    }

    /// Deletes the dataset directory tree.
    pub fn remove(&self) -> Result<()> {
        self.uninit()?;
        if !self.path.exists() {
            return Err(Error::NotFound(format!(
                "dataset directory '{}' doesn't exist",
                self.path.display()
            )));
        }
        fs::remove_dir_all(&self.path).map_err(|e| Error::io(&self.path, e))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> DatasetMeta {
        *self.meta.read()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn index_dir_for(path: &Path, index_id: u64) -> PathBuf {
        path.join(format!("index_{index_id}"))
    }

    pub(crate) fn index_dir(&self, index_id: u64) -> PathBuf {
        Self::index_dir_for(&self.path, index_id)
    }

    pub(crate) fn enter(&self) -> Result<InUseGuard<'_>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(InUseGuard {
            counter: &self.in_use,
        })
    }

    pub(crate) fn get_node(&self, index: usize) -> Result<Arc<NodeWorker>> {
        let mut slot = self.nodes[index].lock();
        if slot.is_none() {
            let node = NodeWorker::open(index as u64, &self.path, &self.meta.read())?;
            *slot = Some(Arc::new(node));
        }
        Ok(Arc::clone(slot.as_ref().unwrap()))
    }

    /// Runs one closure per node, on the pool when one is supplied and
    /// inline otherwise. Handles are awaited in submission order; every
    /// node runs to completion before any error is surfaced.
    pub(crate) fn fan_out<T, F, G>(&self, pool: Option<&ThreadPool>, make_task: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(usize, Arc<NodeWorker>) -> G,
        G: FnOnce() -> T + Send + 'static,
    {
        let count = self.nodes.len();
        match pool {
            Some(pool) => {
                let mut handles: Vec<TaskHandle<T>> = Vec::with_capacity(count);
                for index in 0..count {
                    let node = self.get_node(index)?;
                    handles.push(pool.submit(make_task(index, node))?);
                }
                handles.into_iter().map(TaskHandle::wait).collect()
            }
            None => {
                let mut results = Vec::with_capacity(count);
                for index in 0..count {
                    let node = self.get_node(index)?;
                    results.push(make_task(index, node)());
                }
                Ok(results)
            }
        }
    }

    /// Collapses per-node results, logging every failure and keeping the
    /// first one.
    pub(crate) fn first_error(results: Vec<Result<()>>, what: &str) -> Result<()> {
        let mut first = None;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                error!("failed to {what} for node {index}: {e}");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Two-phase load of an input file, staged through a scratch
    /// directory so no parsed state is retained between the phases. Runs
    /// under the write gate.
    pub fn load(
        &self,
        input_path: &Path,
        report: &Arc<LoadReport>,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.write();

        let load_dir = self.path.join(LOAD_DIR);
        if load_dir.exists() {
            return Err(Error::Validation(format!(
                "load directory '{}' already exists",
                load_dir.display()
            )));
        }
        fs::create_dir(&load_dir).map_err(|e| Error::io(&load_dir, e))?;
        let _cleanup = ScratchDir(&load_dir);

        let input = Arc::new(InputData::open(input_path)?);
        report.input_count.store(input.len() as u64, Ordering::Relaxed);

        let nodes_count = self.nodes.len() as u64;
        let centroids = self.centroids.read().clone();

        // Phase 1: stage each node's share of the input.
        let results = self.fan_out(pool, |index, node| {
            let stage_path = load_dir.join(index.to_string());
            let report = Arc::clone(report);
            let input = Arc::clone(&input);
            move || node.prepare_load(&stage_path, nodes_count, &report, &input)
        })?;
        let staged = Self::first_error(results, "prepare load");

        // Phase 2: apply the stage files. Runs even when staging failed
        // on some node, so healthy nodes still complete.
        let results = self.fan_out(pool, |index, node| {
            let stage_path = load_dir.join(index.to_string());
            let report = Arc::clone(report);
            let input = Arc::clone(&input);
            let centroids = centroids.clone();
            move || node.load(&stage_path, &report, &input, centroids.as_deref())
        })?;
        let loaded = Self::first_error(results, "load");

        staged?;
        loaded?;
        Ok(Reply::status(report.summary()))
    }

    /// Writes every node's live records as input-format lines under
    /// `<output_dir>/<dataset name>/dump_node_<id>`, or to stdout when no
    /// directory is given.
    pub fn dump(&self, output_dir: Option<&Path>, pool: Option<&ThreadPool>) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let dump_dir = match output_dir {
            Some(dir) => {
                let dump_dir = dir.join(&self.name);
                if !dump_dir.exists() {
                    fs::create_dir_all(&dump_dir).map_err(|e| Error::io(&dump_dir, e))?;
                }
                Some(Arc::new(dump_dir))
            }
            None => None,
        };

        let results = self.fan_out(pool, |_, node| {
            let dump_dir = dump_dir.clone();
            move || node.dump(dump_dir.as_ref().map(|d| d.as_path()))
        })?;
        Self::first_error(results, "dump")?;
        Ok(Reply::none())
    }

    /// First node reporting the tag wins; a second hit is logged as a
    /// consistency problem but does not fail the query.
    pub fn find_tag(&self, tag: u64, pool: Option<&ThreadPool>) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let results = self.fan_out(pool, |_, node| move || node.find_tag(tag))?;

        let mut found = None;
        for result in results {
            if let Ok(reply) = result {
                if found.is_some() {
                    error!("tag {tag} found in multiple nodes");
                } else {
                    found = Some(reply);
                }
            }
        }
        found.ok_or_else(|| Error::NotFound(format!("Tag {tag} not found")))
    }

    /// Finds the tag storing exactly these vector bytes.
    pub fn find_data(&self, data: &[u8], pool: Option<&ThreadPool>) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let query = Arc::new(data.to_vec());
        let results = self.fan_out(pool, |_, node| {
            let query = Arc::clone(&query);
            move || node.find_data(&query)
        })?;

        let mut found = None;
        for result in results {
            if let Ok(reply) = result {
                if found.is_some() {
                    error!("data found in multiple nodes");
                } else {
                    found = Some(reply);
                }
            }
        }
        found.ok_or_else(|| Error::NotFound("Data not found".into()))
    }

    /// Exact k-nearest-neighbour query across all nodes. The reply lists
    /// the winning tags in ascending order.
    pub fn knn(
        &self,
        metric: KnnMetric,
        count: u64,
        data: &[u8],
        skip_tag: u64,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let query = Arc::new(data.to_vec());
        let results = self.fan_out(pool, |_, node| {
            let query = Arc::clone(&query);
            move || node.knn(metric, count, &query, skip_tag)
        })?;

        Ok(Reply::content(merge_top_k(results, count)))
    }

    /// Approximate query: probes the `nprobes` nearest clusters of the
    /// current index version on every node.
    pub fn ann(
        &self,
        count: u64,
        nprobes: u64,
        data: &[u8],
        skip_tag: u64,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let centroids = self
            .centroids
            .read()
            .clone()
            .ok_or_else(|| Error::NotFound("Centroids not initialized".into()))?;

        let meta = self.metadata();
        let probes = centroids.nprobe(meta.elem, meta.dim, data, nprobes as usize);
        debug!(?probes, "ann probe set");
        let probes = Arc::new(probes.to_vec());

        let query = Arc::new(data.to_vec());
        let results = self.fan_out(pool, |_, node| {
            let query = Arc::clone(&query);
            let probes = Arc::clone(&probes);
            move || node.ann(&probes, count, &query, skip_tag)
        })?;

        let mut per_node = Vec::with_capacity(results.len());
        let mut first = None;
        for result in results {
            match result {
                Ok(items) => per_node.push(items),
                Err(e) => {
                    error!("ann failed on a node: {e}");
                    first.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first {
            return Err(e);
        }

        Ok(Reply::content(merge_top_k(per_node, count)))
    }

    /// Drops index versions older than `current - 1`, at the dataset
    /// level and inside every node. Idempotent. Runs under the write
    /// gate.
    pub fn gc(&self) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.write();

        let current = self.meta.read().index_id;
        for stale in 0..current.saturating_sub(1) {
            let index_path = self.index_dir(stale);
            if index_path.exists() {
                fs::remove_dir_all(&index_path).map_err(|e| Error::io(&index_path, e))?;
            }
        }

        for index in 0..self.nodes.len() {
            self.get_node(index)?.gc(current)?;
        }
        Ok(Reply::none())
    }

    /// Writes a synthetic input file; a convenience passthrough so the
    /// command surface needs nothing beyond the engine API.
    pub fn generate(path: &Path, dim: usize, count: usize, start: usize) -> Result<Reply> {
        InputGenerator::generate(path, dim, count, start)?;
        Ok(Reply::status(format!(
            "Generated {count} test data items in {}",
            path.display()
        )))
    }
}

/// Merges per-node top-k heaps into the global top-k and renders the
/// winning tags in ascending order.
fn merge_top_k(per_node: Vec<Vec<DistItem>>, count: u64) -> String {
    let mut heap = BinaryHeap::new();
    for items in per_node {
        for item in items {
            heap.push(item);
            if heap.len() as u64 > count {
                heap.pop();
            }
        }
    }

    let mut tags: Vec<u64> = heap.into_iter().map(|item| item.tag).collect();
    tags.sort_unstable();
    tags.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Removes the staging directory on scope exit, success or failure.
struct ScratchDir<'a>(&'a Path);

impl Drop for ScratchDir<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(self.0) {
            error!(path = %self.0.display(), "failed to remove scratch directory: {e}");
        }
    }
}
