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

//! Index-side coordinator operations: sampling, k-means training, the
//! versioned index rotation, and the residual/PQ pipeline.
//!
//! Index rotation is atomic from a reader's point of view: version `v+1`
//! is built in its own directories while `v` keeps serving, and only the
//! metadata bump (plus dropping the cached node handles) makes `v+1`
//! current. A rotation also invalidates PQ artifacts; each version owns
//! its own.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::error;

use ivory_core::{ElementType, Error, Reply, Result, ThreadPool};
use ivory_index::{kernels, CentroidTable, IvfBuilder};

use crate::dataset::Dataset;

const CENTROIDS_FILE: &str = "centroids";
const RESIDUALS_FILE: &str = "residuals";

/// Rows shown by preview replies; 4 leading coordinates each.
const PREVIEW_ROWS: usize = 16;
const PREVIEW_DIMS: usize = 4;

/// Refinement rounds applied by `mock_ivf` and per PQ chunk. One round is
/// one `recalc_centroids` call, i.e. two assignment-update half-passes.
const FIXED_REFINEMENT_ROUNDS: usize = 8;

impl Dataset {
    /// Fills a builder's sample slots from all nodes: the total sample
    /// count is split evenly (rounded up), node `i` filling the `i`-th
    /// range. Absent samples (tombstone draws) stay empty.
    pub(crate) fn sample_into(
        &self,
        builder: &mut IvfBuilder,
        pool: Option<&ThreadPool>,
    ) -> Result<()> {
        let per_node = builder.samples_count().div_ceil(self.nodes.len());

        let batches = self.fan_out(pool, |_, node| move || node.sample_records(per_node))?;

        let mut from = 0;
        for batch in batches {
            for (offset, sample) in batch.into_iter().enumerate() {
                if let Some(bytes) = sample {
                    builder.set_sample(from + offset, &bytes);
                }
            }
            from += per_node;
        }
        Ok(())
    }

    fn train_builder(
        &self,
        centroids_count: usize,
        sample_count: usize,
        refinement_calls: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<IvfBuilder> {
        if centroids_count == 0 || sample_count == 0 {
            return Err(Error::Validation(
                "centroid and sample counts must be nonzero".into(),
            ));
        }

        let meta = self.metadata();
        let mut builder = IvfBuilder::new(meta.elem, meta.dim, centroids_count, sample_count);
        self.sample_into(&mut builder, pool)?;
        builder.seed_kmeans_pp()?;
        for _ in 0..refinement_calls {
            builder.recalc_centroids();
        }
        Ok(builder)
    }

    /// `sample(n)`: draws `n` records and previews the first few.
    pub fn sample_preview(&self, count: usize, pool: Option<&ThreadPool>) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let meta = self.metadata();
        let mut builder = IvfBuilder::new(meta.elem, meta.dim, 0, count);
        self.sample_into(&mut builder, pool)?;

        let mut out = String::new();
        for index in 0..count.min(PREVIEW_ROWS) {
            if let Some(sample) = builder.sample(index) {
                out.push_str(&kernels::format_vector(
                    meta.elem,
                    sample,
                    meta.dim,
                    PREVIEW_DIMS,
                ));
            }
            out.push('\n');
        }
        Ok(Reply::content(out))
    }

    /// `kmeans_pp(k, m)`: seeds `k` centroids over `m` samples and
    /// previews them, without refining or persisting anything.
    pub fn kmeans_pp(
        &self,
        centroids_count: usize,
        sample_count: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let builder = self.train_builder(centroids_count, sample_count, 0, pool)?;
        Ok(Reply::content(preview_builder(&builder)))
    }

    /// `make_centroids(k, m, iters)`: full training run that stops short
    /// of writing an index; used to eyeball convergence.
    pub fn make_centroids(
        &self,
        centroids_count: usize,
        sample_count: usize,
        recalc_count: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let builder = self.train_builder(
            centroids_count,
            sample_count,
            recalc_count / 2 + 1,
            pool,
        )?;
        Ok(Reply::content(preview_builder(&builder)))
    }

    /// `make_ivf(k, m, iters)`: trains a centroid set and rotates it in
    /// as the next index version. Serialised against loads and other
    /// rotations by the write gate.
    pub fn make_ivf(
        &self,
        centroids_count: usize,
        sample_count: usize,
        recalc_count: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.write();

        let builder = self.train_builder(
            centroids_count,
            sample_count,
            recalc_count / 2 + 1,
            pool,
        )?;
        self.write_index_with(builder, pool)
    }

    /// Persists a trained centroid set as version `v+1`, rebuilds every
    /// node's KV index against it, then swaps it in:
    ///
    /// 1. serialise the centroids to `index_<v+1>/centroids`,
    /// 2. fan out the per-node index rebuild,
    /// 3. bump and persist the metadata,
    /// 4. drop cached node handles so the next access reopens at `v+1`,
    /// 5. cache the new centroid table.
    ///
    /// Until step 3 nothing references `v+1`, so readers of `v` are never
    /// in danger.
    pub(crate) fn write_index_with(
        &self,
        builder: IvfBuilder,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let next = self.metadata().index_id + 1;
        let index_dir = self.index_dir(next);
        fs::create_dir(&index_dir).map_err(|e| Error::io(&index_dir, e))?;

        let centroids_path = index_dir.join(CENTROIDS_FILE);
        CentroidTable::write_file(&centroids_path, &builder)?;
        drop(builder);

        let table = Arc::new(CentroidTable::open(&centroids_path)?);
        let results = self.fan_out(pool, |_, node| {
            let table = Arc::clone(&table);
            move || node.write_index(&table, next)
        })?;
        Self::first_error(results, "write index")?;

        {
            let mut meta = self.meta.write();
            meta.index_id = next;
            // A fresh version owns no PQ artifacts.
            meta.pq_count = 0;
            meta.write_to(self.path())?;
        }

        for slot in &self.nodes {
            if let Some(node) = slot.lock().take() {
                if let Err(e) = node.uninit() {
                    error!(node = node.id(), "uninit during index swap failed: {e}");
                }
            }
        }

        let meta = self.metadata();
        let reply = Reply::content(preview_table(&table, meta.elem, meta.dim));
        *self.centroids.write() = Some(table);
        self.pq_centroids.write().clear();
        Ok(reply)
    }

    /// `show_ivf`: one row per centroid of the current version.
    pub fn show_ivf(&self) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let centroids = self
            .centroids
            .read()
            .clone()
            .ok_or_else(|| Error::NotFound("Centroids not initialized".into()))?;

        let meta = self.metadata();
        let mut out = String::new();
        for index in 0..centroids.count() {
            out.push_str(&kernels::format_vector(
                meta.elem,
                centroids.centroid(index),
                meta.dim,
                PREVIEW_DIMS,
            ));
            out.push('\n');
        }
        Ok(Reply::content(out))
    }

    /// `make_residuals(n)`: samples ~`n` records cluster-by-cluster and
    /// writes `record - centroid` residuals into
    /// `index_<v>/residuals`. The count is rounded up to a multiple of
    /// the cluster count and then of the node count; each node writes its
    /// own disjoint byte range of the shared file.
    pub fn make_residuals(&self, count: u64, pool: Option<&ThreadPool>) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let centroids = self
            .centroids
            .read()
            .clone()
            .ok_or_else(|| Error::NotFound("Centroids not initialized".into()))?;

        let clusters = centroids.count() as u64;
        let nodes = self.nodes.len() as u64;
        let mut count = count.max(1);
        if count % clusters != 0 {
            count = (count / clusters + 1) * clusters;
        }
        if count % nodes != 0 {
            count = (count / nodes + 1) * nodes;
        }

        let meta = self.metadata();
        let index_dir = self.index_dir(meta.index_id);
        if !index_dir.exists() {
            fs::create_dir(&index_dir).map_err(|e| Error::io(&index_dir, e))?;
        }

        let residuals_path = index_dir.join(RESIDUALS_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&residuals_path)
            .map_err(|e| Error::io(&residuals_path, e))?;
        file.set_len(count * meta.record_size())
            .map_err(|e| Error::io(&residuals_path, e))?;
        let file = Arc::new(file);

        let per_node = count / nodes;
        let results = self.fan_out(pool, |_, node| {
            let centroids = Arc::clone(&centroids);
            let file = Arc::clone(&file);
            move || node.make_residuals(&centroids, &file, per_node)
        })?;
        Self::first_error(results, "make residuals")?;
        Ok(Reply::none())
    }

    /// `make_pq_centroids(chunks, depth)`: trains an independent
    /// `depth`-centroid codebook per sub-vector chunk of the residuals
    /// file and records the chunk count in the metadata.
    pub fn make_pq_centroids(
        &self,
        chunk_count: usize,
        depth: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let meta = self.metadata();
        if chunk_count == 0 || meta.dim % chunk_count != 0 {
            return Err(Error::Validation(
                "DIMENSION is not divisible by the number of PQ chunks".into(),
            ));
        }
        if depth == 0 {
            return Err(Error::Validation(
                "PQ codebook depth must be nonzero".into(),
            ));
        }
        if meta.record_size() % chunk_count as u64 != 0 {
            return Err(Error::Validation(format!(
                "record size {} cannot be split into {chunk_count} PQ chunks",
                meta.record_size()
            )));
        }
        if self.centroids.read().is_none() {
            return Err(Error::NotFound("Centroids not initialized".into()));
        }

        let index_dir = self.index_dir(meta.index_id);
        let residuals_path = index_dir.join(RESIDUALS_FILE);
        if !residuals_path.exists() {
            return Err(Error::NotFound("Residuals file does not exist".into()));
        }

        let file = fs::File::open(&residuals_path).map_err(|e| Error::io(&residuals_path, e))?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(&residuals_path, e))?;

        let record_size = meta.record_size() as usize;
        let trainer = Arc::new(PqTrainer {
            elem: meta.elem,
            sub_dim: meta.dim / chunk_count,
            depth,
            rows: map.len() / record_size,
            record_size,
            chunk_stride: record_size / chunk_count,
            map,
            index_dir,
        });

        let mut first = None;
        match pool {
            Some(pool) => {
                let mut handles = Vec::with_capacity(chunk_count);
                for chunk in 0..chunk_count {
                    let trainer = Arc::clone(&trainer);
                    handles.push(pool.submit(move || trainer.train(chunk))?);
                }
                for handle in handles {
                    if let Err(e) = handle.wait()? {
                        error!("pq training failed: {e}");
                        first.get_or_insert(e);
                    }
                }
            }
            None => {
                for chunk in 0..chunk_count {
                    if let Err(e) = trainer.train(chunk) {
                        error!("pq training failed: {e}");
                        first.get_or_insert(e);
                    }
                }
            }
        }
        if let Some(e) = first {
            return Err(e);
        }

        {
            let mut meta = self.meta.write();
            meta.pq_count = chunk_count;
            meta.write_to(self.path())?;
        }
        self.load_pq_centroids()?;
        Ok(Reply::none())
    }

    /// Opens the persisted PQ codebooks of the current version.
    pub(crate) fn load_pq_centroids(&self) -> Result<()> {
        let meta = self.metadata();
        if meta.pq_count == 0 {
            return Ok(());
        }

        let index_dir = self.index_dir(meta.index_id);
        let mut tables = Vec::with_capacity(meta.pq_count);
        for chunk in 0..meta.pq_count {
            let path = index_dir.join(format!("pq_centroids_{chunk}"));
            tables.push(Arc::new(CentroidTable::open(&path)?));
        }
        *self.pq_centroids.write() = tables;
        Ok(())
    }

    pub fn pq_tables(&self) -> Vec<Arc<CentroidTable>> {
        self.pq_centroids.read().clone()
    }

    /// Test-support build: sample, seed, a fixed number of refinement
    /// rounds, rotate. Runs inline, without the thread pool.
    pub fn mock_ivf(&self, centroids_count: usize, sample_count: usize) -> Result<Reply> {
        let _in_use = self.enter()?;
        let _gate = self.gate.read();

        let builder = self.train_builder(
            centroids_count,
            sample_count,
            FIXED_REFINEMENT_ROUNDS,
            None,
        )?;
        self.write_index_with(builder, None)
    }
}

/// Trains one PQ sub-codebook per chunk from the mmapped residuals.
/// Shared read-only across pool workers.
struct PqTrainer {
    elem: ElementType,
    sub_dim: usize,
    depth: usize,
    rows: usize,
    record_size: usize,
    chunk_stride: usize,
    map: Mmap,
    index_dir: PathBuf,
}

impl PqTrainer {
    fn train(&self, chunk: usize) -> Result<()> {
        let mut builder = IvfBuilder::new(self.elem, self.sub_dim, self.depth, self.rows);

        let data_len = self.sub_dim * self.elem.byte_size();
        for row in 0..self.rows {
            let record = &self.map[row * self.record_size..][..self.record_size];
            let sub = &record[chunk * self.chunk_stride..][..data_len];
            builder.set_sample(row, sub);
        }

        builder.seed_kmeans_pp()?;
        for _ in 0..FIXED_REFINEMENT_ROUNDS {
            builder.recalc_centroids();
        }

        CentroidTable::write_file(
            &self.index_dir.join(format!("pq_centroids_{chunk}")),
            &builder,
        )
    }
}

fn preview_builder(builder: &IvfBuilder) -> String {
    let mut out = String::new();
    for index in 0..builder.centroids_count().min(PREVIEW_ROWS) {
        out.push_str(&kernels::format_vector(
            builder.elem(),
            builder.centroid(index),
            builder.dim(),
            PREVIEW_DIMS,
        ));
        out.push('\n');
    }
    out
}

fn preview_table(table: &CentroidTable, elem: ElementType, dim: usize) -> String {
    let mut out = String::new();
    for index in 0..table.count().min(PREVIEW_ROWS) {
        out.push_str(&kernels::format_vector(
            elem,
            table.centroid(index),
            dim,
            PREVIEW_DIMS,
        ));
        out.push('\n');
    }
    out
}
