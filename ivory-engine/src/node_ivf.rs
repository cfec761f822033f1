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

//! IVF-side node operations: record sampling for training, per-version
//! index rebuilds, and residual extraction for PQ training.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use ivory_core::{Error, Result};
use ivory_index::{kernels, CentroidTable};
use ivory_storage::{NodeIndex, Scan};

use crate::node::NodeWorker;

impl NodeWorker {
    /// Draws `count` records uniformly from `[0, upper_record_id)`. A
    /// draw landing on a tombstone is retried, with the retry budget
    /// capped at `count / 10` across the whole call; once exhausted the
    /// tombstone is accepted as an absent sample (`None`), which later
    /// training steps skip.
    pub fn sample_records(&self, count: usize) -> Vec<Option<Vec<u8>>> {
        let upper = self.store().upper_record_id();
        let mut samples = Vec::with_capacity(count);
        if upper == 0 {
            samples.resize(count, None);
            return samples;
        }

        let mut rng = SmallRng::from_entropy();
        let mut retry_budget = count / 10;

        for _ in 0..count {
            let mut record_id = rng.gen_range(0..upper);
            while self.store().is_deleted(record_id as u32) && retry_budget > 0 {
                retry_budget -= 1;
                record_id = rng.gen_range(0..upper);
            }

            samples.push(match self.store().scan(record_id) {
                Scan::Ok(record) => Some(record.data.to_vec()),
                _ => None,
            });
        }

        samples
    }

    /// Rebuilds this shard's KV index for a new version: every live
    /// record is re-assigned to its nearest centroid and written to a
    /// fresh KV directory in one transaction. The shard keeps serving the
    /// old version until the coordinator swaps it in.
    pub fn write_index(&self, centroids: &CentroidTable, index_id: u64) -> Result<()> {
        let index_path = Self::index_dir(self.dir_path(), index_id);
        if !index_path.exists() {
            std::fs::create_dir(&index_path).map_err(|e| Error::io(&index_path, e))?;
        }

        let kv = NodeIndex::open(&index_path)?;
        let mut txn = kv.begin();

        for record_id in 0.. {
            let record = match self.store().scan(record_id) {
                Scan::Finished => break,
                Scan::Deleted => continue,
                Scan::Ok(record) => record,
            };
            let cluster_id = centroids.nearest(self.elem(), self.dim(), record.data);
            txn.write_record(record.tag, record_id as u32, cluster_id);
        }

        txn.commit()
    }

    /// Reservoir-samples `per_node_count / centroids.count()` (rounded
    /// up) live records per cluster and writes their residuals into this
    /// node's byte range of the shared residuals file. Ranges are
    /// disjoint by construction: node `n` owns
    /// `[n · per_node_count · r, (n+1) · per_node_count · r)`.
    pub fn make_residuals(
        &self,
        centroids: &CentroidTable,
        out: &File,
        per_node_count: u64,
    ) -> Result<()> {
        let record_size = self.record_size();
        let node_base = self.id() * per_node_count * record_size;
        let per_cluster = per_node_count.div_ceil(centroids.count() as u64);

        let mut rng = SmallRng::from_entropy();
        let mut selected: Vec<u32> = Vec::with_capacity(per_cluster as usize);
        let mut residual = vec![0u8; record_size as usize];

        let mut written = 0u64;
        for cluster_id in 0..centroids.count() as u16 {
            selected.clear();
            let mut scanned = 0u64;

            for record_id in self.kv().cluster_cursor(cluster_id) {
                let record_id = record_id?;
                if !matches!(self.store().scan(record_id as u64), Scan::Ok(_)) {
                    continue;
                }

                if (selected.len() as u64) < per_cluster {
                    selected.push(record_id);
                } else {
                    let j = rng.gen_range(0..scanned);
                    if j < per_cluster {
                        selected[j as usize] = record_id;
                    }
                }
                scanned += 1;
            }

            if selected.is_empty() {
                trace!(node = self.id(), cluster_id, "no records to sample");
                continue;
            }

            let centroid = centroids.centroid(cluster_id as usize);
            for (j, &record_id) in selected.iter().enumerate() {
                if written >= per_node_count {
                    break;
                }
                let record = match self.store().scan(record_id as u64) {
                    Scan::Ok(record) => record,
                    _ => continue,
                };

                kernels::residual_into(self.elem(), record.data, centroid, &mut residual, self.dim());
                let offset = node_base + (cluster_id as u64 * per_cluster + j as u64) * record_size;
                out.write_all_at(&residual, offset)
                    .map_err(|e| Error::io(Path::new("residuals"), e))?;
                written += 1;
            }
        }

        Ok(())
    }
}
