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

//! In-memory k-means workspace for training one centroid set.
//!
//! The builder owns a dense copy of the sampled vectors (so it can never
//! outlive its backing store), per-centroid counts and f64 sums, and two
//! centroid buffers used ping/pong style: [`IvfBuilder::recalc_centroids`]
//! runs two assignment-update half-passes (ping→pong, pong→ping), always
//! leaving the result in the ping buffer.
//!
//! Sample slots that were never filled (a sampler accepted a tombstone)
//! stay absent and are skipped by seeding and refinement.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use ivory_core::{record_size, ElementType, Error, Result};

use crate::kernels;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Half {
    First,
    Second,
}

pub struct IvfBuilder {
    elem: ElementType,
    dim: usize,
    centroids_count: usize,
    samples_count: usize,
    vector_size: usize,

    samples: Vec<u8>,
    present: Vec<bool>,
    counts: Vec<u32>,
    sums: Vec<f64>,
    /// Two centroid sets of `centroids_count * vector_size` bytes each.
    centroids: Vec<u8>,
    active: Half,
}

impl IvfBuilder {
    pub fn new(
        elem: ElementType,
        dim: usize,
        centroids_count: usize,
        samples_count: usize,
    ) -> Self {
        let vector_size = record_size(elem, dim) as usize;
        IvfBuilder {
            elem,
            dim,
            centroids_count,
            samples_count,
            vector_size,
            samples: vec![0u8; samples_count * vector_size],
            present: vec![false; samples_count],
            counts: vec![0u32; centroids_count],
            sums: vec![0f64; centroids_count * dim],
            centroids: vec![0u8; 2 * centroids_count * vector_size],
            active: Half::First,
        }
    }

    pub fn samples_count(&self) -> usize {
        self.samples_count
    }

    pub fn centroids_count(&self) -> usize {
        self.centroids_count
    }

    pub fn centroid_size(&self) -> usize {
        self.vector_size
    }

    pub fn elem(&self) -> ElementType {
        self.elem
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Copies a sampled vector into the workspace. Shorter slices are
    /// zero-padded (sub-vector samples during PQ training).
    pub fn set_sample(&mut self, index: usize, bytes: &[u8]) {
        if index >= self.samples_count {
            return;
        }
        let n = bytes.len().min(self.vector_size);
        let start = index * self.vector_size;
        self.samples[start..start + n].copy_from_slice(&bytes[..n]);
        self.present[index] = true;
    }

    pub fn sample(&self, index: usize) -> Option<&[u8]> {
        if !*self.present.get(index)? {
            return None;
        }
        let start = index * self.vector_size;
        Some(&self.samples[start..start + self.vector_size])
    }

    /// Count of sample slots that were actually filled.
    pub fn present_count(&self) -> usize {
        self.present.iter().filter(|p| **p).count()
    }

    pub fn centroid(&self, index: usize) -> &[u8] {
        let base = match self.active {
            Half::First => 0,
            Half::Second => self.centroids_count * self.vector_size,
        };
        let start = base + index * self.vector_size;
        &self.centroids[start..start + self.vector_size]
    }

    /// Directly installs a centroid in the active set; used to warm-start
    /// or to build fixture tables in tests.
    pub fn set_centroid(&mut self, index: usize, bytes: &[u8]) {
        let base = match self.active {
            Half::First => 0,
            Half::Second => self.centroids_count * self.vector_size,
        };
        let n = bytes.len().min(self.vector_size);
        let start = base + index * self.vector_size;
        self.centroids[start..start + n].copy_from_slice(&bytes[..n]);
    }

    /// Per-centroid populations of the most recent assignment pass.
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// k-means++ seeding: a uniformly random first centroid, then each
    /// further centroid drawn with probability proportional to its squared
    /// distance from the nearest centroid chosen so far.
    pub fn seed_kmeans_pp(&mut self) -> Result<()> {
        if self.centroids_count == 0 {
            return Ok(());
        }

        let mut rng = SmallRng::from_entropy();

        // First centroid: uniform draws, bounded retries over absent slots.
        let mut first = None;
        for _ in 0..self.samples_count.max(1) {
            let candidate = rng.gen_range(0..self.samples_count.max(1));
            if self.present.get(candidate).copied().unwrap_or(false) {
                first = Some(candidate);
                break;
            }
        }
        let Some(first) = first else {
            return Err(Error::Invariant(
                "failed to select initial centroid for k-means++".into(),
            ));
        };

        self.copy_sample_to_centroid(first, 0);
        let mut chosen = 1;

        let mut dist_sq = vec![0.0f64; self.samples_count];
        while chosen < self.centroids_count {
            let mut total = 0.0;
            for index in 0..self.samples_count {
                if !self.present[index] {
                    dist_sq[index] = 0.0;
                    continue;
                }
                let sample = &self.samples[index * self.vector_size..][..self.vector_size];
                let mut min_dist = f64::MAX;
                for c in 0..chosen {
                    let dist = kernels::l2_sq(self.elem, sample, self.centroid_at(c), self.dim);
                    min_dist = min_dist.min(dist);
                }
                dist_sq[index] = min_dist;
                total += min_dist;
            }

            // Inverse CDF over the squared distances. A degenerate total
            // (all samples already coincide with a centroid) falls back to
            // the first present sample; duplicates are acceptable.
            let mut pick = None;
            if total > 0.0 {
                let threshold = rng.gen_range(0.0..total);
                let mut cumulative = 0.0;
                for index in 0..self.samples_count {
                    if !self.present[index] {
                        continue;
                    }
                    cumulative += dist_sq[index];
                    if cumulative >= threshold {
                        pick = Some(index);
                        break;
                    }
                }
            }
            let pick = match pick.or_else(|| self.present.iter().position(|p| *p)) {
                Some(index) => index,
                None => {
                    return Err(Error::Invariant(
                        "no samples available for k-means++ seeding".into(),
                    ))
                }
            };

            self.copy_sample_to_centroid(pick, chosen);
            chosen += 1;
        }

        Ok(())
    }

    /// One refinement round: two assignment-update half-passes, ending
    /// with the refreshed centroids back in the active buffer.
    pub fn recalc_centroids(&mut self) {
        self.half_pass();
        self.half_pass();
    }

    fn half_pass(&mut self) {
        self.counts.fill(0);
        self.sums.fill(0.0);

        let half_len = self.centroids_count * self.vector_size;
        let (first, second) = self.centroids.split_at_mut(half_len);
        let (current, next) = match self.active {
            Half::First => (&*first, second),
            Half::Second => (&*second, first),
        };

        // Assignment: nearest current centroid, f64 accumulation.
        for index in 0..self.samples_count {
            if !self.present[index] {
                continue;
            }
            let sample = &self.samples[index * self.vector_size..][..self.vector_size];

            let mut best = 0usize;
            let mut min_dist = f64::MAX;
            for c in 0..self.centroids_count {
                let centroid = &current[c * self.vector_size..][..self.vector_size];
                let dist = kernels::l2_sq(self.elem, sample, centroid, self.dim);
                if dist < min_dist {
                    min_dist = dist;
                    best = c;
                }
            }

            kernels::sum_into(
                self.elem,
                sample,
                &mut self.sums[best * self.dim..(best + 1) * self.dim],
                self.dim,
            );
            self.counts[best] += 1;
        }

        // Update: empty clusters keep their previous centroid.
        for c in 0..self.centroids_count {
            let target = &mut next[c * self.vector_size..][..self.vector_size];
            if self.counts[c] == 0 {
                target.copy_from_slice(&current[c * self.vector_size..][..self.vector_size]);
            } else {
                kernels::mean_into(
                    self.elem,
                    &self.sums[c * self.dim..(c + 1) * self.dim],
                    self.counts[c],
                    target,
                    self.dim,
                );
            }
        }

        self.active = match self.active {
            Half::First => Half::Second,
            Half::Second => Half::First,
        };
    }

    fn centroid_at(&self, index: usize) -> &[u8] {
        self.centroid(index)
    }

    fn copy_sample_to_centroid(&mut self, sample_index: usize, centroid_index: usize) {
        let base = match self.active {
            Half::First => 0,
            Half::Second => self.centroids_count * self.vector_size,
        };
        let src = sample_index * self.vector_size;
        let dst = base + centroid_index * self.vector_size;
        self.centroids[dst..dst + self.vector_size]
            .copy_from_slice(&self.samples[src..src + self.vector_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivory_core::ElementType;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_values(bytes: &[u8], dim: usize) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .take(dim)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Two tight clusters around 0 and 100 on the first axis.
    fn two_cluster_builder() -> IvfBuilder {
        let mut builder = IvfBuilder::new(ElementType::F32, 2, 2, 40);
        for i in 0..20 {
            builder.set_sample(i, &f32_bytes(&[i as f32 * 0.1, 1.0]));
            builder.set_sample(20 + i, &f32_bytes(&[100.0 + i as f32 * 0.1, 1.0]));
        }
        builder
    }

    #[test]
    fn seeding_picks_present_samples() {
        let mut builder = two_cluster_builder();
        builder.seed_kmeans_pp().unwrap();

        for c in 0..2 {
            let v = f32_values(builder.centroid(c), 2);
            let near_low = v[0] >= 0.0 && v[0] <= 2.0;
            let near_high = v[0] >= 100.0 && v[0] <= 102.0;
            assert!(near_low || near_high, "centroid at {v:?}");
        }
    }

    #[test]
    fn seeding_fails_without_samples() {
        let mut builder = IvfBuilder::new(ElementType::F32, 2, 2, 10);
        assert!(builder.seed_kmeans_pp().is_err());
    }

    #[test]
    fn refinement_converges_to_cluster_means() {
        let mut builder = two_cluster_builder();
        builder.seed_kmeans_pp().unwrap();
        for _ in 0..8 {
            builder.recalc_centroids();
        }

        let mut firsts: Vec<f32> = (0..2)
            .map(|c| f32_values(builder.centroid(c), 2)[0])
            .collect();
        firsts.sort_by(f32::total_cmp);

        // True means are 0.95 and 100.95.
        assert!((firsts[0] - 0.95).abs() < 0.5, "got {firsts:?}");
        assert!((firsts[1] - 100.95).abs() < 0.5, "got {firsts:?}");

        let counts = builder.counts();
        assert_eq!(counts.iter().sum::<u32>(), 40);
        assert_eq!(counts[0], 20);
        assert_eq!(counts[1], 20);
    }

    #[test]
    fn empty_cluster_keeps_previous_centroid() {
        let mut builder = IvfBuilder::new(ElementType::F32, 1, 2, 4);
        for i in 0..4 {
            builder.set_sample(i, &f32_bytes(&[5.0]));
        }
        builder.set_centroid(0, &f32_bytes(&[5.0]));
        builder.set_centroid(1, &f32_bytes(&[999.0]));

        builder.recalc_centroids();

        // Every sample lands on centroid 0; centroid 1 must survive as-is.
        assert_eq!(f32_values(builder.centroid(0), 1), vec![5.0]);
        assert_eq!(f32_values(builder.centroid(1), 1), vec![999.0]);
    }

    #[test]
    fn absent_samples_are_ignored() {
        let mut builder = IvfBuilder::new(ElementType::F32, 1, 1, 10);
        builder.set_sample(3, &f32_bytes(&[7.0]));
        assert_eq!(builder.present_count(), 1);
        assert!(builder.sample(0).is_none());
        assert!(builder.sample(3).is_some());

        builder.seed_kmeans_pp().unwrap();
        builder.recalc_centroids();
        assert_eq!(f32_values(builder.centroid(0), 1), vec![7.0]);
    }

    #[test]
    fn f16_training_stays_in_range() {
        let mut builder = IvfBuilder::new(ElementType::F16, 2, 1, 8);
        for i in 0..8 {
            let mut bytes = vec![0u8; 4];
            kernels::encode_values(ElementType::F16, &[4.0, 8.0], 2, &mut bytes).unwrap();
            builder.set_sample(i, &bytes);
        }
        builder.seed_kmeans_pp().unwrap();
        builder.recalc_centroids();

        let v = kernels::decode_values(ElementType::F16, builder.centroid(0), 2);
        assert_eq!(v, vec![4.0, 8.0]);
    }
}
