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

//! Immutable mmapped centroid table.
//!
//! File format (all integers little-endian):
//!
//! ```text
//! u64 magic = 0xDEADBEEF
//! u64 centroid_size          (bytes per centroid, 8-aligned)
//! u64 count
//! count × centroid_size      (packed centroids)
//! ```
//!
//! Once opened the table is never written again; it is shared freely
//! across threads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use smallvec::SmallVec;

use ivory_core::{DistItem, ElementType, Error, Result};

use crate::builder::IvfBuilder;
use crate::kernels;

pub const CENTROID_MAGIC: u64 = 0xDEAD_BEEF;

const HEADER_SIZE: usize = 24;

pub struct CentroidTable {
    map: Mmap,
    centroid_size: usize,
    count: usize,
}

impl CentroidTable {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;

        if map.len() < HEADER_SIZE {
            return Err(Error::Invariant(format!(
                "centroid file '{}' is shorter than its header",
                path.display()
            )));
        }

        let magic = LittleEndian::read_u64(&map[0..8]);
        if magic != CENTROID_MAGIC {
            return Err(Error::Invariant(format!(
                "centroid file '{}' has invalid magic {magic:#x}",
                path.display()
            )));
        }

        let centroid_size = LittleEndian::read_u64(&map[8..16]) as usize;
        let count = LittleEndian::read_u64(&map[16..24]) as usize;

        let required = HEADER_SIZE + count * centroid_size;
        if map.len() < required {
            return Err(Error::Invariant(format!(
                "centroid file '{}' holds {} bytes, {required} required",
                path.display(),
                map.len()
            )));
        }

        Ok(CentroidTable {
            map,
            centroid_size,
            count,
        })
    }

    /// Serialises a trained builder's active centroid set.
    pub fn write_file(path: &Path, builder: &IvfBuilder) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = BufWriter::new(file);

        let io = |e| Error::io(path, e);
        out.write_u64::<LittleEndian>(CENTROID_MAGIC).map_err(io)?;
        out.write_u64::<LittleEndian>(builder.centroid_size() as u64)
            .map_err(io)?;
        out.write_u64::<LittleEndian>(builder.centroids_count() as u64)
            .map_err(io)?;

        for index in 0..builder.centroids_count() {
            out.write_all(builder.centroid(index)).map_err(io)?;
        }
        out.flush().map_err(io)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn centroid_size(&self) -> usize {
        self.centroid_size
    }

    pub fn centroid(&self, index: usize) -> &[u8] {
        assert!(index < self.count, "centroid index out of range");
        let start = HEADER_SIZE + index * self.centroid_size;
        &self.map[start..start + self.centroid_size]
    }

    /// Linear scan for the nearest centroid by squared L2 distance; ties
    /// resolve to the lowest cluster id.
    pub fn nearest(&self, elem: ElementType, dim: usize, query: &[u8]) -> u16 {
        let mut nearest = 0u16;
        let mut min_dist = f64::MAX;
        for index in 0..self.count {
            let dist = kernels::l2_sq(elem, query, self.centroid(index), dim);
            if dist < min_dist {
                min_dist = dist;
                nearest = index as u16;
            }
        }
        nearest
    }

    /// The `nprobes` nearest cluster ids, emitted in descending-distance
    /// order. Callers treat the result as an unordered probe set.
    pub fn nprobe(
        &self,
        elem: ElementType,
        dim: usize,
        query: &[u8],
        nprobes: usize,
    ) -> SmallVec<[u16; 16]> {
        let mut heap = std::collections::BinaryHeap::new();
        for index in 0..self.count {
            heap.push(DistItem {
                dist: kernels::l2_sq(elem, query, self.centroid(index), dim),
                record_id: index as u64,
                tag: 0,
            });
            if heap.len() > nprobes {
                heap.pop();
            }
        }

        let mut cluster_ids = SmallVec::new();
        while let Some(item) = heap.pop() {
            cluster_ids.push(item.record_id as u16);
        }
        cluster_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IvfBuilder;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// A 4-centroid table at 0, 10, 20, 30 on the first axis.
    fn sample_table(dir: &Path) -> CentroidTable {
        let mut builder = IvfBuilder::new(ElementType::F32, 2, 4, 4);
        for i in 0..4 {
            builder.set_centroid(i, &f32_bytes(&[10.0 * i as f32, 0.0]));
        }

        let path = dir.join("centroids");
        CentroidTable::write_file(&path, &builder).unwrap();
        CentroidTable::open(&path).unwrap()
    }

    #[test]
    fn open_validates_magic_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        assert_eq!(table.count(), 4);
        assert_eq!(table.centroid_size(), 8);

        let bogus = dir.path().join("bogus");
        std::fs::write(&bogus, [0u8; 32]).unwrap();
        assert!(matches!(
            CentroidTable::open(&bogus),
            Err(Error::Invariant(_))
        ));

        let short = dir.path().join("short");
        std::fs::write(&short, [1u8; 8]).unwrap();
        assert!(CentroidTable::open(&short).is_err());
    }

    #[test]
    fn open_rejects_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());
        drop(table);

        let path = dir.path().join("centroids");
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 4]).unwrap();
        assert!(matches!(
            CentroidTable::open(&path),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn nearest_picks_closest_with_low_id_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());

        assert_eq!(table.nearest(ElementType::F32, 2, &f32_bytes(&[1.0, 0.0])), 0);
        assert_eq!(table.nearest(ElementType::F32, 2, &f32_bytes(&[19.0, 0.0])), 2);
        // Exactly between centroids 0 and 1: the lower id wins.
        assert_eq!(table.nearest(ElementType::F32, 2, &f32_bytes(&[5.0, 0.0])), 0);
    }

    #[test]
    fn nprobe_returns_the_p_nearest_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table(dir.path());

        let probes = table.nprobe(ElementType::F32, 2, &f32_bytes(&[11.0, 0.0]), 2);
        let mut sorted: Vec<u16> = probes.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2]);

        // Probing more clusters than exist returns them all.
        let all = table.nprobe(ElementType::F32, 2, &f32_bytes(&[0.0, 0.0]), 10);
        assert_eq!(all.len(), 4);
    }
}
