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

//! Record-model primitives: element types, sentinel values, slot-size
//! arithmetic and the distance item used by every top-k heap.

use std::cmp::Ordering;

/// Header marking the slot after the last written record. A slot with this
/// tag and everything past it is unused.
pub const INVALID_TAG: u64 = u64::MAX;

/// Tombstone header; the slot is eligible for reuse.
pub const DELETED_TAG: u64 = u64::MAX - 1;

/// "No prior record" marker in the load stage file.
pub const INVALID_RECORD_ID: u32 = u32::MAX;

/// "Not indexed yet" cluster id.
pub const INVALID_CLUSTER: u16 = u16::MAX;

/// Size of the `u64` tag header preceding each slot's vector bytes.
pub const SLOT_HEADER_SIZE: u64 = 8;

/// Element type of a dataset's vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F16,
    U8,
}

impl ElementType {
    pub fn byte_size(self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::F16 => 2,
            ElementType::U8 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::U8 => "u8",
        }
    }

    /// Parses a metadata / DDL type name. Datasets are created as `f32` or
    /// `f16`; `u8` exists only for the kernel dispatch.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "f32" => Some(ElementType::F32),
            "f16" => Some(ElementType::F16),
            _ => None,
        }
    }
}

/// Distance metric for exact kNN queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnnMetric {
    L1,
    L2,
    Cosine,
}

impl KnnMetric {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "L1" | "l1" => Some(KnnMetric::L1),
            "L2" | "l2" => Some(KnnMetric::L2),
            "COS" | "cos" => Some(KnnMetric::Cosine),
            _ => None,
        }
    }
}

/// On-disk vector size in bytes: element bytes rounded up to the 8-byte
/// slot alignment.
pub fn record_size(elem: ElementType, dim: usize) -> u64 {
    let raw = (dim * elem.byte_size()) as u64;
    (raw + 7) & !7
}

/// One candidate in a top-k heap. Ordered by distance (then tag, so the
/// order is total); `BinaryHeap<DistItem>` is a max-heap by distance,
/// which is exactly what bounded top-k pruning needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistItem {
    pub dist: f64,
    pub record_id: u64,
    pub tag: u64,
}

impl Eq for DistItem {}

impl Ord for DistItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.tag.cmp(&other.tag))
    }
}

impl PartialOrd for DistItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn record_size_is_8_aligned() {
        assert_eq!(record_size(ElementType::F32, 3), 16);
        assert_eq!(record_size(ElementType::F32, 128), 512);
        assert_eq!(record_size(ElementType::F16, 3), 8);
        assert_eq!(record_size(ElementType::F16, 5), 16);
        assert_eq!(record_size(ElementType::U8, 8), 8);
        assert_eq!(record_size(ElementType::U8, 9), 16);
    }

    #[test]
    fn sentinels_do_not_collide() {
        assert_ne!(INVALID_TAG, DELETED_TAG);
        assert_eq!(INVALID_TAG, 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(DELETED_TAG, 0xFFFF_FFFF_FFFF_FFFE);
    }

    #[test]
    fn dist_item_heap_is_max_by_distance() {
        let mut heap = BinaryHeap::new();
        for (dist, tag) in [(3.0, 1), (1.0, 2), (2.0, 3)] {
            heap.push(DistItem {
                dist,
                record_id: tag,
                tag,
            });
        }
        assert_eq!(heap.pop().unwrap().dist, 3.0);
        assert_eq!(heap.pop().unwrap().dist, 2.0);
        assert_eq!(heap.pop().unwrap().dist, 1.0);
    }
}
