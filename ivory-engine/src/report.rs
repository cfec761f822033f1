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

//! Shared progress counters for a load operation, merged across all node
//! workers without locking.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LoadReport {
    pub input_count: AtomicU64,
    pub staged_count: AtomicU64,
    pub staged_read_count: AtomicU64,
    pub added_count: AtomicU64,
    pub removed_count: AtomicU64,
    pub updated_count: AtomicU64,
    pub nodes_count: AtomicU64,
    pub conversion_errors_count: AtomicU64,
    pub processed_count: AtomicU64,
}

impl LoadReport {
    pub fn summary(&self) -> String {
        format!(
            "Loaded {} / {} items into dataset\n - added: {}\n - removed: {}\n - updated: {}\n",
            self.processed_count.load(Ordering::Relaxed),
            self.input_count.load(Ordering::Relaxed),
            self.added_count.load(Ordering::Relaxed),
            self.removed_count.load(Ordering::Relaxed),
            self.updated_count.load(Ordering::Relaxed),
        )
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
