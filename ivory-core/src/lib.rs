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

//! Shared foundation for the ivory vector store.
//!
//! This crate carries the pieces every other layer needs: the element and
//! sentinel types of the on-disk record model, dataset metadata, the
//! error/reply model shared by all operations, and the fixed thread pool
//! that fan-out work is scheduled on.

pub mod error;
pub mod meta;
pub mod pool;
pub mod types;

pub use error::{Error, Reply, Result};
pub use meta::DatasetMeta;
pub use pool::{TaskHandle, ThreadPool};
pub use types::{
    record_size, DistItem, ElementType, KnnMetric, DELETED_TAG, INVALID_CLUSTER,
    INVALID_RECORD_ID, INVALID_TAG, SLOT_HEADER_SIZE,
};
