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

//! On-disk primitives owned by a single dataset node.
//!
//! - [`slot_store`]: the append-oriented, memory-mapped fixed-slot record
//!   file with its tombstone free-list and `.info` sidecar.
//! - [`kv`]: the transactional embedded KV layer backing the
//!   tag → (record id, cluster id) map and the cluster id → record id
//!   inverted index.
//! - [`input`]: the memory-mapped text-input reader and the synthetic
//!   input generator consumed by the load path.

pub mod input;
pub mod kv;
pub mod slot_store;

pub use input::{InputData, InputGenerator, ParsedVector};
pub use kv::{IndexTxn, NodeIndex};
pub use slot_store::{Record, RecordStore, Scan};
