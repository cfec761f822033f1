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

//! Engine configuration. The embedder constructs (or deserialises) this
//! and hands it to [`crate::Engine::new`]; loading it from a file is the
//! embedder's concern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding one subdirectory per catalog.
    pub data_path: PathBuf,

    /// Thread-pool size; 0 means hardware concurrency (floor 4).
    pub worker_threads: usize,

    /// Slot capacity of each newly created node's record store. The data
    /// file is sparse, so unused capacity costs address space, not disk.
    pub node_slot_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: PathBuf::from("./data"),
            worker_threads: 0,
            node_slot_capacity: 64 * 1024 * 1024,
        }
    }
}
