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

//! The ivory engine: catalogs of sharded vector datasets.
//!
//! An [`Engine`] owns catalogs (directories) of datasets; a [`Dataset`]
//! owns `N` node shards and fans bulk work out to them through the shared
//! thread pool. Node workers ([`node::NodeWorker`]) own one shard's record
//! store and KV index and execute on pool threads.
//!
//! The engine is an explicit value created by the embedder; there is no
//! process-wide singleton. The command parser, RPC transport and CLI are
//! external collaborators built on top of this crate's API.

pub mod catalog;
pub mod config;
pub mod dataset;
mod dataset_ivf;
pub mod engine;
pub mod node;
mod node_ivf;
pub mod report;

pub use catalog::Catalog;
pub use config::Config;
pub use dataset::Dataset;
pub use engine::Engine;
pub use report::LoadReport;
