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

//! Vector math and IVF index artifacts.
//!
//! [`kernels`] holds the element-typed distance and accumulation kernels,
//! [`centroids`] the immutable on-disk centroid table, and [`builder`] the
//! in-memory k-means++ / Lloyd workspace that trains new centroid sets.

pub mod builder;
pub mod centroids;
pub mod kernels;

pub use builder::IvfBuilder;
pub use centroids::{CentroidTable, CENTROID_MAGIC};
