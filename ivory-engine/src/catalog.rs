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

//! A catalog: one directory of datasets under the engine's data path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::error;

use ivory_core::{DatasetMeta, Error, Reply, Result};

use crate::dataset::Dataset;

pub struct Catalog {
    name: String,
    path: PathBuf,
    datasets: HashMap<String, Arc<Dataset>>,
}

impl Catalog {
    /// Creates the catalog directory; fails if it already exists.
    pub fn create(data_path: &Path, name: &str) -> Result<()> {
        let path = data_path.join(name);
        if path.exists() {
            return Err(Error::Validation(format!(
                "path '{}' exists",
                path.display()
            )));
        }
        fs::create_dir(&path).map_err(|e| Error::io(&path, e))
    }

    /// Opens a catalog directory and every dataset inside it.
    pub fn open(data_path: &Path, name: &str) -> Result<Self> {
        let path = data_path.join(name);
        if !path.is_dir() {
            return Err(Error::NotFound(format!(
                "catalog path '{}' does not exist or is not a directory",
                path.display()
            )));
        }

        let mut datasets = HashMap::new();
        let entries = fs::read_dir(&path).map_err(|e| Error::io(&path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&path, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let dataset_name = entry.file_name().to_string_lossy().into_owned();
            let dataset = Dataset::open(&dataset_name, &entry.path()).map_err(|e| {
                error!("failed to initialize dataset '{dataset_name}' in catalog '{name}': {e}");
                e
            })?;
            datasets.insert(dataset_name, Arc::new(dataset));
        }

        Ok(Catalog {
            name: name.to_string(),
            path,
            datasets,
        })
    }

    /// Shuts down every dataset and removes the catalog directory.
    pub fn remove(&mut self) -> Result<()> {
        for dataset in self.datasets.values() {
            dataset.uninit()?;
        }
        self.datasets.clear();
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| Error::io(&self.path, e))?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_dataset(
        &mut self,
        dataset_name: &str,
        meta: &DatasetMeta,
        node_slot_capacity: u64,
    ) -> Result<Reply> {
        if self.datasets.contains_key(dataset_name) {
            return Err(Error::Validation(format!(
                "dataset '{dataset_name}' already exists in catalog '{}'",
                self.name
            )));
        }

        let dataset_path = self.path.join(dataset_name);
        Dataset::create(&dataset_path, meta, node_slot_capacity)?;

        let dataset = Dataset::open(dataset_name, &dataset_path)?;
        self.datasets
            .insert(dataset_name.to_string(), Arc::new(dataset));
        Ok(Reply::status(format!(
            "Successfully created dataset '{dataset_name}'"
        )))
    }

    pub fn drop_dataset(&mut self, dataset_name: &str) -> Result<Reply> {
        let dataset = self.datasets.remove(dataset_name).ok_or_else(|| {
            Error::NotFound(format!(
                "dataset '{dataset_name}' does not exist in catalog '{}'",
                self.name
            ))
        })?;

        dataset.remove()?;
        Ok(Reply::status(format!(
            "Successfully dropped dataset '{dataset_name}'"
        )))
    }

    pub fn list_datasets(&self) -> Reply {
        let mut names: Vec<&str> = self.datasets.keys().map(String::as_str).collect();
        names.sort_unstable();

        let mut out = String::new();
        for name in names {
            out.push_str(name);
            out.push('\n');
        }
        Reply::content(out)
    }

    pub fn find_dataset(&self, dataset_name: &str) -> Option<Arc<Dataset>> {
        self.datasets.get(dataset_name).cloned()
    }

    pub(crate) fn uninit(&mut self) -> Result<()> {
        for dataset in self.datasets.values() {
            dataset.uninit()?;
        }
        self.datasets.clear();
        Ok(())
    }
}
