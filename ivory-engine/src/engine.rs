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

//! The engine: catalogs under one data directory plus the shared thread
//! pool. An explicit value owned by the embedder; command routers and
//! transports live on top of this API.

use std::collections::HashMap;
use std::fs;

use tracing::error;

use ivory_core::{DatasetMeta, ElementType, Error, Reply, Result, ThreadPool};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::dataset::Dataset;

pub struct Engine {
    config: Config,
    catalogs: HashMap<String, Catalog>,
    pool: Option<ThreadPool>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Engine {
            config,
            catalogs: HashMap::new(),
            pool: None,
        }
    }

    /// Creates the data directory when missing and opens every catalog
    /// (and dataset) found inside it.
    pub fn init(&mut self) -> Result<()> {
        let data_path = self.config.data_path.clone();
        if !data_path.exists() {
            fs::create_dir_all(&data_path).map_err(|e| Error::io(&data_path, e))?;
        }

        let entries = fs::read_dir(&data_path).map_err(|e| Error::io(&data_path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&data_path, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let catalog = Catalog::open(&data_path, &name).map_err(|e| {
                error!("failed to initialize catalog '{name}': {e}");
                e
            })?;
            self.catalogs.insert(name, catalog);
        }
        Ok(())
    }

    /// Shuts everything down: drains datasets, then stops the pool.
    pub fn uninit(&mut self) -> Result<()> {
        for catalog in self.catalogs.values_mut() {
            catalog.uninit()?;
        }
        self.catalogs.clear();
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        Ok(())
    }

    /// Starts the shared fan-out pool; 0 threads picks the default size.
    pub fn start_thread_pool(&mut self, threads: usize) {
        let threads = if threads == 0 {
            self.config.worker_threads
        } else {
            threads
        };
        self.pool = Some(ThreadPool::new(threads));
    }

    pub fn thread_pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_catalog(&mut self, name: &str) -> Result<Reply> {
        validate_identifier(name)?;
        if self.catalogs.contains_key(name) {
            return Err(Error::Validation(format!(
                "catalog '{name}' already exists"
            )));
        }

        Catalog::create(&self.config.data_path, name)?;
        let catalog = Catalog::open(&self.config.data_path, name)?;
        self.catalogs.insert(name.to_string(), catalog);
        Ok(Reply::status(format!(
            "Successfully created catalog '{name}'"
        )))
    }

    pub fn drop_catalog(&mut self, name: &str) -> Result<Reply> {
        let mut catalog = self
            .catalogs
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("catalog '{name}' does not exist")))?;
        catalog.remove()?;
        Ok(Reply::status(format!(
            "Successfully dropped catalog '{name}'"
        )))
    }

    pub fn list_catalogs(&self) -> Reply {
        let mut names: Vec<&str> = self.catalogs.keys().map(String::as_str).collect();
        names.sort_unstable();

        let mut out = String::new();
        for name in names {
            out.push_str(name);
            out.push('\n');
        }
        Reply::content(out)
    }

    pub fn create_dataset(
        &mut self,
        catalog_name: &str,
        dataset_name: &str,
        elem: ElementType,
        dim: usize,
        nodes_count: usize,
    ) -> Result<Reply> {
        validate_identifier(dataset_name)?;
        if dim == 0 || nodes_count == 0 {
            return Err(Error::Validation(
                "dataset dimension and node count must be nonzero".into(),
            ));
        }

        let node_slot_capacity = self.config.node_slot_capacity;
        let catalog = self.catalog_mut(catalog_name)?;
        let meta = DatasetMeta {
            elem,
            dim,
            nodes_count,
            ..DatasetMeta::default()
        };
        catalog.create_dataset(dataset_name, &meta, node_slot_capacity)
    }

    pub fn drop_dataset(&mut self, catalog_name: &str, dataset_name: &str) -> Result<Reply> {
        self.catalog_mut(catalog_name)?.drop_dataset(dataset_name)
    }

    pub fn list_datasets(&self, catalog_name: &str) -> Result<Reply> {
        Ok(self.catalog(catalog_name)?.list_datasets())
    }

    pub fn show_dataset(&self, catalog_name: &str, dataset_name: &str) -> Result<Reply> {
        let dataset = self.find_dataset(catalog_name, dataset_name)?;
        let meta = dataset.metadata();
        Ok(Reply::content(format!(
            "Type: {}\nDim: {}\nNodes: {}\nIndex: {}\nPQ: {}\n",
            meta.elem.name(),
            meta.dim,
            meta.nodes_count,
            meta.index_id,
            meta.pq_count
        )))
    }

    pub fn find_dataset(
        &self,
        catalog_name: &str,
        dataset_name: &str,
    ) -> Result<std::sync::Arc<Dataset>> {
        self.catalog(catalog_name)?
            .find_dataset(dataset_name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "dataset '{dataset_name}' does not exist in catalog '{catalog_name}'"
                ))
            })
    }

    fn catalog(&self, name: &str) -> Result<&Catalog> {
        self.catalogs
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("catalog '{name}' does not exist")))
    }

    fn catalog_mut(&mut self, name: &str) -> Result<&mut Catalog> {
        self.catalogs
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("catalog '{name}' does not exist")))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.uninit() {
            error!("engine shutdown failed: {e}");
        }
    }
}

/// Catalog and dataset names: `[A-Za-z_][A-Za-z0-9_]*`.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid identifier '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("abc").is_ok());
        assert!(validate_identifier("_a1_b2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("a b").is_err());
    }
}
