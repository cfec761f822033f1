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

//! Dataset metadata: the small `KEY=VALUE` text file at a dataset's root.
//!
//! Recognised keys: `TYPE` (`f32`/`f16`), `DIMENSION`, `NODES_COUNT`,
//! `INDEX` (current index version) and `PQ` (PQ chunk count, 0 = absent).
//! Unknown keys are an invariant failure so that a newer on-disk layout is
//! never silently misread.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{record_size, ElementType};

pub const METADATA_FILE: &str = "metadata";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetMeta {
    pub elem: ElementType,
    pub dim: usize,
    pub nodes_count: usize,
    /// Current index version; 0 until the first `make_ivf`.
    pub index_id: u64,
    /// PQ chunk count; 0 while no PQ codebooks exist.
    pub pq_count: usize,
}

impl Default for DatasetMeta {
    fn default() -> Self {
        DatasetMeta {
            elem: ElementType::F32,
            dim: 1024,
            nodes_count: 1,
            index_id: 0,
            pq_count: 0,
        }
    }
}

impl DatasetMeta {
    pub fn record_size(&self) -> u64 {
        record_size(self.elem, self.dim)
    }

    /// Writes `<dir>/metadata`, overwriting any previous content.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let text = format!(
            "TYPE={}\nDIMENSION={}\nNODES_COUNT={}\nINDEX={}\nPQ={}\n",
            self.elem.name(),
            self.dim,
            self.nodes_count,
            self.index_id,
            self.pq_count
        );
        fs::write(&path, text).map_err(|e| Error::io(&path, e))
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

        let mut meta = DatasetMeta::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Invariant(format!(
                    "invalid line in metadata file '{}': {line}",
                    path.display()
                )));
            };

            match key {
                "TYPE" => {
                    meta.elem = ElementType::parse(value).ok_or_else(|| {
                        Error::Invariant(format!("unsupported TYPE value in metadata: '{value}'"))
                    })?;
                }
                "DIMENSION" => meta.dim = parse_num(&path, key, value)? as usize,
                "NODES_COUNT" => meta.nodes_count = parse_num(&path, key, value)? as usize,
                "INDEX" => meta.index_id = parse_num(&path, key, value)?,
                "PQ" => meta.pq_count = parse_num(&path, key, value)? as usize,
                _ => {
                    return Err(Error::Invariant(format!(
                        "unknown key in metadata file '{}': {key}",
                        path.display()
                    )));
                }
            }
        }

        Ok(meta)
    }
}

fn parse_num(path: &Path, key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::Invariant(format!(
            "invalid {key} value in metadata file '{}': {value}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = DatasetMeta {
            elem: ElementType::F16,
            dim: 384,
            nodes_count: 4,
            index_id: 7,
            pq_count: 2,
        };
        meta.write_to(dir.path()).unwrap();
        assert_eq!(DatasetMeta::read_from(dir.path()).unwrap(), meta);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "TYPE=f32\nBOGUS=1\n").unwrap();
        assert!(matches!(
            DatasetMeta::read_from(dir.path()),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn u8_type_is_not_a_dataset_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "TYPE=u8\n").unwrap();
        assert!(DatasetMeta::read_from(dir.path()).is_err());
    }
}
