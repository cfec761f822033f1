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

//! IVF build, ANN, residual and PQ pipeline scenarios.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ivory_core::{ElementType, KnnMetric};
use ivory_engine::{Config, Dataset, Engine, LoadReport};
use ivory_index::CentroidTable;

struct TestDb {
    dir: tempfile::TempDir,
    engine: Engine,
}

impl TestDb {
    fn new(dim: usize, nodes: usize) -> (Self, Arc<Dataset>) {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(Config {
            data_path: dir.path().join("data"),
            worker_threads: 4,
            node_slot_capacity: 8192,
        });
        engine.init().unwrap();
        engine.create_catalog("test").unwrap();
        engine
            .create_dataset("test", "ds", ElementType::F32, dim, nodes)
            .unwrap();
        engine.start_thread_pool(0);

        let dataset = engine.find_dataset("test", "ds").unwrap();
        (TestDb { dir, engine }, dataset)
    }

    fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn dataset_path(&self) -> PathBuf {
        self.dir.path().join("data").join("test").join("ds")
    }
}

fn load(db: &TestDb, dataset: &Dataset, path: &Path) {
    let report = Arc::new(LoadReport::default());
    dataset
        .load(path, &report, db.engine.thread_pool())
        .unwrap();
}

/// Input with `clusters` distinct vectors, each repeated `count/clusters`
/// times: the first half of the coordinates cycles 1.1..clusters+0.1, the
/// second half runs 5.5 upward in lockstep. Tags start at 1.
fn write_clustered_input(path: &Path, count: usize, dim: usize, clusters: usize) {
    let mut file = fs::File::create(path).unwrap();
    let mut val1 = 1.1f32;
    let mut val2 = 5.5f32;

    for i in 0..count {
        write!(file, "{} : [ ", i + 1).unwrap();
        let half = dim / 2;
        for _ in 0..half {
            write!(file, "{val1:.2}, ").unwrap();
        }
        for j in half..dim {
            if j + 1 < dim {
                write!(file, "{val2:.2}, ").unwrap();
            } else {
                writeln!(file, "{val2:.2} ]").unwrap();
            }
        }

        val1 += 1.0;
        val2 += 1.0;
        if val1 > clusters as f32 + 1.0 {
            val1 = 1.1;
            val2 = 5.5;
        }
    }
}

fn f32_query(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// The query vector matching one of the clustered-input groups.
fn cluster_query(dim: usize, group: usize) -> Vec<u8> {
    let val1 = 1.1 + group as f32;
    let val2 = 5.5 + group as f32;
    let half = dim / 2;
    let mut values = vec![val1; half];
    values.extend(std::iter::repeat(val2).take(dim - half));
    f32_query(&values)
}

fn reply_tags(message: &str) -> Vec<u64> {
    if message.is_empty() {
        return Vec::new();
    }
    message
        .split(", ")
        .map(|t| t.parse().unwrap())
        .collect()
}

#[test]
fn make_ivf_rotates_versions_and_show_ivf_lists_all_centroids() {
    let (db, dataset) = TestDb::new(8, 2);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 2000, 8, 4);
    load(&db, &dataset, &input);

    assert!(dataset.show_ivf().is_err(), "no index yet");

    dataset
        .make_ivf(4, 400, 16, db.engine.thread_pool())
        .unwrap();

    assert_eq!(dataset.metadata().index_id, 1);
    assert!(db.dataset_path().join("index_1").join("centroids").exists());
    for node in 0..2 {
        assert!(db
            .dataset_path()
            .join(format!("node_{node}"))
            .join("index_1")
            .exists());
    }

    let reply = dataset.show_ivf().unwrap();
    assert!(reply.is_content);
    assert_eq!(reply.message.lines().count(), 4);

    // A second build bumps the version again.
    dataset
        .make_ivf(4, 400, 16, db.engine.thread_pool())
        .unwrap();
    assert_eq!(dataset.metadata().index_id, 2);
}

#[test]
fn ann_with_all_probes_matches_exact_knn() {
    let (db, dataset) = TestDb::new(8, 2);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 2000, 8, 4);
    load(&db, &dataset, &input);
    dataset
        .make_ivf(4, 400, 16, db.engine.thread_pool())
        .unwrap();

    let query = cluster_query(8, 1);
    let knn = dataset
        .knn(KnnMetric::L2, 20, &query, u64::MAX, db.engine.thread_pool())
        .unwrap();
    let ann = dataset
        .ann(20, 4, &query, u64::MAX, db.engine.thread_pool())
        .unwrap();

    let knn_tags = reply_tags(&knn.message);
    let ann_tags = reply_tags(&ann.message);
    assert_eq!(knn_tags.len(), 20);
    assert_eq!(knn_tags, ann_tags);

    // A narrow probe still returns the right cluster's members.
    let ann = dataset
        .ann(10, 1, &query, u64::MAX, db.engine.thread_pool())
        .unwrap();
    let tags = reply_tags(&ann.message);
    assert_eq!(tags.len(), 10);
    for tag in tags {
        // Group 1 of 4 holds tags where (tag - 1) % 4 == 1.
        assert_eq!((tag - 1) % 4, 1, "tag {tag} is not in the probed cluster");
    }
}

#[test]
fn load_after_index_assigns_new_records_to_clusters() {
    let (db, dataset) = TestDb::new(8, 2);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 2000, 8, 4);
    load(&db, &dataset, &input);
    dataset
        .make_ivf(4, 400, 16, db.engine.thread_pool())
        .unwrap();

    // A fresh record identical to cluster group 2's vector.
    let extra = db.scratch("extra.data");
    write_clustered_input(&extra, 1, 8, 4);
    let text = fs::read_to_string(&extra).unwrap();
    let body = text.split_once(" : ").unwrap().1.trim().to_string();
    fs::write(&extra, format!("5001 : {body}\n")).unwrap();
    load(&db, &dataset, &extra);

    let query = cluster_query(8, 0);
    let ann = dataset
        .ann(2000, 1, &query, u64::MAX, db.engine.thread_pool())
        .unwrap();
    assert!(
        reply_tags(&ann.message).contains(&5001),
        "new record was not indexed into its cluster"
    );
}

#[test]
fn gc_drops_stale_versions_and_is_idempotent() {
    let (db, dataset) = TestDb::new(8, 1);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 800, 8, 4);
    load(&db, &dataset, &input);

    dataset.make_ivf(4, 200, 8, db.engine.thread_pool()).unwrap();
    dataset.make_ivf(4, 200, 8, db.engine.thread_pool()).unwrap();
    assert_eq!(dataset.metadata().index_id, 2);

    let node_index_0 = db.dataset_path().join("node_0").join("index_0");
    assert!(node_index_0.exists());

    dataset.gc().unwrap();
    assert!(!node_index_0.exists());
    assert!(db.dataset_path().join("node_0").join("index_1").exists());
    assert!(db.dataset_path().join("node_0").join("index_2").exists());

    let snapshot = || {
        let mut names: Vec<String> = fs::read_dir(db.dataset_path().join("node_0"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };
    let before = snapshot();
    dataset.gc().unwrap();
    assert_eq!(before, snapshot());
}

#[test]
fn residuals_of_tight_clusters_are_near_zero() {
    let (db, dataset) = TestDb::new(8, 2);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 2000, 8, 4);
    load(&db, &dataset, &input);
    dataset
        .make_ivf(4, 400, 16, db.engine.thread_pool())
        .unwrap();

    assert!(dataset.make_pq_centroids(2, 4, None).is_err(), "no residuals yet");

    dataset
        .make_residuals(1000, db.engine.thread_pool())
        .unwrap();

    let residuals_path = db.dataset_path().join("index_1").join("residuals");
    let bytes = fs::read(&residuals_path).unwrap();
    // 1000 is already a multiple of 4 clusters and 2 nodes; 8 f32s = 32 B.
    assert_eq!(bytes.len(), 1000 * 32);

    // Four exact cluster points ⇒ centroids coincide with them ⇒ every
    // residual is (almost) zero.
    for row in bytes.chunks_exact(4) {
        let v = f32::from_le_bytes(row.try_into().unwrap());
        assert!(v.abs() < 1.0, "residual {v} too large");
    }

    // Rebuilding the residuals reuses the file without growing it.
    dataset
        .make_residuals(1000, db.engine.thread_pool())
        .unwrap();
    assert_eq!(fs::read(&residuals_path).unwrap().len(), 1000 * 32);
}

#[test]
fn pq_pipeline_produces_per_chunk_codebooks() {
    let (db, dataset) = TestDb::new(8, 1);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 2000, 8, 4);
    load(&db, &dataset, &input);

    dataset.mock_ivf(4, 400).unwrap();
    dataset
        .make_residuals(1000, db.engine.thread_pool())
        .unwrap();
    dataset
        .make_pq_centroids(2, 4, db.engine.thread_pool())
        .unwrap();

    assert_eq!(dataset.metadata().pq_count, 2);
    assert_eq!(dataset.pq_tables().len(), 2);

    for chunk in 0..2 {
        let path = db
            .dataset_path()
            .join("index_1")
            .join(format!("pq_centroids_{chunk}"));
        let table = CentroidTable::open(&path).unwrap();
        assert_eq!(table.count(), 4);
        assert_eq!(table.centroid_size(), 16); // 4 f32 sub-dimensions
    }
}

#[test]
fn pq_rejects_indivisible_chunking() {
    let (db, dataset) = TestDb::new(8, 1);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 400, 8, 4);
    load(&db, &dataset, &input);
    dataset.mock_ivf(4, 200).unwrap();
    dataset
        .make_residuals(400, db.engine.thread_pool())
        .unwrap();

    assert!(dataset
        .make_pq_centroids(3, 4, db.engine.thread_pool())
        .is_err());
}

#[test]
fn index_rotation_invalidates_pq_artifacts() {
    let (db, dataset) = TestDb::new(8, 1);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 800, 8, 4);
    load(&db, &dataset, &input);

    dataset.mock_ivf(4, 200).unwrap();
    dataset
        .make_residuals(400, db.engine.thread_pool())
        .unwrap();
    dataset
        .make_pq_centroids(2, 4, db.engine.thread_pool())
        .unwrap();
    assert_eq!(dataset.metadata().pq_count, 2);

    dataset.mock_ivf(4, 200).unwrap();
    assert_eq!(dataset.metadata().pq_count, 0);
    assert!(dataset.pq_tables().is_empty());
}

#[test]
fn residuals_require_an_index() {
    let (db, dataset) = TestDb::new(8, 1);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 100, 8, 4);
    load(&db, &dataset, &input);

    assert!(dataset
        .make_residuals(100, db.engine.thread_pool())
        .is_err());
    assert!(dataset
        .ann(5, 2, &cluster_query(8, 0), u64::MAX, db.engine.thread_pool())
        .is_err());
}

#[test]
fn sampling_previews_come_from_the_store() {
    let (db, dataset) = TestDb::new(8, 2);

    let input = db.scratch("clustered.data");
    write_clustered_input(&input, 400, 8, 4);
    load(&db, &dataset, &input);

    let reply = dataset.sample_preview(32, db.engine.thread_pool()).unwrap();
    assert!(reply.is_content);
    let lines: Vec<&str> = reply.message.lines().collect();
    assert_eq!(lines.len(), 16);
    // Every sampled row is one of the four cluster points.
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let first: f32 = line.split(", ").next().unwrap().parse().unwrap();
        let group = (first - 1.1).round();
        assert!((0.0..4.0).contains(&group), "unexpected sample {line}");
    }

    let reply = dataset.kmeans_pp(4, 200, db.engine.thread_pool()).unwrap();
    assert_eq!(reply.message.lines().count(), 4);

    let reply = dataset
        .make_centroids(4, 200, 8, db.engine.thread_pool())
        .unwrap();
    assert_eq!(reply.message.lines().count(), 4);
}
