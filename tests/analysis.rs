//! Analysis of finalized collections stored in SQLite.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tempfile::TempDir;

use chunkvec::analysis::{
    AnalysisParams, ClusterLabel, analyze_collection, export_assignments, write_visualization,
};
use chunkvec::error::AnalysisError;
use chunkvec::models::{CollectionManifest, EmbeddingRecord, EmbeddingTask, Metadata};
use chunkvec::services::vector_store::{SqliteBackend, VectorStore};

const DIM: usize = 4;
const PER_BLOB: usize = 20;

fn params() -> AnalysisParams {
    AnalysisParams {
        max_points: 1000,
        seed: 7,
        clusters: 3,
        outlier_threshold: 4.0,
        perplexity: 10.0,
        iterations: 300,
    }
}

/// Three tight, well separated blobs along the first three axes.
fn blob_records() -> Vec<EmbeddingRecord> {
    let mut records = Vec::new();
    for blob in 0..3 {
        for i in 0..PER_BLOB {
            let mut vector = vec![0.0f32; DIM];
            for (d, x) in vector.iter_mut().enumerate() {
                let jitter = ((i * 37 + d * 11 + blob * 5) % 13) as f32 / 13.0 - 0.5;
                *x = jitter * 0.2;
            }
            vector[blob] += 10.0;
            records.push(EmbeddingRecord {
                id: format!("blob{blob}_{i:02}"),
                vector,
                text: format!("text {i} of blob {blob}"),
                source: format!("blob{blob}.txt"),
                metadata: Metadata::new(),
            });
        }
    }
    records
}

async fn store_with(
    dir: &TempDir,
    name: &str,
    records: Vec<EmbeddingRecord>,
    finalized: bool,
) -> SqliteBackend {
    let store = SqliteBackend::open(&dir.path().join("store.db")).unwrap();
    let collection = format!("{name}__1");
    store.create_collection(&collection, DIM).await.unwrap();

    let mut manifest = CollectionManifest::new(
        name,
        &collection,
        "test/model",
        EmbeddingTask::Separation,
        DIM,
    );
    manifest.document_count = records.len() as u64;
    if finalized {
        manifest.finalized_at = Some(Utc::now());
    }
    store.upsert(&collection, records).await.unwrap();
    store.put_manifest(&manifest).await.unwrap();
    store.set_alias(name, &collection).await.unwrap();
    store
}

#[tokio::test]
async fn clusters_follow_blob_structure() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, "blobs", blob_records(), true).await;

    let report = analyze_collection(&store, "blobs", &params()).await.unwrap();

    assert_eq!(report.collection, "blobs__1");
    assert_eq!(report.total_points, 3 * PER_BLOB);
    assert_eq!(report.assignments.len(), 3 * PER_BLOB);
    assert_eq!(report.clusters, 3);
    assert_eq!(report.outliers, 0);
    assert_eq!(report.cluster_sizes, vec![PER_BLOB; 3]);

    let mut labels_by_blob: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for a in &report.assignments {
        let ClusterLabel::Cluster(label) = a.label else {
            panic!("unexpected outlier: {}", a.id);
        };
        let blob = a.id.split('_').next().unwrap().to_string();
        labels_by_blob.entry(blob).or_default().insert(label);
        assert!(a.coords_2d.iter().all(|c| c.is_finite()));
        assert!(a.coords_3d.iter().all(|c| c.is_finite()));
    }
    assert_eq!(labels_by_blob.len(), 3);
    assert!(labels_by_blob.values().all(|labels| labels.len() == 1));
    let distinct: BTreeSet<u32> = labels_by_blob.values().flatten().copied().collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn same_seed_gives_identical_results() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, "blobs", blob_records(), true).await;

    let first = analyze_collection(&store, "blobs", &params()).await.unwrap();
    let second = analyze_collection(&store, "blobs", &params()).await.unwrap();
    assert_eq!(first.assignments, second.assignments);

    let mut other_seed = params();
    other_seed.seed = 8;
    let third = analyze_collection(&store, "blobs", &other_seed).await.unwrap();
    let coords = |r: &chunkvec::analysis::AnalysisReport| -> Vec<[f64; 2]> {
        r.assignments.iter().map(|a| a.coords_2d).collect()
    };
    assert_ne!(coords(&first), coords(&third));
}

#[tokio::test]
async fn sampling_caps_points_but_reports_collection_size() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, "blobs", blob_records(), true).await;

    let mut capped = params();
    capped.max_points = 25;
    let report = analyze_collection(&store, "blobs", &capped).await.unwrap();
    assert_eq!(report.total_points, 3 * PER_BLOB);
    assert_eq!(report.assignments.len(), 25);
    assert_eq!(report.cluster_sizes.iter().sum::<usize>() + report.outliers, 25);

    let ids: BTreeSet<&str> = report.assignments.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids.len(), 25);
}

#[tokio::test]
async fn writes_visualization_and_assignments() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, "blobs", blob_records(), true).await;
    let report = analyze_collection(&store, "blobs", &params()).await.unwrap();

    let out = dir.path().join("viz");
    let artifact = write_visualization(&report, &params(), &out).unwrap();
    assert_eq!(
        artifact.file_name().unwrap().to_str().unwrap(),
        "visualization_blobs_7_1000_3_4.0.html"
    );
    let html = std::fs::read_to_string(&artifact).unwrap();
    assert!(html.contains("<canvas"));
    assert!(html.contains("blob1_05"));

    let export = dir.path().join("export").join("assignments.json");
    export_assignments(&report, &export).unwrap();
    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&export).unwrap()).unwrap();
    assert_eq!(parsed.len(), 3 * PER_BLOB);
    assert!(parsed[0]["label"].is_u64());
    assert_eq!(parsed[0]["coords_2d"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unfinished_or_missing_collections_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = store_with(&dir, "draft", blob_records(), false).await;

    let err = analyze_collection(&store, "draft", &params()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Incomplete(ref c) if c == "draft__1"));

    let err = analyze_collection(&store, "nope", &params()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::CollectionNotFound(ref n) if n == "nope"));

    let mut bad = params();
    bad.clusters = 0;
    let err = analyze_collection(&store, "draft", &bad).await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidParameters(_)));
}
