//! Embedding-space analysis: sample, project, cluster, flag outliers, render.

mod cluster;
mod outliers;
mod projection;
mod render;
mod sample;

use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

pub use cluster::{KMeans, kmeans};
pub use outliers::flag_outliers;
pub use projection::{TsneParams, effective_perplexity, tsne};
pub use render::render_html;
pub use sample::sample_ids;

use crate::error::AnalysisError;
use crate::models::{AnalysisConfig, EmbeddingRecord};
use crate::services::vector_store::{VectorStore, resolve_collection};

/// Parameters that fully determine an analysis result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisParams {
    pub max_points: usize,
    pub seed: u64,
    pub clusters: usize,
    pub outlier_threshold: f64,
    pub perplexity: f64,
    pub iterations: usize,
}

impl From<&AnalysisConfig> for AnalysisParams {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            max_points: config.max_points,
            seed: config.seed,
            clusters: config.clusters,
            outlier_threshold: config.outlier_threshold,
            perplexity: config.perplexity,
            iterations: config.iterations,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.max_points == 0 {
            return Err(AnalysisError::InvalidParameters(
                "max_points must be at least 1".into(),
            ));
        }
        if self.clusters == 0 {
            return Err(AnalysisError::InvalidParameters(
                "clusters must be at least 1".into(),
            ));
        }
        if !self.outlier_threshold.is_finite() || self.outlier_threshold < 0.0 {
            return Err(AnalysisError::InvalidParameters(format!(
                "outlier_threshold must be a non-negative number, got {}",
                self.outlier_threshold
            )));
        }
        if !self.perplexity.is_finite() || self.perplexity <= 0.0 {
            return Err(AnalysisError::InvalidParameters(format!(
                "perplexity must be positive, got {}",
                self.perplexity
            )));
        }
        Ok(())
    }

    /// `visualization_<collection>_<seed>_<max_points>_<k>_<threshold>.html`
    pub fn file_name(&self, collection: &str) -> String {
        format!(
            "visualization_{}_{}_{}_{}_{:?}.html",
            collection, self.seed, self.max_points, self.clusters, self.outlier_threshold
        )
    }

    fn tsne(&self) -> TsneParams {
        TsneParams {
            perplexity: self.perplexity,
            iterations: self.iterations,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterLabel {
    Cluster(u32),
    Outlier,
}

impl Serialize for ClusterLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ClusterLabel::Cluster(c) => serializer.serialize_u32(*c),
            ClusterLabel::Outlier => serializer.serialize_str("outlier"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterAssignment {
    pub id: String,
    pub label: ClusterLabel,
    pub coords_2d: [f64; 2],
    pub coords_3d: [f64; 3],
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    /// Name the caller asked for.
    pub name: String,
    /// Physical collection that was read.
    pub collection: String,
    pub model_name: String,
    pub dimension: usize,
    pub total_points: usize,
    /// Effective cluster count after clamping to the sample size.
    pub clusters: usize,
    pub cluster_sizes: Vec<usize>,
    pub outliers: usize,
    pub assignments: Vec<ClusterAssignment>,
    #[serde(skip)]
    pub points: Vec<EmbeddingRecord>,
}

/// Deterministic core: same records and parameters give identical output.
pub fn analyze_records(
    records: &[EmbeddingRecord],
    params: &AnalysisParams,
) -> Result<(Vec<ClusterAssignment>, KMeans), AnalysisError> {
    params.validate()?;
    let Some(first) = records.first() else {
        return Ok((Vec::new(), kmeans(Array2::<f64>::zeros((0, 0)).view(), 0, 0)));
    };
    let dim = first.vector.len();
    if let Some(bad) = records.iter().find(|r| r.vector.len() != dim) {
        return Err(AnalysisError::InconsistentVectors(format!(
            "record '{}' has dimension {}, expected {}",
            bad.id,
            bad.vector.len(),
            dim
        )));
    }

    let data = Array2::from_shape_fn((records.len(), dim), |(i, j)| {
        f64::from(records[i].vector[j])
    });

    let clustering = kmeans(data.view(), params.clusters, params.seed);
    debug!(k = clustering.k(), iterations = clustering.iterations, "k-means done");
    let flags = flag_outliers(data.view(), &clustering, params.outlier_threshold);

    let tsne_params = params.tsne();
    let y2 = tsne(data.view(), 2, &tsne_params);
    let y3 = tsne(data.view(), 3, &tsne_params);

    let assignments = records
        .iter()
        .enumerate()
        .map(|(i, record)| ClusterAssignment {
            id: record.id.clone(),
            label: if flags[i] {
                ClusterLabel::Outlier
            } else {
                ClusterLabel::Cluster(clustering.labels[i] as u32)
            },
            coords_2d: [y2[[i, 0]], y2[[i, 1]]],
            coords_3d: [y3[[i, 0]], y3[[i, 1]], y3[[i, 2]]],
        })
        .collect();

    Ok((assignments, clustering))
}

/// Analyze a finalized collection, addressed by logical or physical name.
pub async fn analyze_collection(
    store: &dyn VectorStore,
    name: &str,
    params: &AnalysisParams,
) -> Result<AnalysisReport, AnalysisError> {
    params.validate()?;

    let collection = resolve_collection(store, name)
        .await?
        .ok_or_else(|| AnalysisError::CollectionNotFound(name.to_string()))?;
    let manifest = store
        .get_manifest(&collection)
        .await?
        .filter(|m| m.is_complete())
        .ok_or_else(|| AnalysisError::Incomplete(collection.clone()))?;

    let ids = store.list_ids(&collection).await?;
    if ids.is_empty() {
        return Err(AnalysisError::Empty(collection));
    }
    let sampled = sample_ids(&ids, params.max_points, params.seed);
    info!(
        collection = %collection,
        total = ids.len(),
        sampled = sampled.len(),
        "fetching vectors for analysis"
    );

    let records = store.fetch(&collection, &sampled).await?;
    if let Some(bad) = records
        .iter()
        .find(|r| r.vector.len() != manifest.dimensionality)
    {
        return Err(AnalysisError::InconsistentVectors(format!(
            "record '{}' has dimension {}, manifest says {}",
            bad.id,
            bad.vector.len(),
            manifest.dimensionality
        )));
    }

    let owned_params = *params;
    let (records, assignments, clustering) = tokio::task::spawn_blocking(move || {
        analyze_records(&records, &owned_params).map(|(a, c)| (records, a, c))
    })
    .await??;

    let outliers = assignments
        .iter()
        .filter(|a| a.label == ClusterLabel::Outlier)
        .count();
    let mut cluster_sizes = vec![0; clustering.k()];
    for a in &assignments {
        if let ClusterLabel::Cluster(c) = a.label {
            cluster_sizes[c as usize] += 1;
        }
    }

    info!(
        collection = %collection,
        clusters = clustering.k(),
        outliers,
        "analysis complete"
    );

    Ok(AnalysisReport {
        name: name.to_string(),
        collection,
        model_name: manifest.model_name,
        dimension: manifest.dimensionality,
        total_points: ids.len(),
        clusters: clustering.k(),
        cluster_sizes,
        outliers,
        assignments,
        points: records,
    })
}

/// Render the report into `dir` and return the artifact path.
pub fn write_visualization(
    report: &AnalysisReport,
    params: &AnalysisParams,
    dir: &Path,
) -> Result<PathBuf, AnalysisError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(params.file_name(&report.name));
    std::fs::write(&path, render_html(report)?)?;
    Ok(path)
}

/// Write the cluster assignments as a JSON array.
pub fn export_assignments(report: &AnalysisReport, path: &Path) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&report.assignments)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;

    fn params() -> AnalysisParams {
        AnalysisParams {
            max_points: 100,
            seed: 3,
            clusters: 2,
            outlier_threshold: 3.0,
            perplexity: 5.0,
            iterations: 100,
        }
    }

    fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord::from_document(Document::new(id, "text", "src"), vector)
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(
            params().file_name("docs"),
            "visualization_docs_3_100_2_3.0.html"
        );
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut p = params();
        p.clusters = 0;
        assert!(p.validate().is_err());

        let mut p = params();
        p.outlier_threshold = f64::NAN;
        assert!(p.validate().is_err());

        let mut p = params();
        p.outlier_threshold = -1.0;
        assert!(p.validate().is_err());

        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_label_serialization() {
        assert_eq!(serde_json::to_string(&ClusterLabel::Cluster(4)).unwrap(), "4");
        assert_eq!(
            serde_json::to_string(&ClusterLabel::Outlier).unwrap(),
            "\"outlier\""
        );
    }

    #[test]
    fn test_inconsistent_dimensions_rejected() {
        let records = vec![record("a", vec![1.0, 0.0]), record("b", vec![1.0])];
        assert!(matches!(
            analyze_records(&records, &params()),
            Err(AnalysisError::InconsistentVectors(_))
        ));
    }

    #[test]
    fn test_single_point() {
        let records = vec![record("a", vec![1.0, 0.0])];
        let (assignments, clustering) = analyze_records(&records, &params()).unwrap();
        assert_eq!(clustering.k(), 1);
        assert_eq!(assignments[0].label, ClusterLabel::Cluster(0));
        assert_eq!(assignments[0].coords_2d, [0.0, 0.0]);
        assert_eq!(assignments[0].coords_3d, [0.0, 0.0, 0.0]);
    }
}
