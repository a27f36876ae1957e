//! Embedding task semantics and compute device selection.

use serde::{Deserialize, Serialize};

/// Task semantics passed through to the embedding model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingTask {
    #[serde(rename = "retrieval.query")]
    RetrievalQuery,
    #[default]
    #[serde(rename = "retrieval.passage")]
    RetrievalPassage,
    #[serde(rename = "classification")]
    Classification,
    #[serde(rename = "text-matching")]
    TextMatching,
    #[serde(rename = "separation")]
    Separation,
}

impl EmbeddingTask {
    pub const ALL: [EmbeddingTask; 5] = [
        EmbeddingTask::RetrievalQuery,
        EmbeddingTask::RetrievalPassage,
        EmbeddingTask::Classification,
        EmbeddingTask::TextMatching,
        EmbeddingTask::Separation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingTask::RetrievalQuery => "retrieval.query",
            EmbeddingTask::RetrievalPassage => "retrieval.passage",
            EmbeddingTask::Classification => "classification",
            EmbeddingTask::TextMatching => "text-matching",
            EmbeddingTask::Separation => "separation",
        }
    }

    /// Instruction prefix used when the configuration does not override it.
    pub fn default_prompt(&self) -> &'static str {
        match self {
            EmbeddingTask::RetrievalQuery => {
                "Represent the query for retrieving evidence documents: "
            }
            EmbeddingTask::RetrievalPassage => "Represent the document for retrieval: ",
            EmbeddingTask::Classification
            | EmbeddingTask::TextMatching
            | EmbeddingTask::Separation => "",
        }
    }
}

impl std::str::FromStr for EmbeddingTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmbeddingTask::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = EmbeddingTask::ALL.iter().map(|t| t.as_str()).collect();
                format!("unknown task '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

impl std::fmt::Display for EmbeddingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the local model runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Auto,
    Cuda,
    Cpu,
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Device::Auto),
            "cuda" | "gpu" => Ok(Device::Cuda),
            "cpu" => Ok(Device::Cpu),
            _ => Err(format!("unknown device: {s} (expected cuda, cpu or auto)")),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Auto => write!(f, "auto"),
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}
