use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scalar metadata value attached to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Convert a JSON value, rejecting arrays, objects and null.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::Text(s)),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Int(n) => write!(f, "{n}"),
            MetadataValue::Float(x) => write!(f, "{x}"),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A normalized corpus record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    /// 1-based line number in the corpus file.
    #[serde(skip)]
    pub line: u64,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: source.into(),
            metadata: Metadata::new(),
            line: 0,
        }
    }

    #[must_use]
    pub fn at_line(mut self, line: u64) -> Self {
        self.line = line;
        self
    }
}

/// A document's vector plus everything stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EmbeddingRecord {
    pub fn from_document(document: Document, vector: Vec<f32>) -> Self {
        Self {
            id: document.id,
            vector,
            text: document.text,
            source: document.source,
            metadata: document.metadata,
        }
    }

    pub fn dimensionality(&self) -> usize {
        self.vector.len()
    }
}

/// One ranked result of a similarity query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: String,
    /// Cosine distance (`1 - cosine similarity`).
    pub distance: f32,
    pub text: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl QueryHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}
