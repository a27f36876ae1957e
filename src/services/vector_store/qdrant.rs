//! Qdrant vector store backend implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::collections_client::CollectionsClient;
use qdrant_client::qdrant::{
    self, AliasOperations, ChangeAliases, CountPointsBuilder, CreateAlias,
    CreateCollectionBuilder, DeleteAlias, Distance, GetPointsBuilder, PayloadIncludeSelector,
    PointId, PointStruct, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder, alias_operations,
};
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Endpoint;
use uuid::Uuid;

use super::{CollectionInfo, VectorStore};
use crate::error::VectorStoreError;
use crate::models::{CollectionManifest, EmbeddingRecord, Metadata, QueryHit, VectorStoreConfig};

/// Collection holding one point per manifest.
pub const MANIFEST_COLLECTION: &str = "chunkvec_manifests";

const SCROLL_PAGE: u32 = 256;
const FETCH_CHUNK: usize = 256;

/// Qdrant vector store backend.
pub struct QdrantBackend {
    client: Qdrant,
    url: String,
    api_key: Option<String>,
}

impl QdrantBackend {
    pub fn new(config: &VectorStoreConfig) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Apply all alias actions in a single `UpdateAliases` request, which
    /// Qdrant executes atomically.
    async fn change_aliases(&self, change: ChangeAliases) -> Result<(), VectorStoreError> {
        let channel = Endpoint::from_shared(self.url.clone())
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?
            .connect()
            .await
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;
        let api_key = self
            .api_key
            .as_deref()
            .map(AsciiMetadataValue::try_from)
            .transpose()
            .map_err(|e| VectorStoreError::ConnectionError(format!("invalid api key: {e}")))?;

        let mut client =
            CollectionsClient::with_interceptor(channel, move |mut req: tonic::Request<()>| {
                if let Some(ref key) = api_key {
                    req.metadata_mut().insert("api-key", key.clone());
                }
                Ok(req)
            });
        client
            .update_aliases(change)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.message().to_string()))?;
        Ok(())
    }

    async fn ensure_manifest_collection(&self) -> Result<(), VectorStoreError> {
        let exists = self
            .client
            .collection_exists(MANIFEST_COLLECTION)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        if !exists {
            self.create_collection(MANIFEST_COLLECTION, 1).await?;
        }
        Ok(())
    }

    async fn count_points(&self, name: &str) -> Result<u64, VectorStoreError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(name).exact(true))
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        Ok(response.result.map_or(0, |r| r.count))
    }
}

/// Point id for a document id. Qdrant only accepts integers and UUIDs.
pub fn point_id(doc_id: &str) -> PointId {
    PointId::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, doc_id.as_bytes()).to_string())
}

fn string_field(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    })
}

fn record_payload(record: &EmbeddingRecord) -> Result<HashMap<String, QdrantValue>, VectorStoreError> {
    let mut payload: HashMap<String, QdrantValue> = HashMap::new();
    payload.insert("doc_id".to_string(), record.id.clone().into());
    payload.insert("text".to_string(), record.text.clone().into());
    payload.insert("source".to_string(), record.source.clone().into());
    payload.insert(
        "metadata".to_string(),
        serde_json::to_string(&record.metadata)?.into(),
    );
    Ok(payload)
}

fn payload_metadata(payload: &HashMap<String, QdrantValue>) -> Result<Metadata, VectorStoreError> {
    match string_field(payload, "metadata") {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Metadata::new()),
    }
}

#[allow(deprecated)]
fn extract_vector(vectors: &Option<qdrant::VectorsOutput>) -> Option<Vec<f32>> {
    match vectors {
        Some(qdrant::VectorsOutput {
            vectors_options: Some(qdrant::vectors_output::VectorsOptions::Vector(v)),
        }) => Some(v.data.clone()),
        Some(qdrant::VectorsOutput {
            vectors_options: Some(qdrant::vectors_output::VectorsOptions::Vectors(map)),
        }) => map.vectors.values().next().map(|v| v.data.clone()),
        _ => None,
    }
}

fn extract_dimension(config: &Option<qdrant::CollectionConfig>) -> usize {
    let Some(vectors_config) = config
        .as_ref()
        .and_then(|c| c.params.as_ref())
        .and_then(|p| p.vectors_config.as_ref())
    else {
        return 0;
    };
    match &vectors_config.config {
        Some(qdrant::vectors_config::Config::Params(p)) => p.size as usize,
        Some(qdrant::vectors_config::Config::ParamsMap(map)) => {
            map.map.values().next().map_or(0, |p| p.size as usize)
        }
        None => 0,
    }
}

fn is_not_found(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("not found") || lower.contains("doesn't exist") || lower.contains("does not exist")
}

#[async_trait]
impl VectorStore for QdrantBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        self.client
            .health_check()
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn collection_info(
        &self,
        name: &str,
    ) -> Result<Option<CollectionInfo>, VectorStoreError> {
        match self.client.collection_info(name).await {
            Ok(info) => {
                let dimension = info
                    .result
                    .as_ref()
                    .map_or(0, |r| extract_dimension(&r.config));
                Ok(Some(CollectionInfo {
                    name: name.to_string(),
                    points_count: self.count_points(name).await?,
                    dimension,
                }))
            }
            Err(e) => {
                let msg = e.to_string();
                if is_not_found(&msg) {
                    Ok(None)
                } else {
                    Err(VectorStoreError::CollectionError(msg))
                }
            }
        }
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), VectorStoreError> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        if exists {
            return Ok(());
        }

        let create_collection = CreateCollectionBuilder::new(name).vectors_config(
            VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
        );

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        if name != MANIFEST_COLLECTION
            && self
                .client
                .collection_exists(MANIFEST_COLLECTION)
                .await
                .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?
        {
            let delete = qdrant::DeletePointsBuilder::new(MANIFEST_COLLECTION)
                .points(vec![point_id(name)])
                .wait(true);
            self.client
                .delete_points(delete)
                .await
                .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        let mut names: Vec<String> = response
            .collections
            .into_iter()
            .map(|c| c.name)
            .filter(|n| n != MANIFEST_COLLECTION)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn upsert(
        &self,
        collection: &str,
        records: Vec<EmbeddingRecord>,
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let points = records
            .into_iter()
            .map(|record| {
                let payload = record_payload(&record)?;
                Ok(PointStruct::new(point_id(&record.id), record.vector, payload))
            })
            .collect::<Result<Vec<_>, VectorStoreError>>()?;

        let upsert = UpsertPointsBuilder::new(collection, points).wait(true);

        self.client
            .upsert_points(upsert)
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<QueryHit>, VectorStoreError> {
        let search = SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64)
            .with_payload(true);

        let results = self
            .client
            .search_points(search)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        results
            .result
            .into_iter()
            .map(|point| {
                Ok(QueryHit {
                    id: string_field(&point.payload, "doc_id").unwrap_or_default(),
                    distance: 1.0 - point.score,
                    text: string_field(&point.payload, "text").unwrap_or_default(),
                    source: string_field(&point.payload, "source").unwrap_or_default(),
                    metadata: payload_metadata(&point.payload)?,
                })
            })
            .collect()
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, VectorStoreError> {
        let mut ids = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut scroll_builder = ScrollPointsBuilder::new(collection)
                .limit(SCROLL_PAGE)
                .with_payload(PayloadIncludeSelector {
                    fields: vec!["doc_id".to_string()],
                })
                .with_vectors(false);

            if let Some(off) = offset {
                scroll_builder = scroll_builder.offset(off);
            }

            let response = self
                .client
                .scroll(scroll_builder)
                .await
                .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

            ids.extend(
                response
                    .result
                    .iter()
                    .filter_map(|p| string_field(&p.payload, "doc_id")),
            );

            offset = response.next_page_offset;
            if offset.is_none() {
                break;
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn fetch(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<EmbeddingRecord>, VectorStoreError> {
        let mut by_id: HashMap<String, EmbeddingRecord> = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(FETCH_CHUNK) {
            let point_ids: Vec<PointId> = chunk.iter().map(|id| point_id(id)).collect();
            let response = self
                .client
                .get_points(
                    GetPointsBuilder::new(collection, point_ids)
                        .with_payload(true)
                        .with_vectors(true),
                )
                .await
                .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

            for point in response.result {
                let Some(id) = string_field(&point.payload, "doc_id") else {
                    continue;
                };
                let record = EmbeddingRecord {
                    vector: extract_vector(&point.vectors).unwrap_or_default(),
                    text: string_field(&point.payload, "text").unwrap_or_default(),
                    source: string_field(&point.payload, "source").unwrap_or_default(),
                    metadata: payload_metadata(&point.payload)?,
                    id: id.clone(),
                };
                by_id.insert(id, record);
            }
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn put_manifest(&self, manifest: &CollectionManifest) -> Result<(), VectorStoreError> {
        self.ensure_manifest_collection().await?;

        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("collection".to_string(), manifest.collection.clone().into());
        payload.insert(
            "manifest".to_string(),
            serde_json::to_string(manifest)?.into(),
        );
        let point = PointStruct::new(point_id(&manifest.collection), vec![0.0f32], payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(MANIFEST_COLLECTION, vec![point]).wait(true))
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;
        Ok(())
    }

    async fn get_manifest(
        &self,
        collection: &str,
    ) -> Result<Option<CollectionManifest>, VectorStoreError> {
        let exists = self
            .client
            .collection_exists(MANIFEST_COLLECTION)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        if !exists {
            return Ok(None);
        }

        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(MANIFEST_COLLECTION, vec![point_id(collection)])
                    .with_payload(true)
                    .with_vectors(false),
            )
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        response
            .result
            .first()
            .and_then(|p| string_field(&p.payload, "manifest"))
            .map(|json| serde_json::from_str(&json).map_err(VectorStoreError::from))
            .transpose()
    }

    async fn set_alias(
        &self,
        alias: &str,
        collection: &str,
    ) -> Result<Option<String>, VectorStoreError> {
        let previous = self.resolve_alias(alias).await?;
        if previous.as_deref() == Some(collection) {
            return Ok(None);
        }

        self.change_aliases(repoint_alias(alias, collection, previous.is_some()))
            .await?;
        Ok(previous)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, VectorStoreError> {
        Ok(self
            .list_aliases()
            .await?
            .into_iter()
            .find(|(a, _)| a == alias)
            .map(|(_, c)| c))
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), VectorStoreError> {
        self.client
            .delete_alias(alias)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<(String, String)>, VectorStoreError> {
        let response = self
            .client
            .list_aliases()
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        let mut aliases: Vec<(String, String)> = response
            .aliases
            .into_iter()
            .map(|a| (a.alias_name, a.collection_name))
            .collect();
        aliases.sort();
        Ok(aliases)
    }

    fn location(&self) -> String {
        self.url.clone()
    }
}

/// Alias actions that point `alias` at `collection`, dropping the old
/// binding in the same request when one exists.
fn repoint_alias(alias: &str, collection: &str, replace: bool) -> ChangeAliases {
    let mut actions = Vec::with_capacity(2);
    if replace {
        actions.push(AliasOperations {
            action: Some(alias_operations::Action::DeleteAlias(DeleteAlias {
                alias_name: alias.to_string(),
            })),
        });
    }
    actions.push(AliasOperations {
        action: Some(alias_operations::Action::CreateAlias(CreateAlias {
            collection_name: collection.to_string(),
            alias_name: alias.to_string(),
        })),
    });
    ChangeAliases {
        actions,
        timeout: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_stable_uuid() {
        let a = point_id("doc-1");
        let b = point_id("doc-1");
        assert_eq!(a, b);
        assert_ne!(a, point_id("doc-2"));
        match a.point_id_options {
            Some(qdrant::point_id::PointIdOptions::Uuid(s)) => {
                assert!(Uuid::parse_str(&s).is_ok());
            }
            other => panic!("expected uuid point id, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let mut metadata = Metadata::new();
        metadata.insert("page".into(), crate::models::MetadataValue::Int(3));
        let record = EmbeddingRecord {
            id: "a".into(),
            vector: vec![1.0],
            text: "hello".into(),
            source: "s".into(),
            metadata: metadata.clone(),
        };
        let payload = record_payload(&record).unwrap();
        assert_eq!(string_field(&payload, "doc_id").as_deref(), Some("a"));
        assert_eq!(payload_metadata(&payload).unwrap(), metadata);
    }

    #[test]
    fn test_backend_creation() {
        let config = VectorStoreConfig {
            url: "http://localhost:6334".to_string(),
            ..Default::default()
        };
        let backend = QdrantBackend::new(&config).unwrap();
        assert_eq!(backend.location(), "http://localhost:6334");
    }

    #[test]
    fn test_repoint_replaces_alias_in_one_request() {
        let change = repoint_alias("docs", "docs__2", true);
        let actions: Vec<_> = change
            .actions
            .into_iter()
            .map(|op| op.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                Some(alias_operations::Action::DeleteAlias(DeleteAlias {
                    alias_name: "docs".into(),
                })),
                Some(alias_operations::Action::CreateAlias(CreateAlias {
                    collection_name: "docs__2".into(),
                    alias_name: "docs".into(),
                })),
            ]
        );

        let first = repoint_alias("docs", "docs__1", false);
        assert_eq!(first.actions.len(), 1);
        assert!(matches!(
            first.actions[0].action,
            Some(alias_operations::Action::CreateAlias(_))
        ));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("Collection `x` doesn't exist!"));
        assert!(is_not_found("Not found: Collection"));
        assert!(!is_not_found("connection refused"));
    }
}
