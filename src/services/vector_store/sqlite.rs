//! Embedded SQLite vector store.
//!
//! Vectors are stored as little-endian `f32` blobs; queries scan the whole
//! collection and rank by cosine distance.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{CollectionInfo, VectorStore, cosine_distance};
use crate::error::VectorStoreError;
use crate::models::{CollectionManifest, EmbeddingRecord, Metadata, QueryHit};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimension INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    vector BLOB NOT NULL,
    text TEXT NOT NULL,
    source TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS manifests (
    collection TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aliases (
    alias TEXT PRIMARY KEY,
    collection TEXT NOT NULL
);
"#;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, VectorStoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, VectorStoreError> {
        self.conn
            .lock()
            .map_err(|_| VectorStoreError::ClientError("connection lock poisoned".to_string()))
    }

    fn dimension_of(conn: &Connection, name: &str) -> Result<Option<usize>, VectorStoreError> {
        Ok(conn
            .query_row(
                "SELECT dimension FROM collections WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|d| d as usize))
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

struct Row {
    id: String,
    vector: Vec<u8>,
    text: String,
    source: String,
    metadata: String,
}

impl Row {
    fn into_record(self) -> Result<EmbeddingRecord, VectorStoreError> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        Ok(EmbeddingRecord {
            id: self.id,
            vector: decode_vector(&self.vector),
            text: self.text,
            source: self.source,
            metadata,
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(Row {
        id: row.get(0)?,
        vector: row.get(1)?,
        text: row.get(2)?,
        source: row.get(3)?,
        metadata: row.get(4)?,
    })
}

#[async_trait]
impl VectorStore for SqliteBackend {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(true)
    }

    async fn collection_info(
        &self,
        name: &str,
    ) -> Result<Option<CollectionInfo>, VectorStoreError> {
        let conn = self.conn()?;
        let Some(dimension) = Self::dimension_of(&conn, name)? else {
            return Ok(None);
        };
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(Some(CollectionInfo {
            name: name.to_string(),
            points_count: count as u64,
            dimension,
        }))
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), VectorStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO collections (name, dimension, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
            params![name, dimension as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records WHERE collection = ?1", params![name])?;
        tx.execute("DELETE FROM manifests WHERE collection = ?1", params![name])?;
        tx.execute("DELETE FROM aliases WHERE collection = ?1", params![name])?;
        tx.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
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

        let mut conn = self.conn()?;
        let dimension = Self::dimension_of(&conn, collection)?
            .ok_or_else(|| VectorStoreError::NotFound(collection.to_string()))?;

        if let Some(bad) = records.iter().find(|r| r.dimensionality() != dimension) {
            return Err(VectorStoreError::UpsertError(format!(
                "record '{}' has dimension {}, collection '{}' expects {}",
                bad.id,
                bad.dimensionality(),
                collection,
                dimension
            )));
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO records (collection, id, vector, text, source, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    vector = excluded.vector,
                    text = excluded.text,
                    source = excluded.source,
                    metadata = excluded.metadata",
            )?;
            for record in &records {
                stmt.execute(params![
                    collection,
                    record.id,
                    encode_vector(&record.vector),
                    record.text,
                    record.source,
                    serde_json::to_string(&record.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<QueryHit>, VectorStoreError> {
        let conn = self.conn()?;
        if Self::dimension_of(&conn, collection)?.is_none() {
            return Err(VectorStoreError::NotFound(collection.to_string()));
        }

        let mut stmt = conn.prepare(
            "SELECT id, vector, text, source, metadata FROM records WHERE collection = ?1",
        )?;
        let rows = stmt
            .query_map(params![collection], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut hits = rows
            .into_iter()
            .map(|row| {
                let record = row.into_record()?;
                Ok(QueryHit {
                    distance: cosine_distance(vector, &record.vector),
                    id: record.id,
                    text: record.text,
                    source: record.source,
                    metadata: record.metadata,
                })
            })
            .collect::<Result<Vec<_>, VectorStoreError>>()?;

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, VectorStoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM records WHERE collection = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    async fn fetch(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<EmbeddingRecord>, VectorStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, vector, text, source, metadata FROM records
             WHERE collection = ?1 AND id = ?2",
        )?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = stmt.query_row(params![collection, id], read_row).optional()? {
                records.push(row.into_record()?);
            }
        }
        Ok(records)
    }

    async fn put_manifest(&self, manifest: &CollectionManifest) -> Result<(), VectorStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO manifests (collection, body) VALUES (?1, ?2)
             ON CONFLICT(collection) DO UPDATE SET body = excluded.body",
            params![manifest.collection, serde_json::to_string(manifest)?],
        )?;
        Ok(())
    }

    async fn get_manifest(
        &self,
        collection: &str,
    ) -> Result<Option<CollectionManifest>, VectorStoreError> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM manifests WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn set_alias(
        &self,
        alias: &str,
        collection: &str,
    ) -> Result<Option<String>, VectorStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT collection FROM aliases WHERE alias = ?1",
                params![alias],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "INSERT INTO aliases (alias, collection) VALUES (?1, ?2)
             ON CONFLICT(alias) DO UPDATE SET collection = excluded.collection",
            params![alias, collection],
        )?;
        tx.commit()?;
        Ok(previous.filter(|p| p != collection))
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, VectorStoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT collection FROM aliases WHERE alias = ?1",
                params![alias],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), VectorStoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM aliases WHERE alias = ?1", params![alias])?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<(String, String)>, VectorStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT alias, collection FROM aliases ORDER BY alias")?;
        let aliases = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
