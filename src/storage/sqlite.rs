//! SQLite embedding store

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::config::{EmbeddingEncoding, IdentityScheme};
use crate::error::PipelineError;

use super::traits::{
    decode_embedding, encode_embedding, EmbeddingRecord, EmbeddingStore, IdentityEntry,
};

/// SQLite-backed embedding store.
///
/// Each call acquires a pooled connection for its own duration; no
/// transaction spans requests.
pub struct SqliteStore {
    pool: SqlitePool,
    encoding: EmbeddingEncoding,
    scheme: IdentityScheme,
}

impl SqliteStore {
    pub async fn new(
        db_path: &Path,
        encoding: EmbeddingEncoding,
        scheme: IdentityScheme,
    ) -> Result<Self, PipelineError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::Persistence(e.into()))?;
            }
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to SQLite database")
            .map_err(PipelineError::Persistence)?;

        let store = Self {
            pool,
            encoding,
            scheme,
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS persons (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id INTEGER NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

        // The identity scheme decides whether a key may recur.
        let index_sql = match self.scheme {
            IdentityScheme::PerFace => {
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_embeddings_identity
                 ON embeddings(identity_id)"
            }
            IdentityScheme::PerPerson => {
                "CREATE INDEX IF NOT EXISTS idx_embeddings_identity
                 ON embeddings(identity_id)"
            }
        };
        sqlx::query(index_sql)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.into()))?;

        info!("SQLite embedding store initialized ({:?} scheme)", self.scheme);
        Ok(())
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn register(
        &self,
        identity: i64,
        embedding: &[f32],
    ) -> Result<EmbeddingRecord, PipelineError> {
        let payload = encode_embedding(embedding, self.encoding);
        let created_at = Self::now_unix();

        let result = sqlx::query(
            r#"
            INSERT INTO embeddings (identity_id, payload, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(identity)
        .bind(&payload)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(PipelineError::DuplicateIdentity(identity));
            }
            Err(e) => return Err(PipelineError::Persistence(e.into())),
        };

        let record_id = result.last_insert_rowid();
        debug!("Registered embedding {} for identity {}", record_id, identity);

        Ok(EmbeddingRecord {
            record_id,
            identity,
            embedding: embedding.to_vec(),
            created_at,
        })
    }

    async fn get_record(&self, record_id: i64) -> Result<Option<EmbeddingRecord>, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT id, identity_id, payload, created_at
            FROM embeddings
            WHERE id = ?
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

        match row {
            Some(row) => {
                let payload: Vec<u8> = row.get("payload");
                Ok(Some(EmbeddingRecord {
                    record_id: row.get("id"),
                    identity: row.get("identity_id"),
                    embedding: decode_embedding(&payload, self.encoding)?,
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_identities(&self) -> Result<Vec<IdentityEntry>, PipelineError> {
        let rows = sqlx::query("SELECT id, name FROM persons ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| IdentityEntry {
                id: row.get("id"),
                name: row.get("name"),
            })
            .collect())
    }

    async fn upsert_person(&self, id: i64, name: &str) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO persons (id, name)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.into()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store(scheme: IdentityScheme, encoding: EmbeddingEncoding) -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::new(&path, encoding, scheme).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn binary_register_round_trips_exactly() {
        let (store, _dir) = store(IdentityScheme::PerFace, EmbeddingEncoding::Binary).await;

        let embedding = vec![0.25f32, -0.5, 0.125, 1.0];
        let record = store.register(42, &embedding).await.unwrap();
        assert_eq!(record.identity, 42);

        let fetched = store.get_record(record.record_id).await.unwrap().unwrap();
        assert_eq!(fetched.embedding, embedding);
        assert_eq!(fetched.created_at, record.created_at);
    }

    #[tokio::test]
    async fn json_register_round_trips_within_epsilon() {
        let (store, _dir) = store(IdentityScheme::PerPerson, EmbeddingEncoding::Json).await;

        let embedding = vec![0.1f32, 0.2, 0.3];
        let record = store.register(7, &embedding).await.unwrap();
        let fetched = store.get_record(record.record_id).await.unwrap().unwrap();
        for (a, b) in embedding.iter().zip(&fetched.embedding) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn per_face_scheme_rejects_second_registration() {
        let (store, _dir) = store(IdentityScheme::PerFace, EmbeddingEncoding::Binary).await;

        store.register(5, &[1.0, 0.0]).await.unwrap();
        let err = store.register(5, &[0.0, 1.0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateIdentity(5)));

        // The first record is untouched.
        let first = store.get_record(1).await.unwrap().unwrap();
        assert_eq!(first.embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn per_person_scheme_appends() {
        let (store, _dir) = store(IdentityScheme::PerPerson, EmbeddingEncoding::Binary).await;

        let a = store.register(9, &[1.0]).await.unwrap();
        let b = store.register(9, &[2.0]).await.unwrap();
        assert_ne!(a.record_id, b.record_id);
    }

    #[tokio::test]
    async fn identity_catalog_lists_in_id_order() {
        let (store, _dir) = store(IdentityScheme::PerPerson, EmbeddingEncoding::Binary).await;

        store.upsert_person(2, "Beata").await.unwrap();
        store.upsert_person(1, "Anton").await.unwrap();
        store.upsert_person(2, "Beata K").await.unwrap();

        let identities = store.list_identities().await.unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].id, 1);
        assert_eq!(identities[1].name, "Beata K");
    }
}
