//! Embedding store abstraction
//!
//! Registration is append-only: a new record per call, never an update in
//! place. Uniqueness is only what the identity scheme mandates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingEncoding;
use crate::error::PipelineError;

/// A persisted identity/embedding association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Auto-incrementing store-assigned id.
    pub record_id: i64,
    /// The face or person id the embedding is keyed by.
    pub identity: i64,
    pub embedding: Vec<f32>,
    /// Unix seconds.
    pub created_at: i64,
}

/// An entry from the external identity catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub id: i64,
    pub name: String,
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync + 'static {
    /// Append a new embedding record under an identity key.
    ///
    /// In the unique-per-face scheme a second registration for the same key
    /// fails with [`PipelineError::DuplicateIdentity`]; nothing is
    /// overwritten.
    async fn register(
        &self,
        identity: i64,
        embedding: &[f32],
    ) -> Result<EmbeddingRecord, PipelineError>;

    /// Fetch a record by its store-assigned id.
    async fn get_record(&self, record_id: i64) -> Result<Option<EmbeddingRecord>, PipelineError>;

    /// Read the identity catalog, ordered by id.
    async fn list_identities(&self) -> Result<Vec<IdentityEntry>, PipelineError>;

    /// Create or rename a catalog entry.
    async fn upsert_person(&self, id: i64, name: &str) -> Result<(), PipelineError>;
}

/// Serialize an embedding payload in the configured encoding.
pub fn encode_embedding(vector: &[f32], encoding: EmbeddingEncoding) -> Vec<u8> {
    match encoding {
        EmbeddingEncoding::Binary => vector.iter().flat_map(|f| f.to_le_bytes()).collect(),
        EmbeddingEncoding::Json => serde_json::to_vec(vector).expect("f32 slice serializes"),
    }
}

/// Deserialize an embedding payload.
pub fn decode_embedding(
    payload: &[u8],
    encoding: EmbeddingEncoding,
) -> Result<Vec<f32>, PipelineError> {
    match encoding {
        EmbeddingEncoding::Binary => {
            if payload.len() % 4 != 0 {
                return Err(PipelineError::Persistence(anyhow::anyhow!(
                    "binary embedding payload length {} is not a multiple of 4",
                    payload.len()
                )));
            }
            Ok(payload
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
                .collect())
        }
        EmbeddingEncoding::Json => serde_json::from_slice(payload)
            .map_err(|e| PipelineError::Persistence(anyhow::anyhow!("json embedding payload: {e}"))),
    }
}
