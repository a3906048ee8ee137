//! Service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    /// Gender/age network. Optional capability: a load failure is logged
    /// and the attributes field stays absent for every request.
    pub attributes: Option<PathBuf>,
    /// Emotion network, best-effort like `attributes`.
    pub emotion: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub embedding_dim: usize,
}

/// How registered embeddings relate to identity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScheme {
    /// At most one embedding per face id; re-registration is a conflict.
    PerFace,
    /// A person id may accumulate many embeddings.
    PerPerson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingEncoding {
    /// Raw little-endian f32 bytes.
    Binary,
    /// JSON numeric array text.
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
    pub encoding: EmbeddingEncoding,
    pub identity_scheme: IdentityScheme,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { port: 3000 },
            inference: InferenceConfig {
                device: "CPU".to_string(),
                confidence_threshold: 0.5,
            },
            models: ModelsConfig {
                detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
                recognizer: PathBuf::from("models/glint360k_r100.onnx"),
                attributes: Some(PathBuf::from("models/genderage.onnx")),
                emotion: Some(PathBuf::from("models/emotion_ferplus.onnx")),
            },
            pipeline: PipelineConfig { embedding_dim: 512 },
            storage: StorageConfig {
                sqlite_path: PathBuf::from("data/embeddings.db"),
                encoding: EmbeddingEncoding::Binary,
                identity_scheme: IdentityScheme::PerFace,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_scheme_and_encoding() {
        let raw = r#"
            [server]
            port = 8080

            [inference]
            device = "CPU"
            confidence_threshold = 0.6

            [models]
            detector = "m/det.onnx"
            recognizer = "m/rec.onnx"

            [pipeline]
            embedding_dim = 512

            [storage]
            sqlite_path = "data/test.db"
            encoding = "json"
            identity_scheme = "per_person"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.models.attributes.is_none());
        assert_eq!(config.storage.encoding, EmbeddingEncoding::Json);
        assert_eq!(config.storage.identity_scheme, IdentityScheme::PerPerson);
    }
}
