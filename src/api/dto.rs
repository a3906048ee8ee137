//! REST API request/response data transfer objects
//!
//! The pipeline report types serialize directly as response bodies; only the
//! envelopes that have no pipeline counterpart live here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    /// Keyed by capability name; ordered so the JSON is stable across calls.
    pub models_loaded: BTreeMap<String, bool>,
}

/// Person catalog response
#[derive(Debug, Serialize)]
pub struct PersonsResponse {
    pub persons: Vec<PersonDto>,
}

#[derive(Debug, Serialize)]
pub struct PersonDto {
    pub id: i64,
    pub name: String,
}

/// Upsert person request (JSON body)
#[derive(Debug, Deserialize)]
pub struct UpsertPersonRequest {
    pub name: String,
}

/// Upsert person response
#[derive(Debug, Serialize)]
pub struct UpsertPersonResponse {
    pub success: bool,
    pub id: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_model_keys_serialize_in_stable_order() {
        let mut models_loaded = BTreeMap::new();
        models_loaded.insert("recognizer".to_string(), true);
        models_loaded.insert("detector".to_string(), true);
        models_loaded.insert("attributes".to_string(), false);

        let response = HealthResponse {
            healthy: true,
            version: "0.3.0".to_string(),
            models_loaded,
        };

        let json = serde_json::to_string(&response).unwrap();
        // Insertion order above is scrambled; the output is alphabetical.
        assert!(json.contains(r#""attributes":false,"detector":true,"recognizer":true"#));
    }
}
