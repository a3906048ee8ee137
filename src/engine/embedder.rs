//! ArcFace recognizer provider
//!
//! Maps a normalized 112x112 face crop to an L2-normalized identity
//! embedding. The vector length the network actually produced is returned
//! as-is; the pipeline enforces the configured dimensionality.

use anyhow::Result;

use crate::utils::math::l2_normalize;

use super::preprocess::NormalizedFace;
use super::registry::Embed;
use super::runtime::{read_output_f32, set_input, SafeCompiledModel};

pub struct ArcFaceRecognizer {
    model: SafeCompiledModel,
    embedding_dim: usize,
}

impl ArcFaceRecognizer {
    pub fn new(model: SafeCompiledModel, embedding_dim: usize) -> Self {
        Self {
            model,
            embedding_dim,
        }
    }
}

impl Embed for ArcFaceRecognizer {
    fn embed(&self, face: &NormalizedFace) -> Result<Vec<f32>> {
        let input = face.to_bgr_tensor();

        let mut request = self.model.create_infer_request()?;
        set_input(&mut request, &input)?;
        request.infer()?;

        let mut vector = read_output_f32(&request)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
