//! Model provider registry
//!
//! Capability providers are bound once at startup and shared immutably for
//! the life of the process. The pipeline only ever sees these traits; which
//! network weights and execution backend sit behind them is wiring in
//! `main`, not something a request can re-discover.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;

use crate::error::PipelineError;
use crate::service::types::{Emotion, FaceAttributes};

use super::preprocess::NormalizedFace;

/// One detected face, in the coordinate space of the image the detector saw.
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Locates faces in a full frame.
pub trait Detect: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// Maps a normalized face crop to an identity embedding vector.
pub trait Embed: Send + Sync {
    fn embed(&self, face: &NormalizedFace) -> Result<Vec<f32>>;

    /// Output dimensionality this provider was built for.
    fn embedding_dim(&self) -> usize;
}

/// Infers demographic/pose attributes from a face crop.
pub trait ExtractAttributes: Send + Sync {
    fn attributes(&self, face: &DynamicImage) -> Result<FaceAttributes>;
}

/// Classifies the dominant emotion of a face crop, with the full score map.
pub trait ClassifyEmotion: Send + Sync {
    fn classify(&self, face: &DynamicImage) -> Result<(Emotion, BTreeMap<Emotion, f32>)>;
}

/// Capability names, used for startup logs and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Detector,
    Recognizer,
    Attributes,
    Emotion,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Detector => "detector",
            Capability::Recognizer => "recognizer",
            Capability::Attributes => "attributes",
            Capability::Emotion => "emotion",
        }
    }
}

/// The process-wide set of bound capability providers.
///
/// Detector and recognizer are required; attribute and emotion providers are
/// best-effort and may be absent for the whole deployment.
pub struct ProviderRegistry {
    detector: Arc<dyn Detect>,
    recognizer: Arc<dyn Embed>,
    attributes: Option<Arc<dyn ExtractAttributes>>,
    emotion: Option<Arc<dyn ClassifyEmotion>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("attributes", &self.attributes.is_some())
            .field("emotion", &self.emotion.is_some())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn detector(&self) -> &dyn Detect {
        self.detector.as_ref()
    }

    pub fn recognizer(&self) -> &dyn Embed {
        self.recognizer.as_ref()
    }

    pub fn attributes(&self) -> Option<&dyn ExtractAttributes> {
        self.attributes.as_deref()
    }

    pub fn emotion(&self) -> Option<&dyn ClassifyEmotion> {
        self.emotion.as_deref()
    }

    /// Which capabilities this deployment has bound.
    pub fn capabilities(&self) -> Vec<(Capability, bool)> {
        vec![
            (Capability::Detector, true),
            (Capability::Recognizer, true),
            (Capability::Attributes, self.attributes.is_some()),
            (Capability::Emotion, self.emotion.is_some()),
        ]
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    detector: Option<Arc<dyn Detect>>,
    recognizer: Option<Arc<dyn Embed>>,
    attributes: Option<Arc<dyn ExtractAttributes>>,
    emotion: Option<Arc<dyn ClassifyEmotion>>,
}

impl ProviderRegistryBuilder {
    pub fn detector(mut self, provider: Arc<dyn Detect>) -> Self {
        self.detector = Some(provider);
        self
    }

    pub fn recognizer(mut self, provider: Arc<dyn Embed>) -> Self {
        self.recognizer = Some(provider);
        self
    }

    pub fn attributes(mut self, provider: Arc<dyn ExtractAttributes>) -> Self {
        self.attributes = Some(provider);
        self
    }

    pub fn emotion(mut self, provider: Arc<dyn ClassifyEmotion>) -> Self {
        self.emotion = Some(provider);
        self
    }

    /// Finalize the registry. Missing required capabilities are fatal here,
    /// at startup, not at first use.
    pub fn build(self) -> Result<ProviderRegistry, PipelineError> {
        let detector = self.detector.ok_or_else(|| {
            PipelineError::model_unavailable(Capability::Detector.as_str(), "not bound")
        })?;
        let recognizer = self.recognizer.ok_or_else(|| {
            PipelineError::model_unavailable(Capability::Recognizer.as_str(), "not bound")
        })?;

        Ok(ProviderRegistry {
            detector,
            recognizer,
            attributes: self.attributes,
            emotion: self.emotion,
        })
    }
}
