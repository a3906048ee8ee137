//! Face extraction pipeline
//!
//! Orchestrates decode, geometry normalization, the capability providers,
//! and result assembly. Each request runs its stages strictly in sequence
//! as one blocking unit of work; any stage failure exits with a typed
//! outcome and no partial record.

use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};

use crate::engine::preprocess::{crop_face, decode_image, scale_for_detection, NormalizedFace};
use crate::engine::registry::ProviderRegistry;
use crate::error::PipelineError;
use crate::storage::{EmbeddingStore, IdentityEntry};

use super::types::{
    AttributeOutcome, CroppedFaceReport, DetectionReport, FaceAttributes, FaceReport,
    RegisterReport,
};

/// Relative margin added around a detected box before the crop is handed to
/// the recognizer and attribute models.
const FACE_CROP_MARGIN: f32 = 0.2;

pub struct FacePipeline<S: EmbeddingStore> {
    registry: Arc<ProviderRegistry>,
    store: Arc<S>,
    embedding_dim: usize,
}

impl<S: EmbeddingStore> FacePipeline<S> {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<S>, embedding_dim: usize) -> Self {
        Self {
            registry,
            store,
            embedding_dim,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Full-image mode: locate zero or more faces, then embed and optionally
    /// enrich each. Zero detections is an explicit empty result.
    ///
    /// All coordinates in the report live in the adaptively scaled frame the
    /// detector saw; the report states that frame's size and scale factor.
    pub async fn extract_full(
        &self,
        image_data: Vec<u8>,
        include_attributes: bool,
    ) -> Result<DetectionReport, PipelineError> {
        let registry = self.registry.clone();
        let embedding_dim = self.embedding_dim;
        let start = Instant::now();

        let report = spawn_pipeline(move || {
            let image = decode_image(&image_data)?;
            let (frame, scale) = scale_for_detection(image);
            let (scaled_width, scaled_height) = frame.dimensions();

            let boxes = registry
                .detector()
                .detect(&frame)
                .map_err(PipelineError::Inference)?;
            debug!("Full-image mode: {} faces at scale {}", boxes.len(), scale);

            let mut faces = Vec::with_capacity(boxes.len());
            for face_box in &boxes {
                let crop = crop_face(
                    &frame,
                    face_box.x1,
                    face_box.y1,
                    face_box.x2,
                    face_box.y2,
                    FACE_CROP_MARGIN,
                );

                let normalized = NormalizedFace::from_image(&crop);
                let vector = registry
                    .recognizer()
                    .embed(&normalized)
                    .map_err(PipelineError::Inference)?;
                let vector = check_dimension(embedding_dim, vector)?;

                let attributes = include_attributes.then(|| enrich(&registry, &crop)).flatten();
                faces.push(FaceReport::assemble(Some(vector), Some(face_box), attributes));
            }

            Ok(DetectionReport {
                faces,
                scale,
                scaled_width,
                scaled_height,
                inference_time_ms: 0,
            })
        })
        .await?;

        Ok(DetectionReport {
            inference_time_ms: start.elapsed().as_millis() as u64,
            ..report
        })
    }

    /// Cropped-face mode: the input is assumed to be one face filling the
    /// frame. Embedding always proceeds once decode succeeded; the optional
    /// attribute pass reports "no face in crop" as its own outcome, never as
    /// a decode or embedding error.
    pub async fn extract_cropped(
        &self,
        image_data: Vec<u8>,
        include_attributes: bool,
    ) -> Result<CroppedFaceReport, PipelineError> {
        let registry = self.registry.clone();
        let embedding_dim = self.embedding_dim;
        let start = Instant::now();

        let mut report = spawn_pipeline(move || {
            let image = decode_image(&image_data)?;
            let normalized = NormalizedFace::from_image(&image);

            let vector = registry
                .recognizer()
                .embed(&normalized)
                .map_err(PipelineError::Inference)?;
            let vector = check_dimension(embedding_dim, vector)?;

            let (attributes, outcome) = if !include_attributes {
                (None, AttributeOutcome::NotRequested)
            } else {
                let present = registry
                    .detector()
                    .detect(&image)
                    .map_err(PipelineError::Inference)?;
                if present.is_empty() {
                    debug!("Attribute pass found no face in the crop");
                    (None, AttributeOutcome::NoFaceInCrop)
                } else {
                    (enrich(&registry, &image), AttributeOutcome::Extracted)
                }
            };

            Ok(CroppedFaceReport {
                face: FaceReport::assemble(Some(vector), None, attributes),
                attribute_outcome: outcome,
                inference_time_ms: 0,
            })
        })
        .await?;

        report.inference_time_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Register the most confident face of an image under an identity key.
    ///
    /// Zero detections is an error here, unlike plain extraction: there is
    /// nothing to associate with the key. A persistence failure discards the
    /// computed embedding; no automatic retry.
    pub async fn register(
        &self,
        image_data: Vec<u8>,
        identity: i64,
    ) -> Result<RegisterReport, PipelineError> {
        let registry = self.registry.clone();
        let embedding_dim = self.embedding_dim;

        let vector = spawn_pipeline(move || {
            let image = decode_image(&image_data)?;
            let (frame, _scale) = scale_for_detection(image);

            let boxes = registry
                .detector()
                .detect(&frame)
                .map_err(PipelineError::Inference)?;
            let best = boxes
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .ok_or(PipelineError::NoFaceDetected)?;
            if boxes.len() > 1 {
                debug!(
                    "Registration image holds {} faces; using the most confident",
                    boxes.len()
                );
            }

            let crop = crop_face(&frame, best.x1, best.y1, best.x2, best.y2, FACE_CROP_MARGIN);
            let normalized = NormalizedFace::from_image(&crop);
            let vector = registry
                .recognizer()
                .embed(&normalized)
                .map_err(PipelineError::Inference)?;
            check_dimension(embedding_dim, vector)
        })
        .await?;

        let record = self.store.register(identity, &vector).await?;
        Ok(RegisterReport {
            record_id: record.record_id,
            identity: record.identity,
            created_at: record.created_at,
        })
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityEntry>, PipelineError> {
        self.store.list_identities().await
    }

    pub async fn upsert_person(&self, id: i64, name: &str) -> Result<(), PipelineError> {
        self.store.upsert_person(id, name).await
    }
}

/// Run a pipeline closure on the blocking thread pool.
async fn spawn_pipeline<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, PipelineError> + Send + 'static,
) -> Result<T, PipelineError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Inference(e.into()))?
}

fn check_dimension(expected: usize, vector: Vec<f32>) -> Result<Vec<f32>, PipelineError> {
    if vector.len() != expected {
        return Err(PipelineError::EmbeddingDimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

/// Best-effort attribute and emotion enrichment of one face crop.
///
/// A missing provider contributes nothing; a failing provider is logged and
/// contributes nothing. Neither aborts the request.
fn enrich(registry: &ProviderRegistry, crop: &DynamicImage) -> Option<FaceAttributes> {
    let mut merged: Option<FaceAttributes> = None;

    if let Some(provider) = registry.attributes() {
        match provider.attributes(crop) {
            Ok(attrs) => merged = Some(attrs),
            Err(e) => warn!("Attribute extraction failed, leaving fields absent: {}", e),
        }
    }

    if let Some(provider) = registry.emotion() {
        match provider.classify(crop) {
            Ok((label, scores)) => {
                let attrs = merged.get_or_insert_with(FaceAttributes::default);
                attrs.emotion = Some(label);
                attrs.emotion_scores = Some(scores);
            }
            Err(e) => warn!("Emotion classification failed, leaving fields absent: {}", e),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};

    use crate::engine::registry::{
        ClassifyEmotion, Detect, Embed, ExtractAttributes, FaceBox,
    };
    use crate::service::types::{Emotion, Gender};
    use crate::storage::traits::{EmbeddingRecord, IdentityEntry};

    const DIM: usize = 8;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([120, 90, 60])));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    struct FixedDetector {
        boxes: Vec<FaceBox>,
        calls: AtomicUsize,
    }

    impl FixedDetector {
        fn with_boxes(boxes: Vec<FaceBox>) -> Arc<Self> {
            Arc::new(Self {
                boxes,
                calls: AtomicUsize::new(0),
            })
        }

        fn none() -> Arc<Self> {
            Self::with_boxes(Vec::new())
        }

        fn one() -> Arc<Self> {
            Self::with_boxes(vec![FaceBox {
                x1: 2.0,
                y1: 2.0,
                x2: 30.0,
                y2: 30.0,
                confidence: 0.95,
                landmarks: None,
            }])
        }
    }

    impl Detect for FixedDetector {
        fn detect(&self, _image: &DynamicImage) -> AnyResult<Vec<FaceBox>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.boxes.clone())
        }
    }

    struct FixedRecognizer {
        dim: usize,
    }

    impl Embed for FixedRecognizer {
        fn embed(&self, _face: &NormalizedFace) -> AnyResult<Vec<f32>> {
            Ok((0..self.dim).map(|i| (i as f32 + 1.0) * 0.1).collect())
        }
        fn embedding_dim(&self) -> usize {
            self.dim
        }
    }

    struct FixedAttributes;

    impl ExtractAttributes for FixedAttributes {
        fn attributes(&self, _face: &DynamicImage) -> AnyResult<FaceAttributes> {
            Ok(FaceAttributes {
                age: Some(29),
                gender: Some(Gender::Male),
                gender_confidence: Some(0.88),
                ..Default::default()
            })
        }
    }

    struct FailingEmotion;

    impl ClassifyEmotion for FailingEmotion {
        fn classify(&self, _face: &DynamicImage) -> AnyResult<(Emotion, BTreeMap<Emotion, f32>)> {
            anyhow::bail!("emotion backend offline")
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<EmbeddingRecord>>,
    }

    #[async_trait]
    impl EmbeddingStore for MemoryStore {
        async fn register(
            &self,
            identity: i64,
            embedding: &[f32],
        ) -> Result<EmbeddingRecord, PipelineError> {
            let mut records = self.records.lock().unwrap();
            if records.iter().any(|r| r.identity == identity) {
                return Err(PipelineError::DuplicateIdentity(identity));
            }
            let record = EmbeddingRecord {
                record_id: records.len() as i64 + 1,
                identity,
                embedding: embedding.to_vec(),
                created_at: 1_700_000_000,
            };
            records.push(record.clone());
            Ok(record)
        }

        async fn get_record(
            &self,
            record_id: i64,
        ) -> Result<Option<EmbeddingRecord>, PipelineError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.record_id == record_id)
                .cloned())
        }

        async fn list_identities(&self) -> Result<Vec<IdentityEntry>, PipelineError> {
            Ok(Vec::new())
        }

        async fn upsert_person(&self, _id: i64, _name: &str) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn pipeline_with(
        detector: Arc<FixedDetector>,
        recognizer_dim: usize,
        emotion_fails: bool,
    ) -> FacePipeline<MemoryStore> {
        let mut builder = ProviderRegistry::builder()
            .detector(detector)
            .recognizer(Arc::new(FixedRecognizer { dim: recognizer_dim }))
            .attributes(Arc::new(FixedAttributes));
        if emotion_fails {
            builder = builder.emotion(Arc::new(FailingEmotion));
        }
        let registry = Arc::new(builder.build().unwrap());
        FacePipeline::new(registry, Arc::new(MemoryStore::default()), DIM)
    }

    #[tokio::test]
    async fn invalid_bytes_stop_before_detection() {
        let detector = FixedDetector::one();
        let pipeline = pipeline_with(detector.clone(), DIM, false);

        let err = pipeline
            .extract_full(b"not an image".to_vec(), true)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidImage(_)));
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_detections_yield_empty_report_not_error() {
        let pipeline = pipeline_with(FixedDetector::none(), DIM, false);

        let report = pipeline.extract_full(png_bytes(300, 200), false).await.unwrap();
        assert!(report.faces.is_empty());
        assert_eq!(report.scale, 1.0);
        assert_eq!((report.scaled_width, report.scaled_height), (300, 200));
    }

    #[tokio::test]
    async fn embedding_is_deterministic_and_sized() {
        let pipeline = pipeline_with(FixedDetector::one(), DIM, false);

        let a = pipeline.extract_cropped(png_bytes(112, 112), false).await.unwrap();
        let b = pipeline.extract_cropped(png_bytes(112, 112), false).await.unwrap();

        let va = a.face.embedding.unwrap();
        let vb = b.face.embedding.unwrap();
        assert_eq!(va.len(), DIM);
        assert_eq!(va, vb);
        assert_eq!(a.attribute_outcome, AttributeOutcome::NotRequested);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_hard_error() {
        let pipeline = pipeline_with(FixedDetector::one(), DIM + 1, false);

        let err = pipeline
            .extract_cropped(png_bytes(112, 112), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmbeddingDimensionMismatch { expected: 8, actual: 9 }
        ));
    }

    #[tokio::test]
    async fn emotion_failure_leaves_other_fields_intact() {
        let pipeline = pipeline_with(FixedDetector::one(), DIM, true);

        let report = pipeline.extract_full(png_bytes(64, 64), true).await.unwrap();
        let face = &report.faces[0];

        assert!(face.embedding.is_some());
        assert_eq!(face.age, Some(29));
        assert_eq!(face.gender, Some(Gender::Male));
        assert!(face.emotion.is_none());
        assert!(face.emotion_scores.is_none());
    }

    #[tokio::test]
    async fn attribute_pass_reports_no_face_in_crop() {
        let pipeline = pipeline_with(FixedDetector::none(), DIM, false);

        let report = pipeline.extract_cropped(png_bytes(112, 112), true).await.unwrap();
        assert_eq!(report.attribute_outcome, AttributeOutcome::NoFaceInCrop);
        // Embedding extraction proceeded regardless.
        assert!(report.face.embedding.is_some());
        assert!(report.face.age.is_none());
    }

    #[tokio::test]
    async fn register_requires_a_face() {
        let pipeline = pipeline_with(FixedDetector::none(), DIM, false);

        let err = pipeline.register(png_bytes(64, 64), 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceDetected));
    }

    #[tokio::test]
    async fn register_persists_the_best_face() {
        let pipeline = pipeline_with(FixedDetector::one(), DIM, false);

        let report = pipeline.register(png_bytes(64, 64), 17).await.unwrap();
        assert_eq!(report.identity, 17);

        let stored = pipeline.store.get_record(report.record_id).await.unwrap().unwrap();
        assert_eq!(stored.embedding.len(), DIM);

        let err = pipeline.register(png_bytes(64, 64), 17).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateIdentity(17)));
    }

    #[tokio::test]
    async fn register_round_trips_through_sqlite() {
        use crate::config::{EmbeddingEncoding, IdentityScheme};
        use crate::storage::SqliteStore;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let store = Arc::new(
            SqliteStore::new(&db_path, EmbeddingEncoding::Binary, IdentityScheme::PerFace)
                .await
                .unwrap(),
        );

        let registry = Arc::new(
            ProviderRegistry::builder()
                .detector(FixedDetector::one())
                .recognizer(Arc::new(FixedRecognizer { dim: DIM }))
                .build()
                .unwrap(),
        );
        let pipeline = FacePipeline::new(registry, store.clone(), DIM);

        let report = pipeline.register(png_bytes(64, 64), 42).await.unwrap();
        let stored = store.get_record(report.record_id).await.unwrap().unwrap();
        assert_eq!(stored.identity, 42);
        assert_eq!(stored.embedding.len(), DIM);

        let err = pipeline.register(png_bytes(64, 64), 42).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateIdentity(42)));
    }
}
