//! Pipeline result records
//!
//! One record per face, assembled from whatever the providers produced.
//! A field is either a typed value or absent; no `-1` ages, no `"unknown"`
//! genders. Presentation-layer defaults are the route layer's business.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::registry::FaceBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// Closed emotion label set (FER+ classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Happiness,
    Surprise,
    Sadness,
    Anger,
    Disgust,
    Fear,
    Contempt,
}

impl Emotion {
    /// All labels, in the FER+ model's output index order.
    pub const ALL: [Emotion; 8] = [
        Emotion::Neutral,
        Emotion::Happiness,
        Emotion::Surprise,
        Emotion::Sadness,
        Emotion::Anger,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Contempt,
    ];

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happiness => "happiness",
            Emotion::Surprise => "surprise",
            Emotion::Sadness => "sadness",
            Emotion::Anger => "anger",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Contempt => "contempt",
        }
    }
}

/// Head pose angles in degrees, each independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<f32>,
}

impl Pose {
    pub fn is_empty(&self) -> bool {
        self.yaw.is_none() && self.pitch.is_none() && self.roll.is_none()
    }
}

/// Partial attribute inference output; any subset may be populated.
#[derive(Debug, Clone, Default)]
pub struct FaceAttributes {
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub gender_confidence: Option<f32>,
    pub pose: Pose,
    pub emotion: Option<Emotion>,
    pub emotion_scores: Option<BTreeMap<Emotion, f32>>,
}

/// Bounding box in the coordinate space stated by the surrounding report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBoxReport {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

/// One assembled record per face.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<FaceBoxReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<Emotion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_scores: Option<BTreeMap<Emotion, f32>>,
}

impl FaceReport {
    /// Merge the partial outputs one face produced into a single record.
    pub fn assemble(
        embedding: Option<Vec<f32>>,
        face_box: Option<&FaceBox>,
        attributes: Option<FaceAttributes>,
    ) -> Self {
        let mut report = FaceReport {
            embedding,
            ..Default::default()
        };

        if let Some(fb) = face_box {
            report.bbox = Some(FaceBoxReport {
                x1: fb.x1,
                y1: fb.y1,
                x2: fb.x2,
                y2: fb.y2,
                confidence: fb.confidence,
            });
            report.landmarks = fb.landmarks;
        }

        if let Some(attrs) = attributes {
            report.age = attrs.age;
            report.gender = attrs.gender;
            report.gender_confidence = attrs.gender_confidence;
            report.pose = (!attrs.pose.is_empty()).then_some(attrs.pose);
            report.emotion = attrs.emotion;
            report.emotion_scores = attrs.emotion_scores;
        }

        report
    }
}

/// Full-image mode output.
///
/// Detection ran on the adaptively scaled frame; every coordinate in `faces`
/// lives in that frame, whose dimensions and scale factor are stated here.
/// An empty `faces` list is a normal outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub faces: Vec<FaceReport>,
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub inference_time_ms: u64,
}

/// Outcome of the optional attribute pass in cropped-face mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeOutcome {
    /// The caller did not ask for attributes.
    NotRequested,
    /// Attributes were extracted; see the report fields.
    Extracted,
    /// The crop decoded fine and was embedded, but the attribute pass found
    /// no detectable face in it. Distinct from decode and embedding errors.
    NoFaceInCrop,
}

/// Cropped-face mode output: exactly one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CroppedFaceReport {
    pub face: FaceReport,
    pub attribute_outcome: AttributeOutcome,
    pub inference_time_ms: u64,
}

/// Outcome of registering an embedding under an identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReport {
    pub record_id: i64,
    pub identity: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_dropped_from_json() {
        let report = FaceReport::assemble(Some(vec![0.5; 4]), None, None);
        let json = serde_json::to_value(&report).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("embedding"));
        assert!(!obj.contains_key("age"));
        assert!(!obj.contains_key("gender"));
        assert!(!obj.contains_key("emotion"));
        assert!(!obj.contains_key("bbox"));
    }

    #[test]
    fn assemble_merges_partial_attributes() {
        let attrs = FaceAttributes {
            age: Some(33),
            gender: Some(Gender::Female),
            gender_confidence: Some(0.92),
            ..Default::default()
        };
        let report = FaceReport::assemble(None, None, Some(attrs));
        assert_eq!(report.age, Some(33));
        assert_eq!(report.gender, Some(Gender::Female));
        // Pose was never populated, so the whole group is absent.
        assert!(report.pose.is_none());
        assert!(report.emotion.is_none());
    }

    #[test]
    fn emotion_index_order_matches_ferplus() {
        assert_eq!(Emotion::from_index(0), Some(Emotion::Neutral));
        assert_eq!(Emotion::from_index(1), Some(Emotion::Happiness));
        assert_eq!(Emotion::from_index(7), Some(Emotion::Contempt));
        assert_eq!(Emotion::from_index(8), None);
    }
}
