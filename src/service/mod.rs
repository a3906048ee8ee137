//! Request orchestration on top of the inference engine and the store.

pub mod pipeline;
pub mod types;

pub use pipeline::FacePipeline;
pub use types::{
    AttributeOutcome, CroppedFaceReport, DetectionReport, Emotion, FaceAttributes, FaceReport,
    Gender, Pose, RegisterReport,
};
