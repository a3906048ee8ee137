//! Inference engine module
//!
//! Geometry normalization, the capability provider traits, and the
//! OpenVINO-backed provider implementations.

pub mod attribute;
pub mod detector;
pub mod embedder;
pub mod preprocess;
pub mod registry;
pub mod runtime;

pub use detector::ScrfdDetector;
pub use embedder::ArcFaceRecognizer;
pub use preprocess::NormalizedFace;
pub use registry::{Capability, ProviderRegistry};
pub use runtime::ModelRuntime;
