pub mod backend;
pub mod config;
pub mod detection;
pub mod errors;
pub mod logging;
pub mod postprocess;
pub mod publisher;
pub mod serialization;
pub mod service;
pub mod source;

// Re-export commonly used types for convenience
pub use backend::{InferenceBackend, OutputTensor};
pub use config::DetectorConfig;
pub use detection::{BoundingBox, Detection, DetectionSet, FrameMeta};
pub use errors::{EngineError, InferenceError};
pub use postprocess::PostProcessor;
pub use service::{DetectionService, RunSummary};
