use preprocess::{PrecisionMode, PreprocessError};
use thiserror::Error;

/// Failures reported by an [`Engine`](crate::backend::Engine) implementation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to deserialize engine '{path}': {reason}")]
    Deserialize { path: String, reason: String },

    #[error("Unknown tensor '{0}'")]
    UnknownTensor(String),

    #[error("Unsupported element type {dtype} for tensor '{name}'")]
    UnsupportedType { name: String, dtype: String },

    #[error("Shape {shape:?} rejected for tensor '{name}': {reason}")]
    InvalidShape {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },

    #[error("Device allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("Buffer size mismatch: buffer holds {capacity} bytes, transfer is {requested}")]
    TransferSize { capacity: usize, requested: usize },

    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Error taxonomy of the detection pipeline.
///
/// `EngineLoad` and `Config` are fatal at startup. Everything else is local
/// to the frame being processed: the service logs it with the frame id and
/// moves on to the next frame.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Engine load failed: {0}")]
    EngineLoad(String),

    #[error("Shape mismatch for binding '{binding}': engine expects {expected:?}, got {actual:?}")]
    ShapeMismatch {
        binding: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Precision mismatch for binding '{binding}': backend runs {expected:?}, input is {actual:?}")]
    DtypeMismatch {
        binding: String,
        expected: PrecisionMode,
        actual: PrecisionMode,
    },

    #[error("Unknown binding '{0}'")]
    UnknownBinding(String),

    #[error("Device execution failed: {0}")]
    DeviceExecution(#[source] EngineError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Postprocessing failed: {0}")]
    Postprocess(String),
}

impl InferenceError {
    /// Errors that should stop the process instead of skipping a frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InferenceError::EngineLoad(_) | InferenceError::Config(_)
        )
    }

    pub fn is_frame_local(&self) -> bool {
        !self.is_fatal()
    }

    /// Pre/postprocessing failures still produce an (empty) result for the frame.
    pub fn yields_empty_set(&self) -> bool {
        matches!(
            self,
            InferenceError::Preprocess(_) | InferenceError::Postprocess(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::EngineLoad(_) => "engine_load",
            InferenceError::ShapeMismatch { .. } => "shape_mismatch",
            InferenceError::DtypeMismatch { .. } => "dtype_mismatch",
            InferenceError::UnknownBinding(_) => "unknown_binding",
            InferenceError::DeviceExecution(_) => "device_execution",
            InferenceError::Config(_) => "config",
            InferenceError::Preprocess(_) => "preprocess",
            InferenceError::Postprocess(_) => "postprocess",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_names_both_shapes() {
        let err = InferenceError::ShapeMismatch {
            binding: "images".to_string(),
            expected: vec![1, 3, 640, 640],
            actual: vec![1, 3, 480, 640],
        };

        let msg = err.to_string();
        assert!(msg.contains("[1, 3, 640, 640]"), "expected shape missing: {msg}");
        assert!(msg.contains("[1, 3, 480, 640]"), "actual shape missing: {msg}");
    }

    #[test]
    fn test_error_classification() {
        assert!(InferenceError::EngineLoad("corrupt".into()).is_fatal());
        assert!(InferenceError::Config("bad".into()).is_fatal());

        let device = InferenceError::DeviceExecution(EngineError::Execution("xid 79".into()));
        assert!(device.is_frame_local());
        assert!(!device.yields_empty_set());
        assert_eq!(device.kind(), "device_execution");

        let pre = InferenceError::Preprocess(PreprocessError::EmptyImage {
            width: 0,
            height: 0,
        });
        assert!(pre.is_frame_local());
        assert!(pre.yields_empty_set());
    }

    #[test]
    fn test_device_error_keeps_source() {
        use std::error::Error;

        let err = InferenceError::DeviceExecution(EngineError::Execution("stream error".into()));
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "Execution failed: stream error");
    }
}
