pub mod config;
pub mod frame;
pub mod letterbox;
pub mod tensor;

use thiserror::Error;

pub use config::{DEFAULT_INPUT_SIZE, DEFAULT_STRIDE, LETTERBOX_COLOR};
pub use frame::{Frame, ImageSize, PixelFormat};
pub use letterbox::{LetterboxOptions, LetterboxParams, letterbox};
pub use tensor::{InputTensor, PrecisionMode, to_tensor};

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Buffer size mismatch: expected {expected} bytes for {width}x{height}, got {actual}")]
    BufferSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Empty image: {width}x{height}")]
    EmptyImage { width: u32, height: u32 },

    #[error("Invalid letterbox target {target:?} (stride {stride})")]
    InvalidTarget { target: ImageSize, stride: u32 },

    #[error("Resize failed: {0}")]
    Resize(String),

    #[error("Tensor layout error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Letterboxed tensor plus what is needed to map boxes back to the frame.
#[derive(Debug)]
pub struct Preprocessed {
    pub tensor: InputTensor,
    pub params: LetterboxParams,
}

/// Letterbox + tensor conversion for one network input configuration.
///
/// Holds configuration only. Every call allocates its own output, so one
/// preprocessor can be shared by threads working on different frames.
#[derive(Debug, Clone)]
pub struct FramePreprocessor {
    target: ImageSize,
    stride: u32,
    options: LetterboxOptions,
    precision: PrecisionMode,
}

impl FramePreprocessor {
    pub fn new(
        target: ImageSize,
        stride: u32,
        options: LetterboxOptions,
        precision: PrecisionMode,
    ) -> Self {
        Self {
            target,
            stride,
            options,
            precision,
        }
    }

    pub fn target(&self) -> ImageSize {
        self.target
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn options(&self) -> LetterboxOptions {
        self.options
    }

    pub fn preprocess(&self, frame: &Frame) -> Result<Preprocessed, PreprocessError> {
        let _s = common::span!("preprocess_frame");

        tracing::trace!(
            width = frame.width(),
            height = frame.height(),
            format = ?frame.format(),
            "Preprocessing frame"
        );

        let (letterboxed, params) = letterbox(frame, self.target, self.stride, self.options)?;
        let tensor = to_tensor(&letterboxed, self.precision)?;

        Ok(Preprocessed { tensor, params })
    }
}

impl Default for FramePreprocessor {
    fn default() -> Self {
        Self::new(
            DEFAULT_INPUT_SIZE,
            DEFAULT_STRIDE,
            LetterboxOptions::default(),
            PrecisionMode::Full,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_wide_frame_full_precision() {
        let frame = Frame::filled(800, 600, PixelFormat::Rgb, [128, 128, 128]);
        let preprocessor = FramePreprocessor::new(
            ImageSize::square(640),
            32,
            LetterboxOptions {
                auto: false,
                ..LetterboxOptions::default()
            },
            PrecisionMode::Full,
        );

        let out = preprocessor.preprocess(&frame).unwrap();

        assert_eq!(out.tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(out.tensor.precision(), PrecisionMode::Full);
        assert_eq!(out.params.scale, 0.8);
        assert_eq!(out.params.pad_x, 0.0);
        assert_eq!(out.params.pad_y, 80.0);
    }

    #[test]
    fn test_preprocess_half_precision_output() {
        let frame = Frame::filled(64, 64, PixelFormat::Bgr, [0, 0, 255]);
        let preprocessor = FramePreprocessor::new(
            ImageSize::square(64),
            32,
            LetterboxOptions::default(),
            PrecisionMode::Half,
        );

        let out = preprocessor.preprocess(&frame).unwrap();

        assert_eq!(out.tensor.precision(), PrecisionMode::Half);
        match out.tensor {
            InputTensor::F16(t) => {
                // BGR (0,0,255) is red once reordered to RGB
                assert_eq!(t[[0, 0, 10, 10]].to_f32(), 1.0);
                assert_eq!(t[[0, 2, 10, 10]].to_f32(), 0.0);
            }
            InputTensor::F32(_) => panic!("expected half tensor"),
        }
    }

    #[test]
    fn test_preprocess_rejects_malformed_frame() {
        let frame = Frame::new(vec![0u8; 200], 10, 10, PixelFormat::Rgb);
        let err = FramePreprocessor::default().preprocess(&frame).unwrap_err();

        assert!(matches!(err, PreprocessError::BufferSizeMismatch { .. }));
        assert!(err.to_string().contains("mismatch"));
    }
}
