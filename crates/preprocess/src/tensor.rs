use crate::{Frame, PixelFormat, PreprocessError};
use common::span;
use half::f16;
use ndarray::{Array, ArrayD, IxDyn};

/// Floating-point width of the network input, fixed per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    /// 32-bit float.
    Full,
    /// 16-bit float.
    Half,
}

/// An NCHW tensor in the precision the backend expects.
#[derive(Debug, Clone, PartialEq)]
pub enum InputTensor {
    F32(ArrayD<f32>),
    F16(ArrayD<f16>),
}

impl InputTensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            InputTensor::F32(a) => a.shape(),
            InputTensor::F16(a) => a.shape(),
        }
    }

    pub fn precision(&self) -> PrecisionMode {
        match self {
            InputTensor::F32(_) => PrecisionMode::Full,
            InputTensor::F16(_) => PrecisionMode::Half,
        }
    }

    /// Zero tensor of the given shape, used for warmup passes.
    pub fn zeros(shape: &[usize], precision: PrecisionMode) -> Self {
        match precision {
            PrecisionMode::Full => InputTensor::F32(ArrayD::zeros(IxDyn(shape))),
            PrecisionMode::Half => InputTensor::F16(ArrayD::from_elem(IxDyn(shape), f16::ZERO)),
        }
    }

    /// Lossy downcast to half precision. Half tensors are returned as-is.
    pub fn into_half(self) -> Self {
        match self {
            InputTensor::F32(a) => InputTensor::F16(a.mapv(f16::from_f32)),
            half @ InputTensor::F16(_) => half,
        }
    }

    /// Prepend a batch axis to a CHW tensor; NCHW tensors are returned as-is.
    pub fn with_batch_axis(self) -> Self {
        match self {
            InputTensor::F32(a) if a.ndim() == 3 => InputTensor::F32(a.insert_axis(ndarray::Axis(0))),
            InputTensor::F16(a) if a.ndim() == 3 => InputTensor::F16(a.insert_axis(ndarray::Axis(0))),
            other => other,
        }
    }

    /// Little-endian bytes in standard (row-major) order, the layout engine
    /// buffers are filled with.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            InputTensor::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            InputTensor::F16(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// HWC u8 frame -> `[1, 3, H, W]` tensor in RGB order scaled to `[0, 1]`.
pub fn to_tensor(frame: &Frame, precision: PrecisionMode) -> Result<InputTensor, PreprocessError> {
    let _s = span!("to_tensor");

    let (width, height) = (frame.width() as usize, frame.height() as usize);
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage {
            width: frame.width(),
            height: frame.height(),
        });
    }
    if frame.pixels().len() != frame.expected_len() {
        return Err(PreprocessError::BufferSizeMismatch {
            width: frame.width(),
            height: frame.height(),
            expected: frame.expected_len(),
            actual: frame.pixels().len(),
        });
    }

    // source channel feeding each of the R, G, B planes
    let order: [usize; 3] = match frame.format() {
        PixelFormat::Rgb => [0, 1, 2],
        PixelFormat::Bgr => [2, 1, 0],
    };

    let spatial = width * height;
    let mut output = vec![0.0f32; 3 * spatial];

    for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
        output[i] = px[order[0]] as f32 / 255.0;
        output[i + spatial] = px[order[1]] as f32 / 255.0;
        output[i + 2 * spatial] = px[order[2]] as f32 / 255.0;
    }

    let chw = InputTensor::F32(Array::from_shape_vec(IxDyn(&[3, height, width]), output)?);

    Ok(match precision {
        PrecisionMode::Full => chw.with_batch_axis(),
        PrecisionMode::Half => chw.with_batch_axis().into_half(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_layout_and_range() {
        let pixels = vec![
            255, 0, 0, // Red pixel
            0, 255, 0, // Green pixel
            0, 0, 255, // Blue pixel
            255, 255, 255, // White pixel
        ];
        let frame = Frame::new(pixels, 2, 2, PixelFormat::Rgb);

        let tensor = to_tensor(&frame, PrecisionMode::Full).unwrap();
        let InputTensor::F32(t) = tensor else {
            panic!("expected f32 tensor");
        };

        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert_eq!(t[[0, 1, 0, 0]], 0.0);
        assert_eq!(t[[0, 1, 0, 1]], 1.0);
        assert_eq!(t[[0, 2, 1, 0]], 1.0);
        assert!(t.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_bgr_is_reordered_to_rgb() {
        let frame = Frame::new(vec![10, 20, 30], 1, 1, PixelFormat::Bgr);

        let InputTensor::F32(t) = to_tensor(&frame, PrecisionMode::Full).unwrap() else {
            panic!("expected f32 tensor");
        };

        assert_eq!(t[[0, 0, 0, 0]], 30.0 / 255.0);
        assert_eq!(t[[0, 1, 0, 0]], 20.0 / 255.0);
        assert_eq!(t[[0, 2, 0, 0]], 10.0 / 255.0);
    }

    #[test]
    fn test_mid_gray_in_half_precision() {
        let frame = Frame::filled(4, 4, PixelFormat::Rgb, [128, 128, 128]);

        let tensor = to_tensor(&frame, PrecisionMode::Half).unwrap();
        assert_eq!(tensor.precision(), PrecisionMode::Half);
        assert_eq!(tensor.to_le_bytes().len(), 3 * 16 * 2);

        let InputTensor::F16(t) = tensor else {
            panic!("expected f16 tensor");
        };
        // 128/255 = 0.50196, f16 resolution around 0.5 is ~0.0005
        assert!((t[[0, 1, 2, 2]].to_f32() - 0.502).abs() < 1e-3);
    }

    #[test]
    fn test_batch_axis_inserted_only_when_missing() {
        let chw = InputTensor::F32(ArrayD::zeros(IxDyn(&[3, 8, 8])));
        assert_eq!(chw.with_batch_axis().shape(), &[1, 3, 8, 8]);

        let nchw = InputTensor::zeros(&[1, 3, 8, 8], PrecisionMode::Half);
        assert_eq!(nchw.with_batch_axis().shape(), &[1, 3, 8, 8]);
    }
}
