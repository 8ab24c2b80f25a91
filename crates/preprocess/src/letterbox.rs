use crate::{Frame, ImageSize, LETTERBOX_COLOR, PreprocessError};
use common::span;
use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxOptions {
    /// Pad only up to the next multiple of the stride (minimum rectangle)
    /// instead of the full target.
    pub auto: bool,
    /// Allow enlarging images smaller than the target.
    pub scale_up: bool,
    pub color: [u8; 3],
}

impl Default for LetterboxOptions {
    fn default() -> Self {
        Self {
            auto: true,
            scale_up: true,
            color: [LETTERBOX_COLOR; 3],
        }
    }
}

/// Forward mapping applied by [`letterbox`]: `letterboxed = original * scale + pad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxParams {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub original: ImageSize,
    pub letterboxed: ImageSize,
}

impl LetterboxParams {
    pub fn identity(size: ImageSize) -> Self {
        Self {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            original: size,
            letterboxed: size,
        }
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    pub fn unmap_point(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Aspect-preserving resize into `target`, padded with `options.color`.
///
/// The image is scaled by `min(target.h / h, target.w / w)` (capped at 1 when
/// `scale_up` is off). The leftover is padded either to the full target or,
/// with `auto`, only to the next multiple of `stride`. Padding is split
/// between both sides, the left/top side getting `round(d / 2 - 0.1)`.
///
/// Frames that already have the resized size skip the resampler, so a frame
/// at `target` comes back unchanged with scale 1 and zero padding.
pub fn letterbox(
    frame: &Frame,
    target: ImageSize,
    stride: u32,
    options: LetterboxOptions,
) -> Result<(Frame, LetterboxParams), PreprocessError> {
    let _s = span!("letterbox");

    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage { width, height });
    }
    if frame.pixels().len() != frame.expected_len() {
        return Err(PreprocessError::BufferSizeMismatch {
            width,
            height,
            expected: frame.expected_len(),
            actual: frame.pixels().len(),
        });
    }
    if target.width == 0 || target.height == 0 || stride == 0 {
        return Err(PreprocessError::InvalidTarget { target, stride });
    }

    let mut scale =
        (target.height as f32 / height as f32).min(target.width as f32 / width as f32);
    if !options.scale_up {
        scale = scale.min(1.0);
    }

    let new_width = ((width as f32 * scale).round() as u32).clamp(1, target.width);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, target.height);

    let (mut dw, mut dh) = (target.width - new_width, target.height - new_height);
    if options.auto {
        dw %= stride;
        dh %= stride;
    }

    let (half_w, half_h) = (dw as f32 / 2.0, dh as f32 / 2.0);
    let left = (half_w - 0.1).round().max(0.0) as u32;
    let right = (half_w + 0.1).round().max(0.0) as u32;
    let top = (half_h - 0.1).round().max(0.0) as u32;
    let bottom = (half_h + 0.1).round().max(0.0) as u32;

    let out_width = new_width + left + right;
    let out_height = new_height + top + bottom;

    tracing::trace!(
        scale,
        new_width,
        new_height,
        left,
        top,
        out_width,
        out_height,
        "Letterbox geometry"
    );

    let resized = if (new_width, new_height) == (width, height) {
        None
    } else {
        Some(resize(frame.pixels(), width, height, new_width, new_height)?)
    };
    let resized_data: &[u8] = resized.as_deref().unwrap_or(frame.pixels());

    let params = LetterboxParams {
        scale,
        pad_x: left as f32,
        pad_y: top as f32,
        original: frame.size(),
        letterboxed: ImageSize::new(out_width, out_height),
    };

    if (out_width, out_height) == (new_width, new_height) {
        let out = Frame::new(resized_data.to_vec(), out_width, out_height, frame.format());
        return Ok((out, params));
    }

    let mut padded: Vec<u8> = options
        .color
        .iter()
        .copied()
        .cycle()
        .take(out_width as usize * out_height as usize * 3)
        .collect();

    let row_bytes = (new_width * 3) as usize;
    let stride_bytes = (out_width * 3) as usize;
    for y in 0..new_height as usize {
        let src_row = y * row_bytes;
        let dst_row = (y + top as usize) * stride_bytes + left as usize * 3;
        padded[dst_row..dst_row + row_bytes]
            .copy_from_slice(&resized_data[src_row..src_row + row_bytes]);
    }

    Ok((
        Frame::new(padded, out_width, out_height, frame.format()),
        params,
    ))
}

fn resize(
    pixels: &[u8],
    width: u32,
    height: u32,
    new_width: u32,
    new_height: u32,
) -> Result<Vec<u8>, PreprocessError> {
    let _s = common::span_debug!("resize");

    let src = ImageRef::new(width, height, pixels, PixelType::U8x3)
        .map_err(|e| PreprocessError::Resize(e.to_string()))?;
    let mut dst = Image::new(new_width, new_height, PixelType::U8x3);

    Resizer::new()
        .resize(
            &src,
            &mut dst,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )
        .map_err(|e| PreprocessError::Resize(e.to_string()))?;

    Ok(dst.buffer().to_vec())
}
