use crate::ImageSize;

/// Network input size used when none is configured.
pub const DEFAULT_INPUT_SIZE: ImageSize = ImageSize::square(640);

/// Largest stride of the detection heads; padded images are multiples of it.
pub const DEFAULT_STRIDE: u32 = 32;

/// Border color of the letterbox padding (all three channels).
pub const LETTERBOX_COLOR: u8 = 114;
