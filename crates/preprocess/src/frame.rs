/// Channel order of interleaved 8-bit pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    /// OpenCV-style order, as produced by most camera drivers.
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// An interleaved 3-channel 8-bit image (HWC).
///
/// The buffer length is not checked on construction; preprocessing rejects
/// frames whose buffer does not match `width * height * 3`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            pixels,
            width,
            height,
            format,
        }
    }

    /// A frame of uniform color, `color` given in the frame's own channel order.
    pub fn filled(width: u32, height: u32, format: PixelFormat, color: [u8; 3]) -> Self {
        let pixels = color
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(pixels, width, height, format)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn expected_len(&self) -> usize {
        self.size().area() * 3
    }

    /// Pixel at (x, y) in the frame's channel order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.pixels
            .get(idx..idx + 3)
            .map(|px| [px[0], px[1], px[2]])
    }

    /// Paint an axis-aligned rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x1: u32, y1: u32, x2: u32, y2: u32, color: [u8; 3]) {
        let width = self.width as usize;
        for y in y1.min(self.height)..y2.min(self.height) {
            for x in x1.min(self.width)..x2.min(self.width) {
                let idx = (y as usize * width + x as usize) * 3;
                if let Some(px) = self.pixels.get_mut(idx..idx + 3) {
                    px.copy_from_slice(&color);
                }
            }
        }
    }
}
