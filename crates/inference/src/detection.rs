/// Axis-aligned box in pixel coordinates, corner format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union; 0 when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let iw = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let ih = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = iw * ih;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Strictly positive width and height (false for NaN coordinates).
    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub confidence: f32,
}

/// Where a frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    /// Monotonic submission index.
    pub frame_id: u64,
    /// File path or stream name.
    pub source: String,
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
}

/// Detections for one frame, in post-suppression row order.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
    meta: FrameMeta,
    detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(meta: FrameMeta, detections: Vec<Detection>) -> Self {
        Self { meta, detections }
    }

    pub fn empty(meta: FrameMeta) -> Self {
        Self::new(meta, Vec::new())
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
