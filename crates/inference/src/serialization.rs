//! JSON wire format of a published [`DetectionSet`], shaped like a
//! `vision_msgs/Detection2DArray`.

use crate::detection::{Detection, DetectionSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionArrayMessage {
    pub header: Header,
    pub detections: Vec<Detection2D>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub seq: u64,
    /// RFC 3339 capture time.
    pub stamp: String,
    pub frame_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection2D {
    pub bbox: BoundingBox2D,
    pub results: Vec<ObjectHypothesis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox2D {
    pub center: Point2D,
    pub size_x: f32,
    pub size_y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectHypothesis {
    pub class_id: String,
    pub score: f32,
}

impl From<&Detection> for Detection2D {
    fn from(d: &Detection) -> Self {
        let (x, y) = d.bbox.center();
        Self {
            bbox: BoundingBox2D {
                center: Point2D { x, y },
                size_x: d.bbox.width(),
                size_y: d.bbox.height(),
            },
            results: vec![ObjectHypothesis {
                class_id: d.class_id.to_string(),
                score: d.confidence,
            }],
        }
    }
}

impl From<&DetectionSet> for DetectionArrayMessage {
    fn from(set: &DetectionSet) -> Self {
        let meta = set.meta();
        let stamp = DateTime::<Utc>::from_timestamp_nanos(meta.timestamp_ns as i64).to_rfc3339();
        Self {
            header: Header {
                seq: meta.frame_id,
                stamp,
                frame_id: meta.source.clone(),
                width: meta.width,
                height: meta.height,
            },
            detections: set.detections().iter().map(Detection2D::from).collect(),
        }
    }
}

pub fn to_json(set: &DetectionSet) -> serde_json::Result<String> {
    serde_json::to_string(&DetectionArrayMessage::from(set))
}
