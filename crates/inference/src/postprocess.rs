use crate::{
    backend::OutputTensor,
    detection::{BoundingBox, Detection},
    errors::InferenceError,
};
use common::span;
use ndarray::{ArrayView1, ArrayView2, Axis, Ix2};
use preprocess::LetterboxParams;

/// cx, cy, w, h, objectness
const ROW_HEADER: usize = 5;
const MIN_ROW_WIDTH: usize = ROW_HEADER + 1;

/// One decoded output row, in letterboxed input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub class_id: u32,
    /// objectness x best class score
    pub confidence: f32,
}

/// Raw YOLO rows -> detections in original frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessor {
    conf_thres: f32,
    iou_thres: f32,
    max_det: usize,
    agnostic: bool,
    classes: Option<Vec<u32>>,
}

impl PostProcessor {
    pub fn new(conf_thres: f32, iou_thres: f32, max_det: usize) -> Self {
        Self {
            conf_thres,
            iou_thres,
            max_det,
            agnostic: false,
            classes: None,
        }
    }

    /// Suppress across classes instead of within each class.
    pub fn with_agnostic(mut self, agnostic: bool) -> Self {
        self.agnostic = agnostic;
        self
    }

    /// Keep only these class ids. `None` keeps every class.
    pub fn with_classes(mut self, classes: Option<Vec<u32>>) -> Self {
        self.classes = classes;
        self
    }

    /// decode -> class filter -> confidence filter -> NMS -> rescale.
    pub fn process(
        &self,
        outputs: &[OutputTensor],
        params: &LetterboxParams,
    ) -> Result<Vec<Detection>, InferenceError> {
        let _s = span!("postprocess");

        let candidates = decode(outputs)?;
        let decoded = candidates.len();

        let candidates = filter_classes(candidates, self.classes.as_deref());
        let candidates = filter(candidates, self.conf_thres);
        let above_threshold = candidates.len();

        let kept = suppress(&candidates, self.iou_thres, self.agnostic, self.max_det);
        let detections = rescale(&kept, params);

        tracing::trace!(
            decoded,
            above_threshold,
            kept = kept.len(),
            detections = detections.len(),
            "Postprocessed outputs"
        );

        Ok(detections)
    }
}

/// Read candidate rows from every rank-2 `[N, C]` or rank-3 `[1, N, C]`
/// output with at least one class column, concatenated in output order.
pub fn decode(outputs: &[OutputTensor]) -> Result<Vec<Candidate>, InferenceError> {
    let mut candidates = Vec::new();
    let mut used = 0;

    for output in outputs {
        let Some(rows) = rows_view(output)? else {
            tracing::debug!(
                name = %output.name,
                shape = ?output.data.shape(),
                "Output carries no detection rows, ignoring"
            );
            continue;
        };
        used += 1;
        candidates.extend(rows.axis_iter(Axis(0)).map(decode_row));
    }

    if used == 0 {
        return Err(InferenceError::Postprocess(format!(
            "no output with detection rows among {:?}",
            outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
        )));
    }
    Ok(candidates)
}

fn rows_view(output: &OutputTensor) -> Result<Option<ArrayView2<'_, f32>>, InferenceError> {
    let shape = output.data.shape();
    let view = match shape.len() {
        2 => output.data.view(),
        3 if shape[0] > 0 => output.data.index_axis(Axis(0), 0),
        _ => return Ok(None),
    };
    if view.shape()[1] < MIN_ROW_WIDTH {
        return Ok(None);
    }
    view.into_dimensionality::<Ix2>()
        .map(Some)
        .map_err(|e| InferenceError::Postprocess(format!("{}: {e}", output.name)))
}

fn decode_row(row: ArrayView1<'_, f32>) -> Candidate {
    let mut class_id = 0usize;
    let mut best = f32::NEG_INFINITY;
    // first index wins on ties
    for (i, &score) in row.iter().skip(ROW_HEADER).enumerate() {
        if score > best {
            best = score;
            class_id = i;
        }
    }

    let confidence = row[4] * best;
    Candidate {
        bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
        class_id: class_id as u32,
        confidence: if confidence > 1.0 { 1.0 } else { confidence },
    }
}

pub fn filter_classes(candidates: Vec<Candidate>, classes: Option<&[u32]>) -> Vec<Candidate> {
    match classes {
        Some(allowed) => candidates
            .into_iter()
            .filter(|c| allowed.contains(&c.class_id))
            .collect(),
        None => candidates,
    }
}

/// Drop candidates below `conf_thres` (and NaN confidences).
pub fn filter(candidates: Vec<Candidate>, conf_thres: f32) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.confidence >= conf_thres)
        .collect()
}

/// Greedy NMS by descending confidence, ties broken by row order.
///
/// A candidate is dropped when it overlaps an already kept candidate of the
/// same class (any class when `agnostic`) with IoU >= `iou_thres`. At most
/// `max_det` candidates are kept, returned in their original row order.
pub fn suppress(
    candidates: &[Candidate],
    iou_thres: f32,
    agnostic: bool,
    max_det: usize,
) -> Vec<Candidate> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    // stable sort keeps row order among equal confidences
    order.sort_by(|&a, &b| {
        candidates[b]
            .confidence
            .total_cmp(&candidates[a].confidence)
    });

    let mut kept: Vec<usize> = Vec::with_capacity(max_det.min(candidates.len()));
    for i in order {
        if kept.len() >= max_det {
            break;
        }
        let candidate = &candidates[i];
        let duplicate = kept.iter().any(|&k| {
            let other = &candidates[k];
            (agnostic || other.class_id == candidate.class_id)
                && other.bbox.iou(&candidate.bbox) >= iou_thres
        });
        if !duplicate {
            kept.push(i);
        }
    }

    kept.sort_unstable();
    kept.into_iter().map(|i| candidates[i]).collect()
}

/// Undo the letterbox, clamp to the original frame, and drop boxes that
/// collapse to zero width or height.
///
/// Corners are box edges, not pixel indices, so the clamp range is the
/// closed `[0, width] x [0, height]`: a box touching the right or bottom
/// border ends exactly at `width` / `height`.
pub fn rescale(candidates: &[Candidate], params: &LetterboxParams) -> Vec<Detection> {
    let width = params.original.width as f32;
    let height = params.original.height as f32;

    candidates
        .iter()
        .filter_map(|c| {
            let (x1, y1) = params.unmap_point(c.bbox.x1, c.bbox.y1);
            let (x2, y2) = params.unmap_point(c.bbox.x2, c.bbox.y2);
            let bbox = BoundingBox::new(
                x1.clamp(0.0, width),
                y1.clamp(0.0, height),
                x2.clamp(0.0, width),
                y2.clamp(0.0, height),
            );
            bbox.is_valid().then_some(Detection {
                bbox,
                class_id: c.class_id,
                confidence: c.confidence,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, ArrayD, IxDyn};
    use preprocess::ImageSize;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, class_id: u32, confidence: f32) -> Candidate {
        Candidate {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id,
            confidence,
        }
    }

    fn output(name: &str, shape: &[usize], rows: &[Vec<f32>]) -> OutputTensor {
        let width = *shape.last().unwrap();
        let mut data = ArrayD::zeros(IxDyn(shape));
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate().take(width) {
                let mut index = vec![0; shape.len()];
                index[shape.len() - 2] = i;
                index[shape.len() - 1] = j;
                data[IxDyn(&index)] = *v;
            }
        }
        OutputTensor {
            name: name.to_string(),
            data,
        }
    }

    #[test]
    fn test_decode_row_layout() {
        let out = output(
            "output0",
            &[1, 2, 8],
            &[vec![50.0, 60.0, 20.0, 10.0, 0.8, 0.1, 0.5, 0.2]],
        );

        let candidates = decode(&[out]).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].bbox, BoundingBox::new(40.0, 55.0, 60.0, 65.0));
        assert_eq!(candidates[0].class_id, 1);
        assert!((candidates[0].confidence - 0.4).abs() < 1e-6);
        assert_eq!(candidates[1].confidence, 0.0);
    }

    #[test]
    fn test_argmax_tie_picks_first_class() {
        let out = output("o", &[1, 7], &[vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.5, 0.5]]);
        assert_eq!(decode(&[out]).unwrap()[0].class_id, 0);
    }

    #[test]
    fn test_narrow_and_odd_rank_outputs_are_ignored() {
        let rows = output("rows", &[3, 6], &[vec![5.0, 5.0, 2.0, 2.0, 1.0, 1.0]]);
        let narrow = output("aux", &[1, 4, 5], &[]);
        let flat = OutputTensor {
            name: "flat".to_string(),
            data: Array::zeros(IxDyn(&[12])),
        };

        let candidates = decode(&[narrow, rows, flat]).unwrap();
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_decode_without_row_outputs_fails() {
        let narrow = output("aux", &[1, 4, 5], &[]);
        assert!(matches!(
            decode(&[narrow]),
            Err(InferenceError::Postprocess(_))
        ));
    }

    #[test]
    fn test_filter_keeps_threshold_and_drops_nan() {
        let candidates = vec![
            candidate(0.0, 0.0, 1.0, 1.0, 0, 0.25),
            candidate(0.0, 0.0, 1.0, 1.0, 0, 0.2499),
            candidate(0.0, 0.0, 1.0, 1.0, 0, f32::NAN),
            candidate(0.0, 0.0, 1.0, 1.0, 0, 0.9),
        ];

        let kept = filter(candidates, 0.25);
        let confidences: Vec<_> = kept.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.25, 0.9]);
    }

    #[test]
    fn test_class_filter() {
        let candidates = vec![
            candidate(0.0, 0.0, 1.0, 1.0, 0, 0.9),
            candidate(0.0, 0.0, 1.0, 1.0, 2, 0.9),
        ];

        assert_eq!(filter_classes(candidates.clone(), None).len(), 2);
        let kept = filter_classes(candidates, Some(&[2]));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_id, 2);
    }

    #[test]
    fn test_suppress_removes_same_class_duplicates_only() {
        let candidates = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0, 0.6),
            candidate(0.0, 0.0, 100.0, 95.0, 0, 0.9),
            candidate(0.0, 0.0, 100.0, 100.0, 1, 0.5),
        ];

        let kept = suppress(&candidates, 0.45, false, 100);
        // row order preserved: the 0.9 box (row 1) then the class-1 box (row 2)
        assert_eq!(kept, vec![candidates[1], candidates[2]]);

        let agnostic = suppress(&candidates, 0.45, true, 100);
        assert_eq!(agnostic, vec![candidates[1]]);
    }

    #[test]
    fn test_suppress_confidence_ties_break_by_row_order() {
        let candidates = vec![
            candidate(0.0, 0.0, 10.0, 10.0, 0, 0.7),
            candidate(1.0, 0.0, 11.0, 10.0, 0, 0.7),
        ];

        let kept = suppress(&candidates, 0.45, false, 10);
        assert_eq!(kept, vec![candidates[0]]);
    }

    #[test]
    fn test_suppress_stops_at_max_det() {
        let candidates: Vec<_> = (0..10)
            .map(|i| {
                let x = i as f32 * 20.0;
                candidate(x, 0.0, x + 10.0, 10.0, 0, 0.1 * i as f32 + 0.05)
            })
            .collect();

        let kept = suppress(&candidates, 0.45, false, 3);
        // the three most confident, in row order
        assert_eq!(kept, candidates[7..].to_vec());
    }

    #[test]
    fn test_suppress_invariants_on_random_boxes() {
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..50 {
            let candidates: Vec<_> = (0..60)
                .map(|_| {
                    let (x, y) = (rng.f32() * 200.0, rng.f32() * 200.0);
                    let (w, h) = (5.0 + rng.f32() * 60.0, 5.0 + rng.f32() * 60.0);
                    candidate(x, y, x + w, y + h, rng.u32(0..3), rng.f32())
                })
                .collect();
            let max_det = rng.usize(1..30);
            let agnostic = rng.bool();

            let kept = suppress(&candidates, 0.45, agnostic, max_det);

            assert!(kept.len() <= max_det);
            for (i, a) in kept.iter().enumerate() {
                for b in &kept[i + 1..] {
                    if agnostic || a.class_id == b.class_id {
                        assert!(a.bbox.iou(&b.bbox) < 0.45);
                    }
                }
            }
        }
    }

    #[test]
    fn test_rescale_inverts_letterbox_within_one_pixel() {
        let params = LetterboxParams {
            scale: 640.0 / 1920.0,
            pad_x: 0.0,
            pad_y: 140.0,
            original: ImageSize::new(1920, 1080),
            letterboxed: ImageSize::square(640),
        };

        let mut rng = fastrand::Rng::with_seed(3);
        for _ in 0..200 {
            let x1 = rng.f32() * 1800.0;
            let y1 = rng.f32() * 1000.0;
            let x2 = x1 + 1.0 + rng.f32() * (1919.0 - x1);
            let y2 = y1 + 1.0 + rng.f32() * (1079.0 - y1);
            let (lx1, ly1) = params.map_point(x1, y1);
            let (lx2, ly2) = params.map_point(x2, y2);

            let detections = rescale(&[candidate(lx1, ly1, lx2, ly2, 0, 0.9)], &params);

            let b = detections[0].bbox;
            assert!((b.x1 - x1).abs() < 1.0 && (b.y1 - y1).abs() < 1.0);
            assert!((b.x2 - x2).abs() < 1.0 && (b.y2 - y2).abs() < 1.0);
        }
    }

    #[test]
    fn test_rescale_clamps_and_drops_collapsed_boxes() {
        let params = LetterboxParams::identity(ImageSize::new(100, 50));
        let candidates = vec![
            candidate(-10.0, -5.0, 120.0, 60.0, 0, 0.9),
            // entirely in the padding above the image
            candidate(10.0, -30.0, 40.0, -10.0, 0, 0.9),
        ];

        let detections = rescale(&candidates, &params);

        assert_eq!(detections.len(), 1);
        // closed range: edges land on the frame border itself
        assert_eq!(detections[0].bbox, BoundingBox::new(0.0, 0.0, 100.0, 50.0));
    }

    #[test]
    fn test_process_runs_the_full_chain() {
        let out = output(
            "output0",
            &[1, 3, 7],
            &[
                vec![50.0, 50.0, 20.0, 20.0, 0.9, 1.0, 0.0],
                vec![51.0, 50.0, 20.0, 20.0, 0.8, 1.0, 0.0],
                vec![10.0, 10.0, 4.0, 4.0, 0.1, 1.0, 0.0],
            ],
        );
        let post = PostProcessor::new(0.25, 0.45, 1000);

        let detections = post
            .process(&[out], &LetterboxParams::identity(ImageSize::square(100)))
            .unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, BoundingBox::new(40.0, 40.0, 60.0, 60.0));
        assert_eq!(detections[0].class_id, 0);
    }
}
