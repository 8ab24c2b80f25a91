use crate::{
    backend::{Engine, InferenceBackend},
    config::DetectorConfig,
    detection::{DetectionSet, FrameMeta},
    errors::InferenceError,
    postprocess::PostProcessor,
    publisher::DetectionPublisher,
    source::FrameSource,
};
use common::span;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use preprocess::{Frame, FramePreprocessor, ImageSize, LetterboxOptions, PrecisionMode};
use std::time::Instant;

struct ServiceMetrics {
    duration: Histogram<f64>,
    frames: Counter<u64>,
    failed: Counter<u64>,
    detections: Counter<u64>,
    device_errors: Counter<u64>,
    unhealthy: Counter<u64>,
}

impl ServiceMetrics {
    fn new(meter_name: &'static str) -> Self {
        let meter = global::meter(meter_name);
        let latency_buckets = [
            0.001, 0.002, 0.005, 0.007, 0.01, 0.015, 0.02, 0.025, 0.03, 0.04, 0.05, 0.075, 0.1,
            0.15, 0.2, 0.5,
        ];

        Self {
            duration: meter
                .f64_histogram("detector_frame_duration_seconds")
                .with_description("Time to process a single frame (preprocess + infer + postprocess)")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            frames: meter
                .u64_counter("detector_frames_total")
                .with_description("Total frames submitted to the pipeline")
                .build(),
            failed: meter
                .u64_counter("detector_frames_failed_total")
                .with_description("Frames whose pipeline returned an error, by error kind")
                .build(),
            detections: meter
                .u64_counter("detector_detections_total")
                .with_description("Total detections produced")
                .build(),
            device_errors: meter
                .u64_counter("detector_device_errors_total")
                .with_description("Device execution failures")
                .build(),
            unhealthy: meter
                .u64_counter("detector_device_unhealthy")
                .with_description("Times the device error streak reached the threshold")
                .build(),
        }
    }
}

/// Consecutive device failures, raised once the streak reaches a threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHealth {
    threshold: u32,
    consecutive: u32,
}

impl DeviceHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive < self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// True exactly when this failure makes the device unhealthy.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == self.threshold
    }

    /// True when a success ends an unhealthy streak.
    pub fn record_success(&mut self) -> bool {
        let recovered = !self.is_healthy();
        self.consecutive = 0;
        recovered
    }
}

/// Frame counts of one [`DetectionService::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub source_errors: u64,
    pub publish_errors: u64,
    pub detections: u64,
}

/// One engine, one preprocessor, one postprocessor, driven frame by frame.
pub struct DetectionService<E: Engine> {
    backend: InferenceBackend<E>,
    config: DetectorConfig,
    preprocessor: FramePreprocessor,
    postprocessor: PostProcessor,
    health: DeviceHealth,
    metrics: ServiceMetrics,
}

impl<E: Engine> DetectionService<E> {
    pub fn new(backend: InferenceBackend<E>, config: DetectorConfig) -> Self {
        let dynamic = backend.has_dynamic_spatial_dims();
        let target = match backend.input_shape() {
            [_, _, h, w] if !dynamic => ImageSize::new(*w as u32, *h as u32),
            _ => config.input_size,
        };
        if target != config.input_size {
            tracing::warn!(
                requested = ?config.input_size,
                engine = ?target,
                "Engine input is static, using its size"
            );
        }

        let precision = backend.precision();
        if config.half != (precision == PrecisionMode::Half) {
            tracing::warn!(
                half = config.half,
                engine = ?precision,
                "Requested precision differs from the engine, following the engine"
            );
        }

        // Fixed height and width need the full target; dynamic ones take the minimum rectangle.
        let options = LetterboxOptions {
            auto: dynamic,
            ..LetterboxOptions::default()
        };
        let preprocessor = FramePreprocessor::new(target, config.stride, options, precision);
        let postprocessor = PostProcessor::new(config.conf_thres, config.iou_thres, config.max_det)
            .with_agnostic(config.agnostic_nms)
            .with_classes(config.classes.clone());

        tracing::info!(
            target = ?target,
            dynamic,
            precision = ?precision,
            conf_thres = config.conf_thres,
            iou_thres = config.iou_thres,
            max_det = config.max_det,
            "Detection service configured"
        );

        Self {
            health: DeviceHealth::new(config.device_error_threshold),
            metrics: ServiceMetrics::new("detector"),
            backend,
            config,
            preprocessor,
            postprocessor,
        }
    }

    /// letterbox -> tensor -> forward -> filter/suppress/rescale.
    pub fn run_frame(&mut self, frame: &Frame, meta: FrameMeta) -> Result<DetectionSet, InferenceError> {
        let _s = span!("run_frame");

        let preprocessed = self.preprocessor.preprocess(frame)?;
        let outputs = self.backend.forward(preprocessed.tensor)?;
        if self.health.record_success() {
            tracing::info!(frame_id = meta.frame_id, "Inference device recovered");
        }
        let detections = self.postprocessor.process(&outputs, &preprocessed.params)?;

        Ok(DetectionSet::new(meta, detections))
    }

    /// [`run_frame`](Self::run_frame) plus the per-frame error policy.
    ///
    /// Backend failures skip the frame (`None`). Preprocess and postprocess
    /// failures yield an empty set. Every failure is logged with the frame id.
    pub fn handle_frame(&mut self, frame: &Frame, meta: FrameMeta) -> Option<DetectionSet> {
        let start = Instant::now();
        let frame_id = meta.frame_id;

        let result = self.run_frame(frame, meta.clone());

        self.metrics
            .duration
            .record(start.elapsed().as_secs_f64(), &[]);
        self.metrics.frames.add(1, &[]);

        match result {
            Ok(set) => {
                self.metrics.detections.add(set.len() as u64, &[]);
                Some(set)
            }
            Err(e) => {
                self.metrics
                    .failed
                    .add(1, &[KeyValue::new("kind", e.kind())]);

                if matches!(e, InferenceError::DeviceExecution(_)) {
                    self.metrics.device_errors.add(1, &[]);
                    if self.health.record_failure() {
                        self.metrics.unhealthy.add(1, &[]);
                        tracing::error!(
                            frame_id,
                            consecutive = self.health.consecutive_failures(),
                            "Inference device unhealthy: repeated execution failures"
                        );
                    }
                }

                if e.yields_empty_set() {
                    tracing::warn!(frame_id, kind = e.kind(), error = %e, "Frame failed, publishing no detections");
                    Some(DetectionSet::empty(meta))
                } else {
                    tracing::error!(frame_id, kind = e.kind(), error = %e, "Frame skipped");
                    None
                }
            }
        }
    }

    /// Drain `source`, handing every processed frame's detections to
    /// `publisher` in order. Only every `vid_stride`-th frame is processed.
    pub fn run<S, P>(&mut self, source: &mut S, publisher: &mut P) -> RunSummary
    where
        S: FrameSource + ?Sized,
        P: DetectionPublisher + ?Sized,
    {
        tracing::info!(
            weights = %self.config.weights,
            source = %self.config.source,
            vid_stride = self.config.vid_stride,
            "Detection loop starting"
        );

        let stride = u64::from(self.config.vid_stride.max(1));
        let mut summary = RunSummary::default();

        while let Some(item) = source.next_frame() {
            let index = summary.frames_received;
            summary.frames_received += 1;

            if index % stride != 0 {
                summary.frames_skipped += 1;
                continue;
            }

            let (frame, meta) = match item {
                Ok(item) => item,
                Err(e) => {
                    summary.source_errors += 1;
                    tracing::error!(index, error = %format!("{e:#}"), "Failed to read frame");
                    continue;
                }
            };

            let frame_id = meta.frame_id;
            let Some(set) = self.handle_frame(&frame, meta) else {
                summary.frames_failed += 1;
                continue;
            };

            summary.frames_processed += 1;
            summary.detections += set.len() as u64;

            if let Err(e) = publisher.publish(set) {
                summary.publish_errors += 1;
                tracing::error!(frame_id, error = %format!("{e:#}"), "Failed to publish detections");
            }

            if summary.frames_processed.is_multiple_of(100) {
                tracing::debug!(
                    frames_processed = summary.frames_processed,
                    frames_failed = summary.frames_failed,
                    detections = summary.detections,
                    "Progress"
                );
            }
        }

        tracing::info!(summary = ?summary, "Source exhausted");
        summary
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> &DeviceHealth {
        &self.health
    }

    pub fn backend(&self) -> &InferenceBackend<E> {
        &self.backend
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn preprocessor(&self) -> &FramePreprocessor {
        &self.preprocessor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::{SyntheticBox, SyntheticEngine};
    use preprocess::PixelFormat;

    fn meta(frame_id: u64, frame: &Frame) -> FrameMeta {
        FrameMeta {
            frame_id,
            source: "test".to_string(),
            timestamp_ns: 0,
            width: frame.width(),
            height: frame.height(),
        }
    }

    fn service(engine: SyntheticEngine) -> DetectionService<SyntheticEngine> {
        let backend = InferenceBackend::new(engine).unwrap();
        DetectionService::new(backend, DetectorConfig::test_default())
    }

    #[test]
    fn test_health_threshold_and_recovery() {
        let mut health = DeviceHealth::new(3);

        assert!(!health.record_failure());
        assert!(!health.record_failure());
        assert!(health.record_failure());
        assert!(!health.is_healthy());
        // only the crossing is reported
        assert!(!health.record_failure());

        assert!(health.record_success());
        assert!(health.is_healthy());
        assert!(!health.record_success());
    }

    #[test]
    fn test_static_engine_sets_the_letterbox_target() {
        let svc = service(SyntheticEngine::new(ImageSize::new(320, 256), 2));

        assert_eq!(svc.preprocessor().target(), ImageSize::new(320, 256));
        assert!(!svc.preprocessor().options().auto);
    }

    #[test]
    fn test_batch_only_dynamic_engine_letterboxes_to_its_fixed_size() {
        let engine = SyntheticEngine::dynamic_batch(ImageSize::square(640), 2)
            .with_detection(SyntheticBox::from_corners(100.0, 200.0, 300.0, 400.0, 0, 0.9));
        let mut svc = service(engine);
        assert!(svc.backend().is_dynamic());
        assert!(!svc.backend().has_dynamic_spatial_dims());
        assert_eq!(svc.preprocessor().target(), ImageSize::square(640));
        assert!(!svc.preprocessor().options().auto);

        let frame = Frame::filled(1280, 720, PixelFormat::Bgr, [0, 0, 0]);
        let set = svc.run_frame(&frame, meta(0, &frame)).unwrap();

        assert_eq!(svc.backend().input_shape(), &[1, 3, 640, 640]);
        // scale 0.5, 140 rows of padding on top
        let b = set.detections()[0].bbox;
        assert!((b.x1 - 200.0).abs() < 1e-3 && (b.y1 - 120.0).abs() < 1e-3);
        assert!((b.x2 - 600.0).abs() < 1e-3 && (b.y2 - 520.0).abs() < 1e-3);
    }

    #[test]
    fn test_run_frame_maps_back_to_frame_pixels() {
        // 128x64 frame into a 64x64 engine: scale 0.5, 16 rows of padding on top
        let engine = SyntheticEngine::new(ImageSize::square(64), 2)
            .with_detection(SyntheticBox::from_corners(8.0, 20.0, 24.0, 36.0, 1, 0.9));
        let mut svc = service(engine);
        let frame = Frame::filled(128, 64, PixelFormat::Rgb, [0, 0, 0]);

        let set = svc.run_frame(&frame, meta(0, &frame)).unwrap();

        assert_eq!(set.len(), 1);
        let d = set.detections()[0];
        assert_eq!(d.class_id, 1);
        assert!((d.bbox.x1 - 16.0).abs() < 1e-3 && (d.bbox.y1 - 8.0).abs() < 1e-3);
        assert!((d.bbox.x2 - 48.0).abs() < 1e-3 && (d.bbox.y2 - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_malformed_frame_yields_empty_set() {
        let mut svc = service(SyntheticEngine::new(ImageSize::square(64), 2));
        let frame = Frame::new(vec![0; 5], 4, 4, PixelFormat::Rgb);

        assert!(matches!(
            svc.run_frame(&frame, meta(3, &frame)),
            Err(InferenceError::Preprocess(_))
        ));

        let set = svc.handle_frame(&frame, meta(3, &frame)).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.meta().frame_id, 3);
    }

    #[test]
    fn test_device_success_resets_health_even_if_postprocess_fails() {
        // no row-shaped output, so every pass fails in postprocess
        let engine = SyntheticEngine::new(ImageSize::square(32), 0);
        let faults = engine.faults();
        let mut svc = service(engine);
        let frame = Frame::filled(32, 32, PixelFormat::Rgb, [0, 0, 0]);

        faults.fail_next(2);
        assert!(svc.handle_frame(&frame, meta(0, &frame)).is_none());
        assert!(svc.handle_frame(&frame, meta(1, &frame)).is_none());
        assert_eq!(svc.health().consecutive_failures(), 2);

        let set = svc.handle_frame(&frame, meta(2, &frame)).unwrap();
        assert!(set.is_empty());
        assert_eq!(svc.health().consecutive_failures(), 0);
    }

    #[test]
    fn test_device_errors_are_skipped_and_tracked() {
        let engine = SyntheticEngine::new(ImageSize::square(32), 1);
        let faults = engine.faults();
        let mut svc = service(engine);
        let frame = Frame::filled(32, 32, PixelFormat::Rgb, [1, 2, 3]);

        faults.fail_next(3);
        for i in 0..3 {
            assert!(svc.handle_frame(&frame, meta(i, &frame)).is_none());
        }
        assert!(!svc.is_healthy());

        assert!(svc.handle_frame(&frame, meta(3, &frame)).is_some());
        assert!(svc.is_healthy());
    }
}
