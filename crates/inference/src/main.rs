use anyhow::Context;
use common::TelemetryGuard;
use inference::{
    DetectionService, DetectorConfig, InferenceBackend, InferenceError,
    backend::{Engine, synthetic::SyntheticEngine},
    config::Device,
    logging::setup_logging,
    publisher::{DetectionPublisher, MqttPublisher, StdoutPublisher},
    source::ImageSource,
};

#[cfg(all(feature = "ort-backend", not(feature = "trt-backend")))]
use inference::backend::ort::{ExecutionProvider, OrtEngine};

#[cfg(feature = "trt-backend")]
use inference::backend::trt::TrtEngine;

#[cfg(not(any(feature = "ort-backend", feature = "trt-backend")))]
compile_error!("At least one backend feature must be enabled: 'ort-backend' or 'trt-backend'");

/// `synthetic://<classes>` runs the pipeline without a model file.
const SYNTHETIC_SCHEME: &str = "synthetic://";
const SYNTHETIC_DEFAULT_CLASSES: usize = 80;

fn main() -> anyhow::Result<()> {
    let config = DetectorConfig::from_env()?;

    // TelemetryGuard needs a Tokio runtime for the OTLP exporters and installs
    // the tracing subscriber itself.
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard =
            rt.block_on(async { TelemetryGuard::init("trtdetect", endpoint, config.environment) })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(&config);
        (None, None)
    };

    tracing::info!(config = ?config, "Loaded configuration");

    let mut source = ImageSource::open(&config.source)?;
    let mut publisher: Box<dyn DetectionPublisher> = match &config.mqtt {
        Some(mqtt) => Box::new(MqttPublisher::new(
            &mqtt.host,
            mqtt.port,
            mqtt.topic.clone(),
            &mqtt.client_id,
        )?),
        None => Box::new(StdoutPublisher::new()),
    };

    if let Some(classes) = config.weights.strip_prefix(SYNTHETIC_SCHEME) {
        let classes = if classes.is_empty() {
            SYNTHETIC_DEFAULT_CLASSES
        } else {
            classes
                .parse()
                .with_context(|| format!("Invalid synthetic class count '{classes}'"))?
        };
        tracing::warn!(classes, "Running with the synthetic engine, no model loaded");
        let engine = SyntheticEngine::dynamic(config.input_size, classes);
        return serve(engine, config, &mut source, publisher.as_mut());
    }

    tracing::info!(weights = %config.weights, device = %config.device, "Loading engine");
    let engine = load_engine(&config).map_err(|e| InferenceError::EngineLoad(format!("{e:#}")))?;
    tracing::info!("Engine loaded successfully");

    serve(engine, config, &mut source, publisher.as_mut())
}

fn serve<E: Engine>(
    engine: E,
    config: DetectorConfig,
    source: &mut ImageSource,
    publisher: &mut dyn DetectionPublisher,
) -> anyhow::Result<()> {
    let mut backend = InferenceBackend::new(engine)?;
    backend.warmup().context("Warmup pass failed")?;

    let mut service = DetectionService::new(backend, config);
    let summary = service.run(source, publisher);

    tracing::info!(
        frames = summary.frames_received,
        processed = summary.frames_processed,
        failed = summary.frames_failed,
        detections = summary.detections,
        healthy = service.is_healthy(),
        "Done"
    );
    Ok(())
}

#[cfg(feature = "trt-backend")]
fn load_engine(config: &DetectorConfig) -> anyhow::Result<TrtEngine> {
    let Device::Cuda(device_id) = config.device else {
        anyhow::bail!("TensorRT engines run on a CUDA device, got DEVICE={}", config.device);
    };
    Ok(TrtEngine::load(&config.weights, device_id as i32)?)
}

#[cfg(all(feature = "ort-backend", not(feature = "trt-backend")))]
fn load_engine(config: &DetectorConfig) -> anyhow::Result<OrtEngine> {
    let provider = match config.device {
        Device::Cpu => ExecutionProvider::Cpu,
        Device::Cuda(device_id) => ExecutionProvider::Cuda {
            device_id: device_id as i32,
        },
    };
    let size = config.input_size;
    Ok(OrtEngine::load(&config.weights, provider)?.with_input_profile(
        inference::backend::IMAGES_BINDING,
        vec![1, 3, size.height as usize, size.width as usize],
    ))
}
