use crate::errors::InferenceError;
use common::{env_flag, env_parse};
use preprocess::{DEFAULT_INPUT_SIZE, DEFAULT_STRIDE, ImageSize};
use std::{fmt, str::FromStr};

pub use common::Environment;

/// Execution device for the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl FromStr for Device {
    type Err = String;

    /// `cpu`, `0`, `cuda:0`; empty selects the first CUDA device.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Ok(Device::Cuda(0));
        }
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        s.strip_prefix("cuda:")
            .unwrap_or(&s)
            .parse()
            .map(Device::Cuda)
            .map_err(|_| format!("expected 'cpu', a device index or 'cuda:<index>', got '{s}'"))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Network input size, `h,w` or a single value for a square input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize(pub ImageSize);

impl FromStr for InputSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|e| format!("'{v}' is not a size: {e}"))
        };
        match s.split_once(',') {
            Some((h, w)) => Ok(InputSize(ImageSize::new(parse(w)?, parse(h)?))),
            None => Ok(InputSize(ImageSize::square(parse(s)?))),
        }
    }
}

/// Comma separated class ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassList(pub Vec<u32>);

impl FromStr for ClassList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse().map_err(|e| format!("'{v}' is not a class id: {e}")))
            .collect::<Result<Vec<_>, _>>()
            .map(ClassList)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub environment: Environment,
    pub weights: String,
    pub source: String,
    pub input_size: ImageSize,
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub max_det: usize,
    pub device: Device,
    pub classes: Option<Vec<u32>>,
    pub agnostic_nms: bool,
    /// Requested precision; the engine's declared input dtype wins.
    pub half: bool,
    pub vid_stride: u32,
    pub stride: u32,
    pub device_error_threshold: u32,
    pub mqtt: Option<MqttConfig>,
    pub otel_endpoint: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            weights: "yolov5s.onnx".to_string(),
            source: "data/images".to_string(),
            input_size: DEFAULT_INPUT_SIZE,
            conf_thres: 0.25,
            iou_thres: 0.45,
            max_det: 1000,
            device: Device::Cuda(0),
            classes: None,
            agnostic_nms: false,
            half: false,
            vid_stride: 1,
            stride: DEFAULT_STRIDE,
            device_error_threshold: 3,
            mqtt: None,
            otel_endpoint: None,
        }
    }
}

impl DetectorConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults; anything set but invalid is a
    /// `Config` error.
    pub fn from_env() -> Result<Self, InferenceError> {
        Self::read_env().map_err(|e| InferenceError::Config(format!("{e:#}")))?
            .validated()
    }

    fn read_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let mqtt = match env_parse::<String>("MQTT_BROKER_HOST")? {
            Some(host) => Some(MqttConfig {
                host,
                port: env_parse("MQTT_BROKER_PORT")?.unwrap_or(1883),
                topic: env_parse("MQTT_TOPIC")?
                    .unwrap_or_else(|| "object_detections".to_string()),
                client_id: env_parse("MQTT_CLIENT_ID")?
                    .unwrap_or_else(|| "trtdetect_node".to_string()),
            }),
            None => None,
        };

        // DEVICE= (empty) is meaningful: first CUDA device
        let device = match std::env::var("DEVICE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("DEVICE={raw:?} is invalid: {e}"))?,
            Err(_) => defaults.device,
        };

        Ok(Self {
            environment: Environment::from_env(),
            weights: env_parse("WEIGHTS")?.unwrap_or(defaults.weights),
            source: env_parse("SOURCE")?.unwrap_or(defaults.source),
            input_size: env_parse::<InputSize>("IMGSZ")?
                .map(|s| s.0)
                .unwrap_or(defaults.input_size),
            conf_thres: env_parse("CONF_THRES")?.unwrap_or(defaults.conf_thres),
            iou_thres: env_parse("IOU_THRES")?.unwrap_or(defaults.iou_thres),
            max_det: env_parse("MAX_DET")?.unwrap_or(defaults.max_det),
            device,
            classes: env_parse::<ClassList>("CLASSES")?
                .map(|c| c.0)
                .filter(|c| !c.is_empty()),
            agnostic_nms: env_flag("AGNOSTIC_NMS")?.unwrap_or(defaults.agnostic_nms),
            half: env_flag("HALF")?.unwrap_or(defaults.half),
            vid_stride: env_parse("VID_STRIDE")?.unwrap_or(defaults.vid_stride),
            stride: env_parse("STRIDE")?.unwrap_or(defaults.stride),
            device_error_threshold: env_parse("DEVICE_ERROR_THRESHOLD")?
                .unwrap_or(defaults.device_error_threshold),
            mqtt,
            otel_endpoint: env_parse("OTEL_EXPORTER_OTLP_ENDPOINT")?,
        })
    }

    /// Range checks shared by every way of building a config.
    pub fn validated(self) -> Result<Self, InferenceError> {
        let fail = |msg: String| Err(InferenceError::Config(msg));

        if self.weights.trim().is_empty() {
            return fail("WEIGHTS must name an engine file".to_string());
        }
        if !(self.conf_thres > 0.0 && self.conf_thres <= 1.0) {
            return fail(format!("CONF_THRES must be in (0, 1], got {}", self.conf_thres));
        }
        if !(self.iou_thres > 0.0 && self.iou_thres <= 1.0) {
            return fail(format!("IOU_THRES must be in (0, 1], got {}", self.iou_thres));
        }
        if self.max_det == 0 {
            return fail("MAX_DET must be at least 1".to_string());
        }
        if self.input_size.width == 0 || self.input_size.height == 0 {
            return fail(format!("IMGSZ must be positive, got {:?}", self.input_size));
        }
        if self.stride == 0 {
            return fail("STRIDE must be at least 1".to_string());
        }
        if self.vid_stride == 0 {
            return fail("VID_STRIDE must be at least 1".to_string());
        }
        if self.device_error_threshold == 0 {
            return fail("DEVICE_ERROR_THRESHOLD must be at least 1".to_string());
        }

        if self.input_size.width % self.stride != 0 || self.input_size.height % self.stride != 0
        {
            tracing::warn!(
                input_size = ?self.input_size,
                stride = self.stride,
                "Input size is not a multiple of the stride"
            );
        }

        Ok(self)
    }

    /// Create default configuration for testing
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            weights: "synthetic://".to_string(),
            device: Device::Cpu,
            ..Self::default()
        }
    }
}
