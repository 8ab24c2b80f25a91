use super::{
    buffer::DeviceBuffer,
    engine::{BoundTensor, DataType, Dim, Engine, TensorRole, TensorSpec},
};
use crate::errors::EngineError;
use half::f16;
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    tensor::TensorElementType,
    value::{DynValue, Tensor, ValueType},
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Cuda { device_id: i32 },
}

/// ONNX Runtime session behind the [`Engine`] seam.
///
/// Buffers live in host memory; ORT copies them to the execution provider.
/// ONNX graphs carry no optimization profile, so output shapes under a new
/// input shape are learned from one probe pass and cached per input shape.
pub struct OrtEngine {
    session: Session,
    specs: Vec<TensorSpec>,
    input_shapes: BTreeMap<String, Vec<usize>>,
    probed: HashMap<Vec<Vec<usize>>, BTreeMap<String, Vec<usize>>>,
}

impl OrtEngine {
    pub fn load(path: &str, provider: ExecutionProvider) -> Result<Self, EngineError> {
        let session = build_session(path, provider).map_err(|e| EngineError::Deserialize {
            path: path.to_string(),
            reason: format!("{e:#}"),
        })?;

        let mut specs = Vec::with_capacity(session.inputs.len() + session.outputs.len());
        for input in &session.inputs {
            specs.push(tensor_spec(&input.name, TensorRole::Input, &input.input_type)?);
        }
        for output in &session.outputs {
            specs.push(tensor_spec(
                &output.name,
                TensorRole::Output,
                &output.output_type,
            )?);
        }

        tracing::info!(
            path,
            inputs = session.inputs.len(),
            outputs = session.outputs.len(),
            "ONNX model loaded"
        );

        let mut engine = Self {
            session,
            specs,
            input_shapes: BTreeMap::new(),
            probed: HashMap::new(),
        };
        engine.reset_input_shapes();
        Ok(engine)
    }

    /// Shape the dynamic dimensions of `name` resolve to before any resize.
    pub fn with_input_profile(mut self, name: &str, shape: Vec<usize>) -> Self {
        if let Some(spec) = self
            .specs
            .iter_mut()
            .find(|s| s.name == name && s.role == TensorRole::Input)
        {
            if spec.shape.len() == shape.len() {
                spec.profile = Some(shape);
            } else {
                tracing::warn!(
                    name,
                    declared_rank = spec.shape.len(),
                    profile = ?shape,
                    "Ignoring input profile of the wrong rank"
                );
            }
        }
        self.reset_input_shapes();
        self
    }

    fn reset_input_shapes(&mut self) {
        self.input_shapes = self
            .specs
            .iter()
            .filter(|s| s.role == TensorRole::Input)
            .map(|s| (s.name.clone(), s.resolved_shape()))
            .collect();
    }

    fn spec(&self, name: &str) -> Result<&TensorSpec, EngineError> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::UnknownTensor(name.to_string()))
    }

    fn probe_output_shapes(&mut self) -> Result<&BTreeMap<String, Vec<usize>>, EngineError> {
        let key: Vec<Vec<usize>> = self.input_shapes.values().cloned().collect();

        if !self.probed.contains_key(&key) {
            let _s = common::span_debug!("probe_output_shapes");

            let mut inputs = Vec::new();
            for (name, shape) in &self.input_shapes {
                let dtype = self.spec(name)?.dtype;
                let zeros = vec![0u8; shape.iter().product::<usize>() * dtype.size_bytes()];
                inputs.push((name.clone(), host_value(shape, dtype, &zeros)?));
            }

            let outputs = self.session.run(inputs).map_err(execution_error)?;
            let mut shapes = BTreeMap::new();
            for spec in self.specs.iter().filter(|s| s.role == TensorRole::Output) {
                let value = outputs
                    .get(&spec.name)
                    .ok_or_else(|| EngineError::UnknownTensor(spec.name.clone()))?;
                let (shape, _) = extract(value, spec.dtype)?;
                shapes.insert(spec.name.clone(), shape);
            }
            drop(outputs);

            tracing::debug!(inputs = ?key, outputs = ?shapes, "Probed output shapes");
            self.probed.insert(key.clone(), shapes);
        }

        self.probed
            .get(&key)
            .ok_or_else(|| EngineError::Execution("probe cache miss".to_string()))
    }
}

fn build_session(path: &str, provider: ExecutionProvider) -> anyhow::Result<Session> {
    // Initialize ORT environment (idempotent)
    let _ = ort::init().commit();

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?;

    match provider {
        ExecutionProvider::Cuda { device_id } => {
            tracing::info!(device_id, "Initializing ONNX Runtime with CUDA execution provider");
            builder = builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure(),
            ])?;
        }
        ExecutionProvider::Cpu => {
            tracing::info!("Initializing ONNX Runtime with CPU execution provider");
        }
    }

    Ok(builder.commit_from_file(path)?)
}

fn tensor_spec(
    name: &str,
    role: TensorRole,
    value_type: &ValueType,
) -> Result<TensorSpec, EngineError> {
    let unsupported = |dtype: String| EngineError::UnsupportedType {
        name: name.to_string(),
        dtype,
    };

    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(unsupported(format!("{value_type:?}")));
    };
    let dtype = match ty {
        TensorElementType::Float32 => DataType::F32,
        TensorElementType::Float16 => DataType::F16,
        other => return Err(unsupported(format!("{other:?}"))),
    };

    Ok(TensorSpec {
        name: name.to_string(),
        role,
        dtype,
        shape: shape.iter().map(|&d| Dim::from_declared(d)).collect(),
        profile: None,
    })
}

fn execution_error(e: ort::Error) -> EngineError {
    EngineError::Execution(e.to_string())
}

fn host_value(shape: &[usize], dtype: DataType, bytes: &[u8]) -> Result<DynValue, EngineError> {
    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let value = match dtype {
        DataType::F32 => {
            let data: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_array((dims, data)).map(|t| t.into_dyn())
        }
        DataType::F16 => {
            let data: Vec<f16> = bytes
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_array((dims, data)).map(|t| t.into_dyn())
        }
    };
    value.map_err(execution_error)
}

/// Shape and little-endian bytes of an output value.
fn extract(value: &DynValue, dtype: DataType) -> Result<(Vec<usize>, Vec<u8>), EngineError> {
    match dtype {
        DataType::F32 => {
            let (shape, data) = value.try_extract_tensor::<f32>().map_err(execution_error)?;
            Ok((
                shape.iter().map(|&d| d as usize).collect(),
                data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ))
        }
        DataType::F16 => {
            let (shape, data) = value.try_extract_tensor::<f16>().map_err(execution_error)?;
            Ok((
                shape.iter().map(|&d| d as usize).collect(),
                data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ))
        }
    }
}

impl Engine for OrtEngine {
    fn tensors(&self) -> Vec<TensorSpec> {
        self.specs.clone()
    }

    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> Result<(), EngineError> {
        let spec = self.spec(name)?;
        if spec.role != TensorRole::Input || !spec.accepts(shape) {
            return Err(EngineError::InvalidShape {
                name: name.to_string(),
                shape: shape.to_vec(),
                reason: format!("declared {:?}", spec.shape),
            });
        }
        self.input_shapes.insert(name.to_string(), shape.to_vec());
        Ok(())
    }

    fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError> {
        if let Some(shape) = self.input_shapes.get(name) {
            return Ok(shape.clone());
        }

        let spec = self.spec(name)?;
        if !spec.is_dynamic() {
            return Ok(spec.resolved_shape());
        }

        self.probe_output_shapes()?
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTensor(name.to_string()))
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError> {
        Ok(DeviceBuffer::host(bytes))
    }

    fn execute(&mut self, bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError> {
        let mut inputs = Vec::new();
        for binding in bindings.iter().filter(|b| b.role == TensorRole::Input) {
            let bytes = binding.buffer.to_host()?;
            inputs.push((
                binding.name.to_string(),
                host_value(binding.shape, binding.dtype, &bytes)?,
            ));
        }

        let outputs = self.session.run(inputs).map_err(execution_error)?;

        for binding in bindings
            .iter_mut()
            .filter(|b| b.role == TensorRole::Output)
        {
            let value = outputs
                .get(binding.name)
                .ok_or_else(|| EngineError::UnknownTensor(binding.name.to_string()))?;
            let (shape, bytes) = extract(value, binding.dtype)?;
            if shape != binding.shape {
                return Err(EngineError::Execution(format!(
                    "output '{}' came back as {shape:?}, bound as {:?}",
                    binding.name, binding.shape
                )));
            }
            binding.buffer.upload(&bytes)?;
        }

        Ok(())
    }
}
