pub mod bindings;
pub mod buffer;
pub mod engine;
pub mod synthetic;

#[cfg(feature = "ort-backend")]
pub mod ort;

#[cfg(feature = "trt-backend")]
pub mod trt;

pub use bindings::{Binding, BindingTable};
pub use buffer::{DeviceAddress, DeviceBuffer, DeviceMemory, HostMemory};
pub use engine::{BoundTensor, DataType, Dim, Engine, TensorRole, TensorSpec};

use crate::errors::InferenceError;
use common::span;
use half::f16;
use ndarray::{ArrayD, IxDyn};
use preprocess::{InputTensor, PrecisionMode};
use std::ops::{Deref, DerefMut};

/// Name of the input the preprocessed frame is bound to when present.
pub const IMAGES_BINDING: &str = "images";

/// Host copy of one output binding after a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub name: String,
    pub data: ArrayD<f32>,
}

/// Runs forward passes of one engine against its binding table.
pub struct InferenceBackend<E: Engine> {
    engine: E,
    bindings: BindingTable,
    input_name: String,
    precision: PrecisionMode,
}

impl<E: Engine> InferenceBackend<E> {
    pub fn new(mut engine: E) -> Result<Self, InferenceError> {
        let bindings = BindingTable::build(&mut engine)?;

        let input = match bindings.get(IMAGES_BINDING) {
            Some(b) if b.role() == TensorRole::Input => b,
            _ => bindings.inputs().next().ok_or_else(|| {
                InferenceError::EngineLoad("engine declares no input bindings".to_string())
            })?,
        };
        let input_name = input.name().to_string();
        let precision = input.dtype().precision();

        for binding in bindings.inputs().chain(bindings.outputs()) {
            tracing::info!(
                name = binding.name(),
                role = ?binding.role(),
                dtype = ?binding.dtype(),
                declared = %format_dims(binding.declared_shape()),
                shape = ?binding.shape(),
                "Engine binding"
            );
        }
        tracing::info!(input = %input_name, precision = ?precision, "Inference backend ready");

        Ok(Self {
            engine,
            bindings,
            input_name,
            precision,
        })
    }

    /// One synchronous pass. Outputs come back in output-name order.
    pub fn forward(&mut self, input: InputTensor) -> Result<Vec<OutputTensor>, InferenceError> {
        let _s = span!("forward");

        let input = self.match_precision(input)?;
        let mut engine = InferenceMode::enter(&mut self.engine);

        let needs_resize = {
            let binding = self
                .bindings
                .get(&self.input_name)
                .ok_or_else(|| InferenceError::UnknownBinding(self.input_name.clone()))?;
            if binding.shape() == input.shape() {
                false
            } else if binding.is_dynamic() {
                true
            } else {
                return Err(InferenceError::ShapeMismatch {
                    binding: self.input_name.clone(),
                    expected: binding.shape().to_vec(),
                    actual: input.shape().to_vec(),
                });
            }
        };
        if needs_resize {
            self.bindings
                .resize(&mut *engine, &self.input_name, input.shape())?;
        }

        self.bindings
            .upload(&self.input_name, &input.to_le_bytes())?;

        {
            let _s = span!("execute");
            let mut bound = self.bindings.bound_tensors();
            engine
                .execute(&mut bound)
                .map_err(InferenceError::DeviceExecution)?;
        }

        self.bindings
            .outputs()
            .map(|binding| {
                let bytes = binding
                    .download()
                    .map_err(InferenceError::DeviceExecution)?;
                let data = ArrayD::from_shape_vec(
                    IxDyn(binding.shape()),
                    decode(&bytes, binding.dtype()),
                )
                .map_err(|e| InferenceError::Postprocess(format!("{}: {e}", binding.name())))?;
                Ok(OutputTensor {
                    name: binding.name().to_string(),
                    data,
                })
            })
            .collect()
    }

    /// One pass on a zero tensor of the current input shape.
    pub fn warmup(&mut self) -> Result<(), InferenceError> {
        let shape = self.input_shape().to_vec();
        tracing::info!(shape = ?shape, "Warming up");
        self.forward(InputTensor::zeros(&shape, self.precision))?;
        Ok(())
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn input_shape(&self) -> &[usize] {
        self.bindings
            .get(&self.input_name)
            .map(|b| b.shape())
            .unwrap_or_default()
    }

    pub fn is_dynamic(&self) -> bool {
        self.bindings
            .get(&self.input_name)
            .is_some_and(|b| b.is_dynamic())
    }

    /// Whether the input's height or width follows each frame, as opposed to
    /// only its batch size.
    pub fn has_dynamic_spatial_dims(&self) -> bool {
        self.bindings
            .get(&self.input_name)
            .is_some_and(|b| match b.declared_shape() {
                [_, _, h, w] => h.is_dynamic() || w.is_dynamic(),
                dims => dims.iter().any(|d| d.is_dynamic()),
            })
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn match_precision(&self, input: InputTensor) -> Result<InputTensor, InferenceError> {
        match (self.precision, input.precision()) {
            (PrecisionMode::Half, PrecisionMode::Full) => Ok(input.into_half()),
            (PrecisionMode::Full, PrecisionMode::Half) => Err(InferenceError::DtypeMismatch {
                binding: self.input_name.clone(),
                expected: PrecisionMode::Full,
                actual: PrecisionMode::Half,
            }),
            _ => Ok(input),
        }
    }
}

/// Keeps the engine in inference mode for the lifetime of the guard,
/// whichever way the pass ends.
struct InferenceMode<'a, E: Engine> {
    engine: &'a mut E,
}

impl<'a, E: Engine> InferenceMode<'a, E> {
    fn enter(engine: &'a mut E) -> Self {
        engine.set_inference_mode(true);
        Self { engine }
    }
}

impl<E: Engine> Deref for InferenceMode<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.engine
    }
}

impl<E: Engine> DerefMut for InferenceMode<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.engine
    }
}

impl<E: Engine> Drop for InferenceMode<'_, E> {
    fn drop(&mut self) {
        self.engine.set_inference_mode(false);
    }
}

fn decode(bytes: &[u8], dtype: DataType) -> Vec<f32> {
    match dtype {
        DataType::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        DataType::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
    }
}

fn format_dims(dims: &[Dim]) -> String {
    let inner: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", inner.join(", "))
}
