//! Host-only engine with a YOLO-shaped interface.
//!
//! The output `output0` has shape `[batch, anchors, 5 + classes]` where
//! `anchors` covers the three detection strides (8, 16, 32) with three
//! anchors each, as a YOLOv5 export does. Every row is zero except for the
//! candidates configured up front, which are written to the first rows of
//! each batch entry.

use super::{
    buffer::DeviceBuffer,
    engine::{BoundTensor, DataType, Dim, Engine, TensorRole, TensorSpec},
};
use crate::errors::EngineError;
use half::f16;
use preprocess::{ImageSize, PrecisionMode};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

pub const SYNTHETIC_INPUT: &str = "images";
pub const SYNTHETIC_OUTPUT: &str = "output0";

const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 3;

/// Candidate in letterboxed input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub objectness: f32,
    pub class_id: usize,
    pub class_score: f32,
}

impl SyntheticBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, confidence: f32) -> Self {
        Self {
            cx: (x1 + x2) / 2.0,
            cy: (y1 + y2) / 2.0,
            w: x2 - x1,
            h: y2 - y1,
            objectness: confidence,
            class_id,
            class_score: 1.0,
        }
    }
}

/// Cloneable handle that makes the next `n` executions fail.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector(Arc<AtomicUsize>);

impl FaultInjector {
    pub fn fail_next(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct SyntheticEngine {
    dtype: DataType,
    input_dims: Vec<Dim>,
    profile: Option<Vec<usize>>,
    input_shape: Vec<usize>,
    num_classes: usize,
    rows: Vec<Vec<f32>>,
    auxiliary: Vec<(String, usize)>,
    faults: FaultInjector,
    executions: usize,
    inference_mode: bool,
    last_input: Vec<u8>,
}

impl SyntheticEngine {
    /// Static `[1, 3, H, W]` input.
    pub fn new(input: ImageSize, num_classes: usize) -> Self {
        let shape = vec![1, 3, input.height as usize, input.width as usize];
        Self {
            dtype: DataType::F32,
            input_dims: shape.iter().map(|&n| Dim::Fixed(n)).collect(),
            profile: None,
            input_shape: shape,
            num_classes,
            rows: Vec::new(),
            auxiliary: Vec::new(),
            faults: FaultInjector::default(),
            executions: 0,
            inference_mode: false,
            last_input: Vec::new(),
        }
    }

    /// Dynamic batch and spatial dims, with `profile` as the optimal shape.
    pub fn dynamic(profile: ImageSize, num_classes: usize) -> Self {
        let mut engine = Self::new(profile, num_classes);
        engine.profile = Some(engine.input_shape.clone());
        engine.input_dims = vec![Dim::Dynamic, Dim::Fixed(3), Dim::Dynamic, Dim::Dynamic];
        engine
    }

    /// Dynamic batch only; height and width stay fixed at `input`.
    pub fn dynamic_batch(input: ImageSize, num_classes: usize) -> Self {
        let mut engine = Self::new(input, num_classes);
        engine.profile = Some(engine.input_shape.clone());
        engine.input_dims[0] = Dim::Dynamic;
        engine
    }

    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.dtype = precision.into();
        self
    }

    pub fn with_detection(self, candidate: SyntheticBox) -> Self {
        let mut row = vec![0.0; 5 + self.num_classes];
        row[..5].copy_from_slice(&[
            candidate.cx,
            candidate.cy,
            candidate.w,
            candidate.h,
            candidate.objectness,
        ]);
        if let Some(score) = row.get_mut(5 + candidate.class_id) {
            *score = candidate.class_score;
        }
        self.with_row(row)
    }

    /// Raw row, padded with zeros or truncated to `5 + classes` values.
    pub fn with_row(mut self, mut row: Vec<f32>) -> Self {
        row.resize(5 + self.num_classes, 0.0);
        self.rows.push(row);
        self
    }

    /// Extra `[batch, width]` output filled with 0.5.
    pub fn with_auxiliary_output(mut self, name: &str, width: usize) -> Self {
        self.auxiliary.push((name.to_string(), width));
        self
    }

    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    pub fn executions(&self) -> usize {
        self.executions
    }

    pub fn in_inference_mode(&self) -> bool {
        self.inference_mode
    }

    /// Bytes of the input buffer as seen by the last successful execution.
    pub fn last_input(&self) -> &[u8] {
        &self.last_input
    }

    pub fn anchors(height: usize, width: usize) -> usize {
        STRIDES
            .iter()
            .map(|s| (height / s) * (width / s) * ANCHORS_PER_CELL)
            .sum()
    }

    fn row_width(&self) -> usize {
        5 + self.num_classes
    }

    fn batch(&self) -> usize {
        self.input_shape[0]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![
            self.batch(),
            Self::anchors(self.input_shape[2], self.input_shape[3]),
            self.row_width(),
        ]
    }

    fn output_values(&self, name: &str) -> Result<Vec<f32>, EngineError> {
        if name == SYNTHETIC_OUTPUT {
            let shape = self.output_shape();
            let per_batch = shape[1] * shape[2];
            let mut values = vec![0.0f32; shape[0] * per_batch];
            for batch in values.chunks_exact_mut(per_batch) {
                for (slot, row) in batch.chunks_exact_mut(shape[2]).zip(&self.rows) {
                    slot.copy_from_slice(row);
                }
            }
            return Ok(values);
        }

        let (_, width) = self
            .auxiliary
            .iter()
            .find(|(aux, _)| aux == name)
            .ok_or_else(|| EngineError::UnknownTensor(name.to_string()))?;
        Ok(vec![0.5; self.batch() * width])
    }
}

impl Engine for SyntheticEngine {
    fn tensors(&self) -> Vec<TensorSpec> {
        let dynamic = self.profile.is_some();
        let fixed_or_dynamic = |n: usize| if dynamic { Dim::Dynamic } else { Dim::Fixed(n) };
        let output_shape = self.output_shape();

        let mut specs = vec![
            TensorSpec {
                name: SYNTHETIC_INPUT.to_string(),
                role: TensorRole::Input,
                dtype: self.dtype,
                shape: self.input_dims.clone(),
                profile: self.profile.clone(),
            },
            TensorSpec {
                name: SYNTHETIC_OUTPUT.to_string(),
                role: TensorRole::Output,
                dtype: self.dtype,
                shape: vec![
                    fixed_or_dynamic(output_shape[0]),
                    fixed_or_dynamic(output_shape[1]),
                    Dim::Fixed(output_shape[2]),
                ],
                profile: None,
            },
        ];
        specs.extend(self.auxiliary.iter().map(|(name, width)| TensorSpec {
            name: name.clone(),
            role: TensorRole::Output,
            dtype: self.dtype,
            shape: vec![fixed_or_dynamic(self.batch()), Dim::Fixed(*width)],
            profile: None,
        }));
        specs
    }

    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> Result<(), EngineError> {
        if name != SYNTHETIC_INPUT {
            return Err(EngineError::UnknownTensor(name.to_string()));
        }

        let accepted = shape.len() == self.input_dims.len()
            && self.input_dims.iter().zip(shape).all(|(d, &n)| d.accepts(n));
        if !accepted {
            return Err(EngineError::InvalidShape {
                name: name.to_string(),
                shape: shape.to_vec(),
                reason: format!("declared {:?}", self.input_dims),
            });
        }

        self.input_shape = shape.to_vec();
        Ok(())
    }

    fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError> {
        match name {
            SYNTHETIC_INPUT => Ok(self.input_shape.clone()),
            SYNTHETIC_OUTPUT => Ok(self.output_shape()),
            _ => self
                .auxiliary
                .iter()
                .find(|(aux, _)| aux == name)
                .map(|(_, width)| vec![self.batch(), *width])
                .ok_or_else(|| EngineError::UnknownTensor(name.to_string())),
        }
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError> {
        Ok(DeviceBuffer::host(bytes))
    }

    fn execute(&mut self, bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError> {
        if self.faults.take() {
            return Err(EngineError::Execution("injected device fault".to_string()));
        }

        for binding in bindings.iter_mut() {
            let expected = self.tensor_shape(binding.name)?;
            if binding.shape != expected.as_slice() {
                return Err(EngineError::Execution(format!(
                    "binding '{}' bound as {:?}, engine expects {:?}",
                    binding.name, binding.shape, expected
                )));
            }

            match binding.role {
                TensorRole::Input => self.last_input = binding.buffer.to_host()?,
                TensorRole::Output => {
                    let values = self.output_values(binding.name)?;
                    let bytes: Vec<u8> = match binding.dtype {
                        DataType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
                        DataType::F16 => values
                            .iter()
                            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                            .collect(),
                    };
                    binding.buffer.upload(&bytes)?;
                }
            }
        }

        self.executions += 1;
        Ok(())
    }

    fn set_inference_mode(&mut self, enabled: bool) {
        self.inference_mode = enabled;
    }
}
