use super::buffer::DeviceBuffer;
use crate::errors::EngineError;
use preprocess::PrecisionMode;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Input,
    Output,
}

/// Element type of an engine tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }

    pub fn precision(self) -> PrecisionMode {
        match self {
            DataType::F32 => PrecisionMode::Full,
            DataType::F16 => PrecisionMode::Half,
        }
    }
}

impl From<PrecisionMode> for DataType {
    fn from(mode: PrecisionMode) -> Self {
        match mode {
            PrecisionMode::Full => DataType::F32,
            PrecisionMode::Half => DataType::F16,
        }
    }
}

/// One dimension of a declared tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    /// Resolved at run time.
    Dynamic,
}

impl Dim {
    /// Runtimes report dynamic dimensions as a negative size.
    pub fn from_declared(size: i64) -> Self {
        if size < 0 {
            Dim::Dynamic
        } else {
            Dim::Fixed(size as usize)
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    pub fn accepts(self, size: usize) -> bool {
        match self {
            Dim::Fixed(n) => n == size,
            Dim::Dynamic => size > 0,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// A tensor as declared by the engine file.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub role: TensorRole,
    pub dtype: DataType,
    pub shape: Vec<Dim>,
    /// Optimal shape of the engine's default optimization profile, if any.
    pub profile: Option<Vec<usize>>,
}

impl TensorSpec {
    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|d| d.is_dynamic())
    }

    /// Concrete shape used before any resize: fixed dims as declared,
    /// dynamic dims from the profile, or 1 without a profile.
    pub fn resolved_shape(&self) -> Vec<usize> {
        let profile = self
            .profile
            .as_ref()
            .filter(|p| p.len() == self.shape.len());

        self.shape
            .iter()
            .enumerate()
            .map(|(i, dim)| match dim {
                Dim::Fixed(n) => *n,
                Dim::Dynamic => profile.map(|p| p[i]).unwrap_or(1),
            })
            .collect()
    }

    /// Whether `shape` fits this declaration (same rank, fixed dims equal).
    pub fn accepts(&self, shape: &[usize]) -> bool {
        shape.len() == self.shape.len()
            && self.shape.iter().zip(shape).all(|(dim, &n)| dim.accepts(n))
    }
}

/// A binding lent to [`Engine::execute`] for the duration of one pass.
pub struct BoundTensor<'a> {
    pub name: &'a str,
    pub role: TensorRole,
    pub dtype: DataType,
    pub shape: &'a [usize],
    pub buffer: &'a mut DeviceBuffer,
}

/// A loaded, executable network.
///
/// The backend owns exactly one engine and drives it from a single thread:
/// enumerate the declared tensors, fix input shapes, ask for the resulting
/// output shapes, allocate one buffer per tensor, then execute passes against
/// those buffers.
pub trait Engine: Send {
    fn tensors(&self) -> Vec<TensorSpec>;

    /// Fix the concrete shape of a dynamic input for subsequent passes.
    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> Result<(), EngineError>;

    /// Concrete shape of any tensor under the current input shapes.
    fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError>;

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError>;

    /// Run one pass. Blocks until the device has finished writing every
    /// output buffer.
    fn execute(&mut self, bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError>;

    /// Entered before and left after every pass. Runtimes without such a
    /// mode ignore it.
    fn set_inference_mode(&mut self, _enabled: bool) {}
}
