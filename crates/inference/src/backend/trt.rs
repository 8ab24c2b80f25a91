use super::{
    buffer::{DeviceAddress, DeviceBuffer, DeviceMemory},
    engine::{BoundTensor, DataType, Dim, Engine, TensorRole, TensorSpec},
};
use crate::errors::EngineError;

#[cxx::bridge(namespace = "trtdetect")]
mod ffi {
    struct TensorDesc {
        name: String,
        is_input: bool,
        /// nvinfer1::DataType as an integer
        dtype: i32,
        dims: Vec<i64>,
        /// kOPT shape of profile 0, empty for outputs
        opt_dims: Vec<i64>,
    }

    unsafe extern "C++" {
        include!("trt_engine.hpp");

        type TrtEngineHandle;

        fn load_engine(path: &str, device_id: i32) -> Result<UniquePtr<TrtEngineHandle>>;

        fn describe(self: &TrtEngineHandle) -> Vec<TensorDesc>;

        fn set_input_shape(self: Pin<&mut TrtEngineHandle>, name: &str, dims: &[i64]) -> Result<()>;

        fn tensor_shape(self: &TrtEngineHandle, name: &str) -> Result<Vec<i64>>;

        fn set_tensor_address(self: Pin<&mut TrtEngineHandle>, name: &str, address: u64) -> Result<()>;

        /// enqueueV3 followed by a stream synchronize
        fn execute(self: Pin<&mut TrtEngineHandle>) -> Result<()>;

        fn device_alloc(bytes: usize) -> Result<u64>;

        unsafe fn device_free(address: u64);

        unsafe fn copy_to_device(address: u64, src: &[u8]) -> Result<()>;

        unsafe fn copy_to_host(address: u64, dst: &mut [u8]) -> Result<()>;
    }
}

// nvinfer1::DataType
const TRT_FLOAT: i32 = 0;
const TRT_HALF: i32 = 1;

/// cudaMalloc'd region, freed on drop.
struct CudaMemory {
    address: u64,
    len: usize,
}

impl DeviceMemory for CudaMemory {
    fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.address)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn upload(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        // SAFETY: address points to `len` bytes we own; the caller checked the length
        unsafe { ffi::copy_to_device(self.address, bytes) }
            .map_err(|e| EngineError::Execution(e.to_string()))
    }

    fn download(&self, out: &mut [u8]) -> Result<(), EngineError> {
        // SAFETY: as above
        unsafe { ffi::copy_to_host(self.address, out) }
            .map_err(|e| EngineError::Execution(e.to_string()))
    }
}

impl Drop for CudaMemory {
    fn drop(&mut self) {
        if self.address != 0 {
            // SAFETY: allocated by device_alloc and freed exactly once
            unsafe { ffi::device_free(self.address) };
        }
    }
}

/// Deserialized TensorRT engine with one execution context and stream.
pub struct TrtEngine {
    inner: cxx::UniquePtr<ffi::TrtEngineHandle>,
    specs: Vec<TensorSpec>,
}

// SAFETY: the handle owns its context and stream and is only driven
// through &mut self from one thread at a time.
unsafe impl Send for TrtEngine {}

impl TrtEngine {
    pub fn load(path: &str, device_id: i32) -> Result<Self, EngineError> {
        let inner = ffi::load_engine(path, device_id).map_err(|e| EngineError::Deserialize {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if inner.is_null() {
            return Err(EngineError::Deserialize {
                path: path.to_string(),
                reason: "runtime returned no engine".to_string(),
            });
        }

        let specs = inner
            .describe()
            .into_iter()
            .map(tensor_spec)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(path, device_id, tensors = specs.len(), "TensorRT engine loaded");
        Ok(Self { inner, specs })
    }
}

fn tensor_spec(desc: ffi::TensorDesc) -> Result<TensorSpec, EngineError> {
    let dtype = match desc.dtype {
        TRT_FLOAT => DataType::F32,
        TRT_HALF => DataType::F16,
        other => {
            return Err(EngineError::UnsupportedType {
                name: desc.name,
                dtype: format!("nvinfer1::DataType({other})"),
            });
        }
    };
    let profile = (!desc.opt_dims.is_empty())
        .then(|| desc.opt_dims.iter().map(|&d| d.max(1) as usize).collect());

    Ok(TensorSpec {
        role: if desc.is_input {
            TensorRole::Input
        } else {
            TensorRole::Output
        },
        dtype,
        shape: desc.dims.iter().map(|&d| Dim::from_declared(d)).collect(),
        profile,
        name: desc.name,
    })
}

impl Engine for TrtEngine {
    fn tensors(&self) -> Vec<TensorSpec> {
        self.specs.clone()
    }

    fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> Result<(), EngineError> {
        let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        self.inner
            .pin_mut()
            .set_input_shape(name, &dims)
            .map_err(|e| EngineError::InvalidShape {
                name: name.to_string(),
                shape: shape.to_vec(),
                reason: e.to_string(),
            })
    }

    fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError> {
        let dims = self
            .inner
            .tensor_shape(name)
            .map_err(|_| EngineError::UnknownTensor(name.to_string()))?;
        if dims.iter().any(|&d| d < 0) {
            return Err(EngineError::InvalidShape {
                name: name.to_string(),
                shape: Vec::new(),
                reason: format!("unresolved dimensions {dims:?}"),
            });
        }
        Ok(dims.iter().map(|&d| d as usize).collect())
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError> {
        let address = ffi::device_alloc(bytes).map_err(|e| EngineError::Allocation {
            bytes,
            reason: e.to_string(),
        })?;
        Ok(DeviceBuffer::new(CudaMemory {
            address,
            len: bytes,
        }))
    }

    fn execute(&mut self, bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError> {
        for binding in bindings.iter() {
            self.inner
                .pin_mut()
                .set_tensor_address(binding.name, binding.buffer.address().as_u64())
                .map_err(|e| EngineError::Execution(e.to_string()))?;
        }
        self.inner
            .pin_mut()
            .execute()
            .map_err(|e| EngineError::Execution(e.to_string()))
    }
}
