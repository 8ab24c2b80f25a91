use crate::errors::EngineError;
use std::fmt;

/// Numeric handle of a device allocation as handed to the runtime's
/// execution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A memory region owned by an engine runtime.
///
/// Implementations free the region on drop. The address must stay stable for
/// the lifetime of the value.
pub trait DeviceMemory: Send {
    fn address(&self) -> DeviceAddress;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host to device copy. `bytes` must be exactly `len()` long.
    fn upload(&mut self, bytes: &[u8]) -> Result<(), EngineError>;

    /// Device to host copy. `out` must be exactly `len()` long.
    fn download(&self, out: &mut [u8]) -> Result<(), EngineError>;
}

/// Opaque, exclusively owned device allocation backing one binding.
///
/// There is no `Clone`: the only way to get at the address is through the
/// owning binding table, and a resize drops the old allocation.
pub struct DeviceBuffer {
    memory: Box<dyn DeviceMemory>,
}

impl DeviceBuffer {
    pub fn new(memory: impl DeviceMemory + 'static) -> Self {
        Self {
            memory: Box::new(memory),
        }
    }

    /// Zeroed host-resident buffer, for runtimes that execute on host memory.
    pub fn host(bytes: usize) -> Self {
        Self::new(HostMemory::zeroed(bytes))
    }

    pub fn address(&self) -> DeviceAddress {
        self.memory.address()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn upload(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        if bytes.len() != self.len() {
            return Err(EngineError::TransferSize {
                capacity: self.len(),
                requested: bytes.len(),
            });
        }
        self.memory.upload(bytes)
    }

    pub fn download(&self, out: &mut [u8]) -> Result<(), EngineError> {
        if out.len() != self.len() {
            return Err(EngineError::TransferSize {
                capacity: self.len(),
                requested: out.len(),
            });
        }
        self.memory.download(out)
    }

    pub fn to_host(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = vec![0u8; self.len()];
        self.download(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("address", &self.address())
            .field("len", &self.len())
            .finish()
    }
}

/// Host allocation standing in for device memory (CPU execution).
pub struct HostMemory {
    data: Box<[u8]>,
}

impl HostMemory {
    pub fn zeroed(bytes: usize) -> Self {
        Self {
            data: vec![0u8; bytes].into_boxed_slice(),
        }
    }
}

impl DeviceMemory for HostMemory {
    fn address(&self) -> DeviceAddress {
        DeviceAddress(self.data.as_ptr() as u64)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn upload(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.data.copy_from_slice(bytes);
        Ok(())
    }

    fn download(&self, out: &mut [u8]) -> Result<(), EngineError> {
        out.copy_from_slice(&self.data);
        Ok(())
    }
}
