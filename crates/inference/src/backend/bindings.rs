use super::{
    buffer::{DeviceAddress, DeviceBuffer},
    engine::{BoundTensor, DataType, Dim, Engine, TensorRole, TensorSpec},
};
use crate::errors::{EngineError, InferenceError};
use std::collections::{BTreeMap, btree_map::Entry};

/// One engine tensor with its concrete shape and owned buffer.
#[derive(Debug)]
pub struct Binding {
    spec: TensorSpec,
    shape: Vec<usize>,
    buffer: DeviceBuffer,
}

impl Binding {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> TensorRole {
        self.spec.role
    }

    pub fn dtype(&self) -> DataType {
        self.spec.dtype
    }

    pub fn declared_shape(&self) -> &[Dim] {
        &self.spec.shape
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_dynamic(&self) -> bool {
        self.spec.is_dynamic()
    }

    pub fn address(&self) -> DeviceAddress {
        self.buffer.address()
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn download(&self) -> Result<Vec<u8>, EngineError> {
        self.buffer.to_host()
    }
}

fn byte_len(shape: &[usize], dtype: DataType) -> usize {
    shape.iter().product::<usize>() * dtype.size_bytes()
}

/// The engine's declared tensors, keyed by name, each backed by a buffer of
/// its current concrete shape.
#[derive(Debug)]
pub struct BindingTable {
    bindings: BTreeMap<String, Binding>,
}

impl BindingTable {
    /// Enumerate the engine's tensors, resolve dynamic input dimensions and
    /// allocate one buffer per tensor.
    pub fn build<E: Engine + ?Sized>(engine: &mut E) -> Result<Self, InferenceError> {
        let specs = engine.tensors();

        if specs.is_empty() {
            return Err(InferenceError::EngineLoad(
                "engine declares no bindings".to_string(),
            ));
        }
        for role in [TensorRole::Input, TensorRole::Output] {
            if !specs.iter().any(|s| s.role == role) {
                return Err(InferenceError::EngineLoad(format!(
                    "engine declares no {role:?} bindings"
                )));
            }
        }

        // Input shapes first: output shapes depend on them.
        for spec in specs.iter().filter(|s| s.role == TensorRole::Input) {
            if spec.is_dynamic() {
                engine
                    .set_input_shape(&spec.name, &spec.resolved_shape())
                    .map_err(load_error)?;
            }
        }

        let mut bindings = BTreeMap::new();
        for spec in specs {
            let shape = match spec.role {
                TensorRole::Input => spec.resolved_shape(),
                TensorRole::Output => engine.tensor_shape(&spec.name).map_err(load_error)?,
            };
            let buffer = engine
                .allocate(byte_len(&shape, spec.dtype))
                .map_err(load_error)?;

            tracing::debug!(
                name = %spec.name,
                role = ?spec.role,
                dtype = ?spec.dtype,
                shape = ?shape,
                address = %buffer.address(),
                "Allocated binding"
            );

            match bindings.entry(spec.name.clone()) {
                Entry::Occupied(_) => {
                    return Err(InferenceError::EngineLoad(format!(
                        "engine declares '{}' twice",
                        spec.name
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(Binding {
                        spec,
                        shape,
                        buffer,
                    });
                }
            }
        }

        Ok(Self { bindings })
    }

    /// Change the concrete shape of a dynamic input and re-derive every
    /// output shape from it.
    ///
    /// Returns `false` without touching anything when `new_shape` is already
    /// current. Buffers are only reallocated when their byte size changes.
    /// Either every binding moves to the new shape or, on error, none does
    /// and the engine is put back on the previous input shape.
    pub fn resize<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        name: &str,
        new_shape: &[usize],
    ) -> Result<bool, InferenceError> {
        let input = self
            .bindings
            .get(name)
            .ok_or_else(|| InferenceError::UnknownBinding(name.to_string()))?;

        if input.shape == new_shape {
            return Ok(false);
        }

        let old_shape = input.shape.clone();
        let mismatch = || InferenceError::ShapeMismatch {
            binding: name.to_string(),
            expected: old_shape.clone(),
            actual: new_shape.to_vec(),
        };
        if input.role() != TensorRole::Input || !input.spec.accepts(new_shape) {
            return Err(mismatch());
        }

        engine
            .set_input_shape(name, new_shape)
            .map_err(|e| match e {
                EngineError::InvalidShape { .. } => mismatch(),
                other => InferenceError::DeviceExecution(other),
            })?;

        let staged = match self.stage(engine, name, new_shape) {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(restore) = engine.set_input_shape(name, &old_shape) {
                    tracing::error!(
                        name,
                        shape = ?old_shape,
                        error = %restore,
                        "Failed to restore input shape after an aborted resize"
                    );
                }
                return Err(e);
            }
        };

        for (binding_name, shape, buffer) in staged {
            if let Some(binding) = self.bindings.get_mut(&binding_name) {
                tracing::debug!(name = %binding_name, from = ?binding.shape, to = ?shape, "Binding reshaped");
                binding.shape = shape;
                if let Some(buffer) = buffer {
                    binding.buffer = buffer;
                }
            }
        }

        Ok(true)
    }

    /// New shape, and a new buffer when the byte size changes, for every
    /// binding affected by moving `name` to `new_shape`. Nothing is committed.
    fn stage<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        name: &str,
        new_shape: &[usize],
    ) -> Result<Vec<(String, Vec<usize>, Option<DeviceBuffer>)>, InferenceError> {
        let mut staged = Vec::new();

        for binding in self.bindings.values() {
            let shape = if binding.name() == name {
                new_shape.to_vec()
            } else if binding.role() == TensorRole::Output {
                engine
                    .tensor_shape(binding.name())
                    .map_err(InferenceError::DeviceExecution)?
            } else {
                continue;
            };
            if shape == binding.shape {
                continue;
            }

            let bytes = byte_len(&shape, binding.dtype());
            let buffer = if bytes == binding.buffer.len() {
                None
            } else {
                Some(
                    engine
                        .allocate(bytes)
                        .map_err(InferenceError::DeviceExecution)?,
                )
            };
            staged.push((binding.name().to_string(), shape, buffer));
        }

        Ok(staged)
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Binding> {
        self.bindings
            .values()
            .filter(|b| b.role() == TensorRole::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Binding> {
        self.bindings
            .values()
            .filter(|b| b.role() == TensorRole::Output)
    }

    pub(crate) fn upload(&mut self, name: &str, bytes: &[u8]) -> Result<(), InferenceError> {
        self.bindings
            .get_mut(name)
            .ok_or_else(|| InferenceError::UnknownBinding(name.to_string()))?
            .buffer
            .upload(bytes)
            .map_err(InferenceError::DeviceExecution)
    }

    pub(crate) fn bound_tensors(&mut self) -> Vec<BoundTensor<'_>> {
        self.bindings
            .values_mut()
            .map(|binding| {
                let Binding {
                    spec,
                    shape,
                    buffer,
                } = binding;
                BoundTensor {
                    name: &spec.name,
                    role: spec.role,
                    dtype: spec.dtype,
                    shape,
                    buffer,
                }
            })
            .collect()
    }
}

fn load_error(e: EngineError) -> InferenceError {
    InferenceError::EngineLoad(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::SyntheticEngine;
    use preprocess::ImageSize;
    use std::cell::Cell;

    /// Synthetic engine whose allocator fails once `allocations_left` runs out.
    struct ExhaustibleEngine {
        inner: SyntheticEngine,
        allocations_left: Cell<Option<usize>>,
    }

    impl ExhaustibleEngine {
        fn new(inner: SyntheticEngine) -> Self {
            Self {
                inner,
                allocations_left: Cell::new(None),
            }
        }

        fn limit_allocations(&self, n: Option<usize>) {
            self.allocations_left.set(n);
        }
    }

    impl Engine for ExhaustibleEngine {
        fn tensors(&self) -> Vec<TensorSpec> {
            self.inner.tensors()
        }

        fn set_input_shape(&mut self, name: &str, shape: &[usize]) -> Result<(), EngineError> {
            self.inner.set_input_shape(name, shape)
        }

        fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError> {
            self.inner.tensor_shape(name)
        }

        fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError> {
            match self.allocations_left.get() {
                Some(0) => Err(EngineError::Allocation {
                    bytes,
                    reason: "out of device memory".to_string(),
                }),
                left => {
                    self.allocations_left.set(left.map(|n| n - 1));
                    self.inner.allocate(bytes)
                }
            }
        }

        fn execute(&mut self, bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError> {
            self.inner.execute(bindings)
        }
    }

    #[test]
    fn test_build_allocates_every_binding() {
        let mut engine = SyntheticEngine::new(ImageSize::square(640), 80);
        let table = BindingTable::build(&mut engine).unwrap();

        assert_eq!(table.len(), 2);
        let input = table.get("images").unwrap();
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(input.byte_len(), 3 * 640 * 640 * 4);

        let output = table.get("output0").unwrap();
        assert_eq!(output.shape(), &[1, 25200, 85]);
        assert_eq!(output.byte_len(), 25200 * 85 * 4);
    }

    #[test]
    fn test_dynamic_input_resolves_to_profile_shape() {
        let mut engine = SyntheticEngine::dynamic(ImageSize::new(320, 256), 2);
        let table = BindingTable::build(&mut engine).unwrap();

        let input = table.get("images").unwrap();
        assert!(input.is_dynamic());
        assert_eq!(input.shape(), &[1, 3, 256, 320]);
    }

    #[test]
    fn test_resize_to_current_shape_is_noop() {
        let mut engine = SyntheticEngine::dynamic(ImageSize::square(320), 2);
        let mut table = BindingTable::build(&mut engine).unwrap();
        let before: Vec<_> = table.outputs().map(|b| b.address()).collect();
        let input_address = table.get("images").unwrap().address();

        let changed = table.resize(&mut engine, "images", &[1, 3, 320, 320]).unwrap();

        assert!(!changed);
        let after: Vec<_> = table.outputs().map(|b| b.address()).collect();
        assert_eq!(before, after);
        assert_eq!(table.get("images").unwrap().address(), input_address);
    }

    #[test]
    fn test_resize_rederives_output_shapes() {
        let mut engine = SyntheticEngine::dynamic(ImageSize::square(320), 2);
        let mut table = BindingTable::build(&mut engine).unwrap();

        assert!(table.resize(&mut engine, "images", &[1, 3, 256, 416]).unwrap());

        let anchors = 3 * (32 * 52 + 16 * 26 + 8 * 13);
        assert_eq!(table.get("images").unwrap().shape(), &[1, 3, 256, 416]);
        assert_eq!(table.get("output0").unwrap().shape(), &[1, anchors, 7]);
        assert_eq!(table.get("output0").unwrap().byte_len(), anchors * 7 * 4);
    }

    #[test]
    fn test_resize_rejects_rank_and_fixed_dim_changes() {
        let mut engine = SyntheticEngine::dynamic(ImageSize::square(320), 2);
        let mut table = BindingTable::build(&mut engine).unwrap();

        assert!(matches!(
            table.resize(&mut engine, "images", &[1, 3, 320]),
            Err(InferenceError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            table.resize(&mut engine, "images", &[1, 4, 320, 320]),
            Err(InferenceError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            table.resize(&mut engine, "missing", &[1, 3, 320, 320]),
            Err(InferenceError::UnknownBinding(_))
        ));
        assert_eq!(table.get("images").unwrap().shape(), &[1, 3, 320, 320]);
    }

    #[test]
    fn test_static_input_cannot_be_resized() {
        let mut engine = SyntheticEngine::new(ImageSize::square(640), 80);
        let mut table = BindingTable::build(&mut engine).unwrap();

        let err = table
            .resize(&mut engine, "images", &[1, 3, 480, 640])
            .unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_bindings_iterate_in_name_order() {
        let mut engine = SyntheticEngine::new(ImageSize::square(64), 1)
            .with_auxiliary_output("zeta", 4)
            .with_auxiliary_output("alpha", 2);
        let table = BindingTable::build(&mut engine).unwrap();

        let names: Vec<_> = table.outputs().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "output0", "zeta"]);
        assert_eq!(table.inputs().count(), 1);
    }

    #[test]
    fn test_failed_resize_leaves_table_and_engine_untouched() {
        let mut engine = ExhaustibleEngine::new(SyntheticEngine::dynamic(ImageSize::square(320), 2));
        let mut table = BindingTable::build(&mut engine).unwrap();
        let addresses: Vec<_> = table.inputs().chain(table.outputs()).map(|b| b.address()).collect();

        // input buffer succeeds, output buffer fails
        engine.limit_allocations(Some(1));
        let err = table
            .resize(&mut engine, "images", &[1, 3, 640, 640])
            .unwrap_err();
        assert!(matches!(err, InferenceError::DeviceExecution(EngineError::Allocation { .. })));

        assert_eq!(table.get("images").unwrap().shape(), &[1, 3, 320, 320]);
        assert_eq!(table.get("output0").unwrap().shape(), &[1, 6300, 7]);
        assert_eq!(engine.tensor_shape("output0").unwrap(), vec![1, 6300, 7]);
        let after: Vec<_> = table.inputs().chain(table.outputs()).map(|b| b.address()).collect();
        assert_eq!(addresses, after);

        // the same request succeeds once memory is available again
        engine.limit_allocations(None);
        assert!(table.resize(&mut engine, "images", &[1, 3, 640, 640]).unwrap());
        assert_eq!(table.get("output0").unwrap().shape(), &[1, 25200, 7]);

        let mut bound = table.bound_tensors();
        engine.execute(&mut bound).unwrap();
    }
}
