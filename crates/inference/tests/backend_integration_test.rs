use inference::{
    InferenceBackend, InferenceError,
    backend::{
        BindingTable, DataType, Dim, Engine, TensorRole, TensorSpec,
        buffer::DeviceBuffer,
        engine::BoundTensor,
        synthetic::SyntheticEngine,
    },
    errors::EngineError,
};
use preprocess::{ImageSize, InputTensor, PrecisionMode};

fn output_shapes<E: Engine>(backend: &InferenceBackend<E>) -> Vec<Vec<usize>> {
    backend
        .bindings()
        .outputs()
        .map(|b| b.shape().to_vec())
        .collect()
}

/// Resizing a dynamic input A -> B -> A gives back A's output shapes.
#[test]
fn test_resize_round_trip_restores_output_shapes() {
    let engine = SyntheticEngine::dynamic(ImageSize::square(640), 80)
        .with_auxiliary_output("proto", 32);
    let mut backend = InferenceBackend::new(engine).unwrap();

    let a = [1, 3, 384, 640];
    let b = [2, 3, 640, 480];

    let outputs_a = backend
        .forward(InputTensor::zeros(&a, PrecisionMode::Full))
        .unwrap();
    let shapes_a = output_shapes(&backend);

    let outputs_b = backend
        .forward(InputTensor::zeros(&b, PrecisionMode::Full))
        .unwrap();
    assert_ne!(output_shapes(&backend), shapes_a);
    assert_eq!(outputs_b[1].data.shape()[0], 2);

    let outputs_again = backend
        .forward(InputTensor::zeros(&a, PrecisionMode::Full))
        .unwrap();

    assert_eq!(output_shapes(&backend), shapes_a);
    for (first, again) in outputs_a.iter().zip(&outputs_again) {
        assert_eq!(first.name, again.name);
        assert_eq!(first.data.shape(), again.data.shape());
    }
}

#[test]
fn test_same_shape_forward_keeps_buffers() {
    let engine = SyntheticEngine::dynamic(ImageSize::square(320), 2);
    let mut backend = InferenceBackend::new(engine).unwrap();
    let addresses = |backend: &InferenceBackend<SyntheticEngine>| {
        backend
            .bindings()
            .inputs()
            .chain(backend.bindings().outputs())
            .map(|b| b.address())
            .collect::<Vec<_>>()
    };

    let before = addresses(&backend);
    for _ in 0..3 {
        backend
            .forward(InputTensor::zeros(&[1, 3, 320, 320], PrecisionMode::Full))
            .unwrap();
    }

    assert_eq!(addresses(&backend), before);
}

#[test]
fn test_warmup_runs_on_the_resolved_input_shape() {
    let engine = SyntheticEngine::dynamic(ImageSize::new(256, 128), 2)
        .with_precision(PrecisionMode::Half);
    let mut backend = InferenceBackend::new(engine).unwrap();

    backend.warmup().unwrap();

    assert_eq!(backend.input_shape(), &[1, 3, 128, 256]);
    assert_eq!(backend.engine().executions(), 1);
    assert_eq!(backend.engine().last_input().len(), 3 * 128 * 256 * 2);
}

/// Engine declaring a fixed interface and nothing else.
struct FixedEngine {
    tensors: Vec<TensorSpec>,
}

impl FixedEngine {
    fn new(tensors: Vec<TensorSpec>) -> Self {
        Self { tensors }
    }
}

impl Engine for FixedEngine {
    fn tensors(&self) -> Vec<TensorSpec> {
        self.tensors.clone()
    }

    fn set_input_shape(&mut self, name: &str, _shape: &[usize]) -> Result<(), EngineError> {
        Err(EngineError::UnknownTensor(name.to_string()))
    }

    fn tensor_shape(&mut self, name: &str) -> Result<Vec<usize>, EngineError> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.resolved_shape())
            .ok_or_else(|| EngineError::UnknownTensor(name.to_string()))
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, EngineError> {
        Ok(DeviceBuffer::host(bytes))
    }

    fn execute(&mut self, _bindings: &mut [BoundTensor<'_>]) -> Result<(), EngineError> {
        Ok(())
    }
}

fn tensor(name: &str, role: TensorRole, shape: &[usize]) -> TensorSpec {
    TensorSpec {
        name: name.to_string(),
        role,
        dtype: DataType::F32,
        shape: shape.iter().map(|&n| Dim::Fixed(n)).collect(),
        profile: None,
    }
}

#[test]
fn test_engine_without_bindings_fails_to_load() {
    let err = BindingTable::build(&mut FixedEngine::new(Vec::new())).unwrap_err();
    assert!(matches!(err, InferenceError::EngineLoad(_)));
    assert!(err.is_fatal());

    let no_outputs = vec![tensor("images", TensorRole::Input, &[1, 3, 8, 8])];
    assert!(matches!(
        InferenceBackend::new(FixedEngine::new(no_outputs)),
        Err(InferenceError::EngineLoad(_))
    ));
}

#[test]
fn test_first_input_is_used_when_none_is_named_images() {
    let engine = FixedEngine::new(vec![
        tensor("input_b", TensorRole::Input, &[1, 3, 4, 4]),
        tensor("input_a", TensorRole::Input, &[1, 3, 8, 8]),
        tensor("scores", TensorRole::Output, &[1, 10, 6]),
    ]);

    let backend = InferenceBackend::new(engine).unwrap();

    assert_eq!(backend.input_name(), "input_a");
    assert_eq!(backend.input_shape(), &[1, 3, 8, 8]);
    assert!(!backend.is_dynamic());
}
