//! Compiled-model execution.
//!
//! An [`Engine`] is an opaque handle to a loaded model: a set of named input
//! and output tensor bindings plus a single [`Engine::forward`] operation
//! that executes the graph against whatever is currently bound, serialized
//! on the engine's stream. The execution contract is exactly: write input
//! tensors, call `forward`, synchronize if the call was issued
//! asynchronously, read output tensors.
//!
//! The compute itself sits behind the [`Executor`] seam. The built-in
//! implementation interprets a plan artifact (see [`plan`]); a vendor
//! runtime backend would implement the same trait.

pub mod plan;

use std::fs;
use std::path::Path;

use crate::device::{Device, Stream};
use crate::dtype::DType;
use crate::error::{Error, LoadError, Result};
use crate::memory::{workspace, RawBuffer, Workspace};
use crate::tensor::Tensor;

/// Shape and dtype of one named binding slot, leading dimension included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl BindingSpec {
    pub fn new(name: impl Into<String>, dims: &[usize], dtype: DType) -> Self {
        Self {
            name: name.into(),
            dims: dims.to_vec(),
            dtype,
        }
    }
}

/// A named tensor slot on an engine.
pub struct Binding {
    name: String,
    tensor: Tensor,
}

impl Binding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }
}

/// The seam between the engine and whatever performs the compute.
///
/// Implementations run one forward pass over the bound tensors. They may
/// assume exclusive access: the engine is owned by a single worker and never
/// executes two passes concurrently.
pub trait Executor: Send {
    /// The largest leading dimension one pass supports.
    fn max_batch(&self) -> usize;

    /// Executes the graph once against the bound tensors.
    ///
    /// Recoverable faults (dtype/shape inconsistencies) surface as `Err`;
    /// device memory exhaustion mid-pass is fatal and panics.
    fn execute(&mut self, inputs: &mut [Binding], outputs: &mut [Binding]) -> Result<()>;
}

/// An opaque handle to a loaded, executable model.
pub struct Engine {
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
    executor: Box<dyn Executor>,
    device: Device,
    stream: Stream,
    workspace: Workspace,
}

impl Engine {
    /// Loads a plan artifact from disk.
    ///
    /// Every failure mode — missing file, foreign magic, stale version,
    /// truncation — is a recoverable [`LoadError`]; loading never panics.
    pub fn load(device: &Device, path: impl AsRef<Path>) -> Result<Engine, LoadError> {
        let bytes = fs::read(&path)?;
        let engine = Self::from_bytes(device, &bytes)?;
        tracing::info!(
            path = %path.as_ref().display(),
            inputs = engine.num_inputs(),
            outputs = engine.num_outputs(),
            max_batch = engine.max_batch_size(),
            "engine loaded"
        );
        Ok(engine)
    }

    /// Loads a plan artifact already resident in memory.
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> Result<Engine, LoadError> {
        let plan = plan::Plan::decode(bytes)?;
        let (input_specs, output_specs) = (plan.inputs.clone(), plan.outputs.clone());
        Ok(Self::with_executor(
            device,
            &input_specs,
            &output_specs,
            Box::new(plan::PlanExecutor::new(plan)),
        ))
    }

    /// Builds an engine around a custom [`Executor`]. This is the entry
    /// point for vendor runtime backends.
    pub fn with_executor(
        device: &Device,
        inputs: &[BindingSpec],
        outputs: &[BindingSpec],
        executor: Box<dyn Executor>,
    ) -> Engine {
        let stream = Stream::new(device);
        let shared = workspace(RawBuffer::new(device));
        let bind = |spec: &BindingSpec| {
            let mut tensor = Tensor::new(device, &spec.dims, spec.dtype);
            tensor.set_stream(stream.clone());
            tensor.set_workspace(shared.clone());
            Binding {
                name: spec.name.clone(),
                tensor,
            }
        };
        Engine {
            inputs: inputs.iter().map(bind).collect(),
            outputs: outputs.iter().map(bind).collect(),
            executor,
            device: device.clone(),
            stream,
            workspace: shared,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The input tensor bound at `index`. Indexes past the binding table
    /// are a caller bug and panic.
    pub fn input(&mut self, index: usize) -> &mut Tensor {
        &mut self.inputs[index].tensor
    }

    /// The output tensor bound at `index`.
    pub fn output(&mut self, index: usize) -> &mut Tensor {
        &mut self.outputs[index].tensor
    }

    pub fn input_named(&mut self, name: &str) -> Option<&mut Tensor> {
        self.inputs
            .iter_mut()
            .find(|b| b.name == name)
            .map(|b| &mut b.tensor)
    }

    pub fn output_named(&mut self, name: &str) -> Option<&mut Tensor> {
        self.outputs
            .iter_mut()
            .find(|b| b.name == name)
            .map(|b| &mut b.tensor)
    }

    /// Looks a binding up by name across inputs and outputs.
    pub fn tensor(&mut self, name: &str) -> Result<&mut Tensor> {
        let in_inputs = self.inputs.iter().any(|b| b.name == name);
        if in_inputs {
            return Ok(self.input_named(name).unwrap());
        }
        self.output_named(name)
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))
    }

    pub fn input_name(&self, index: usize) -> &str {
        &self.inputs[index].name
    }

    pub fn output_name(&self, index: usize) -> &str {
        &self.outputs[index].name
    }

    pub fn is_input_name(&self, name: &str) -> bool {
        self.inputs.iter().any(|b| b.name == name)
    }

    pub fn is_output_name(&self, name: &str) -> bool {
        self.outputs.iter().any(|b| b.name == name)
    }

    pub fn max_batch_size(&self) -> usize {
        self.executor.max_batch()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Scratch memory shared across this engine's bindings; valid for the
    /// duration of one forward call.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Executes the bound graph once.
    ///
    /// With `match_output_batch` set, every output's leading dimension is
    /// resized to the input leading dimension before execution, so variable
    /// batch sizes work without recompiling the model. With `synchronous`
    /// unset, the call returns once work is issued; the caller must
    /// [`Engine::synchronize`] before trusting host-side output reads.
    pub fn forward(&mut self, synchronous: bool, match_output_batch: bool) -> Result<()> {
        let batch = self.inputs[0].tensor.shape()[0];
        let max = self.executor.max_batch();
        if batch > max {
            return Err(Error::BatchTooLarge {
                requested: batch,
                max,
            });
        }
        if match_output_batch {
            for binding in &mut self.outputs {
                binding.tensor.resize_dim(0, batch)?;
            }
        }
        tracing::debug!(batch, synchronous, "forward");
        self.executor.execute(&mut self.inputs, &mut self.outputs)?;
        if synchronous {
            self.stream.synchronize();
        }
        Ok(())
    }

    /// Blocks until all work issued on this engine's stream completes.
    pub fn synchronize(&self) {
        self.stream.synchronize();
    }

    /// Human-readable binding dump.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "engine on device {} (max batch {})\n",
            self.device.id(),
            self.max_batch_size()
        );
        for binding in &self.inputs {
            out.push_str(&format!(
                "  input  {:<16} {} [{}]\n",
                binding.name,
                binding.tensor.shape_string(),
                binding.tensor.dtype()
            ));
        }
        for binding in &self.outputs {
            out.push_str(&format!(
                "  output {:<16} {} [{}]\n",
                binding.name,
                binding.tensor.shape_string(),
                binding.tensor.dtype()
            ));
        }
        out
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("device", &self.device.id())
            .field("inputs", &self.inputs.iter().map(|b| &b.name).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(|b| &b.name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::plan::PlanBuilder;
    use super::*;
    use crate::tensor::Location;

    fn device() -> Device {
        Device::new(0, 1 << 24)
    }

    fn affine_engine(device: &Device) -> Engine {
        let bytes = PlanBuilder::new(8)
            .input("x", &[1, 4], DType::F32)
            .output("y", &[1, 4], DType::F32)
            .affine(3.0, -1.0)
            .build();
        Engine::from_bytes(device, &bytes).unwrap()
    }

    #[test]
    fn load_rejects_missing_file() {
        let dev = device();
        assert!(matches!(
            Engine::load(&dev, "/nonexistent/model.plan"),
            Err(LoadError::Io(_))
        ));
    }

    #[test]
    fn forward_runs_affine_graph() {
        let dev = device();
        let mut engine = affine_engine(&dev);
        engine
            .input(0)
            .host_f32()
            .unwrap()
            .copy_from_slice(&[0.0, 1.0, 2.0, 3.0]);
        engine.forward(true, true).unwrap();

        assert_eq!(engine.output(0).location(), Location::Device);
        assert_eq!(
            engine.output(0).host_f32().unwrap(),
            &[-1.0, 2.0, 5.0, 8.0]
        );
    }

    #[test]
    fn forward_matches_output_batch_to_input() {
        let dev = device();
        let mut engine = affine_engine(&dev);
        engine.input(0).resize(&[3, 4]);
        engine.input(0).set_to(1.0);
        engine.forward(true, true).unwrap();

        assert_eq!(engine.output(0).shape(), &[3, 4]);
        assert_eq!(engine.output(0).host_f32().unwrap(), &[2.0f32; 12][..]);
    }

    #[test]
    fn forward_rejects_oversized_batch() {
        let dev = device();
        let mut engine = affine_engine(&dev);
        engine.input(0).resize(&[9, 4]);
        assert_eq!(
            engine.forward(true, true),
            Err(Error::BatchTooLarge {
                requested: 9,
                max: 8
            })
        );
    }

    #[test]
    fn binding_lookup_by_name() {
        let dev = device();
        let mut engine = affine_engine(&dev);
        assert!(engine.is_input_name("x"));
        assert!(engine.is_output_name("y"));
        assert_eq!(engine.input_name(0), "x");
        assert_eq!(engine.output_name(0), "y");
        assert!(engine.tensor("y").is_ok());
        assert_eq!(
            engine.tensor("z").unwrap_err(),
            Error::UnknownBinding("z".into())
        );
    }

    #[test]
    fn matmul_plan_end_to_end() {
        let dev = device();
        // W = [[1, 0], [0, 2], [1, 1]]: y = [x0 + x2, 2*x1 + x2]
        let bytes = PlanBuilder::new(4)
            .input("features", &[1, 3], DType::F32)
            .output("embedding", &[1, 2], DType::F32)
            .matmul(3, 2, vec![1.0, 0.0, 0.0, 2.0, 1.0, 1.0])
            .build();
        let mut engine = Engine::from_bytes(&dev, &bytes).unwrap();
        engine
            .input(0)
            .host_f32()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0]);
        engine.forward(true, true).unwrap();
        assert_eq!(engine.output(0).host_f32().unwrap(), &[4.0, 7.0]);
    }

    #[test]
    fn describe_names_bindings() {
        let dev = device();
        let engine = affine_engine(&dev);
        let text = engine.describe();
        assert!(text.contains("input  x"));
        assert!(text.contains("output y"));
    }
}
