//! The plan artifact: the serialized, executable form of a compiled model.
//!
//! Callers treat plans as opaque bytes produced by an external compilation
//! step; this module owns the codec and the interpreter that stands behind
//! the [`Executor`] seam on the emulated device. The graph vocabulary is
//! deliberately small — identity, per-element affine, and matmul — which is
//! enough to express deterministic embedder/classifier-style models.
//!
//! Layout (little-endian):
//!
//! ```text
//! u32 magic, u32 version, u32 max_batch,
//! u32 n_inputs,  n_inputs  x { u32 name_len, name, u32 dtype, u32 ndims, u32 dims[] },
//! u32 n_outputs, n_outputs x { ... },
//! u32 op, op payload
//! ```

use crate::dtype::DType;
use crate::engine::{Binding, BindingSpec, Executor};
use crate::error::{Error, LoadError, Result};
use crate::tensor::Cursor;

/// Magic number opening every plan artifact.
pub const PLAN_FILE_MAGIC: u32 = 0x4B4E_5250;

/// Current plan format version.
pub const PLAN_VERSION: u32 = 1;

/// The graph a plan executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Output 0 is a copy of input 0.
    Identity,
    /// Elementwise `y = scale * x + bias`.
    Affine { scale: f32, bias: f32 },
    /// Row-wise `y[n] = x[n] * W` with `W` of shape `[k, m]`.
    MatMul {
        k: usize,
        m: usize,
        weights: Vec<f32>,
    },
}

impl Op {
    fn code(&self) -> u32 {
        match self {
            Op::Identity => 0,
            Op::Affine { .. } => 1,
            Op::MatMul { .. } => 2,
        }
    }
}

/// A decoded plan artifact.
#[derive(Debug, Clone)]
pub struct Plan {
    pub max_batch: usize,
    pub inputs: Vec<BindingSpec>,
    pub outputs: Vec<BindingSpec>,
    pub op: Op,
}

impl Plan {
    /// Decodes and validates a plan artifact.
    pub fn decode(bytes: &[u8]) -> Result<Plan, LoadError> {
        let mut cursor = Cursor::new(bytes);

        let magic = cursor.u32()?;
        if magic != PLAN_FILE_MAGIC {
            return Err(LoadError::BadMagic {
                found: magic,
                expected: PLAN_FILE_MAGIC,
            });
        }
        let version = cursor.u32()?;
        if version != PLAN_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: version,
                expected: PLAN_VERSION,
            });
        }
        let max_batch = cursor.u32()? as usize;
        if max_batch == 0 {
            return Err(LoadError::Malformed("max_batch of zero".into()));
        }

        let inputs = decode_bindings(&mut cursor)?;
        let outputs = decode_bindings(&mut cursor)?;
        if inputs.is_empty() || outputs.is_empty() {
            return Err(LoadError::Malformed(
                "a plan needs at least one input and one output".into(),
            ));
        }

        let op = match cursor.u32()? {
            0 => Op::Identity,
            1 => Op::Affine {
                scale: cursor.f32()?,
                bias: cursor.f32()?,
            },
            2 => {
                let k = cursor.u32()? as usize;
                let m = cursor.u32()? as usize;
                // Bound the weight table by the bytes actually present before
                // allocating anything; k and m are untrusted.
                let byte_len = k
                    .checked_mul(m)
                    .and_then(|count| count.checked_mul(4))
                    .ok_or_else(|| {
                        LoadError::Malformed(format!(
                            "matmul weight table {k} x {m} overflows the addressable size"
                        ))
                    })?;
                let raw = cursor.take(byte_len)?;
                let weights = raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                Op::MatMul { k, m, weights }
            }
            code => {
                return Err(LoadError::Malformed(format!("unknown op code {code}")));
            }
        };

        let plan = Plan {
            max_batch,
            inputs,
            outputs,
            op,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), LoadError> {
        match &self.op {
            Op::Identity | Op::Affine { .. } => {
                if self.inputs[0].dims != self.outputs[0].dims {
                    return Err(LoadError::Malformed(format!(
                        "elementwise op needs matching shapes, got {:?} vs {:?}",
                        self.inputs[0].dims, self.outputs[0].dims
                    )));
                }
            }
            Op::MatMul { k, m, .. } => {
                let input = &self.inputs[0].dims;
                let output = &self.outputs[0].dims;
                if input.len() != 2 || input[1] != *k {
                    return Err(LoadError::Malformed(format!(
                        "matmul input must be [batch, {k}], got {input:?}"
                    )));
                }
                if output.len() != 2 || output[1] != *m {
                    return Err(LoadError::Malformed(format!(
                        "matmul output must be [batch, {m}], got {output:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serializes the plan to its binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PLAN_FILE_MAGIC.to_le_bytes());
        out.extend_from_slice(&PLAN_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.max_batch as u32).to_le_bytes());
        encode_bindings(&mut out, &self.inputs);
        encode_bindings(&mut out, &self.outputs);
        out.extend_from_slice(&self.op.code().to_le_bytes());
        match &self.op {
            Op::Identity => {}
            Op::Affine { scale, bias } => {
                out.extend_from_slice(&scale.to_le_bytes());
                out.extend_from_slice(&bias.to_le_bytes());
            }
            Op::MatMul { k, m, weights } => {
                out.extend_from_slice(&(*k as u32).to_le_bytes());
                out.extend_from_slice(&(*m as u32).to_le_bytes());
                for w in weights {
                    out.extend_from_slice(&w.to_le_bytes());
                }
            }
        }
        out
    }
}

fn decode_bindings(cursor: &mut Cursor<'_>) -> Result<Vec<BindingSpec>, LoadError> {
    let count = cursor.u32()? as usize;
    // No pre-allocation from the untrusted count: a hostile table length
    // runs out of bytes before it runs out of memory.
    let mut specs = Vec::new();
    for _ in 0..count {
        let name_len = cursor.u32()? as usize;
        let name = std::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| LoadError::Malformed("binding name is not utf-8".into()))?
            .to_string();
        let dtype_code = cursor.u32()?;
        let dtype =
            DType::from_code(dtype_code).ok_or(LoadError::UnsupportedDType(dtype_code))?;
        let ndims = cursor.u32()? as usize;
        if ndims == 0 {
            return Err(LoadError::Malformed(format!("binding {name:?} has rank 0")));
        }
        let raw = cursor.take(ndims.checked_mul(4).ok_or_else(|| {
            LoadError::Malformed(format!("binding {name:?} dimension table overflows"))
        })?)?;
        let dims = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as usize)
            .collect();
        specs.push(BindingSpec { name, dims, dtype });
    }
    Ok(specs)
}

fn encode_bindings(out: &mut Vec<u8>, specs: &[BindingSpec]) {
    out.extend_from_slice(&(specs.len() as u32).to_le_bytes());
    for spec in specs {
        out.extend_from_slice(&(spec.name.len() as u32).to_le_bytes());
        out.extend_from_slice(spec.name.as_bytes());
        out.extend_from_slice(&spec.dtype.code().to_le_bytes());
        out.extend_from_slice(&(spec.dims.len() as u32).to_le_bytes());
        for &dim in &spec.dims {
            out.extend_from_slice(&(dim as u32).to_le_bytes());
        }
    }
}

/// Fluent construction of plan artifacts, mainly for tests and tooling.
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    pub fn new(max_batch: usize) -> Self {
        Self {
            plan: Plan {
                max_batch,
                inputs: Vec::new(),
                outputs: Vec::new(),
                op: Op::Identity,
            },
        }
    }

    pub fn input(mut self, name: &str, dims: &[usize], dtype: DType) -> Self {
        self.plan.inputs.push(BindingSpec::new(name, dims, dtype));
        self
    }

    pub fn output(mut self, name: &str, dims: &[usize], dtype: DType) -> Self {
        self.plan.outputs.push(BindingSpec::new(name, dims, dtype));
        self
    }

    pub fn identity(mut self) -> Self {
        self.plan.op = Op::Identity;
        self
    }

    pub fn affine(mut self, scale: f32, bias: f32) -> Self {
        self.plan.op = Op::Affine { scale, bias };
        self
    }

    pub fn matmul(mut self, k: usize, m: usize, weights: Vec<f32>) -> Self {
        assert_eq!(weights.len(), k * m, "weight count must be k * m");
        self.plan.op = Op::MatMul { k, m, weights };
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.plan.encode()
    }
}

/// Interprets a [`Plan`] on the emulated device.
///
/// Inputs are moved to device memory, the graph runs over device buffers,
/// and outputs are left device-resident — exactly the residency a real
/// accelerator pass produces, so host-side readers go through the lazy sync.
pub struct PlanExecutor {
    plan: Plan,
}

impl PlanExecutor {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

impl Executor for PlanExecutor {
    fn max_batch(&self) -> usize {
        self.plan.max_batch
    }

    fn execute(&mut self, inputs: &mut [Binding], outputs: &mut [Binding]) -> Result<()> {
        let in_shape = inputs[0].tensor().shape().to_vec();
        let out_shape = outputs[0].tensor().shape().to_vec();
        let mismatch = || Error::ShapeMismatch {
            op: "plan execute",
            lhs: in_shape.clone(),
            rhs: out_shape.clone(),
        };

        let batch = in_shape[0];
        let x = inputs[0].tensor_mut().device_f32()?;
        let y = outputs[0].tensor_mut().device_f32()?;

        match &self.plan.op {
            Op::Identity => {
                if y.len() != x.len() {
                    return Err(mismatch());
                }
                y.copy_from_slice(x);
            }
            Op::Affine { scale, bias } => {
                if y.len() != x.len() {
                    return Err(mismatch());
                }
                for (out, v) in y.iter_mut().zip(x.iter()) {
                    *out = v * scale + bias;
                }
            }
            Op::MatMul { k, m, weights } => {
                if x.len() != batch * k || y.len() != batch * m {
                    return Err(mismatch());
                }
                for n in 0..batch {
                    for j in 0..*m {
                        let mut acc = 0.0f32;
                        for i in 0..*k {
                            acc += x[n * k + i] * weights[i * m + j];
                        }
                        y[n * m + j] = acc;
                    }
                }
            }
        }
        Ok(())
    }
}
