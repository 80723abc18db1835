//! # Konro
//!
//! An asynchronous **batch**ed inference runtime that turns a strictly
//! synchronous, single-stream accelerator engine into a concurrent service
//! for many independent callers.
//!
//! ## Overview
//!
//! The runtime solves two problems at once:
//!
//! - A tensor abstraction spanning two physically distinct memory spaces
//!   (host-addressable and accelerator-addressable) with lazy, minimal-copy
//!   synchronization between them.
//! - A producer/consumer execution core that accepts inference requests
//!   from arbitrary tasks, groups whatever is pending into batches to
//!   amortize fixed per-invocation overhead, executes each batch against
//!   one serialized device context, and delivers every result through its
//!   own one-shot future.
//!
//! ## Architecture
//!
//! The crate is built around a few key abstractions:
//!
//! ### Dual-memory tensors
//!
//! [`RawBuffer`] owns one host and one device allocation with reuse-or-grow
//! capacity semantics. [`Tensor`] layers shape, dtype, and a [`Location`]
//! state machine on top: `to_host`/`to_device` are the only sync points and
//! each performs at most one full-extent copy. Row-level writes bypass the
//! machinery so batches can be assembled cheaply.
//!
//! ### Engines
//!
//! An [`Engine`] is an opaque loaded model: named input/output tensor
//! bindings plus one `forward` operation serialized on a device [`Stream`].
//! The compute sits behind the [`engine::Executor`] trait; the built-in
//! executor interprets plan artifacts on an emulated device, and vendor
//! runtimes plug in at the same seam.
//!
//! ### Batching
//!
//! [`BatchInference`] owns one engine and its single consumer task. Any
//! number of producers call [`BatchInference::commit`] (or `commits`) and
//! get an [`Item`] future back immediately; the consumer drains the FIFO
//! queue up to the configured batch size, runs one forward pass, and
//! fulfills each request's slot independently — one failing row never
//! affects its siblings.
//!
//! ## Example
//!
//! ```ignore
//! use konro::{BatchInference, DeviceRegistry, Engine, Pipeline};
//!
//! let registry = DeviceRegistry::new(1);
//! let engine = Engine::load(registry.current(), "embedder.plan")?;
//! let inference = BatchInference::<EmbedPipeline, 8>::new(engine, EmbedPipeline::new());
//!
//! // from any task, any thread:
//! let embedding = inference.commit(face).await.await?;
//! ```

mod device;
mod dtype;
mod error;
mod memory;
mod tensor;

pub mod batch;
pub mod engine;

pub use batch::{BatchInference, Item, Pipeline};
pub use device::{Device, DeviceMemorySummary, DeviceRegistry, Stream};
pub use dtype::DType;
pub use engine::{Binding, BindingSpec, Engine, Executor};
pub use error::{Error, LoadError, Result};
pub use memory::{workspace, RawBuffer, Workspace};
pub use tensor::{Location, Tensor, TENSOR_FILE_MAGIC};
