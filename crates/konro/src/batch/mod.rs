//! Request batching over a single engine.
//!
//! A strictly synchronous, single-stream engine becomes a concurrent
//! service here: arbitrarily many producers `commit` requests, a single
//! consumer task drains them in FIFO order, groups whatever is currently
//! queued (up to the configured maximum) into one batch, runs exactly one
//! forward pass, and fulfills each request's result slot independently.
//!
//! The loop never waits to accumulate a fuller batch — available work is
//! batched immediately, trading throughput for latency. Because the one
//! consumer task owns the engine, at most one forward pass is ever in
//! flight per engine and the device stream is never touched concurrently.
//!
//! Request lifecycle: Enqueued -> InBatch -> Executing -> Fulfilled.

mod item;
mod pill;
mod queue_item;
mod worker;

pub use item::Item;
pub use queue_item::QueueItem;
pub use worker::BatchWorkerHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Notify};

use crate::engine::Engine;
use crate::error::Result;
use pill::Pill;

/// The domain façade's pre/post-processing seam.
///
/// A façade wraps one engine plus a `Pipeline`: `write_input` maps one
/// domain input into row `row` of the engine's input tensors (typically via
/// [`crate::Tensor::offset`] and [`crate::Tensor::copy_from_host`]), and
/// `read_output` maps row `row` of the output tensors back into a domain
/// result after the pass. A row-level error fails only that request; the
/// sibling rows in the batch are unaffected.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    async fn write_input(
        &self,
        input: &Self::Input,
        engine: &mut Engine,
        row: usize,
    ) -> Result<()>;

    async fn read_output(&self, engine: &mut Engine, row: usize) -> Result<Self::Output>;
}

/// Batching worker for one engine: the `commit`/`commits` entry point.
///
/// `S` is the maximum batch size drained per cycle; it must not exceed the
/// engine's supported maximum. The worker task is shut down when this value
/// drops; requests still queued at that point resolve with
/// [`crate::Error::Canceled`].
pub struct BatchInference<P: Pipeline, const S: usize> {
    waiting: Arc<Mutex<Vec<QueueItem<P::Input, P::Output>>>>,
    handle: BatchWorkerHandle,
}

impl<P: Pipeline, const S: usize> BatchInference<P, S> {
    /// Takes ownership of the engine and spawns its consumer task.
    pub fn new(engine: Engine, pipeline: P) -> Self {
        assert!(S > 0, "batch size must be at least 1");
        assert!(
            S <= engine.max_batch_size(),
            "batch size {} exceeds engine max batch {}",
            S,
            engine.max_batch_size()
        );

        let waiting: Arc<Mutex<Vec<QueueItem<P::Input, P::Output>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let pill = Pill::new();
        let handle = BatchWorkerHandle::new({
            let waiting = waiting.clone();
            move |running, notifier| {
                tokio::spawn(async move {
                    let _pill = pill;
                    batch_loop::<P, S>(engine, pipeline, running, notifier, waiting).await;
                })
            }
        });

        Self { waiting, handle }
    }

    /// Enqueues one input and returns its result slot immediately.
    ///
    /// Never blocks on inference; safe to call from any number of
    /// concurrent tasks. Within one caller, successive commits keep their
    /// call order in the FIFO queue.
    pub async fn commit(&self, input: P::Input) -> Item<P::Output> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiting = self.waiting.lock().await;
            waiting.push(QueueItem::new(input, tx));
        }
        self.handle.notify();
        Item::new(rx)
    }

    /// Commits each input independently, preserving the supplied order.
    pub async fn commits(&self, inputs: Vec<P::Input>) -> Vec<Item<P::Output>> {
        let mut items = Vec::with_capacity(inputs.len());
        for input in inputs {
            items.push(self.commit(input).await);
        }
        items
    }
}

async fn batch_loop<P: Pipeline, const S: usize>(
    mut engine: Engine,
    pipeline: P,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    waiting: Arc<Mutex<Vec<QueueItem<P::Input, P::Output>>>>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let items = drain_waiting(S, &waiting).await;
        if items.is_empty() {
            // Park until work arrives; the timeout re-checks the running
            // flag so a missed notification cannot wedge the loop.
            let _ = tokio::time::timeout(Duration::from_millis(100), notifier.notified()).await;
            continue;
        }

        run_batch(&mut engine, &pipeline, items).await;
    }
    tracing::debug!("batch worker stopped");
}

/// Takes up to `max` requests off the front of the FIFO queue.
async fn drain_waiting<T>(max: usize, waiting: &Mutex<Vec<T>>) -> Vec<T> {
    let mut queue = waiting.lock().await;
    let take = max.min(queue.len());
    queue.drain(0..take).collect()
}

async fn run_batch<P: Pipeline>(
    engine: &mut Engine,
    pipeline: &P,
    items: Vec<QueueItem<P::Input, P::Output>>,
) {
    let batch = items.len();
    tracing::debug!(batch, "executing batch");

    for index in 0..engine.num_inputs() {
        engine
            .input(index)
            .resize_dim(0, batch)
            .expect("bindings are at least rank 1");
    }

    // Preprocess each row; a failing row is answered now and its slot
    // vacated, leaving siblings to execute.
    let mut slots: Vec<Option<QueueItem<P::Input, P::Output>>> =
        items.into_iter().map(Some).collect();
    for (row, slot) in slots.iter_mut().enumerate() {
        let item = slot.as_ref().expect("slot still occupied");
        if let Err(err) = pipeline.write_input(item.input(), engine, row).await {
            tracing::warn!(row, %err, "row preprocessing failed");
            let item = slot.take().expect("slot still occupied");
            let _ = item.into_sender().send(Err(err));
        }
    }
    if slots.iter().all(Option::is_none) {
        return;
    }

    // One forward pass for the whole batch. Device faults here are fatal:
    // there is no partial-batch recovery.
    if let Err(err) = engine.forward(true, true) {
        tracing::error!(%err, "device execution failed");
        panic!("device execution failed: {err}");
    }

    for (row, slot) in slots.into_iter().enumerate() {
        let Some(item) = slot else { continue };
        let result = pipeline.read_output(engine, row).await;
        if let Err(err) = &result {
            tracing::warn!(row, %err, "row postprocessing failed");
        }
        // A dropped receiver means the caller abandoned the future; the
        // row was executed regardless.
        let _ = item.into_sender().send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::dtype::DType;
    use crate::engine::plan::PlanBuilder;
    use crate::error::Error;

    /// Vec-of-floats façade over a `[batch, width]` plan.
    struct RowPipeline {
        width: usize,
    }

    #[async_trait]
    impl Pipeline for RowPipeline {
        type Input = Vec<f32>;
        type Output = Vec<f32>;

        async fn write_input(
            &self,
            input: &Vec<f32>,
            engine: &mut Engine,
            row: usize,
        ) -> Result<()> {
            if input.len() != self.width {
                return Err(Error::Preprocess(format!(
                    "expected {} values, got {}",
                    self.width,
                    input.len()
                )));
            }
            let tensor = engine.input(0);
            let offset = tensor.offset(&[row])? * tensor.element_size();
            let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
            tensor.copy_from_host(offset, &bytes)
        }

        async fn read_output(&self, engine: &mut Engine, row: usize) -> Result<Vec<f32>> {
            let tensor = engine.output(0);
            let offset = tensor.offset(&[row])?;
            let width = tensor.count(1);
            Ok(tensor.host_f32()?[offset..offset + width].to_vec())
        }
    }

    fn affine_engine(max_batch: usize, width: usize) -> Engine {
        let device = Device::new(0, 1 << 24);
        let bytes = PlanBuilder::new(max_batch)
            .input("x", &[1, width], DType::F32)
            .output("y", &[1, width], DType::F32)
            .affine(2.0, 0.5)
            .build();
        Engine::from_bytes(&device, &bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commit_resolves_with_model_output() {
        let inference =
            BatchInference::<RowPipeline, 4>::new(affine_engine(4, 2), RowPipeline { width: 2 });

        let item = inference.commit(vec![1.0, -1.0]).await;
        assert_eq!(item.await.unwrap(), vec![2.5, -1.5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commits_preserve_order() {
        let inference =
            BatchInference::<RowPipeline, 4>::new(affine_engine(4, 1), RowPipeline { width: 1 });

        let items = inference
            .commits(vec![vec![0.0], vec![1.0], vec![2.0]])
            .await;
        let results = futures::future::join_all(items).await;
        let values: Vec<f32> = results.into_iter().map(|r| r.unwrap()[0]).collect();
        assert_eq!(values, vec![0.5, 2.5, 4.5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bad_row_fails_alone() {
        let inference =
            BatchInference::<RowPipeline, 4>::new(affine_engine(4, 2), RowPipeline { width: 2 });

        let good = inference.commit(vec![1.0, 2.0]).await;
        let bad = inference.commit(vec![1.0]).await; // wrong width
        let also_good = inference.commit(vec![3.0, 4.0]).await;

        assert!(matches!(bad.await, Err(Error::Preprocess(_))));
        assert_eq!(good.await.unwrap(), vec![2.5, 4.5]);
        assert_eq!(also_good.await.unwrap(), vec![6.5, 8.5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_producers_all_resolve() {
        let inference = Arc::new(BatchInference::<RowPipeline, 4>::new(
            affine_engine(4, 1),
            RowPipeline { width: 1 },
        ));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let inference = inference.clone();
                tokio::spawn(async move {
                    let item = inference.commit(vec![i as f32]).await;
                    (i, item.await.unwrap())
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            let (i, output) = handle.unwrap();
            // each result equals a serial reference execution of its input
            assert_eq!(output, vec![i as f32 * 2.0 + 0.5]);
        }
    }

}
