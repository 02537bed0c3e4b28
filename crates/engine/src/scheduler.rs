//! Batch fill, dispatch and completion
//!
//! The scheduler owns the inference queue and a shared handle to the slot
//! pool. Dispatch takes a free slot, fills up to `batch_size` queued units
//! into its input blob and hands it to the device. Completion reads the
//! output blob once, demultiplexes one batch item per unit back into the
//! owning tasks and returns the slot to the pool. In asynchronous mode the
//! completion runs on a runtime thread and only touches the pool, the task
//! counters and the task output frames.

use crate::function::ModelFunction;
use crate::queue::WorkQueue;
use crate::runtime::{Completion, DispatchRejected, InferRequest};
use crate::slot::{Slot, SlotId, SlotPool};
use crate::task::InferenceUnit;
use framebatch_common::{FrameBatchError, LatencyTimer, Result, METRICS};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// State reachable from the completion thread
pub(crate) struct Shared<Rq> {
    pool: SlotPool<Rq>,
    function: ModelFunction,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl<Rq: InferRequest> Shared<Rq> {
    /// Finish one dispatched slot and return it to the pool
    fn complete(&self, mut slot: Slot<Rq>, status: Result<()>) -> Result<()> {
        let units = slot.take_units();
        let id = slot.id();

        let result = match status {
            Ok(()) => METRICS
                .scheduler
                .completion_duration
                .time(|| self.demultiplex(slot.request_mut(), units)),
            Err(e) => {
                error!("Inference on slot {} failed: {}", id, e);
                fail_units(units);
                Err(e)
            }
        };

        self.pool.release(slot);
        result
    }

    fn demultiplex(&self, request: &mut Rq, units: Vec<InferenceUnit>) -> Result<()> {
        let Some(first) = units.first() else {
            error!("Completed slot holds no inference units");
            return Err(FrameBatchError::consistency("completed slot holds no inference units"));
        };

        let output_name = first.task().output_name().to_string();
        let output = match request.output_blob(&output_name) {
            Ok(output) => output,
            Err(e) => {
                error!(
                    "Output \"{}\" not found, valid outputs are: {}",
                    output_name,
                    self.output_names.join(", ")
                );
                fail_units(units);
                return Err(e);
            }
        };

        let batch = output.desc().batch;
        if units.len() > batch {
            error!(
                "Completion holds {} units but output \"{}\" has batch {}",
                units.len(),
                output_name,
                batch
            );
            let count = units.len();
            fail_units(units);
            return Err(FrameBatchError::consistency(format!(
                "{} units exceed output batch {}",
                count, batch
            )));
        }

        let mut first_error = None;
        for (i, unit) in units.into_iter().enumerate() {
            let result = output
                .item(i)
                .and_then(|item| self.function.demux_output(&unit, &item));
            if let Err(e) = result {
                warn!("Post-processing failed for task {}: {}", unit.task().id(), e);
                unit.task().mark_failed();
                first_error.get_or_insert(e);
            }
            unit.task().finish_unit();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Consume units that will never be demultiplexed
fn fail_units(units: Vec<InferenceUnit>) {
    for unit in units {
        unit.task().mark_failed();
        unit.task().finish_unit();
    }
}

/// Completion bound to one in-flight slot
pub(crate) struct SlotCompletion<Rq> {
    shared: Arc<Shared<Rq>>,
    id: SlotId,
    units: Vec<InferenceUnit>,
}

impl<Rq: InferRequest> Completion<Rq> for SlotCompletion<Rq> {
    fn complete(self, request: Rq, status: Result<()>) {
        let slot = Slot::from_parts(self.id, request, self.units);
        if let Err(e) = self.shared.complete(slot, status) {
            debug!("Completion of slot {} reported: {}", self.id, e);
        }
    }
}

/// Move up to `batch_size` queued units into the slot's input blob
///
/// Never waits for more work. A unit whose conversion fails is consumed, its
/// task marked failed, and filling goes on with the next unit. Only a
/// missing input blob fails the whole fill; units already in the slot stay
/// there for the caller to requeue or drop.
fn fill_slot<Rq: InferRequest>(
    function: &ModelFunction,
    input_names: &[String],
    queue: &mut WorkQueue<InferenceUnit>,
    slot: &mut Slot<Rq>,
    batch_size: usize,
) -> Result<()> {
    let Some(front) = queue.peek_front() else {
        return Ok(());
    };
    let input_name = front.task().input_name().to_string();

    let (request, units) = slot.parts_mut();
    let input = match request.input_blob(&input_name) {
        Ok(input) => input,
        Err(e) => {
            error!(
                "Input \"{}\" not found, valid inputs are: {}",
                input_name,
                input_names.join(", ")
            );
            return Err(e);
        }
    };

    let capacity = batch_size.min(input.desc().batch);
    while units.len() < capacity {
        let Some(unit) = queue.pop_front() else {
            break;
        };

        let result = input
            .item_mut(units.len())
            .and_then(|mut item| function.fill_input(&unit, &mut item));
        match result {
            Ok(()) => units.push(unit),
            Err(e) => {
                warn!("Failed to convert input of task {}: {}", unit.task().id(), e);
                fail_units(vec![unit]);
            }
        }
    }

    Ok(())
}

fn record_batch<Rq>(slot: &Slot<Rq>, mode: &str) {
    METRICS.scheduler.batches_dispatched.inc();
    METRICS
        .scheduler
        .batch_occupancy
        .observe(slot.inference_count() as f64);
    debug!(
        "Dispatching {} batch of {} units on slot {}",
        mode,
        slot.inference_count(),
        slot.id()
    );
}

/// Batching scheduler of one loaded model
pub struct BatchScheduler<Rq> {
    shared: Arc<Shared<Rq>>,

    /// Units awaiting a slot, FIFO across tasks
    queue: WorkQueue<InferenceUnit>,

    batch_size: usize,
}

impl<Rq: InferRequest> BatchScheduler<Rq> {
    pub fn new(
        slots: Vec<Slot<Rq>>,
        function: ModelFunction,
        input_names: Vec<String>,
        output_names: Vec<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: SlotPool::new(slots),
                function,
                input_names,
                output_names,
            }),
            queue: WorkQueue::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append units to the inference queue
    pub fn enqueue(&mut self, units: Vec<InferenceUnit>) -> Result<()> {
        let count = units.len();
        for unit in units {
            self.queue.push_back(unit)?;
        }
        METRICS.scheduler.units_queued.inc_by(count as u64);
        trace!("Queued {} units, {} pending", count, self.queue.len());
        Ok(())
    }

    /// Dispatch full batches while enough units are queued
    pub fn dispatch_ready(&mut self) -> Result<()> {
        while self.queue.len() >= self.batch_size {
            self.dispatch_async()?;
        }
        Ok(())
    }

    /// Dispatch whatever is queued, including a partial batch
    pub fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            trace!("Nothing to flush");
            return Ok(());
        }
        while !self.queue.is_empty() {
            self.dispatch_async()?;
        }
        Ok(())
    }

    /// Fill one slot from the inference queue and start it asynchronously
    fn dispatch_async(&mut self) -> Result<()> {
        let mut slot = self.acquire_slot()?;
        if self.queue.is_empty() {
            self.shared.pool.release(slot);
            return Ok(());
        }

        if let Err(e) = fill_slot(
            &self.shared.function,
            &self.shared.input_names,
            &mut self.queue,
            &mut slot,
            self.batch_size,
        ) {
            METRICS.scheduler.dispatch_failures.inc();
            error!("Failed to fill slot {}: {}", slot.id(), e);
            self.requeue(slot.take_units());
            self.shared.pool.release(slot);
            return Err(e);
        }
        if slot.is_empty() {
            debug!("No unit of slot {} could be converted", slot.id());
            self.shared.pool.release(slot);
            return Ok(());
        }

        record_batch(&slot, "async");
        let (id, request, units) = slot.into_parts();
        let completion = SlotCompletion {
            shared: Arc::clone(&self.shared),
            id,
            units,
        };

        if let Err(rejected) = request.infer_async(completion) {
            let DispatchRejected {
                request,
                completion,
                error,
            } = rejected;
            METRICS.scheduler.dispatch_failures.inc();
            error!("Failed to start inference on slot {}: {}", id, error);
            self.requeue(completion.units);
            self.shared.pool.release(Slot::from_parts(id, request, Vec::new()));
            return Err(error);
        }

        Ok(())
    }

    /// Run units to completion on the calling thread
    ///
    /// The units never enter the shared inference queue. Units left over
    /// after one batch, or units of a failed fill, are dropped.
    pub fn run_sync(&self, units: Vec<InferenceUnit>) -> Result<()> {
        let mut local = WorkQueue::new();
        for unit in units {
            local.push_back(unit)?;
        }

        let mut slot = self.acquire_slot()?;
        if local.is_empty() {
            self.shared.pool.release(slot);
            return Ok(());
        }

        if let Err(e) = fill_slot(
            &self.shared.function,
            &self.shared.input_names,
            &mut local,
            &mut slot,
            self.batch_size,
        ) {
            METRICS.scheduler.dispatch_failures.inc();
            error!("Failed to fill slot {}: {}", slot.id(), e);
            self.shared.pool.release(slot);
            return Err(e);
        }
        if slot.is_empty() {
            self.shared.pool.release(slot);
            return Err(FrameBatchError::invalid_input(
                "no inference unit could be converted",
            ));
        }
        if !local.is_empty() {
            warn!("{} units did not fit a synchronous batch", local.len());
        }

        record_batch(&slot, "sync");
        let status = METRICS
            .scheduler
            .inference_duration
            .time(|| slot.request_mut().infer());
        self.shared.complete(slot, status)
    }

    /// Put units back at the head of the inference queue in their original order
    fn requeue(&mut self, units: Vec<InferenceUnit>) {
        for unit in units.into_iter().rev() {
            let task = Arc::clone(unit.task());
            if let Err(e) = self.queue.push_front(unit) {
                error!("Failed to requeue a unit of task {}: {}", task.id(), e);
                task.mark_failed();
                task.finish_unit();
            }
        }
    }

    fn acquire_slot(&self) -> Result<Slot<Rq>> {
        self.shared.pool.acquire().ok_or_else(|| {
            error!(
                "No free execution slot, all {} are in flight",
                self.shared.pool.capacity()
            );
            FrameBatchError::resource_exhausted("no free execution slot")
        })
    }

    /// Whether `count` more units can be queued without waiting for a slot
    ///
    /// Units that only top up a partial batch never need a slot at
    /// submission time; work that completes a batch needs a free one.
    pub fn has_room_for(&self, count: usize) -> bool {
        count == 0 || self.queue.len() + count < self.batch_size || self.shared.pool.available() > 0
    }

    /// Units waiting for a slot
    pub fn pending_units(&self) -> usize {
        self.queue.len()
    }

    pub fn free_slots(&self) -> usize {
        self.shared.pool.available()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pool.in_flight()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Drop all queued units and free slots, returning how many of each
    ///
    /// Slots still in flight return to the pool when their completion runs
    /// and are released with it.
    pub fn drain(&mut self) -> (usize, usize) {
        let units = self.queue.drain().count();
        let slots = self.shared.pool.drain().len();
        (slots, units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat};
    use crate::function::FrameProcessor;
    use crate::runtime::Network;
    use crate::tensor::{convert, TensorViewMut};
    use crate::task::Task;
    use crate::testing::{gray_manifest, ManualRequest, ManualRuntime};

    fn scheduler(runtime: &ManualRuntime, nireq: usize, batch_size: usize) -> BatchScheduler<ManualRequest> {
        scheduler_for(runtime, ModelFunction::process_frame(), nireq, batch_size)
    }

    fn scheduler_for(
        runtime: &ManualRuntime,
        function: ModelFunction,
        nireq: usize,
        batch_size: usize,
    ) -> BatchScheduler<ManualRequest> {
        let mut network = runtime.network_from_manifest(gray_manifest(4, 4)).unwrap();
        network.set_batch_size(batch_size).unwrap();
        network.load("CPU").unwrap();
        let slots = (0..nireq)
            .map(|id| Slot::new(id, network.create_request().unwrap(), batch_size))
            .collect();
        BatchScheduler::new(
            slots,
            function,
            network.input_names(),
            network.output_names(),
            batch_size,
        )
    }

    fn submit(function: &ModelFunction, scheduler: &mut BatchScheduler<ManualRequest>) -> Arc<Task> {
        submit_frame(function, scheduler, Frame::new(4, 4, PixelFormat::Gray8))
    }

    fn submit_frame(
        function: &ModelFunction,
        scheduler: &mut BatchScheduler<ManualRequest>,
        input: Frame,
    ) -> Arc<Task> {
        let task = Arc::new(Task::new("x", "y", input, Frame::new(4, 4, PixelFormat::Gray8), true));
        let units = function.decompose(&task, None).unwrap();
        scheduler.enqueue(units).unwrap();
        task
    }

    #[test]
    fn test_in_flight_never_exceeds_pool() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 2, 1);
        let function = ModelFunction::process_frame();

        let tasks: Vec<_> = (0..3).map(|_| submit(&function, &mut scheduler)).collect();
        let err = scheduler.dispatch_ready().unwrap_err();
        assert!(matches!(err, FrameBatchError::ResourceExhausted(_)));
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(scheduler.pending_units(), 1);
        assert_eq!(runtime.max_pending(), 2);

        runtime.complete_all();
        scheduler.dispatch_ready().unwrap();
        runtime.complete_all();

        assert!(tasks.iter().all(|t| t.is_complete() && !t.is_failed()));
        assert_eq!(scheduler.free_slots(), 2);
        assert!(runtime.max_pending() <= 2);
    }

    #[test]
    fn test_partial_batch_waits_for_flush() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 1, 4);
        let function = ModelFunction::process_frame();

        let tasks: Vec<_> = (0..3).map(|_| submit(&function, &mut scheduler)).collect();
        scheduler.dispatch_ready().unwrap();
        assert_eq!(scheduler.pending_units(), 3);
        assert_eq!(runtime.pending(), 0);

        scheduler.flush().unwrap();
        assert_eq!(runtime.pending(), 1);
        assert_eq!(runtime.complete_all(), 1);

        assert!(tasks.iter().all(|t| t.inference_done() == 1));
        assert_eq!(scheduler.free_slots(), 1);
    }

    #[test]
    fn test_rejected_dispatch_requeues_in_order() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 1, 2);
        let function = ModelFunction::process_frame();

        let first = submit(&function, &mut scheduler);
        let second = submit(&function, &mut scheduler);
        runtime.set_reject_async(true);
        assert!(scheduler.dispatch_ready().is_err());
        assert_eq!(scheduler.pending_units(), 2);
        assert_eq!(scheduler.free_slots(), 1);
        assert_eq!(
            scheduler.queue.peek_front().map(|u| u.task().id()),
            Some(first.id())
        );

        runtime.set_reject_async(false);
        scheduler.dispatch_ready().unwrap();
        runtime.complete_all();
        assert!(first.is_complete() && second.is_complete());
    }

    #[test]
    fn test_device_failure_marks_tasks_failed() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 1, 1);
        let function = ModelFunction::process_frame();

        let task = submit(&function, &mut scheduler);
        runtime.set_fail_infer(true);
        scheduler.dispatch_ready().unwrap();
        runtime.complete_all();

        assert!(task.is_complete());
        assert!(task.is_failed());
        assert_eq!(scheduler.free_slots(), 1);
    }

    #[test]
    fn test_missing_output_fails_completion() {
        let runtime = ManualRuntime::new();
        let scheduler = scheduler(&runtime, 1, 1);
        let task = Arc::new(Task::new(
            "x",
            "missing",
            Frame::new(4, 4, PixelFormat::Gray8),
            Frame::new(4, 4, PixelFormat::Gray8),
            true,
        ));
        let units = ModelFunction::process_frame().decompose(&task, None).unwrap();

        assert!(scheduler.run_sync(units).is_err());
        assert!(task.is_failed());
        assert_eq!(scheduler.free_slots(), 1);
    }

    /// Refuses frames whose first pixel is saturated
    struct RejectSaturated;

    impl FrameProcessor for RejectSaturated {
        fn pre_process(&self, frame: &Frame, input: &mut TensorViewMut<'_>) -> Result<()> {
            if frame.data.first() == Some(&255) {
                return Err(FrameBatchError::invalid_input("saturated frame"));
            }
            convert::frame_to_tensor(frame, input)
        }
    }

    #[test]
    fn test_conversion_failure_only_fails_its_task() {
        let runtime = ManualRuntime::new();
        let function = ModelFunction::ProcessFrame(Arc::new(RejectSaturated));
        let mut scheduler = scheduler_for(&runtime, function.clone(), 1, 2);

        let mut saturated = Frame::new(4, 4, PixelFormat::Gray8);
        saturated.data.fill(255);
        let bad = submit_frame(&function, &mut scheduler, saturated);
        let good = submit(&function, &mut scheduler);

        scheduler.dispatch_ready().unwrap();
        assert!(bad.is_complete() && bad.is_failed());
        assert_eq!(scheduler.pending_units(), 0);
        assert_eq!(runtime.pending(), 1);

        runtime.complete_all();
        assert!(good.is_complete() && !good.is_failed());
        assert_eq!(scheduler.free_slots(), 1);
    }

    #[test]
    fn test_batch_of_failed_conversions_is_not_dispatched() {
        let runtime = ManualRuntime::new();
        let function = ModelFunction::ProcessFrame(Arc::new(RejectSaturated));
        let mut scheduler = scheduler_for(&runtime, function.clone(), 1, 1);

        let mut saturated = Frame::new(4, 4, PixelFormat::Gray8);
        saturated.data.fill(255);
        let bad = submit_frame(&function, &mut scheduler, saturated);

        scheduler.dispatch_ready().unwrap();
        assert!(bad.is_failed());
        assert_eq!(runtime.pending(), 0);
        assert_eq!(scheduler.free_slots(), 1);
    }

    #[test]
    fn test_room_for_units() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 1, 2);
        let function = ModelFunction::process_frame();

        submit(&function, &mut scheduler);
        submit(&function, &mut scheduler);
        scheduler.dispatch_ready().unwrap();
        assert_eq!(scheduler.free_slots(), 0);

        assert!(scheduler.has_room_for(0));
        assert!(scheduler.has_room_for(1));
        assert!(!scheduler.has_room_for(2));

        runtime.complete_all();
        assert!(scheduler.has_room_for(2));
    }

    #[test]
    fn test_drain_counts() {
        let runtime = ManualRuntime::new();
        let mut scheduler = scheduler(&runtime, 3, 4);
        let function = ModelFunction::process_frame();
        submit(&function, &mut scheduler);

        assert_eq!(scheduler.drain(), (3, 1));
        assert_eq!(scheduler.pending_units(), 0);
    }
}
