//! Loaded model and its public operations
//!
//! A [`Model`] is created unloaded: the network is read and the options are
//! validated, but the executable and its execution slots are only created on
//! the first execution or probe call, once the input and output names are
//! known.
//!
//! Asynchronous results come back in submission order through
//! [`Model::poll_result`]; completion of each task is tracked by its own
//! counters, so a task whose units landed in different batches is reported
//! ready only after the last of them is demultiplexed.

use crate::frame::Frame;
use crate::function::ModelFunction;
use crate::queue::WorkQueue;
use crate::runtime::{Network, Runtime};
use crate::scheduler::BatchScheduler;
use crate::slot::Slot;
use crate::task::Task;
use crate::tensor::{DataType, Layout};
use framebatch_common::{BackendOptions, FrameBatchError, FunctionKind, Result, METRICS};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Inference request type of a runtime
pub type RequestOf<R> = <<R as Runtime>::Network as Network>::Request;

/// Parameters of one execution
#[derive(Debug, Clone)]
pub struct ExecParams {
    pub input_name: String,

    /// Exactly one output name is supported
    pub output_names: Vec<String>,

    pub input: Frame,

    /// Required for frame processing; analytics default to annotating a copy of the input
    pub output: Option<Frame>,

    /// Only classify regions with this detection label
    pub target: Option<String>,
}

impl ExecParams {
    pub fn new(input_name: impl Into<String>, output_name: impl Into<String>, input: Frame) -> Self {
        Self {
            input_name: input_name.into(),
            output_names: vec![output_name.into()],
            input,
            output: None,
            target: None,
        }
    }

    pub fn with_output(mut self, output: Frame) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_output_names(mut self, output_names: Vec<String>) -> Self {
        self.output_names = output_names;
        self
    }
}

/// Description of a model input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputInfo {
    pub channels: usize,

    /// `None` when the input accepts any size
    pub height: Option<usize>,
    pub width: Option<usize>,

    pub dtype: DataType,
}

/// State of the oldest submitted task
#[derive(Debug)]
pub enum PollResult {
    /// No task is pending
    Empty,

    /// The oldest task still has units in flight
    NotReady,

    Ready { input: Frame, output: Frame },

    /// The oldest task finished but at least one of its units failed
    Failed { input: Frame, output: Frame },
}

/// What [`Model::unload`] released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadSummary {
    pub slots_released: usize,
    pub units_dropped: usize,
    pub tasks_dropped: usize,
}

/// A network loaded for one function
pub struct Model<R: Runtime> {
    network: R::Network,
    function: ModelFunction,
    options: BackendOptions,
    nireq: usize,
    devices: Vec<String>,

    /// Created on the first execution
    scheduler: Option<BatchScheduler<RequestOf<R>>>,

    /// Asynchronous tasks awaiting [`Model::poll_result`]
    tasks: WorkQueue<Arc<Task>>,
}

fn reject<T>(err: FrameBatchError) -> Result<T> {
    error!("{}", err);
    Err(err)
}

impl<R: Runtime> Model<R> {
    /// Read a network and prepare it for `function`
    pub fn load(
        runtime: &R,
        model_path: impl AsRef<Path>,
        function: ModelFunction,
        options: BackendOptions,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let options = options.validate()?;

        let network = runtime.read_network(model_path).map_err(|e| {
            error!("Failed to read network from {}: {}", model_path.display(), e);
            e
        })?;

        let nireq = options.resolved_nireq();
        info!(
            "Read {} for {:?} with runtime {} (device {}, nireq {}, batch_size {})",
            model_path.display(),
            function.kind(),
            runtime.version(),
            options.device,
            nireq,
            options.batch_size
        );

        Ok(Self {
            network,
            function,
            options,
            nireq,
            devices: runtime.available_devices(),
            scheduler: None,
            tasks: WorkQueue::new(),
        })
    }

    pub fn function(&self) -> &ModelFunction {
        &self.function
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Number of execution slots the model runs with
    pub fn nireq(&self) -> usize {
        self.nireq
    }

    /// Whether the executable and its slots exist yet
    pub fn is_initialized(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Tasks awaiting [`Model::poll_result`]
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Units waiting for a free slot
    pub fn pending_units(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.pending_units())
    }

    /// Free execution slots; 0 before the first execution
    pub fn free_slots(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.free_slots())
    }

    /// Channels, size and precision of a model input
    pub fn input_info(&self, input_name: &str) -> Result<InputInfo> {
        let desc = self.network.input_desc(input_name).map_err(|e| {
            error!(
                "Could not find \"{}\" in model, all inputs are: \"{}\"",
                input_name,
                self.network.input_names().join("\", \"")
            );
            e
        })?;

        let fixed = !self.options.input_resizable;
        Ok(InputInfo {
            channels: desc.channels,
            height: fixed.then_some(desc.height),
            width: fixed.then_some(desc.width),
            dtype: desc.dtype,
        })
    }

    /// Output frame size for an input of `input_width`x`input_height`
    ///
    /// Runs one inference on placeholder frames. Resizable models are first
    /// reshaped to the given size; once the executable exists its input size
    /// is fixed.
    pub fn output_dims(
        &mut self,
        input_name: &str,
        input_width: usize,
        input_height: usize,
        output_name: &str,
    ) -> Result<(usize, usize)> {
        if self.function.kind() != FunctionKind::ProcessFrame {
            return reject(FrameBatchError::not_supported(
                "output dimensions can only be probed for frame processing models",
            ));
        }

        if self.options.input_resizable {
            if self.scheduler.is_none() {
                self.network
                    .reshape_input(input_name, input_height, input_width)
                    .map_err(|e| {
                        error!(
                            "Failed to reshape input \"{}\" to {}x{}: {}",
                            input_name, input_width, input_height, e
                        );
                        e
                    })?;
            } else {
                let desc = self.network.input_desc(input_name)?;
                if (desc.width, desc.height) != (input_width, input_height) {
                    return reject(FrameBatchError::config(format!(
                        "input \"{}\" is already fixed at {}x{}, cannot probe {}x{}",
                        input_name, desc.width, desc.height, input_width, input_height
                    )));
                }
            }
        }

        self.init_executable(input_name, output_name)?;

        let task = Arc::new(Task::new(
            input_name,
            output_name,
            Frame::placeholder(input_width, input_height),
            Frame::placeholder(input_width, input_height),
            false,
        ));
        let units = self.function.decompose(&task, None)?;
        self.scheduler_mut()?.run_sync(units)?;

        if !task.is_complete() || task.is_failed() {
            return reject(FrameBatchError::internal("output dimension probe did not complete"));
        }

        let (width, height) = task.output_dims();
        debug!(
            "Input {}x{} produces output {}x{}",
            input_width, input_height, width, height
        );
        Ok((width, height))
    }

    /// Run one task on the calling thread and return its frames
    pub fn execute_sync(&mut self, params: ExecParams) -> Result<(Frame, Frame)> {
        self.check_exec_params(&params)?;
        if self.function.kind() == FunctionKind::Classify {
            return reject(FrameBatchError::not_supported(
                "synchronous classification is not supported",
            ));
        }
        if self.options.batch_size > 1 {
            return reject(FrameBatchError::not_supported(
                "synchronous execution requires batch_size 1",
            ));
        }
        self.init_executable(&params.input_name, &params.output_names[0])?;

        let (task, target) = Self::create_task(params);
        let units = self.function.decompose(&task, target.as_deref())?;
        METRICS.scheduler.tasks_submitted.inc();

        if let Err(e) = self.scheduler_mut()?.run_sync(units) {
            METRICS.scheduler.tasks_failed.inc();
            return Err(e);
        }
        if task.is_failed() {
            METRICS.scheduler.tasks_failed.inc();
            return reject(FrameBatchError::device(format!("task {} failed", task.id())));
        }
        if !task.is_complete() {
            METRICS.scheduler.tasks_failed.inc();
            return reject(FrameBatchError::internal(format!(
                "task {} completed {} of {} units in one synchronous call",
                task.id(),
                task.inference_done(),
                task.inference_todo()
            )));
        }

        METRICS.scheduler.tasks_completed.inc();
        Ok(task.take_frames())
    }

    /// Queue one task and dispatch every full batch
    ///
    /// Returns `ResourceExhausted` without queueing anything when the task
    /// would complete a batch while every slot is in flight; submit the same
    /// work again once a task completes. Once `Ok` is returned the task is
    /// queued and comes back exactly once through [`Model::poll_result`].
    /// A task with no units is ready immediately. Units that could not be
    /// dispatched yet stay queued and go out with a later submission or
    /// [`Model::flush`].
    pub fn execute_async(&mut self, params: ExecParams) -> Result<()> {
        self.check_exec_params(&params)?;
        self.init_executable(&params.input_name, &params.output_names[0])?;

        let (task, target) = Self::create_task(params);
        let units = self.function.decompose(&task, target.as_deref())?;

        let has_room = self
            .scheduler
            .as_ref()
            .is_some_and(|s| s.has_room_for(units.len()));
        if !has_room {
            debug!("Every execution slot is in flight, task {} not queued", task.id());
            return Err(FrameBatchError::resource_exhausted(
                "every execution slot is in flight, submit again later",
            ));
        }

        self.tasks.push_back(Arc::clone(&task))?;
        METRICS.scheduler.tasks_submitted.inc();

        let scheduler = self.scheduler_mut()?;
        scheduler.enqueue(units)?;
        if let Err(e) = scheduler.dispatch_ready() {
            debug!("Task {} queued, dispatch deferred: {}", task.id(), e);
        }
        Ok(())
    }

    /// Take the oldest task if it has completed
    pub fn poll_result(&mut self) -> PollResult {
        let Some(task) = self.tasks.peek_front() else {
            return PollResult::Empty;
        };
        if !task.is_complete() {
            return PollResult::NotReady;
        }

        let Some(task) = self.tasks.pop_front() else {
            return PollResult::Empty;
        };
        let (input, output) = task.take_frames();
        if task.is_failed() {
            METRICS.scheduler.tasks_failed.inc();
            warn!("Task {} finished with failed inference units", task.id());
            PollResult::Failed { input, output }
        } else {
            METRICS.scheduler.tasks_completed.inc();
            PollResult::Ready { input, output }
        }
    }

    /// Dispatch queued units even if they do not fill a batch
    pub fn flush(&mut self) -> Result<()> {
        match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.flush(),
            None => Ok(()),
        }
    }

    /// Release every slot, queued unit and pending task
    pub fn unload(mut self) -> UnloadSummary {
        self.release()
    }

    fn release(&mut self) -> UnloadSummary {
        let tasks_dropped = self.tasks.drain().count();
        let (slots_released, units_dropped) = self
            .scheduler
            .take()
            .map_or((0, 0), |mut scheduler| scheduler.drain());

        let summary = UnloadSummary {
            slots_released,
            units_dropped,
            tasks_dropped,
        };
        if summary != UnloadSummary::default() {
            info!(
                "Unloaded model: {} slots released, {} units and {} tasks dropped",
                slots_released, units_dropped, tasks_dropped
            );
        }
        summary
    }

    fn check_exec_params(&self, params: &ExecParams) -> Result<()> {
        if params.input_name.is_empty() {
            return reject(FrameBatchError::invalid_input("an input name is required"));
        }
        match params.output_names.len() {
            0 => return reject(FrameBatchError::invalid_input("an output name is required")),
            1 => {}
            n => {
                return reject(FrameBatchError::not_supported(format!(
                    "{} outputs requested, only one output is supported",
                    n
                )))
            }
        }
        if !params.input.has_pixels() {
            return reject(FrameBatchError::invalid_input("input frame has no pixel data"));
        }
        if self.function.kind() == FunctionKind::ProcessFrame && params.output.is_none() {
            return reject(FrameBatchError::invalid_input(
                "frame processing requires an output frame",
            ));
        }
        if self.function.kind() == FunctionKind::Classify {
            if let Some(output) = &params.output {
                if output.detections != params.input.detections {
                    return reject(FrameBatchError::invalid_input(
                        "classification output frame must carry the input frame's detections",
                    ));
                }
            }
        }
        Ok(())
    }

    fn create_task(params: ExecParams) -> (Arc<Task>, Option<String>) {
        let ExecParams {
            input_name,
            mut output_names,
            input,
            output,
            target,
        } = params;
        let output = output.unwrap_or_else(|| input.clone());
        let output_name = output_names.swap_remove(0);
        let task = Arc::new(Task::new(input_name, output_name, input, output, true));
        (task, target)
    }

    /// Prepare the network, load it on the device and create the slots
    fn init_executable(&mut self, input_name: &str, output_name: &str) -> Result<()> {
        if self.scheduler.is_some() {
            return Ok(());
        }

        let batch_size = self.options.batch_size;
        if batch_size > 1 {
            self.network.set_batch_size(batch_size).map_err(|e| {
                error!("Failed to set batch size {}: {}", batch_size, e);
                e
            })?;
        }

        self.network.set_input_layout(input_name, Layout::Nhwc).map_err(|e| {
            error!(
                "Failed to set layout of input \"{}\", all inputs are: \"{}\": {}",
                input_name,
                self.network.input_names().join("\", \""),
                e
            );
            e
        })?;
        self.network.set_output_layout(output_name, Layout::Nhwc).map_err(|e| {
            error!(
                "Failed to set layout of output \"{}\", all outputs are: \"{}\": {}",
                output_name,
                self.network.output_names().join("\", \""),
                e
            );
            e
        })?;

        if self.function.kind() != FunctionKind::ProcessFrame {
            self.network
                .set_input_precision(input_name, DataType::UInt8)
                .map_err(|e| {
                    error!("Failed to set U8 precision on input \"{}\": {}", input_name, e);
                    e
                })?;
        }

        let device = self.options.device.clone();
        if let Err(e) = self.network.load(&device) {
            error!(
                "Failed to load network on device \"{}\": {}; available devices: {}",
                device,
                e,
                self.devices.join(", ")
            );
            return Err(e);
        }

        let mut slots = Vec::new();
        slots.try_reserve(self.nireq).map_err(|e| {
            FrameBatchError::resource_exhausted(format!("unable to allocate {} slots: {}", self.nireq, e))
        })?;
        for id in 0..self.nireq {
            let request = self.network.create_request().map_err(|e| {
                error!("Failed to create inference request {}: {}", id, e);
                e
            })?;
            slots.push(Slot::new(id, request, batch_size));
        }

        self.scheduler = Some(BatchScheduler::new(
            slots,
            self.function.clone(),
            self.network.input_names(),
            self.network.output_names(),
            batch_size,
        ));
        info!(
            "Model ready on {} with {} execution slots of batch {}",
            device, self.nireq, batch_size
        );
        Ok(())
    }

    fn scheduler_mut(&mut self) -> Result<&mut BatchScheduler<RequestOf<R>>> {
        self.scheduler
            .as_mut()
            .ok_or_else(|| FrameBatchError::internal("model executable is not initialized"))
    }
}

impl<R: Runtime> Drop for Model<R> {
    fn drop(&mut self) {
        self.release();
    }
}
