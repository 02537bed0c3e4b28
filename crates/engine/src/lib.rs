//! FrameBatch Engine
//!
//! Inference batching and scheduling core. Frames (or detected regions of
//! frames) are split into inference units, packed into fixed-size batches on
//! a bounded pool of execution slots, run on one accelerator device and
//! demultiplexed back into per-task results.

pub mod frame;
pub mod function;
pub mod model;
pub mod postproc;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod slot;
pub mod task;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testing;

pub use frame::{DetectionBBox, Frame, PixelFormat};
pub use function::{ClassifyPostProcessor, DetectPostProcessor, FrameProcessor, ModelFunction};
pub use model::{ExecParams, InputInfo, Model, PollResult, UnloadSummary};
pub use postproc::{ArgmaxClassifier, SsdDetector};
pub use runtime::{InferRequest, Network, ReferenceRuntime, Runtime};
pub use scheduler::BatchScheduler;
