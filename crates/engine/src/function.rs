//! Model functions
//!
//! A model is loaded for one of three functions. Each [`ModelFunction`]
//! variant carries the hooks for that function and owns the three
//! function-specific steps of the pipeline: splitting a task into inference
//! units, writing a unit into its batch item, and writing a batch item's
//! output back into the task.

use crate::frame::{DetectionBBox, Frame};
use crate::task::{InferenceUnit, Task};
use crate::tensor::convert;
use crate::tensor::{TensorView, TensorViewMut};
use framebatch_common::{FrameBatchError, FunctionKind, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Pixel conversion for frame processing models
///
/// The defaults use the stock conversions in [`convert`].
pub trait FrameProcessor: Send + Sync {
    fn pre_process(&self, frame: &Frame, input: &mut TensorViewMut<'_>) -> Result<()> {
        convert::frame_to_tensor(frame, input)
    }

    fn post_process(&self, output: &TensorView<'_>, frame: &mut Frame) -> Result<()> {
        convert::tensor_to_frame(output, frame)
    }
}

/// Stock frame conversion in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFrameProcessor;

impl FrameProcessor for DefaultFrameProcessor {}

/// Post-processing of a detection model
pub trait DetectPostProcessor: Send + Sync {
    fn pre_process(&self, frame: &Frame, input: &mut TensorViewMut<'_>) -> Result<()> {
        convert::frame_to_tensor(frame, input)
    }

    /// Turn one batch item of the output into detections on `frame`
    fn post_process(&self, output: &TensorView<'_>, frame: &mut Frame) -> Result<()>;
}

/// Post-processing of a classification model
pub trait ClassifyPostProcessor: Send + Sync {
    fn pre_process(&self, frame: &Frame, bbox: &DetectionBBox, input: &mut TensorViewMut<'_>) -> Result<()> {
        convert::crop_to_tensor(frame, bbox, input)
    }

    /// Attach the result for one region to `frame.detections[bbox_index]`
    fn post_process(&self, output: &TensorView<'_>, frame: &mut Frame, bbox_index: usize) -> Result<()>;
}

/// Function a model is loaded for, with its hooks
#[derive(Clone)]
pub enum ModelFunction {
    ProcessFrame(Arc<dyn FrameProcessor>),
    Detect(Arc<dyn DetectPostProcessor>),
    Classify(Arc<dyn ClassifyPostProcessor>),
}

impl ModelFunction {
    /// Frame processing with the stock conversions
    pub fn process_frame() -> Self {
        ModelFunction::ProcessFrame(Arc::new(DefaultFrameProcessor))
    }

    pub fn detect(post_processor: impl DetectPostProcessor + 'static) -> Self {
        ModelFunction::Detect(Arc::new(post_processor))
    }

    pub fn classify(post_processor: impl ClassifyPostProcessor + 'static) -> Self {
        ModelFunction::Classify(Arc::new(post_processor))
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            ModelFunction::ProcessFrame(_) => FunctionKind::ProcessFrame,
            ModelFunction::Detect(_) => FunctionKind::Detect,
            ModelFunction::Classify(_) => FunctionKind::Classify,
        }
    }

    /// Split a task into inference units and record how many it needs
    ///
    /// Classification creates one unit per detected region that is inside
    /// the frame, still has room for a label and, when `target` is given,
    /// carries that detection label (case-insensitive). A frame with no such
    /// region yields no units and the task is complete immediately.
    pub(crate) fn decompose(&self, task: &Arc<Task>, target: Option<&str>) -> Result<Vec<InferenceUnit>> {
        let units = match self {
            ModelFunction::ProcessFrame(_) | ModelFunction::Detect(_) => {
                let mut units = Vec::new();
                reserve(&mut units, 1)?;
                units.push(InferenceUnit::whole_frame(Arc::clone(task)));
                units
            }
            ModelFunction::Classify(_) => {
                let regions: Vec<usize> = task.with_input(|frame| {
                    frame
                        .detections
                        .iter()
                        .enumerate()
                        .filter(|(_, bbox)| bbox.is_classifiable_in(frame))
                        .filter(|(_, bbox)| {
                            target.map_or(true, |t| bbox.detect_label.eq_ignore_ascii_case(t))
                        })
                        .map(|(index, _)| index)
                        .collect()
                });

                let mut units = Vec::new();
                reserve(&mut units, regions.len())?;
                units.extend(
                    regions
                        .into_iter()
                        .map(|index| InferenceUnit::region(Arc::clone(task), index)),
                );
                debug!("Task {} has {} regions to classify", task.id(), units.len());
                units
            }
        };

        task.set_inference_todo(units.len());
        Ok(units)
    }

    /// Write one unit into its batch item
    pub(crate) fn fill_input(&self, unit: &InferenceUnit, input: &mut TensorViewMut<'_>) -> Result<()> {
        let task = unit.task();
        match self {
            ModelFunction::ProcessFrame(processor) => {
                if !task.do_ioproc() {
                    return Ok(());
                }
                task.with_input(|frame| processor.pre_process(frame, input))
            }
            ModelFunction::Detect(processor) => task.with_input(|frame| processor.pre_process(frame, input)),
            ModelFunction::Classify(processor) => {
                let index = region_index(unit)?;
                task.with_input(|frame| {
                    let bbox = frame.detections.get(index).ok_or_else(|| missing_region(index))?;
                    processor.pre_process(frame, bbox, input)
                })
            }
        }
    }

    /// Write one batch item of the output back into the unit's task
    pub(crate) fn demux_output(&self, unit: &InferenceUnit, output: &TensorView<'_>) -> Result<()> {
        let task = unit.task();
        match self {
            ModelFunction::ProcessFrame(processor) => task.with_output(|frame| {
                if task.do_ioproc() {
                    processor.post_process(output, frame)
                } else {
                    frame.width = output.width();
                    frame.height = output.height();
                    trace!("Task {} output is {}x{}", task.id(), frame.width, frame.height);
                    Ok(())
                }
            }),
            ModelFunction::Detect(processor) => task.with_output(|frame| processor.post_process(output, frame)),
            ModelFunction::Classify(processor) => {
                let index = region_index(unit)?;
                task.with_output(|frame| processor.post_process(output, frame, index))
            }
        }
    }
}

impl fmt::Debug for ModelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelFunction").field(&self.kind()).finish()
    }
}

fn reserve(units: &mut Vec<InferenceUnit>, additional: usize) -> Result<()> {
    units.try_reserve(additional).map_err(|e| {
        FrameBatchError::resource_exhausted(format!("unable to allocate {} inference units: {}", additional, e))
    })
}

fn region_index(unit: &InferenceUnit) -> Result<usize> {
    unit.bbox_index()
        .ok_or_else(|| FrameBatchError::internal("classification unit without a region index"))
}

fn missing_region(index: usize) -> FrameBatchError {
    FrameBatchError::invalid_input(format!("frame has no detected region {}", index))
}
