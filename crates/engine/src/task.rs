//! Tasks and inference units
//!
//! A [`Task`] is one caller-visible request: a frame in, a frame out. It is
//! split into one or more [`InferenceUnit`]s, the grains the scheduler puts
//! into device batches. Units of one task may land in different batches and
//! complete on the runtime's thread, so the completion counters are atomics
//! and the frames sit behind mutexes.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Task identifier
pub type TaskId = Uuid;

/// One caller-visible unit of work
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    input_name: String,
    output_name: String,

    /// Run pixel conversion before and after inference
    do_ioproc: bool,

    input: Mutex<Frame>,
    output: Mutex<Frame>,

    inference_todo: AtomicUsize,
    inference_done: AtomicUsize,
    failed: AtomicBool,
}

impl Task {
    pub fn new(
        input_name: impl Into<String>,
        output_name: impl Into<String>,
        input: Frame,
        output: Frame,
        do_ioproc: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_name: input_name.into(),
            output_name: output_name.into(),
            do_ioproc,
            input: Mutex::new(input),
            output: Mutex::new(output),
            inference_todo: AtomicUsize::new(0),
            inference_done: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn do_ioproc(&self) -> bool {
        self.do_ioproc
    }

    pub fn inference_todo(&self) -> usize {
        self.inference_todo.load(Ordering::Acquire)
    }

    pub fn inference_done(&self) -> usize {
        self.inference_done.load(Ordering::Acquire)
    }

    /// Every unit of this task has been demultiplexed
    pub fn is_complete(&self) -> bool {
        self.inference_done() == self.inference_todo()
    }

    /// At least one unit failed to dispatch or post-process
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Set once, before any unit of the task is queued
    pub(crate) fn set_inference_todo(&self, todo: usize) {
        self.inference_todo.store(todo, Ordering::Release);
    }

    /// Account for one demultiplexed unit
    pub(crate) fn finish_unit(&self) {
        let done = self.inference_done.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            done <= self.inference_todo(),
            "task {} completed more units than it was split into",
            self.id
        );
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn with_input<R>(&self, f: impl FnOnce(&Frame) -> R) -> R {
        f(&self.input.lock())
    }

    pub(crate) fn with_output<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        f(&mut self.output.lock())
    }

    /// Current output frame dimensions
    pub fn output_dims(&self) -> (usize, usize) {
        let output = self.output.lock();
        (output.width, output.height)
    }

    /// Move the frames out, leaving empty frames behind
    pub(crate) fn take_frames(&self) -> (Frame, Frame) {
        let input = std::mem::take(&mut *self.input.lock());
        let output = std::mem::take(&mut *self.output.lock());
        (input, output)
    }
}

/// One atomic piece of device work
#[derive(Debug)]
pub struct InferenceUnit {
    task: Arc<Task>,

    /// Index of the detected region this unit covers
    bbox_index: Option<usize>,
}

impl InferenceUnit {
    /// A unit covering the whole frame
    pub(crate) fn whole_frame(task: Arc<Task>) -> Self {
        Self {
            task,
            bbox_index: None,
        }
    }

    /// A unit covering one detected region
    pub(crate) fn region(task: Arc<Task>, bbox_index: usize) -> Self {
        Self {
            task,
            bbox_index: Some(bbox_index),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn bbox_index(&self) -> Option<usize> {
        self.bbox_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn task() -> Arc<Task> {
        Arc::new(Task::new(
            "x",
            "y",
            Frame::new(2, 2, PixelFormat::Gray8),
            Frame::new(2, 2, PixelFormat::Gray8),
            true,
        ))
    }

    #[test]
    fn test_zero_unit_task_is_complete() {
        let task = task();
        task.set_inference_todo(0);
        assert!(task.is_complete());
    }

    #[test]
    fn test_completion_counter() {
        let task = task();
        task.set_inference_todo(2);
        assert!(!task.is_complete());

        task.finish_unit();
        assert!(!task.is_complete());
        task.finish_unit();
        assert!(task.is_complete());
        assert!(!task.is_failed());
    }

    #[test]
    fn test_units_complete_from_other_threads() {
        let task = task();
        task.set_inference_todo(8);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let unit = InferenceUnit::whole_frame(Arc::clone(&task));
                std::thread::spawn(move || unit.task().finish_unit())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(task.inference_done(), 8);
        assert!(task.is_complete());
    }

    #[test]
    fn test_take_frames() {
        let task = task();
        task.with_output(|frame| frame.data.fill(9));

        let (input, output) = task.take_frames();
        assert_eq!(input.width, 2);
        assert!(output.data.iter().all(|&p| p == 9));
        assert_eq!(task.output_dims(), (0, 0));
    }

    #[test]
    fn test_region_unit() {
        let unit = InferenceUnit::region(task(), 3);
        assert_eq!(unit.bbox_index(), Some(3));
        assert_eq!(unit.task().input_name(), "x");
    }
}
