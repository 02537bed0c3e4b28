//! Stock analytics post-processing
//!
//! [`SsdDetector`] reads the common `[image_id, label, confidence, x0, y0,
//! x1, y1]` detection-output rows. [`ArgmaxClassifier`] attaches the best
//! scoring class of a region.

use crate::frame::{DetectionBBox, Frame};
use crate::function::{ClassifyPostProcessor, DetectPostProcessor};
use crate::tensor::TensorView;
use framebatch_common::{FrameBatchError, Result};
use tracing::trace;

/// Values per detection row
const DETECTION_ROW: usize = 7;

fn label_name(labels: &[String], id: usize) -> String {
    labels.get(id).cloned().unwrap_or_else(|| id.to_string())
}

/// Detection-output decoder
#[derive(Debug, Clone)]
pub struct SsdDetector {
    pub confidence_threshold: f32,
    pub labels: Vec<String>,
}

impl SsdDetector {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            labels: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

impl DetectPostProcessor for SsdDetector {
    /// Rows run along the height axis; a negative image id ends the list
    fn post_process(&self, output: &TensorView<'_>, frame: &mut Frame) -> Result<()> {
        if output.width() != DETECTION_ROW || output.channels() != 1 {
            return Err(FrameBatchError::tensor(format!(
                "detection output must have rows of {} values, got {}x{}",
                DETECTION_ROW,
                output.channels(),
                output.width()
            )));
        }

        let (width, height) = (frame.width as f32, frame.height as f32);
        for row in 0..output.height() {
            let value = |col: usize| output.get(row, col, 0);
            if value(0) < 0.0 {
                break;
            }

            let confidence = value(2);
            if confidence < self.confidence_threshold {
                continue;
            }

            let x0 = (value(3) * width).clamp(0.0, width);
            let y0 = (value(4) * height).clamp(0.0, height);
            let x1 = (value(5) * width).clamp(0.0, width);
            let y1 = (value(6) * height).clamp(0.0, height);
            let label = label_name(&self.labels, value(1).max(0.0) as usize);

            trace!("Detected {} ({:.2}) at {:.0},{:.0}", label, confidence, x0, y0);
            frame.detections.push(DetectionBBox::new(
                x0 as i32,
                y0 as i32,
                (x1 - x0) as i32,
                (y1 - y0) as i32,
                label,
                confidence,
            ));
        }

        Ok(())
    }
}

/// Picks the highest scoring class
#[derive(Debug, Clone)]
pub struct ArgmaxClassifier {
    pub labels: Vec<String>,
    pub confidence_threshold: f32,
}

impl ArgmaxClassifier {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            confidence_threshold: 0.0,
        }
    }

    pub fn with_threshold(mut self, confidence_threshold: f32) -> Self {
        self.confidence_threshold = confidence_threshold;
        self
    }
}

impl ClassifyPostProcessor for ArgmaxClassifier {
    /// Scores run along the channel axis, or along the width for 1-channel outputs
    fn post_process(&self, output: &TensorView<'_>, frame: &mut Frame, bbox_index: usize) -> Result<()> {
        let scores: Vec<f32> = if output.channels() > 1 {
            (0..output.channels()).map(|c| output.get(0, 0, c)).collect()
        } else {
            (0..output.width()).map(|x| output.get(0, x, 0)).collect()
        };

        let (class, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| FrameBatchError::tensor("classification output is empty"))?;

        if confidence < self.confidence_threshold {
            return Ok(());
        }

        let bbox = frame.detections.get_mut(bbox_index).ok_or_else(|| {
            FrameBatchError::invalid_input(format!("frame has no detected region {}", bbox_index))
        })?;
        bbox.add_classification(label_name(&self.labels, class), confidence)
    }
}
