//! Video frames and detection side data
//!
//! A [`Frame`] is the caller-visible buffer a task consumes and produces.
//! Analytics models annotate frames with [`DetectionBBox`] entries; the
//! classification path attaches labels to those entries.

use framebatch_common::{FrameBatchError, Result};

/// Maximum number of classification labels one detected region can carry
pub const MAX_CLASSIFY_LABELS: usize = 4;

/// Packed 8-bit pixel formats understood by the default conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    /// Interleaved channels per pixel
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One classification result attached to a detected region
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyLabel {
    pub label: String,
    pub confidence: f32,
}

/// One detected region of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub detect_label: String,
    pub detect_confidence: f32,
    pub classify: Vec<ClassifyLabel>,
}

impl DetectionBBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            detect_label: label.into(),
            detect_confidence: confidence,
            classify: Vec::new(),
        }
    }

    /// Whether the region can be classified within `frame`
    ///
    /// The region must lie inside the frame, have a non-negative size and
    /// still have room for another classification label.
    pub fn is_classifiable_in(&self, frame: &Frame) -> bool {
        if self.x < 0 || self.y < 0 || self.w < 0 || self.h < 0 {
            return false;
        }
        let right = self.x as i64 + self.w as i64;
        let bottom = self.y as i64 + self.h as i64;
        if right > frame.width as i64 || bottom > frame.height as i64 {
            return false;
        }
        self.classify.len() < MAX_CLASSIFY_LABELS
    }

    /// Attach a classification label
    pub fn add_classification(&mut self, label: impl Into<String>, confidence: f32) -> Result<()> {
        if self.classify.len() >= MAX_CLASSIFY_LABELS {
            return Err(FrameBatchError::invalid_input(format!(
                "region already carries {} classification labels",
                MAX_CLASSIFY_LABELS
            )));
        }
        self.classify.push(ClassifyLabel {
            label: label.into(),
            confidence,
        });
        Ok(())
    }
}

/// A packed video frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub detections: Vec<DetectionBBox>,
}

impl Frame {
    /// Allocate a black frame
    pub fn new(width: usize, height: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; width * height * format.channels()],
            detections: Vec::new(),
        }
    }

    /// Wrap existing pixel data
    pub fn from_data(width: usize, height: usize, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width * height * format.channels();
        if data.len() != expected {
            return Err(FrameBatchError::invalid_input(format!(
                "frame {}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            detections: Vec::new(),
        })
    }

    /// A frame with declared dimensions but no pixel storage
    pub fn placeholder(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Whether the frame carries pixel data
    pub fn has_pixels(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.width * self.height * self.format.channels()
    }

    pub fn linesize(&self) -> usize {
        self.width * self.format.channels()
    }

    /// Read one channel of one pixel
    pub fn pixel(&self, x: usize, y: usize, channel: usize) -> u8 {
        self.data[y * self.linesize() + x * self.format.channels() + channel]
    }

    /// Write one channel of one pixel
    pub fn set_pixel(&mut self, x: usize, y: usize, channel: usize, value: u8) {
        let offset = y * self.linesize() + x * self.format.channels() + channel;
        self.data[offset] = value;
    }

    /// Reallocate the pixel storage for new dimensions, keeping the format
    pub fn resize_storage(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.resize(width * height * self.format.channels(), 0);
    }

    pub fn with_detections(mut self, detections: Vec<DetectionBBox>) -> Self {
        self.detections = detections;
        self
    }
}
