//! Tensor blobs and typed views
//!
//! Device blobs are 4-D tensors described as `{batch, channels, height, width}`
//! with a physical layout of either NCHW or NHWC. Batch items are addressed
//! by index and exposed as [`TensorView`]/[`TensorViewMut`], which resolve
//! `(y, x, channel)` coordinates through strides so callers never compute
//! byte offsets.

pub mod convert;

use framebatch_common::{FrameBatchError, Result};
use half::f16;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tensor strides
pub type Strides = Vec<usize>;

/// Element precision of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[serde(alias = "f32")]
    Float32,
    #[serde(alias = "f16")]
    Float16,
    #[serde(alias = "u8")]
    UInt8,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::UInt8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, DataType::UInt8)
    }
}

/// Physical dimension order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Nchw,
    Nhwc,
}

/// Shape and precision of a 4-D blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDesc {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub dtype: DataType,
    pub layout: Layout,
}

impl TensorDesc {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize, dtype: DataType) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
            dtype,
            layout: Layout::Nchw,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Dimensions in `{N, C, H, W}` order regardless of layout
    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    /// Elements in one batch item
    pub fn item_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Elements in the whole blob
    pub fn len(&self) -> usize {
        self.batch * self.item_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes in one batch item
    pub fn item_bytes(&self) -> usize {
        self.item_len() * self.dtype.size()
    }

    /// Strides of `(y, x, channel)` within one batch item
    fn item_strides(&self) -> [usize; 3] {
        match self.layout {
            Layout::Nhwc => {
                let s = compute_strides(&[self.height, self.width, self.channels]);
                [s[0], s[1], s[2]]
            }
            Layout::Nchw => {
                let s = compute_strides(&[self.channels, self.height, self.width]);
                [s[1], s[2], s[0]]
            }
        }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{}x{}x{}x{}] {:?}",
            self.dtype, self.batch, self.channels, self.height, self.width, self.layout
        )
    }
}

/// Compute row-major strides from shape
pub fn compute_strides(shape: &[usize]) -> Strides {
    let mut strides = Vec::with_capacity(shape.len());
    let mut stride = 1;

    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim;
    }

    strides.reverse();
    strides
}

/// Scalar types a blob can hold
pub trait Element: Copy + Default + ToPrimitive + NumCast + Send + Sync + 'static {
    const DTYPE: DataType;

    /// Convert from `f32`, saturating to the type's range
    fn from_f32_saturating(value: f32) -> Self;

    fn to_f32_lossy(self) -> f32 {
        self.to_f32().unwrap_or(0.0)
    }
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Float32;

    fn from_f32_saturating(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DTYPE: DataType = DataType::Float16;

    fn from_f32_saturating(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for u8 {
    const DTYPE: DataType = DataType::UInt8;

    fn from_f32_saturating(value: f32) -> Self {
        <u8 as NumCast>::from(value.round().clamp(0.0, 255.0)).unwrap_or_default()
    }
}

/// Owned blob storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Float32 => TensorData::F32(vec![0.0; len]),
            DataType::Float16 => TensorData::F16(vec![f16::ZERO; len]),
            DataType::UInt8 => TensorData::U8(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::Float32,
            TensorData::F16(_) => DataType::Float16,
            TensorData::U8(_) => DataType::UInt8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(d) => d.len(),
            TensorData::F16(d) => d.len(),
            TensorData::U8(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned 4-D blob
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    desc: TensorDesc,
    data: TensorData,
}

impl Tensor {
    /// Create a zero blob
    pub fn zeros(desc: TensorDesc) -> Self {
        Self {
            data: TensorData::zeros(desc.dtype, desc.len()),
            desc,
        }
    }

    /// Create a blob from existing storage
    pub fn from_data(desc: TensorDesc, data: TensorData) -> Result<Self> {
        if data.dtype() != desc.dtype || data.len() != desc.len() {
            return Err(FrameBatchError::tensor(format!(
                "storage {:?}[{}] does not match {}",
                data.dtype(),
                data.len(),
                desc
            )));
        }
        Ok(Self { desc, data })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// View of batch item `index`
    pub fn item(&self, index: usize) -> Result<TensorView<'_>> {
        let range = self.item_range(index)?;
        let elements = match &self.data {
            TensorData::F32(d) => Elements::F32(&d[range]),
            TensorData::F16(d) => Elements::F16(&d[range]),
            TensorData::U8(d) => Elements::U8(&d[range]),
        };
        Ok(TensorView {
            elements,
            shape: [self.desc.height, self.desc.width, self.desc.channels],
            strides: self.desc.item_strides(),
        })
    }

    /// Mutable view of batch item `index`
    pub fn item_mut(&mut self, index: usize) -> Result<TensorViewMut<'_>> {
        let range = self.item_range(index)?;
        let shape = [self.desc.height, self.desc.width, self.desc.channels];
        let strides = self.desc.item_strides();
        let elements = match &mut self.data {
            TensorData::F32(d) => ElementsMut::F32(&mut d[range]),
            TensorData::F16(d) => ElementsMut::F16(&mut d[range]),
            TensorData::U8(d) => ElementsMut::U8(&mut d[range]),
        };
        Ok(TensorViewMut {
            elements,
            shape,
            strides,
        })
    }

    fn item_range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.desc.batch {
            return Err(FrameBatchError::tensor(format!(
                "batch index {} out of range for {}",
                index, self.desc
            )));
        }
        let len = self.desc.item_len();
        Ok(index * len..(index + 1) * len)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({})", self.desc)
    }
}

#[derive(Debug, Clone, Copy)]
enum Elements<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    U8(&'a [u8]),
}

#[derive(Debug)]
enum ElementsMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [f16]),
    U8(&'a mut [u8]),
}

/// Read-only view of one batch item, indexed as `(y, x, channel)`
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    elements: Elements<'a>,
    shape: [usize; 3],
    strides: [usize; 3],
}

impl<'a> TensorView<'a> {
    pub fn height(&self) -> usize {
        self.shape[0]
    }

    pub fn width(&self) -> usize {
        self.shape[1]
    }

    pub fn channels(&self) -> usize {
        self.shape[2]
    }

    pub fn dtype(&self) -> DataType {
        match self.elements {
            Elements::F32(_) => DataType::Float32,
            Elements::F16(_) => DataType::Float16,
            Elements::U8(_) => DataType::UInt8,
        }
    }

    /// Calculate the linear index of `(y, x, channel)`
    pub fn index(&self, y: usize, x: usize, channel: usize) -> usize {
        y * self.strides[0] + x * self.strides[1] + channel * self.strides[2]
    }

    /// Read an element as `f32`
    pub fn get(&self, y: usize, x: usize, channel: usize) -> f32 {
        let idx = self.index(y, x, channel);
        match self.elements {
            Elements::F32(d) => d[idx],
            Elements::F16(d) => d[idx].to_f32_lossy(),
            Elements::U8(d) => d[idx].to_f32_lossy(),
        }
    }

    /// Raw `f32` storage, when the blob is single precision
    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match self.elements {
            Elements::F32(d) => Some(d),
            _ => None,
        }
    }
}

/// Writable view of one batch item, indexed as `(y, x, channel)`
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    elements: ElementsMut<'a>,
    shape: [usize; 3],
    strides: [usize; 3],
}

impl<'a> TensorViewMut<'a> {
    pub fn height(&self) -> usize {
        self.shape[0]
    }

    pub fn width(&self) -> usize {
        self.shape[1]
    }

    pub fn channels(&self) -> usize {
        self.shape[2]
    }

    pub fn dtype(&self) -> DataType {
        match self.elements {
            ElementsMut::F32(_) => DataType::Float32,
            ElementsMut::F16(_) => DataType::Float16,
            ElementsMut::U8(_) => DataType::UInt8,
        }
    }

    pub fn index(&self, y: usize, x: usize, channel: usize) -> usize {
        y * self.strides[0] + x * self.strides[1] + channel * self.strides[2]
    }

    pub fn get(&self, y: usize, x: usize, channel: usize) -> f32 {
        let idx = self.index(y, x, channel);
        match &self.elements {
            ElementsMut::F32(d) => d[idx],
            ElementsMut::F16(d) => d[idx].to_f32_lossy(),
            ElementsMut::U8(d) => d[idx].to_f32_lossy(),
        }
    }

    /// Write an element, saturating to the blob's precision
    pub fn set(&mut self, y: usize, x: usize, channel: usize, value: f32) {
        let idx = self.index(y, x, channel);
        match &mut self.elements {
            ElementsMut::F32(d) => d[idx] = value,
            ElementsMut::F16(d) => d[idx] = f16::from_f32_saturating(value),
            ElementsMut::U8(d) => d[idx] = u8::from_f32_saturating(value),
        }
    }

    /// Set every element to `value`
    pub fn fill(&mut self, value: f32) {
        match &mut self.elements {
            ElementsMut::F32(d) => d.fill(value),
            ElementsMut::F16(d) => d.fill(f16::from_f32_saturating(value)),
            ElementsMut::U8(d) => d.fill(u8::from_f32_saturating(value)),
        }
    }

    /// Reborrow as a read-only view
    pub fn as_view(&self) -> TensorView<'_> {
        let elements = match &self.elements {
            ElementsMut::F32(d) => Elements::F32(d),
            ElementsMut::F16(d) => Elements::F16(d),
            ElementsMut::U8(d) => Elements::U8(d),
        };
        TensorView {
            elements,
            shape: self.shape,
            strides: self.strides,
        }
    }
}
