//! Conversions between frames and tensor batch items
//!
//! These are the default pixel conversions used when a model function does
//! not supply its own. Resampling is nearest-neighbour. Models take BGR
//! channel order; float tensors hold values in `[0, 1]`, 8-bit tensors in
//! `[0, 255]`.

use crate::frame::{DetectionBBox, Frame, PixelFormat};
use crate::tensor::{TensorView, TensorViewMut};
use framebatch_common::{FrameBatchError, Result};

/// Rectangle of a frame to sample from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

fn value_scale(is_float: bool) -> f32 {
    if is_float {
        1.0 / 255.0
    } else {
        1.0
    }
}

/// Map a BGR tensor channel to the frame's interleaved channel
fn frame_channel(format: PixelFormat, bgr_channel: usize) -> usize {
    match format {
        PixelFormat::Bgr24 => bgr_channel,
        PixelFormat::Rgb24 => 2 - bgr_channel,
        PixelFormat::Gray8 => 0,
    }
}

/// Luma of one pixel (BT.601)
fn luma(frame: &Frame, x: usize, y: usize) -> f32 {
    match frame.format {
        PixelFormat::Gray8 => frame.pixel(x, y, 0) as f32,
        format => {
            let b = frame.pixel(x, y, frame_channel(format, 0)) as f32;
            let g = frame.pixel(x, y, frame_channel(format, 1)) as f32;
            let r = frame.pixel(x, y, frame_channel(format, 2)) as f32;
            0.114 * b + 0.587 * g + 0.299 * r
        }
    }
}

fn sample_region(frame: &Frame, region: Region, input: &mut TensorViewMut<'_>) -> Result<()> {
    if !frame.has_pixels() {
        return Err(FrameBatchError::invalid_input("frame has no pixel data"));
    }
    if region.width == 0 || region.height == 0 {
        return Err(FrameBatchError::invalid_input("cannot sample an empty region"));
    }

    let channels = input.channels();
    if channels != 1 && channels != 3 {
        return Err(FrameBatchError::tensor(format!(
            "unsupported input channel count {}",
            channels
        )));
    }

    let (out_h, out_w) = (input.height(), input.width());
    let scale = value_scale(input.dtype().is_float());

    for ty in 0..out_h {
        let sy = region.y + ty * region.height / out_h;
        for tx in 0..out_w {
            let sx = region.x + tx * region.width / out_w;
            if channels == 1 {
                input.set(ty, tx, 0, luma(frame, sx, sy) * scale);
            } else {
                for c in 0..3 {
                    let value = frame.pixel(sx, sy, frame_channel(frame.format, c)) as f32;
                    input.set(ty, tx, c, value * scale);
                }
            }
        }
    }

    Ok(())
}

/// Convert a whole frame into one tensor batch item
pub fn frame_to_tensor(frame: &Frame, input: &mut TensorViewMut<'_>) -> Result<()> {
    let region = Region {
        x: 0,
        y: 0,
        width: frame.width,
        height: frame.height,
    };
    sample_region(frame, region, input)
}

/// Crop a detected region out of a frame into one tensor batch item
pub fn crop_to_tensor(frame: &Frame, bbox: &DetectionBBox, input: &mut TensorViewMut<'_>) -> Result<()> {
    if !bbox.is_classifiable_in(frame) {
        return Err(FrameBatchError::invalid_input(format!(
            "region ({}, {}, {}x{}) is outside the {}x{} frame",
            bbox.x, bbox.y, bbox.w, bbox.h, frame.width, frame.height
        )));
    }
    let region = Region {
        x: bbox.x as usize,
        y: bbox.y as usize,
        width: bbox.w as usize,
        height: bbox.h as usize,
    };
    sample_region(frame, region, input)
}

/// Write a tensor batch item back into a frame
///
/// The frame takes the tensor's spatial size. A single-channel tensor is
/// replicated into every channel of a colour frame.
pub fn tensor_to_frame(output: &TensorView<'_>, frame: &mut Frame) -> Result<()> {
    let channels = output.channels();
    if channels != 1 && channels != 3 {
        return Err(FrameBatchError::tensor(format!(
            "unsupported output channel count {}",
            channels
        )));
    }
    if channels == 3 && frame.format == PixelFormat::Gray8 {
        return Err(FrameBatchError::invalid_input(
            "cannot write a 3-channel output into a gray frame",
        ));
    }

    frame.resize_storage(output.width(), output.height());
    let scale = 1.0 / value_scale(output.dtype().is_float());
    let frame_channels = frame.format.channels();

    for y in 0..output.height() {
        for x in 0..output.width() {
            for fc in 0..frame_channels {
                let tc = if channels == 1 {
                    0
                } else {
                    frame_channel(frame.format, fc)
                };
                let value = (output.get(y, x, tc) * scale).round().clamp(0.0, 255.0);
                frame.set_pixel(x, y, fc, value as u8);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, Layout, Tensor, TensorDesc};

    fn gradient(width: usize, height: usize, format: PixelFormat) -> Frame {
        let mut frame = Frame::new(width, height, format);
        for y in 0..height {
            for x in 0..width {
                for c in 0..format.channels() {
                    frame.set_pixel(x, y, c, (x * 10 + y * 3 + c) as u8);
                }
            }
        }
        frame
    }

    #[test]
    fn test_frame_to_u8_tensor_same_size() {
        let frame = gradient(4, 3, PixelFormat::Bgr24);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 3, 3, 4, DataType::UInt8).with_layout(Layout::Nhwc));

        frame_to_tensor(&frame, &mut tensor.item_mut(0).unwrap()).unwrap();

        let view = tensor.item(0).unwrap();
        assert_eq!(view.get(2, 3, 0), frame.pixel(3, 2, 0) as f32);
        assert_eq!(view.get(1, 1, 2), frame.pixel(1, 1, 2) as f32);
    }

    #[test]
    fn test_rgb_frames_are_swapped_to_bgr() {
        let frame = gradient(2, 2, PixelFormat::Rgb24);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 3, 2, 2, DataType::UInt8));

        frame_to_tensor(&frame, &mut tensor.item_mut(0).unwrap()).unwrap();

        let view = tensor.item(0).unwrap();
        assert_eq!(view.get(0, 1, 0), frame.pixel(1, 0, 2) as f32);
        assert_eq!(view.get(0, 1, 2), frame.pixel(1, 0, 0) as f32);
    }

    #[test]
    fn test_float_tensor_is_normalized() {
        let mut frame = Frame::new(2, 2, PixelFormat::Gray8);
        frame.data.fill(255);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 1, 2, 2, DataType::Float32));

        frame_to_tensor(&frame, &mut tensor.item_mut(0).unwrap()).unwrap();

        assert!((tensor.item(0).unwrap().get(1, 1, 0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_samples_region() {
        let frame = gradient(8, 8, PixelFormat::Bgr24);
        let bbox = DetectionBBox::new(4, 2, 2, 2, "car", 0.9);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 3, 2, 2, DataType::UInt8));

        crop_to_tensor(&frame, &bbox, &mut tensor.item_mut(0).unwrap()).unwrap();

        let view = tensor.item(0).unwrap();
        assert_eq!(view.get(0, 0, 1), frame.pixel(4, 2, 1) as f32);
        assert_eq!(view.get(1, 1, 1), frame.pixel(5, 3, 1) as f32);
    }

    #[test]
    fn test_crop_rejects_out_of_bounds_region() {
        let frame = gradient(8, 8, PixelFormat::Bgr24);
        let bbox = DetectionBBox::new(6, 6, 4, 4, "car", 0.9);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 3, 2, 2, DataType::UInt8));

        assert!(crop_to_tensor(&frame, &bbox, &mut tensor.item_mut(0).unwrap()).is_err());
    }

    #[test]
    fn test_tensor_to_frame_resizes() {
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 1, 4, 6, DataType::Float32));
        tensor.item_mut(0).unwrap().fill(0.5);
        let mut frame = Frame::new(3, 2, PixelFormat::Gray8);

        tensor_to_frame(&tensor.item(0).unwrap(), &mut frame).unwrap();

        assert_eq!((frame.width, frame.height), (6, 4));
        assert!(frame.data.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_placeholder_frame_cannot_be_converted() {
        let frame = Frame::placeholder(4, 4);
        let mut tensor = Tensor::zeros(TensorDesc::new(1, 1, 4, 4, DataType::Float32));
        assert!(frame_to_tensor(&frame, &mut tensor.item_mut(0).unwrap()).is_err());
    }
}
