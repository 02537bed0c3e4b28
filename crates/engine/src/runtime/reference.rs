//! Reference CPU runtime
//!
//! Executes small manifest-described networks on the host so the batching
//! core can run without an accelerator. Blocking inference runs on the
//! caller's thread; asynchronous inference runs on a rayon pool owned by the
//! runtime, and the completion is invoked from that pool's thread.

use super::{Completion, DispatchRejected, InferRequest, Network, Runtime};
use crate::tensor::{DataType, Layout, Tensor, TensorDesc, TensorView, TensorViewMut};
use framebatch_common::{FrameBatchError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

const REFERENCE_VERSION: &str = "reference-1.0";

/// Model description read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceManifest {
    #[serde(default)]
    pub name: String,

    pub inputs: Vec<InputSpec>,

    pub outputs: Vec<String>,

    pub operator: Operator,

    /// Simulated device time per inference
    #[serde(default)]
    pub latency_us: u64,
}

/// One model input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    #[serde(default = "default_dtype")]
    pub dtype: DataType,
}

fn default_dtype() -> DataType {
    DataType::Float32
}

/// Computation applied to the first input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operator {
    /// Output equals input
    Identity,

    /// Nearest-neighbour upscaling by an integer factor
    Upscale { factor: usize },

    /// Per-channel mean, producing a `{N, C, 1, 1}` score tensor
    ChannelMean,

    /// Box around the bright pixels as detection-output rows, `{N, 1, 2, 7}`
    ///
    /// Row 0 is `[0, 1, confidence, x0, y0, x1, y1]` with normalized corners,
    /// row 1 ends the list. A dark item only produces the end row.
    BrightBox,
}

/// Values per detection-output row
const DETECTION_ROW: usize = 7;

/// Image id marking the end of a detection list
const END_OF_DETECTIONS: [f32; DETECTION_ROW] = [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

impl Operator {
    fn output_desc(&self, input: &TensorDesc, layout: Layout) -> TensorDesc {
        let (channels, height, width) = match self {
            Operator::Identity => (input.channels, input.height, input.width),
            Operator::Upscale { factor } => (input.channels, input.height * factor, input.width * factor),
            Operator::ChannelMean => (input.channels, 1, 1),
            Operator::BrightBox => (1, 2, DETECTION_ROW),
        };
        TensorDesc::new(input.batch, channels, height, width, DataType::Float32).with_layout(layout)
    }

    fn apply(&self, src: &TensorView<'_>, dst: &mut TensorViewMut<'_>) {
        match self {
            Operator::Identity => {
                for y in 0..dst.height() {
                    for x in 0..dst.width() {
                        for c in 0..dst.channels() {
                            dst.set(y, x, c, src.get(y, x, c));
                        }
                    }
                }
            }
            Operator::Upscale { factor } => {
                for y in 0..dst.height() {
                    for x in 0..dst.width() {
                        for c in 0..dst.channels() {
                            dst.set(y, x, c, src.get(y / factor, x / factor, c));
                        }
                    }
                }
            }
            Operator::ChannelMean => {
                let area = (src.height() * src.width()).max(1) as f32;
                for c in 0..src.channels() {
                    let mut sum = 0.0f32;
                    for y in 0..src.height() {
                        for x in 0..src.width() {
                            sum += src.get(y, x, c);
                        }
                    }
                    dst.set(0, 0, c, sum / area);
                }
            }
            Operator::BrightBox => {
                let rows = [bright_box(src).unwrap_or(END_OF_DETECTIONS), END_OF_DETECTIONS];
                for (y, row) in rows.iter().enumerate() {
                    for (x, value) in row.iter().enumerate() {
                        dst.set(y, x, 0, *value);
                    }
                }
            }
        }
    }
}

/// Detection row around pixels at least half as bright as the brightest one
fn bright_box(src: &TensorView<'_>) -> Option<[f32; DETECTION_ROW]> {
    let channels = src.channels().max(1) as f32;
    let luma = |y: usize, x: usize| (0..src.channels()).map(|c| src.get(y, x, c)).sum::<f32>() / channels;

    let mut peak = 0.0f32;
    for y in 0..src.height() {
        for x in 0..src.width() {
            peak = peak.max(luma(y, x));
        }
    }
    if peak <= 0.0 {
        return None;
    }

    let mut bright = 0usize;
    let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
    for y in 0..src.height() {
        for x in 0..src.width() {
            if luma(y, x) >= peak / 2.0 {
                bright += 1;
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
        }
    }

    let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
    let (width, height) = (src.width() as f32, src.height() as f32);
    Some([
        0.0,
        1.0,
        bright as f32 / area,
        x0 as f32 / width,
        y0 as f32 / height,
        (x1 + 1) as f32 / width,
        (y1 + 1) as f32 / height,
    ])
}

/// CPU runtime executing [`ReferenceManifest`] networks
pub struct ReferenceRuntime {
    pool: Arc<ThreadPool>,
    devices: Vec<String>,
}

impl ReferenceRuntime {
    /// Create a runtime with `threads` completion threads
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("framebatch-ref-{}", i))
            .build()
            .map_err(|e| FrameBatchError::device(format!("Failed to create runtime threads: {}", e)))?;

        Ok(Self {
            pool: Arc::new(pool),
            devices: vec!["CPU".to_string()],
        })
    }

    /// Replace the advertised device list
    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = devices;
        self
    }

    /// Build a network directly from a manifest
    pub fn network_from_manifest(&self, manifest: ReferenceManifest) -> Result<ReferenceNetwork> {
        if manifest.inputs.is_empty() || manifest.outputs.is_empty() {
            return Err(FrameBatchError::model(format!(
                "network \"{}\" needs at least one input and one output",
                manifest.name
            )));
        }
        if let Operator::Upscale { factor: 0 } = manifest.operator {
            return Err(FrameBatchError::model("upscale factor must be at least 1"));
        }

        let mut inputs = Vec::with_capacity(manifest.inputs.len());
        for input in &manifest.inputs {
            if input.channels == 0 || input.height == 0 || input.width == 0 {
                return Err(FrameBatchError::model(format!(
                    "input \"{}\" has an empty shape",
                    input.name
                )));
            }
            let desc = TensorDesc::new(1, input.channels, input.height, input.width, input.dtype);
            inputs.push((input.name.clone(), desc));
        }

        Ok(ReferenceNetwork {
            name: manifest.name,
            inputs,
            outputs: manifest.outputs,
            output_layouts: HashMap::new(),
            operator: manifest.operator,
            latency: Duration::from_micros(manifest.latency_us),
            devices: self.devices.clone(),
            device: None,
            pool: Arc::clone(&self.pool),
        })
    }
}

impl Runtime for ReferenceRuntime {
    type Network = ReferenceNetwork;

    fn read_network(&self, model_path: &Path) -> Result<ReferenceNetwork> {
        let content = std::fs::read_to_string(model_path).map_err(|e| {
            FrameBatchError::model(format!("Failed to read {}: {}", model_path.display(), e))
        })?;
        let manifest: ReferenceManifest = serde_json::from_str(&content)?;
        debug!("Read reference network \"{}\" from {}", manifest.name, model_path.display());
        self.network_from_manifest(manifest)
    }

    fn available_devices(&self) -> Vec<String> {
        self.devices.clone()
    }

    fn version(&self) -> String {
        REFERENCE_VERSION.to_string()
    }
}

/// A manifest network
pub struct ReferenceNetwork {
    name: String,
    inputs: Vec<(String, TensorDesc)>,
    outputs: Vec<String>,
    output_layouts: HashMap<String, Layout>,
    operator: Operator,
    latency: Duration,
    devices: Vec<String>,
    device: Option<String>,
    pool: Arc<ThreadPool>,
}

impl ReferenceNetwork {
    fn input_mut(&mut self, name: &str) -> Result<&mut TensorDesc> {
        if self.device.is_some() {
            return Err(FrameBatchError::device(format!(
                "network \"{}\" is already loaded",
                self.name
            )));
        }
        self.inputs
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, desc)| desc)
            .ok_or_else(|| FrameBatchError::device(format!("no input named \"{}\"", name)))
    }

    fn primary_input(&self) -> &TensorDesc {
        &self.inputs[0].1
    }
}

impl Network for ReferenceNetwork {
    type Request = ReferenceRequest;

    fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn input_desc(&self, name: &str) -> Result<TensorDesc> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, desc)| *desc)
            .ok_or_else(|| FrameBatchError::device(format!("no input named \"{}\"", name)))
    }

    fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if self.device.is_some() {
            return Err(FrameBatchError::device("cannot reshape a loaded network"));
        }
        for (_, desc) in self.inputs.iter_mut() {
            desc.batch = batch_size;
        }
        Ok(())
    }

    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()> {
        if height == 0 || width == 0 {
            return Err(FrameBatchError::device("cannot reshape to an empty input"));
        }
        let desc = self.input_mut(name)?;
        desc.height = height;
        desc.width = width;
        Ok(())
    }

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.input_mut(name)?.layout = layout;
        Ok(())
    }

    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        if !self.outputs.iter().any(|n| n == name) {
            return Err(FrameBatchError::device(format!("no output named \"{}\"", name)));
        }
        self.output_layouts.insert(name.to_string(), layout);
        Ok(())
    }

    fn set_input_precision(&mut self, name: &str, dtype: DataType) -> Result<()> {
        self.input_mut(name)?.dtype = dtype;
        Ok(())
    }

    fn load(&mut self, device: &str) -> Result<()> {
        if !self.devices.iter().any(|d| d.eq_ignore_ascii_case(device)) {
            return Err(FrameBatchError::device(format!(
                "device \"{}\" is not available",
                device
            )));
        }
        info!(
            "Loaded reference network \"{}\" on {} with input {}",
            self.name,
            device,
            self.primary_input()
        );
        self.device = Some(device.to_string());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.device.is_some()
    }

    fn create_request(&self) -> Result<ReferenceRequest> {
        if self.device.is_none() {
            return Err(FrameBatchError::device(
                "network must be loaded before creating requests",
            ));
        }

        let inputs = self
            .inputs
            .iter()
            .map(|(name, desc)| (name.clone(), Tensor::zeros(*desc)))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|name| {
                let layout = self.output_layouts.get(name).copied().unwrap_or_default();
                let desc = self.operator.output_desc(self.primary_input(), layout);
                (name.clone(), Tensor::zeros(desc))
            })
            .collect();

        Ok(ReferenceRequest {
            inputs,
            outputs,
            operator: self.operator,
            latency: self.latency,
            pool: Arc::clone(&self.pool),
        })
    }
}

/// Inference request of a [`ReferenceNetwork`]
pub struct ReferenceRequest {
    inputs: Vec<(String, Tensor)>,
    outputs: Vec<(String, Tensor)>,
    operator: Operator,
    latency: Duration,
    pool: Arc<ThreadPool>,
}

impl InferRequest for ReferenceRequest {
    fn input_blob(&mut self, name: &str) -> Result<&mut Tensor> {
        self.inputs
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| FrameBatchError::device(format!("no input blob named \"{}\"", name)))
    }

    fn output_blob(&self, name: &str) -> Result<&Tensor> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| FrameBatchError::device(format!("no output blob named \"{}\"", name)))
    }

    fn infer(&mut self) -> Result<()> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let input = &self.inputs[0].1;
        for (name, output) in self.outputs.iter_mut() {
            for b in 0..input.desc().batch {
                let src = input.item(b)?;
                let mut dst = output.item_mut(b)?;
                self.operator.apply(&src, &mut dst);
            }
            trace!("Computed output \"{}\" {}", name, output.desc());
        }
        Ok(())
    }

    fn infer_async<C>(mut self, completion: C) -> std::result::Result<(), DispatchRejected<Self, C>>
    where
        C: Completion<Self>,
    {
        let pool = Arc::clone(&self.pool);
        pool.spawn(move || {
            let status = self.infer();
            completion.complete(self, status);
        });
        Ok(())
    }
}
