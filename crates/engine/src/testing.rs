//! Test runtime with explicitly released completions
//!
//! Wraps the reference runtime. Asynchronous inferences are parked until the
//! test releases them with [`ManualRuntime::complete_next`],
//! [`ManualRuntime::complete_last`], [`ManualRuntime::complete_at`] or
//! [`ManualRuntime::complete_all`], which run them and their completions on
//! the test thread in the order the test picks.

use crate::runtime::{
    Completion, DispatchRejected, InferRequest, InputSpec, Network, Operator, ReferenceManifest,
    ReferenceNetwork, ReferenceRequest, ReferenceRuntime, Runtime,
};
use crate::tensor::{DataType, Layout, Tensor, TensorDesc};
use framebatch_common::{FrameBatchError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Parked = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ManualState {
    parked: Mutex<VecDeque<Parked>>,
    pending: AtomicUsize,
    max_pending: AtomicUsize,
    reject_async: AtomicBool,
    fail_infer: AtomicBool,
}

/// Single-input manifest: gray `1x{height}x{width}` in, identity out
pub fn gray_manifest(height: usize, width: usize) -> ReferenceManifest {
    manifest(1, height, width, Operator::Identity)
}

pub fn manifest(channels: usize, height: usize, width: usize, operator: Operator) -> ReferenceManifest {
    ReferenceManifest {
        name: "manual".to_string(),
        inputs: vec![InputSpec {
            name: "x".to_string(),
            channels,
            height,
            width,
            dtype: DataType::Float32,
        }],
        outputs: vec!["y".to_string()],
        operator,
        latency_us: 0,
    }
}

/// Write a manifest where [`Runtime::read_network`] can find it
pub fn write_manifest(manifest: &ReferenceManifest) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(manifest).unwrap().as_bytes())
        .unwrap();
    file
}

pub struct ManualRuntime {
    inner: ReferenceRuntime,
    state: Arc<ManualState>,
}

impl ManualRuntime {
    pub fn new() -> Self {
        Self {
            inner: ReferenceRuntime::new(1).unwrap(),
            state: Arc::new(ManualState::default()),
        }
    }

    pub fn network_from_manifest(&self, manifest: ReferenceManifest) -> Result<ManualNetwork> {
        Ok(ManualNetwork {
            inner: self.inner.network_from_manifest(manifest)?,
            state: Arc::clone(&self.state),
        })
    }

    /// Run the oldest parked inference; false when none is parked
    pub fn complete_next(&self) -> bool {
        let next = self.state.parked.lock().pop_front();
        match next {
            Some(run) => {
                run();
                true
            }
            None => false,
        }
    }

    /// Run the most recently parked inference; false when none is parked
    pub fn complete_last(&self) -> bool {
        let last = self.state.parked.lock().pop_back();
        match last {
            Some(run) => {
                run();
                true
            }
            None => false,
        }
    }

    /// Run the parked inference at `index`, oldest first; false when out of range
    pub fn complete_at(&self, index: usize) -> bool {
        let parked = self.state.parked.lock().remove(index);
        match parked {
            Some(run) => {
                run();
                true
            }
            None => false,
        }
    }

    /// Inferences parked and not yet run
    pub fn parked(&self) -> usize {
        self.state.parked.lock().len()
    }

    /// Run every parked inference, returning how many ran
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// Inferences started but not yet completed
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously pending inferences seen
    pub fn max_pending(&self) -> usize {
        self.state.max_pending.load(Ordering::Acquire)
    }

    pub fn set_reject_async(&self, reject: bool) {
        self.state.reject_async.store(reject, Ordering::Release);
    }

    pub fn set_fail_infer(&self, fail: bool) {
        self.state.fail_infer.store(fail, Ordering::Release);
    }
}

impl Runtime for ManualRuntime {
    type Network = ManualNetwork;

    fn read_network(&self, model_path: &Path) -> Result<ManualNetwork> {
        Ok(ManualNetwork {
            inner: self.inner.read_network(model_path)?,
            state: Arc::clone(&self.state),
        })
    }

    fn available_devices(&self) -> Vec<String> {
        self.inner.available_devices()
    }

    fn version(&self) -> String {
        format!("manual/{}", self.inner.version())
    }
}

pub struct ManualNetwork {
    inner: ReferenceNetwork,
    state: Arc<ManualState>,
}

impl Network for ManualNetwork {
    type Request = ManualRequest;

    fn input_names(&self) -> Vec<String> {
        self.inner.input_names()
    }

    fn output_names(&self) -> Vec<String> {
        self.inner.output_names()
    }

    fn input_desc(&self, name: &str) -> Result<TensorDesc> {
        self.inner.input_desc(name)
    }

    fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        self.inner.set_batch_size(batch_size)
    }

    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()> {
        self.inner.reshape_input(name, height, width)
    }

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.inner.set_input_layout(name, layout)
    }

    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.inner.set_output_layout(name, layout)
    }

    fn set_input_precision(&mut self, name: &str, dtype: DataType) -> Result<()> {
        self.inner.set_input_precision(name, dtype)
    }

    fn load(&mut self, device: &str) -> Result<()> {
        self.inner.load(device)
    }

    fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }

    fn create_request(&self) -> Result<ManualRequest> {
        Ok(ManualRequest {
            inner: self.inner.create_request()?,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct ManualRequest {
    inner: ReferenceRequest,
    state: Arc<ManualState>,
}

impl InferRequest for ManualRequest {
    fn input_blob(&mut self, name: &str) -> Result<&mut Tensor> {
        self.inner.input_blob(name)
    }

    fn output_blob(&self, name: &str) -> Result<&Tensor> {
        self.inner.output_blob(name)
    }

    fn infer(&mut self) -> Result<()> {
        if self.state.fail_infer.load(Ordering::Acquire) {
            return Err(FrameBatchError::device("injected inference failure"));
        }
        self.inner.infer()
    }

    fn infer_async<C>(self, completion: C) -> std::result::Result<(), DispatchRejected<Self, C>>
    where
        C: Completion<Self>,
    {
        if self.state.reject_async.load(Ordering::Acquire) {
            return Err(DispatchRejected {
                request: self,
                completion,
                error: FrameBatchError::device("injected dispatch rejection"),
            });
        }

        let state = Arc::clone(&self.state);
        let pending = state.pending.fetch_add(1, Ordering::AcqRel) + 1;
        state.max_pending.fetch_max(pending, Ordering::AcqRel);

        let mut request = self;
        state.parked.lock().push_back(Box::new(move || {
            let status = request.infer();
            request.state.pending.fetch_sub(1, Ordering::AcqRel);
            completion.complete(request, status);
        }));
        Ok(())
    }
}
