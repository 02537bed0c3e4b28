//! Accelerator runtime abstraction
//!
//! The batching core drives a device through three traits mirroring a
//! typical inference runtime: a [`Runtime`] opens model files into a
//! [`Network`], a network is prepared and loaded onto one device, and the
//! loaded network hands out [`InferRequest`]s that execute one batch at a
//! time, either blocking or with a completion callback that runs on a
//! thread owned by the runtime.

pub mod reference;

pub use reference::{
    InputSpec, Operator, ReferenceManifest, ReferenceNetwork, ReferenceRequest, ReferenceRuntime,
};

use crate::tensor::{DataType, Layout, Tensor, TensorDesc};
use framebatch_common::{FrameBatchError, Result};
use std::path::Path;

/// Entry point of an inference runtime
pub trait Runtime: Send + Sync {
    type Network: Network;

    /// Parse a model file into an unloaded network
    fn read_network(&self, model_path: &Path) -> Result<Self::Network>;

    /// Devices this runtime can load networks onto
    fn available_devices(&self) -> Vec<String>;

    /// Runtime API version, for diagnostics
    fn version(&self) -> String;
}

/// A model definition, configurable until it is loaded onto a device
pub trait Network: Send {
    type Request: InferRequest;

    fn input_names(&self) -> Vec<String>;

    fn output_names(&self) -> Vec<String>;

    /// Shape and precision of a model input, in `{N, C, H, W}` terms
    fn input_desc(&self, name: &str) -> Result<TensorDesc>;

    /// Set the batch dimension of every input
    fn set_batch_size(&mut self, batch_size: usize) -> Result<()>;

    /// Change the spatial dimensions of one input
    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()>;

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()>;

    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()>;

    fn set_input_precision(&mut self, name: &str, dtype: DataType) -> Result<()>;

    /// Compile the network for `device`
    fn load(&mut self, device: &str) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// Create an inference request on the loaded network
    fn create_request(&self) -> Result<Self::Request>;
}

/// Receives a finished asynchronous inference
///
/// Invoked exactly once, on a thread chosen by the runtime, with the request
/// handed back and the device status of the run.
pub trait Completion<R>: Send + 'static {
    fn complete(self, request: R, status: Result<()>);
}

/// An asynchronous dispatch the runtime refused to start
///
/// Carries the request and the completion back so the caller can recover
/// whatever state it attached to them.
pub struct DispatchRejected<R, C> {
    pub request: R,
    pub completion: C,
    pub error: FrameBatchError,
}

/// One reusable device inference handle
pub trait InferRequest: Send + Sized + 'static {
    /// Writable input blob
    fn input_blob(&mut self, name: &str) -> Result<&mut Tensor>;

    /// Output blob of the last completed run
    fn output_blob(&self, name: &str) -> Result<&Tensor>;

    /// Run inference, blocking the calling thread
    fn infer(&mut self) -> Result<()>;

    /// Start inference and return immediately
    fn infer_async<C>(self, completion: C) -> std::result::Result<(), DispatchRejected<Self, C>>
    where
        C: Completion<Self>;
}
