// all device- and math-library-facing things go here

use crate::tensor::DataType;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod native;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("failed to allocate {bytes} bytes of device memory")]
    Alloc { bytes: usize },

    #[error("device execution failed: {reason}")]
    Execution { reason: String },

    #[error("unknown device buffer handle {0}")]
    InvalidHandle(u64),
}

impl DeviceError {
    pub fn execution<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        DeviceError::Execution {
            reason: reason.into(),
        }
    }
}

/// Device families accelerators can be compiled in for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceKind {
    Native,
}

/// Rank-5 NCDHW layout of a device tensor, as the math library sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NdDesc {
    pub extents: [usize; 5],
    pub data_type: DataType,
}

impl NdDesc {
    pub fn size(&self) -> usize {
        self.extents.iter().product()
    }
}

/// Filter layout: `[out_c, in_c / groups, kd, kh, kw]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterDesc {
    pub extents: [usize; 5],
}

impl FilterDesc {
    pub fn output_channels(&self) -> usize {
        self.extents[0]
    }

    pub fn channels_per_group(&self) -> usize {
        self.extents[1]
    }

    pub fn kernel(&self) -> [usize; 3] {
        [self.extents[2], self.extents[3], self.extents[4]]
    }
}

/// Shape-independent convolution geometry, built once at initialization.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConvDesc {
    pub padding: [usize; 3],
    pub stride: [usize; 3],
    pub dilation: [usize; 3],
    pub groups: usize,
}

/// Forward algorithms a backend may support.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConvAlgorithm {
    Direct,
    Im2colGemm,
}

/// Everything [`Backend::conv_forward`] needs besides the stream.
pub struct ConvForwardArgs<'a> {
    pub conv: &'a ConvDesc,
    pub input_desc: &'a NdDesc,
    pub filter_desc: &'a FilterDesc,
    pub output_desc: &'a NdDesc,
    pub algorithm: ConvAlgorithm,
    pub input: u64,
    pub weights: u64,
    pub workspace: Option<u64>,
    pub workspace_bytes: usize,
    pub output: u64,
}

/// The opaque driver + math-library capability one device family provides.
///
/// Buffers are referred to by opaque handles; [`Buffer`] pairs a handle with
/// its release call. Every entry point reports failure through its result and
/// callers must not proceed past a failed call assuming zeroed state.
pub trait Backend: Send + Sync {
    fn kind(&self) -> DeviceKind;

    fn alloc(&self, bytes: usize) -> Result<u64, DeviceError>;

    fn free(&self, handle: u64) -> Result<(), DeviceError>;

    /// Synchronous host-to-device copy.
    fn write(&self, handle: u64, data: &[f32]) -> Result<(), DeviceError>;

    /// Synchronous device-to-host copy.
    fn read(&self, handle: u64) -> Result<Vec<f32>, DeviceError>;

    /// Output extents the execution kernel will produce for these shapes.
    /// Accelerators must use this instead of re-deriving the arithmetic, so
    /// shape agreement with the kernel is bit-identical.
    fn conv_output_extents(
        &self,
        conv: &ConvDesc,
        input: &NdDesc,
        filter: &FilterDesc,
    ) -> Result<[usize; 5], DeviceError>;

    /// Fastest algorithm the backend has any support for, with no bound on
    /// workspace size or precision. Ties are broken stably.
    fn conv_algorithm(
        &self,
        conv: &ConvDesc,
        input: &NdDesc,
        filter: &FilterDesc,
        output: &NdDesc,
    ) -> Result<ConvAlgorithm, DeviceError>;

    /// Scratch bytes `algorithm` needs for these shapes.
    fn conv_workspace_size(
        &self,
        conv: &ConvDesc,
        input: &NdDesc,
        filter: &FilterDesc,
        output: &NdDesc,
        algorithm: ConvAlgorithm,
    ) -> Result<usize, DeviceError>;

    fn conv_forward(&self, stream: &Stream, args: ConvForwardArgs<'_>) -> Result<(), DeviceError>;

    /// Accumulates `bias` (layout `[1, C, 1, 1, 1]`) into every element of the
    /// corresponding output channel.
    fn add_channel_bias(
        &self,
        stream: &Stream,
        bias_desc: &NdDesc,
        bias: u64,
        output_desc: &NdDesc,
        output: u64,
    ) -> Result<(), DeviceError>;

    /// Elementwise `max(x, 0)` over `count` elements.
    fn relu_forward(
        &self,
        stream: &Stream,
        count: usize,
        input: u64,
        output: u64,
    ) -> Result<(), DeviceError>;
}

/// Execution stream owned by one [`DeviceContext`]. Work issued on the same
/// stream executes on the device in issue order; streams of different
/// contexts carry no ordering guarantee relative to each other.
#[derive(Debug)]
pub struct Stream {
    id: u64,
}

impl Stream {
    pub fn id(&self) -> u64 {
        self.id
    }
}

static NEXT_STREAM: AtomicU64 = AtomicU64::new(0);

/// Per-device runtime state, shared read-only by every accelerator scheduled
/// on the device. Outlives all of them.
pub struct DeviceContext {
    backend: Arc<dyn Backend>,
    stream: Stream,
}

impl DeviceContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let stream = Stream {
            id: NEXT_STREAM.fetch_add(1, Ordering::Relaxed),
        };
        DeviceContext { backend, stream }
    }

    pub fn kind(&self) -> DeviceKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn alloc(&self, bytes: usize) -> Result<Buffer, DeviceError> {
        let handle = self.backend.alloc(bytes)?;
        Ok(Buffer {
            handle,
            bytes,
            backend: self.backend.clone(),
        })
    }
}

impl Debug for DeviceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (stream {})", self.backend.kind(), self.stream.id)
    }
}

/// Exclusively owned block of device memory, released on drop. A release
/// failure is logged and otherwise ignored.
pub struct Buffer {
    handle: u64,
    bytes: usize,
    backend: Arc<dyn Backend>,
}

impl Buffer {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn write(&self, data: &[f32]) -> Result<(), DeviceError> {
        self.backend.write(self.handle, data)
    }

    pub fn read(&self) -> Result<Vec<f32>, DeviceError> {
        self.backend.read(self.handle)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free(self.handle) {
            log::warn!("failed to release device buffer {}: {}", self.handle, e);
        }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({}, {} bytes)", self.handle, self.bytes)
    }
}
