//! The tensor handle.
//!
//! `Tensor` is a cheap `Clone`-able wrapper around `Arc<TensorInner>`.
//! `Arc`'s strong count *is* the atomic reference count: cloning a `Tensor`
//! is the retain, letting the last clone drop is the release, and two
//! handles are the same tensor iff they point at the same allocation,
//! realized as `Arc::ptr_eq` rather than a raw pointer comparison.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tensor_base::DataType;

use crate::allocator::DeviceBuffer;
use crate::device::Device;

/// Sentinel for "no command buffer has written this tensor yet".
pub const NO_WRITER: u64 = u64::MAX;

pub(crate) struct TensorInner {
    pub(crate) device: Weak<Device>,
    pub(crate) dtype: DataType,
    pub(crate) byte_count: u64,
    pub(crate) shape: SmallVec<[u32; 4]>,
    pub(crate) state: Mutex<TensorState>,
    /// A process-wide monotonically increasing id, purely for logging (the
    /// `DEBUG_PLUGGABLE_DEVICE_REFERENCE_COUNTING` trace) — never part of
    /// handle identity, which is the `Arc` address.
    pub(crate) debug_id: u64,
}

pub(crate) struct TensorState {
    pub initialized: bool,
    pub materialized: bool,
    pub last_writer_cb_id: u64,
    pub constant_data: Option<Box<[u8]>>,
    pub buffer: Option<DeviceBuffer>,
}

impl Default for TensorState {
    fn default() -> Self {
        Self {
            initialized: false,
            materialized: false,
            last_writer_cb_id: NO_WRITER,
            constant_data: None,
            buffer: None,
        }
    }
}

static NEXT_DEBUG_ID: AtomicU64 = AtomicU64::new(0);

/// A handle to a (possibly not yet materialized) tensor living on one
/// device.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) inner: Arc<TensorInner>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.inner.debug_id)
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape)
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Tensor {}

impl Tensor {
    pub(crate) fn new(device: Weak<Device>, dtype: DataType, shape: &[u32]) -> Self {
        let byte_count = dtype.stride() as u64 * shape.iter().map(|&d| d as u64).product::<u64>();
        let inner = TensorInner {
            device,
            dtype,
            byte_count,
            shape: shape.iter().copied().collect(),
            state: Mutex::new(TensorState::default()),
            debug_id: NEXT_DEBUG_ID.fetch_add(1, Ordering::Relaxed),
        };
        Tensor {
            inner: Arc::new(inner),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    pub fn byte_count(&self) -> u64 {
        self.inner.byte_count
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.len()
    }

    pub fn shape(&self) -> &[u32] {
        &self.inner.shape
    }

    /// Element count, used by the encoder to size the dispatch.
    pub fn element_count(&self) -> u64 {
        if self.inner.byte_count == 0 {
            0
        } else {
            self.inner.byte_count / self.inner.dtype.stride() as u64
        }
    }

    /// `true` iff this tensor has exactly one element — the precondition for
    /// both scalar broadcasting and constant folding.
    pub fn is_scalar(&self) -> bool {
        self.inner.byte_count == self.inner.dtype.stride() as u64
    }

    /// `Arc::strong_count`: the live reference count.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// Flip `initialized`, set by the compiler when it closes (`true`) or
    /// reopens (`false`) a fusion whose tail is this tensor.
    pub(crate) fn set_initialized(&self, value: bool) {
        self.inner.state.lock().initialized = value;
    }

    pub(crate) fn debug_id(&self) -> u64 {
        self.inner.debug_id
    }

    /// Identity for the compiler's history cache and fusion-tail tracking:
    /// a raw pointer value, stable for the handle's lifetime, cheap to hash
    /// and compare — the Rust equivalent of a "handle address".
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Drop for TensorInner {
    /// The last handle going away waits for whatever command
    /// buffer last wrote this tensor to finish, then returns its buffer to
    /// the allocator. A device that has already been torn down (`upgrade`
    /// fails) has nothing left to wait on or free into, so this is a no-op.
    fn drop(&mut self) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        let (cb_id, buffer) = {
            let mut state = self.state.lock();
            (state.last_writer_cb_id, state.buffer.take())
        };
        if cb_id == NO_WRITER && buffer.is_none() {
            return;
        }
        device.release_tensor_buffer(cb_id, buffer);
    }
}
