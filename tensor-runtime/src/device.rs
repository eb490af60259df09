//! The device: the top-level object a caller holds, owning the pending op
//! list, allocator, in-flight command buffers, and backend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tensor_base::{AttrBuffer, DataType, ErrorKind};

use crate::allocator::{Allocator, DeviceBuffer, StorageMode};
use crate::backend::{Backend, CommandBufferId};
use crate::command_stream::{self, CbWaiter};
use crate::config::{DebugFlags, RuntimeConfig};
use crate::handle::Tensor;
use crate::instr::Instruction;
use crate::queue::{self, EagerOp};

/// Everything recorded about one committed-but-not-yet-drained command
/// buffer: the instruction vector keeps every buffer it touches alive
/// through execution, and the waiter lets `barrier()` and
/// `Tensor`'s drop glue block on completion.
pub(crate) struct CommandBufferRecord {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) waiter: Arc<CbWaiter>,
}

pub(crate) struct DeviceState {
    pub(crate) pending: Vec<EagerOp>,
    pub(crate) allocator: Allocator,
    pub(crate) cb_records: HashMap<CommandBufferId, CommandBufferRecord>,
    pub(crate) committed: u64,
    pub(crate) scheduled: u64,
    pub(crate) completed: u64,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            allocator: Allocator::new(),
            cb_records: HashMap::new(),
            committed: 0,
            scheduled: 0,
            completed: 0,
        }
    }
}

static NEXT_DEVICE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// One eager execution context: its own pending op list, allocator, and
/// backend. A `Tensor` created by one device is still a valid argument to
/// another device's `execute_operation`/`copy_tensor`: both transparently
/// copy it in first (host round-trip) rather than rejecting it, since a
/// handle's owning device is recorded on the handle itself (`id()` gives
/// each device's identity for that comparison).
pub struct Device {
    id: u64,
    pub(crate) config: RuntimeConfig,
    pub(crate) debug: DebugFlags,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) self_weak: std::sync::Weak<Device>,
}

impl Device {
    pub fn new(config: RuntimeConfig, backend: Box<dyn Backend>) -> Arc<Device> {
        Arc::new_cyclic(|weak| Device {
            id: NEXT_DEVICE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            config,
            debug: DebugFlags::from_env(),
            backend,
            state: Mutex::new(DeviceState::new()),
            self_weak: weak.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Allocate a tensor and fill it immediately via
    /// `init`, which receives its writable bytes. Returns with
    /// `is_initialized() == true` and a refcount of 1, matching the
    /// external contract exactly — there is no separate "allocate, then
    /// write later" step in the public API.
    pub fn create_tensor(&self, dtype: DataType, shape: &[u32], init: impl FnOnce(&mut [u8])) -> Tensor {
        let tensor = self.create_output_handle(dtype, shape);
        let byte_count = tensor.byte_count();
        if byte_count > 0 {
            let buffer = self.allocate_buffer(byte_count, StorageMode::Shared);
            init(&mut buffer.storage.lock()[..byte_count as usize]);
            let mut state = tensor.inner.state.lock();
            state.buffer = Some(buffer);
            state.materialized = true;
        }
        tensor.inner.state.lock().initialized = true;
        tensor
    }

    /// Allocate an uninitialized output handle for an op the queue/compiler
    /// is about to schedule. Not part of the public API: an op's output
    /// only becomes readable once the instruction that produces it runs.
    pub(crate) fn create_output_handle(&self, dtype: DataType, shape: &[u32]) -> Tensor {
        Tensor::new(self.self_weak.clone(), dtype, shape)
    }

    /// Allocate `byte_count` bytes outside the command stream's own batch
    /// retry (used for host-initiated writes in `create_tensor`), following
    /// the same "drain in-flight work and retry once, bypassing the
    /// working-set limit" policy the command stream's own OOM retry uses
    /// before giving up. A second failure is an unrecoverable device-level
    /// error.
    fn allocate_buffer(&self, byte_count: u64, mode: StorageMode) -> DeviceBuffer {
        let first = self.state.lock().allocator.allocate(&self.config, byte_count, mode, false);
        match first {
            Ok(buf) => return buf,
            Err(e) if e.kind() == ErrorKind::OutOfDeviceMemory => {}
            Err(e) => tensor_base::error::fatal_contract_violation(format!("allocation failed: {e}")),
        }
        command_stream::drain_in_flight(self);
        match self.state.lock().allocator.allocate(&self.config, byte_count, mode, true) {
            Ok(buf) => buf,
            Err(e) => {
                log::error!("out of device memory after drain and retry: {e}");
                std::process::abort();
            }
        }
    }

    /// Read out the bytes of an initialized tensor, forcing completion of
    /// whatever instruction still needs to write it.
    pub fn read_tensor(&self, tensor: &Tensor) -> Vec<u8> {
        if !tensor.is_initialized() {
            tensor_base::error::fatal_contract_violation("read of an uninitialized tensor");
        }
        self.wait_for_writer(tensor);
        let state = tensor.inner.state.lock();
        if let Some(data) = &state.constant_data {
            return data.to_vec();
        }
        let buf = state
            .buffer
            .as_ref()
            .expect("initialized tensor without a backing buffer");
        let bytes = buf.storage.lock()[..tensor.byte_count() as usize].to_vec();
        bytes
    }

    pub(crate) fn wait_for_writer(&self, tensor: &Tensor) {
        let cb_id = tensor.inner.state.lock().last_writer_cb_id;
        if cb_id == crate::handle::NO_WRITER {
            return;
        }
        self.block_until_cb_complete(cb_id);
    }

    pub(crate) fn block_until_cb_complete(&self, cb_id: CommandBufferId) {
        let waiter = self.state.lock().cb_records.get(&cb_id).map(|r| Arc::clone(&r.waiter));
        if let Some(w) = waiter {
            w.wait();
        }
    }

    /// Execute one named op. Any input handle not owned by `self` is
    /// transparently copied in first (host round-trip) rather than
    /// rejected: mixing devices in one call is a slow path, not an error.
    pub fn execute_operation(
        &self,
        name: &str,
        attrs: &AttrBuffer<'_>,
        arena: &[u8],
        inputs: &[Tensor],
        output_shape: &[u32],
    ) -> Tensor {
        let localized: Vec<Tensor> = inputs.iter().map(|t| self.ensure_local(t)).collect();
        queue::execute_operation(self, name, attrs, arena, &localized, output_shape)
    }

    /// A standalone buffer-to-buffer copy ("explicit copy"). `input` may
    /// live on a different device than `self`; in that case the copy goes
    /// through the host (`src_device.read_tensor` followed by
    /// `self.create_tensor`) instead of the local same-device fast path.
    pub fn copy_tensor(&self, input: &Tensor) -> Tensor {
        if self.owns(input) {
            queue::copy_tensor(self, input)
        } else {
            self.copy_from_other_device(input)
        }
    }

    /// Whether `tensor` was created by `self`, i.e. its `execute_operation`/
    /// `copy_tensor` inputs can be dispatched without a cross-device copy.
    /// A dropped owning device can never compare equal, so it falls through
    /// to the cross-device path and fails there instead of here.
    fn owns(&self, tensor: &Tensor) -> bool {
        tensor.inner.device.upgrade().is_some_and(|d| d.id() == self.id())
    }

    /// Bring a tensor owned by some other device onto `self` by reading its
    /// bytes back to the host and recreating it here. Used both for the
    /// explicit `copy_tensor` entry point and to localize stray
    /// cross-device inputs to `execute_operation`.
    fn ensure_local(&self, tensor: &Tensor) -> Tensor {
        if self.owns(tensor) {
            tensor.clone()
        } else {
            self.copy_from_other_device(tensor)
        }
    }

    fn copy_from_other_device(&self, tensor: &Tensor) -> Tensor {
        let src_device = tensor
            .inner
            .device
            .upgrade()
            .unwrap_or_else(|| tensor_base::error::fatal_contract_violation(
                "cross-device copy: source device has been dropped",
            ));
        let bytes = src_device.read_tensor(tensor);
        self.create_tensor(tensor.dtype(), tensor.shape(), |buf| buf.copy_from_slice(&bytes))
    }

    /// Full flush, then block until everything committed so far has
    /// completed.
    pub fn barrier(&self) {
        command_stream::flush_stream(self);
        let last = {
            let state = self.state.lock();
            state.committed.checked_sub(1)
        };
        if let Some(id) = last {
            self.block_until_cb_complete(id);
        }
    }

    pub(crate) fn on_scheduled(&self, _cb_id: CommandBufferId) {
        self.state.lock().scheduled += 1;
        if self.debug.command_stream {
            log::debug!("cb {_cb_id} scheduled");
        }
    }

    pub(crate) fn on_completed(&self, cb_id: CommandBufferId) {
        let should_refill = {
            let mut state = self.state.lock();
            state.completed += 1;
            if let Some(record) = state.cb_records.remove(&cb_id) {
                record.waiter.mark_done();
            }
            if self.debug.command_stream {
                log::debug!(
                    "cb {cb_id} completed (committed={} scheduled={} completed={})",
                    state.committed,
                    state.scheduled,
                    state.completed
                );
            }
            !state.pending.is_empty() && state.committed == state.completed
        };
        if should_refill {
            command_stream::flush_stream(self);
        }
    }

    /// Release a tensor's backing buffer back into the allocator, blocking
    /// first if its last writer hasn't completed. Called
    /// from `TensorInner`'s `Drop` once its last handle goes away.
    pub(crate) fn release_tensor_buffer(&self, cb_id: u64, buffer: Option<crate::allocator::DeviceBuffer>) {
        if cb_id != crate::handle::NO_WRITER {
            self.block_until_cb_complete(cb_id);
        }
        if let Some(buf) = buffer {
            self.state.lock().allocator.free(buf);
        }
    }
}
