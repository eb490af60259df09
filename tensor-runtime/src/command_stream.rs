//! Batching, backpressure, command buffer assignment, and the single-retry
//! OOM protocol.
//!
//! `flush_stream` is the only place that talks to both the compiler and the
//! backend: it drains a batch off the pending queue, compiles it, allocates
//! and encodes every instruction's output, and commits. Everything here runs
//! with the device's state mutex dropped before `Backend::commit` is called,
//! so the backend's `on_scheduled`/`on_completed` callbacks — which re-lock
//! that same mutex — never reenter a lock this thread is still holding, the
//! same discipline `CbWaiter::wait` below uses around its own condition
//! variable.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tensor_base::ErrorKind;

use crate::allocator::StorageMode;
use crate::backend::CommandBufferId;
use crate::compiler;
use crate::device::{CommandBufferRecord, Device};
use crate::encoder;
use crate::instr::Instruction;
use crate::queue::EagerOp;

/// Per-command-buffer completion signal, modeled on the backend's own
/// `CbStateTracker`: a flag plus a condvar, flipped once from the
/// completion callback and waited on from any number of threads.
pub(crate) struct CbWaiter {
    done: Mutex<bool>,
    cv: Condvar,
}

impl CbWaiter {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    pub(crate) fn mark_done(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

/// Decide whether the pending queue should drain now: unconditionally once it's grown past `max_batch`, or whenever the device
/// isn't comfortably ahead of its own backpressure window.
pub(crate) fn maybe_flush(device: &Device) {
    let should_flush = {
        let state = device.state.lock();
        if state.pending.is_empty() {
            return;
        }
        let backpressure = state.committed - state.completed;
        state.pending.len() > device.config.max_batch
            || backpressure == 0
            || (backpressure == 1 && state.committed == state.scheduled)
    };
    if should_flush {
        flush_stream(device);
    }
}

/// Drain one batch, compile it, encode it, and commit it. Called directly by
/// `maybe_flush` and `Device::barrier`, and re-entered by `on_completed` when
/// draining leaves more pending work behind.
pub(crate) fn flush_stream(device: &Device) {
    let batch: Vec<EagerOp> = {
        let mut state = device.state.lock();
        if state.pending.is_empty() {
            return;
        }
        let take = state.pending.len().min(device.config.max_batch.max(1));
        state.pending.drain(..take).collect()
    };

    let instructions = compiler::compile(batch);
    if instructions.is_empty() {
        return;
    }

    let mut bypass_limit = false;
    let cb_id = loop {
        let cb_id = next_cb_id(device);
        match encode_all(device, cb_id, &instructions, bypass_limit) {
            Ok(()) => break cb_id,
            Err(e) if e.kind() == ErrorKind::OutOfDeviceMemory && !bypass_limit => {
                // Force completion of whatever's in flight and
                // retry exactly once, bypassing the working-set limit.
                drain_in_flight(device);
                bypass_limit = true;
            }
            Err(e) => tensor_base::error::fatal_contract_violation(format!(
                "command buffer {cb_id} failed to encode: {e}"
            )),
        }
    };

    let waiter = Arc::new(CbWaiter::new());
    device.state.lock().cb_records.insert(
        cb_id,
        CommandBufferRecord {
            instructions,
            waiter: Arc::clone(&waiter),
        },
    );

    let device_for_scheduled = device
        .self_weak
        .upgrade()
        .expect("device dropped with a command buffer still in flight");
    let device_for_completed = Arc::clone(&device_for_scheduled);
    device.backend.commit(
        cb_id,
        Box::new(move || device_for_scheduled.on_scheduled(cb_id)),
        Box::new(move || device_for_completed.on_completed(cb_id)),
    );
}

fn next_cb_id(device: &Device) -> CommandBufferId {
    let mut state = device.state.lock();
    let id = state.committed;
    state.committed += 1;
    id
}

/// Allocate every instruction's output buffer, then encode each instruction.
/// Allocation runs to completion (or fails as a whole) before any backend
/// `encode_*` call is made, so a failure here never leaves a partially
/// encoded command buffer for the retry to duplicate into.
fn encode_all(
    device: &Device,
    cb_id: CommandBufferId,
    instructions: &[Instruction],
    bypass_limit: bool,
) -> tensor_base::Result<()> {
    for instr in instructions {
        materialize_output(device, instr.output(), cb_id, bypass_limit)?;
    }
    for instr in instructions {
        match instr {
            Instruction::Elementwise(e) => {
                let header = encoder::build_dispatch_header(e);
                device.backend.encode_elementwise(cb_id, e, &header)?;
            }
            Instruction::ExplicitCopy(c) => {
                device.backend.encode_copy(cb_id, c)?;
            }
        }
    }
    Ok(())
}

fn materialize_output(
    device: &Device,
    tensor: &crate::handle::Tensor,
    cb_id: CommandBufferId,
    bypass_limit: bool,
) -> tensor_base::Result<()> {
    let mut state = tensor.inner.state.lock();
    if !state.materialized {
        let buffer = device.state.lock().allocator.allocate(
            &device.config,
            tensor.byte_count(),
            StorageMode::Shared,
            bypass_limit,
        )?;
        state.buffer = Some(buffer);
        state.materialized = true;
    }
    state.last_writer_cb_id = cb_id;
    Ok(())
}

/// Block until every command buffer currently recorded as in flight has
/// completed, so the allocator sees whatever those buffers' outputs freed.
pub(crate) fn drain_in_flight(device: &Device) {
    let waiters: Vec<Arc<CbWaiter>> = device
        .state
        .lock()
        .cb_records
        .values()
        .map(|r| Arc::clone(&r.waiter))
        .collect();
    for waiter in waiters {
        waiter.wait();
    }
}
