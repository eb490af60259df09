//! The seam between the device's scheduling logic and whatever actually
//! executes a command buffer.
//!
//! Nothing above this trait knows or cares whether `encode_elementwise`
//! touches a real GPU queue. The command stream encodes into whatever
//! `Backend` the device was built with, then commits it and waits for its
//! callbacks — the same shape as a `cmd_buffer.on_complete(Box::new(...))`
//! registration on a native command buffer.

use crate::encoder::DispatchHeader;
use crate::instr::{CopyInstr, ElementwiseInstr};
use tensor_base::Result;

/// A command buffer identifier. The device assigns these itself (`cb_id =
/// committed`) rather than asking the backend for one.
pub type CommandBufferId = u64;

/// Executes compiled instructions. `MockBackend` is the only implementation
/// in this crate; a real GPU backend would encode into native command
/// buffers instead of interpreting in place.
pub trait Backend: Send + Sync {
    /// Encode one fused elementwise dispatch into command buffer `cb_id`,
    /// using the dispatch header the encoder built for it. Returns an error
    /// if the backend cannot encode it (the OOM-during-encoding path reaches
    /// this through the allocator, not here, but a real backend may have its
    /// own encode-time failures).
    fn encode_elementwise(
        &self,
        cb_id: CommandBufferId,
        instr: &ElementwiseInstr,
        header: &DispatchHeader,
    ) -> Result<()>;

    /// Encode a standalone buffer copy.
    fn encode_copy(&self, cb_id: CommandBufferId, instr: &CopyInstr) -> Result<()>;

    /// Commit `cb_id`. `on_scheduled` fires once the backend has accepted
    /// the buffer for execution (the "scheduled" counter); `on_completed`
    /// fires once execution finishes, from whatever thread the backend
    /// chooses to call back on.
    fn commit(
        &self,
        cb_id: CommandBufferId,
        on_scheduled: Box<dyn FnOnce() + Send>,
        on_completed: Box<dyn FnOnce() + Send>,
    );
}

mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use tensor_base::interp::{self, Scalar};
    use tensor_base::ops::swap;
    use tensor_base::{Error, OpKind, Result};

    use super::{Backend, CommandBufferId};
    use crate::encoder::DispatchHeader;
    use crate::instr::{CopyInstr, ElementwiseInstr};

    #[derive(Clone)]
    enum Recorded {
        Elementwise(ElementwiseInstr),
        Copy(CopyInstr),
    }

    /// An in-process stand-in for a GPU, executing each recorded instruction
    /// on the CPU via [`tensor_base::interp`] — the same evaluator the
    /// constant folder uses, which is what makes constant-folding
    /// equivalence hold for tests running against this backend.
    ///
    /// `commit` runs everything synchronously before invoking its
    /// callbacks: there is no real asynchrony to simulate, and the device's
    /// scheduling logic doesn't assume any ordering beyond "scheduled fires
    /// before completed".
    pub struct MockBackend {
        pending: Mutex<HashMap<CommandBufferId, Vec<Recorded>>>,
        /// When `Some(n)`, the next `n` calls to `encode_elementwise` fail
        /// with `ErrorKind::OutOfDeviceMemory` instead of recording anything
        /// — the test hook behind scenario S7 (OOM during encode, retry
        /// once, then abort).
        inject_oom: Mutex<Option<u32>>,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self {
                pending: Mutex::new(HashMap::new()),
                inject_oom: Mutex::new(None),
            }
        }
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` `encode_elementwise` calls fail with
        /// `OutOfDeviceMemory`.
        pub fn inject_oom(&self, count: u32) {
            *self.inject_oom.lock() = Some(count);
        }

        fn maybe_fail_oom(&self) -> Result<()> {
            let mut guard = self.inject_oom.lock();
            match *guard {
                Some(0) | None => Ok(()),
                Some(n) => {
                    *guard = Some(n - 1);
                    Err(Error::from(tensor_base::ErrorKind::OutOfDeviceMemory))
                }
            }
        }

        fn run_elementwise(instr: &ElementwiseInstr) {
            let size = instr.size;
            let output_dtype = instr.output.dtype();
            for i in 0..size {
                let mut regs: [Option<Scalar>; 4] = [None, None, None, None];
                for (slot, input) in instr.inputs.iter().enumerate() {
                    let element_index = if input.element_count() == 1 { 0 } else { i };
                    regs[slot] = Some(read_element(input, element_index));
                }
                let mut metadata_cursor = 0usize;
                for &code in &instr.operations {
                    if is_swap(code) {
                        apply_swap(code, &mut regs);
                        continue;
                    }
                    let needs_metadata = code == 4; // Pow is the only op carrying metadata
                    let metadata = if needs_metadata {
                        let m = instr.metadata.get(metadata_cursor).copied();
                        metadata_cursor += 1;
                        m
                    } else {
                        None
                    };
                    let kind = OpKind::from_code(code, metadata);
                    let operands: Vec<Scalar> = match kind.arity() {
                        tensor_base::Arity::Unary => vec![regs[0].unwrap()],
                        tensor_base::Arity::Binary => vec![regs[0].unwrap(), regs[1].unwrap()],
                        tensor_base::Arity::Ternary => {
                            vec![regs[0].unwrap(), regs[1].unwrap(), regs[2].unwrap()]
                        }
                    };
                    regs[0] = Some(interp::eval(kind, &operands, output_dtype));
                }
                write_element(&instr.output, i, regs[0].unwrap());
            }
        }

        fn run_copy(instr: &CopyInstr) {
            let src = instr.input.inner.state.lock();
            let src_buf = src.buffer.as_ref().expect("copy source must be materialized");
            let bytes = src_buf.storage.lock()[..instr.byte_count as usize].to_vec();
            drop(src);
            let dst = instr.output.inner.state.lock();
            let dst_buf = dst.buffer.as_ref().expect("copy destination must be allocated");
            dst_buf.storage.lock()[..instr.byte_count as usize].copy_from_slice(&bytes);
        }
    }

    fn is_swap(code: u16) -> bool {
        matches!(code, swap::REGISTERS_1_2 | swap::REGISTERS_2_3 | swap::REGISTERS_2_4)
    }

    fn apply_swap(code: u16, regs: &mut [Option<Scalar>; 4]) {
        match code {
            swap::REGISTERS_1_2 => regs.swap(0, 1),
            swap::REGISTERS_2_3 => regs.swap(1, 2),
            swap::REGISTERS_2_4 => regs.swap(1, 3),
            _ => unreachable!(),
        }
    }

    fn read_element(tensor: &crate::handle::Tensor, index: u64) -> Scalar {
        let state = tensor.inner.state.lock();
        let dtype = tensor.dtype();
        let stride = dtype.stride();
        if let Some(data) = &state.constant_data {
            return Scalar::read_le(dtype, &data[..stride]);
        }
        let buf = state
            .buffer
            .as_ref()
            .expect("mock backend read from unmaterialized tensor");
        let storage = buf.storage.lock();
        let start = index as usize * stride;
        Scalar::read_le(dtype, &storage[start..start + stride])
    }

    fn write_element(tensor: &crate::handle::Tensor, index: u64, value: Scalar) {
        let state = tensor.inner.state.lock();
        let dtype = tensor.dtype();
        let stride = dtype.stride();
        let buf = state
            .buffer
            .as_ref()
            .expect("mock backend write to unallocated tensor");
        let mut storage = buf.storage.lock();
        let start = index as usize * stride;
        value.write_le(&mut storage[start..start + stride]);
        debug_assert_eq!(dtype, value.dtype());
    }

    impl Backend for MockBackend {
        fn encode_elementwise(
            &self,
            cb_id: CommandBufferId,
            instr: &ElementwiseInstr,
            _header: &DispatchHeader,
        ) -> Result<()> {
            self.maybe_fail_oom()?;
            self.pending
                .lock()
                .entry(cb_id)
                .or_default()
                .push(Recorded::Elementwise(instr.clone()));
            Ok(())
        }

        fn encode_copy(&self, cb_id: CommandBufferId, instr: &CopyInstr) -> Result<()> {
            self.pending
                .lock()
                .entry(cb_id)
                .or_default()
                .push(Recorded::Copy(instr.clone()));
            Ok(())
        }

        fn commit(
            &self,
            cb_id: CommandBufferId,
            on_scheduled: Box<dyn FnOnce() + Send>,
            on_completed: Box<dyn FnOnce() + Send>,
        ) {
            on_scheduled();
            let recorded = self.pending.lock().remove(&cb_id).unwrap_or_default();
            for entry in &recorded {
                match entry {
                    Recorded::Elementwise(instr) => Self::run_elementwise(instr),
                    Recorded::Copy(instr) => Self::run_copy(instr),
                }
            }
            on_completed();
        }
    }
}

pub use mock::MockBackend;
