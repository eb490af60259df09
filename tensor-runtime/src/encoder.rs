//! Dispatch header construction.
//!
//! Both the real encode path (`command_stream::flush_stream`) and the
//! constant folder build the same small header describing how to load each
//! operand into the kernel's working registers, so this lives in its own
//! module rather than being duplicated.

use smallvec::SmallVec;
use tensor_base::DataType;

use crate::instr::ElementwiseInstr;

/// How to promote a stored dtype into the kernel's working register type on
/// load (and demote it back on store, for the output slot).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryCast {
    None,
    I8AsI32,
    U8AsI32,
    I16AsI32,
    U16AsI32,
    BoolAsI32,
    F16AsF32,
    U32AsU64,
}

impl MemoryCast {
    pub fn for_dtype(dtype: DataType) -> MemoryCast {
        match dtype {
            DataType::F32 | DataType::I32 | DataType::I64 | DataType::U64 => MemoryCast::None,
            DataType::I8 => MemoryCast::I8AsI32,
            DataType::U8 => MemoryCast::U8AsI32,
            DataType::I16 => MemoryCast::I16AsI32,
            DataType::U16 => MemoryCast::U16AsI32,
            DataType::Bool => MemoryCast::BoolAsI32,
            DataType::F16 => MemoryCast::F16AsF32,
            DataType::U32 => MemoryCast::U32AsU64,
            other => tensor_base::error::fatal_contract_violation(format!(
                "unsupported dtype {other:?}"
            )),
        }
    }
}

/// Per-slot `{layout, memory_cast}` pair. The high bit of `layout` flags
/// "this input is a single scalar, broadcast it".
#[derive(Debug, Clone, Copy)]
pub struct SlotDesc {
    pub broadcast: bool,
    pub memory_cast: MemoryCast,
}

/// The packed description the encoder hands to the kernel pipeline
/// alongside the `ops`/`metadata` constant buffers.
#[derive(Debug, Clone)]
pub struct DispatchHeader {
    pub inputs: SmallVec<[SlotDesc; 4]>,
    pub output_cast: MemoryCast,
    pub input_count: usize,
    pub operation_count: usize,
}

/// Threads-per-threadgroup divisor: `V = 4` for `G32`, `V = 2` for `G64`.
pub fn threadgroup_divisor(group: tensor_base::DataGroup) -> u64 {
    match group {
        tensor_base::DataGroup::G32 => 4,
        tensor_base::DataGroup::G64 => 2,
    }
}

pub fn dispatch_threadgroups(size: u64, group: tensor_base::DataGroup) -> u64 {
    let v = threadgroup_divisor(group);
    (size + v - 1) / v
}

pub fn build_dispatch_header(instr: &ElementwiseInstr) -> DispatchHeader {
    let inputs = instr
        .inputs
        .iter()
        .map(|t| SlotDesc {
            broadcast: t.is_scalar() && t.element_count() == 1 && instr.size != 1,
            memory_cast: MemoryCast::for_dtype(t.dtype()),
        })
        .collect();
    DispatchHeader {
        inputs,
        output_cast: MemoryCast::for_dtype(instr.output.dtype()),
        input_count: instr.inputs.len(),
        operation_count: instr.operations.len(),
    }
}
