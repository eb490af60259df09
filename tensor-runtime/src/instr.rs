//! Compiled instruction types: the compiler's output and the command
//! stream's unit of encoding.

use smallvec::SmallVec;
use tensor_base::DataGroup;

use crate::handle::Tensor;

/// A fused chain of elementwise ops sharing one GPU dispatch.
#[derive(Debug, Clone)]
pub struct ElementwiseInstr {
    pub operations: Vec<u16>,
    pub metadata: Vec<u64>,
    pub data_group: DataGroup,
    /// Up to four input buffers, in register order.
    pub inputs: SmallVec<[Tensor; 4]>,
    pub output: Tensor,
    pub size: u64,
    pub num_fused_unary: usize,
    pub num_fused_non_unary: usize,
}

/// A standalone buffer-to-buffer copy, always emitted on its own.
#[derive(Debug, Clone)]
pub struct CopyInstr {
    pub input: Tensor,
    pub output: Tensor,
    pub byte_count: u64,
}

#[derive(Debug, Clone)]
pub enum Instruction {
    Elementwise(ElementwiseInstr),
    ExplicitCopy(CopyInstr),
}

impl Instruction {
    pub fn output(&self) -> &Tensor {
        match self {
            Instruction::Elementwise(e) => &e.output,
            Instruction::ExplicitCopy(c) => &c.output,
        }
    }
}
