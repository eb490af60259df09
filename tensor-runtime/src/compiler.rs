//! The fusion compiler: walks one flushed batch of eager ops once,
//! producing a vector of instructions for the command stream to encode.

use std::collections::HashMap;

use smallvec::{smallvec, SmallVec};
use tensor_base::ops::swap;
use tensor_base::{DataGroup, OpKind, TernaryOp};

use crate::handle::Tensor;
use crate::instr::{CopyInstr, ElementwiseInstr, Instruction};
use crate::queue::EagerOp;

/// State carried while a run of ops is being fused into one dispatch.
struct Fusion {
    heads: SmallVec<[Tensor; 4]>,
    ops: Vec<u16>,
    metadata: Vec<u64>,
    tail: Tensor,
    tail_refcount_snapshot: usize,
    size: u64,
    data_group: DataGroup,
    num_fused_unary: usize,
    num_fused_non_unary: usize,
}

impl Fusion {
    fn new_unary(kind: OpKind, input: Tensor, output: Tensor) -> Self {
        let mut ops = Vec::new();
        let mut metadata = Vec::new();
        if !kind.is_no_op() {
            ops.push(kind.op_code());
            if let Some(m) = kind.metadata() {
                metadata.push(m);
            }
        }
        let data_group = kind.input_group(input.dtype());
        Fusion {
            heads: smallvec![input],
            ops,
            metadata,
            tail_refcount_snapshot: output.refcount(),
            size: output.element_count(),
            data_group,
            tail: output,
            num_fused_unary: 1,
            num_fused_non_unary: 0,
        }
    }

    /// Rebuild a fusion-in-progress from a previously-closed instruction,
    /// reopened for non-adjacent fusion (the history cache). The caller
    /// is responsible for flipping the reopened output's `initialized`
    /// flag back to `false`.
    fn reopen(e: ElementwiseInstr) -> Self {
        Fusion {
            heads: e.inputs,
            ops: e.operations,
            metadata: e.metadata,
            tail_refcount_snapshot: e.output.refcount(),
            size: e.size,
            data_group: e.data_group,
            tail: e.output,
            num_fused_unary: e.num_fused_unary,
            num_fused_non_unary: e.num_fused_non_unary,
        }
    }

    fn continue_unary(&mut self, kind: OpKind, output: Tensor) {
        if !kind.is_no_op() {
            self.ops.push(kind.op_code());
            if let Some(m) = kind.metadata() {
                self.metadata.push(m);
            }
        }
        self.tail_refcount_snapshot = output.refcount();
        self.tail = output;
        self.num_fused_unary += 1;
    }

    /// Binary continuation: place the non-tail operand in the next free head
    /// slot, swap it into register 2, and if the matching operand was the
    /// *right*-hand side, swap registers 1 and 2 afterward so the op still
    /// reads `{lhs, rhs}` in the right order.
    fn continue_binary(&mut self, kind: OpKind, tail_is_lhs: bool, other: Tensor, output: Tensor) {
        self.heads.push(other);
        match self.heads.len() {
            2 => {}
            3 => self.ops.push(swap::REGISTERS_2_3),
            4 => self.ops.push(swap::REGISTERS_2_4),
            n => unreachable!("binary fusion continuation with {n} heads"),
        }
        if !tail_is_lhs {
            self.ops.push(swap::REGISTERS_1_2);
        }
        self.ops.push(kind.op_code());
        self.tail_refcount_snapshot = output.refcount();
        self.tail = output;
        self.num_fused_non_unary += 1;
    }

    /// Ternary continuation, restricted to the one-head-loaded case — see
    /// [`ternary_routing`] for why only this layout is fused.
    fn continue_ternary(&mut self, new_heads: [Tensor; 2], swaps: &[u16], output: Tensor) {
        debug_assert_eq!(self.heads.len(), 1);
        self.heads.push(new_heads[0].clone());
        self.heads.push(new_heads[1].clone());
        self.ops.extend_from_slice(swaps);
        self.ops.push(OpKind::Ternary(TernaryOp::Select).op_code());
        self.tail_refcount_snapshot = output.refcount();
        self.tail = output;
        self.num_fused_non_unary += 1;
    }

    fn into_instr(self) -> ElementwiseInstr {
        ElementwiseInstr {
            operations: self.ops,
            metadata: self.metadata,
            data_group: self.data_group,
            inputs: self.heads,
            output: self.tail,
            size: self.size,
            num_fused_unary: self.num_fused_unary,
            num_fused_non_unary: self.num_fused_non_unary,
        }
    }
}

/// Which of a ternary op's three operands matches the current fusion tail,
/// and the register-swap sequence needed to route `{cond, if_true,
/// if_false}` into registers `{1, 2, 3}` given the one-head-loaded starting
/// layout (register 1 holds the tail; registers 2-4 are all still free).
/// Only this starting layout is handled — see `continue_ternary`'s caller.
fn ternary_routing(tail_is: TernaryPosition) -> &'static [u16] {
    match tail_is {
        // cond already sits in register 1; if_true and if_false land
        // directly in the free registers 2 and 3 — no swap required.
        TernaryPosition::Cond => &[],
        // if_true is in register 1 but belongs in register 2; cond and
        // if_false load into 2 and 3, then one swap puts everything right.
        TernaryPosition::IfTrue => &[swap::REGISTERS_1_2],
        // if_false is in register 1 but belongs in register 3; cond and
        // if_true load into 2 and 3, then a 3-cycle (two swaps) fixes it.
        TernaryPosition::IfFalse => &[swap::REGISTERS_1_2, swap::REGISTERS_2_3],
    }
}

#[derive(Clone, Copy)]
enum TernaryPosition {
    Cond,
    IfTrue,
    IfFalse,
}

/// Per-flush compiler state: the fusion in progress, the finished
/// instruction list (with `None` placeholders where non-adjacent fusion
/// reopened and removed an entry), and the history cache mapping a closed
/// fusion's tail identity to its index in `out`.
struct CompileState {
    current: Option<Fusion>,
    out: Vec<Option<Instruction>>,
    history: HashMap<usize, usize>,
}

impl CompileState {
    fn new() -> Self {
        Self {
            current: None,
            out: Vec::new(),
            history: HashMap::new(),
        }
    }

    /// Close the fusion in progress, if any: validate it, mark its tail
    /// initialized, push it, and record it in the history cache when its
    /// tail is referenced by nothing but this instruction.
    fn close_current(&mut self) {
        let Some(fusion) = self.current.take() else {
            return;
        };
        let eligible_for_reuse = fusion.tail_refcount_snapshot == 1;
        let tail = fusion.tail.clone();
        tail.set_initialized(true);
        let index = self.out.len();
        self.out.push(Some(Instruction::Elementwise(fusion.into_instr())));
        if eligible_for_reuse {
            self.history.insert(tail.identity(), index);
        }
    }

    /// Non-adjacent fusion reuse (unary only — see `DESIGN.md`):
    /// if `tail` identifies a cached, still-reusable closed instruction,
    /// pull it back out of `out` (leaving a `nil` placeholder) and hand
    /// back a reopened [`Fusion`].
    fn try_reopen(&mut self, tail: &Tensor) -> Option<Fusion> {
        if tail.refcount() != 1 {
            return None;
        }
        let index = *self.history.get(&tail.identity())?;
        let slot = self.out[index].take()?;
        self.history.remove(&tail.identity());
        let Instruction::Elementwise(e) = slot else {
            // Shouldn't happen: only elementwise instructions are recorded
            // in the history cache. Put it back and decline to reopen.
            self.out[index] = Some(slot);
            return None;
        };
        e.output.set_initialized(false);
        Some(Fusion::reopen(e))
    }

    fn handle_unary(&mut self, kind: OpKind, input: Tensor, output: Tensor) {
        if let Some(f) = &self.current {
            if input.identity() == f.tail.identity() && kind.input_group(input.dtype()) == f.data_group {
                self.current.as_mut().unwrap().continue_unary(kind, output);
                return;
            }
        }
        self.close_current();
        if let Some(mut f) = self.try_reopen(&input) {
            f.continue_unary(kind, output);
            self.current = Some(f);
            return;
        }
        self.current = Some(Fusion::new_unary(kind, input, output));
    }

    fn handle_binary(&mut self, kind: OpKind, lhs: Tensor, rhs: Tensor, output: Tensor) {
        if let Some(f) = &self.current {
            let group_ok = kind.input_group(lhs.dtype()) == f.data_group
                || kind.input_group(rhs.dtype()) == f.data_group;
            let tail_is_lhs = f.tail.identity() == lhs.identity();
            let tail_is_rhs = f.tail.identity() == rhs.identity();
            if (tail_is_lhs || tail_is_rhs) && f.heads.len() < 4 && group_ok {
                let other = if tail_is_lhs { rhs.clone() } else { lhs.clone() };
                self.current
                    .as_mut()
                    .unwrap()
                    .continue_binary(kind, tail_is_lhs, other, output);
                return;
            }
        }
        self.close_current();
        // Non-adjacent fusion reopening is implemented for the unary case
        // only; binary ops that don't extend the just-closed fusion simply
        // start a new one.
        let data_group = kind.input_group(lhs.dtype());
        self.current = Some(Fusion {
            heads: smallvec![lhs, rhs],
            ops: vec![kind.op_code()],
            metadata: kind.metadata().into_iter().collect(),
            tail_refcount_snapshot: output.refcount(),
            size: output.element_count(),
            data_group,
            tail: output,
            num_fused_unary: 0,
            num_fused_non_unary: 1,
        });
    }

    fn handle_ternary(&mut self, cond: Tensor, if_true: Tensor, if_false: Tensor, output: Tensor) {
        if let Some(f) = &self.current {
            let tail_pos = if f.tail.identity() == cond.identity() {
                Some(TernaryPosition::Cond)
            } else if f.tail.identity() == if_true.identity() {
                Some(TernaryPosition::IfTrue)
            } else if f.tail.identity() == if_false.identity() {
                Some(TernaryPosition::IfFalse)
            } else {
                None
            };
            if let Some(pos) = tail_pos {
                if f.heads.len() == 1 {
                    let swaps = ternary_routing(pos);
                    let new_heads = match pos {
                        TernaryPosition::Cond => [if_true.clone(), if_false.clone()],
                        TernaryPosition::IfTrue => [cond.clone(), if_false.clone()],
                        TernaryPosition::IfFalse => [cond.clone(), if_true.clone()],
                    };
                    self.current
                        .as_mut()
                        .unwrap()
                        .continue_ternary(new_heads, swaps, output);
                    return;
                }
            }
        }
        self.close_current();
        self.current = Some(Fusion {
            heads: smallvec![cond, if_true, if_false],
            ops: vec![OpKind::Ternary(TernaryOp::Select).op_code()],
            metadata: Vec::new(),
            tail_refcount_snapshot: output.refcount(),
            size: output.element_count(),
            data_group: output.dtype().group(),
            tail: output,
            num_fused_unary: 0,
            num_fused_non_unary: 1,
        });
    }

    fn handle_copy(&mut self, input: Tensor, output: Tensor, byte_count: u64) {
        self.close_current();
        output.set_initialized(true);
        self.out.push(Some(Instruction::ExplicitCopy(CopyInstr {
            input,
            output,
            byte_count,
        })));
    }

    fn finish(mut self) -> Vec<Instruction> {
        self.close_current();
        self.out.into_iter().flatten().collect()
    }
}

/// Compile one flushed batch of eager ops into instructions. The
/// batch is consumed: every `Tensor` clone it owns either becomes part of a
/// kept instruction or is dropped here, matching ordinary ownership rather
/// than a hand-rolled reference count.
pub fn compile(batch: Vec<EagerOp>) -> Vec<Instruction> {
    let mut state = CompileState::new();
    for op in batch {
        match op {
            EagerOp::Elementwise { kind, inputs, output } => match kind.arity() {
                tensor_base::Arity::Unary => {
                    state.handle_unary(kind, inputs[0].clone(), output);
                }
                tensor_base::Arity::Binary => {
                    state.handle_binary(kind, inputs[0].clone(), inputs[1].clone(), output);
                }
                tensor_base::Arity::Ternary => {
                    state.handle_ternary(inputs[0].clone(), inputs[1].clone(), inputs[2].clone(), output);
                }
            },
            EagerOp::Copy { input, output, byte_count } => {
                state.handle_copy(input, output, byte_count);
            }
        }
    }
    state.finish()
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use smallvec::smallvec;
    use tensor_base::ops::swap;
    use tensor_base::{BinaryOp, TernaryOp, UnaryOp};

    use super::*;

    fn vector(dtype: tensor_base::DataType) -> Tensor {
        Tensor::new(Weak::new(), dtype, &[2])
    }

    fn scalar(dtype: tensor_base::DataType) -> Tensor {
        Tensor::new(Weak::new(), dtype, &[])
    }

    /// `square -> cast<i8> -> cast<f16> -> sqrt`, every dtype in the same
    /// data group: one dispatch.
    #[test]
    fn unary_chain_within_one_data_group_fuses_into_one_instruction() {
        use tensor_base::DataType::*;
        let t0 = vector(F32);
        let t1 = vector(F32);
        let t2 = vector(I8);
        let t3 = vector(F16);
        let t4 = vector(F16);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Square),
                inputs: smallvec![t0.clone()],
                output: t1.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Cast { from: F32, to: I8 }),
                inputs: smallvec![t1.clone()],
                output: t2.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Cast { from: I8, to: F16 }),
                inputs: smallvec![t2.clone()],
                output: t3.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Sqrt),
                inputs: smallvec![t3.clone()],
                output: t4.clone(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 1);
        let Instruction::Elementwise(e) = &instrs[0] else {
            panic!("expected a fused elementwise instruction")
        };
        assert_eq!(e.operations.len(), 4);
        assert_eq!(e.inputs.len(), 1);
        assert_eq!(e.inputs[0], t0);
        assert_eq!(e.output, t4);
    }

    /// Same chain, but the cast now lands on `i64` (`G64`) before coming
    /// back to `f16` (`G32`): the group crossing forces two extra breaks.
    #[test]
    fn casting_through_the_other_data_group_breaks_fusion_into_three_instructions() {
        use tensor_base::DataType::*;
        let t0 = vector(F32);
        let t1 = vector(F32);
        let t2 = vector(I64);
        let t3 = vector(F16);
        let t4 = vector(F16);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Square),
                inputs: smallvec![t0.clone()],
                output: t1.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Cast { from: F32, to: I64 }),
                inputs: smallvec![t1.clone()],
                output: t2.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Cast { from: I64, to: F16 }),
                inputs: smallvec![t2.clone()],
                output: t3.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Sqrt),
                inputs: smallvec![t3.clone()],
                output: t4.clone(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 3);
    }

    /// `sqrt -> min -> max -> neg -> max`: a mixed unary/binary chain that
    /// fuses into one dispatch, routing every operand through four head
    /// slots with the register-swap sequence the binary continuation rule
    /// produces.
    #[test]
    fn binary_chain_fuses_with_register_swaps() {
        use tensor_base::DataType::F32;
        let t0 = vector(F32);
        let a = vector(F32);
        let c1 = scalar(F32);
        let b = vector(F32);
        let c2 = scalar(F32);
        let c = vector(F32);
        let d = vector(F32);
        let c3 = scalar(F32);
        let e = vector(F32);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Sqrt),
                inputs: smallvec![t0.clone()],
                output: a.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Min),
                inputs: smallvec![a.clone(), c1.clone()],
                output: b.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Max),
                inputs: smallvec![b.clone(), c2.clone()],
                output: c.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Neg),
                inputs: smallvec![c.clone()],
                output: d.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Max),
                inputs: smallvec![d.clone(), c3.clone()],
                output: e.clone(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 1);
        let Instruction::Elementwise(ins) = &instrs[0] else {
            panic!("expected a fused elementwise instruction")
        };
        assert_eq!(ins.inputs.len(), 4);
        assert_eq!(ins.output, e);
        assert!(ins.operations.contains(&swap::REGISTERS_2_3));
        assert!(ins.operations.contains(&swap::REGISTERS_2_4));
    }

    /// A fifth operand would need a 5th head slot: the binary continuation
    /// rule caps at four, so the chain splits into two dispatches instead
    /// of failing.
    #[test]
    fn binary_chain_splits_once_four_head_slots_are_full() {
        use tensor_base::DataType::F32;
        let t0 = vector(F32);
        let a = vector(F32);
        let c1 = scalar(F32);
        let b = vector(F32);
        let c2 = scalar(F32);
        let c = vector(F32);
        let c3 = scalar(F32);
        let d = vector(F32);
        let c4 = scalar(F32);
        let e = vector(F32);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Sqrt),
                inputs: smallvec![t0.clone()],
                output: a.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Min),
                inputs: smallvec![a.clone(), c1.clone()],
                output: b.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Max),
                inputs: smallvec![b.clone(), c2.clone()],
                output: c.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Max),
                inputs: smallvec![c.clone(), c3.clone()],
                output: d.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Binary(BinaryOp::Max),
                inputs: smallvec![d.clone(), c4.clone()],
                output: e.clone(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 2);
    }

    /// `select(cond, x, y) -> pow(·, 3) -> neg`: the ternary op opens a
    /// fusion with all three heads loaded from the start, and the trailing
    /// unary chain continues it without any register shuffling.
    #[test]
    fn ternary_select_fuses_with_trailing_unary_chain() {
        use tensor_base::DataType::{Bool, I32};
        let cond = vector(Bool);
        let x = vector(I32);
        let y = vector(I32);
        let s = vector(I32);
        let p = vector(I32);
        let n = vector(I32);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Ternary(TernaryOp::Select),
                inputs: smallvec![cond.clone(), x.clone(), y.clone()],
                output: s.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Pow { exponent: 3 }),
                inputs: smallvec![s.clone()],
                output: p.clone(),
            },
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Neg),
                inputs: smallvec![p.clone()],
                output: n.clone(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 1);
        let Instruction::Elementwise(ins) = &instrs[0] else {
            panic!("expected a fused elementwise instruction")
        };
        assert_eq!(ins.inputs.len(), 3);
        assert_eq!(ins.output, n);
        assert_eq!(ins.metadata, vec![3u64]);
    }

    /// A standalone copy always closes whatever fusion preceded it and
    /// never merges with surrounding elementwise ops.
    #[test]
    fn explicit_copy_stands_alone() {
        use tensor_base::DataType::F32;
        let t0 = vector(F32);
        let a = vector(F32);
        let copy_out = vector(F32);
        let batch = vec![
            EagerOp::Elementwise {
                kind: OpKind::Unary(UnaryOp::Neg),
                inputs: smallvec![t0.clone()],
                output: a.clone(),
            },
            EagerOp::Copy {
                input: a.clone(),
                output: copy_out.clone(),
                byte_count: a.byte_count(),
            },
        ];
        let instrs = compile(batch);
        assert_eq!(instrs.len(), 2);
        assert!(matches!(instrs[0], Instruction::Elementwise(_)));
        assert!(matches!(instrs[1], Instruction::ExplicitCopy(_)));
    }
}
