//! Operation identity: the small, dtype-parameterized vocabulary of
//! elementwise ops the core fuses and executes, and the numeric op-code
//! space the compiled instruction stream encodes them into.
//!
//! This module knows nothing about tensor handles or device state — it is
//! the pure, dtype-level half of "what operation is this", shared by the
//! compiler (which decides *when* to fuse) and the constant folder and
//! `Backend` implementations (which decide *how* to execute).

use crate::dtype::{DataGroup, DataType};

/// How many tensor operands an op consumes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Arity {
    Unary,
    Binary,
    Ternary,
}

impl Arity {
    /// The base offset added to a semantic op's small base code when it
    /// is appended to an instruction's `operations` stream.
    pub const fn code_offset(self) -> u16 {
        match self {
            Arity::Unary => 0,
            Arity::Binary => 1000,
            Arity::Ternary => 2000,
        }
    }
}

/// Register-swap pseudo-ops: these never appear as a real op's code,
/// only as bookkeeping the compiler inserts so a fused binary/ternary op
/// finds its operands in the registers the shader's little VM expects.
pub mod swap {
    pub const REGISTERS_1_2: u16 = 3000;
    pub const REGISTERS_2_3: u16 = 3001;
    pub const REGISTERS_2_4: u16 = 3002;
}

/// A unary elementwise op, parameterized by dtype where the operation's
/// identity depends on it (casts; everything else is dtype-polymorphic at
/// the VM level because the encoder's `memory_cast` already promoted the
/// operand into the kernel's working register type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    /// Emitted by the compiler itself to splice a reopened history-cache
    /// fusion back in without altering its tail value; never
    /// produced by the op queue.
    NoOp,
    Square,
    Sqrt,
    Neg,
    /// `x ** exponent`, exponent is a compile-time-known integer baked into
    /// the op's metadata slot.
    Pow { exponent: i64 },
    Cast { from: DataType, to: DataType },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Min,
    Max,
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TernaryOp {
    /// `select(cond, if_true, if_false)`.
    Select,
}

/// The op this eager call or fused slot represents, independent of arity
/// bookkeeping (which lives on the record/instruction that carries it).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
}

impl OpKind {
    pub const fn arity(self) -> Arity {
        match self {
            OpKind::Unary(_) => Arity::Unary,
            OpKind::Binary(_) => Arity::Binary,
            OpKind::Ternary(_) => Arity::Ternary,
        }
    }

    pub fn is_no_op(self) -> bool {
        matches!(self, OpKind::Unary(UnaryOp::NoOp))
    }

    /// The small (`<1000`) base code identifying this specific op-and-dtype
    /// combination, before the arity offset is added.
    pub fn base_code(self) -> u16 {
        match self {
            OpKind::Unary(UnaryOp::NoOp) => 0,
            OpKind::Unary(UnaryOp::Square) => 1,
            OpKind::Unary(UnaryOp::Sqrt) => 2,
            OpKind::Unary(UnaryOp::Neg) => 3,
            OpKind::Unary(UnaryOp::Pow { .. }) => 4,
            OpKind::Unary(UnaryOp::Cast { from, to }) => 100 + from.index() * 16 + to.index(),
            OpKind::Binary(BinaryOp::Min) => 0,
            OpKind::Binary(BinaryOp::Max) => 1,
            OpKind::Binary(BinaryOp::Add) => 2,
            OpKind::Binary(BinaryOp::Sub) => 3,
            OpKind::Binary(BinaryOp::Mul) => 4,
            OpKind::Ternary(TernaryOp::Select) => 0,
        }
    }

    /// The full op code as it appears in a compiled instruction's
    /// `operations` stream: base code plus the arity offset.
    pub fn op_code(self) -> u16 {
        self.base_code() + self.arity().code_offset()
    }

    /// The extra `metadata` word this op needs alongside its code, if any
    /// Most ops need none; at most two slots are ever used.
    pub fn metadata(self) -> Option<u64> {
        match self {
            OpKind::Unary(UnaryOp::Pow { exponent }) => Some(exponent as u64),
            _ => None,
        }
    }

    /// The register group this op must read its *input* operand through.
    /// For a cast this is the group of the *source* dtype: a cast whose
    /// source and destination straddle groups still "runs" in the source's
    /// group as far as fusion continuation is concerned, because the
    /// shader's `memory_cast` does the promotion on load — it is the
    /// *next* op, which now sees a tail of the destination dtype, that
    /// observes the group change and forces the break.
    pub fn input_group(self, input_dtype: DataType) -> DataGroup {
        let _ = self; // group is a function of the operand, not the op kind
        input_dtype.group()
    }

    /// Reconstruct an [`OpKind`] from a compiled instruction's `operations`
    /// code and, where the op needs one, its `metadata` word. The inverse of
    /// [`OpKind::op_code`]/[`OpKind::metadata`] — used by anything that
    /// walks an already-compiled `operations` stream back to semantics
    /// (`Backend` implementations that don't have a real shader compiler).
    /// `code` must not be a register-swap pseudo-op (the `swap` module);
    /// callers handle those separately.
    pub fn from_code(code: u16, metadata: Option<u64>) -> OpKind {
        let (arity, base) = if code < Arity::Binary.code_offset() {
            (Arity::Unary, code)
        } else if code < Arity::Ternary.code_offset() {
            (Arity::Binary, code - Arity::Binary.code_offset())
        } else {
            (Arity::Ternary, code - Arity::Ternary.code_offset())
        };
        match arity {
            Arity::Unary => match base {
                0 => OpKind::Unary(UnaryOp::NoOp),
                1 => OpKind::Unary(UnaryOp::Square),
                2 => OpKind::Unary(UnaryOp::Sqrt),
                3 => OpKind::Unary(UnaryOp::Neg),
                4 => OpKind::Unary(UnaryOp::Pow {
                    exponent: metadata.unwrap_or(0) as i64,
                }),
                b if b >= 100 => {
                    let rel = b - 100;
                    OpKind::Unary(UnaryOp::Cast {
                        from: DataType::from_index(rel / 16),
                        to: DataType::from_index(rel % 16),
                    })
                }
                other => crate::error::fatal_contract_violation(format_args!(
                    "unknown unary op base code {other}"
                )),
            },
            Arity::Binary => match base {
                0 => OpKind::Binary(BinaryOp::Min),
                1 => OpKind::Binary(BinaryOp::Max),
                2 => OpKind::Binary(BinaryOp::Add),
                3 => OpKind::Binary(BinaryOp::Sub),
                4 => OpKind::Binary(BinaryOp::Mul),
                other => crate::error::fatal_contract_violation(format_args!(
                    "unknown binary op base code {other}"
                )),
            },
            Arity::Ternary => match base {
                0 => OpKind::Ternary(TernaryOp::Select),
                other => crate::error::fatal_contract_violation(format_args!(
                    "unknown ternary op base code {other}"
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_offsets_partition_code_space() {
        assert_eq!(OpKind::Unary(UnaryOp::Square).op_code(), 1);
        assert_eq!(OpKind::Binary(BinaryOp::Min).op_code(), 1000);
        assert_eq!(OpKind::Ternary(TernaryOp::Select).op_code(), 2000);
        assert!(swap::REGISTERS_1_2 >= 3000 && swap::REGISTERS_1_2 < 4000);
    }

    #[test]
    fn cast_base_code_is_unary_range() {
        let code = OpKind::Unary(UnaryOp::Cast {
            from: DataType::F32,
            to: DataType::I64,
        })
        .base_code();
        assert!(code < 1000);
    }

    #[test]
    fn from_code_inverts_op_code() {
        let cast = OpKind::Unary(UnaryOp::Cast {
            from: DataType::F32,
            to: DataType::I64,
        });
        assert_eq!(OpKind::from_code(cast.op_code(), cast.metadata()), cast);

        let pow = OpKind::Unary(UnaryOp::Pow { exponent: 3 });
        assert_eq!(OpKind::from_code(pow.op_code(), pow.metadata()), pow);

        assert_eq!(
            OpKind::from_code(OpKind::Binary(BinaryOp::Add).op_code(), None),
            OpKind::Binary(BinaryOp::Add)
        );
        assert_eq!(
            OpKind::from_code(OpKind::Ternary(TernaryOp::Select).op_code(), None),
            OpKind::Ternary(TernaryOp::Select)
        );
    }

    #[test]
    fn cast_group_is_source_groups_not_destination() {
        let cast = OpKind::Unary(UnaryOp::Cast {
            from: DataType::F32,
            to: DataType::I64,
        });
        assert_eq!(cast.input_group(DataType::F32), DataGroup::G32);
    }
}
