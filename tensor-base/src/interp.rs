//! The little per-element op VM expressed over a tagged scalar value.
//!
//! The real GPU shader interprets `operations`/`metadata` streams directly
//! against packed register bytes; this module is the portable reference
//! implementation of the *same* semantics, used by two different callers
//! for two different reasons:
//!
//!  - the constant folder (`tensor-runtime::constant_fold`) runs it on the
//!    CPU so that constant-folded scalars bypass the GPU entirely;
//!  - the in-process `MockBackend` (`tensor-runtime::backend`) runs it
//!    per-element because there is no real GPU behind this crate's test
//!    suite.
//!
//! Sharing one evaluator between both callers is what makes constant-folding
//! equivalence — a scalar op folded on the CPU must agree with the same op
//! dispatched through the mock backend — true by construction rather than by
//! coincidence.

use crate::dtype::DataType;
use crate::ops::{BinaryOp, OpKind, TernaryOp, UnaryOp};

/// A single scalar value tagged with its dtype. Internally numeric ops are
/// carried out in `f64`/`i128` and re-truncated on the way back out, which
/// is sufficient for every op this core implements (none are bit-exact
/// floating point reductions that would care about intermediate rounding).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F16(half::f16),
    F32(f32),
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl Scalar {
    pub fn dtype(self) -> DataType {
        match self {
            Scalar::F16(_) => DataType::F16,
            Scalar::F32(_) => DataType::F32,
            Scalar::Bool(_) => DataType::Bool,
            Scalar::I8(_) => DataType::I8,
            Scalar::I16(_) => DataType::I16,
            Scalar::I32(_) => DataType::I32,
            Scalar::I64(_) => DataType::I64,
            Scalar::U8(_) => DataType::U8,
            Scalar::U16(_) => DataType::U16,
            Scalar::U32(_) => DataType::U32,
            Scalar::U64(_) => DataType::U64,
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Scalar::F16(v) => v.to_f64(),
            Scalar::F32(v) => v as f64,
            Scalar::Bool(v) => v as u8 as f64,
            Scalar::I8(v) => v as f64,
            Scalar::I16(v) => v as f64,
            Scalar::I32(v) => v as f64,
            Scalar::I64(v) => v as f64,
            Scalar::U8(v) => v as f64,
            Scalar::U16(v) => v as f64,
            Scalar::U32(v) => v as f64,
            Scalar::U64(v) => v as f64,
        }
    }

    /// Re-tag (and truncate/round, for integer destinations) a numeric
    /// result as `dtype`.
    pub fn from_f64(dtype: DataType, v: f64) -> Scalar {
        match dtype {
            DataType::F16 => Scalar::F16(half::f16::from_f64(v)),
            DataType::F32 => Scalar::F32(v as f32),
            DataType::Bool => Scalar::Bool(v != 0.0),
            DataType::I8 => Scalar::I8(v as i8),
            DataType::I16 => Scalar::I16(v as i16),
            DataType::I32 => Scalar::I32(v as i32),
            DataType::I64 => Scalar::I64(v as i64),
            DataType::U8 => Scalar::U8(v as u8),
            DataType::U16 => Scalar::U16(v as u16),
            DataType::U32 => Scalar::U32(v as u32),
            DataType::U64 => Scalar::U64(v as u64),
        }
    }

    pub fn read_le(dtype: DataType, bytes: &[u8]) -> Scalar {
        match dtype {
            DataType::F16 => Scalar::F16(half::f16::from_le_bytes([bytes[0], bytes[1]])),
            DataType::F32 => Scalar::F32(f32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::Bool => Scalar::Bool(bytes[0] != 0),
            DataType::I8 => Scalar::I8(bytes[0] as i8),
            DataType::I16 => Scalar::I16(i16::from_le_bytes(bytes[0..2].try_into().unwrap())),
            DataType::I32 => Scalar::I32(i32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::I64 => Scalar::I64(i64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            DataType::U8 => Scalar::U8(bytes[0]),
            DataType::U16 => Scalar::U16(u16::from_le_bytes(bytes[0..2].try_into().unwrap())),
            DataType::U32 => Scalar::U32(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::U64 => Scalar::U64(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
        }
    }

    pub fn write_le(self, out: &mut [u8]) {
        match self {
            Scalar::F16(v) => out[0..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::Bool(v) => out[0] = v as u8,
            Scalar::I8(v) => out[0] = v as u8,
            Scalar::I16(v) => out[0..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => out[0..8].copy_from_slice(&v.to_le_bytes()),
            Scalar::U8(v) => out[0] = v,
            Scalar::U16(v) => out[0..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::U64(v) => out[0..8].copy_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Evaluate one unary op.
pub fn eval_unary(op: UnaryOp, input: Scalar) -> Scalar {
    match op {
        UnaryOp::NoOp => input,
        UnaryOp::Square => Scalar::from_f64(input.dtype(), input.to_f64().powi(2)),
        UnaryOp::Sqrt => Scalar::from_f64(input.dtype(), input.to_f64().sqrt()),
        UnaryOp::Neg => Scalar::from_f64(input.dtype(), -input.to_f64()),
        UnaryOp::Pow { exponent } => {
            Scalar::from_f64(input.dtype(), input.to_f64().powi(exponent as i32))
        }
        UnaryOp::Cast { to, .. } => Scalar::from_f64(to, input.to_f64()),
    }
}

/// Evaluate one binary op. `output_dtype` is the destination the encoder
/// selected (the compiler enforces both operands share the output's shape,
/// except for scalar broadcast — dtype is always the output's, per the
/// op-descriptor table).
pub fn eval_binary(op: BinaryOp, lhs: Scalar, rhs: Scalar, output_dtype: DataType) -> Scalar {
    let (a, b) = (lhs.to_f64(), rhs.to_f64());
    let r = match op {
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
    };
    Scalar::from_f64(output_dtype, r)
}

/// Evaluate the one ternary op this core implements.
pub fn eval_ternary(
    op: TernaryOp,
    cond: Scalar,
    if_true: Scalar,
    if_false: Scalar,
    output_dtype: DataType,
) -> Scalar {
    match op {
        TernaryOp::Select => {
            let chosen = if matches!(cond, Scalar::Bool(true)) || cond.to_f64() != 0.0 {
                if_true
            } else {
                if_false
            };
            Scalar::from_f64(output_dtype, chosen.to_f64())
        }
    }
}

/// Dispatch a generic [`OpKind`] against up to three operands, as both the
/// fused-instruction interpreter (the mock shader VM) and the constant
/// folder need to.
pub fn eval(kind: OpKind, operands: &[Scalar], output_dtype: DataType) -> Scalar {
    match kind {
        OpKind::Unary(op) => eval_unary(op, operands[0]),
        OpKind::Binary(op) => eval_binary(op, operands[0], operands[1], output_dtype),
        OpKind::Ternary(op) => eval_ternary(op, operands[0], operands[1], operands[2], output_dtype),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_sqrt_cast_chain_matches_s1() {
        let t0 = Scalar::F32(5.005);
        let t1 = eval_unary(UnaryOp::Square, t0);
        let t2 = eval_unary(
            UnaryOp::Cast {
                from: DataType::F32,
                to: DataType::I8,
            },
            t1,
        );
        let t3 = eval_unary(
            UnaryOp::Cast {
                from: DataType::I8,
                to: DataType::F16,
            },
            t2,
        );
        let t4 = eval_unary(UnaryOp::Sqrt, t3);
        let Scalar::F16(v) = t4 else { panic!("expected f16") };
        assert!((v.to_f64() - 5.0).abs() < 0.05);
    }

    #[test]
    fn select_picks_true_branch_on_true_cond() {
        let r = eval_ternary(
            TernaryOp::Select,
            Scalar::Bool(true),
            Scalar::I32(9),
            Scalar::I32(10),
            DataType::I32,
        );
        assert_eq!(r, Scalar::I32(9));
    }
}
