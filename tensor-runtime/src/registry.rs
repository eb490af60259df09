//! The op-dispatch table: a mapping from short byte-string name to a
//! function pointer accepting `{attrs, inputs, outputs}`, realized here as a
//! static table of function pointers keyed by op name — the flat,
//! perfect-hash-over-static-names shape this kind of lookup takes in a
//! systems language.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use tensor_base::{AttrBuffer, AttrKind, AttrValue, BinaryOp, DataType, OpKind, TernaryOp, UnaryOp};

/// Everything the operation queue needs to turn a decoded call into an
/// [`OpKind`]: its arity, and how to build it from attributes and the
/// already-type-checked input dtypes.
pub struct OpDescriptor {
    pub arity: tensor_base::Arity,
    /// `true` if this op's shape rule allows one operand to be a single
    /// scalar broadcast against the others.
    pub allow_scalar_broadcast: bool,
    pub build: fn(&AttrBuffer, &[u8], &[DataType]) -> OpKind,
}

fn build_square(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Unary(UnaryOp::Square)
}
fn build_sqrt(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Unary(UnaryOp::Sqrt)
}
fn build_neg(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Unary(UnaryOp::Neg)
}

fn build_pow(attrs: &AttrBuffer, arena: &[u8], _: &[DataType]) -> OpKind {
    let AttrValue::I64(exponent) = attrs.decode(0, AttrKind::I64, arena) else {
        tensor_base::error::fatal_contract_violation("Pow expects an i64 `exponent` attribute")
    };
    OpKind::Unary(UnaryOp::Pow { exponent })
}

fn build_cast(attrs: &AttrBuffer, arena: &[u8], inputs: &[DataType]) -> OpKind {
    let AttrValue::I64(wire_code) = attrs.decode(0, AttrKind::I64, arena) else {
        tensor_base::error::fatal_contract_violation("Cast expects an i64 `DstT` attribute")
    };
    OpKind::Unary(UnaryOp::Cast {
        from: inputs[0],
        to: DataType::from_wire_code(wire_code as u32),
    })
}

fn build_min(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Binary(BinaryOp::Min)
}
fn build_max(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Binary(BinaryOp::Max)
}
fn build_add(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Binary(BinaryOp::Add)
}
fn build_sub(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Binary(BinaryOp::Sub)
}
fn build_mul(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Binary(BinaryOp::Mul)
}

fn build_select(_: &AttrBuffer, _: &[u8], _: &[DataType]) -> OpKind {
    OpKind::Ternary(TernaryOp::Select)
}

static TABLE: Lazy<HashMap<&'static str, OpDescriptor>> = Lazy::new(|| {
    use tensor_base::Arity::*;
    let mut m = HashMap::new();
    m.insert(
        "Square",
        OpDescriptor {
            arity: Unary,
            allow_scalar_broadcast: false,
            build: build_square,
        },
    );
    m.insert(
        "Sqrt",
        OpDescriptor {
            arity: Unary,
            allow_scalar_broadcast: false,
            build: build_sqrt,
        },
    );
    m.insert(
        "Neg",
        OpDescriptor {
            arity: Unary,
            allow_scalar_broadcast: false,
            build: build_neg,
        },
    );
    m.insert(
        "Pow",
        OpDescriptor {
            arity: Unary,
            allow_scalar_broadcast: false,
            build: build_pow,
        },
    );
    m.insert(
        "Cast",
        OpDescriptor {
            arity: Unary,
            allow_scalar_broadcast: false,
            build: build_cast,
        },
    );
    m.insert(
        "Min",
        OpDescriptor {
            arity: Binary,
            allow_scalar_broadcast: true,
            build: build_min,
        },
    );
    m.insert(
        "Max",
        OpDescriptor {
            arity: Binary,
            allow_scalar_broadcast: true,
            build: build_max,
        },
    );
    m.insert(
        "Add",
        OpDescriptor {
            arity: Binary,
            allow_scalar_broadcast: true,
            build: build_add,
        },
    );
    m.insert(
        "Sub",
        OpDescriptor {
            arity: Binary,
            allow_scalar_broadcast: true,
            build: build_sub,
        },
    );
    m.insert(
        "Mul",
        OpDescriptor {
            arity: Binary,
            allow_scalar_broadcast: true,
            build: build_mul,
        },
    );
    m.insert(
        "Select",
        OpDescriptor {
            arity: Ternary,
            allow_scalar_broadcast: false,
            build: build_select,
        },
    );
    m
});

/// Look up `name` in the dispatch table. Unknown names are a
/// programmer error, not a recoverable `Result`.
pub fn lookup(name: &str) -> &'static OpDescriptor {
    TABLE
        .get(name)
        .unwrap_or_else(|| tensor_base::error::fatal_contract_violation(format!("unknown op {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_binary_with_broadcast() {
        let d = lookup("Add");
        assert_eq!(d.arity, tensor_base::Arity::Binary);
        assert!(d.allow_scalar_broadcast);
    }

    #[test]
    #[should_panic(expected = "unknown op")]
    fn unknown_op_panics() {
        lookup("Frobnicate");
    }

    #[test]
    fn cast_reads_dest_dtype_from_attrs() {
        let mut enc = tensor_base::attrs::AttrEncoder::new();
        enc.push_i64(DataType::I64.wire_code() as i64);
        let (slots, arena) = enc.finish();
        let buf = AttrBuffer::new(&slots);
        let kind = (lookup("Cast").build)(&buf, &arena, &[DataType::F32]);
        assert_eq!(
            kind,
            OpKind::Unary(UnaryOp::Cast {
                from: DataType::F32,
                to: DataType::I64
            })
        );
    }
}
