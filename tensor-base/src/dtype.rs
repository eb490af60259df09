//! The closed set of element types the runtime understands, and the two
//! register-width groups that drive fusion-break decisions.

use crate::error::fatal_contract_violation;

/// One of the eleven element types the core supports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DataType {
    F16,
    F32,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

/// The register-width partition a dtype belongs to. Kernels exist per group;
/// an op whose inputs/output straddle two groups forces a fusion break.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DataGroup {
    /// Fits into a 32-bit GPU register: f16, f32, bool, i8, i16, i32, u8, u16.
    G32,
    /// Needs the 64-bit register path: u32, i64, u64.
    G64,
}

impl DataType {
    /// Size in bytes of one element.
    pub const fn stride(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::Bool => 1,
            DataType::I8 => 1,
            DataType::I16 => 2,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::U64 => 8,
        }
    }

    /// The data group this dtype's kernels dispatch through.
    pub const fn group(self) -> DataGroup {
        match self {
            DataType::U32 | DataType::I64 | DataType::U64 => DataGroup::G64,
            _ => DataGroup::G32,
        }
    }

    /// The stable 32-bit wire code a frontend uses to name a dtype across
    /// the handle boundary, chosen to match the numbering TensorFlow's
    /// own dtype enum uses. Only the codes this core actually supports are
    /// mapped; anything else is a decode-time contract violation, not a
    /// silent default.
    pub const fn wire_code(self) -> u32 {
        match self {
            DataType::F32 => 1,
            DataType::I32 => 3,
            DataType::U8 => 4,
            DataType::I16 => 5,
            DataType::I8 => 6,
            DataType::I64 => 9,
            DataType::Bool => 10,
            DataType::U16 => 17,
            DataType::F16 => 19,
            DataType::U32 => 22,
            DataType::U64 => 23,
        }
    }

    /// The small dense index used to pack a `Cast`'s `{from, to}` pair into
    /// a single op base code (`100 + from*16 + to`). Distinct from
    /// `wire_code` — this one only needs to be dense and stable within a
    /// process, not match any external protocol.
    pub const fn index(self) -> u16 {
        match self {
            DataType::F16 => 0,
            DataType::F32 => 1,
            DataType::Bool => 2,
            DataType::I8 => 3,
            DataType::I16 => 4,
            DataType::I32 => 5,
            DataType::I64 => 6,
            DataType::U8 => 7,
            DataType::U16 => 8,
            DataType::U32 => 9,
            DataType::U64 => 10,
        }
    }

    pub fn from_index(index: u16) -> Self {
        match index {
            0 => DataType::F16,
            1 => DataType::F32,
            2 => DataType::Bool,
            3 => DataType::I8,
            4 => DataType::I16,
            5 => DataType::I32,
            6 => DataType::I64,
            7 => DataType::U8,
            8 => DataType::U16,
            9 => DataType::U32,
            10 => DataType::U64,
            other => fatal_contract_violation(format_args!("unknown dtype index {other}")),
        }
    }

    /// Decode a TensorFlow-style dtype code. Panics (a contract violation,
    /// not an `Error`) on any code outside the set this backend supports —
    /// Backends may reject codes they do not support.
    pub fn from_wire_code(code: u32) -> Self {
        match code {
            1 => DataType::F32,
            3 => DataType::I32,
            4 => DataType::U8,
            5 => DataType::I16,
            6 => DataType::I8,
            9 => DataType::I64,
            10 => DataType::Bool,
            17 => DataType::U16,
            19 => DataType::F16,
            22 => DataType::U32,
            23 => DataType::U64,
            other => fatal_contract_violation(format_args!("unsupported dtype wire code {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_partition_as_specified() {
        let g32 = [
            DataType::F16,
            DataType::F32,
            DataType::Bool,
            DataType::I8,
            DataType::I16,
            DataType::I32,
            DataType::U8,
            DataType::U16,
        ];
        let g64 = [DataType::U32, DataType::I64, DataType::U64];
        for dt in g32 {
            assert_eq!(dt.group(), DataGroup::G32, "{dt:?}");
        }
        for dt in g64 {
            assert_eq!(dt.group(), DataGroup::G64, "{dt:?}");
        }
    }

    #[test]
    fn wire_code_round_trips() {
        for dt in [
            DataType::F16,
            DataType::F32,
            DataType::Bool,
            DataType::I8,
            DataType::I16,
            DataType::I32,
            DataType::I64,
            DataType::U8,
            DataType::U16,
            DataType::U32,
            DataType::U64,
        ] {
            assert_eq!(DataType::from_wire_code(dt.wire_code()), dt);
        }
    }
}
