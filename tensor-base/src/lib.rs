//! Data model for the eager tensor execution runtime.
//!
//! This crate is deliberately free of anything device-shaped: no mutex, no
//! handle, no command buffer. It provides the vocabulary the rest of the
//! runtime (`tensor-runtime`) builds on — dtypes and their register-width
//! groups, the attribute wire format, op identity/codes, and the error type
//! for the runtime's few recoverable failure modes.

pub mod attrs;
pub mod dtype;
pub mod error;
pub mod interp;
pub mod ops;

pub use attrs::{AttrBuffer, AttrKind, AttrValue};
pub use dtype::{DataGroup, DataType};
pub use error::{Error, ErrorKind, Result};
pub use ops::{Arity, BinaryOp, OpKind, TernaryOp, UnaryOp};

/// Threshold below (or at) which a scalar tensor may be constant-folded on
/// the CPU instead of dispatched to the GPU. Above this size the constant
/// folder does not attempt it.
pub const K_CONST: usize = 64;
