//! CPU-side constant folding: scalar-only ops small enough to skip the queue
//! and the GPU entirely. Runs the same [`tensor_base::interp`] evaluator the
//! mock backend uses per element, which is what makes constant-folding
//! equivalence hold by construction rather than needing a separate check.

use tensor_base::interp::{self, Scalar};
use tensor_base::OpKind;

use crate::handle::Tensor;

/// Evaluate `kind` over `inputs`' scalar values and write the result
/// straight into `output`'s constant storage, marking it initialized
/// without ever touching the allocator or the command stream.
pub(crate) fn fold(kind: OpKind, inputs: &[Tensor], output: &Tensor) {
    let operands: Vec<Scalar> = inputs.iter().map(|t| read_scalar(t)).collect();
    let value = interp::eval(kind, &operands, output.dtype());

    let stride = output.dtype().stride();
    let mut bytes = vec![0u8; stride];
    value.write_le(&mut bytes);

    let mut state = output.inner.state.lock();
    state.constant_data = Some(bytes.into_boxed_slice());
    state.initialized = true;
}

fn read_scalar(tensor: &Tensor) -> Scalar {
    let state = tensor.inner.state.lock();
    let dtype = tensor.dtype();
    let stride = dtype.stride();
    if let Some(data) = &state.constant_data {
        return Scalar::read_le(dtype, &data[..stride]);
    }
    let buffer = state
        .buffer
        .as_ref()
        .expect("constant fold input is neither a constant nor materialized");
    let storage = buffer.storage.lock();
    Scalar::read_le(dtype, &storage[..stride])
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use tensor_base::{BinaryOp, DataType, UnaryOp};

    use super::*;

    fn make_constant(dtype: DataType, value: f64) -> Tensor {
        let tensor = Tensor::new(Weak::new(), dtype, &[]);
        let stride = dtype.stride();
        let mut bytes = vec![0u8; stride];
        Scalar::from_f64(dtype, value).write_le(&mut bytes);
        tensor.inner.state.lock().constant_data = Some(bytes.into_boxed_slice());
        tensor
    }

    #[test]
    fn folds_unary_square() {
        let input = make_constant(DataType::F32, 3.0);
        let output = Tensor::new(Weak::new(), DataType::F32, &[]);
        fold(OpKind::Unary(UnaryOp::Square), &[input], &output);
        assert!(output.is_initialized());
        let value = read_scalar(&output);
        assert!((value.to_f64() - 9.0).abs() < 1e-6);
    }

    #[test]
    fn folds_binary_add() {
        let a = make_constant(DataType::I32, 2.0);
        let b = make_constant(DataType::I32, 5.0);
        let output = Tensor::new(Weak::new(), DataType::I32, &[]);
        fold(OpKind::Binary(BinaryOp::Add), &[a, b], &output);
        assert_eq!(read_scalar(&output), Scalar::I32(7));
    }
}
