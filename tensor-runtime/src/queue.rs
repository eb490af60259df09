//! The eager operation queue: turns one named call plus its decoded
//! attributes into a `Tensor`, either immediately (constant folding) or by
//! appending an [`EagerOp`] to the device's pending list.

use smallvec::SmallVec;
use tensor_base::{AttrBuffer, Arity, DataType, OpKind, UnaryOp};

use crate::command_stream;
use crate::constant_fold;
use crate::device::Device;
use crate::handle::Tensor;
use crate::registry::{self, OpDescriptor};

/// One not-yet-compiled elementwise call or standalone copy, as recorded on
/// the device's pending list.
pub enum EagerOp {
    Elementwise {
        kind: OpKind,
        inputs: SmallVec<[Tensor; 4]>,
        output: Tensor,
    },
    Copy {
        input: Tensor,
        output: Tensor,
        byte_count: u64,
    },
}

/// Look the op up, decode it against the already-type-checked inputs,
/// validate shapes, allocate the output handle, and either fold it on the
/// spot or queue it.
pub(crate) fn execute_operation(
    device: &Device,
    name: &str,
    attrs: &AttrBuffer<'_>,
    arena: &[u8],
    inputs: &[Tensor],
    output_shape: &[u32],
) -> Tensor {
    let descriptor = registry::lookup(name);
    let input_dtypes: SmallVec<[DataType; 4]> = inputs.iter().map(Tensor::dtype).collect();
    let kind = (descriptor.build)(attrs, arena, &input_dtypes);
    let output_dtype = check_and_infer_dtype(kind, descriptor, inputs, output_shape);
    let output = device.create_output_handle(output_dtype, output_shape);

    if is_fold_candidate(device, inputs, &output) {
        constant_fold::fold(kind, inputs, &output);
        return output;
    }

    device.state.lock().pending.push(EagerOp::Elementwise {
        kind,
        inputs: inputs.iter().cloned().collect(),
        output: output.clone(),
    });
    command_stream::maybe_flush(device);
    output
}

/// A standalone buffer copy ("explicit copy"), bypassing the fusion
/// compiler entirely — it is always emitted as its own instruction.
pub(crate) fn copy_tensor(device: &Device, input: &Tensor) -> Tensor {
    let output = device.create_output_handle(input.dtype(), input.shape());

    if input.is_scalar() && input.byte_count() as usize <= device.config.k_const {
        let constant = input.inner.state.lock().constant_data.clone();
        if let Some(data) = constant {
            let mut state = output.inner.state.lock();
            state.constant_data = Some(data);
            state.initialized = true;
            drop(state);
            return output;
        }
    }

    let byte_count = input.byte_count();
    device.state.lock().pending.push(EagerOp::Copy {
        input: input.clone(),
        output: output.clone(),
        byte_count,
    });
    command_stream::maybe_flush(device);
    output
}

/// True when every input is already CPU-resident constant data and the
/// output is scalar and small enough to fold instead of dispatched to the
/// GPU. Folding reads `constant_data` directly (see `constant_fold::fold`),
/// so a scalar input that hasn't materialized yet (still awaiting a writer)
/// is not a candidate even though `is_scalar()` would say yes.
fn is_fold_candidate(device: &Device, inputs: &[Tensor], output: &Tensor) -> bool {
    output.is_scalar()
        && (output.byte_count() as usize) <= device.config.k_const
        && inputs.iter().all(|t| t.inner.state.lock().constant_data.is_some())
}

/// Validate `inputs`/`output_shape` against the op's arity rules and return
/// the dtype the output tensor must be created with. Every failure here is a
/// caller contract violation, not a recoverable error.
fn check_and_infer_dtype(
    kind: OpKind,
    descriptor: &OpDescriptor,
    inputs: &[Tensor],
    output_shape: &[u32],
) -> DataType {
    match descriptor.arity {
        Arity::Unary => {
            assert_arity(inputs, 1);
            shapes_match(inputs[0].shape(), output_shape, "unary op output");
            match kind {
                OpKind::Unary(UnaryOp::Cast { to, .. }) => to,
                _ => inputs[0].dtype(),
            }
        }
        Arity::Binary => {
            assert_arity(inputs, 2);
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            if lhs.dtype() != rhs.dtype() {
                tensor_base::error::fatal_contract_violation(format!(
                    "binary op dtype mismatch: {:?} vs {:?}",
                    lhs.dtype(),
                    rhs.dtype()
                ));
            }
            match (lhs.is_scalar(), rhs.is_scalar()) {
                (true, true) => shapes_match(lhs.shape(), output_shape, "binary op output"),
                (true, false) => {
                    require_broadcast(descriptor);
                    shapes_match(rhs.shape(), output_shape, "binary op output");
                }
                (false, true) => {
                    require_broadcast(descriptor);
                    shapes_match(lhs.shape(), output_shape, "binary op output");
                }
                (false, false) => {
                    shapes_match(lhs.shape(), rhs.shape(), "binary op operands");
                    shapes_match(lhs.shape(), output_shape, "binary op output");
                }
            }
            lhs.dtype()
        }
        Arity::Ternary => {
            assert_arity(inputs, 3);
            let (cond, if_true, if_false) = (&inputs[0], &inputs[1], &inputs[2]);
            if cond.dtype() != DataType::Bool {
                tensor_base::error::fatal_contract_violation("select condition must be bool");
            }
            if if_true.dtype() != if_false.dtype() {
                tensor_base::error::fatal_contract_violation("select branches must share a dtype");
            }
            shapes_match(cond.shape(), if_true.shape(), "select cond/if_true");
            shapes_match(if_true.shape(), if_false.shape(), "select if_true/if_false");
            shapes_match(if_true.shape(), output_shape, "select output");
            if_true.dtype()
        }
    }
}

fn require_broadcast(descriptor: &OpDescriptor) {
    if !descriptor.allow_scalar_broadcast {
        tensor_base::error::fatal_contract_violation("op does not allow scalar broadcast");
    }
}

fn assert_arity(inputs: &[Tensor], expected: usize) {
    if inputs.len() != expected {
        tensor_base::error::fatal_contract_violation(format!(
            "expected {expected} inputs, got {}",
            inputs.len()
        ));
    }
}

fn shapes_match(a: &[u32], b: &[u32], what: &str) {
    if a != b {
        tensor_base::error::fatal_contract_violation(format!(
            "{what} shape mismatch: {a:?} vs {b:?}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use tensor_base::DataType;

    use super::*;
    use crate::backend::MockBackend;
    use crate::config::RuntimeConfig;

    fn device() -> std::sync::Arc<Device> {
        Device::new(RuntimeConfig::default(), Box::new(MockBackend::new()))
    }

    fn scalar_constant(device: &Device, value: f64) -> Tensor {
        let t = device.create_output_handle(DataType::F32, &[]);
        let mut bytes = vec![0u8; DataType::F32.stride()];
        tensor_base::interp::Scalar::from_f64(DataType::F32, value).write_le(&mut bytes);
        t.inner.state.lock().constant_data = Some(bytes.into_boxed_slice());
        t
    }

    #[test]
    fn fold_candidate_requires_constant_inputs_not_just_scalar_shape() {
        let device = device();
        let pending_scalar = device.create_output_handle(DataType::F32, &[]);
        let output = device.create_output_handle(DataType::F32, &[]);
        assert!(pending_scalar.is_scalar(), "still scalar by shape alone");
        assert!(
            !is_fold_candidate(&device, &[pending_scalar], &output),
            "a scalar awaiting its writer has no constant_data yet and must not fold"
        );
    }

    #[test]
    fn fold_candidate_accepts_materialized_constants() {
        let device = device();
        let input = scalar_constant(&device, 3.0);
        let output = device.create_output_handle(DataType::F32, &[]);
        assert!(is_fold_candidate(&device, &[input], &output));
    }
}
