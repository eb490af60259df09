//! Property-based tests for invariants that should hold for *any* sequence
//! of operations, not just the worked scenarios: tensor refcount
//! conservation, and the allocator's best-fit/working-set behavior.

use proptest::prelude::*;

use tensor_base::DataType;
use tensor_runtime::allocator::{Allocator, StorageMode};
use tensor_runtime::{Device, MockBackend, RuntimeConfig};

/// One step in a scripted clone/drop sequence against a single tensor
/// handle: `true` clones the handle and pushes it onto a stack, `false`
/// pops and drops the most recently cloned handle (a no-op if the stack is
/// already empty).
fn clone_drop_strategy(len: usize) -> impl Strategy<Value = Vec<bool>> {
    proptest::collection::vec(any::<bool>(), 0..len)
}

proptest! {
    /// `Tensor::refcount()` always equals exactly the number
    /// of live clones of a handle — cloning is the only retain, dropping is
    /// the only release, and the two stay in lockstep under any interleaving.
    #[test]
    fn refcount_tracks_live_clones_under_any_clone_drop_sequence(steps in clone_drop_strategy(64)) {
        let device = Device::new(RuntimeConfig::default(), Box::new(MockBackend::new()));
        let root = device.create_tensor(DataType::F32, &[1], |buf| buf.copy_from_slice(&1.0f32.to_le_bytes()));
        let mut live = vec![root.clone()];

        for clone_it in steps {
            if clone_it {
                live.push(live.last().unwrap().clone());
            } else if live.len() > 1 {
                live.pop();
            }
            prop_assert_eq!(root.refcount(), live.len());
        }
    }

    /// The allocator never reports more total live bytes than it has
    /// actually carved out, and a buffer freed then immediately
    /// re-requested at the same (aligned) size reuses a heap rather than
    /// growing unboundedly.
    #[test]
    fn allocator_total_allocated_matches_live_buffers(
        sizes in proptest::collection::vec(1u64..(1 << 16), 1..32),
    ) {
        let cfg = RuntimeConfig {
            working_set_limit: 1 << 30,
            ..RuntimeConfig::default()
        };
        let mut allocator = Allocator::new();
        let mut live = Vec::new();
        let mut expected_total = 0u64;

        for size in sizes {
            let buf = allocator.allocate(&cfg, size, StorageMode::Shared, false).unwrap();
            expected_total += round_up_to_256(size);
            live.push(buf);
            prop_assert_eq!(allocator.total_allocated(), expected_total);
        }

        while let Some(buf) = live.pop() {
            expected_total -= round_up_to_256(buf.len());
            allocator.free(buf);
            prop_assert_eq!(allocator.total_allocated(), expected_total);
        }
        prop_assert_eq!(allocator.total_allocated(), 0);
    }

    /// Allocating past the working-set limit always fails with
    /// `OutOfDeviceMemory`, and the same request with `bypass_limit` set
    /// always succeeds, regardless of the requested size (within the
    /// fixed, safely small range this test generates).
    #[test]
    fn working_set_limit_is_enforced_unless_bypassed(size in (2048u64..(1 << 20))) {
        let cfg = RuntimeConfig {
            working_set_limit: 1024,
            ..RuntimeConfig::default()
        };
        let mut allocator = Allocator::new();
        let denied = allocator.allocate(&cfg, size, StorageMode::Private, false);
        prop_assert!(denied.is_err());

        let allowed = allocator.allocate(&cfg, size, StorageMode::Private, true);
        prop_assert!(allowed.is_ok());
    }
}

fn round_up_to_256(len: u64) -> u64 {
    (len + 255) / 256 * 256
}
