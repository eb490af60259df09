//! Tunable knobs, grouped into one builder-constructed struct instead of
//! free-floating globals.
//!
//! Mirrors the way this runtime's heap builders take their parameters
//! through a builder before `build()`; `RuntimeConfig` plays the analogous
//! role for the device as a whole, set once at `Device::new` and never
//! mutated afterwards.

/// Tuning knobs for the command stream, allocator, and constant folder.
/// Construct with [`RuntimeConfig::default`] and override only the fields a
/// particular deployment needs.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Flush unconditionally once the pending queue exceeds this many ops.
    pub max_batch: usize,
    /// Reserved for future batch-sizing heuristics: exposed as a knob even
    /// though the current `maybeFlush` heuristic does not consult it
    /// directly.
    pub small_batch: usize,
    /// Largest allocation, in bytes, routed to the "small" pool.
    pub small_alloc_threshold: u64,
    /// Smallest allocation, in bytes, that is unconditionally "large".
    /// Requests between `small_alloc_threshold` and this value use
    /// the small pool too; the gap is intentional slack.
    pub min_large_alloc: u64,
    /// Minimum size of a freshly created heap block in the small pool.
    pub small_heap_size: u64,
    /// Minimum size of a freshly created heap block in the large pool.
    pub large_heap_size: u64,
    /// Large-pool heap blocks are rounded up to a multiple of this size.
    pub round_large: u64,
    /// Scalar byte count at or below which constant folding is attempted.
    pub k_const: usize,
    /// Upper bound on the device's total live allocation, in bytes, before
    /// `Allocator::allocate` raises `OutOfDeviceMemory`.
    pub working_set_limit: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_batch: 128,
            small_batch: 16,
            small_alloc_threshold: 1 << 20,   // 1 MiB
            min_large_alloc: 10 << 20,        // 10 MiB
            small_heap_size: 8 << 20,         // 8 MiB
            large_heap_size: 32 << 20,        // 32 MiB
            round_large: 2 << 20,             // 2 MiB
            k_const: tensor_base::K_CONST,
            working_set_limit: 1 << 30, // 1 GiB default; embedders should override
        }
    }
}

/// The three debug env vars, latched once at `Device::new` so the hot
/// path never calls `std::env::var`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    pub command_stream: bool,
    pub allocator: bool,
    pub reference_counting: bool,
}

impl DebugFlags {
    pub fn from_env() -> Self {
        Self {
            command_stream: env_flag("DEBUG_COMMAND_STREAM"),
            allocator: env_flag("DEBUG_PLUGGABLE_DEVICE_ALLOCATOR"),
            reference_counting: env_flag("DEBUG_PLUGGABLE_DEVICE_REFERENCE_COUNTING"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| v != "0")
}
