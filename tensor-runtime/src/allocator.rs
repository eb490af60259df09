//! Heap-based device buffer allocator.
//!
//! Real device memory does not exist behind the [`crate::backend::Backend`]
//! trait used by this crate's test suite, so each allocated buffer owns its
//! own byte storage; what this module actually simulates is the
//! *accounting* — size-class pools, best-fit heap selection with a
//! deterministic tie-break, and the working-set limit that triggers
//! `OutOfDeviceMemory`. A real backend would carve `DeviceBuffer`s out of a
//! shared heap allocation instead of giving each one its own storage; the
//! pool/heap-block bookkeeping here is unaffected either way.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tensor_base::{Error, ErrorKind, Result};

use crate::config::RuntimeConfig;

/// Whether a buffer is host-visible ("shared") or GPU-only ("private").
/// Kept as a pool-selection axis even though this crate's mock backend
/// treats both identically.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StorageMode {
    Shared,
    Private,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
enum SizeClass {
    Small,
    Large,
}

/// A materialized device buffer. Cheap to clone (shares the underlying
/// storage); identity for allocator bookkeeping is the `(heap_id, offset)`
/// pair recorded at allocation time.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    pub storage: Arc<Mutex<Box<[u8]>>>,
    size_class: SizeClass,
    storage_mode: StorageMode,
    heap_id: u64,
    byte_len: u64,
}

impl DeviceBuffer {
    pub fn len(&self) -> u64 {
        self.byte_len
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len == 0
    }
}

struct HeapBlock {
    id: u64,
    total_size: u64,
    available_size: u64,
    num_buffers: usize,
}

/// One `{size_class} x {storage_mode}` pool: an ordered set of heap blocks
/// keyed by `(available_bytes, id)`, where `id` is the block's creation
/// order — standing in for "address" as the tie-break, since a
/// real memory address is not observable behind the `Backend` trait.
struct Pool {
    blocks: HashMap<u64, HeapBlock>,
    order: BTreeSet<(u64, u64)>,
    next_heap_id: u64,
}

impl Pool {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            order: BTreeSet::new(),
            next_heap_id: 0,
        }
    }

    fn create_heap(&mut self, size: u64) -> u64 {
        let id = self.next_heap_id;
        self.next_heap_id += 1;
        self.blocks.insert(
            id,
            HeapBlock {
                id,
                total_size: size,
                available_size: size,
                num_buffers: 0,
            },
        );
        self.order.insert((size, id));
        id
    }

    /// Binary-search (via the ordered set) for the smallest block with at
    /// least `requested` bytes available.
    fn find_fit(&self, requested: u64) -> Option<u64> {
        self.order
            .range((requested, 0)..)
            .next()
            .map(|&(_, id)| id)
    }

    fn carve(&mut self, heap_id: u64, requested: u64) {
        let block = self.blocks.get_mut(&heap_id).expect("heap block vanished");
        self.order.remove(&(block.available_size, block.id));
        block.available_size -= requested;
        block.num_buffers += 1;
        self.order.insert((block.available_size, block.id));
    }

    fn release(&mut self, heap_id: u64, size: u64) {
        let destroy = {
            let block = self.blocks.get_mut(&heap_id).expect("heap block vanished");
            self.order.remove(&(block.available_size, block.id));
            block.available_size += size;
            block.num_buffers -= 1;
            if block.num_buffers == 0 {
                true
            } else {
                self.order.insert((block.available_size, block.id));
                false
            }
        };
        if destroy {
            self.blocks.remove(&heap_id);
        }
    }
}

/// The four-pool allocator: `{small, large} x {shared, private}`.
pub struct Allocator {
    small_shared: Pool,
    small_private: Pool,
    large_shared: Pool,
    large_private: Pool,
    total_allocated: u64,
}

impl Allocator {
    pub fn new() -> Self {
        Self {
            small_shared: Pool::new(),
            small_private: Pool::new(),
            large_shared: Pool::new(),
            large_private: Pool::new(),
            total_allocated: 0,
        }
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    fn pool_mut(&mut self, class: SizeClass, mode: StorageMode) -> &mut Pool {
        match (class, mode) {
            (SizeClass::Small, StorageMode::Shared) => &mut self.small_shared,
            (SizeClass::Small, StorageMode::Private) => &mut self.small_private,
            (SizeClass::Large, StorageMode::Shared) => &mut self.large_shared,
            (SizeClass::Large, StorageMode::Private) => &mut self.large_private,
        }
    }

    /// `heapBufferSizeAndAlign`: round a raw byte length up to the
    /// allocator's buffer alignment.
    fn align(length: u64) -> u64 {
        const ALIGN: u64 = 256;
        (length + ALIGN - 1) / ALIGN * ALIGN
    }

    /// Allocate `length` bytes. `bypass_limit` is set by the command
    /// stream's single OOM retry to permit the transient
    /// overshoot allowed while draining in-flight work.
    pub fn allocate(
        &mut self,
        config: &RuntimeConfig,
        length: u64,
        mode: StorageMode,
        bypass_limit: bool,
    ) -> Result<DeviceBuffer> {
        let allocation_size = Self::align(length);
        // Anything at or below `small_alloc_threshold` is small, anything
        // above `min_large_alloc` is large; the gap between the two is
        // intentional slack that still routes to the small pool (see
        // `RuntimeConfig::min_large_alloc`).
        let class = if allocation_size <= config.min_large_alloc {
            SizeClass::Small
        } else {
            SizeClass::Large
        };

        if !bypass_limit && self.total_allocated + allocation_size > config.working_set_limit {
            return Err(Error::with_detail(
                ErrorKind::OutOfDeviceMemory,
                format!(
                    "requested {allocation_size} bytes, {} already allocated, limit {}",
                    self.total_allocated, config.working_set_limit
                ),
            ));
        }

        let pool = self.pool_mut(class, mode);
        let heap_id = match pool.find_fit(allocation_size) {
            Some(id) => id,
            None => {
                let heap_size = match class {
                    SizeClass::Small => config.small_heap_size.max(allocation_size),
                    SizeClass::Large => {
                        let rounded = Self::round_up(allocation_size, config.round_large);
                        config.large_heap_size.max(rounded)
                    }
                };
                pool.create_heap(heap_size)
            }
        };
        pool.carve(heap_id, allocation_size);
        self.total_allocated += allocation_size;

        Ok(DeviceBuffer {
            storage: Arc::new(Mutex::new(vec![0u8; length as usize].into_boxed_slice())),
            size_class: class,
            storage_mode: mode,
            heap_id,
            byte_len: length,
        })
    }

    pub fn free(&mut self, buffer: DeviceBuffer) {
        let allocation_size = Self::align(buffer.byte_len);
        let pool = self.pool_mut(buffer.size_class, buffer.storage_mode);
        pool.release(buffer.heap_id, allocation_size);
        self.total_allocated -= allocation_size;
    }

    fn round_up(value: u64, multiple: u64) -> u64 {
        (value + multiple - 1) / multiple * multiple
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            working_set_limit: 64 << 20,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn best_fit_reuses_freed_space() {
        let mut a = Allocator::new();
        let cfg = cfg();
        let buf1 = a
            .allocate(&cfg, 4096, StorageMode::Shared, false)
            .unwrap();
        let heap_id_before = buf1.heap_id;
        a.free(buf1);
        let buf2 = a
            .allocate(&cfg, 4096, StorageMode::Shared, false)
            .unwrap();
        assert_eq!(buf2.heap_id, heap_id_before, "should reuse the same heap block");
    }

    #[test]
    fn oom_when_over_working_set() {
        let mut a = Allocator::new();
        let cfg = RuntimeConfig {
            working_set_limit: 1024,
            ..RuntimeConfig::default()
        };
        let err = a
            .allocate(&cfg, 4096, StorageMode::Private, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfDeviceMemory);
    }

    #[test]
    fn bypass_limit_permits_transient_overshoot() {
        let mut a = Allocator::new();
        let cfg = RuntimeConfig {
            working_set_limit: 1024,
            ..RuntimeConfig::default()
        };
        let buf = a.allocate(&cfg, 4096, StorageMode::Private, true).unwrap();
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn heap_destroyed_once_empty() {
        let mut a = Allocator::new();
        let cfg = cfg();
        let buf = a.allocate(&cfg, 4096, StorageMode::Shared, false).unwrap();
        let pool = a.pool_mut(SizeClass::Small, StorageMode::Shared);
        assert_eq!(pool.blocks.len(), 1);
        a.free(buf);
        let pool = a.pool_mut(SizeClass::Small, StorageMode::Shared);
        assert!(pool.blocks.is_empty(), "heap with zero buffers must be destroyed");
    }
}
