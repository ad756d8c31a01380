//! Native Code Buffer Manager
//!
//! Executable memory follows a strict two-phase lifecycle: a buffer is
//! *reserved* (writable scratch space, never executable), generated bytes
//! are *committed* into it, and finalization flips the pages to
//! read-execute in one handoff — memory is never writable and executable
//! at the same time. After finalization the region is read-only-executable
//! until freed.
//!
//! Failure to fund executable memory is fatal by design: callers assume an
//! allocation cannot come back null, and every recovery path from a
//! half-funded code heap would run on violated accounting. Ordinary
//! fallibility lives one layer up, where a work item is refused before any
//! pages are touched.
//!
//! The lifecycle is enforced at compile time by phase-typed handles:
//! [`commit_buffer`](EmitBufferManager::commit_buffer) only accepts a
//! writable-phase handle, and finalizing consumes the handle so a
//! finalized region cannot be written again.

pub mod platform;
pub mod prereserved;

use crate::checksum::crc32;
use crate::error::{fatal, Error, FatalCode, Result};
use platform::{align_to_page, SystemAllocator, VirtualAllocator, PAGE_SIZE};
use prereserved::PreReservedRegion;
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Mutex;

// ==================== Phase-Typed Handles ====================

/// Phase marker: reserved, nothing committed yet
pub enum Reserved {}
/// Phase marker: at least one commit has landed
pub enum Committed {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Reserved {}
    impl Sealed for super::Committed {}
}

/// Phases whose pages are still writable
pub trait WritablePhase: sealed::Sealed {}
impl WritablePhase for Reserved {}
impl WritablePhase for Committed {}

/// Handle to one allocation, parameterized by lifecycle phase.
///
/// Handles are not cloneable; consuming them through the manager's
/// transition methods is what makes write-after-finalize unrepresentable.
#[derive(Debug)]
pub struct BufferHandle<P> {
    base: usize,
    _phase: PhantomData<P>,
}

impl<P> BufferHandle<P> {
    fn new(base: usize) -> Self {
        BufferHandle { base, _phase: PhantomData }
    }

    /// Base address of the allocation (target address space)
    pub fn base(&self) -> usize {
        self.base
    }
}

/// A finalized, executable region
#[derive(Debug, Clone, Copy)]
pub struct FinalizedCode {
    base: usize,
    len: usize,
    checksum: u32,
}

impl FinalizedCode {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CRC32 of the committed bytes, as verified at finalization
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

// ==================== Records & Segments ====================

/// Accounting for one chunk carved from the managed executable heap.
///
/// Invariant after every operation: `bytes_used <= bytes_committed <= size`.
#[derive(Debug)]
pub struct AllocationRecord {
    base: usize,
    /// Page-rounded reservation for this allocation
    size: usize,
    /// Bytes funded (writable); fixed at allocation time
    bytes_committed: usize,
    /// Bytes of generated code copied in so far
    bytes_used: usize,
    pdata_count: u32,
    xdata_size: u32,
    /// Carved from the pre-reserved range rather than a segment
    in_pre_reserved: bool,
    /// Unwind metadata has been registered for this region
    recorded: bool,
    finalized: bool,
    /// Next record in the owning segment's allocation or free list
    next: Option<usize>,
}

impl AllocationRecord {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes_committed(&self) -> usize {
        self.bytes_committed
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn in_pre_reserved(&self) -> bool {
        self.in_pre_reserved
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }
}

/// Unwind metadata registered for one finalized region, queryable by a
/// stack walker through [`EmitBufferManager::find_function_entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegistration {
    pub begin: usize,
    pub end: usize,
    pub pdata_count: u32,
    pub xdata_size: u32,
}

struct Segment {
    base: usize,
    size: usize,
    /// Bump offset for fresh carves
    cursor: usize,
    /// Head of the live-allocation record list
    alloc_head: Option<usize>,
    /// Head of the reusable freed-carve list
    free_head: Option<usize>,
}

impl Segment {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Allocation/usage counters for one manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub bytes_reserved: usize,
    pub bytes_in_use: usize,
    pub live_allocations: usize,
    pub total_allocations: usize,
    pub frees: usize,
}

/// Interior state of a buffer manager; only ever touched under its
/// [`LockPolicy`]
pub struct ManagerState {
    records: Vec<AllocationRecord>,
    recycled_records: Vec<usize>,
    segments: Vec<Segment>,
    pre_reserved: Option<PreReservedRegion>,
    /// base address -> record slab index, for every live allocation
    live: HashMap<usize, usize>,
    /// Sorted by `begin`
    unwind: Vec<UnwindRegistration>,
    stats: EmitStats,
}

// ==================== Lock Policy ====================

/// Synchronization strategy for a manager, chosen at construction.
///
/// [`ThreadSafe`] takes a real mutex on every mutating operation.
/// [`SingleThreaded`] is the no-op variant for a manager bound to one
/// compilation worker; it is `!Sync`, so the single-writer discipline is
/// the type system's problem rather than the caller's.
pub trait LockPolicy {
    fn wrap(state: ManagerState) -> Self;
    fn with<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R;
}

/// Mutex-guarded state for managers shared across threads
pub struct ThreadSafe(Mutex<ManagerState>);

impl LockPolicy for ThreadSafe {
    fn wrap(state: ManagerState) -> Self {
        ThreadSafe(Mutex::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}

/// Lock-free state for single-threaded managers
pub struct SingleThreaded(RefCell<ManagerState>);

impl LockPolicy for SingleThreaded {
    fn wrap(state: ManagerState) -> Self {
        SingleThreaded(RefCell::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

// ==================== Manager ====================

/// Tunables for one manager instance
#[derive(Debug, Clone)]
pub struct EmitConfig {
    /// Bytes reserved per ordinary segment
    pub segment_size: usize,
    /// Pages in the pre-reserved range; 0 disables it
    pub pre_reserved_pages: usize,
}

impl Default for EmitConfig {
    fn default() -> Self {
        EmitConfig {
            segment_size: 256 * 1024,
            pre_reserved_pages: 256,
        }
    }
}

/// Reserve/commit/finalize/free manager for executable memory.
///
/// Generic over the allocation backend and the locking strategy, both
/// fixed at construction.
pub struct EmitBufferManager<A: VirtualAllocator = SystemAllocator, L: LockPolicy = ThreadSafe> {
    allocator: A,
    state: L,
    config: EmitConfig,
}

impl EmitBufferManager<SystemAllocator, ThreadSafe> {
    /// Manager shared between threads (real lock)
    pub fn thread_safe() -> Self {
        Self::with_backend(SystemAllocator, EmitConfig::default())
    }
}

impl EmitBufferManager<SystemAllocator, SingleThreaded> {
    /// Manager bound to a single compilation worker (no lock)
    pub fn single_threaded() -> Self {
        Self::with_backend(SystemAllocator, EmitConfig::default())
    }
}

impl<A: VirtualAllocator, L: LockPolicy> EmitBufferManager<A, L> {
    pub fn with_backend(allocator: A, config: EmitConfig) -> Self {
        let pre_reserved = if config.pre_reserved_pages > 0 {
            // A manager without a pre-reserved range still works; every
            // allocation just takes the ordinary segment path.
            PreReservedRegion::reserve(&allocator, config.pre_reserved_pages)
        } else {
            None
        };
        let state = ManagerState {
            records: Vec::new(),
            recycled_records: Vec::new(),
            segments: Vec::new(),
            pre_reserved,
            live: HashMap::default(),
            unwind: Vec::new(),
            stats: EmitStats::default(),
        };
        EmitBufferManager { allocator, state: L::wrap(state), config }
    }

    /// Reserve writable scratch space for one unit of generated code.
    ///
    /// The returned region is funded (writable) but not yet executable.
    /// `pdata_count`/`xdata_size` size the unwind metadata registered at
    /// finalization; `allow_pre_reserved` opts into the displacement-bound
    /// range. Inability to fund the reservation is fatal.
    pub fn allocate_buffer(
        &self,
        bytes: usize,
        pdata_count: u32,
        xdata_size: u32,
        allow_pre_reserved: bool,
    ) -> BufferHandle<Reserved> {
        let total = align_to_page((bytes + xdata_size as usize).max(1));
        let allocator = &self.allocator;
        let segment_size = self.config.segment_size;

        self.state.with(|state| {
            let (base, carve_size, in_pre_reserved) =
                state.carve(allocator, total, allow_pre_reserved, segment_size);

            let record = AllocationRecord {
                base,
                size: carve_size,
                bytes_committed: carve_size,
                bytes_used: 0,
                pdata_count,
                xdata_size,
                in_pre_reserved,
                recorded: false,
                finalized: false,
                next: None,
            };
            let index = state.insert_record(record);
            if !in_pre_reserved {
                let segment_index = state.segment_of(base).expect("carve outside any segment");
                let head = state.segments[segment_index].alloc_head;
                state.records[index].next = head;
                state.segments[segment_index].alloc_head = Some(index);
            }
            state.live.insert(base, index);
            state.stats.bytes_in_use += carve_size;
            state.stats.live_allocations += 1;
            state.stats.total_allocations += 1;

            tracing::debug!(base, carve_size, in_pre_reserved, "code buffer reserved");
            BufferHandle::new(base)
        })
    }

    /// Copy generated bytes into the allocation, advancing `bytes_used`.
    ///
    /// Rejects any commit that would exceed the funded space; the
    /// allocation stays live and the caller is expected to free it.
    pub fn commit_buffer<P: WritablePhase>(
        &self,
        handle: BufferHandle<P>,
        source: &[u8],
    ) -> Result<BufferHandle<Committed>> {
        self.state.with(|state| {
            let index = state.live[&handle.base];
            let record = &mut state.records[index];
            debug_assert!(!record.finalized, "commit after finalize");

            let available = record.bytes_committed - record.bytes_used;
            if source.len() > available {
                return Err(Error::CommitOverflow {
                    requested: source.len(),
                    available,
                });
            }

            // The destination pages are committed read-write and this carve
            // is exclusively owned by the handle.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    source.as_ptr(),
                    (record.base + record.bytes_used) as *mut u8,
                    source.len(),
                );
            }
            record.bytes_used += source.len();
            debug_assert!(record.bytes_used <= record.bytes_committed);
            Ok(BufferHandle::new(handle.base))
        })
    }

    /// The write-then-execute transition: verify integrity, flip the pages
    /// to read-execute, and register unwind metadata.
    ///
    /// `layout_checksum` is the CRC32 the generator computed over its
    /// final layout; a mismatch against the committed bytes means the
    /// buffer was corrupted between emission and commit and is fatal.
    pub fn finalize(
        &self,
        handle: BufferHandle<Committed>,
        layout_checksum: Option<u32>,
    ) -> FinalizedCode {
        let allocator = &self.allocator;
        self.state.with(|state| {
            let index = state.live[&handle.base];
            let record = &mut state.records[index];

            let committed =
                unsafe { std::slice::from_raw_parts(record.base as *const u8, record.bytes_used) };
            let actual = crc32(committed);
            if let Some(expected) = layout_checksum {
                if expected != actual {
                    fatal(
                        FatalCode::CodeIntegrity,
                        &format!(
                            "code buffer checksum mismatch at {:#x} (expected {:#010x}, got {:#010x})",
                            record.base, expected, actual
                        ),
                    );
                }
            }

            if !allocator.make_executable(record.base as *mut u8, record.size) {
                fatal(
                    FatalCode::OutOfCodeMemory,
                    &format!("failed to protect {:#x} as executable", record.base),
                );
            }
            record.finalized = true;
            record.recorded = true;

            let registration = UnwindRegistration {
                begin: record.base,
                end: record.base + record.bytes_used,
                pdata_count: record.pdata_count,
                xdata_size: record.xdata_size,
            };
            let position = state
                .unwind
                .binary_search_by_key(&registration.begin, |r| r.begin)
                .unwrap_or_else(|insert_at| insert_at);
            state.unwind.insert(position, registration);

            let record = &state.records[index];
            tracing::debug!(base = record.base, len = record.bytes_used, "code buffer finalized");
            FinalizedCode { base: record.base, len: record.bytes_used, checksum: actual }
        })
    }

    /// Release a region by base address.
    ///
    /// Segment carves return to their segment's free list writable again;
    /// pre-reserved carves decommit their pages. Unwind metadata is
    /// deregistered first.
    pub fn free_allocation(&self, base: usize) -> Result<()> {
        let allocator = &self.allocator;
        self.state.with(|state| {
            let index = state.live.remove(&base).ok_or(Error::UnknownAllocation(base))?;
            state.unwind.retain(|r| r.begin != base);

            let (size, in_pre_reserved, finalized) = {
                let record = &state.records[index];
                (record.size, record.in_pre_reserved, record.finalized)
            };

            if in_pre_reserved {
                let region = state.pre_reserved.as_mut().expect("pre-reserved record without region");
                region.free(allocator, base, size / PAGE_SIZE);
                state.recycled_records.push(index);
            } else {
                if finalized && !allocator.commit_rw(base as *mut u8, size) {
                    fatal(
                        FatalCode::OutOfCodeMemory,
                        &format!("failed to reprotect {:#x} for reuse", base),
                    );
                }
                let segment_index = state.segment_of(base).expect("freed carve outside any segment");
                // Detach from the allocation list before the next link is
                // repurposed for the free list
                state.unlink_alloc(segment_index, index);
                let record = &mut state.records[index];
                record.bytes_used = 0;
                record.finalized = false;
                record.recorded = false;
                record.next = state.segments[segment_index].free_head;
                state.segments[segment_index].free_head = Some(index);
            }

            state.stats.bytes_in_use -= size;
            state.stats.live_allocations -= 1;
            state.stats.frees += 1;
            Ok(())
        })
    }

    /// Whether `addr` points into memory this manager handed out
    pub fn is_native_address(&self, addr: usize) -> bool {
        self.state.with(|state| {
            if state.pre_reserved.as_ref().is_some_and(|r| r.contains(addr)) {
                return true;
            }
            state.segments.iter().any(|s| s.contains(addr))
        })
    }

    /// Unwind lookup for a stack walker: the registration covering `addr`
    pub fn find_function_entry(&self, addr: usize) -> Option<UnwindRegistration> {
        self.state.with(|state| {
            state
                .unwind
                .iter()
                .find(|r| addr >= r.begin && addr < r.end)
                .copied()
        })
    }

    /// Usage counters
    pub fn stats(&self) -> EmitStats {
        self.state.with(|state| state.stats)
    }

    /// Accounting snapshot for one live allocation (tests and diagnostics)
    pub fn record_info(&self, base: usize) -> Option<(usize, usize, usize)> {
        self.state.with(|state| {
            let index = *state.live.get(&base)?;
            let record = &state.records[index];
            Some((record.bytes_used, record.bytes_committed, record.size))
        })
    }
}

impl<A: VirtualAllocator, L: LockPolicy> Drop for EmitBufferManager<A, L> {
    fn drop(&mut self) {
        let allocator = &self.allocator;
        self.state.with(|state| {
            for segment in state.segments.drain(..) {
                allocator.free(segment.base as *mut u8, segment.size);
            }
            if let Some(region) = state.pre_reserved.take() {
                region.release(allocator);
            }
        });
    }
}

impl ManagerState {
    /// Find space for a page-rounded carve, funding new pages as needed.
    /// Returns the base address, the carve's actual size (a reused carve
    /// keeps its original size), and whether it came from the pre-reserved
    /// range. Exhaustion of the system allocator is fatal.
    fn carve<A: VirtualAllocator>(
        &mut self,
        allocator: &A,
        total: usize,
        allow_pre_reserved: bool,
        segment_size: usize,
    ) -> (usize, usize, bool) {
        if allow_pre_reserved {
            if let Some(region) = self.pre_reserved.as_mut() {
                if let Some(base) = region.allocate(allocator, total / PAGE_SIZE) {
                    return (base, total, true);
                }
                // Range exhausted; fall through to ordinary reservation.
            }
        }

        // First fit over the segments' free lists
        for segment_index in 0..self.segments.len() {
            let mut cursor = self.segments[segment_index].free_head;
            let mut prev: Option<usize> = None;
            while let Some(index) = cursor {
                if self.records[index].size >= total {
                    let next = self.records[index].next;
                    match prev {
                        Some(p) => self.records[p].next = next,
                        None => self.segments[segment_index].free_head = next,
                    }
                    let base = self.records[index].base;
                    let size = self.records[index].size;
                    self.recycled_records.push(index);
                    return (base, size, false);
                }
                prev = Some(index);
                cursor = self.records[index].next;
            }
        }

        // Bump from an existing segment
        for segment in &mut self.segments {
            if segment.size - segment.cursor >= total {
                let base = segment.base + segment.cursor;
                segment.cursor += total;
                return (base, total, false);
            }
        }

        // New segment
        let size = segment_size.max(total);
        let ptr = allocator.alloc_rw(size);
        if ptr.is_null() {
            fatal(
                FatalCode::OutOfCodeMemory,
                &format!("failed to reserve {size} bytes of code memory"),
            );
        }
        self.stats.bytes_reserved += size;
        self.segments.push(Segment {
            base: ptr as usize,
            size,
            cursor: total,
            alloc_head: None,
            free_head: None,
        });
        (ptr as usize, total, false)
    }

    fn insert_record(&mut self, record: AllocationRecord) -> usize {
        match self.recycled_records.pop() {
            Some(index) => {
                self.records[index] = record;
                index
            }
            None => {
                self.records.push(record);
                self.records.len() - 1
            }
        }
    }

    fn segment_of(&self, addr: usize) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(addr))
    }

    fn unlink_alloc(&mut self, segment_index: usize, index: usize) {
        let mut cursor = self.segments[segment_index].alloc_head;
        let mut prev: Option<usize> = None;
        while let Some(current) = cursor {
            if current == index {
                let next = self.records[current].next;
                match prev {
                    Some(p) => self.records[p].next = next,
                    None => self.segments[segment_index].alloc_head = next,
                }
                return;
            }
            prev = Some(current);
            cursor = self.records[current].next;
        }
    }
}
