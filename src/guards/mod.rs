//! Invalidation Guards
//!
//! Generated code speculates: a property lives at slot 3, a constructor
//! produces shape `S`, a prototype chain is untouched. Every such
//! assumption is backed by a [`GuardCell`] — a single pointer-sized word
//! the generated code reads immediately before relying on the assumption.
//! The runtime side writes the word; the generated-code side only ever
//! reads it and branches to the bailout path when it is no longer valid.
//!
//! The heap's mutation hooks drive invalidation through [`GuardRegistry`]:
//! when a shape transitions or a property attribute changes, every cell
//! registered against that shape is invalidated. Sweep-phase invalidation
//! is a separate, mutually exclusive entry point that records a
//! diagnostic-only variant of the invalid state.

pub mod equivalence;

pub use equivalence::{EquivalenceCache, EquivalenceSet, EQUIVALENCE_CACHE_CAPACITY};

use crate::error::{Error, Result};
use crate::host::ShapeId;
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

// ==================== Guard Cell ====================

/// Raw word: the cell has been invalidated by a heap mutation
pub const WORD_INVALIDATED: usize = 0;
/// Raw word: the cell has been created but never given a value
pub const WORD_UNINITIALIZED: usize = 1;
/// Raw word: the cell was invalidated during a collector sweep phase
pub const WORD_INVALIDATED_DURING_SWEEP: usize = 2;

/// Decoded state of a guard cell.
///
/// This is the API-facing view. Generated code never sees it; it reads the
/// raw word and compares against the sentinels directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Created, no value written yet
    Uninitialized,
    /// Holding a live address; the speculation it backs still holds
    Valid(usize),
    /// Invalidated by a mutator-time heap change. Terminal.
    Invalidated,
    /// Invalidated during a collector sweep. Terminal, diagnostic variant.
    InvalidatedDuringSweep,
}

impl GuardState {
    /// Decode a raw cell word
    pub fn from_word(word: usize) -> GuardState {
        match word {
            WORD_INVALIDATED => GuardState::Invalidated,
            WORD_UNINITIALIZED => GuardState::Uninitialized,
            WORD_INVALIDATED_DURING_SWEEP => GuardState::InvalidatedDuringSweep,
            value => GuardState::Valid(value),
        }
    }

    /// Encode back to the raw word generated code compares against
    pub fn to_word(self) -> usize {
        match self {
            GuardState::Invalidated => WORD_INVALIDATED,
            GuardState::Uninitialized => WORD_UNINITIALIZED,
            GuardState::InvalidatedDuringSweep => WORD_INVALIDATED_DURING_SWEEP,
            GuardState::Valid(value) => value,
        }
    }
}

/// A single invalidatable word consulted by generated code.
///
/// Ownership: cells are created and written exclusively by the runtime side
/// (the side that owns the live shape being guarded). Generated code holds
/// the word's address and performs a read-compare-branch; it never writes.
/// A cell lives as long as the compiled artifact that references it — the
/// compiled output's guard list keeps an `Arc` per cell.
///
/// Writes are atomic pointer-sized stores. A read racing an invalidation is
/// fine: the reader either sees the old valid word (and the next check
/// after a safepoint sees the invalidation) or the sentinel.
#[derive(Debug)]
pub struct GuardCell {
    word: AtomicUsize,
    /// Set when the cell is sweep-invalidated a second time
    reincarnated: AtomicBool,
}

impl GuardCell {
    /// Create a cell in the `Uninitialized` state
    pub fn new() -> Self {
        GuardCell {
            word: AtomicUsize::new(WORD_UNINITIALIZED),
            reincarnated: AtomicBool::new(false),
        }
    }

    /// Create a cell already holding a value.
    ///
    /// Panics on sentinel input in debug builds; snapshot builders only
    /// call this with heap addresses, which are never 0, 1, or 2.
    pub fn with_value(value: usize) -> Self {
        debug_assert!(!is_sentinel(value), "guard value collides with a sentinel");
        GuardCell {
            word: AtomicUsize::new(value),
            reincarnated: AtomicBool::new(false),
        }
    }

    /// Decoded state of the cell
    pub fn state(&self) -> GuardState {
        GuardState::from_word(self.word.load(Ordering::Acquire))
    }

    /// Whether the speculation backed by this cell still holds
    pub fn is_valid(&self) -> bool {
        matches!(self.state(), GuardState::Valid(_))
    }

    /// The guarded value, if the cell is valid
    pub fn value(&self) -> Option<usize> {
        match self.state() {
            GuardState::Valid(value) => Some(value),
            _ => None,
        }
    }

    /// Write a new value.
    ///
    /// Legal only from `Uninitialized` or `Valid`. Sentinel inputs are
    /// rejected so an invalidation can never be forged through this path,
    /// and writes after invalidation are contract violations reported as
    /// errors rather than silently resurrecting the cell.
    pub fn set_value(&self, value: usize) -> Result<()> {
        if is_sentinel(value) {
            return Err(Error::GuardSentinelValue(value));
        }
        // Single-writer discipline: only the runtime side calls this, so a
        // load/store pair does not race another set_value.
        match self.state() {
            GuardState::Uninitialized | GuardState::Valid(_) => {
                self.word.store(value, Ordering::Release);
                Ok(())
            }
            GuardState::Invalidated | GuardState::InvalidatedDuringSweep => {
                Err(Error::GuardCellReuse)
            }
        }
    }

    /// Invalidate from a mutator-time heap change. Idempotent; the cell
    /// never returns to `Valid`.
    pub fn invalidate(&self) {
        self.word.store(WORD_INVALIDATED, Ordering::Release);
    }

    /// Invalidate during a collector sweep phase.
    ///
    /// Functionally identical to [`invalidate`](Self::invalidate); the
    /// distinct sentinel exists for crash-bucket diagnostics. A second
    /// sweep-invalidation of the same cell sets the reincarnation flag.
    pub fn invalidate_during_sweep(&self) {
        let prev = self.word.swap(WORD_INVALIDATED_DURING_SWEEP, Ordering::AcqRel);
        if prev == WORD_INVALIDATED_DURING_SWEEP {
            self.reincarnated.store(true, Ordering::Release);
        }
    }

    /// Diagnostic: whether this cell was sweep-invalidated more than once
    pub fn was_reincarnated(&self) -> bool {
        self.reincarnated.load(Ordering::Acquire)
    }

    /// Address of the raw word, for embedding into generated code.
    ///
    /// The address stays stable for the life of the cell; callers pin the
    /// cell with an `Arc` in the compiled artifact's guard list.
    pub fn code_word_addr(&self) -> usize {
        &self.word as *const AtomicUsize as usize
    }
}

impl Default for GuardCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a word is one of the reserved guard sentinels
#[inline]
pub fn is_sentinel(word: usize) -> bool {
    word <= WORD_INVALIDATED_DURING_SWEEP
}

/// The read generated code performs at a speculation point.
///
/// # Safety
/// `addr` must be the `code_word_addr` of a live [`GuardCell`]. This is the
/// in-process stand-in for the load instruction a backend would emit.
pub unsafe fn read_guard_word(addr: usize) -> usize {
    let cell = addr as *const AtomicUsize;
    unsafe { (*cell).load(Ordering::Acquire) }
}

/// The compare half of the guard check: a word passes if it is not a
/// sentinel. Branching to the bailout path on failure is the caller's job.
#[inline]
pub fn guard_word_passes(word: usize) -> bool {
    !is_sentinel(word)
}

// ==================== Guard Registry ====================

/// Which invalidation phase currently owns the registry.
///
/// Mutator-time and sweep-time invalidation are mutually exclusive phases:
/// a cell must never be invalidated-during-sweep and invalidated-normally
/// concurrently. The registry lock serializes them; the phase field exists
/// to catch re-entrant notification from inside a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvalidationPhase {
    Mutator,
    Sweep,
}

#[derive(Debug, Default)]
struct RegistryStats {
    mutator_invalidations: u64,
    sweep_invalidations: u64,
}

struct RegistryInner {
    watchers: HashMap<ShapeId, Vec<Weak<GuardCell>>>,
    phase: InvalidationPhase,
    stats: RegistryStats,
}

/// Maps shapes to the guard cells that speculate on them.
///
/// The heap's shape/property change hook calls
/// [`notify_shape_changed`](Self::notify_shape_changed); the collector's
/// sweep calls [`sweep`](Self::sweep). Cells are held weakly — dropping a
/// compiled artifact (and with it the `Arc`s in its guard list) is all the
/// deregistration that is needed; dead entries are pruned as they are
/// encountered.
pub struct GuardRegistry {
    inner: Mutex<RegistryInner>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        GuardRegistry {
            inner: Mutex::new(RegistryInner {
                watchers: HashMap::default(),
                phase: InvalidationPhase::Mutator,
                stats: RegistryStats::default(),
            }),
        }
    }

    /// Register a cell to be invalidated when `shape` changes
    pub fn register(&self, shape: ShapeId, cell: &Arc<GuardCell>) {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.entry(shape).or_default().push(Arc::downgrade(cell));
    }

    /// Mutator-time hook: a shape transitioned or a property attribute on
    /// it changed. Invalidates every live cell registered against it.
    /// Returns the number of cells invalidated.
    pub fn notify_shape_changed(&self, shape: ShapeId) -> usize {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.phase, InvalidationPhase::Mutator);
        let mut invalidated = 0;
        if let Some(cells) = inner.watchers.get_mut(&shape) {
            cells.retain(|weak| match weak.upgrade() {
                Some(cell) => {
                    cell.invalidate();
                    invalidated += 1;
                    true
                }
                None => false,
            });
            if cells.is_empty() {
                inner.watchers.remove(&shape);
            }
        }
        if invalidated > 0 {
            inner.stats.mutator_invalidations += invalidated as u64;
            tracing::trace!(shape = shape.0, invalidated, "shape change invalidated guards");
        }
        invalidated
    }

    /// Sweep-phase hook: the collector determined these shapes are dying.
    /// Runs as one exclusive phase; mutator notifications are blocked for
    /// its duration. Returns the number of cells invalidated.
    pub fn sweep<I: IntoIterator<Item = ShapeId>>(&self, shapes: I) -> usize {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.phase, InvalidationPhase::Mutator);
        inner.phase = InvalidationPhase::Sweep;
        let mut invalidated = 0;
        for shape in shapes {
            if let Some(cells) = inner.watchers.remove(&shape) {
                for weak in cells {
                    if let Some(cell) = weak.upgrade() {
                        cell.invalidate_during_sweep();
                        invalidated += 1;
                    }
                }
            }
        }
        inner.stats.sweep_invalidations += invalidated as u64;
        inner.phase = InvalidationPhase::Mutator;
        if invalidated > 0 {
            tracing::trace!(invalidated, "sweep invalidated guards");
        }
        invalidated
    }

    /// Number of shapes currently watched
    pub fn watched_shape_count(&self) -> usize {
        self.inner.lock().unwrap().watchers.len()
    }

    /// (mutator, sweep) invalidation totals since creation
    pub fn invalidation_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.stats.mutator_invalidations, inner.stats.sweep_invalidations)
    }
}

impl Default for GuardRegistry {
    fn default() -> Self {
        Self::new()
    }
}
