//! JIT-Time Snapshots
//!
//! A compilation attempt never touches the live heap directly. It works
//! from a [`FunctionSnapshot`]: an immutable record of one function and
//! everything the code generator is allowed to speculate about it —
//! bytecode location, observed property-access shapes, inlinee candidates,
//! constructor caches. Every address embedded in a snapshot is either a
//! context-lifetime singleton or a freshly allocated guard cell /
//! equivalence set encoding one individually revocable assumption.
//!
//! Snapshots for one attempt live in a [`SnapshotArena`] owned by that
//! attempt: inlinees reference their parent's arena, the whole tree drops
//! together, and nothing is copied. Candidates for the same polymorphic
//! call site are linked through a sibling pointer, most recent first.

pub mod builder;

pub use builder::{SnapshotBuilder, SnapshotConfig};

use crate::guards::{EquivalenceSet, GuardCell};
use crate::host::{
    AccessSiteId, CallSiteId, ConstructorProfile, FunctionId, FunctionMetadata, ProfileCounters,
    PropertyId, ShapeId,
};
use bitflags::bitflags;
use std::cell::{Cell, OnceCell};
use std::sync::Arc;
use typed_arena::Arena;

/// Arena holding every snapshot record of one compilation attempt.
///
/// The attempt owns the arena; child snapshots borrow from it. Dropping the
/// arena drops the whole tree at once.
pub type SnapshotArena<'a> = Arena<FunctionSnapshot<'a>>;

// ==================== Property Access Speculation ====================

/// The shape evidence backing one property-access speculation
#[derive(Debug)]
pub enum ObservedShapes {
    /// Exactly one shape was ever observed (monomorphic site)
    Single(ShapeId),
    /// Several layout-compatible shapes, interchangeable for this site
    Set(Arc<EquivalenceSet>),
}

/// Everything the generator may assume about one property-access site.
///
/// The guard cell is freshly allocated for this site; it holds the most
/// recently observed shape's address and is the word the generated code
/// re-checks before trusting `slot_index`.
#[derive(Debug)]
pub struct PropertyAccessSpeculation {
    pub site: AccessSiteId,
    pub property: PropertyId,
    /// Slot index to bake into the access
    pub slot_index: u16,
    /// Whether the site stores to the property
    pub is_store: bool,
    /// Whether the access traverses the prototype chain
    pub loads_from_proto: bool,
    /// Whether the loaded value is constant-foldable
    pub is_fixed_value: bool,
    pub observed: ObservedShapes,
    pub guard: Arc<GuardCell>,
}

bitflags! {
    /// Property operations the compiled function performs under guard.
    ///
    /// Accumulated bottom-up: each inlinee ors its own operations into its
    /// caller's constructor snapshots, so the finished root records every
    /// guarded operation anywhere in the compiled body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuardedPropOps: u8 {
        const LOAD             = 1 << 0;
        const STORE            = 1 << 1;
        const PROTO_ACCESS     = 1 << 2;
        const FIXED_VALUE_LOAD = 1 << 3;
    }
}

impl GuardedPropOps {
    /// Operations implied by one property-access speculation
    pub fn from_speculation(spec: &PropertyAccessSpeculation) -> GuardedPropOps {
        let mut ops = if spec.is_store {
            GuardedPropOps::STORE
        } else {
            GuardedPropOps::LOAD
        };
        if spec.loads_from_proto {
            ops |= GuardedPropOps::PROTO_ACCESS;
        }
        if spec.is_fixed_value {
            ops |= GuardedPropOps::FIXED_VALUE_LOAD;
        }
        ops
    }
}

// ==================== Constructor Snapshot ====================

/// Snapshot of a [`ConstructorCache`] taken for one `new` site.
///
/// Mutable only while the attempt is being built; `freeze` marks the
/// hand-off to the generator, after which accumulation is a bug.
#[derive(Debug)]
pub struct ConstructorSnapshot {
    pub produced_shape: ShapeId,
    pub inline_slot_count: u16,
    pub aux_slot_count: u16,
    pub skip_default_object: bool,
    /// Advisory: whether the live cache had been exercised when the
    /// snapshot was taken. The cache may change afterwards; reconcile
    /// against it once compilation completes.
    pub is_used: bool,
    guarded_ops: Cell<GuardedPropOps>,
    frozen: Cell<bool>,
}

impl ConstructorSnapshot {
    pub fn new(profile: ConstructorProfile, is_used: bool) -> Self {
        ConstructorSnapshot {
            produced_shape: profile.produced_shape,
            inline_slot_count: profile.inline_slot_count,
            aux_slot_count: profile.aux_slot_count,
            skip_default_object: profile.skip_default_object,
            is_used,
            guarded_ops: Cell::new(GuardedPropOps::empty()),
            frozen: Cell::new(false),
        }
    }

    /// Or more guarded operations into the accumulated set
    pub fn accumulate(&self, ops: GuardedPropOps) {
        debug_assert!(!self.frozen.get(), "constructor snapshot already handed off");
        self.guarded_ops.set(self.guarded_ops.get() | ops);
    }

    /// The accumulated operation set
    pub fn guarded_ops(&self) -> GuardedPropOps {
        self.guarded_ops.get()
    }

    /// Mark the snapshot as handed to the generator; read-only from here
    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }
}

/// The live-heap constructor cache a [`ConstructorSnapshot`] copies.
///
/// Owned by the runtime; keeps changing while compilation runs in the
/// background. After compilation the caller reconciles the snapshot
/// against the current cache state to decide whether the baked
/// constructor fast path is still trustworthy.
#[derive(Debug, Clone)]
pub struct ConstructorCache {
    profile: ConstructorProfile,
    is_used: bool,
}

impl ConstructorCache {
    pub fn new(profile: ConstructorProfile) -> Self {
        ConstructorCache { profile, is_used: false }
    }

    /// Runtime hook: the constructor ran through this cache
    pub fn mark_used(&mut self) {
        self.is_used = true;
    }

    /// Runtime hook: the constructor's produced shape changed
    pub fn update_shape(&mut self, shape: ShapeId) {
        self.profile.produced_shape = shape;
    }

    pub fn profile(&self) -> ConstructorProfile {
        self.profile
    }

    pub fn is_used(&self) -> bool {
        self.is_used
    }

    /// Copy the current cache state for a compilation attempt
    pub fn snapshot(&self) -> ConstructorSnapshot {
        ConstructorSnapshot::new(self.profile, self.is_used)
    }

    /// Post-compilation check: does the snapshot still describe this
    /// cache? The `is_used` flag on the snapshot is advisory only — a
    /// cache that went unused at snapshot time but is used now is fine;
    /// a changed produced-shape is not.
    pub fn reconcile(&self, snapshot: &ConstructorSnapshot) -> bool {
        self.profile.produced_shape == snapshot.produced_shape
            && self.profile.skip_default_object == snapshot.skip_default_object
    }
}

// ==================== Function Snapshot ====================

/// One call site's inlinee candidates, most recent first.
///
/// The list is threaded through each candidate's sibling pointer, so a
/// snapshot belongs to at most one chain. An entry that is the enclosing
/// function's own snapshot marks direct recursive inlining.
#[derive(Debug)]
pub struct InlineeChain<'a> {
    pub site: CallSiteId,
    head: Cell<Option<&'a FunctionSnapshot<'a>>>,
}

impl<'a> InlineeChain<'a> {
    pub fn new(site: CallSiteId) -> Self {
        InlineeChain { site, head: Cell::new(None) }
    }

    /// Insert a candidate at the front (insertion order is
    /// most-recent-first)
    pub fn push_front(&self, candidate: &'a FunctionSnapshot<'a>) {
        candidate.next_candidate.set(self.head.get());
        self.head.set(Some(candidate));
    }

    /// Walk the candidates front to back
    pub fn iter(&self) -> InlineeIter<'a> {
        InlineeIter { next: self.head.get() }
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// Iterator over an inlinee chain
pub struct InlineeIter<'a> {
    next: Option<&'a FunctionSnapshot<'a>>,
}

impl<'a> Iterator for InlineeIter<'a> {
    type Item = &'a FunctionSnapshot<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next_candidate.get();
        Some(current)
    }
}

/// Immutable, per-compilation-attempt record of one function.
///
/// Owned exclusively by one attempt's [`SnapshotArena`]; referenced, never
/// copied, by child snapshots. The tree is acyclic except for the explicit
/// self-referential recursive-inlinee entry.
#[derive(Debug)]
pub struct FunctionSnapshot<'a> {
    pub function: FunctionId,
    pub metadata: FunctionMetadata,
    pub counters: ProfileCounters,
    pub property_sites: Vec<PropertyAccessSpeculation>,
    pub constructor_sites: Vec<ConstructorSnapshot>,
    /// Attached once the snapshot is arena-resident, so recursive
    /// candidates can point back at it
    call_sites: OnceCell<Vec<InlineeChain<'a>>>,
    /// Sibling link for the polymorphic candidate list of the call site
    /// this snapshot was inlined into
    next_candidate: Cell<Option<&'a FunctionSnapshot<'a>>>,
}

impl<'a> FunctionSnapshot<'a> {
    pub fn new(
        function: FunctionId,
        metadata: FunctionMetadata,
        counters: ProfileCounters,
    ) -> Self {
        FunctionSnapshot {
            function,
            metadata,
            counters,
            property_sites: Vec::new(),
            constructor_sites: Vec::new(),
            call_sites: OnceCell::new(),
            next_candidate: Cell::new(None),
        }
    }

    /// Inlinee chains for this function's call sites
    pub fn call_sites(&self) -> &[InlineeChain<'a>] {
        self.call_sites.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn set_call_sites(&self, chains: Vec<InlineeChain<'a>>) {
        let already_set = self.call_sites.set(chains).is_err();
        debug_assert!(!already_set, "call sites attached twice");
    }

    /// Whether `candidate` in one of this function's chains marks direct
    /// recursive inlining (the entry is this snapshot itself)
    pub fn is_recursive_candidate(&self, candidate: &FunctionSnapshot<'a>) -> bool {
        std::ptr::eq(self, candidate)
    }

    /// Guarded property operations performed directly by this function
    pub fn own_guarded_ops(&self) -> GuardedPropOps {
        self.property_sites
            .iter()
            .fold(GuardedPropOps::empty(), |ops, spec| {
                ops | GuardedPropOps::from_speculation(spec)
            })
    }

    /// Every guard cell in this snapshot and its inlinees, in tree order
    /// (own sites first, then each chain front to back). This is the order
    /// the compiled output reports guard addresses in.
    pub fn collect_guards(&self, out: &mut Vec<Arc<GuardCell>>) {
        for spec in &self.property_sites {
            out.push(Arc::clone(&spec.guard));
        }
        for chain in self.call_sites() {
            for candidate in chain.iter() {
                if !self.is_recursive_candidate(candidate) {
                    candidate.collect_guards(out);
                }
            }
        }
    }

    /// Number of snapshots in this tree (recursive entries not recounted)
    pub fn tree_size(&self) -> usize {
        let mut count = 1;
        for chain in self.call_sites() {
            for candidate in chain.iter() {
                if !self.is_recursive_candidate(candidate) {
                    count += candidate.tree_size();
                }
            }
        }
        count
    }

    /// Freeze every constructor snapshot in the tree for generator hand-off
    pub fn freeze_constructor_sites(&self) {
        for ctor in &self.constructor_sites {
            ctor.freeze();
        }
        for chain in self.call_sites() {
            for candidate in chain.iter() {
                if !self.is_recursive_candidate(candidate) {
                    candidate.freeze_constructor_sites();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CodeRegion;

    fn metadata() -> FunctionMetadata {
        FunctionMetadata {
            bytecode_addr: 0x5000,
            bytecode_len: 64,
            register_count: 8,
            slot_count: 4,
            loop_regions: vec![CodeRegion { start: 10, end: 40 }],
            try_regions: vec![],
        }
    }

    fn leaf<'a>(arena: &'a SnapshotArena<'a>, id: u32) -> &'a FunctionSnapshot<'a> {
        arena.alloc(FunctionSnapshot::new(
            FunctionId(id),
            metadata(),
            ProfileCounters::default(),
        ))
    }

    #[test]
    fn test_inlinee_chain_most_recent_first() {
        let arena = SnapshotArena::new();
        let chain = InlineeChain::new(CallSiteId(0));
        chain.push_front(leaf(&arena, 1));
        chain.push_front(leaf(&arena, 2));
        chain.push_front(leaf(&arena, 3));

        let order: Vec<u32> = chain.iter().map(|s| s.function.0).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_recursive_candidate_is_self_referential() {
        let arena = SnapshotArena::new();
        let root = leaf(&arena, 1);
        let chain = InlineeChain::new(CallSiteId(0));
        chain.push_front(root);

        let entry = chain.iter().next().unwrap();
        assert!(root.is_recursive_candidate(entry));
        assert!(!root.is_recursive_candidate(leaf(&arena, 2)));
    }

    #[test]
    fn test_constructor_snapshot_accumulates_until_frozen() {
        let profile = ConstructorProfile {
            produced_shape: ShapeId(0x100),
            inline_slot_count: 4,
            aux_slot_count: 0,
            skip_default_object: true,
        };
        let snap = ConstructorSnapshot::new(profile, false);
        snap.accumulate(GuardedPropOps::LOAD);
        snap.accumulate(GuardedPropOps::STORE | GuardedPropOps::PROTO_ACCESS);
        assert_eq!(
            snap.guarded_ops(),
            GuardedPropOps::LOAD | GuardedPropOps::STORE | GuardedPropOps::PROTO_ACCESS
        );

        snap.freeze();
        assert!(snap.is_frozen());
        assert!(snap.guarded_ops().contains(GuardedPropOps::LOAD));
    }

    #[test]
    fn test_constructor_cache_reconcile() {
        let profile = ConstructorProfile {
            produced_shape: ShapeId(0x100),
            inline_slot_count: 2,
            aux_slot_count: 0,
            skip_default_object: false,
        };
        let mut cache = ConstructorCache::new(profile);
        let snap = cache.snapshot();
        assert!(!snap.is_used);

        // Becoming used after the snapshot is fine — the flag is advisory
        cache.mark_used();
        assert!(cache.reconcile(&snap));

        // A different produced shape is not
        cache.update_shape(ShapeId(0x200));
        assert!(!cache.reconcile(&snap));
    }

    #[test]
    fn test_guarded_ops_from_speculation() {
        let spec = PropertyAccessSpeculation {
            site: AccessSiteId(0),
            property: PropertyId(7),
            slot_index: 3,
            is_store: false,
            loads_from_proto: true,
            is_fixed_value: true,
            observed: ObservedShapes::Single(ShapeId(0x100)),
            guard: Arc::new(GuardCell::with_value(0x100)),
        };
        let ops = GuardedPropOps::from_speculation(&spec);
        assert!(ops.contains(GuardedPropOps::LOAD));
        assert!(ops.contains(GuardedPropOps::PROTO_ACCESS));
        assert!(ops.contains(GuardedPropOps::FIXED_VALUE_LOAD));
        assert!(!ops.contains(GuardedPropOps::STORE));
    }

    #[test]
    fn test_collect_guards_tree_order() {
        let arena = SnapshotArena::new();

        let mut child = FunctionSnapshot::new(
            FunctionId(2),
            metadata(),
            ProfileCounters::default(),
        );
        let child_guard = Arc::new(GuardCell::with_value(0x200));
        child.property_sites.push(PropertyAccessSpeculation {
            site: AccessSiteId(0),
            property: PropertyId(1),
            slot_index: 0,
            is_store: false,
            loads_from_proto: false,
            is_fixed_value: false,
            observed: ObservedShapes::Single(ShapeId(0x200)),
            guard: Arc::clone(&child_guard),
        });
        let child = arena.alloc(child);

        let mut root = FunctionSnapshot::new(
            FunctionId(1),
            metadata(),
            ProfileCounters::default(),
        );
        let root_guard = Arc::new(GuardCell::with_value(0x100));
        root.property_sites.push(PropertyAccessSpeculation {
            site: AccessSiteId(0),
            property: PropertyId(2),
            slot_index: 1,
            is_store: true,
            loads_from_proto: false,
            is_fixed_value: false,
            observed: ObservedShapes::Single(ShapeId(0x100)),
            guard: Arc::clone(&root_guard),
        });
        let root: &FunctionSnapshot<'_> = arena.alloc(root);
        let chain = InlineeChain::new(CallSiteId(0));
        chain.push_front(child);
        root.set_call_sites(vec![chain]);

        let mut guards = Vec::new();
        root.collect_guards(&mut guards);
        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].code_word_addr(), root_guard.code_word_addr());
        assert_eq!(guards[1].code_word_addr(), child_guard.code_word_addr());

        assert_eq!(root.tree_size(), 2);
    }
}
