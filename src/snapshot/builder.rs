//! Snapshot construction
//!
//! One [`SnapshotBuilder`] drives one compilation attempt. It reads the
//! host's bytecode, profile, and shape accessors, allocates fresh guard
//! cells and equivalence sets for every speculation, and produces the
//! attempt's snapshot tree. Building never mutates the speculative state
//! it reads — existing caches and guards are left untouched.
//!
//! The builder is single-threaded per attempt, but attempts for different
//! functions run concurrently with each other and with the interpreter.

use crate::error::{Error, Result};
use crate::guards::{EquivalenceSet, GuardCell};
use crate::host::{
    AccessSiteProfile, BytecodeProvider, FunctionId, ProfileProvider, ShapeProvider,
};
use crate::snapshot::{
    ConstructorSnapshot, FunctionSnapshot, GuardedPropOps, InlineeChain, ObservedShapes,
    PropertyAccessSpeculation, SnapshotArena,
};
use std::sync::Arc;

/// How deep an inlinee tree may grow below the root
const DEFAULT_MAX_INLINE_DEPTH: u32 = 4;
/// Candidate cap per polymorphic call site, matching the inline-cache limit
const DEFAULT_MAX_POLYMORPHIC_CANDIDATES: usize = 4;
/// Snapshot records one attempt may allocate before giving up
const DEFAULT_RECORD_BUDGET: usize = 4096;
/// Call sites colder than this are not worth inlining
const DEFAULT_MIN_INLINE_CALL_COUNT: u64 = 50;

/// Tunables for one compilation attempt
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub max_inline_depth: u32,
    pub max_polymorphic_candidates: usize,
    /// Per-attempt record budget; exceeding it aborts the attempt only
    pub record_budget: usize,
    pub min_inline_call_count: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            max_inline_depth: DEFAULT_MAX_INLINE_DEPTH,
            max_polymorphic_candidates: DEFAULT_MAX_POLYMORPHIC_CANDIDATES,
            record_budget: DEFAULT_RECORD_BUDGET,
            min_inline_call_count: DEFAULT_MIN_INLINE_CALL_COUNT,
        }
    }
}

/// Builds the snapshot tree for one compilation attempt
pub struct SnapshotBuilder<'h, B, P, S> {
    bytecode: &'h B,
    profile: &'h P,
    shapes: &'h S,
    config: SnapshotConfig,
}

impl<'h, B, P, S> SnapshotBuilder<'h, B, P, S>
where
    B: BytecodeProvider,
    P: ProfileProvider,
    S: ShapeProvider,
{
    pub fn new(bytecode: &'h B, profile: &'h P, shapes: &'h S, config: SnapshotConfig) -> Self {
        SnapshotBuilder { bytecode, profile, shapes, config }
    }

    /// Build the snapshot tree for `function` into `arena`.
    ///
    /// Returns the root snapshot, with every constructor site frozen and
    /// ready for generator hand-off.
    pub fn build<'a>(
        &self,
        arena: &'a SnapshotArena<'a>,
        function: FunctionId,
    ) -> Result<&'a FunctionSnapshot<'a>> {
        let mut ancestors = Vec::new();
        let root = self.build_function(arena, function, 0, &mut ancestors)?;

        // Bubble guarded property operations up into the root's
        // constructor snapshots before freezing the tree.
        let accumulated = Self::accumulate_ops(root);
        for ctor in &root.constructor_sites {
            ctor.accumulate(accumulated);
        }
        root.freeze_constructor_sites();

        tracing::debug!(
            function = function.0,
            records = root.tree_size(),
            "snapshot attempt complete"
        );
        Ok(root)
    }

    fn build_function<'a>(
        &self,
        arena: &'a SnapshotArena<'a>,
        function: FunctionId,
        depth: u32,
        ancestors: &mut Vec<FunctionId>,
    ) -> Result<&'a FunctionSnapshot<'a>> {
        self.charge_record(arena)?;

        let metadata = self
            .bytecode
            .function_metadata(function)
            .ok_or(Error::CompilationFailed {
                status: crate::error::CompileStatus::MalformedWorkItem,
            })?;
        let counters = self.profile.counters(function);

        let mut snapshot = FunctionSnapshot::new(function, metadata, counters);
        snapshot.property_sites = self.build_property_sites(function);
        snapshot.constructor_sites = self.build_constructor_sites(function);

        // Call sites are attached after the snapshot is arena-resident so
        // recursive candidates can point back at it.
        let snapshot: &'a FunctionSnapshot<'a> = arena.alloc(snapshot);

        ancestors.push(function);
        let chains = self.build_call_sites(arena, snapshot, depth, ancestors);
        ancestors.pop();
        snapshot.set_call_sites(chains?);
        Ok(snapshot)
    }

    fn build_property_sites(&self, function: FunctionId) -> Vec<PropertyAccessSpeculation> {
        let mut sites = Vec::new();
        for site in self.profile.access_sites(function) {
            let Some(profile) = self.profile.access_site(function, site) else {
                continue;
            };
            if let Some(spec) = self.speculate_access(site, &profile) {
                sites.push(spec);
            }
        }
        sites
    }

    /// Turn one site profile into a speculation, or `None` when the site
    /// gives nothing safe to speculate on.
    fn speculate_access(
        &self,
        site: crate::host::AccessSiteId,
        profile: &AccessSiteProfile,
    ) -> Option<PropertyAccessSpeculation> {
        let distinct = distinct_shapes(&profile.observed_shapes);
        let newest = *profile.observed_shapes.last()?;

        let observed = if distinct.len() == 1 {
            ObservedShapes::Single(newest)
        } else {
            // Only layout-compatible shapes are interchangeable; anything
            // else would bake a wrong slot index for some member.
            let reference = self.shapes.slot_layout(newest)?;
            let compatible: Vec<_> = distinct
                .into_iter()
                .filter(|&shape| {
                    self.shapes
                        .slot_layout(shape)
                        .is_some_and(|layout| layout.inline_slot_count == reference.inline_slot_count)
                })
                .collect();
            if compatible.len() < 2 {
                ObservedShapes::Single(newest)
            } else {
                ObservedShapes::Set(Arc::new(EquivalenceSet::new(compatible)))
            }
        };

        // The guard holds the most recent shape address; heap addresses
        // never collide with the sentinel words.
        let guard = Arc::new(GuardCell::with_value(newest.0));

        Some(PropertyAccessSpeculation {
            site,
            property: profile.property,
            slot_index: profile.slot_index,
            is_store: profile.is_store,
            loads_from_proto: profile.loads_from_proto,
            is_fixed_value: profile.is_fixed_value,
            observed,
            guard,
        })
    }

    fn build_constructor_sites(&self, function: FunctionId) -> Vec<ConstructorSnapshot> {
        let mut sites = Vec::new();
        for site in self.profile.call_sites(function) {
            if let Some(profile) = self.profile.constructor_cache(function, site) {
                let used = self
                    .profile
                    .call_site(function, site)
                    .map(|call| call.call_count > 0)
                    .unwrap_or(false);
                sites.push(ConstructorSnapshot::new(profile, used));
            }
        }
        sites
    }

    fn build_call_sites<'a>(
        &self,
        arena: &'a SnapshotArena<'a>,
        parent: &'a FunctionSnapshot<'a>,
        depth: u32,
        ancestors: &mut Vec<FunctionId>,
    ) -> Result<Vec<InlineeChain<'a>>> {
        let mut chains = Vec::new();
        if depth >= self.config.max_inline_depth {
            return Ok(chains);
        }

        for site in self.profile.call_sites(parent.function) {
            let Some(profile) = self.profile.call_site(parent.function, site) else {
                continue;
            };
            if profile.call_count < self.config.min_inline_call_count {
                continue;
            }

            let chain = InlineeChain::new(site);
            // Candidates arrive most recent first; pushing front-to-back in
            // reverse keeps the chain in observation order.
            let capped: Vec<_> = profile
                .callees
                .iter()
                .take(self.config.max_polymorphic_candidates)
                .copied()
                .collect();
            for callee in capped.into_iter().rev() {
                if callee == parent.function {
                    // Direct recursion: the self-referential entry.
                    chain.push_front(parent);
                    continue;
                }
                if ancestors.contains(&callee) {
                    // Indirect recursion would cycle the tree; skip.
                    continue;
                }
                match self.build_function(arena, callee, depth + 1, ancestors) {
                    Ok(child) => chain.push_front(child),
                    // A stale callee id is not worth failing the attempt
                    Err(Error::CompilationFailed { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            if !chain.is_empty() {
                chains.push(chain);
            }
        }
        Ok(chains)
    }

    /// Bottom-up or of every function's own guarded operations
    fn accumulate_ops(snapshot: &FunctionSnapshot<'_>) -> GuardedPropOps {
        let mut ops = snapshot.own_guarded_ops();
        for chain in snapshot.call_sites() {
            for candidate in chain.iter() {
                if !snapshot.is_recursive_candidate(candidate) {
                    ops |= Self::accumulate_ops(candidate);
                }
            }
        }
        ops
    }

    fn charge_record(&self, arena: &SnapshotArena<'_>) -> Result<()> {
        let used = arena.len();
        if used >= self.config.record_budget {
            return Err(Error::SnapshotBudgetExceeded {
                used: used + 1,
                budget: self.config.record_budget,
            });
        }
        Ok(())
    }
}

fn distinct_shapes(observed: &[crate::host::ShapeId]) -> Vec<crate::host::ShapeId> {
    let mut shapes = observed.to_vec();
    shapes.sort_unstable();
    shapes.dedup();
    shapes
}
