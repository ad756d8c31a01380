//! Compilation work items
//!
//! A [`CompilationWorkItem`] is the flat, address-translated form of one
//! snapshot tree — the only shape in which function state crosses the
//! generator boundary. Arena references become indices, and every embedded
//! address becomes a [`TargetAddr`]: a pointer-sized integer valid in the
//! *generator's target* address space. Nothing on the sending side ever
//! dereferences a target address; only the generator, which knows it is
//! addressing the target process, may bake them into code.

use crate::error::CompileStatus;
use crate::host::{AccessSiteId, CallSiteId, CodeRegion, FunctionId, ProfileCounters, PropertyId};
use crate::snapshot::{FunctionSnapshot, ObservedShapes};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};

use super::WellKnownAddrs;

// ==================== Address Translation ====================

/// Identity of one script execution context across the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContextId(pub u32);

/// An address valid in this process. Never serialized; translating it is
/// the only way to get a wire-visible address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct LocalAddr(pub usize);

/// An address valid in the generator's target process.
///
/// The distinct type is the "which address space is this valid in" tag:
/// a `TargetAddr` cannot be dereferenced here, and a [`LocalAddr`] cannot
/// cross the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TargetAddr(pub u64);

/// Per-context base-address difference between the two sides.
///
/// When runtime and generator share an address space the delta is zero and
/// translation is the identity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AddressTranslator {
    base_delta: i64,
}

impl AddressTranslator {
    /// Shared address space: translation is the identity
    pub fn identity() -> Self {
        AddressTranslator { base_delta: 0 }
    }

    /// Distinct address spaces separated by a fixed base offset
    pub fn with_delta(base_delta: i64) -> Self {
        AddressTranslator { base_delta }
    }

    pub fn base_delta(&self) -> i64 {
        self.base_delta
    }

    pub fn to_target(&self, addr: LocalAddr) -> TargetAddr {
        TargetAddr((addr.0 as i64).wrapping_add(self.base_delta) as u64)
    }

    pub fn to_local(&self, addr: TargetAddr) -> LocalAddr {
        LocalAddr((addr.0 as i64).wrapping_sub(self.base_delta) as usize)
    }
}

// ==================== Flat Snapshot Records ====================

/// One property-access speculation, flattened for the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpeculationRecord {
    pub site: AccessSiteId,
    pub property: PropertyId,
    pub slot_index: u16,
    pub is_store: bool,
    pub loads_from_proto: bool,
    pub is_fixed_value: bool,
    /// Shape identities treated as interchangeable at this site, strictly
    /// ascending. A single-element list is a monomorphic site.
    pub shapes: Vec<TargetAddr>,
    /// Address of the guard word the generated code must check
    pub guard_addr: TargetAddr,
}

/// One constructor-cache snapshot, flattened for the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructorSnapshotRecord {
    pub produced_shape: TargetAddr,
    pub inline_slot_count: u16,
    pub aux_slot_count: u16,
    pub skip_default_object: bool,
    pub is_used: bool,
    /// Accumulated guarded-property-operation bits
    pub guarded_ops: u8,
}

/// One call site's inlinee candidates as indices into the function table.
/// A candidate index equal to the owning function's own index marks direct
/// recursive inlining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSiteRecord {
    pub site: CallSiteId,
    pub candidates: Vec<u32>,
}

/// Flat form of one [`FunctionSnapshot`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSnapshotRecord {
    pub function: FunctionId,
    pub bytecode_addr: TargetAddr,
    pub bytecode_len: u32,
    pub register_count: u32,
    pub slot_count: u32,
    pub loop_regions: Vec<CodeRegion>,
    pub try_regions: Vec<CodeRegion>,
    pub counters: ProfileCounters,
    pub property_sites: Vec<PropertySpeculationRecord>,
    pub constructor_sites: Vec<ConstructorSnapshotRecord>,
    pub call_sites: Vec<CallSiteRecord>,
}

/// One unit of compilation work crossing the boundary.
///
/// `functions[0]` is the root; the rest appear in depth-first order, each
/// function's own sites before its inlinees, chain candidates front to
/// back. Guard addresses read in that same traversal order match the guard
/// list the compiled output reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationWorkItem {
    pub context: ContextId,
    pub functions: Vec<FunctionSnapshotRecord>,
}

impl CompilationWorkItem {
    /// Flatten a snapshot tree for transmission
    pub fn from_snapshot(
        context: ContextId,
        root: &FunctionSnapshot<'_>,
        translator: &AddressTranslator,
    ) -> Self {
        let mut functions = Vec::with_capacity(root.tree_size());
        flatten(root, translator, &mut functions);
        CompilationWorkItem { context, functions }
    }

    pub fn root(&self) -> &FunctionSnapshotRecord {
        &self.functions[0]
    }

    /// Guard addresses in traversal order (the compiled output's order)
    pub fn guard_addrs(&self) -> Vec<TargetAddr> {
        self.functions
            .iter()
            .flat_map(|f| f.property_sites.iter().map(|s| s.guard_addr))
            .collect()
    }
}

fn flatten(
    snapshot: &FunctionSnapshot<'_>,
    translator: &AddressTranslator,
    out: &mut Vec<FunctionSnapshotRecord>,
) -> u32 {
    let index = out.len() as u32;

    let property_sites = snapshot
        .property_sites
        .iter()
        .map(|spec| {
            let shapes = match &spec.observed {
                ObservedShapes::Single(shape) => {
                    vec![translator.to_target(LocalAddr(shape.0))]
                }
                ObservedShapes::Set(set) => set
                    .normalized()
                    .iter()
                    .map(|shape| translator.to_target(LocalAddr(shape.0)))
                    .collect(),
            };
            PropertySpeculationRecord {
                site: spec.site,
                property: spec.property,
                slot_index: spec.slot_index,
                is_store: spec.is_store,
                loads_from_proto: spec.loads_from_proto,
                is_fixed_value: spec.is_fixed_value,
                shapes,
                guard_addr: translator.to_target(LocalAddr(spec.guard.code_word_addr())),
            }
        })
        .collect();

    let constructor_sites = snapshot
        .constructor_sites
        .iter()
        .map(|ctor| ConstructorSnapshotRecord {
            produced_shape: translator.to_target(LocalAddr(ctor.produced_shape.0)),
            inline_slot_count: ctor.inline_slot_count,
            aux_slot_count: ctor.aux_slot_count,
            skip_default_object: ctor.skip_default_object,
            is_used: ctor.is_used,
            guarded_ops: ctor.guarded_ops().bits(),
        })
        .collect();

    out.push(FunctionSnapshotRecord {
        function: snapshot.function,
        bytecode_addr: translator.to_target(LocalAddr(snapshot.metadata.bytecode_addr)),
        bytecode_len: snapshot.metadata.bytecode_len,
        register_count: snapshot.metadata.register_count,
        slot_count: snapshot.metadata.slot_count,
        loop_regions: snapshot.metadata.loop_regions.clone(),
        try_regions: snapshot.metadata.try_regions.clone(),
        counters: snapshot.counters,
        property_sites,
        constructor_sites,
        call_sites: Vec::new(),
    });

    let mut call_sites = Vec::new();
    for chain in snapshot.call_sites() {
        let mut candidates = Vec::with_capacity(chain.len());
        for candidate in chain.iter() {
            if snapshot.is_recursive_candidate(candidate) {
                candidates.push(index);
            } else {
                candidates.push(flatten(candidate, translator, out));
            }
        }
        call_sites.push(CallSiteRecord { site: chain.site, candidates });
    }
    out[index as usize].call_sites = call_sites;
    index
}

// ==================== Generator Boundary ====================

/// A relocation the generator asks the committing side to apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Relocation {
    /// Write the 8-byte target address at `offset`
    Absolute64 { offset: u32, target: TargetAddr },
    /// Write the 8-byte address of a guard word at `offset`; `guard_index`
    /// selects from the work item's traversal-ordered guard list
    GuardWord { offset: u32, guard_index: u32 },
}

/// Relocatable output of one generator run: a byte buffer plus the
/// metadata needed to commit it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderOutput {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Offset of the entry point within `code`
    pub entry_offset: u32,
    /// Unwind metadata sizing registered at finalization
    pub pdata_count: u32,
    pub xdata_size: u32,
}

/// The record handed back to the runtime for one compiled work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledOutput {
    /// Base of the executable region, target address space
    pub code_addr: TargetAddr,
    pub code_len: u32,
    pub entry_offset: u32,
    /// CRC32 the committed bytes were verified against
    pub checksum: u32,
    /// Guard words referenced by the code, in traversal order. The caller
    /// must keep these registered for future invalidation lookups.
    pub guard_addrs: Vec<TargetAddr>,
}

/// Read-only view of the submitting script context, handed to the
/// generator alongside each work item: the address translator, the
/// well-known singleton table, and any host types registered so far.
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    pub translator: AddressTranslator,
    pub well_known: WellKnownAddrs,
    pub host_types: HashMap<u32, TargetAddr>,
}

/// The compiler middle-end. Consumes a work item, produces relocatable
/// bytes; register allocation and instruction selection live behind this
/// trait and are not this crate's concern.
pub trait NativeCodeGenerator: Send + Sync {
    fn generate(
        &self,
        item: &CompilationWorkItem,
        context: &ContextView,
    ) -> std::result::Result<EncoderOutput, CompileStatus>;
}

/// Minimal reference backend used by tests and embedder smoke runs.
///
/// Emits a guard-word table (one 8-byte slot per speculation, filled in by
/// relocation) followed by a return-only body. The layout exercises every
/// boundary contract — relocation application, checksum, unwind
/// registration — without pretending to be an instruction selector.
#[derive(Debug, Default)]
pub struct TemplateEncoder;

impl TemplateEncoder {
    const BODY: [u8; 2] = [0x90, 0xC3];

    /// Offset of the guard table within emitted code
    pub fn guard_table_offset() -> u32 {
        0
    }
}

impl NativeCodeGenerator for TemplateEncoder {
    fn generate(
        &self,
        item: &CompilationWorkItem,
        _context: &ContextView,
    ) -> std::result::Result<EncoderOutput, CompileStatus> {
        if item.functions.is_empty() {
            return Err(CompileStatus::MalformedWorkItem);
        }

        let guards = item.guard_addrs();
        let table_len = guards.len() * 8;
        let mut code = vec![0u8; table_len];
        code.extend_from_slice(&Self::BODY);

        let relocations = (0..guards.len())
            .map(|i| Relocation::GuardWord { offset: (i * 8) as u32, guard_index: i as u32 })
            .collect();

        Ok(EncoderOutput {
            code,
            relocations,
            entry_offset: table_len as u32,
            pdata_count: 1,
            xdata_size: 8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FunctionMetadata, ShapeId};
    use crate::snapshot::{InlineeChain, SnapshotArena};
    use crate::guards::GuardCell;
    use std::sync::Arc;

    fn snapshot_with_site<'a>(
        arena: &'a SnapshotArena<'a>,
        id: u32,
        shape: usize,
    ) -> &'a FunctionSnapshot<'a> {
        let mut snapshot = FunctionSnapshot::new(
            FunctionId(id),
            FunctionMetadata {
                bytecode_addr: 0x1000 * id as usize,
                bytecode_len: 32,
                register_count: 4,
                slot_count: 2,
                loop_regions: vec![],
                try_regions: vec![],
            },
            ProfileCounters::default(),
        );
        snapshot.property_sites.push(crate::snapshot::PropertyAccessSpeculation {
            site: AccessSiteId(0),
            property: PropertyId(id),
            slot_index: 1,
            is_store: false,
            loads_from_proto: false,
            is_fixed_value: false,
            observed: ObservedShapes::Single(ShapeId(shape)),
            guard: Arc::new(GuardCell::with_value(shape)),
        });
        arena.alloc(snapshot)
    }

    #[test]
    fn test_address_translation_roundtrip() {
        let translator = AddressTranslator::with_delta(0x1000_0000);
        let local = LocalAddr(0x4000);
        let target = translator.to_target(local);
        assert_eq!(target, TargetAddr(0x1000_4000));
        assert_eq!(translator.to_local(target), local);

        let identity = AddressTranslator::identity();
        assert_eq!(identity.to_target(LocalAddr(0x77)), TargetAddr(0x77));
    }

    #[test]
    fn test_flatten_indices_and_recursion_marker() {
        let arena = SnapshotArena::new();
        let child = snapshot_with_site(&arena, 2, 0x8000);
        let root = snapshot_with_site(&arena, 1, 0x7000);

        let chain = InlineeChain::new(CallSiteId(0));
        chain.push_front(child);
        chain.push_front(root); // recursive candidate, most recent
        root.set_call_sites(vec![chain]);

        let item = CompilationWorkItem::from_snapshot(
            ContextId(1),
            root,
            &AddressTranslator::identity(),
        );

        assert_eq!(item.functions.len(), 2);
        assert_eq!(item.root().function, FunctionId(1));
        let candidates = &item.root().call_sites[0].candidates;
        // Most-recent-first: the recursive self entry, then the child
        assert_eq!(candidates[0], 0);
        assert_eq!(candidates[1], 1);
        assert_eq!(item.functions[1].function, FunctionId(2));
    }

    #[test]
    fn test_flatten_translates_addresses() {
        let arena = SnapshotArena::new();
        let root = snapshot_with_site(&arena, 1, 0x7000);
        let translator = AddressTranslator::with_delta(0x10);

        let item = CompilationWorkItem::from_snapshot(ContextId(1), root, &translator);
        let record = &item.root().property_sites[0];
        assert_eq!(record.shapes, vec![TargetAddr(0x7010)]);
        assert_eq!(item.root().bytecode_addr, TargetAddr(0x1010));

        let guard_local = root.property_sites[0].guard.code_word_addr();
        assert_eq!(record.guard_addr, translator.to_target(LocalAddr(guard_local)));
    }

    #[test]
    fn test_guard_addr_order_matches_collect_order() {
        let arena = SnapshotArena::new();
        let child = snapshot_with_site(&arena, 2, 0x8000);
        let root = snapshot_with_site(&arena, 1, 0x7000);
        let chain = InlineeChain::new(CallSiteId(0));
        chain.push_front(child);
        root.set_call_sites(vec![chain]);

        let item = CompilationWorkItem::from_snapshot(
            ContextId(1),
            root,
            &AddressTranslator::identity(),
        );

        let mut collected = Vec::new();
        root.collect_guards(&mut collected);
        let expected: Vec<TargetAddr> = collected
            .iter()
            .map(|g| TargetAddr(g.code_word_addr() as u64))
            .collect();
        assert_eq!(item.guard_addrs(), expected);
    }

    #[test]
    fn test_template_encoder_layout() {
        let arena = SnapshotArena::new();
        let root = snapshot_with_site(&arena, 1, 0x7000);
        let item = CompilationWorkItem::from_snapshot(
            ContextId(1),
            root,
            &AddressTranslator::identity(),
        );

        let output = TemplateEncoder.generate(&item, &ContextView::default()).unwrap();
        assert_eq!(output.code.len(), 8 + TemplateEncoder::BODY.len());
        assert_eq!(output.entry_offset, 8);
        assert_eq!(output.relocations.len(), 1);
        match &output.relocations[0] {
            Relocation::GuardWord { offset: 0, guard_index: 0 } => {}
            other => panic!("unexpected relocation {:?}", other),
        }
    }

    #[test]
    fn test_template_encoder_rejects_empty_item() {
        let item = CompilationWorkItem { context: ContextId(1), functions: vec![] };
        assert_eq!(
            TemplateEncoder.generate(&item, &ContextView::default()).unwrap_err(),
            CompileStatus::MalformedWorkItem
        );
    }

    #[test]
    fn test_work_item_survives_wire_roundtrip() {
        let arena = SnapshotArena::new();
        let root = snapshot_with_site(&arena, 1, 0x7000);
        let item = CompilationWorkItem::from_snapshot(
            ContextId(3),
            root,
            &AddressTranslator::identity(),
        );

        let frame = crate::protocol::wire::encode_frame(&item).unwrap();
        let decoded: CompilationWorkItem = crate::protocol::wire::decode_frame(&frame).unwrap();
        assert_eq!(decoded.context, ContextId(3));
        assert_eq!(decoded.functions.len(), 1);
        assert_eq!(decoded.root().property_sites[0].shapes, vec![TargetAddr(0x7000)]);
    }
}
