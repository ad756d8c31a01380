//! Shared test fixtures: a mock host runtime with canned profiling data
#![allow(dead_code)] // not every test binary uses every fixture

use quickjit::host::{
    AccessSiteId, AccessSiteProfile, BytecodeProvider, CallSiteId, CallSiteProfile, CodeRegion,
    ConstructorProfile, FunctionId, FunctionMetadata, ProfileCounters, ProfileProvider,
    PropertyId, ShapeId, ShapeProvider, SlotLayout,
};
use quickjit::guards::{guard_word_passes, read_guard_word};
use quickjit::protocol::CompiledOutput;
use std::collections::HashMap;

/// An interpreter/heap stand-in: functions, profiles, and shape layouts
/// the snapshot builder reads
#[derive(Default)]
pub struct MockRuntime {
    functions: HashMap<u32, FunctionMetadata>,
    access: HashMap<(u32, u32), AccessSiteProfile>,
    calls: HashMap<(u32, u32), CallSiteProfile>,
    constructors: HashMap<(u32, u32), ConstructorProfile>,
    layouts: HashMap<usize, SlotLayout>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, id: u32) -> FunctionId {
        self.functions.insert(
            id,
            FunctionMetadata {
                bytecode_addr: 0x10_0000 + 0x1000 * id as usize,
                bytecode_len: 256,
                register_count: 16,
                slot_count: 8,
                loop_regions: vec![CodeRegion { start: 32, end: 128 }],
                try_regions: vec![],
            },
        );
        FunctionId(id)
    }

    /// A property-load site observing the given shapes (in order)
    pub fn add_load_site(&mut self, function: FunctionId, site: u32, slot: u16, shapes: &[usize]) {
        self.access.insert(
            (function.0, site),
            AccessSiteProfile {
                property: PropertyId(site + 100),
                slot_index: slot,
                is_store: false,
                loads_from_proto: false,
                is_fixed_value: false,
                observed_shapes: shapes.iter().map(|&s| ShapeId(s)).collect(),
            },
        );
        for &shape in shapes {
            self.layouts.insert(shape, SlotLayout { slot_count: 8, inline_slot_count: 8 });
        }
    }

    pub fn add_call_site(&mut self, function: FunctionId, site: u32, callees: &[u32], count: u64) {
        self.calls.insert(
            (function.0, site),
            CallSiteProfile {
                callees: callees.iter().map(|&c| FunctionId(c)).collect(),
                call_count: count,
            },
        );
    }

    pub fn add_constructor(&mut self, function: FunctionId, site: u32, shape: usize) {
        self.constructors.insert(
            (function.0, site),
            ConstructorProfile {
                produced_shape: ShapeId(shape),
                inline_slot_count: 4,
                aux_slot_count: 0,
                skip_default_object: false,
            },
        );
    }
}

impl BytecodeProvider for MockRuntime {
    fn function_metadata(&self, function: FunctionId) -> Option<FunctionMetadata> {
        self.functions.get(&function.0).cloned()
    }
}

impl ProfileProvider for MockRuntime {
    fn counters(&self, _function: FunctionId) -> ProfileCounters {
        ProfileCounters { invocation_count: 5000, loop_count: 200, bailout_count: 0 }
    }

    fn access_site(&self, function: FunctionId, site: AccessSiteId) -> Option<AccessSiteProfile> {
        self.access.get(&(function.0, site.0)).cloned()
    }

    fn call_site(&self, function: FunctionId, site: CallSiteId) -> Option<CallSiteProfile> {
        self.calls.get(&(function.0, site.0)).cloned()
    }

    fn constructor_cache(
        &self,
        function: FunctionId,
        site: CallSiteId,
    ) -> Option<ConstructorProfile> {
        self.constructors.get(&(function.0, site.0)).copied()
    }

    fn access_sites(&self, function: FunctionId) -> Vec<AccessSiteId> {
        let mut sites: Vec<u32> = self
            .access
            .keys()
            .filter(|(f, _)| *f == function.0)
            .map(|(_, s)| *s)
            .collect();
        sites.sort_unstable();
        sites.into_iter().map(AccessSiteId).collect()
    }

    fn call_sites(&self, function: FunctionId) -> Vec<CallSiteId> {
        let mut sites: Vec<u32> = self
            .calls
            .keys()
            .chain(self.constructors.keys())
            .filter(|(f, _)| *f == function.0)
            .map(|(_, s)| *s)
            .collect();
        sites.sort_unstable();
        sites.dedup();
        sites.into_iter().map(CallSiteId).collect()
    }
}

impl ShapeProvider for MockRuntime {
    fn slot_layout(&self, shape: ShapeId) -> Option<SlotLayout> {
        self.layouts.get(&shape.0).copied()
    }
}

/// Outcome of "running" a compiled artifact's guard checks, the way the
/// generated prologue would before trusting any baked slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every guard passed; the fast path is safe
    Completed,
    /// A guard was invalidated; control returns to the interpreter
    BailedOut { failed_guard: usize },
}

/// Perform the guard checks exactly as generated code does: one raw word
/// read per guard, compare against the sentinels, branch.
pub fn run_compiled(output: &CompiledOutput) -> RunOutcome {
    for (index, guard) in output.guard_addrs.iter().enumerate() {
        let word = unsafe { read_guard_word(guard.0 as usize) };
        if !guard_word_passes(word) {
            return RunOutcome::BailedOut { failed_guard: index };
        }
    }
    RunOutcome::Completed
}

/// Install a test subscriber so RUST_LOG=quickjit=trace shows backend
/// activity during a failing test
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}
