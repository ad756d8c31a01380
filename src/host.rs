//! Host runtime interfaces
//!
//! The interpreter, its profiler, and the garbage-collected heap live
//! outside this crate. Everything the backend needs from them flows through
//! the traits here: bytecode and metadata by function identity, profile
//! entries by site id, and shape layout by shape identity. The reverse
//! direction — "a shape you speculated on just changed" — is delivered to
//! [`GuardRegistry`](crate::guards::GuardRegistry) by the heap's mutation
//! and sweep hooks.

use serde::{Deserialize, Serialize};

/// Identity of a function known to the host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

/// Identity of a property record (interned property name)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PropertyId(pub u32);

/// Identity of an object shape (hidden class).
///
/// The value is the shape's address in the runtime heap, which gives the
/// uniquely ordered identity that equivalence comparisons sort by. Two
/// shapes compare equal only if they are the same heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShapeId(pub usize);

/// A property-access site within one function's bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AccessSiteId(pub u32);

/// A call site within one function's bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CallSiteId(pub u32);

/// Bytecode and structural metadata for one function, as the interpreter
/// stores it. Addresses are valid in the runtime's own address space.
#[derive(Debug, Clone)]
pub struct FunctionMetadata {
    /// Address of the bytecode buffer in the runtime heap
    pub bytecode_addr: usize,
    /// Length of the bytecode buffer in bytes
    pub bytecode_len: u32,
    /// Number of virtual registers the function uses
    pub register_count: u32,
    /// Number of local variable slots
    pub slot_count: u32,
    /// Byte ranges of loop bodies (for loop-entry compilation decisions)
    pub loop_regions: Vec<CodeRegion>,
    /// Byte ranges covered by try handlers
    pub try_regions: Vec<CodeRegion>,
}

/// A half-open byte range within a function's bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRegion {
    pub start: u32,
    pub end: u32,
}

/// Execution counters the interpreter accumulated for one function
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProfileCounters {
    /// Total invocations observed
    pub invocation_count: u64,
    /// Total loop back-edges observed
    pub loop_count: u64,
    /// Deoptimizations charged to this function so far
    pub bailout_count: u32,
}

/// What the profiler observed at one property-access site
#[derive(Debug, Clone)]
pub struct AccessSiteProfile {
    /// The property being accessed
    pub property: PropertyId,
    /// Slot index within the object's property storage
    pub slot_index: u16,
    /// Whether the site stores to the property (false = load)
    pub is_store: bool,
    /// Whether the access walks the prototype chain
    pub loads_from_proto: bool,
    /// Whether the loaded value was constant across all observations
    pub is_fixed_value: bool,
    /// Every shape observed at this site, most recent last. May contain
    /// duplicates; order is observation order.
    pub observed_shapes: Vec<ShapeId>,
}

/// What the profiler observed at one call site
#[derive(Debug, Clone)]
pub struct CallSiteProfile {
    /// Callees observed at this site, most recent first
    pub callees: Vec<FunctionId>,
    /// Invocations attributed to this site
    pub call_count: u64,
}

/// What the runtime's constructor cache holds for one `new` target
#[derive(Debug, Clone, Copy)]
pub struct ConstructorProfile {
    /// Shape the constructor produced at profiling time
    pub produced_shape: ShapeId,
    /// Inline property slots in the produced object
    pub inline_slot_count: u16,
    /// Out-of-line (aux) property slots
    pub aux_slot_count: u16,
    /// Whether the default object allocation can be skipped entirely
    pub skip_default_object: bool,
}

/// Slot layout details for a shape, used when baking slot offsets
#[derive(Debug, Clone, Copy)]
pub struct SlotLayout {
    /// Total property slots
    pub slot_count: u16,
    /// Slots stored inline in the object body
    pub inline_slot_count: u16,
}

/// Function-identity-keyed bytecode/metadata accessor
pub trait BytecodeProvider {
    /// Metadata for a function, or `None` if the id is stale
    fn function_metadata(&self, function: FunctionId) -> Option<FunctionMetadata>;
}

/// Profiling-data accessor keyed by call-site and access-site ids
pub trait ProfileProvider {
    fn counters(&self, function: FunctionId) -> ProfileCounters;
    fn access_site(&self, function: FunctionId, site: AccessSiteId) -> Option<AccessSiteProfile>;
    fn call_site(&self, function: FunctionId, site: CallSiteId) -> Option<CallSiteProfile>;
    fn constructor_cache(&self, function: FunctionId, site: CallSiteId)
        -> Option<ConstructorProfile>;
    /// Access-site ids present in a function, in bytecode order
    fn access_sites(&self, function: FunctionId) -> Vec<AccessSiteId>;
    /// Call-site ids present in a function, in bytecode order
    fn call_sites(&self, function: FunctionId) -> Vec<CallSiteId>;
}

/// Shape/type accessor giving slot layout for equivalence decisions
pub trait ShapeProvider {
    fn slot_layout(&self, shape: ShapeId) -> Option<SlotLayout>;
}
