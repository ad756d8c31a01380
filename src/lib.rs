//! Quickjit: an out-of-process capable JIT backend for embedded JavaScript runtimes
//!
//! Quickjit is the optimizing-compilation pipeline that sits between an
//! interpreter and a native code generator. It snapshots live profiling
//! state into self-contained, address-translated records, ships them
//! across a call boundary (optionally a separate process) to the
//! generator, commits the emitted bytes into managed executable memory
//! with a strict write-then-execute handoff, and wires single-word guard
//! cells into the result so running optimized code can be invalidated the
//! moment the heap breaks an assumption it was compiled under.
//!
//! # Quick Start
//!
//! ```no_run
//! use quickjit::protocol::{
//!     AddressTranslator, CompilationWorkItem, ContextId, GeneratorEndpoint,
//!     InProcessTransport, JitSession, TemplateEncoder, WellKnownAddrs,
//! };
//! use std::sync::Arc;
//!
//! let endpoint = Arc::new(GeneratorEndpoint::new(Box::new(TemplateEncoder)));
//! let session = JitSession::connect(InProcessTransport::new(endpoint));
//!
//! let thread = ContextId(1);
//! let context = ContextId(10);
//! session.initialize_thread_context(thread)?;
//! session.initialize_script_context(
//!     thread,
//!     context,
//!     AddressTranslator::identity(),
//!     WellKnownAddrs::default(),
//! )?;
//! # Ok::<(), quickjit::Error>(())
//! ```
//!
//! # Module Overview
//!
//! The compilation pipeline flows: profile data → [`snapshot`] →
//! [`protocol`] → generator → [`codemem`] → running code checking
//! [`guards`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Speculation** | [`guards`] (guard cells, equivalence sets), [`snapshot`] (per-attempt records) |
//! | **Boundary** | [`protocol`] (sessions, work items, wire frames, transports) |
//! | **Code memory** | [`codemem`] (reserve/commit/finalize/free, pre-reserved ranges) |
//! | **Host seams** | [`host`] (interpreter/heap accessor traits), [`error`](Error) |

// Clippy configuration for the Quickjit backend.
//
// These suppressions exist because:
// - too_many_arguments: protocol operations mirror a fixed wire surface
// - new_without_default: endpoints and registries have required setup
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod checksum;
pub mod codemem;
pub mod error;
pub mod guards;
pub mod host;
pub mod protocol;
pub mod snapshot;

pub use error::{CompileStatus, Error, FatalCode, Result};
pub use guards::{EquivalenceCache, EquivalenceSet, GuardCell, GuardRegistry, GuardState};
pub use protocol::{
    AddressTranslator, CompilationWorkItem, CompiledOutput, ContextId, GeneratorEndpoint,
    InProcessTransport, JitSession, RemoteTransport, TargetAddr, Transport, WellKnownAddrs,
};
pub use snapshot::{SnapshotArena, SnapshotBuilder, SnapshotConfig};
