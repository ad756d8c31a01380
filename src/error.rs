//! Error types for the Quickjit compilation backend

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status reported by the code generator for a work item that could not be
/// compiled. These are ordinary, recoverable outcomes: the caller keeps the
/// function on the interpreter path and may retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileStatus {
    /// The generator ran out of executable memory for this work item
    OutOfExecutableMemory,
    /// The work item failed structural validation on the generator side
    MalformedWorkItem,
    /// The generator backend declined the function (unsupported construct)
    Unsupported,
    /// The generator endpoint is shutting down
    GeneratorUnavailable,
}

impl fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileStatus::OutOfExecutableMemory => write!(f, "OutOfExecutableMemory"),
            CompileStatus::MalformedWorkItem => write!(f, "MalformedWorkItem"),
            CompileStatus::Unsupported => write!(f, "Unsupported"),
            CompileStatus::GeneratorUnavailable => write!(f, "GeneratorUnavailable"),
        }
    }
}

/// Reasons a wire frame failed to decode.
///
/// Magic and checksum failures on a live connection are classified as fatal
/// by the session (see [`FatalCode`]); the variants exist so the framing
/// layer itself stays abort-free and testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireErrorKind {
    /// Frame does not start with the protocol magic bytes
    BadMagic,
    /// Frame version does not match this binary's protocol version
    VersionMismatch { local: u32, remote: u32 },
    /// CRC32 trailer does not match the payload
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Frame too short to contain a header
    Truncated,
    /// Payload deserialization failed
    Payload(String),
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireErrorKind::BadMagic => write!(f, "bad magic"),
            WireErrorKind::VersionMismatch { local, remote } => {
                write!(f, "version mismatch (local {}, remote {})", local, remote)
            }
            WireErrorKind::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {:#010x}, got {:#010x})", expected, actual)
            }
            WireErrorKind::Truncated => write!(f, "truncated frame"),
            WireErrorKind::Payload(msg) => write!(f, "payload decode failed: {}", msg),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Snapshot construction exceeded its per-attempt record budget.
    /// Aborts the compilation attempt only; the function stays interpreted.
    #[error("SnapshotError: record budget exceeded ({used} of {budget} records)")]
    SnapshotBudgetExceeded { used: usize, budget: usize },

    /// The generator reported a non-fatal failure for a work item
    #[error("CompilationError: {status}")]
    CompilationFailed { status: CompileStatus },

    /// A script or thread context could not be torn down because
    /// compilations are still in flight against it
    #[error("ContextError: context {context} has {active} active compilation(s)")]
    ContextBusy { context: u32, active: u32 },

    /// The protocol peer disappeared mid-call
    #[error("ProtocolError: connection closed")]
    ConnectionClosed,

    /// The operation referenced a context the generator does not know
    #[error("ProtocolError: unknown context {0}")]
    UnknownContext(u32),

    /// The peer reported an operation failure
    #[error("ProtocolError: {0}")]
    Protocol(String),

    /// A protocol operation was issued against a session that has shut down
    #[error("ProtocolError: session is shut down")]
    SessionClosed,

    /// A wire frame failed to decode
    #[error("WireError: {0}")]
    Wire(WireErrorKind),

    /// `set_value` was called on a guard cell that has already been
    /// invalidated. This is a contract violation on the runtime side.
    #[error("GuardError: cell written after invalidation")]
    GuardCellReuse,

    /// `set_value` was passed one of the reserved sentinel words
    #[error("GuardError: value {0:#x} is a reserved sentinel")]
    GuardSentinelValue(usize),

    /// A commit would exceed the bytes funded for the allocation
    #[error("CodeBufferError: commit of {requested} bytes exceeds funded space ({available} available)")]
    CommitOverflow { requested: usize, available: usize },

    /// The address passed to `free_allocation` is not a live allocation
    #[error("CodeBufferError: {0:#x} is not a live allocation base")]
    UnknownAllocation(usize),
}

/// Stable diagnostic bucket codes for conditions that terminate the process.
///
/// These never travel through [`Error`]: continuing after any of them would
/// run on a violated invariant (executable-memory accounting, cross-process
/// layout agreement, or byte-level code integrity). An end user only ever
/// observes them as a crash with the bucket code in the final log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCode {
    /// Failed to reserve or commit executable memory
    OutOfCodeMemory,
    /// Protocol magic/version/pointer-width handshake mismatch
    ProtocolMismatch,
    /// Emitted code bytes failed the post-copy checksum
    CodeIntegrity,
}

impl FatalCode {
    /// The stable, bucketable code emitted in the crash diagnostic
    pub fn as_str(self) -> &'static str {
        match self {
            FatalCode::OutOfCodeMemory => "OOM-CODEMEM",
            FatalCode::ProtocolMismatch => "VER-PROTO",
            FatalCode::CodeIntegrity => "CHK-CODEMEM",
        }
    }
}

impl fmt::Display for FatalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminate the process with a bucketable diagnostic.
///
/// Best-effort diagnostic capture happens first (one structured log line);
/// then the process aborts. Callers rely on this never returning: an
/// allocation funded by the buffer manager cannot come back null, and a
/// version-skewed peer cannot be talked to.
pub fn fatal(code: FatalCode, message: &str) -> ! {
    tracing::error!(code = code.as_str(), "fatal: {}", message);
    std::process::abort();
}

pub type Result<T> = std::result::Result<T, Error>;
