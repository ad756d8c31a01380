//! Code Generation Invocation Protocol
//!
//! The fixed call surface between the runtime side (which owns the live
//! heap and the guard cells) and the generator side (which owns the
//! executable memory and the compiler middle-end). The same operation set
//! works as plain in-process calls ([`InProcessTransport`]) or framed over
//! a byte channel with address translation ([`RemoteTransport`]) when the
//! generator runs out of process.
//!
//! There is no global connection state: a [`JitSession`] is an explicitly
//! constructed, passed-by-ownership object per logical connection.
//!
//! Two failure classes are deliberately unforgiving: a connection that
//! cannot complete the version/layout handshake, and a frame whose magic
//! or version does not match, both terminate the process. A version skew
//! between the two sides implies undefined binary layout assumptions, and
//! limping on would bake garbage into executable memory. Ordinary
//! work-item failure is just a status code; the caller keeps interpreting.

pub mod wire;
pub mod workitem;

pub use workitem::{
    AddressTranslator, CompilationWorkItem, CompiledOutput, ContextId, ContextView, EncoderOutput,
    LocalAddr, NativeCodeGenerator, Relocation, TargetAddr, TemplateEncoder,
};

use crate::codemem::{EmitBufferManager, EmitConfig};
use crate::error::{fatal, CompileStatus, Error, FatalCode, Result, WireErrorKind};
use crate::host::PropertyId;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

// ==================== Handshake ====================

/// Version/layout agreement checked at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub wire_version: u32,
    pub pointer_width: u8,
}

impl HandshakeInfo {
    /// The identity this binary presents
    pub fn current() -> Self {
        HandshakeInfo {
            wire_version: wire::WIRE_VERSION,
            pointer_width: (std::mem::size_of::<usize>() * 8) as u8,
        }
    }
}

/// Compare the peer's handshake against ours. Any difference means the two
/// binaries disagree about record layout and must not exchange work items.
fn verify_handshake(remote: &HandshakeInfo) -> Result<()> {
    let local = HandshakeInfo::current();
    if remote.wire_version != local.wire_version {
        return Err(Error::Wire(WireErrorKind::VersionMismatch {
            local: local.wire_version,
            remote: remote.wire_version,
        }));
    }
    if remote.pointer_width != local.pointer_width {
        return Err(Error::Wire(WireErrorKind::Payload(format!(
            "pointer width mismatch (local {}, remote {})",
            local.pointer_width, remote.pointer_width
        ))));
    }
    Ok(())
}

// ==================== Context Tables ====================

/// Well-known runtime singleton addresses generated code references
/// directly. All target address space.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WellKnownAddrs {
    pub null_value: TargetAddr,
    pub undefined_value: TargetAddr,
    pub true_value: TargetAddr,
    pub false_value: TargetAddr,
    pub library_object: TargetAddr,
    pub vtable_table: TargetAddr,
    pub recycler: TargetAddr,
}

/// Generator-side record for one thread context
struct ThreadContextInfo {
    script_contexts: Vec<ContextId>,
}

/// Generator-side record for one script context.
///
/// Immutable after initialization except for the property record map and
/// the active-compilation count used for safe teardown ordering.
struct ScriptContextInfo {
    thread: ContextId,
    translator: AddressTranslator,
    well_known: WellKnownAddrs,
    host_types: HashMap<u32, TargetAddr>,
    property_names: string_interner::DefaultStringInterner,
    properties: HashMap<PropertyId, string_interner::DefaultSymbol>,
    active_compilations: u32,
    closed: bool,
}

impl ScriptContextInfo {
    fn new(thread: ContextId, translator: AddressTranslator, well_known: WellKnownAddrs) -> Self {
        ScriptContextInfo {
            thread,
            translator,
            well_known,
            host_types: HashMap::default(),
            property_names: string_interner::DefaultStringInterner::new(),
            properties: HashMap::default(),
            active_compilations: 0,
            closed: false,
        }
    }
}

// ==================== Wire Messages ====================

/// One protocol operation, as it crosses the boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolRequest {
    Connect(HandshakeInfo),
    InitializeThreadContext { thread: ContextId },
    CleanupThreadContext { thread: ContextId },
    InitializeScriptContext {
        thread: ContextId,
        context: ContextId,
        base_delta: i64,
        well_known: WellKnownAddrs,
    },
    CloseScriptContext { context: ContextId },
    CleanupScriptContext { context: ContextId },
    UpdatePropertyRecordMap { context: ContextId, records: Vec<(PropertyId, String)> },
    SetWellKnownHostType { context: ContextId, type_id: u32, type_addr: TargetAddr },
    SubmitWorkItem(CompilationWorkItem),
    FreeAllocation { addr: TargetAddr },
    IsNativeAddress { addr: TargetAddr },
    Shutdown,
    CleanupProcess,
}

/// Reply to one protocol operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolResponse {
    Ack,
    Connected(HandshakeInfo),
    Compiled(CompiledOutput),
    Refused(CompileStatus),
    AddressAnswer(bool),
    Busy { context: u32, active: u32 },
    UnknownContext(u32),
    Failed(String),
}

// ==================== Generator Endpoint ====================

struct EndpointState {
    threads: HashMap<ContextId, ThreadContextInfo>,
    contexts: HashMap<ContextId, ScriptContextInfo>,
    shut_down: bool,
}

/// The generator side of the protocol: context tables, the executable
/// memory manager, and the compiler backend
pub struct GeneratorEndpoint {
    state: Mutex<EndpointState>,
    buffers: EmitBufferManager,
    generator: Box<dyn NativeCodeGenerator>,
}

impl GeneratorEndpoint {
    pub fn new(generator: Box<dyn NativeCodeGenerator>) -> Self {
        Self::with_config(generator, EmitConfig::default())
    }

    pub fn with_config(generator: Box<dyn NativeCodeGenerator>, config: EmitConfig) -> Self {
        GeneratorEndpoint {
            state: Mutex::new(EndpointState {
                threads: HashMap::default(),
                contexts: HashMap::default(),
                shut_down: false,
            }),
            buffers: EmitBufferManager::with_backend(
                crate::codemem::platform::SystemAllocator,
                config,
            ),
            generator,
        }
    }

    /// Execute one protocol operation. Both transports funnel through
    /// here, so in-process and cross-process behavior cannot drift.
    pub fn dispatch(&self, request: ProtocolRequest) -> ProtocolResponse {
        match request {
            ProtocolRequest::Connect(info) => match verify_handshake(&info) {
                Ok(()) => ProtocolResponse::Connected(HandshakeInfo::current()),
                Err(err) => ProtocolResponse::Failed(err.to_string()),
            },
            ProtocolRequest::InitializeThreadContext { thread } => {
                let mut state = self.state.lock().unwrap();
                if state.shut_down {
                    return ProtocolResponse::Failed("generator has shut down".into());
                }
                state
                    .threads
                    .entry(thread)
                    .or_insert_with(|| ThreadContextInfo { script_contexts: Vec::new() });
                ProtocolResponse::Ack
            }
            ProtocolRequest::CleanupThreadContext { thread } => {
                let mut state = self.state.lock().unwrap();
                match state.threads.get(&thread) {
                    None => ProtocolResponse::UnknownContext(thread.0),
                    Some(info) if !info.script_contexts.is_empty() => ProtocolResponse::Failed(
                        format!(
                            "thread context {} still owns {} script context(s)",
                            thread.0,
                            info.script_contexts.len()
                        ),
                    ),
                    Some(_) => {
                        state.threads.remove(&thread);
                        ProtocolResponse::Ack
                    }
                }
            }
            ProtocolRequest::InitializeScriptContext { thread, context, base_delta, well_known } => {
                let mut state = self.state.lock().unwrap();
                if state.shut_down {
                    return ProtocolResponse::Failed("generator has shut down".into());
                }
                let Some(thread_info) = state.threads.get_mut(&thread) else {
                    return ProtocolResponse::UnknownContext(thread.0);
                };
                thread_info.script_contexts.push(context);
                state.contexts.insert(
                    context,
                    ScriptContextInfo::new(
                        thread,
                        AddressTranslator::with_delta(base_delta),
                        well_known,
                    ),
                );
                tracing::debug!(context = context.0, base_delta, "script context registered");
                ProtocolResponse::Ack
            }
            ProtocolRequest::CloseScriptContext { context } => {
                let mut state = self.state.lock().unwrap();
                match state.contexts.get_mut(&context) {
                    None => ProtocolResponse::UnknownContext(context.0),
                    Some(info) => {
                        info.closed = true;
                        ProtocolResponse::Ack
                    }
                }
            }
            ProtocolRequest::CleanupScriptContext { context } => {
                let mut state = self.state.lock().unwrap();
                match state.contexts.get(&context) {
                    None => ProtocolResponse::UnknownContext(context.0),
                    Some(info) if info.active_compilations > 0 => ProtocolResponse::Busy {
                        context: context.0,
                        active: info.active_compilations,
                    },
                    Some(info) => {
                        let thread = info.thread;
                        state.contexts.remove(&context);
                        if let Some(thread_info) = state.threads.get_mut(&thread) {
                            thread_info.script_contexts.retain(|c| *c != context);
                        }
                        ProtocolResponse::Ack
                    }
                }
            }
            ProtocolRequest::UpdatePropertyRecordMap { context, records } => {
                let mut state = self.state.lock().unwrap();
                match state.contexts.get_mut(&context) {
                    None => ProtocolResponse::UnknownContext(context.0),
                    Some(info) => {
                        for (id, name) in records {
                            let symbol = info.property_names.get_or_intern(&name);
                            info.properties.insert(id, symbol);
                        }
                        ProtocolResponse::Ack
                    }
                }
            }
            ProtocolRequest::SetWellKnownHostType { context, type_id, type_addr } => {
                let mut state = self.state.lock().unwrap();
                match state.contexts.get_mut(&context) {
                    None => ProtocolResponse::UnknownContext(context.0),
                    Some(info) => {
                        info.host_types.insert(type_id, type_addr);
                        ProtocolResponse::Ack
                    }
                }
            }
            ProtocolRequest::SubmitWorkItem(item) => self.submit(item),
            ProtocolRequest::FreeAllocation { addr } => {
                match self.buffers.free_allocation(addr.0 as usize) {
                    Ok(()) => ProtocolResponse::Ack,
                    Err(err) => ProtocolResponse::Failed(err.to_string()),
                }
            }
            ProtocolRequest::IsNativeAddress { addr } => {
                ProtocolResponse::AddressAnswer(self.buffers.is_native_address(addr.0 as usize))
            }
            ProtocolRequest::Shutdown => {
                self.state.lock().unwrap().shut_down = true;
                ProtocolResponse::Ack
            }
            ProtocolRequest::CleanupProcess => {
                let mut state = self.state.lock().unwrap();
                state.contexts.clear();
                state.threads.clear();
                ProtocolResponse::Ack
            }
        }
    }

    /// Property name registered for `id`, if any (diagnostics)
    pub fn property_name(&self, context: ContextId, id: PropertyId) -> Option<String> {
        let state = self.state.lock().unwrap();
        let info = state.contexts.get(&context)?;
        let symbol = info.properties.get(&id)?;
        info.property_names.resolve(*symbol).map(str::to_owned)
    }

    /// The executable-memory manager backing this endpoint
    pub fn buffers(&self) -> &EmitBufferManager {
        &self.buffers
    }

    fn submit(&self, item: CompilationWorkItem) -> ProtocolResponse {
        // Begin-compilation: hold the context's refcount for the whole
        // flight so teardown cannot race the generator.
        let view = {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return ProtocolResponse::Refused(CompileStatus::GeneratorUnavailable);
            }
            match state.contexts.get_mut(&item.context) {
                None => return ProtocolResponse::UnknownContext(item.context.0),
                Some(info) if info.closed => {
                    return ProtocolResponse::Refused(CompileStatus::GeneratorUnavailable)
                }
                Some(info) => {
                    info.active_compilations += 1;
                    ContextView {
                        translator: info.translator,
                        well_known: info.well_known,
                        host_types: info.host_types.clone(),
                    }
                }
            }
        };

        let response = self.generate_and_commit(&item, &view);

        // End-compilation: the output is built and owns no borrow of the
        // context; the refcount can drop.
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.contexts.get_mut(&item.context) {
            info.active_compilations -= 1;
        }
        response
    }

    fn generate_and_commit(&self, item: &CompilationWorkItem, view: &ContextView) -> ProtocolResponse {
        let output = match self.generator.generate(item, view) {
            Ok(output) => output,
            Err(status) => {
                tracing::debug!(context = item.context.0, %status, "work item refused");
                return ProtocolResponse::Refused(status);
            }
        };

        let guards = item.guard_addrs();
        let mut code = output.code;
        if let Err(status) = apply_relocations(&mut code, &output.relocations, &guards) {
            return ProtocolResponse::Refused(status);
        }

        // Checksum over the intermediate layout; finalize recomputes over
        // the committed bytes and treats a mismatch as corruption.
        let layout_checksum = crate::checksum::crc32(&code);

        let handle =
            self.buffers
                .allocate_buffer(code.len(), output.pdata_count, output.xdata_size, true);
        let handle = match self.buffers.commit_buffer(handle, &code) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(%err, "commit failed for generated code");
                return ProtocolResponse::Refused(CompileStatus::OutOfExecutableMemory);
            }
        };
        let finalized = self.buffers.finalize(handle, Some(layout_checksum));

        ProtocolResponse::Compiled(CompiledOutput {
            code_addr: TargetAddr(finalized.base() as u64),
            code_len: finalized.len() as u32,
            entry_offset: output.entry_offset,
            checksum: finalized.checksum(),
            guard_addrs: guards,
        })
    }
}

/// Apply the generator's relocation table to the emitted bytes
fn apply_relocations(
    code: &mut [u8],
    relocations: &[Relocation],
    guards: &[TargetAddr],
) -> std::result::Result<(), CompileStatus> {
    for relocation in relocations {
        let (offset, value) = match relocation {
            Relocation::Absolute64 { offset, target } => (*offset as usize, target.0),
            Relocation::GuardWord { offset, guard_index } => {
                let Some(guard) = guards.get(*guard_index as usize) else {
                    return Err(CompileStatus::MalformedWorkItem);
                };
                (*offset as usize, guard.0)
            }
        };
        let Some(slot) = code.get_mut(offset..offset + 8) else {
            return Err(CompileStatus::MalformedWorkItem);
        };
        slot.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

// ==================== Transports ====================

/// Moves one request to the generator side and returns its response
pub trait Transport {
    fn call(&self, request: ProtocolRequest) -> Result<ProtocolResponse>;
}

/// Plain calls into an endpoint living in this process
pub struct InProcessTransport {
    endpoint: Arc<GeneratorEndpoint>,
}

impl InProcessTransport {
    pub fn new(endpoint: Arc<GeneratorEndpoint>) -> Self {
        InProcessTransport { endpoint }
    }
}

impl Transport for InProcessTransport {
    fn call(&self, request: ProtocolRequest) -> Result<ProtocolResponse> {
        Ok(self.endpoint.dispatch(request))
    }
}

/// Framed transport over a byte channel to an endpoint worker.
///
/// Each call encodes one request frame, sends it, and blocks on the
/// response frame. The receiver sits behind a mutex so a session can be
/// shared the same way the in-process variant can.
pub struct RemoteTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Transport for RemoteTransport {
    fn call(&self, request: ProtocolRequest) -> Result<ProtocolResponse> {
        let frame = wire::encode_frame(&request)?;
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)?;
        let rx = self.rx.lock().unwrap();
        let reply = rx.recv().map_err(|_| Error::ConnectionClosed)?;
        wire::decode_frame(&reply)
    }
}

/// Spawn a worker thread serving `endpoint` over framed channels and
/// return the client transport. The worker exits after serving `Shutdown`
/// or when the client side hangs up.
pub fn spawn_remote_endpoint(
    endpoint: Arc<GeneratorEndpoint>,
) -> (RemoteTransport, thread::JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
    let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();

    let worker = thread::spawn(move || {
        while let Ok(frame) = request_rx.recv() {
            let (response, stop) = match wire::decode_frame::<ProtocolRequest>(&frame) {
                Ok(request) => {
                    let stop = matches!(request, ProtocolRequest::Shutdown);
                    (endpoint.dispatch(request), stop)
                }
                Err(err) => (ProtocolResponse::Failed(err.to_string()), false),
            };
            let Ok(encoded) = wire::encode_frame(&response) else {
                break;
            };
            if response_tx.send(encoded).is_err() {
                break;
            }
            if stop {
                break;
            }
        }
    });

    (RemoteTransport { tx: request_tx, rx: Mutex::new(response_rx) }, worker)
}

// ==================== Session ====================

/// One logical connection from the runtime side to a generator.
///
/// Explicitly constructed and passed by ownership; there is no process-wide
/// connection singleton.
pub struct JitSession<T: Transport> {
    transport: T,
    closed: bool,
}

impl<T: Transport> JitSession<T> {
    /// Connect and verify the version/layout handshake.
    ///
    /// A peer this binary cannot agree with is a fatal condition: the
    /// process terminates rather than exchange records whose layout the
    /// two sides disagree about.
    pub fn connect(transport: T) -> JitSession<T> {
        let session = JitSession { transport, closed: false };
        if let Err(err) = session.handshake() {
            fatal(FatalCode::ProtocolMismatch, &err.to_string());
        }
        session
    }

    fn handshake(&self) -> Result<()> {
        match self.transport.call(ProtocolRequest::Connect(HandshakeInfo::current()))? {
            ProtocolResponse::Connected(info) => verify_handshake(&info),
            ProtocolResponse::Failed(message) => {
                Err(Error::Wire(WireErrorKind::Payload(message)))
            }
            other => Err(unexpected_response("Connect", &other)),
        }
    }

    fn call(&self, request: ProtocolRequest) -> Result<ProtocolResponse> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.transport.call(request)
    }

    fn expect_ack(&self, op: &'static str, request: ProtocolRequest) -> Result<()> {
        match self.call(request)? {
            ProtocolResponse::Ack => Ok(()),
            other => Err(map_failure(op, other)),
        }
    }

    pub fn initialize_thread_context(&self, thread: ContextId) -> Result<()> {
        self.expect_ack(
            "InitializeThreadContext",
            ProtocolRequest::InitializeThreadContext { thread },
        )
    }

    pub fn cleanup_thread_context(&self, thread: ContextId) -> Result<()> {
        self.expect_ack(
            "CleanupThreadContext",
            ProtocolRequest::CleanupThreadContext { thread },
        )
    }

    pub fn initialize_script_context(
        &self,
        thread: ContextId,
        context: ContextId,
        translator: AddressTranslator,
        well_known: WellKnownAddrs,
    ) -> Result<()> {
        self.expect_ack(
            "InitializeScriptContext",
            ProtocolRequest::InitializeScriptContext {
                thread,
                context,
                base_delta: translator.base_delta(),
                well_known,
            },
        )
    }

    pub fn close_script_context(&self, context: ContextId) -> Result<()> {
        self.expect_ack("CloseScriptContext", ProtocolRequest::CloseScriptContext { context })
    }

    pub fn cleanup_script_context(&self, context: ContextId) -> Result<()> {
        self.expect_ack(
            "CleanupScriptContext",
            ProtocolRequest::CleanupScriptContext { context },
        )
    }

    pub fn update_property_record_map(
        &self,
        context: ContextId,
        records: Vec<(PropertyId, String)>,
    ) -> Result<()> {
        self.expect_ack(
            "UpdatePropertyRecordMap",
            ProtocolRequest::UpdatePropertyRecordMap { context, records },
        )
    }

    pub fn set_well_known_host_type(
        &self,
        context: ContextId,
        type_id: u32,
        type_addr: TargetAddr,
    ) -> Result<()> {
        self.expect_ack(
            "SetWellKnownHostType",
            ProtocolRequest::SetWellKnownHostType { context, type_id, type_addr },
        )
    }

    /// Submit one work item and block until the generator returns.
    ///
    /// Ordinary failure (out of executable memory, malformed item) comes
    /// back as [`Error::CompilationFailed`]; the caller falls back to the
    /// interpreter for that function. There is no mid-flight cancellation.
    pub fn submit_compilation_work_item(
        &self,
        item: CompilationWorkItem,
    ) -> Result<CompiledOutput> {
        match self.call(ProtocolRequest::SubmitWorkItem(item))? {
            ProtocolResponse::Compiled(output) => Ok(output),
            ProtocolResponse::Refused(status) => Err(Error::CompilationFailed { status }),
            other => Err(map_failure("SubmitWorkItem", other)),
        }
    }

    pub fn free_allocation(&self, addr: TargetAddr) -> Result<()> {
        self.expect_ack("FreeAllocation", ProtocolRequest::FreeAllocation { addr })
    }

    pub fn is_native_address(&self, addr: TargetAddr) -> Result<bool> {
        match self.call(ProtocolRequest::IsNativeAddress { addr })? {
            ProtocolResponse::AddressAnswer(answer) => Ok(answer),
            other => Err(map_failure("IsNativeAddress", other)),
        }
    }

    /// Stop accepting work. The session refuses further operations.
    pub fn shutdown(&mut self) -> Result<()> {
        self.expect_ack("Shutdown", ProtocolRequest::Shutdown)?;
        self.closed = true;
        Ok(())
    }

    /// Final teardown of generator-side process state
    pub fn cleanup_process(&self) -> Result<()> {
        self.expect_ack("CleanupProcess", ProtocolRequest::CleanupProcess)
    }
}

/// Map a non-Ack response into the matching error
fn map_failure(op: &'static str, response: ProtocolResponse) -> Error {
    match response {
        ProtocolResponse::Busy { context, active } => Error::ContextBusy { context, active },
        ProtocolResponse::UnknownContext(id) => Error::UnknownContext(id),
        ProtocolResponse::Failed(message) => Error::Protocol(format!("{op}: {message}")),
        ProtocolResponse::Refused(status) => Error::CompilationFailed { status },
        other => unexpected_response(op, &other),
    }
}

fn unexpected_response(op: &'static str, response: &ProtocolResponse) -> Error {
    Error::Protocol(format!("{op}: unexpected response {response:?}"))
}
