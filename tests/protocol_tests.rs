//! Session/protocol tests over the framed remote transport

mod common;

use common::{run_compiled, MockRuntime, RunOutcome};
use quickjit::protocol::{
    spawn_remote_endpoint, AddressTranslator, CompilationWorkItem, GeneratorEndpoint, JitSession,
    TemplateEncoder, WellKnownAddrs,
};
use quickjit::snapshot::{SnapshotArena, SnapshotBuilder, SnapshotConfig};
use quickjit::{ContextId, Error, TargetAddr};
use std::sync::Arc;

const THREAD: ContextId = ContextId(1);
const CONTEXT: ContextId = ContextId(20);

fn remote_session() -> (JitSession<quickjit::RemoteTransport>, std::thread::JoinHandle<()>) {
    let endpoint = Arc::new(GeneratorEndpoint::new(Box::new(TemplateEncoder)));
    let (transport, worker) = spawn_remote_endpoint(endpoint);
    (JitSession::connect(transport), worker)
}

mod remote_transport {
    use super::*;

    #[test]
    fn test_full_compilation_over_framed_channel() -> anyhow::Result<()> {
        let (session, worker) = remote_session();

        session.initialize_thread_context(THREAD)?;
        session.initialize_script_context(
            THREAD,
            CONTEXT,
            AddressTranslator::identity(),
            WellKnownAddrs::default(),
        )?;
        session.update_property_record_map(
            CONTEXT,
            vec![(quickjit::host::PropertyId(100), "x".into())],
        )?;

        let mut runtime = MockRuntime::new();
        let f = runtime.add_function(1);
        runtime.add_load_site(f, 0, 2, &[0x7000]);

        let arena = SnapshotArena::new();
        let builder =
            SnapshotBuilder::new(&runtime, &runtime, &runtime, SnapshotConfig::default());
        let snapshot = builder.build(&arena, f)?;
        let item =
            CompilationWorkItem::from_snapshot(CONTEXT, snapshot, &AddressTranslator::identity());

        // The work item and its output both crossed the byte channel as
        // checksummed frames; the addresses inside stay valid because the
        // "remote" endpoint shares this address space.
        let output = session.submit_compilation_work_item(item)?;
        assert_eq!(run_compiled(&output), RunOutcome::Completed);
        assert!(session.is_native_address(output.code_addr)?);

        session.free_allocation(output.code_addr)?;
        session.close_script_context(CONTEXT)?;
        session.cleanup_script_context(CONTEXT)?;
        session.cleanup_thread_context(THREAD)?;

        let mut session = session;
        session.shutdown()?;
        worker.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_operations_after_worker_exit_report_closed() {
        let (mut session, worker) = remote_session();
        session.shutdown().unwrap();
        worker.join().unwrap();

        assert!(matches!(
            session.initialize_thread_context(THREAD),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_free_of_unknown_address_is_reported() {
        let (session, worker) = remote_session();
        let result = session.free_allocation(TargetAddr(0xDEAD_0000));
        assert!(matches!(result, Err(Error::Protocol(_))));

        let mut session = session;
        session.shutdown().unwrap();
        worker.join().unwrap();
    }
}

mod teardown_ordering {
    use super::*;

    #[test]
    fn test_cleanup_paths_enforce_ordering() {
        let (session, worker) = remote_session();

        session.initialize_thread_context(THREAD).unwrap();
        session
            .initialize_script_context(
                THREAD,
                CONTEXT,
                AddressTranslator::identity(),
                WellKnownAddrs::default(),
            )
            .unwrap();

        // Thread context cannot go while its script context lives
        assert!(matches!(
            session.cleanup_thread_context(THREAD),
            Err(Error::Protocol(_))
        ));

        // Unknown ids are structured errors, not silent successes
        assert!(matches!(
            session.cleanup_script_context(ContextId(404)),
            Err(Error::UnknownContext(404))
        ));

        session.cleanup_script_context(CONTEXT).unwrap();
        session.cleanup_thread_context(THREAD).unwrap();
        session.cleanup_process().unwrap();

        let mut session = session;
        session.shutdown().unwrap();
        worker.join().unwrap();
    }
}
