//! Input engine: blocking reads, readiness probes and close

mod common;

use common::{connect, settings, CancelMode, Event, Recorder, ScriptedTransport};
use sluice::error::{Direction, StateViolation, StreamError, TransportError};
use sluice::stream::{CallContext, ReadState};
use std::io::{self, Read};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

fn reset() -> TransportError {
    TransportError::io(Direction::Read, io::Error::from(io::ErrorKind::ConnectionReset))
}

#[test]
fn test_blocking_read_until_eof() {
    let transport = ScriptedTransport::new();
    let (conn, pool) = connect(&transport, settings(16, 8));
    let input = conn.input();

    transport.feed(b"hello");
    let mut buf = [0u8; 16];
    let n = input.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    transport.feed(b"!");
    assert_eq!(input.read_byte().unwrap(), Some(b'!'));

    transport.feed_eof();
    assert_eq!(input.read(&mut buf).unwrap(), 0);
    assert!(input.is_finished());
    assert_eq!(input.read_byte().unwrap(), None);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_blocking_read_timeout_is_latched() {
    let transport = ScriptedTransport::new();
    let mut settings = settings(16, 8);
    settings.read_timeout_ms = 20;
    let (conn, _pool) = connect(&transport, settings);
    let input = conn.input();

    let mut buf = [0u8; 4];
    let err = input.read(&mut buf).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(input.state(), ReadState::Error);

    transport.feed(b"late");
    let again = input.read(&mut buf).unwrap_err();
    assert!(again.is_timeout());
}

#[test]
fn test_first_data_available_is_never_inline() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();

    // data is already waiting, yet the probe still goes through the queue
    transport.feed(b"abc");
    input.set_read_listener(recorder.clone()).unwrap();
    transport.settle();

    assert_eq!(recorder.events(), vec![Event::DataAvailable]);
    assert_ne!(recorder.threads.lock()[0], thread::current().id());
}

#[test]
fn test_probed_byte_is_read_first() {
    let transport = ScriptedTransport::new();
    let (conn, pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();

    input.set_read_listener(recorder.clone()).unwrap();
    assert_eq!(input.state(), ReadState::ProbePending);

    transport.feed(b"abc");
    transport.settle();
    assert_eq!(recorder.events(), vec![Event::DataAvailable]);
    assert!(input.is_ready());

    let mut buf = [0u8; 8];
    let n = input.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"abc");
    assert_eq!(input.state(), ReadState::Idle);

    // nothing left: not ready, and a probe is armed for the next byte
    assert!(!input.is_ready());
    assert!(transport.has_pending_read());
    transport.feed(b"d");
    transport.settle();
    assert_eq!(recorder.count(&Event::DataAvailable), 2);
    assert_eq!(input.read_byte().unwrap(), Some(b'd'));

    conn.close().unwrap();
    transport.settle();
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_read_before_ready_is_rejected() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    input.set_read_listener(Recorder::new()).unwrap();

    let mut buf = [0u8; 4];
    let err = input.read(&mut buf).unwrap_err();
    assert!(err.is_state(StateViolation::NotReady));
}

#[test]
fn test_second_read_listener_rejected() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();

    input.set_read_listener(Recorder::new()).unwrap();
    let err = input.set_read_listener(Recorder::new()).unwrap_err();
    assert!(err.is_state(StateViolation::ListenerAlreadySet));
    assert_eq!(transport.async_reads(), 1);
}

#[test]
fn test_eof_in_readiness_mode() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();

    transport.feed_eof();
    transport.settle();
    assert_eq!(recorder.events(), vec![Event::AllDataRead]);
    assert!(input.is_ready());
    assert_eq!(input.read(&mut [0u8; 4]).unwrap(), 0);

    input.close().unwrap();
    assert_eq!(recorder.count(&Event::AllDataRead), 1);
}

#[test]
fn test_read_failure_latched_and_reported_once() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();

    transport.fail_read(reset());
    transport.settle();
    assert_eq!(recorder.errors(), 1);
    assert_eq!(input.state(), ReadState::Error);
    assert!(!input.is_ready());

    let mut buf = [0u8; 4];
    let first = input.read(&mut buf).unwrap_err();
    let second = input.read(&mut buf).unwrap_err();
    assert!(matches!(first, StreamError::Transport(TransportError::Io { .. })));
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(recorder.errors(), 1);

    input.close().unwrap();
    assert_eq!(input.state(), ReadState::Closed);
    assert_eq!(recorder.count(&Event::AllDataRead), 0);
}

#[test]
fn test_failed_top_up_keeps_probed_byte() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();

    transport.feed(b"a");
    transport.settle();
    transport.fail_read(reset());

    let mut buf = [0u8; 4];
    assert_eq!(input.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'a');
    assert_eq!(recorder.errors(), 1);
    assert!(input.read(&mut buf).is_err());
}

#[test]
fn test_close_waits_for_cancelled_probe() {
    let transport = ScriptedTransport::with_cancel_mode(CancelMode::Held);
    let (conn, pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();

    input.close().unwrap();
    assert_ne!(input.state(), ReadState::Closed);
    assert!(recorder.events().is_empty());
    let err = input.read(&mut [0u8; 1]).unwrap_err();
    assert!(err.is_state(StateViolation::Closed));

    assert!(transport.release_cancel());
    assert_eq!(input.state(), ReadState::Closed);
    assert_eq!(recorder.events(), vec![Event::AllDataRead]);

    conn.output().close().unwrap();
    assert_eq!(transport.shutdowns(), 1);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_close_with_synchronous_cancel() {
    let transport = ScriptedTransport::with_cancel_mode(CancelMode::Sync);
    let (conn, pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();

    input.close().unwrap();
    assert_eq!(input.state(), ReadState::Closed);
    assert_eq!(recorder.events(), vec![Event::AllDataRead]);
    input.close().unwrap();
    assert_eq!(recorder.count(&Event::AllDataRead), 1);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_data_available_sees_registering_context() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    let input = conn.input();
    let recorder = Recorder::new();
    let ctx = CallContext::new().with_principal("reader");

    CallContext::scope(ctx.clone(), || input.set_read_listener(recorder.clone())).unwrap();
    transport.feed(b"z");
    transport.settle();

    assert_eq!(recorder.contexts.lock().clone(), vec![Some(ctx)]);
}

#[test]
fn test_io_read_adapter() {
    let transport = ScriptedTransport::new();
    let (conn, _pool) = connect(&transport, settings(16, 8));
    transport.feed(b"xyz");
    transport.feed_eof();

    let mut input = conn.input();
    let mut out = Vec::new();
    input.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"xyz".to_vec());
}

#[test]
fn test_timed_out_readiness_read_reports_once() {
    let transport = ScriptedTransport::new();
    let mut settings = settings(16, 8);
    settings.read_timeout_ms = 50;
    let (conn, pool) = connect(&transport, settings);
    let input = conn.input();
    let recorder = Recorder::new();
    input.set_read_listener(recorder.clone()).unwrap();
    assert_eq!(transport.read_timeout(), Some(Duration::from_millis(50)));

    assert!(transport.expire_read());
    assert_eq!(recorder.errors(), 1);
    assert_eq!(input.state(), ReadState::Error);
    assert!(!input.is_ready());

    // nothing is listening on the transport any more
    transport.feed(b"late");
    transport.settle();
    assert!(!transport.has_pending_read());
    assert_eq!(recorder.events().len(), 1);
    assert!(input.read(&mut [0u8; 4]).unwrap_err().is_timeout());

    input.close().unwrap();
    assert_eq!(recorder.count(&Event::AllDataRead), 0);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_close_racing_failure_ends_once() {
    for _ in 0..200 {
        let transport = ScriptedTransport::new();
        let (conn, pool) = connect(&transport, settings(16, 8));
        let input = conn.input();
        let recorder = Recorder::new();
        input.set_read_listener(recorder.clone()).unwrap();
        let start = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                start.wait();
                input.close().unwrap();
            });
            s.spawn(|| {
                start.wait();
                transport.fail_read(reset());
            });
        });
        transport.settle();

        let ended = recorder.count(&Event::AllDataRead);
        let failed = recorder.errors();
        assert!(ended <= 1 && failed <= 1);
        assert!(ended + failed <= 1);
        assert_eq!(recorder.count(&Event::DataAvailable), 0);
        assert_eq!(input.state(), ReadState::Closed);
        assert_eq!(pool.outstanding(), 0);
    }
}
