use std::sync::{Arc, Barrier};

use bytes::Bytes;
use flexmux_core::{
    DisconnectionFrame, Frame, MessageFrame, PingFrame, ProtocolError, Role, Session,
    SessionBuilder, SessionConfig, SessionError, SessionHandle, StreamState, TransportError,
};
use flexmux_testkit::{
    CountingContextListener, RecordingSessionListener, RecordingStreamListener,
    RecordingTransport, control, data, eventually,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Harness = (Arc<Session<RecordingTransport>>, Arc<RecordingSessionListener>);

fn session_with_role(transport: &RecordingTransport, role: Role) -> Harness {
    init_tracing();
    let listener = RecordingSessionListener::new();
    let session = SessionBuilder::new(SessionConfig::new(role))
        .listener(listener.clone())
        .build(transport.clone());
    (session, listener)
}

fn client(transport: &RecordingTransport) -> Harness {
    session_with_role(transport, Role::Client)
}

fn server(transport: &RecordingTransport) -> Harness {
    session_with_role(transport, Role::Server)
}

fn tagged(stream_id: u32, seq: usize) -> Frame {
    Frame::Data(MessageFrame::new(stream_id, seq.to_string()))
}

fn tag(frame: &Frame) -> (u32, usize) {
    let m = frame.as_message().expect("message frame");
    let seq = std::str::from_utf8(&m.payload).unwrap().parse().unwrap();
    (m.stream_id, seq)
}

// ---------------------------------------------------------------------------
// Write scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frames_queued_behind_a_held_write_go_out_in_order() {
    let transport = RecordingTransport::gated();
    let (session, _) = client(&transport);

    let sends: Vec<_> = (0..5).map(|seq| session.send_frame(tagged(7, seq))).collect();
    transport.wait_for_writes(1).await;
    assert_eq!(session.pending_writes(), 4);

    transport.release(5);
    for send in sends {
        send.await.unwrap();
    }
    let order: Vec<usize> = transport.frames().iter().map(|f| tag(f).1).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(transport.max_in_flight(), 1);
    assert_eq!(session.pending_writes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_never_overlap_and_keep_their_own_order() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);

    let tasks: Vec<_> = (0..8u32)
        .map(|caller| {
            let session = session.clone();
            tokio::spawn(async move {
                let sends: Vec<_> = (0..50)
                    .map(|seq| session.send_frame(tagged(caller, seq)))
                    .collect();
                for send in sends {
                    send.await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let frames = transport.frames();
    assert_eq!(frames.len(), 8 * 50);
    assert_eq!(transport.max_in_flight(), 1);
    for caller in 0..8u32 {
        let seqs: Vec<usize> = frames
            .iter()
            .map(tag)
            .filter(|(id, _)| *id == caller)
            .map(|(_, seq)| seq)
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>(), "caller {caller}");
    }
}

#[tokio::test]
async fn send_frames_resolves_once_all_are_written() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);

    session
        .send_frames(vec![tagged(1, 0), tagged(1, 1), PingFrame::request().into()])
        .await
        .unwrap();
    assert_eq!(transport.frames().len(), 3);
    session.send_frames(Vec::new()).await.unwrap();
}

#[tokio::test]
async fn send_frames_fails_when_any_write_fails() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);
    transport.fail_writes(TransportError::Closed);

    let err = session
        .send_frames(vec![tagged(1, 0), tagged(1, 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
}

#[tokio::test]
async fn bounded_queue_rejects_excess_writes() {
    init_tracing();
    let transport = RecordingTransport::gated();
    let session = Session::new(
        transport.clone(),
        SessionConfig::new(Role::Client).with_max_pending_writes(2),
    );

    let first = session.send_frame(tagged(1, 0));
    transport.wait_for_writes(1).await;
    let queued: Vec<_> = (1..3).map(|seq| session.send_frame(tagged(1, seq))).collect();
    let err = session.send_frame(tagged(1, 3)).await.unwrap_err();
    assert!(matches!(err, SessionError::ResourceExhausted { queued: 2, max: 2 }));

    transport.release(3);
    first.await.unwrap();
    for send in queued {
        send.await.unwrap();
    }
}

#[tokio::test]
async fn oversized_payload_is_refused_without_writing() {
    init_tracing();
    let transport = RecordingTransport::new();
    let session = Session::new(
        transport.clone(),
        SessionConfig::new(Role::Client).with_max_frame_payload(4),
    );
    let err = session
        .send_frame(Frame::Data(MessageFrame::new(1, "too long")))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PayloadTooLarge { len: 8, max: 4 }));
    assert_eq!(transport.write_count(), 0);
}

#[tokio::test]
async fn write_failure_fails_in_flight_and_queued_sends() {
    let transport = RecordingTransport::gated();
    let (session, listener) = client(&transport);

    let in_flight = session.ping();
    transport.wait_for_writes(1).await;
    let queued = vec![session.ping(), session.ping()];

    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer went away");
    transport.fail_writes(TransportError::from(io));
    transport.release(1);

    let err = in_flight.await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Io(_))));
    for send in queued {
        let err = send.await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Io(_))));
    }
    assert!(session.is_closed());
    assert!(transport.close_calls() >= 1);
    assert_eq!(listener.failures().len(), 1);
    assert_eq!(transport.write_count(), 1, "queued frames are never written");

    let late = session.ping().await.unwrap_err();
    assert!(matches!(late, SessionError::Transport(_)));
}

#[tokio::test]
async fn close_fails_queued_sends_with_closed() {
    let transport = RecordingTransport::gated();
    let (session, listener) = client(&transport);

    let in_flight = session.ping();
    transport.wait_for_writes(1).await;
    let queued = session.ping();

    session.close();
    assert!(matches!(queued.await, Err(SessionError::Closed)));
    assert!(in_flight.await.is_err());
    assert!(listener.failures().is_empty());
    assert!(matches!(session.ping().await, Err(SessionError::Closed)));
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_ids_follow_the_role_parity() {
    let transport = RecordingTransport::new();
    let (session, _) = server(&transport);
    let listener = RecordingStreamListener::new();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let stream = session
            .new_stream(MessageFrame::new(0, "open"), listener.clone())
            .await
            .unwrap();
        assert!(stream.is_local());
        ids.push(stream.id());
    }
    assert_eq!(ids, vec![2, 4, 6]);
    assert_eq!(session.stream_ids(), vec![2, 4, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrently_opened_streams_reach_the_wire_in_id_order() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);
    let listener = RecordingStreamListener::new();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let session = session.clone();
            let listener = listener.clone();
            tokio::spawn(async move {
                session
                    .new_stream(MessageFrame::new(0, "open"), listener)
                    .await
                    .map(|s| s.id())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let ids: Vec<u32> = transport
        .frames()
        .iter()
        .filter_map(|f| match f {
            Frame::Control(m) => Some(m.stream_id),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 32);
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 2), "{ids:?}");
    assert_eq!(ids[0], 1);
}

#[tokio::test]
async fn local_stream_half_closes_then_closes_on_remote_end() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);
    let listener = RecordingStreamListener::new();
    let contexts = CountingContextListener::new();

    let stream = session
        .new_stream(MessageFrame::new(0, "GET /"), listener.clone())
        .await
        .unwrap();
    let id = stream.id();
    assert_eq!(stream.state(), StreamState::Open);
    stream.attach_context(contexts.clone(), Arc::new(String::from("request-1")));

    stream.send_data("body", true).await.unwrap();
    assert_eq!(stream.state(), StreamState::LocallyClosed);
    assert!(session.get_stream(id).is_some());

    session.dispatch(data(id, "partial", false)).unwrap();
    assert_eq!(stream.state(), StreamState::LocallyClosed);
    session.dispatch(data(id, "done", true)).unwrap();

    assert_eq!(stream.state(), StreamState::Closed);
    assert!(session.get_stream(id).is_none());
    assert_eq!(contexts.close_count(), 1);
    assert_eq!(contexts.closed_as::<String>(), vec!["request-1".to_string()]);

    let deliveries = listener.deliveries();
    assert_eq!(deliveries.len(), 2);
    // The final frame is delivered before the stream flips to closed.
    assert_eq!(deliveries[1].state, StreamState::LocallyClosed);
    assert_eq!(deliveries[1].frame.payload, Bytes::from_static(b"done"));

    let written = transport.frames();
    assert_eq!(written[0], control(id, "GET /", false));
    assert_eq!(written[1], data(id, "body", true));

    // Nothing reaches the stream once it is gone.
    let err = session.dispatch(data(id, "late", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::UnknownStream { .. })
    ));
    assert_eq!(listener.deliveries().len(), 2);
    assert_eq!(contexts.close_count(), 1);
}

#[tokio::test]
async fn remote_stream_lifecycle() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);
    let contexts = CountingContextListener::new();

    session.dispatch(control(1, "hello", false)).unwrap();
    let opened = listener.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, 1);
    assert_eq!(opened[0].1.payload, Bytes::from_static(b"hello"));

    let stream = session.get_stream(1).unwrap();
    assert!(!stream.is_local());
    assert_eq!(stream.state(), StreamState::Open);
    stream.attach_context(contexts.clone(), Arc::new(1u32));

    session.dispatch(data(1, "req", true)).unwrap();
    assert_eq!(stream.state(), StreamState::RemotelyClosed);
    assert_eq!(listener.streams.payloads(), vec![Bytes::from_static(b"req")]);

    stream.send_data("partial", false).await.unwrap();
    assert_eq!(stream.state(), StreamState::RemotelyClosed);
    stream.send_data("resp", true).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(session.stream_count(), 0);
    assert_eq!(contexts.close_count(), 1);
}

#[tokio::test]
async fn remote_stream_opened_with_end_stream_is_remotely_closed() {
    let transport = RecordingTransport::new();
    let (session, _) = server(&transport);

    session.dispatch(control(3, "fire and forget", true)).unwrap();
    let stream = session.get_stream(3).unwrap();
    assert_eq!(stream.state(), StreamState::RemotelyClosed);

    stream.send_control("ack", true).await.unwrap();
    assert!(session.get_stream(3).is_none());
}

#[tokio::test]
async fn local_stream_opened_with_end_stream_refuses_more_sends() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);

    let stream = session
        .new_stream(
            MessageFrame::new(0, "only").with_end_stream(true),
            RecordingStreamListener::new(),
        )
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::LocallyClosed);

    let err = stream.send_data("more", false).await.unwrap_err();
    assert!(matches!(err, SessionError::StreamNotWritable { .. }));
    assert_eq!(transport.write_count(), 1);
}

#[tokio::test]
async fn rejected_open_releases_the_stream_and_its_context() {
    init_tracing();
    let transport = RecordingTransport::gated();
    let session = Session::new(
        transport.clone(),
        SessionConfig::new(Role::Client).with_max_pending_writes(1),
    );

    let first = session.send_frame(tagged(99, 0));
    transport.wait_for_writes(1).await;
    let queued = session.send_frame(tagged(99, 1));

    let opening = session.new_stream(MessageFrame::new(0, "open"), RecordingStreamListener::new());
    let stream = session.get_stream(1).expect("registered before its control frame is sent");
    let contexts = CountingContextListener::new();
    stream.attach_context(contexts.clone(), Arc::new("ctx"));

    let err = opening.await.unwrap_err();
    assert!(matches!(err, SessionError::ResourceExhausted { queued: 1, max: 1 }));
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(session.stream_count(), 0);
    assert_eq!(contexts.close_count(), 1);

    transport.release(2);
    first.await.unwrap();
    queued.await.unwrap();
    assert!(!session.is_closed());
}

#[tokio::test]
async fn frame_after_remote_end_aborts_the_session() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);

    session.dispatch(control(1, "", false)).unwrap();
    session.dispatch(data(1, "last", true)).unwrap();
    let err = session.dispatch(data(1, "extra", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::StreamClosed {
            stream_id: 1,
            state: StreamState::RemotelyClosed
        })
    ));
    assert!(session.is_closed());
    assert_eq!(listener.failures().len(), 1);
    assert_eq!(listener.streams.deliveries().len(), 1);
}

#[tokio::test]
async fn data_on_unknown_stream_is_a_protocol_error() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);

    let err = session.dispatch(data(9, "orphan", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::UnknownStream { stream_id: 9 })
    ));
    assert!(session.is_closed());
    assert!(transport.close_calls() >= 1);
    assert!(listener.streams.deliveries().is_empty());
    assert!(listener.opened().is_empty());
    assert_eq!(listener.failures().len(), 1);

    assert!(matches!(
        session.dispatch(control(11, "", false)),
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn peer_may_not_open_ids_of_our_parity() {
    let transport = RecordingTransport::new();
    let (session, _) = server(&transport);
    let err = session.dispatch(control(2, "", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::InvalidStreamId { stream_id: 2 })
    ));
}

#[tokio::test]
async fn peer_may_not_reuse_or_regress_ids() {
    let transport = RecordingTransport::new();
    let (session, _) = server(&transport);
    session.dispatch(control(5, "", true)).unwrap();
    let err = session.dispatch(control(3, "", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::InvalidStreamId { stream_id: 3 })
    ));
}

#[tokio::test]
async fn control_frame_beyond_31_bits_is_rejected() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);
    let err = session.dispatch(control(u32::MAX, "x", false)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::InvalidStreamId { stream_id: u32::MAX })
    ));
    assert!(session.is_closed());
    assert!(listener.opened().is_empty());
}

#[test]
fn racing_control_frames_create_one_stream() {
    for _ in 0..50 {
        let transport = RecordingTransport::new();
        let (session, listener) = server(&transport);
        let barrier = Barrier::new(2);
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    barrier.wait();
                    let _ = session.dispatch(control(7, "open", false));
                });
            }
        });
        assert_eq!(listener.opened().len(), 1);
    }
}

// ---------------------------------------------------------------------------
// Session-level frames
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_request_is_answered_once() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);

    session.dispatch(PingFrame::request().into()).unwrap();
    let frames = transport.wait_for_writes(1).await;
    assert_eq!(frames, vec![Frame::Ping(PingFrame::reply())]);
    tokio::task::yield_now().await;
    assert_eq!(transport.write_count(), 1);
    assert_eq!(listener.ping_replies(), 0);
}

#[test]
fn sends_from_plain_threads_run_on_the_build_runtime() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let transport = RecordingTransport::new();
    let (session, _) = {
        let _entered = rt.enter();
        server(&transport)
    };

    let sender = session.clone();
    let ping = std::thread::spawn(move || {
        let ping = sender.ping();
        sender.dispatch(PingFrame::request().into()).unwrap();
        ping
    })
    .join()
    .unwrap();

    rt.block_on(async {
        ping.await.unwrap();
        let frames = transport.wait_for_writes(2).await;
        assert_eq!(
            frames,
            vec![
                Frame::Ping(PingFrame::request()),
                Frame::Ping(PingFrame::reply())
            ]
        );
    });
    assert!(!session.is_closed());
}

#[test]
fn sends_without_a_runtime_fail_the_session() {
    let transport = RecordingTransport::new();
    let (session, listener) = client(&transport);

    let err = futures::executor::block_on(session.ping()).unwrap_err();
    assert!(matches!(err, SessionError::NoRuntime));
    assert!(session.is_closed());
    assert_eq!(transport.write_count(), 0);
    assert_eq!(listener.failures().len(), 1);
}

#[tokio::test]
async fn ping_reply_notifies_the_listener_only() {
    let transport = RecordingTransport::new();
    let (session, listener) = client(&transport);

    session.dispatch(PingFrame::reply().into()).unwrap();
    assert_eq!(listener.ping_replies(), 1);
    tokio::task::yield_now().await;
    assert_eq!(transport.write_count(), 0);
}

#[tokio::test]
async fn disconnection_notifies_then_closes() {
    let transport = RecordingTransport::new();
    let (session, listener) = server(&transport);
    let contexts = CountingContextListener::new();

    session.dispatch(control(1, "", false)).unwrap();
    session
        .get_stream(1)
        .unwrap()
        .attach_context(contexts.clone(), Arc::new(()));

    session
        .dispatch(DisconnectionFrame::new("shutting down").into())
        .unwrap();
    assert_eq!(
        listener.disconnects(),
        vec![DisconnectionFrame::new("shutting down")]
    );
    assert!(session.is_closed());
    assert!(transport.close_calls() >= 1);
    assert!(listener.failures().is_empty());
    assert_eq!(session.stream_count(), 0);
    assert_eq!(contexts.close_count(), 1);
}

#[tokio::test]
async fn disconnect_sends_a_disconnection_frame() {
    let transport = RecordingTransport::new();
    let (session, _) = client(&transport);
    session
        .disconnect(DisconnectionFrame::new("bye"))
        .await
        .unwrap();
    assert_eq!(
        transport.frames(),
        vec![Frame::Disconnection(DisconnectionFrame::new("bye"))]
    );
}

#[tokio::test]
async fn session_handle_exposes_attributes_and_streams() {
    let transport = RecordingTransport::new();
    let (session, _) = server(&transport);
    session.dispatch(control(1, "", false)).unwrap();

    let handle: Arc<dyn SessionHandle> = session.clone();
    handle.attributes().insert("peer", String::from("10.0.0.1"));
    assert_eq!(
        session.attributes().get_as::<String>("peer").as_deref(),
        Some(&String::from("10.0.0.1"))
    );
    assert_eq!(handle.session_id(), session.id());
    assert!(handle.get_stream(1).is_some());

    handle.send_frame(tagged(1, 0)).await.unwrap();
    eventually("write recorded", || transport.write_count() == 1).await;

    handle.close();
    assert!(handle.is_closed());
}
