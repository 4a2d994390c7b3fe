use std::time::Duration;

use omnia_sdk::stream::client::{
    ConnectionConfig, OcpClient, StreamClientError, StreamEvent, TerminateReason,
};
use omnia_sdk::stream::proto::DecodeError;
use omnia_sdk::stream::session::{SessionState, StreamSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

const EXPECTED_COMMAND: &[u8] = b"<OmniaXB><System><EnableRealTimeInformation><Enabled>1</Enabled></EnableRealTimeInformation></System></OmniaXB>";
const ACK: &[u8] = b"<OmniaXB><System><EnableRealTimeInformation>ACK</EnableRealTimeInformation></System></OmniaXB>";
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn telemetry_doc(timestamp: &str, vo2: &str, hr: &str) -> Vec<u8> {
    format!(
        "<OmniaXB><RealTimeData><SetRealTimeInfo>\
         <TimeStamp>{timestamp}</TimeStamp><VO2>{vo2}</VO2><VCO2>1987.321</VCO2>\
         <PHASE>EX</PHASE><VE>45.6789</VE><HR>{hr}</HR>\
         </SetRealTimeInfo></RealTimeData></OmniaXB>"
    )
    .into_bytes()
}

async fn bind_mock_device() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock device listener");
    let port = listener
        .local_addr()
        .expect("read mock device listener address")
        .port();
    (listener, port)
}

/// Reads the full handshake command off the socket.
async fn read_handshake(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = [0u8; 1024];
    let mut received = Vec::new();
    while received.len() < EXPECTED_COMMAND.len() {
        let n = socket.read(&mut buf).await.expect("read handshake command");
        assert!(n > 0, "client closed during handshake");
        received.extend_from_slice(&buf[..n]);
    }
    received
}

/// Sends the ack, then pauses so it travels as its own segment the way the
/// device paces its replies; the client treats the first read as the whole
/// opaque ack.
async fn send_ack(socket: &mut TcpStream) {
    socket.write_all(ACK).await.expect("write ack");
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Drains the socket until the client hangs up.
async fn wait_for_client_close(socket: &mut TcpStream) {
    let mut scratch = [0u8; 64];
    while socket
        .read(&mut scratch)
        .await
        .map(|n| n > 0)
        .unwrap_or(false)
    {}
}

async fn recv_event(session: &mut StreamSession) -> Option<StreamEvent> {
    timeout(RECV_TIMEOUT, session.recv())
        .await
        .expect("timed out waiting for stream event")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_handshake_fragmented_and_coalesced_pushes() {
    let (listener, port) = bind_mock_device().await;
    let (observed_tx, observed_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept client");
        let command = read_handshake(&mut socket).await;
        let _ = observed_tx.send(command);
        send_ack(&mut socket).await;

        // One document split mid-stream.
        let doc = telemetry_doc("00:01:23", "2345.678", "142");
        let (head, tail) = doc.split_at(doc.len() / 2);
        socket.write_all(head).await.expect("write head");
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(tail).await.expect("write tail");

        // Two documents coalesced into one segment.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut combined = telemetry_doc("00:01:24", "2400.04", "144");
        combined.extend_from_slice(&telemetry_doc("00:01:25", "2500.06", "146"));
        socket.write_all(&combined).await.expect("write combined");
    });

    let client = OcpClient::new(ConnectionConfig::new("127.0.0.1", port));
    let mut session = StreamSession::connect(&client).await.expect("connect");

    let ack = recv_event(&mut session).await.expect("handshake ack");
    match ack {
        StreamEvent::HandshakeAck(bytes) => assert_eq!(&bytes[..], ACK),
        other => panic!("expected handshake ack first, got {other:?}"),
    }
    assert_eq!(*session.state(), SessionState::Streaming);

    let mut records = Vec::new();
    loop {
        match recv_event(&mut session).await {
            Some(StreamEvent::Telemetry(record)) => records.push(record),
            Some(StreamEvent::Terminated(TerminateReason::PeerClosed)) => break,
            Some(other) => panic!("unexpected stream event: {other:?}"),
            None => panic!("stream ended without a terminated event"),
        }
    }

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].timestamp, "00:01:23");
    assert_eq!(records[0].vo2, 2345.7);
    assert_eq!(records[0].ve, 45.7);
    assert_eq!(records[0].hr, "142");
    assert_eq!(records[1].timestamp, "00:01:24");
    assert_eq!(records[2].timestamp, "00:01:25");

    assert_eq!(*session.state(), SessionState::Closed);
    assert!(session.recv().await.is_none(), "terminal state must be final");

    let observed = timeout(RECV_TIMEOUT, observed_rx)
        .await
        .expect("timed out waiting for device observation")
        .expect("observation channel closed");
    assert_eq!(observed, EXPECTED_COMMAND);

    server.await.expect("mock device task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_is_a_warning_not_a_termination() {
    let (listener, port) = bind_mock_device().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept client");
        read_handshake(&mut socket).await;
        send_ack(&mut socket).await;

        let bad = telemetry_doc("00:01:23", "abc", "142");
        socket.write_all(&bad).await.expect("write bad doc");
        let good = telemetry_doc("00:01:24", "2345.678", "143");
        socket.write_all(&good).await.expect("write good doc");

        wait_for_client_close(&mut socket).await;
    });

    let client = OcpClient::new(ConnectionConfig::new("127.0.0.1", port));
    let mut session = StreamSession::connect(&client).await.expect("connect");

    let ack = recv_event(&mut session).await.expect("handshake ack");
    assert!(matches!(ack, StreamEvent::HandshakeAck(_)));

    let warning = recv_event(&mut session).await.expect("warning");
    match warning {
        StreamEvent::Warning(DecodeError::MalformedField(field)) => assert_eq!(field, "VO2"),
        other => panic!("expected malformed-field warning, got {other:?}"),
    }
    assert_eq!(*session.state(), SessionState::Streaming);

    let telemetry = recv_event(&mut session).await.expect("telemetry");
    match telemetry {
        StreamEvent::Telemetry(record) => assert_eq!(record.timestamp, "00:01:24"),
        other => panic!("expected telemetry after the warning, got {other:?}"),
    }

    session.close();
    match recv_event(&mut session).await.expect("terminated") {
        StreamEvent::Terminated(TerminateReason::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(*session.state(), SessionState::Closed);
    assert!(session.recv().await.is_none());

    server.await.expect("mock device task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecognized_message_is_skipped() {
    let (listener, port) = bind_mock_device().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept client");
        read_handshake(&mut socket).await;
        send_ack(&mut socket).await;

        socket
            .write_all(b"<OmniaXB><Status>idle</Status></OmniaXB>")
            .await
            .expect("write status doc");
        let good = telemetry_doc("00:01:24", "2345.678", "143");
        socket.write_all(&good).await.expect("write good doc");
    });

    let client = OcpClient::new(ConnectionConfig::new("127.0.0.1", port));
    let mut session = StreamSession::connect(&client).await.expect("connect");

    assert!(matches!(
        recv_event(&mut session).await.expect("ack"),
        StreamEvent::HandshakeAck(_)
    ));

    let warning = recv_event(&mut session).await.expect("warning");
    assert!(matches!(
        warning,
        StreamEvent::Warning(DecodeError::UnrecognizedMessage)
    ));
    assert_eq!(*session.state(), SessionState::Streaming);

    let telemetry = recv_event(&mut session).await.expect("telemetry");
    assert!(matches!(telemetry, StreamEvent::Telemetry(_)));

    match recv_event(&mut session).await.expect("terminated") {
        StreamEvent::Terminated(TerminateReason::PeerClosed) => {}
        other => panic!("expected peer close, got {other:?}"),
    }

    server.await.expect("mock device task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runaway_unbalanced_stream_fails_with_frame_too_large() {
    let (listener, port) = bind_mock_device().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept client");
        read_handshake(&mut socket).await;
        send_ack(&mut socket).await;

        // A document that never closes. The client tears the connection
        // down once its ceiling trips, so later writes may fail.
        let _ = socket.write_all(b"<Garbage>").await;
        for _ in 0..8 {
            if socket.write_all(&[b'x'; 32]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let client =
        OcpClient::new(ConnectionConfig::new("127.0.0.1", port)).with_max_frame_size(64);
    let mut session = StreamSession::connect(&client).await.expect("connect");

    assert!(matches!(
        recv_event(&mut session).await.expect("ack"),
        StreamEvent::HandshakeAck(_)
    ));

    match recv_event(&mut session).await.expect("terminated") {
        StreamEvent::Terminated(TerminateReason::Failed(StreamClientError::FrameTooLarge(
            err,
        ))) => {
            assert_eq!(err.limit, 64);
        }
        other => panic!("expected frame-too-large failure, got {other:?}"),
    }

    match session.state() {
        SessionState::Failed { reason } => assert!(reason.contains("limit")),
        other => panic!("expected Failed state, got {other:?}"),
    }
    assert!(session.recv().await.is_none());

    server.await.expect("mock device task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_before_ack_fails_the_handshake() {
    let (listener, port) = bind_mock_device().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept client");
        read_handshake(&mut socket).await;
        // Hang up without replying.
    });

    let client = OcpClient::new(ConnectionConfig::new("127.0.0.1", port));
    let err = client.connect().await.expect_err("handshake must fail");
    assert!(matches!(err, StreamClientError::HandshakeClosed));

    server.await.expect("mock device task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_dead_endpoint_fails() {
    // Bind to grab a free port, then release it before connecting.
    let (listener, port) = bind_mock_device().await;
    drop(listener);

    let client = OcpClient::new(ConnectionConfig::new("127.0.0.1", port));
    let err = client.connect().await.expect_err("connect must fail");
    assert!(matches!(err, StreamClientError::Connect(_)));
}
