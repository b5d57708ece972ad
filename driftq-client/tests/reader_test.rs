//! Reader integration tests against a mock broker speaking the real wire
//! protocol over TCP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use driftq::protocol::{
    BrokerCodec, Command, Frame, Message, MessageId, CLOSE_WAIT, HEARTBEAT, MAGIC_V2,
};
use driftq_client::{
    AsyncHandler, DriftqClientError, Handler, HandlerError, Reader, ReaderConfig, Responder,
};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

fn test_id() -> MessageId {
    MessageId::new(*b"0123456789abcdef")
}

fn message(attempts: u16, body: &'static [u8]) -> Message {
    Message {
        id: test_id(),
        attempts,
        timestamp: 1_700_000_000_000_000_000,
        body: Bytes::from_static(body),
    }
}

fn numbered_message(n: u8) -> Message {
    let mut id = *b"0123456789abcdef";
    id[15] = b'0' + n;
    Message {
        id: MessageId::new(id),
        attempts: 1,
        timestamp: 1_700_000_000_000_000_000,
        body: Bytes::from_static(b"work"),
    }
}

/// One accepted client session on the mock broker.
struct MockSession {
    framed: Framed<TcpStream, BrokerCodec>,
}

async fn accept_session(listener: &TcpListener) -> MockSession {
    let (mut socket, _) = timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for client")
        .expect("accept failed");

    let mut magic = [0u8; 4];
    socket.read_exact(&mut magic).await.expect("no magic");
    assert_eq!(&magic, MAGIC_V2, "client must lead with the magic");

    MockSession {
        framed: Framed::new(socket, BrokerCodec::new()),
    }
}

impl MockSession {
    async fn next_command(&mut self) -> Command {
        timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for command")
            .expect("connection closed")
            .expect("command decode failed")
    }

    /// Next command that is not an RDY refill.
    async fn next_non_rdy(&mut self) -> Command {
        loop {
            match self.next_command().await {
                Command::Rdy(_) => continue,
                cmd => return cmd,
            }
        }
    }

    async fn expect_sub(&mut self, topic: &str, channel: &str) {
        match self.next_command().await {
            Command::Sub {
                topic: t,
                channel: c,
            } => {
                assert_eq!(t, topic);
                assert_eq!(c, channel);
            }
            other => panic!("expected SUB, got {:?}", other),
        }
    }

    /// Skip commands until an RDY with exactly `credit` arrives.
    async fn wait_for_rdy(&mut self, credit: i64) {
        loop {
            if let Command::Rdy(n) = self.next_command().await {
                if n == credit {
                    return;
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("send failed");
    }
}

struct OkHandler;

#[async_trait]
impl Handler for OkHandler {
    async fn handle_message(&self, _message: &Message) -> Result<(), HandlerError> {
        Ok(())
    }
}

struct FailingHandler {
    failures_logged: Arc<AtomicU64>,
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle_message(&self, _message: &Message) -> Result<(), HandlerError> {
        Err("processing failed".into())
    }

    fn log_failed_message(&self, _message: &Message) {
        self.failures_logged.fetch_add(1, Ordering::SeqCst);
    }
}

struct RequeueingAsyncHandler;

#[async_trait]
impl AsyncHandler for RequeueingAsyncHandler {
    async fn handle_message(&self, message: Message, responder: Responder) {
        responder.requeue(message.id, 250).await;
    }
}

/// Holds every delivered message in flight until the test releases it.
struct ParkingHandler {
    parked: Arc<Mutex<Vec<(MessageId, Responder)>>>,
}

#[async_trait]
impl AsyncHandler for ParkingHandler {
    async fn handle_message(&self, message: Message, responder: Responder) {
        self.parked.lock().unwrap().push((message.id, responder));
    }
}

async fn wait_for_in_flight(reader: &Reader, count: i64) {
    timeout(WAIT, async {
        while reader.messages_in_flight() != count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("in-flight count never settled");
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

#[tokio::test]
async fn test_successful_handler_sends_fin() {
    let (listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    session
        .send_frame(Frame::Message(message(1, b"hello")))
        .await;

    match session.next_non_rdy().await {
        Command::Fin(id) => assert_eq!(id, test_id()),
        other => panic!("expected FIN, got {:?}", other),
    }

    assert_eq!(reader.messages_received(), 1);
    assert_eq!(reader.messages_finished(), 1);
    assert_eq!(reader.messages_requeued(), 0);
    assert_eq!(reader.messages_in_flight(), 0);
}

#[tokio::test]
async fn test_failing_handler_sends_req_with_linear_backoff() {
    let (listener, addr) = listener().await;

    let config = ReaderConfig::builder()
        .max_attempt_count(3)
        .default_requeue_delay(Duration::from_secs(1))
        .build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_handler(FailingHandler {
        failures_logged: Arc::new(AtomicU64::new(0)),
    });
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    session
        .send_frame(Frame::Message(message(1, b"hello")))
        .await;

    match session.next_non_rdy().await {
        Command::Req { id, delay_ms } => {
            assert_eq!(id, test_id());
            assert_eq!(delay_ms, 1000);
        }
        other => panic!("expected REQ, got {:?}", other),
    }

    assert_eq!(reader.messages_requeued(), 1);
    assert_eq!(reader.messages_finished(), 0);
}

#[tokio::test]
async fn test_requeue_delay_is_capped() {
    let (listener, addr) = listener().await;

    let config = ReaderConfig::builder()
        .max_attempt_count(100)
        .default_requeue_delay(Duration::from_secs(1))
        .max_requeue_delay(Duration::from_secs(2))
        .build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_handler(FailingHandler {
        failures_logged: Arc::new(AtomicU64::new(0)),
    });
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    // attempt 50 would mean a 50s delay; the cap holds it to 2s
    session
        .send_frame(Frame::Message(message(50, b"hello")))
        .await;

    match session.next_non_rdy().await {
        Command::Req { delay_ms, .. } => assert_eq!(delay_ms, 2000),
        other => panic!("expected REQ, got {:?}", other),
    }
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (listener, addr) = listener().await;

    let failures_logged = Arc::new(AtomicU64::new(0));
    let config = ReaderConfig::builder().max_attempt_count(3).build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_handler(FailingHandler {
        failures_logged: Arc::clone(&failures_logged),
    });
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    // the fourth attempt of a message with max_attempt_count = 3
    session
        .send_frame(Frame::Message(message(4, b"poison")))
        .await;

    // given up: FIN on the wire, failure logger called exactly once
    match session.next_non_rdy().await {
        Command::Fin(id) => assert_eq!(id, test_id()),
        other => panic!("expected FIN, got {:?}", other),
    }
    assert_eq!(failures_logged.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_heartbeat_answered_with_nop() {
    let (listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    session
        .send_frame(Frame::Response(Bytes::from_static(HEARTBEAT)))
        .await;

    match session.next_non_rdy().await {
        Command::Nop => {}
        other => panic!("expected NOP, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rdy_redistributes_across_connections() {
    let mut listeners = Vec::new();
    for _ in 0..4 {
        listeners.push(listener().await);
    }

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);
    for (_, addr) in &listeners {
        reader.connect_to_broker(addr).await.unwrap();
    }
    assert_eq!(reader.connection_count(), 4);

    let mut sessions = Vec::new();
    for (listener, _) in &listeners {
        let mut session = accept_session(listener).await;
        session.expect_sub("events", "tail").await;
        sessions.push(session);
    }

    // 200 split across 4 connections: each gets RDY 50
    reader.set_max_in_flight(200);
    for session in &mut sessions {
        session.wait_for_rdy(50).await;
    }
}

#[tokio::test]
async fn test_zero_max_in_flight_clamps_to_one() {
    let (listener, addr) = listener().await;

    let config = ReaderConfig::builder().max_in_flight(5).build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;
    session.wait_for_rdy(5).await;

    // the clamp floor keeps one credit per connection; no deadlock, no
    // division by zero
    reader.set_max_in_flight(0);
    session.wait_for_rdy(1).await;

    session
        .send_frame(Frame::Message(message(1, b"still flowing")))
        .await;
    match session.next_non_rdy().await {
        Command::Fin(_) => {}
        other => panic!("expected FIN, got {:?}", other),
    }
}

#[tokio::test]
async fn test_is_starved_crosses_the_in_flight_threshold() {
    let (listener, addr) = listener().await;

    let parked = Arc::new(Mutex::new(Vec::new()));
    let config = ReaderConfig::builder().max_in_flight(10).build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_async_handler(ParkingHandler {
        parked: Arc::clone(&parked),
    });
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;
    session.wait_for_rdy(10).await;

    // idle connection with full credit is not starved
    assert!(!reader.is_starved());

    // two of ten in flight stays below the 85% threshold
    for n in 0..2 {
        session
            .send_frame(Frame::Message(numbered_message(n)))
            .await;
    }
    wait_for_in_flight(&reader, 2).await;
    assert!(!reader.is_starved());

    // eight of ten crosses it
    for n in 2..8 {
        session
            .send_frame(Frame::Message(numbered_message(n)))
            .await;
    }
    wait_for_in_flight(&reader, 8).await;
    assert!(reader.is_starved());

    // releasing the backlog clears the starvation signal
    let released: Vec<(MessageId, Responder)> = parked.lock().unwrap().drain(..).collect();
    for (id, responder) in released {
        responder.finish(id).await;
    }
    wait_for_in_flight(&reader, 0).await;
    assert!(!reader.is_starved());
}

#[tokio::test]
async fn test_is_starved_counts_a_zero_credit_connection() {
    let (listener, addr) = listener().await;

    let config = ReaderConfig::builder().max_in_flight(10).build();
    let reader = Reader::with_config("events", "tail", config).unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    // the read loop has not run yet on this single-threaded runtime, so the
    // connection still has zero credit; a zero threshold counts any
    // non-stopping connection as starved
    assert!(reader.is_starved());

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;
    session.wait_for_rdy(10).await;
    assert!(!reader.is_starved());
}

#[tokio::test]
async fn test_async_handler_controls_the_response() {
    let (listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_async_handler(RequeueingAsyncHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    session
        .send_frame(Frame::Message(message(1, b"deferred")))
        .await;

    match session.next_non_rdy().await {
        Command::Req { id, delay_ms } => {
            assert_eq!(id, test_id());
            assert_eq!(delay_ms, 250);
        }
        other => panic!("expected REQ, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_twice_returns_already_connected() {
    let (_listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let err = reader.connect_to_broker(&addr).await.unwrap_err();
    assert!(matches!(err, DriftqClientError::AlreadyConnected));
}

#[tokio::test]
async fn test_connect_requires_handlers() {
    let (_listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    let err = reader.connect_to_broker(&addr).await.unwrap_err();
    assert!(matches!(err, DriftqClientError::NoHandlers));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_fires_exit() {
    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);

    reader.stop();
    reader.stop();

    timeout(WAIT, reader.wait()).await.expect("wait never fired");

    let (_listener, addr) = listener().await;
    let err = reader.connect_to_broker(&addr).await.unwrap_err();
    assert!(matches!(err, DriftqClientError::Stopped));
}

#[tokio::test]
async fn test_graceful_close_handshake() {
    let (listener, addr) = listener().await;

    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);
    reader.connect_to_broker(&addr).await.unwrap();

    let mut session = accept_session(&listener).await;
    session.expect_sub("events", "tail").await;

    reader.stop();

    match session.next_non_rdy().await {
        Command::Cls => {}
        other => panic!("expected CLS, got {:?}", other),
    }
    session
        .send_frame(Frame::Response(Bytes::from_static(CLOSE_WAIT)))
        .await;

    // nothing in flight, so the reader drains and exits well before the
    // thirty-second hard stop
    timeout(WAIT, reader.wait()).await.expect("wait never fired");
    assert_eq!(reader.connection_count(), 0);
}

#[tokio::test]
async fn test_lookup_address_registered_once() {
    let reader = Reader::new("events", "tail").unwrap();
    reader.add_handler(OkHandler);

    reader.connect_to_lookup("127.0.0.1:4161").unwrap();
    let err = reader.connect_to_lookup("127.0.0.1:4161").unwrap_err();
    assert!(matches!(err, DriftqClientError::LookupAddressExists));
}
