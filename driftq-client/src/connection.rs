//! One broker session: socket setup, serialized writes, and per-connection
//! accounting.
//!
//! A connection owns three long-lived tasks, all spawned by the reader or
//! here: the writer task (the only place the socket is written, draining a
//! command channel), the read loop, and the finish loop. The latter two live
//! in `reader.rs`; this module hands them the split halves they drive.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use driftq::protocol::{ClientCodec, Command, MAGIC_V2};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::config::ReaderConfig;
use crate::error::DriftqClientError;
use crate::handler::FinishedMessage;
use crate::Result;

pub(crate) type FrameStream = SplitStream<Framed<TcpStream, ClientCodec>>;
type CommandSink = SplitSink<Framed<TcpStream, ClientCodec>, Command>;

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

/// A single broker session owned by a [`Reader`](crate::Reader).
///
/// Destroyed only after its in-flight count has drained to zero.
pub struct Connection {
    addr: String,
    cmd_tx: mpsc::Sender<Command>,
    // the connection's own copy of the response sender; dropped at teardown
    // so the finish loop's drain can observe the channel close
    finished_tx: Mutex<Option<mpsc::Sender<FinishedMessage>>>,
    pub(crate) dying: Notify,
    rdy_count: AtomicI64,
    messages_in_flight: AtomicI64,
    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
    stop_flag: AtomicBool,
    closed: AtomicBool,
}

/// Everything `Reader::connect_to_broker` needs to wire up a new session.
pub(crate) struct ConnectionParts {
    pub conn: Arc<Connection>,
    pub frames: FrameStream,
    pub finished_rx: mpsc::Receiver<FinishedMessage>,
}

impl Connection {
    /// Dial `addr`, write the protocol magic, and start the writer task.
    pub(crate) async fn connect(addr: &str, config: &ReaderConfig) -> Result<ConnectionParts> {
        let mut stream = timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DriftqClientError::timeout(config.dial_timeout.as_millis() as u64))?
            .map_err(|e| {
                DriftqClientError::connection(format!("failed to connect to {}: {}", addr, e))
            })?;

        timeout(config.write_timeout, stream.write_all(MAGIC_V2))
            .await
            .map_err(|_| DriftqClientError::timeout(config.write_timeout.as_millis() as u64))?
            .map_err(|e| {
                DriftqClientError::connection(format!("[{}] failed to write magic: {}", addr, e))
            })?;

        let (sink, frames) = Framed::new(stream, ClientCodec::new()).split();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (finished_tx, finished_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

        tokio::spawn(write_loop(
            addr.to_string(),
            sink,
            cmd_rx,
            config.write_timeout,
        ));

        let conn = Arc::new(Connection {
            addr: addr.to_string(),
            cmd_tx,
            finished_tx: Mutex::new(Some(finished_tx)),
            dying: Notify::new(),
            rdy_count: AtomicI64::new(0),
            messages_in_flight: AtomicI64::new(0),
            messages_received: AtomicU64::new(0),
            messages_finished: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
            stop_flag: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        Ok(ConnectionParts {
            conn,
            frames,
            finished_rx,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue a command for the writer task.
    pub(crate) async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| {
            DriftqClientError::connection(format!("[{}] connection closed", self.addr))
        })
    }

    /// A clone of the response sender for an incoming message, or `None`
    /// once teardown has begun.
    pub(crate) fn response_sender(&self) -> Option<mpsc::Sender<FinishedMessage>> {
        self.finished_tx.lock().clone()
    }

    /// Drop the connection's own response sender so the drain can complete.
    pub(crate) fn shutdown_responses(&self) {
        self.finished_tx.lock().take();
    }

    /// Current RDY credit. Can briefly go negative under delivery races.
    pub fn rdy_count(&self) -> i64 {
        self.rdy_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_rdy_count(&self, count: i64) {
        self.rdy_count.store(count, Ordering::SeqCst);
    }

    /// Decrement the RDY credit for one delivery; returns the remainder.
    pub(crate) fn decrement_rdy(&self) -> i64 {
        self.rdy_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn in_flight(&self) -> i64 {
        self.messages_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_in_flight(&self) {
        self.messages_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decr_in_flight(&self) {
        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_received(&self) {
        self.messages_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn messages_finished(&self) -> u64 {
        self.messages_finished.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_finished(&self) {
        self.messages_finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn messages_requeued(&self) -> u64 {
        self.messages_requeued.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_requeued(&self) {
        self.messages_requeued.fetch_add(1, Ordering::SeqCst);
    }

    /// True once the session is closing; no new messages are expected.
    pub fn is_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopping(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Returns true exactly once, for the caller that gets to tear down.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("rdy_count", &self.rdy_count())
            .field("in_flight", &self.in_flight())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// The single writer: every byte after the magic goes through here, which
/// serializes RDY refills, FIN/REQ responses, and NOPs behind one queue.
async fn write_loop(
    addr: String,
    mut sink: CommandSink,
    mut cmd_rx: mpsc::Receiver<Command>,
    write_timeout: std::time::Duration,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let name = cmd.to_string();
        match timeout(write_timeout, sink.send(cmd)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(addr = %addr, command = %name, error = %e, "write failed");
                break;
            }
            Err(_) => {
                error!(addr = %addr, command = %name, "write timed out");
                break;
            }
        }
    }
    // dropping the receiver surfaces an error to any later send_command
    let _ = sink.close().await;
    debug!(addr = %addr, "writer stopped");
}
