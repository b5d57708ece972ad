//! High-level consumer for a (topic, channel) pair.
//!
//! A [`Reader`] owns every broker [`Connection`] exclusively and fans their
//! messages into one incoming queue serviced by handler workers. Flow control
//! is credit-based: each connection is granted an RDY budget carved out of
//! the reader's global `max_in_flight`, refilled whenever it runs low.
//!
//! If lookup directories are configured, a poller task discovers brokers for
//! the topic and reconnects as the set changes.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use driftq::protocol::{self, Command, Frame, CLOSE_WAIT, MAX_RDY_COUNT};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::config::ReaderConfig;
use crate::connection::{Connection, ConnectionParts, FrameStream};
use crate::error::DriftqClientError;
use crate::handler::{AsyncHandler, FinishedMessage, Handler, IncomingMessage, Responder};
use crate::lookup::LookupClient;
use crate::Result;

/// How long `stop()` waits for connections to drain before handlers are
/// forcibly terminated.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A consumer of one (topic, channel) pair across any number of brokers.
///
/// Register at least one handler, then connect directly with
/// [`connect_to_broker`](Reader::connect_to_broker) or via discovery with
/// [`connect_to_lookup`](Reader::connect_to_lookup). [`stop`](Reader::stop)
/// begins a graceful shutdown; [`wait`](Reader::wait) resolves once every
/// handler worker has exited.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    topic: String,
    channel: String,
    config: ReaderConfig,
    connections: DashMap<String, Arc<Connection>>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>,
    max_in_flight: AtomicI64,
    stop_flag: AtomicBool,
    handlers_stopped: AtomicBool,
    running_handlers: AtomicI64,
    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
    messages_in_flight: AtomicI64,
    lookup_addrs: RwLock<Vec<String>>,
    lookup_client: LookupClient,
    recheck_tx: mpsc::Sender<()>,
    recheck_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopping_tx: watch::Sender<bool>,
    exited_tx: watch::Sender<bool>,
}

impl Reader {
    /// Create a reader with default configuration.
    ///
    /// Fails on invalid topic or channel names (non-empty, at most 64
    /// characters from `[.a-zA-Z0-9_-]`; channels may end in `#ephemeral`).
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Result<Self> {
        Self::with_config(topic, channel, ReaderConfig::default())
    }

    pub fn with_config(
        topic: impl Into<String>,
        channel: impl Into<String>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        if !protocol::is_valid_topic_name(&topic) {
            return Err(DriftqClientError::invalid_config(format!(
                "invalid topic name {:?}",
                topic
            )));
        }
        if !protocol::is_valid_channel_name(&channel) {
            return Err(DriftqClientError::invalid_config(format!(
                "invalid channel name {:?}",
                channel
            )));
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (recheck_tx, recheck_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (stopping_tx, _) = watch::channel(false);
        let (exited_tx, _) = watch::channel(false);

        let max_in_flight = config.max_in_flight;
        Ok(Self {
            inner: Arc::new(ReaderInner {
                topic,
                channel,
                config,
                connections: DashMap::new(),
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                max_in_flight: AtomicI64::new(max_in_flight),
                stop_flag: AtomicBool::new(false),
                handlers_stopped: AtomicBool::new(false),
                running_handlers: AtomicI64::new(0),
                messages_received: AtomicU64::new(0),
                messages_finished: AtomicU64::new(0),
                messages_requeued: AtomicU64::new(0),
                messages_in_flight: AtomicI64::new(0),
                lookup_addrs: RwLock::new(Vec::new()),
                lookup_client: LookupClient::new(),
                recheck_tx,
                recheck_rx: Mutex::new(Some(recheck_rx)),
                shutdown_tx,
                stopping_tx,
                exited_tx,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn max_in_flight(&self) -> i64 {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Update the global in-flight budget and re-issue RDY on every
    /// connection. No-op when stopped or unchanged; values above the
    /// protocol ceiling are truncated.
    pub fn set_max_in_flight(&self, max_in_flight: i64) {
        self.inner.set_max_in_flight(max_in_flight);
    }

    /// True when any live connection's in-flight count has reached 85% of
    /// its RDY credit, meaning the application is the bottleneck. A
    /// connection whose credit is still zero counts as starved.
    pub fn is_starved(&self) -> bool {
        self.inner.connections.iter().any(|entry| {
            let conn = entry.value();
            let threshold = (conn.rdy_count() as f64 * 0.85) as i64;
            conn.in_flight() >= threshold && !conn.is_stopping()
        })
    }

    /// Register a synchronous handler. Spawns one worker task.
    ///
    /// Handlers must be registered before connecting.
    pub fn add_handler<H: Handler>(&self, handler: H) {
        let inner = Arc::clone(&self.inner);
        inner.running_handlers.fetch_add(1, Ordering::SeqCst);
        // subscribe before spawning so a stop issued immediately after
        // registration is still observed
        let mut shutdown = inner.shutdown_tx.subscribe();
        debug!("starting handler worker");
        tokio::spawn(async move {
            while !inner.handlers_stopped.load(Ordering::SeqCst) {
                let incoming = tokio::select! {
                    incoming = next_incoming(&inner) => incoming,
                    _ = shutdown.recv() => break,
                };
                inner.dispatch_sync(&handler, incoming).await;
            }
            inner.worker_exited();
        });
    }

    /// Register an asynchronous handler. Spawns one worker task.
    ///
    /// The handler receives each message together with a
    /// [`Responder`](crate::Responder) and must eventually report a
    /// [`FinishedMessage`](crate::FinishedMessage) through it. The attempt
    /// limit is still enforced here, before delivery.
    pub fn add_async_handler<H: AsyncHandler>(&self, handler: H) {
        let inner = Arc::clone(&self.inner);
        inner.running_handlers.fetch_add(1, Ordering::SeqCst);
        let mut shutdown = inner.shutdown_tx.subscribe();
        debug!("starting async handler worker");
        tokio::spawn(async move {
            while !inner.handlers_stopped.load(Ordering::SeqCst) {
                let incoming = tokio::select! {
                    incoming = next_incoming(&inner) => incoming,
                    _ = shutdown.recv() => break,
                };
                inner.dispatch_async(&handler, incoming).await;
            }
            inner.worker_exited();
        });
    }

    /// Connect directly to a broker at `addr` (`host:port`).
    pub async fn connect_to_broker(&self, addr: &str) -> Result<()> {
        self.inner.connect_to_broker(addr).await
    }

    /// Register a lookup directory endpoint. The first registration starts
    /// the discovery poller, which connects to every broker advertising the
    /// topic.
    pub fn connect_to_lookup(&self, addr: &str) -> Result<()> {
        self.inner.connect_to_lookup(addr)
    }

    /// Begin a graceful shutdown: `CLS` every connection, then force-stop
    /// handlers after thirty seconds if the broker never drains. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Resolves once all handler workers have exited.
    pub async fn wait(&self) {
        let mut exited = self.inner.exited_tx.subscribe();
        loop {
            if *exited.borrow() {
                return;
            }
            if exited.changed().await.is_err() {
                return;
            }
        }
    }

    /// True once `stop()` has been called.
    pub fn is_stopping(&self) -> bool {
        self.inner.stop_flag.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn messages_received(&self) -> u64 {
        self.inner.messages_received.load(Ordering::SeqCst)
    }

    pub fn messages_finished(&self) -> u64 {
        self.inner.messages_finished.load(Ordering::SeqCst)
    }

    pub fn messages_requeued(&self) -> u64 {
        self.inner.messages_requeued.load(Ordering::SeqCst)
    }

    pub fn messages_in_flight(&self) -> i64 {
        self.inner.messages_in_flight.load(Ordering::SeqCst)
    }
}

async fn next_incoming(inner: &ReaderInner) -> IncomingMessage {
    loop {
        // the reader keeps a sender alive for the connections, so this only
        // yields messages; workers stop via the shutdown channel
        if let Some(incoming) = inner.incoming_rx.lock().await.recv().await {
            return incoming;
        }
    }
}

impl ReaderInner {
    /// Per-connection RDY budget: an even share of the global budget,
    /// floored at one so a small budget still makes progress everywhere.
    fn connection_max_in_flight(&self) -> i64 {
        let max = self.max_in_flight.load(Ordering::SeqCst);
        let connections = self.connections.len().max(1) as i64;
        (max / connections).clamp(1, max.max(1))
    }

    fn set_max_in_flight(self: &Arc<Self>, mut max_in_flight: i64) {
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        if max_in_flight > MAX_RDY_COUNT {
            warn!(
                requested = max_in_flight,
                ceiling = MAX_RDY_COUNT,
                "max_in_flight above protocol ceiling, truncating"
            );
            max_in_flight = MAX_RDY_COUNT;
        }
        if self.max_in_flight.swap(max_in_flight, Ordering::SeqCst) == max_in_flight {
            return;
        }

        if self.connections.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let conns: Vec<Arc<Connection>> = inner
                .connections
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for conn in conns {
                if !conn.is_stopping() {
                    // unconditional: the new budget must reach the broker
                    // even when the old credit is far from spent
                    inner.send_rdy(&conn).await;
                }
            }
        });
    }

    /// Refill a connection's credit when it is nearly spent: at one
    /// remaining, or below a quarter of its share, whichever comes first.
    async fn update_ready(self: &Arc<Self>, conn: &Arc<Connection>) {
        if conn.is_stopping() {
            return;
        }
        let remain = conn.rdy_count();
        let budget = self.connection_max_in_flight();
        if remain <= 1 || remain < budget / 4 {
            self.send_rdy(conn).await;
        }
    }

    async fn send_rdy(self: &Arc<Self>, conn: &Arc<Connection>) {
        let budget = self.connection_max_in_flight();
        trace!(addr = %conn.addr(), budget, remain = conn.rdy_count(), "sending RDY");
        conn.set_rdy_count(budget);
        if let Err(e) = conn.send_command(Command::Rdy(budget)).await {
            self.handle_error(conn, &format!("failed to send RDY: {}", e));
        }
    }

    /// Record a connection-fatal error. With no discovery configured and
    /// this being the last connection, the reader itself begins stopping.
    fn handle_error(&self, conn: &Arc<Connection>, message: &str) {
        warn!(addr = %conn.addr(), "{}", message);
        conn.set_stopping();
        if self.connections.len() == 1 && self.lookup_addrs.read().is_empty() {
            self.stop_flag.store(true, Ordering::SeqCst);
        }
    }

    async fn connect_to_broker(self: &Arc<Self>, addr: &str) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(DriftqClientError::Stopped);
        }
        if self.running_handlers.load(Ordering::SeqCst) == 0 {
            return Err(DriftqClientError::NoHandlers);
        }
        if self.connections.contains_key(addr) {
            return Err(DriftqClientError::AlreadyConnected);
        }

        info!(addr = %addr, "connecting to broker");
        let ConnectionParts {
            conn,
            frames,
            finished_rx,
        } = Connection::connect(addr, &self.config).await?;

        conn.send_command(Command::Sub {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
        })
        .await
        .map_err(|e| {
            DriftqClientError::connection(format!(
                "[{}] failed to subscribe to {}:{}: {}",
                addr, self.topic, self.channel, e
            ))
        })?;

        self.connections
            .insert(addr.to_string(), Arc::clone(&conn));

        tokio::spawn(read_loop(
            Arc::clone(self),
            Arc::clone(&conn),
            frames,
        ));
        tokio::spawn(finish_loop(Arc::clone(self), conn, finished_rx));
        Ok(())
    }

    fn connect_to_lookup(self: &Arc<Self>, addr: &str) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(DriftqClientError::Stopped);
        }

        let first = {
            let mut addrs = self.lookup_addrs.write();
            if addrs.iter().any(|a| a == addr) {
                return Err(DriftqClientError::LookupAddressExists);
            }
            addrs.push(addr.to_string());
            addrs.len() == 1
        };

        if first {
            if let Some(recheck_rx) = self.recheck_rx.lock().take() {
                tokio::spawn(lookup_loop(Arc::clone(self), recheck_rx));
            }
        }
        Ok(())
    }

    /// Query every directory for brokers carrying our topic and connect to
    /// any we do not already have. Failures are logged, never fatal.
    async fn query_lookup(self: &Arc<Self>) {
        let addrs = self.lookup_addrs.read().clone();
        let endpoints = match self
            .lookup_client
            .lookup_topic_producers(&addrs, &self.topic)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(error = %e, "lookup query failed");
                return;
            }
        };

        for endpoint in endpoints {
            match self.connect_to_broker(&endpoint).await {
                Ok(()) | Err(DriftqClientError::AlreadyConnected) => {}
                Err(e) => {
                    warn!(addr = %endpoint, error = %e, "failed to connect to discovered broker")
                }
            }
        }
    }

    async fn dispatch_sync<H: Handler>(&self, handler: &H, incoming: IncomingMessage) {
        let IncomingMessage { message, responder } = incoming;

        let result = handler.handle_message(&message).await;
        if let Err(e) = &result {
            warn!(id = %message.id, attempts = message.attempts, error = %e, "handler failed");
        }

        let max_attempts = self.config.max_attempt_count;
        if result.is_err() && max_attempts > 0 && message.attempts > max_attempts {
            warn!(id = %message.id, attempts = message.attempts, "giving up on message");
            handler.log_failed_message(&message);
            responder.finish(message.id).await;
            return;
        }

        if result.is_ok() {
            responder.finish(message.id).await;
            return;
        }

        // linear backoff, bounded
        let delay = self
            .config
            .default_requeue_delay
            .saturating_mul(u32::from(message.attempts))
            .min(self.config.max_requeue_delay);
        responder
            .requeue(message.id, delay.as_millis() as u64)
            .await;
    }

    async fn dispatch_async<H: AsyncHandler>(&self, handler: &H, incoming: IncomingMessage) {
        let IncomingMessage { message, responder } = incoming;

        // the attempt limit cannot be enforced after handing the message to
        // an async handler, so it is enforced before delivery
        let max_attempts = self.config.max_attempt_count;
        if max_attempts > 0 && message.attempts > max_attempts {
            warn!(id = %message.id, attempts = message.attempts, "giving up on message");
            handler.log_failed_message(&message);
            responder.finish(message.id).await;
            return;
        }

        handler.handle_message(message, responder).await;
    }

    /// Send a wire response for one finished message.
    async fn handle_finished(self: &Arc<Self>, conn: &Arc<Connection>, finished: FinishedMessage) {
        // decremented on receipt so the count stays right even when the
        // broker can no longer be reached
        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst);
        conn.decr_in_flight();

        if finished.success {
            trace!(addr = %conn.addr(), id = %finished.id, "finishing");
            if let Err(e) = conn.send_command(Command::Fin(finished.id)).await {
                warn!(addr = %conn.addr(), id = %finished.id, error = %e, "failed to FIN");
                self.teardown_connection(conn);
                return;
            }
            conn.incr_finished();
            self.messages_finished.fetch_add(1, Ordering::SeqCst);
        } else {
            trace!(addr = %conn.addr(), id = %finished.id, delay_ms = finished.requeue_delay_ms, "requeueing");
            if let Err(e) = conn
                .send_command(Command::Req {
                    id: finished.id,
                    delay_ms: finished.requeue_delay_ms,
                })
                .await
            {
                warn!(addr = %conn.addr(), id = %finished.id, error = %e, "failed to REQ");
                self.teardown_connection(conn);
                return;
            }
            conn.incr_requeued();
            self.messages_requeued.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Remove a connection from the map and decide what follows: stop the
    /// handlers if this was the last connection of a stopping reader, or
    /// nudge discovery so a replacement can be found.
    fn teardown_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        if !conn.mark_closed() {
            return;
        }
        debug!(addr = %conn.addr(), "tearing down connection");
        conn.set_stopping();
        conn.dying.notify_one();
        conn.shutdown_responses();
        self.connections.remove(conn.addr());

        let remaining = self.connections.len();
        info!(remaining, "connection closed");

        if remaining == 0 && self.stop_flag.load(Ordering::SeqCst) {
            self.stop_handlers();
        }
        if !self.lookup_addrs.read().is_empty() && !self.stop_flag.load(Ordering::SeqCst) {
            // non-blocking: a recheck is already queued if this is full
            let _ = self.recheck_tx.try_send(());
        }
    }

    fn stop(self: &Arc<Self>) {
        if self.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping reader");
        // send_replace stores the value even with no receiver yet
        self.stopping_tx.send_replace(true);

        if self.connections.is_empty() {
            self.stop_handlers();
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let conns: Vec<Arc<Connection>> = inner
                .connections
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for conn in conns {
                if let Err(e) = conn.send_command(Command::Cls).await {
                    warn!(addr = %conn.addr(), error = %e, "failed to start close");
                }
            }
            sleep(STOP_GRACE_PERIOD).await;
            inner.stop_handlers();
        });
    }

    fn stop_handlers(&self) {
        if self.handlers_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping handlers");
        let _ = self.shutdown_tx.send(());
        // a reader stopped before any handler registered still completes
        if self.running_handlers.load(Ordering::SeqCst) == 0 {
            self.exited_tx.send_replace(true);
        }
    }

    fn worker_exited(&self) {
        debug!("handler worker exiting");
        if self.running_handlers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.exited_tx.send_replace(true);
        }
    }
}

/// Per-connection read loop: frames in, messages to the incoming queue,
/// RDY refills and heartbeat NOPs out (through the writer task).
async fn read_loop(inner: Arc<ReaderInner>, conn: Arc<Connection>, mut frames: FrameStream) {
    // prime the credit so the broker starts delivering
    inner.update_ready(&conn).await;

    loop {
        if conn.is_stopping() || inner.stop_flag.load(Ordering::SeqCst) {
            if conn.in_flight() == 0 {
                inner.teardown_connection(&conn);
            } else {
                debug!(
                    addr = %conn.addr(),
                    in_flight = conn.in_flight(),
                    "delaying connection close; messages outstanding"
                );
            }
            debug!(addr = %conn.addr(), "read loop stopped");
            break;
        }

        let frame = match timeout(inner.config.read_timeout, frames.next()).await {
            Err(_) => {
                inner.handle_error(&conn, "read timed out");
                continue;
            }
            Ok(None) => {
                inner.handle_error(&conn, "connection closed by broker");
                continue;
            }
            Ok(Some(Err(e))) => {
                inner.handle_error(&conn, &format!("error reading frame: {}", e));
                continue;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Message(message) => {
                let Some(finished_tx) = conn.response_sender() else {
                    // teardown has begun; the broker redelivers after timeout
                    debug!(addr = %conn.addr(), id = %message.id, "dropping message during teardown");
                    continue;
                };
                let remain = conn.decrement_rdy();
                conn.incr_received();
                inner.messages_received.fetch_add(1, Ordering::SeqCst);
                conn.incr_in_flight();
                inner.messages_in_flight.fetch_add(1, Ordering::SeqCst);
                trace!(addr = %conn.addr(), id = %message.id, remain, "received message");

                let incoming = IncomingMessage {
                    message,
                    responder: Responder::new(finished_tx),
                };
                if inner.incoming_tx.send(incoming).await.is_err() {
                    break;
                }
            }
            Frame::Response(data) if data.as_ref() == CLOSE_WAIT => {
                // the broker ack'd our CLS; no more messages will arrive,
                // but responses for in-flight ones can still be written
                info!(addr = %conn.addr(), "received CLOSE_WAIT");
                conn.set_stopping();
            }
            frame if frame.is_heartbeat() => {
                debug!(addr = %conn.addr(), "heartbeat");
                if let Err(e) = conn.send_command(Command::Nop).await {
                    inner.handle_error(&conn, &format!("failed to answer heartbeat: {}", e));
                    continue;
                }
            }
            Frame::Response(data) => {
                debug!(addr = %conn.addr(), response = %String::from_utf8_lossy(&data), "response");
            }
            Frame::Error(data) => {
                warn!(addr = %conn.addr(), error = %String::from_utf8_lossy(&data), "broker error");
            }
        }

        inner.update_ready(&conn).await;
    }
}

/// Per-connection finish loop: the single consumer of the connection's
/// response channel, translating outcomes into FIN/REQ writes.
async fn finish_loop(
    inner: Arc<ReaderInner>,
    conn: Arc<Connection>,
    mut finished_rx: mpsc::Receiver<FinishedMessage>,
) {
    loop {
        tokio::select! {
            _ = conn.dying.notified() => {
                debug!(addr = %conn.addr(), "finish loop entering drain");
                break;
            }
            finished = finished_rx.recv() => {
                let Some(finished) = finished else {
                    debug!(addr = %conn.addr(), "finish loop stopped");
                    return;
                };
                inner.handle_finished(&conn, finished).await;
                if conn.in_flight() == 0
                    && (conn.is_stopping() || inner.stop_flag.load(Ordering::SeqCst))
                {
                    inner.teardown_connection(&conn);
                }
            }
        }
    }

    // teardown dropped the connection's own response sender, so this loop
    // ends exactly when every handler-held clone is gone: the channel is
    // observed empty with all producers quiesced
    while finished_rx.recv().await.is_some() {
        conn.decr_in_flight();
        inner.messages_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(addr = %conn.addr(), "finish loop drained");
}

/// Discovery poller: an immediate query, a jittered settle, then a steady
/// tick, with non-blocking rechecks whenever a connection closes.
async fn lookup_loop(inner: Arc<ReaderInner>, mut recheck_rx: mpsc::Receiver<()>) {
    let mut stopping = inner.stopping_tx.subscribe();
    if *stopping.borrow() {
        return;
    }

    inner.query_lookup().await;

    // jitter so restarted consumers don't stampede the directory
    let poll = inner.config.lookup_poll_interval;
    let jitter = poll.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
    tokio::select! {
        _ = sleep(jitter) => {}
        _ = stopping.changed() => return,
    }

    let mut ticker = interval(poll);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.query_lookup().await,
            recheck = recheck_rx.recv() => match recheck {
                Some(()) => inner.query_lookup().await,
                None => break,
            },
            _ = stopping.changed() => break,
        }
    }
    debug!("lookup loop exiting");
}
