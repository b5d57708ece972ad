//! # Driftq Storage Module
//!
//! [`DiskQueue`] is a durable single-producer/single-consumer FIFO backed by a
//! sequence of append-only segment files. It provides at-least-once delivery
//! across restarts with a bounded memory footprint: only one message is ever
//! held in memory ahead of the consumer.
//!
//! ## Architecture
//!
//! All positional state (read/write segment numbers and byte offsets) is owned
//! by a single driver task; the public handle communicates with it over
//! channels. One loop iteration services exactly one of:
//!
//! - a write request (append one record to the current write segment)
//! - an empty request (discard all pending data)
//! - a consumer ready to take the next pre-read message
//! - the exit signal
//!
//! Because the handoff to the consumer is the commit point, the driver reads
//! ahead into speculative `next_read_*` positions and only publishes them once
//! the message has actually been handed over. A message that was pre-read but
//! never taken is re-read after a restart.
//!
//! ## On-disk format
//!
//! Segment files are named `<name>.diskqueue.NNNNNN.dat` and contain
//! `[u32 big-endian length][payload]` records. Metadata lives in
//! `<name>.diskqueue.meta.dat` as three lines of text
//! (`depth`, `readFileNum,readPos`, `writeFileNum,writePos`) and is replaced
//! atomically via a `.tmp` file and rename.


use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::{DriftqError, Result};

type WriteRequest = (Bytes, oneshot::Sender<Result<()>>);
type EmptyRequest = oneshot::Sender<Result<()>>;
type NextRequest = oneshot::Sender<Bytes>;

/// A durable filesystem-backed FIFO queue.
///
/// The handle is the single producer and single consumer; the actual file
/// work happens on a driver task spawned by [`DiskQueue::new`], which must
/// therefore be called from within a tokio runtime.
#[derive(Debug)]
pub struct DiskQueue {
    name: String,
    depth: Arc<AtomicI64>,
    exiting: Arc<AtomicBool>,
    write_tx: mpsc::Sender<WriteRequest>,
    empty_tx: mpsc::Sender<EmptyRequest>,
    next_tx: mpsc::Sender<NextRequest>,
    exit_tx: Option<oneshot::Sender<()>>,
    exit_done_rx: Option<oneshot::Receiver<Result<()>>>,
}

impl DiskQueue {
    /// Open (or create) the queue named `name` under `data_path`, restoring
    /// any persisted position metadata, and start the driver task.
    ///
    /// A missing metadata file means an empty queue; an unparseable one is an
    /// error.
    pub fn new(
        name: impl Into<String>,
        data_path: impl AsRef<Path>,
        max_bytes_per_file: u64,
        sync_every: u64,
    ) -> Result<Self> {
        let name = name.into();
        let depth = Arc::new(AtomicI64::new(0));

        let mut driver = Driver {
            name: name.clone(),
            data_path: data_path.as_ref().to_path_buf(),
            max_bytes_per_file,
            sync_every: sync_every.max(1),
            depth: Arc::clone(&depth),
            read_pos: 0,
            write_pos: 0,
            read_file_num: 0,
            write_file_num: 0,
            next_read_pos: 0,
            next_read_file_num: 0,
            read_file: None,
            write_file: None,
            write_buf: BytesMut::new(),
        };
        driver.retrieve_metadata()?;

        info!(
            name = %driver.name,
            depth = depth.load(Ordering::SeqCst),
            read_file = driver.read_file_num,
            read_pos = driver.read_pos,
            write_file = driver.write_file_num,
            write_pos = driver.write_pos,
            "disk queue opened"
        );

        let (write_tx, write_rx) = mpsc::channel(1);
        let (empty_tx, empty_rx) = mpsc::channel(1);
        let (next_tx, next_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (exit_done_tx, exit_done_rx) = oneshot::channel();

        tokio::spawn(driver.io_loop(next_rx, write_rx, empty_rx, exit_rx, exit_done_tx));

        Ok(Self {
            name,
            depth,
            exiting: Arc::new(AtomicBool::new(false)),
            write_tx,
            empty_tx,
            next_tx,
            exit_tx: Some(exit_tx),
            exit_done_rx: Some(exit_done_rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages written but not yet handed to the consumer.
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Append one record to the queue.
    ///
    /// The write channel holds a single request, so a second concurrent
    /// `put` blocks until the driver has durably accepted the first.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        if self.exiting.load(Ordering::SeqCst) {
            return Err(DriftqError::Exiting);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send((data, reply_tx))
            .await
            .map_err(|_| DriftqError::Exiting)?;
        reply_rx.await.map_err(|_| DriftqError::Exiting)?
    }

    /// Receive the next message in FIFO order, waiting until one is written
    /// if the queue is currently empty.
    ///
    /// Returns `None` once the queue has been closed and the driver has
    /// exited. The handoff is the commit point: a message is considered
    /// consumed only when it is actually returned here, so a pre-read record
    /// that was never received is delivered again after a restart.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.next_tx.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }

    /// Destructively discard all pending data, removing intermediate segment
    /// files and fast-forwarding read positions to the write positions.
    pub async fn empty(&self) -> Result<()> {
        if self.exiting.load(Ordering::SeqCst) {
            return Err(DriftqError::Exiting);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.empty_tx
            .send(reply_tx)
            .await
            .map_err(|_| DriftqError::Exiting)?;
        reply_rx.await.map_err(|_| DriftqError::Exiting)?
    }

    /// Stop the driver, fsync outstanding writes, and persist metadata.
    /// Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.name, "disk queue closing");

        let Some(exit_tx) = self.exit_tx.take() else {
            return Ok(());
        };
        // the driver may already be gone if the runtime is shutting down
        let _ = exit_tx.send(());
        match self.exit_done_rx.take() {
            Some(done) => done.await.map_err(|_| DriftqError::Exiting)?,
            None => Ok(()),
        }
    }
}

/// Exclusive owner of the queue's positional state and open files.
struct Driver {
    name: String,
    data_path: PathBuf,
    max_bytes_per_file: u64,
    sync_every: u64,
    depth: Arc<AtomicI64>,

    read_pos: u64,
    write_pos: u64,
    read_file_num: u64,
    write_file_num: u64,

    // where the pre-read message ends; published to read_pos/read_file_num
    // only after a successful handoff
    next_read_pos: u64,
    next_read_file_num: u64,

    read_file: Option<BufReader<File>>,
    write_file: Option<File>,
    write_buf: BytesMut,
}

impl Driver {
    async fn io_loop(
        mut self,
        mut next_rx: mpsc::Receiver<NextRequest>,
        mut write_rx: mpsc::Receiver<WriteRequest>,
        mut empty_rx: mpsc::Receiver<EmptyRequest>,
        mut exit_rx: oneshot::Receiver<()>,
        exit_done_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut iterations: u64 = 0;
        let mut pending: Option<Bytes> = None;
        let mut waiting: Option<NextRequest> = None;

        loop {
            iterations += 1;
            if iterations == self.sync_every {
                if let Err(e) = self.sync() {
                    error!(name = %self.name, error = %e, "periodic sync failed");
                }
                iterations = 0;
            }

            if pending.is_none() && self.has_data() {
                match self.read_one() {
                    Ok(data) => pending = Some(data),
                    Err(e) => {
                        // read errors are assumed recoverable; an actual
                        // corruption will spin here (see module docs)
                        error!(
                            name = %self.name,
                            file = %self.file_name(self.read_file_num).display(),
                            pos = self.read_pos,
                            error = %e,
                            "segment read failed, retrying"
                        );
                        tokio::task::yield_now().await;
                        continue;
                    }
                }
            }

            // rendezvous: hand the pre-read message to a waiting consumer;
            // positions advance only once the handoff is known to have landed
            if pending.is_some() && waiting.is_some() {
                if let (Some(reply_tx), Some(data)) = (waiting.take(), pending.take()) {
                    match reply_tx.send(data) {
                        Ok(()) => self.advance_read(),
                        // consumer gave up on this recv; keep the message
                        Err(data) => pending = Some(data),
                    }
                }
                continue;
            }

            tokio::select! {
                request = next_rx.recv(), if waiting.is_none() => match request {
                    Some(reply_tx) => waiting = Some(reply_tx),
                    // consumer handle dropped
                    None => break,
                },
                request = write_rx.recv() => match request {
                    Some((data, reply_tx)) => {
                        let _ = reply_tx.send(self.write_one(&data));
                    }
                    None => break,
                },
                request = empty_rx.recv() => {
                    if let Some(reply_tx) = request {
                        pending = None;
                        let _ = reply_tx.send(self.do_empty());
                    }
                }
                _ = &mut exit_rx => break,
            }
        }

        debug!(name = %self.name, "io loop exiting");
        let result = self.teardown();
        let _ = exit_done_tx.send(result);
    }

    fn has_data(&self) -> bool {
        self.read_file_num < self.write_file_num || self.read_pos < self.write_pos
    }

    /// Read the next record off disk, advancing only the speculative
    /// positions and rolling the read segment if the record crossed the
    /// per-file boundary.
    fn read_one(&mut self) -> Result<Bytes> {
        if self.read_file.is_none() {
            let path = self.file_name(self.read_file_num);
            let mut file = File::open(&path)?;
            debug!(name = %self.name, file = %path.display(), "opened segment for reading");
            if self.read_pos > 0 {
                file.seek(SeekFrom::Start(self.read_pos))?;
            }
            self.read_file = Some(BufReader::new(file));
        }

        let body = match self.read_record() {
            Ok(body) => body,
            Err(e) => {
                // a partial read leaves the reader position undefined
                self.read_file = None;
                return Err(e);
            }
        };

        self.next_read_pos = self.read_pos + 4 + body.len() as u64;
        self.next_read_file_num = self.read_file_num;

        if self.next_read_pos > self.max_bytes_per_file {
            self.read_file = None;
            self.next_read_file_num += 1;
            self.next_read_pos = 0;
        }

        Ok(Bytes::from(body))
    }

    fn read_record(&mut self) -> Result<Vec<u8>> {
        let reader = self.read_file.as_mut().ok_or_else(|| {
            DriftqError::Storage(io::Error::new(io::ErrorKind::Other, "read segment not open"))
        })?;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf)?;
        let msg_size = u32::from_be_bytes(size_buf);

        let mut body = vec![0u8; msg_size as usize];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    /// Publish the speculative read position after a successful handoff and
    /// delete the previous segment once it is fully consumed.
    fn advance_read(&mut self) {
        let old_read_file_num = self.read_file_num;
        self.read_file_num = self.next_read_file_num;
        self.read_pos = self.next_read_pos;
        self.depth.fetch_sub(1, Ordering::SeqCst);

        if old_read_file_num != self.next_read_file_num {
            // the old segment may only be removed once metadata no longer
            // references it
            if let Err(e) = self.sync() {
                error!(name = %self.name, error = %e, "sync before segment removal failed");
                return;
            }
            let path = self.file_name(old_read_file_num);
            if let Err(e) = fs::remove_file(&path) {
                error!(name = %self.name, file = %path.display(), error = %e, "failed to remove consumed segment");
            }
        }
    }

    /// Append one record to the current write segment, rolling to the next
    /// segment when the file exceeds `max_bytes_per_file`.
    fn write_one(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            DriftqError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record exceeds u32::MAX bytes",
            ))
        })?;

        if self.write_file.is_none() {
            let path = self.file_name(self.write_file_num);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            debug!(name = %self.name, file = %path.display(), "opened segment for writing");
            if self.write_pos > 0 {
                file.seek(SeekFrom::Start(self.write_pos))?;
            }
            self.write_file = Some(file);
        }

        self.write_buf.clear();
        self.write_buf.put_u32(len);
        self.write_buf.put_slice(data);

        let written = match self.write_file.as_mut() {
            Some(file) => file.write_all(&self.write_buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "write segment not open")),
        };
        if let Err(e) = written {
            self.write_file = None;
            return Err(e.into());
        }

        self.write_pos += 4 + u64::from(len);
        self.depth.fetch_add(1, Ordering::SeqCst);

        if self.write_pos > self.max_bytes_per_file {
            self.write_file_num += 1;
            self.write_pos = 0;

            // sync every time we roll to a new segment
            if let Err(e) = self.sync() {
                error!(name = %self.name, error = %e, "sync at segment roll failed");
            }
            self.write_file = None;
        }

        Ok(())
    }

    /// Fast-forward read positions to the write positions and remove the
    /// intermediate segment files.
    fn do_empty(&mut self) -> Result<()> {
        info!(name = %self.name, "emptying");

        self.read_file = None;
        let files_to_remove: Vec<u64> = (self.read_file_num..self.write_file_num).collect();

        self.read_file_num = self.write_file_num;
        self.read_pos = self.write_pos;
        self.next_read_file_num = self.write_file_num;
        self.next_read_pos = self.write_pos;
        self.depth.store(0, Ordering::SeqCst);

        self.sync()?;

        // only after metadata is durably past them may the files go
        for num in files_to_remove {
            fs::remove_file(self.file_name(num))?;
        }
        Ok(())
    }

    /// Fsync the current write segment and persist metadata.
    fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.write_file.as_mut() {
            if let Err(e) = file.sync_all() {
                self.write_file = None;
                return Err(e.into());
            }
        }
        self.persist_metadata()
    }

    fn retrieve_metadata(&mut self) -> Result<()> {
        let path = self.metadata_file_name();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let malformed = || {
            DriftqError::Storage(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed metadata file {}", path.display()),
            ))
        };

        let mut lines = contents.lines();
        let depth: i64 = lines
            .next()
            .and_then(|line| line.parse().ok())
            .ok_or_else(malformed)?;
        let (read_file_num, read_pos) = parse_position(lines.next()).ok_or_else(malformed)?;
        let (write_file_num, write_pos) = parse_position(lines.next()).ok_or_else(malformed)?;

        self.depth.store(depth, Ordering::SeqCst);
        self.read_file_num = read_file_num;
        self.read_pos = read_pos;
        self.write_file_num = write_file_num;
        self.write_pos = write_pos;
        self.next_read_file_num = read_file_num;
        self.next_read_pos = read_pos;
        Ok(())
    }

    /// Atomically replace the metadata file via write-to-temp + rename.
    fn persist_metadata(&self) -> Result<()> {
        let path = self.metadata_file_name();
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));

        let mut file = File::create(&tmp_path)?;
        write!(
            file,
            "{}\n{},{}\n{},{}\n",
            self.depth.load(Ordering::SeqCst),
            self.read_file_num,
            self.read_pos,
            self.write_file_num,
            self.write_pos,
        )?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Final sync and file release; runs on the driver as it exits.
    fn teardown(&mut self) -> Result<()> {
        self.read_file = None;
        let result = self.sync();
        self.write_file = None;
        result
    }

    fn file_name(&self, file_num: u64) -> PathBuf {
        self.data_path
            .join(format!("{}.diskqueue.{:06}.dat", self.name, file_num))
    }

    fn metadata_file_name(&self) -> PathBuf {
        self.data_path
            .join(format!("{}.diskqueue.meta.dat", self.name))
    }
}

fn parse_position(line: Option<&str>) -> Option<(u64, u64)> {
    let (file_num, pos) = line?.split_once(',')?;
    Some((file_num.parse().ok()?, pos.parse().ok()?))
}
