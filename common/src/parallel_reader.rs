//! Ordered reads of a remote object through concurrent range requests
//!
//! A [`ParallelReader`] splits an object of known size into `part_size` parts and fetches
//! them with `parallelism` download workers. Parts complete in any order; the reader hands
//! bytes to its consumer strictly in offset order through [`tokio::io::AsyncRead`].
//!
//! ```text
//!  scheduler --part numbers--> workers (x parallelism) --fetched parts--> collector
//!                                                                           |
//!  consumer <--in-order bytes-- ParallelReader <--part map + waker----------+
//! ```
//!
//! The scheduler never runs more than [`ReaderConfig::read_ahead`] parts ahead of the
//! consumer, which bounds both the part map and the number of pooled buffers alive at once.
//!
//! All background tasks share one cancellation token, derived from the caller's token. It is
//! cancelled by [`ParallelReader::close`], by the caller, or as soon as any part fails to
//! download; the first failure is kept as the cause reported by every later read.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(client: std::sync::Arc<dyn common::client::StorageClient>) -> anyhow::Result<()> {
//! use tokio::io::AsyncReadExt;
//!
//! let token = tokio_util::sync::CancellationToken::new();
//! let config = common::ReaderConfig::new(8 * 1024 * 1024, 8);
//! let mut reader = common::ParallelReader::new(
//!     client,
//!     &token,
//!     1 << 30,
//!     config,
//!     common::client::GetOptions::default(),
//! )?;
//! reader.start()?;
//! let mut contents = Vec::new();
//! reader.read_to_end(&mut contents).await?;
//! reader.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::client::{ByteRange, GetOptions, StorageClient};
use crate::config::ReaderConfig;
use crate::pool::{BufferPool, PooledBuffer};
use crate::stats::{ReadStats, Summary};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch part {part}: {error:#}")]
    Fetch {
        part: u64,
        error: Arc<anyhow::Error>,
    },
    /// For excess bodies `actual` counts the bytes seen before the read was abandoned
    #[error("part {part} returned {actual} bytes, expected {expected}")]
    PartLength { part: u64, expected: u64, actual: u64 },
    #[error("failed reading body of part {part}: {source}")]
    Io {
        part: u64,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("read cancelled")]
    Cancelled,
    #[error("reader is closed")]
    Closed,
    #[error("reader was not started")]
    NotStarted,
    #[error("download stream ended at offset {offset} of {size}")]
    ShortRead { offset: u64, size: u64 },
    #[error("invalid reader configuration: {0}")]
    Config(String),
    #[error("reader must be started from within a tokio runtime")]
    Runtime,
}

impl Error {
    /// True if the read stopped because it was cancelled or closed rather than because data
    /// could not be fetched
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Closed)
    }

    fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            Error::PartLength {
                expected, actual, ..
            } if actual > expected => std::io::ErrorKind::InvalidData,
            Error::ShortRead { .. } | Error::PartLength { .. } => {
                std::io::ErrorKind::UnexpectedEof
            }
            _ => std::io::ErrorKind::Other,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        std::io::Error::new(error.io_kind(), error)
    }
}

/// Recovers the reader error carried by an I/O error returned through `AsyncRead`.
pub fn reader_error(error: &std::io::Error) -> Option<&Error> {
    error.get_ref()?.downcast_ref::<Error>()
}

struct PartData {
    part_num: u64,
    data: PooledBuffer,
}

#[derive(Default)]
struct PartBuffer {
    parts: HashMap<u64, PooledBuffer>,
    // single consumer, so one waker is enough
    waker: Option<Waker>,
}

struct Channels {
    requests: (async_channel::Sender<u64>, async_channel::Receiver<u64>),
    results: (mpsc::Sender<PartData>, mpsc::Receiver<PartData>),
}

// in join order; a handle leaves the list only once its task has been joined
type Tasks = Arc<tokio::sync::Mutex<VecDeque<(&'static str, JoinHandle<()>)>>>;

enum Lifecycle {
    Unstarted(Channels),
    Running(Tasks),
    Closed,
}

struct Shared {
    client: Arc<dyn StorageClient>,
    opts: GetOptions,
    size: u64,
    total_parts: u64,
    config: ReaderConfig,
    token: CancellationToken,
    cause: OnceLock<Error>,
    started: AtomicBool,
    closed: AtomicBool,
    buffer: Mutex<PartBuffer>,
    // next part the consumer waits for; gates the scheduler
    progress: tokio::sync::watch::Sender<u64>,
    lifecycle: Mutex<Lifecycle>,
    teardown: tokio::sync::OnceCell<()>,
    pool: BufferPool,
    stats: ReadStats,
}

impl Shared {
    fn lock_buffer(&self) -> MutexGuard<'_, PartBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn part_range(&self, part_num: u64) -> (ByteRange, u64) {
        let start = part_num * self.config.part_size;
        let end = (start + self.config.part_size).min(self.size) - 1;
        (ByteRange::new(start, end), end - start + 1)
    }

    fn insert_part(&self, part: PartData) {
        let waker = {
            let mut buffer = self.lock_buffer();
            buffer.parts.insert(part.part_num, part.data);
            buffer.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake_reader(&self) {
        let waker = self.lock_buffer().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    // cause is recorded before cancelling so anyone observing the cancellation sees it
    fn fail(&self, error: Error) {
        if self.cause.set(error).is_ok() {
            tracing::debug!("reader cancelled itself after a failed part");
        }
        self.token.cancel();
    }

    fn cancellation_error(&self) -> Error {
        self.cause.get().cloned().unwrap_or(Error::Cancelled)
    }

    async fn close(&self) {
        self.teardown.get_or_init(|| self.teardown_tasks()).await;
    }

    #[instrument(skip(self), fields(size = self.size, parts = self.total_parts))]
    async fn teardown_tasks(&self) {
        self.closed.store(true, Ordering::Release);
        // keeps an earlier failure as the cause
        let _ = self.cause.set(Error::Closed);
        self.token.cancel();
        let running = match &*self.lock_lifecycle() {
            Lifecycle::Running(tasks) => Some(tasks.clone()),
            _ => None,
        };
        if let Some(tasks) = running {
            // a close abandoned mid-way leaves the unjoined tasks for the next one
            let mut tasks = tasks.lock().await;
            // all result senders are gone once the workers exit, so the collector drains
            // what is left and stops
            while let Some((name, handle)) = tasks.front_mut() {
                join_task(*name, handle).await;
                tasks.pop_front();
            }
        }
        *self.lock_lifecycle() = Lifecycle::Closed;
        let (parts, waker) = {
            let mut buffer = self.lock_buffer();
            (std::mem::take(&mut buffer.parts), buffer.waker.take())
        };
        tracing::debug!("released {} buffered parts", parts.len());
        drop(parts);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

async fn join_task(name: &str, handle: &mut JoinHandle<()>) {
    if let Err(error) = handle.await {
        tracing::warn!("{name} task failed during teardown: {error}");
    }
}

async fn schedule_requests(shared: Arc<Shared>, requests: async_channel::Sender<u64>) {
    let read_ahead = shared.config.read_ahead() as u64;
    let mut progress = shared.progress.subscribe();
    for part_num in 0..shared.total_parts {
        loop {
            let next_part = *progress.borrow_and_update();
            if part_num < next_part + read_ahead {
                break;
            }
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return,
                changed = progress.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => return,
            sent = requests.send(part_num) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        tracing::trace!("scheduled part {part_num}");
    }
    // dropping the sender closes the request channel
}

async fn download_worker(
    shared: Arc<Shared>,
    worker_id: usize,
    requests: async_channel::Receiver<u64>,
    results: mpsc::Sender<PartData>,
) {
    loop {
        let part_num = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            part_num = requests.recv() => match part_num {
                Ok(part_num) => part_num,
                Err(_) => break,
            },
        };
        // a cancelled download drops its stream and buffer with the future
        let result = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            result = download_part(&shared, part_num) => result,
        };
        let data = match result {
            Ok(data) => data,
            Err(error) => {
                shared.stats.parts_failed.inc();
                tracing::error!("worker {worker_id}: {error}");
                // fatal to the whole read, even if the consumer is still waiting on an
                // earlier part
                shared.fail(error);
                break;
            }
        };
        // an abandoned send drops the part, which returns its buffer to the pool
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            sent = results.send(PartData { part_num, data }) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::trace!("download worker {worker_id} done");
}

#[instrument(level = "trace", skip(shared))]
async fn download_part(shared: &Shared, part_num: u64) -> Result<PooledBuffer, Error> {
    let (range, length) = shared.part_range(part_num);
    throttle::get_request_token().await;
    let _stream_permit = throttle::open_stream_permit().await;
    shared.stats.parts_requested.inc();
    let (mut stream, _info) = shared
        .client
        .get(&shared.opts.with_range(range))
        .await
        .map_err(|error| Error::Fetch {
            part: part_num,
            error: Arc::new(error),
        })?;
    throttle::get_part_iops_tokens(shared.config.chunk_size, length).await;
    let io_error = |source| Error::Io {
        part: part_num,
        source: Arc::new(source),
    };
    let mut buffer = shared.pool.get();
    buffer.resize(length as usize, 0);
    let mut filled = 0;
    while filled < buffer.len() {
        let n = stream.read(&mut buffer[filled..]).await.map_err(io_error)?;
        if n == 0 {
            return Err(Error::PartLength {
                part: part_num,
                expected: length,
                actual: filled as u64,
            });
        }
        filled += n;
    }
    // end-of-stream must come exactly at the end of the range
    let mut probe = [0u8; 1];
    let extra = stream.read(&mut probe).await.map_err(io_error)?;
    if extra > 0 {
        return Err(Error::PartLength {
            part: part_num,
            expected: length,
            actual: length + extra as u64,
        });
    }
    shared.stats.parts_fetched.inc();
    shared.stats.bytes_fetched.add(length);
    tracing::debug!("fetched part {part_num} ({})", range.header_value());
    Ok(buffer)
}

async fn collect_results(shared: Arc<Shared>, mut results: mpsc::Receiver<PartData>) {
    let mut cancel_seen = false;
    loop {
        tokio::select! {
            part = results.recv() => match part {
                Some(part) => shared.insert_part(part),
                None => break,
            },
            _ = shared.token.cancelled(), if !cancel_seen => {
                cancel_seen = true;
                shared.wake_reader();
            }
        }
    }
    // a read may be parked while teardown closes the result channel
    shared.wake_reader();
    tracing::trace!("collector done");
}

/// Reads an object of known size as one ordered byte stream, fetching parts concurrently.
///
/// Lifecycle: [`new`](Self::new) (no I/O) → [`start`](Self::start) → reads →
/// [`close`](Self::close). Reading before `start` fails with [`Error::NotStarted`], reading
/// after `close` fails with [`Error::Closed`]. Reads assume a single consumer.
pub struct ParallelReader {
    shared: Arc<Shared>,
    current: Option<PooledBuffer>,
    current_index: usize,
    next_part: u64,
    read_offset: u64,
}

impl ParallelReader {
    /// Prepares a reader for `size` bytes of the object `client` serves. `opts` are forwarded
    /// with every range request; their own `range` is replaced per part.
    pub fn new(
        client: Arc<dyn StorageClient>,
        parent: &CancellationToken,
        size: u64,
        config: ReaderConfig,
        opts: GetOptions,
    ) -> Result<Self, Error> {
        config.validate().map_err(Error::Config)?;
        let buffer_size = usize::try_from(config.part_size.min(size))
            .map_err(|_| Error::Config(format!("part_size {} is too large", config.part_size)))?;
        let capacity = config.channel_capacity();
        let channels = Channels {
            requests: async_channel::bounded(capacity),
            results: mpsc::channel(capacity),
        };
        let (progress, _) = tokio::sync::watch::channel(0);
        let shared = Shared {
            client,
            opts,
            size,
            total_parts: config.total_parts(size),
            config,
            token: parent.child_token(),
            cause: OnceLock::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            buffer: Mutex::new(PartBuffer::default()),
            progress,
            lifecycle: Mutex::new(Lifecycle::Unstarted(channels)),
            teardown: tokio::sync::OnceCell::new(),
            pool: BufferPool::new(buffer_size, config.read_ahead() + 1),
            stats: ReadStats::new(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            current: None,
            current_index: 0,
            next_part: 0,
            read_offset: 0,
        })
    }

    /// Spawns the scheduler, the download workers and the collector on the current runtime.
    /// Calling it again, or after `close`, does nothing.
    #[instrument(skip(self), fields(size = self.shared.size, parts = self.shared.total_parts))]
    pub fn start(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let mut lifecycle = shared.lock_lifecycle();
        let channels = match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Unstarted(channels) => channels,
            other => {
                *lifecycle = other;
                return Ok(());
            }
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                *lifecycle = Lifecycle::Unstarted(channels);
                return Err(Error::Runtime);
            }
        };
        let Channels {
            requests: (request_tx, request_rx),
            results: (result_tx, result_rx),
        } = channels;
        let mut tasks: VecDeque<_> = (0..shared.config.parallelism)
            .map(|worker_id| {
                let worker = runtime.spawn(
                    download_worker(
                        shared.clone(),
                        worker_id,
                        request_rx.clone(),
                        result_tx.clone(),
                    )
                    .in_current_span(),
                );
                ("download worker", worker)
            })
            .collect();
        let scheduler = runtime.spawn(schedule_requests(shared.clone(), request_tx).in_current_span());
        let collector = runtime.spawn(collect_results(shared.clone(), result_rx).in_current_span());
        tasks.push_back(("scheduler", scheduler));
        tasks.push_back(("collector", collector));
        shared.started.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running(Arc::new(tokio::sync::Mutex::new(tasks)));
        tracing::debug!("started {} download workers", shared.config.parallelism);
        Ok(())
    }

    /// Cancels outstanding work, waits for every background task to exit and returns all
    /// buffered parts to the pool. Safe to call any number of times.
    pub async fn close(&mut self) {
        self.shared.close().await;
        self.current = None;
        self.current_index = 0;
    }

    /// Reads up to `buf.len()` bytes, returning 0 at the end of the object.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        std::future::poll_fn(|cx| self.poll_fill(cx, buf)).await
    }

    /// A handle that can close or cancel this reader from another task
    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn size(&self) -> u64 {
        self.shared.size
    }

    pub fn total_parts(&self) -> u64 {
        self.shared.total_parts
    }

    /// Bytes delivered to the consumer so far
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Summary {
        self.shared.stats.snapshot()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    fn copy_current(&mut self, buf: &mut [u8]) -> usize {
        let Some(current) = self.current.as_ref() else {
            return 0;
        };
        let remaining = &current[self.current_index..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        let consumed = self.current_index + n >= current.len();
        self.current_index += n;
        self.read_offset += n as u64;
        self.shared.stats.bytes_delivered.add(n as u64);
        if consumed {
            // back to the pool
            self.current = None;
            self.current_index = 0;
        }
        n
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        if self.shared.closed.load(Ordering::Acquire) {
            self.current = None;
            return Poll::Ready(Err(Error::Closed));
        }
        if !self.shared.started.load(Ordering::Acquire) {
            return Poll::Ready(Err(Error::NotStarted));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.shared.token.is_cancelled() {
            self.current = None;
            return Poll::Ready(Err(self.shared.cancellation_error()));
        }
        if self.current.is_some() {
            return Poll::Ready(Ok(self.copy_current(buf)));
        }
        let data = {
            let mut buffer = self.shared.lock_buffer();
            if self.next_part >= self.shared.total_parts {
                drop(buffer);
                if self.read_offset == self.shared.size {
                    return Poll::Ready(Ok(0));
                }
                return Poll::Ready(Err(Error::ShortRead {
                    offset: self.read_offset,
                    size: self.shared.size,
                }));
            }
            match buffer.parts.remove(&self.next_part) {
                Some(data) => data,
                None => {
                    buffer.waker = Some(cx.waker().clone());
                    // the collector wakes us after cancelling, but only if the waker was
                    // registered first
                    if self.shared.token.is_cancelled() {
                        buffer.waker = None;
                        drop(buffer);
                        return Poll::Ready(Err(self.shared.cancellation_error()));
                    }
                    return Poll::Pending;
                }
            }
        };
        self.next_part += 1;
        self.shared.progress.send_replace(self.next_part);
        self.current = Some(data);
        self.current_index = 0;
        Poll::Ready(Ok(self.copy_current(buf)))
    }
}

impl AsyncRead for ParallelReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_fill(cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ParallelReader {
    fn drop(&mut self) {
        // background tasks exit on their own once cancelled
        self.shared.token.cancel();
    }
}

/// Cloneable control handle for a [`ParallelReader`] consumed elsewhere
#[derive(Clone)]
pub struct ReaderHandle {
    shared: Arc<Shared>,
}

impl ReaderHandle {
    /// Same as [`ParallelReader::close`]; concurrent callers wait for the first teardown.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Cancels the read; pending and later reads fail with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Summary {
        self.shared.stats.snapshot()
    }
}
