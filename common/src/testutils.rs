//! In-memory storage clients for exercising readers without a network

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use tokio::io::AsyncRead;

use crate::client::{BoxedRead, GetOptions, ObjectInfo, StorageClient};

/// How the body of a faulty request misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFault {
    /// body is this many bytes shorter than the requested range
    Short(usize),
    /// body runs this many bytes past the requested range
    Long(usize),
    /// body yields half of the range, then an I/O error
    IoError,
}

/// Serves a byte vector as an object, recording every request it sees.
#[derive(Debug)]
pub struct MemoryClient {
    data: Arc<Vec<u8>>,
    requests: Mutex<Vec<GetOptions>>,
    request_count: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
    fail_on_request: Option<usize>,
    stall_on_request: Option<usize>,
    body_fault: Option<(usize, BodyFault)>,
    jitter: Option<std::time::Duration>,
}

impl MemoryClient {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
            requests: Mutex::new(Vec::new()),
            request_count: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            fail_on_request: None,
            stall_on_request: None,
            body_fault: None,
            jitter: None,
        }
    }

    /// Fails the n-th request (1-based) with an error
    pub fn fail_on_request(mut self, n: usize) -> Self {
        self.fail_on_request = Some(n);
        self
    }

    /// Never answers the n-th request (1-based) or any request after it
    pub fn stall_on_request(mut self, n: usize) -> Self {
        self.stall_on_request = Some(n);
        self
    }

    /// Returns a misbehaving body for the n-th request (1-based)
    pub fn body_fault_on_request(mut self, n: usize, fault: BodyFault) -> Self {
        self.body_fault = Some((n, fault));
        self
    }

    /// Delays each response by a deterministic pseudo-random amount up to `max`, so parts
    /// complete out of order
    pub fn with_jitter(mut self, max: std::time::Duration) -> Self {
        self.jitter = Some(max);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn requests(&self) -> Vec<GetOptions> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    /// Bodies handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    fn delay_for(&self, start: u64) -> Option<std::time::Duration> {
        let max = self.jitter?;
        let max_micros = max.as_micros().max(1) as u64;
        let spread = start.wrapping_mul(2_654_435_761).rotate_left(17) % max_micros;
        Some(std::time::Duration::from_micros(spread))
    }
}

#[async_trait::async_trait]
impl StorageClient for MemoryClient {
    async fn get(&self, opts: &GetOptions) -> anyhow::Result<(BoxedRead, ObjectInfo)> {
        let request = self.request_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(opts.clone());
        if self.stall_on_request.is_some_and(|n| request >= n) {
            std::future::pending::<()>().await;
        }
        if self.fail_on_request == Some(request) {
            return Err(anyhow!("injected failure on request {request}"));
        }
        let size = self.data.len() as u64;
        let range = opts
            .range
            .unwrap_or(crate::client::ByteRange::from_offset(0));
        let len = range
            .len_within(size)
            .ok_or_else(|| anyhow!("range start {} exceeds size {}", range.start, size))?;
        if let Some(delay) = self.delay_for(range.start) {
            tokio::time::sleep(delay).await;
        }
        let start = range.start as usize;
        let mut end = start + len as usize;
        let mut fault_at = None;
        match self.body_fault {
            Some((n, BodyFault::Short(by))) if n == request => {
                end = end.saturating_sub(by).max(start);
            }
            Some((n, BodyFault::Long(by))) if n == request => {
                end = (end + by).min(self.data.len());
            }
            Some((n, BodyFault::IoError)) if n == request => {
                fault_at = Some(start + (end - start) / 2);
            }
            _ => {}
        }
        let body = TrackedBody::new(
            self.data[start..fault_at.unwrap_or(end)].to_vec(),
            fault_at.is_some(),
            self.open_streams.clone(),
        );
        let info = ObjectInfo {
            size,
            ..Default::default()
        };
        Ok((Box::new(body), info))
    }
}

/// Body stream that counts itself in `open` while alive
struct TrackedBody {
    inner: std::io::Cursor<Vec<u8>>,
    fail_at_end: bool,
    open: Arc<AtomicUsize>,
}

impl TrackedBody {
    fn new(data: Vec<u8>, fail_at_end: bool, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: std::io::Cursor::new(data),
            fail_at_end,
            open,
        }
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AsyncRead for TrackedBody {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let exhausted = self.inner.position() >= self.inner.get_ref().len() as u64;
        if exhausted && self.fail_at_end {
            return std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Generates `size` bytes of a repeating, position-dependent pattern
pub fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
