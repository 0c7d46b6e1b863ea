//! Storage client capability consumed by the parallel reader

use std::collections::BTreeMap;

/// Type alias for a boxed object body stream
pub type BoxedRead = Box<dyn tokio::io::AsyncRead + Unpin + Send>;

/// Byte range of an object, `end` is inclusive; `None` reads to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes this range covers within an object of `size` bytes, `None` if the
    /// range does not start inside the object or ends before it starts.
    pub fn len_within(&self, size: u64) -> Option<u64> {
        if self.start >= size {
            return None;
        }
        let end = self.end.map_or(size - 1, |end| end.min(size - 1));
        if end < self.start {
            return None;
        }
        Some(end - self.start + 1)
    }

    /// Value for the HTTP `Range` request header
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Options forwarded with every GET request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub version_id: Option<String>,
    pub range: Option<ByteRange>,
    /// Fetch a single part of a multipart object
    pub part_number: Option<u32>,
    /// Server-side encryption key identifier
    pub sse_key_id: Option<String>,
    /// Extra request headers, passed through verbatim
    pub headers: BTreeMap<String, String>,
}

impl GetOptions {
    pub fn with_range(&self, range: ByteRange) -> Self {
        Self {
            range: Some(range),
            ..self.clone()
        }
    }
}

/// Object metadata returned alongside a body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// Fetches (ranges of) an object from remote storage.
///
/// Cancellation is delivered by dropping the returned future; implementations must not rely
/// on being polled to completion. Requests whose range starts at or past the end of the
/// object must fail.
#[async_trait::async_trait]
pub trait StorageClient: Send + Sync {
    async fn get(&self, opts: &GetOptions) -> anyhow::Result<(BoxedRead, ObjectInfo)>;
}

#[async_trait::async_trait]
impl<T: StorageClient + ?Sized> StorageClient for std::sync::Arc<T> {
    async fn get(&self, opts: &GetOptions) -> anyhow::Result<(BoxedRead, ObjectInfo)> {
        (**self).get(opts).await
    }
}
