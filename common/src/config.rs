//! Configuration types for parallel range reads and request throttling

/// Upper bound on download workers per reader
pub const MAX_PARALLELISM: usize = 1024;
/// Upper bound on queued requests/results per worker
pub const MAX_QUEUE_DEPTH: usize = 64;

/// Shape of a parallel read: how an object is split and how many parts are in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Bytes per part (every part but the last has exactly this length)
    pub part_size: u64,
    /// Number of concurrent download workers
    pub parallelism: usize,
    /// Queued requests/results per worker; bounds read-ahead together with `parallelism`
    pub queue_depth: usize,
    /// Chunk size used to calculate I/O tokens per part (0 = no I/O throttling)
    pub chunk_size: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            part_size: 16 * 1024 * 1024,
            parallelism: 4,
            queue_depth: 2,
            chunk_size: 0,
        }
    }
}

impl ReaderConfig {
    pub fn new(part_size: u64, parallelism: usize) -> Self {
        Self {
            part_size,
            parallelism,
            ..Default::default()
        }
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.part_size == 0 {
            return Err("part_size must be greater than 0".to_string());
        }
        if usize::try_from(self.part_size).is_err() {
            return Err(format!(
                "part_size {} does not fit in memory on this platform",
                self.part_size
            ));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(format!(
                "parallelism must be between 1 and {MAX_PARALLELISM}, got {}",
                self.parallelism
            ));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(format!(
                "queue_depth must be between 1 and {MAX_QUEUE_DEPTH}, got {}",
                self.queue_depth
            ));
        }
        Ok(())
    }

    /// Capacity of the request and result channels
    pub fn channel_capacity(&self) -> usize {
        self.parallelism * self.queue_depth
    }

    /// Maximum number of parts scheduled ahead of the consumer
    pub fn read_ahead(&self) -> usize {
        self.parallelism * (self.queue_depth + 1)
    }

    /// Number of parts an object of `size` bytes is split into
    pub fn total_parts(&self, size: u64) -> u64 {
        if self.part_size == 0 {
            return 0;
        }
        size.div_ceil(self.part_size)
    }
}

/// Throttling configuration for range requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum number of simultaneously open range streams (0 = no limit)
    pub max_open_streams: usize,
    /// Range requests per second (0 = no throttle)
    pub requests_throttle: usize,
    /// I/O operations per second (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size for I/O operations (bytes)
    pub chunk_size: u64,
}

const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

// replenish tasks are detached, so a second configuration would stack another set of them
static THROTTLES_APPLIED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }

    /// Configures the process-wide throttles and spawns their replenish tasks.
    ///
    /// Succeeds at most once per process. Must be called from within a tokio runtime when any
    /// per-second throttle is set.
    pub fn apply(&self) -> Result<(), String> {
        self.validate()?;
        if THROTTLES_APPLIED.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Err("throttles are already configured for this process".to_string());
        }
        throttle::set_max_open_streams(self.max_open_streams);
        if self.requests_throttle > 0 {
            let (tokens, interval) = replenish_schedule(self.requests_throttle);
            throttle::init_request_tokens(tokens);
            tokio::spawn(throttle::run_request_replenish_thread(interval));
        }
        if self.iops_throttle > 0 {
            let (tokens, interval) = replenish_schedule(self.iops_throttle);
            throttle::init_iops_tokens(tokens);
            tokio::spawn(throttle::run_iops_replenish_thread(interval));
        }
        Ok(())
    }
}

// per-second rate -> (tokens per interval, interval), scaling the interval up for low rates
fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    let mut tokens = per_second;
    let mut interval = std::time::Duration::from_secs(1);
    while tokens >= 10 && interval > REPLENISH_INTERVAL {
        tokens /= 10;
        interval /= 10;
    }
    (tokens, interval)
}
