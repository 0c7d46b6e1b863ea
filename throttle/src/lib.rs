//! Process-wide limits for ranged object reads
//!
//! Range reads against remote storage are cheap to issue and easy to overdo: a handful of
//! parallel readers with generous parallelism can open hundreds of HTTP streams at once.
//! This crate provides three independent limits that readers consult before touching the
//! network:
//!
//! 1. **Open streams limit** - caps the number of simultaneously open range-response bodies
//! 2. **Request throttle** - caps the number of range requests issued per interval
//! 3. **I/O throttle** - caps transferred data, measured in chunk-sized tokens per part
//!
//! Each limit is disabled until configured with a non-zero value, in which case every call
//! returns immediately.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::*;
//! use std::time::Duration;
//!
//! # async fn example() {
//! set_max_open_streams(64);
//!
//! // 20 requests every 100ms = 200 requests/s
//! init_request_tokens(20);
//! tokio::spawn(run_request_replenish_thread(Duration::from_millis(100)));
//!
//! get_request_token().await;
//! let _stream_guard = open_stream_permit().await;
//! // 8 MiB part read in 1 MiB chunks needs 8 tokens
//! get_part_iops_tokens(1024 * 1024, 8 * 1024 * 1024).await;
//! # }
//! ```
//!
//! # Token Calculation
//!
//! ```text
//! tokens = min(⌈part_length / chunk_size⌉, bucket capacity)
//! ```

mod limit;

use limit::{ConcurrencyLimit, TokenBucket};

static OPEN_STREAMS: ConcurrencyLimit = ConcurrencyLimit::new();
static REQUESTS: TokenBucket = TokenBucket::new();
static PART_IO: TokenBucket = TokenBucket::new();

/// Limits how many range-response streams may be open at once (0 disables the limit).
pub fn set_max_open_streams(max_open_streams: usize) {
    OPEN_STREAMS.configure(max_open_streams);
}

/// Held while a range-response stream is open; the slot is released on drop.
pub struct OpenStreamGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_stream_permit() -> OpenStreamGuard {
    OpenStreamGuard {
        _permit: OPEN_STREAMS.enter().await,
    }
}

/// Sets how many range requests may be issued per refill interval.
pub fn init_request_tokens(request_tokens: usize) {
    REQUESTS.configure(request_tokens);
}

/// Sets how many chunk-sized transfers may happen per refill interval.
pub fn init_iops_tokens(iops_tokens: usize) {
    PART_IO.configure(iops_tokens);
}

pub async fn get_request_token() {
    REQUESTS.take(1).await;
}

/// Consumes the I/O tokens needed to transfer `part_length` bytes in `chunk_size` chunks.
pub async fn get_part_iops_tokens(chunk_size: u64, part_length: u64) {
    if chunk_size == 0 {
        return;
    }
    let tokens = part_length.max(1).div_ceil(chunk_size);
    PART_IO
        .take(u32::try_from(tokens).unwrap_or(u32::MAX))
        .await;
}

pub async fn run_request_replenish_thread(interval: std::time::Duration) {
    REQUESTS.run_refill(interval).await;
}

pub async fn run_iops_replenish_thread(interval: std::time::Duration) {
    PART_IO.run_refill(interval).await;
}
