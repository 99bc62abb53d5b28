//! Token-bucket bandwidth throttling.
//!
//! Two limiters apply to each download: one shared across all workers and
//! one per worker, both continuously refilled from the last-refill
//! timestamp. Reads are capped at 32 KiB per syscall so tokens keep
//! flowing; a limiter with rate 0 is a no-op.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use distsmith_cancel::CancellationToken;

/// Cap on a single read, keeping waits short under throttling.
pub const READ_CHUNK: usize = 32 * 1024;

/// Minimum bucket capacity; small rates still allow whole chunks through.
const MIN_CAPACITY: u64 = 64 * 1024;

/// Longest single sleep while waiting for tokens, keeping cancellation
/// responsive.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A thread-safe token bucket. `rate` is bytes per second; 0 disables it.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    capacity: u64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            capacity: rate_bytes_per_sec.max(MIN_CAPACITY),
            state: Mutex::new(BucketState {
                tokens: rate_bytes_per_sec.max(MIN_CAPACITY) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Take `n` tokens, sleeping until the bucket refills. Returns `false`
    /// when cancelled mid-wait.
    pub fn acquire(&self, n: u64, cancel: &CancellationToken) -> bool {
        if self.rate == 0 || n == 0 {
            return !cancel.is_cancelled();
        }
        let n = n.min(self.capacity);

        loop {
            let wait = {
                let mut state = self.state.lock().expect("limiter mutex poisoned");
                let elapsed = state.last_refill.elapsed();
                state.last_refill = Instant::now();
                state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate as f64)
                    .min(self.capacity as f64);

                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return true;
                }
                let deficit = n as f64 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate as f64)
            };

            if cancel.wait_timeout(wait.min(MAX_WAIT_SLICE)) {
                return false;
            }
        }
    }
}

/// A reader that pulls at most [`READ_CHUNK`] bytes per syscall and pays
/// both limiters for every byte delivered.
pub struct ThrottledReader<R> {
    inner: R,
    global: Arc<RateLimiter>,
    worker: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(
        inner: R,
        global: Arc<RateLimiter>,
        worker: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            global,
            worker,
            cancel,
        }
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "download cancelled",
            ));
        }
        let cap = buf.len().min(READ_CHUNK);
        let n = self.inner.read(&mut buf[..cap])?;
        if n > 0 {
            if !self.global.acquire(n as u64, &self.cancel)
                || !self.worker.acquire(n as u64, &self.cancel)
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "download cancelled",
                ));
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_a_noop() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.acquire(READ_CHUNK as u64, &cancel));
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn limited_rate_slows_acquisition() {
        // 64 KiB capacity, 64 KiB/s refill: draining the bucket then asking
        // for 32 KiB more must take roughly half a second.
        let limiter = RateLimiter::new(64 * 1024);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(64 * 1024, &cancel));

        let start = Instant::now();
        assert!(limiter.acquire(32 * 1024, &cancel));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed: {:?}", elapsed);
    }

    #[test]
    fn acquire_returns_false_when_cancelled() {
        let limiter = RateLimiter::new(1024);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(limiter.capacity, &cancel));

        cancel.cancel();
        assert!(!limiter.acquire(1024, &cancel));
    }

    #[test]
    fn throttled_reader_caps_chunk_size() {
        let data = vec![7u8; READ_CHUNK * 2];
        let mut reader = ThrottledReader::new(
            data.as_slice(),
            Arc::new(RateLimiter::unlimited()),
            Arc::new(RateLimiter::unlimited()),
            CancellationToken::new(),
        );

        let mut buf = vec![0u8; READ_CHUNK * 2];
        let n = reader.read(&mut buf).expect("read");
        assert_eq!(n, READ_CHUNK);
    }

    #[test]
    fn throttled_reader_reads_to_end_unlimited() {
        let data = vec![3u8; 100_000];
        let mut reader = ThrottledReader::new(
            data.as_slice(),
            Arc::new(RateLimiter::unlimited()),
            Arc::new(RateLimiter::unlimited()),
            CancellationToken::new(),
        );
        let mut out = Vec::new();
        let start = Instant::now();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out.len(), 100_000);
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn throttled_reader_errors_after_cancel() {
        let cancel = CancellationToken::new();
        let data = vec![1u8; 1024];
        let mut reader = ThrottledReader::new(
            data.as_slice(),
            Arc::new(RateLimiter::unlimited()),
            Arc::new(RateLimiter::unlimited()),
            cancel.clone(),
        );
        cancel.cancel();
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).expect_err("cancelled");
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    }
}
