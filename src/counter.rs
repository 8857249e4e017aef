//! Per-connection inbound byte counter.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running total of bytes read from one connection.
///
/// Exactly one worker writes to a given counter; the controller only reads
/// the total during final aggregation. The atomic keeps that read sound if a
/// report is collected while the worker is still running.
#[derive(Debug, Default)]
pub struct ByteCounter {
    total: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `chunk` to the total and returns its length.
    pub fn record(&self, chunk: &[u8]) -> usize {
        self.total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        chunk.len()
    }

    /// Bytes recorded so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl io::Write for &ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.record(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sums_chunk_sizes() {
        let counter = ByteCounter::new();
        for size in [5usize, 3, 12] {
            assert_eq!(counter.record(&vec![0u8; size]), size);
        }
        assert_eq!(counter.total(), 20);
    }

    #[test]
    fn write_never_fails() {
        let counter = ByteCounter::new();
        let mut sink = &counter;
        assert_eq!(sink.write(b"hello").unwrap(), 5);
        sink.write_all(b"abc").unwrap();
        sink.write_all(&[]).unwrap();
        sink.flush().unwrap();
        assert_eq!(counter.total(), 8);
    }

    #[test]
    fn starts_at_zero() {
        assert_eq!(ByteCounter::new().total(), 0);
    }
}
