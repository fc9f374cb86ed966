//! System RAM memory backend
//!
//! Runs the pattern tester against an ordinary heap buffer. Useful for timing
//! the tester itself and for machines where the device binding is absent;
//! clock offsets applied to the GPU do not affect it.

use async_trait::async_trait;
use memsweep_core::{Error, MemoryBackend, Result, TransferStats};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

/// Heap-backed [`MemoryBackend`] with wall-clock transfer timing
pub struct HostMemory {
    buffer: Mutex<Vec<u32>>,
}

impl HostMemory {
    /// Allocate a zeroed buffer of `bytes` (rounded down to whole words)
    pub fn new(bytes: u64) -> Self {
        let words = (bytes / 4) as usize;
        debug!("Allocating {} words of host test memory", words);
        Self {
            buffer: Mutex::new(vec![0; words]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u32>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn range(len: usize, offset: u64, count: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= len)
            .ok_or_else(|| {
                Error::memory(format!(
                    "transfer of {} words at {} exceeds host buffer of {} words",
                    count, offset, len
                ))
            })?;
        Ok(start..end)
    }
}

#[async_trait]
impl MemoryBackend for HostMemory {
    fn capacity_words(&self) -> u64 {
        self.lock().len() as u64
    }

    async fn write_words(&self, offset: u64, data: &[u32]) -> Result<TransferStats> {
        let stats = {
            let mut buffer = self.lock();
            let range = Self::range(buffer.len(), offset, data.len())?;
            let start = Instant::now();
            buffer[range].copy_from_slice(data);
            TransferStats::new(data.len() as u64 * 4, start.elapsed())
        };
        tokio::task::yield_now().await;
        Ok(stats)
    }

    async fn read_words(&self, offset: u64, out: &mut [u32]) -> Result<TransferStats> {
        let stats = {
            let buffer = self.lock();
            let range = Self::range(buffer.len(), offset, out.len())?;
            let start = Instant::now();
            out.copy_from_slice(&buffer[range]);
            TransferStats::new(out.len() as u64 * 4, start.elapsed())
        };
        tokio::task::yield_now().await;
        Ok(stats)
    }
}
