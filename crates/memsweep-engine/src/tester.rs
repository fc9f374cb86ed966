//! Pattern stability tester
//!
//! Writes each bit pattern across the test region in chunks, reads it back
//! and compares it against the regenerated pattern. Bandwidth is computed
//! from the device transfer time the backend reports, not wall time.

use crate::patterns::BitPattern;
use chrono::Utc;
use memsweep_core::{
    MemoryBackend, OffsetMhz, Result, SampleStatus, StabilitySample, TesterConfig, TransferStats,
};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one tester run
#[derive(Debug, Clone, PartialEq)]
pub enum TestRun {
    Sample(StabilitySample),
    /// Cancelled mid-run; partial results are discarded
    Cancelled,
}

#[derive(Debug, Default)]
struct Tally {
    transfer: TransferStats,
    errors: u64,
    addresses: Vec<u64>,
    passes: u32,
}

pub struct PatternTester {
    backend: Arc<dyn MemoryBackend>,
    region_words: u64,
    chunk_words: usize,
    max_error_addresses: usize,
    watchdog: Duration,
}

impl PatternTester {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: &TesterConfig, watchdog: Duration) -> Self {
        Self {
            backend,
            region_words: config.region_bytes / 4,
            chunk_words: (config.chunk_bytes / 4).max(1) as usize,
            max_error_addresses: config.max_error_addresses,
            watchdog,
        }
    }

    /// Exercise memory at the applied `offset` for about `duration`
    pub async fn run(
        &self,
        offset: OffsetMhz,
        duration: Duration,
        patterns: &[BitPattern],
        cancel: &CancellationToken,
    ) -> TestRun {
        let started = Instant::now();
        let mut tally = Tally::default();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.watchdog, self.exercise(duration, patterns, &mut tally)) => Some(result),
        };

        let status = match outcome {
            None => {
                debug!("Test at {:+} MHz cancelled", offset);
                return TestRun::Cancelled;
            }
            Some(Ok(Ok(()))) => SampleStatus::Completed,
            Some(Ok(Err(e))) => {
                warn!("Memory backend faulted at {:+} MHz: {}", offset, e);
                SampleStatus::Faulted(e.to_string())
            }
            Some(Err(_)) => {
                warn!("Test at {:+} MHz exceeded watchdog of {:?}", offset, self.watchdog);
                SampleStatus::TimedOut
            }
        };

        TestRun::Sample(StabilitySample {
            offset,
            bandwidth_gbps: tally.transfer.bandwidth_gbps(),
            error_count: tally.errors,
            duration: started.elapsed(),
            timestamp: Utc::now(),
            status,
            passes: tally.passes,
            error_addresses: tally.addresses,
            telemetry: None,
        })
    }

    async fn exercise(
        &self,
        duration: Duration,
        patterns: &[BitPattern],
        tally: &mut Tally,
    ) -> Result<()> {
        let region = self.region_words.min(self.backend.capacity_words());
        if region == 0 || patterns.is_empty() {
            return Err(memsweep_core::Error::memory("nothing to test"));
        }
        let chunk = self.chunk_words.min(region as usize);
        let mut expected = vec![0u32; chunk];
        let mut actual = vec![0u32; chunk];
        let started = Instant::now();

        loop {
            for pattern in patterns {
                let pass = tally.passes;

                let mut base = 0u64;
                while base < region {
                    let len = chunk.min((region - base) as usize);
                    pattern.fill(base, pass, &mut expected[..len]);
                    let stats = self.backend.write_words(base, &expected[..len]).await?;
                    tally.transfer.accumulate(stats);
                    base += len as u64;
                }

                let mut pattern_errors = 0u64;
                let mut base = 0u64;
                while base < region {
                    let len = chunk.min((region - base) as usize);
                    let stats = self.backend.read_words(base, &mut actual[..len]).await?;
                    tally.transfer.accumulate(stats);

                    pattern.fill(base, pass, &mut expected[..len]);
                    let room = self.max_error_addresses.saturating_sub(tally.addresses.len());
                    let (count, addresses) =
                        compare_chunk(&expected[..len], &actual[..len], base, room);
                    pattern_errors += count;
                    tally.addresses.extend(addresses);
                    base += len as u64;
                }

                debug!("Pattern {} pass {}: {} errors", pattern, pass, pattern_errors);
                tally.errors += pattern_errors;
                if tally.errors > 0 {
                    return Ok(());
                }
            }

            tally.passes += 1;
            if started.elapsed() >= duration {
                return Ok(());
            }
        }
    }
}

/// Count mismatching words and collect up to `room` of their addresses
fn compare_chunk(expected: &[u32], actual: &[u32], base: u64, room: usize) -> (u64, Vec<u64>) {
    let count = expected
        .par_iter()
        .zip(actual.par_iter())
        .filter(|(e, a)| e != a)
        .count() as u64;
    if count == 0 || room == 0 {
        return (count, Vec::new());
    }

    let addresses = expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .take(room)
        .map(|(i, _)| base + i as u64)
        .collect();
    (count, addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsweep_adapter_gpu::{MockGpu, MockGpuConfig};
    use memsweep_core::{ControlSurface, OffsetBounds};

    fn config() -> TesterConfig {
        TesterConfig {
            region_bytes: 64 * 1024,
            chunk_bytes: 16 * 1024,
            max_error_addresses: 2,
            ..TesterConfig::default()
        }
    }

    fn setup() -> (MockGpu, PatternTester) {
        let gpu = MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000)).with_memory_words(16 * 1024),
        );
        let tester = PatternTester::new(Arc::new(gpu.memory(0)), &config(), Duration::from_secs(1));
        (gpu, tester)
    }

    #[test]
    fn test_compare_chunk() {
        let expected = [1u32, 2, 3, 4, 5];
        let actual = [1u32, 0, 3, 0, 0];
        let (count, addresses) = compare_chunk(&expected, &actual, 100, 2);
        assert_eq!(count, 3);
        assert_eq!(addresses, vec![101, 103]);
        assert_eq!(compare_chunk(&expected, &expected, 0, 2), (0, vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_run() {
        let (_gpu, tester) = setup();
        let run = tester
            .run(0, Duration::from_millis(5), &BitPattern::defaults(1), &CancellationToken::new())
            .await;

        let sample = match run {
            TestRun::Sample(sample) => sample,
            TestRun::Cancelled => panic!("unexpected cancel"),
        };
        assert_eq!(sample.status, SampleStatus::Completed);
        assert_eq!(sample.error_count, 0);
        assert!(sample.passes >= 1);
        assert!((sample.bandwidth_gbps - 100.0).abs() < 1.0);
        assert!(sample.verdict().is_stable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_stop_early() {
        let (gpu, tester) = setup();
        gpu.inject_errors(300, 3);
        gpu.set_memory_offset(&gpu.identity(0), 300).await.unwrap();

        let run = tester
            .run(300, Duration::from_secs(60), &BitPattern::defaults(1), &CancellationToken::new())
            .await;
        let sample = match run {
            TestRun::Sample(sample) => sample,
            TestRun::Cancelled => panic!("unexpected cancel"),
        };
        assert_eq!(sample.error_count, 3);
        assert_eq!(sample.error_addresses.len(), 2);
        assert_eq!(sample.passes, 0);
        assert!(!sample.verdict().is_stable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let (gpu, tester) = setup();
        gpu.hang_at(400);
        gpu.set_memory_offset(&gpu.identity(0), 400).await.unwrap();

        let run = tester
            .run(400, Duration::from_millis(5), &BitPattern::defaults(1), &CancellationToken::new())
            .await;
        match run {
            TestRun::Sample(sample) => {
                assert_eq!(sample.status, SampleStatus::TimedOut);
                assert!(sample.duration >= Duration::from_secs(1));
            }
            TestRun::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_fault() {
        let (gpu, tester) = setup();
        gpu.fault_at(600);
        gpu.set_memory_offset(&gpu.identity(0), 600).await.unwrap();

        let run = tester
            .run(600, Duration::from_millis(5), &[BitPattern::AllOnes], &CancellationToken::new())
            .await;
        assert!(matches!(
            run,
            TestRun::Sample(StabilitySample { status: SampleStatus::Faulted(_), .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_discards_results() {
        let (gpu, tester) = setup();
        gpu.hang_at(400);
        gpu.set_memory_offset(&gpu.identity(0), 400).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = tester
            .run(400, Duration::from_secs(5), &BitPattern::defaults(1), &cancel)
            .await;
        assert_eq!(run, TestRun::Cancelled);
    }
}
