use std::time::Duration;

use tracing::debug;

/// Number of samples averaged together.
const BANDWIDTH_WINDOW: usize = 4;

/// Keeps a short history of transfer measurements to size network
/// transfers: each sample extrapolates "bytes moved in `elapsed`" to the
/// byte count that would take exactly `time_target`, and the report is
/// the arithmetic mean over the window.
///
/// Used only from the cache cleanup thread, so no locking.
pub struct BandwidthMeasure {
    time_target: Duration,
    history: [u64; BANDWIDTH_WINDOW],
    idx: usize,
}

impl BandwidthMeasure {
    pub fn new(time_target: Duration) -> Self {
        Self {
            time_target,
            history: [0; BANDWIDTH_WINDOW],
            idx: 0,
        }
    }

    /// Records a transfer of `bytes` over `elapsed` and returns the
    /// current target byte count. Zero-byte measurements are ignored;
    /// with an empty history the result is zero and the caller clamps at
    /// its floor.
    pub fn update(&mut self, bytes: u64, elapsed: Duration) -> u64 {
        if bytes > 0 {
            let secs = elapsed.as_secs_f64();
            debug!(
                bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                mib_per_s = (bytes as f64 / secs.max(1e-9)) / (1 << 20) as f64,
                "bandwidth sample"
            );

            let frac = (secs / self.time_target.as_secs_f64()).max(1e-6);
            let target = (bytes as f64 / frac) as u64;
            self.history[self.idx] = target;
            self.idx = (self.idx + 1) % BANDWIDTH_WINDOW;
        }

        self.history.iter().sum::<u64>() / BANDWIDTH_WINDOW as u64
    }
}
