use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::health::HealthMetrics;

use super::batch::{BatchWriter, StatSink};
use super::rollup::RollupState;

/// Milliseconds since the epoch, clamped at zero for pre-epoch instants.
pub(crate) fn epoch_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Returns the smallest instant strictly after `base` that is an integer
/// multiple of `window` from the epoch.
pub fn next_time_boundary(base: SystemTime, window: Duration) -> SystemTime {
    let window_ms = window.as_millis().max(1) as i64;
    let base_ms = epoch_millis(base);
    let next_ms = (base_ms / window_ms + 1) * window_ms;
    UNIX_EPOCH + Duration::from_millis(next_ms as u64)
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy)]
pub struct FlushSummary {
    /// Earliest future window close across all expressions, bounded above
    /// by one minute past the cycle's base time.
    pub next_flush: SystemTime,
    /// Rows handed to the batch writer this cycle.
    pub rows: usize,
}

impl RollupState {
    /// Persists closed buckets through the batch writer and re-arms each
    /// flushed window's close boundary.
    ///
    /// With `terminating` set, every non-empty bucket is emitted stamped
    /// at `base_time` regardless of its boundary; used on shutdown and
    /// reconfiguration, where waiting for the true close is not possible.
    ///
    /// Write failures are logged and counted but never abort the cycle;
    /// the affected rows are lost.
    pub async fn flush<S: StatSink>(
        &mut self,
        bw: &mut BatchWriter<S>,
        terminating: bool,
        base_time: SystemTime,
        health: Option<&HealthMetrics>,
    ) -> FlushSummary {
        debug!(terminating, "flush cycle starting");

        // Upper bound for the next timer delay; tightened below by every
        // window close that is nearer.
        let mut next_flush = base_time + Duration::from_secs(60);
        let mut rows = 0usize;

        let rollups = Arc::clone(&self.rollups);

        for (expr, run_list) in self.by_expr.iter_mut() {
            let def = rollups.def(expr);

            // Each window writes to its own table.
            for i in 0..run_list.next_write.len() {
                let window_end = run_list.next_write[i];

                if window_end < base_time || terminating {
                    let stat_time = if terminating { base_time } else { window_end };
                    let window = &def.windows[i];

                    if let Err(e) = bw.prepare(&window.table).await {
                        error!(error = %e, table = %window.table, "stat batch write failed");
                        if let Some(h) = health {
                            h.store_write_errors.inc();
                        }
                    }

                    for (path, &slot) in &run_list.paths {
                        let stats = &mut self.arena[slot];

                        if stats.counts[i] > 0 {
                            let ts: DateTime<Utc> = stat_time.into();
                            debug!(
                                expr = %expr,
                                table = %window.table,
                                path = %path,
                                value = stats.values[i],
                                stat_time = %ts.format("%H:%M:%S%.3f"),
                                "writing rollup",
                            );

                            rows += 1;
                            if let Err(e) = bw.append(path, stat_time, stats.values[i]).await {
                                error!(error = %e, table = %window.table, "stat batch write failed");
                                if let Some(h) = health {
                                    h.store_write_errors.inc();
                                }
                            }
                        }

                        // Leave the bucket empty for the next open window.
                        stats.counts[i] = 0;
                        stats.values[i] = 0.0;
                    }

                    if bw.size() > 0 {
                        if let Err(e) = bw.write().await {
                            error!(error = %e, table = %window.table, "stat batch write failed");
                            if let Some(h) = health {
                                h.store_write_errors.inc();
                            }
                        }
                    }

                    run_list.next_write[i] = next_time_boundary(base_time, window.window);
                }
                // run_list.next_write[i] is now strictly later than base_time.

                if run_list.next_write[i] < next_flush {
                    next_flush = run_list.next_write[i];
                }
            }
        }

        if let Some(h) = health {
            h.flushes.inc();
            h.flush_rows.observe(rows as f64);
        }

        FlushSummary { next_flush, rows }
    }
}
