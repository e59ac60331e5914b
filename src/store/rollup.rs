use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{Method, Rollups};
use crate::metric::Sample;

use super::flush::next_time_boundary;

/// Accumulated rollup buckets for one path: one (count, value) pair per
/// window of the owning expression.
#[derive(Debug)]
pub(crate) struct PathStats {
    /// Expression key this path classified under.
    pub expr: String,
    /// Data points folded into each bucket since its last flush.
    pub counts: Vec<u64>,
    /// Running aggregate per bucket.
    pub values: Vec<f64>,
}

/// Per-expression aggregation state: when each window next closes, and
/// which paths the expression has matched.
#[derive(Debug)]
pub(crate) struct RunList {
    /// Absolute close time for each window.
    pub next_write: Vec<SystemTime>,
    /// Arena slot for every path matched by this expression.
    pub paths: HashMap<String, usize>,
}

/// All rollup accumulation state, owned exclusively by the store manager
/// event loop.
///
/// Buckets live in an arena; `by_path` and the per-expression run lists
/// both hold arena slots, so the same mutable bucket is visible through
/// either view without shared-ownership handles.
pub struct RollupState {
    pub(crate) rollups: Arc<Rollups>,
    pub(crate) arena: Vec<PathStats>,
    pub(crate) by_path: HashMap<String, usize>,
    pub(crate) by_expr: HashMap<String, RunList>,
}

impl RollupState {
    /// Creates empty accumulation state with every window's first close
    /// boundary derived from `base_time`.
    pub fn new(rollups: Arc<Rollups>, base_time: SystemTime) -> Self {
        let mut state = Self {
            rollups,
            arena: Vec::new(),
            by_path: HashMap::new(),
            by_expr: HashMap::new(),
        };
        state.reset(base_time);
        state
    }

    /// Discards all accumulated data and re-derives window boundaries.
    /// Callers are expected to have flushed first.
    pub fn reset(&mut self, base_time: SystemTime) {
        self.arena.clear();
        self.by_path.clear();
        self.by_expr.clear();

        let rollups = Arc::clone(&self.rollups);
        for expr in rollups.expressions() {
            let def = rollups.def(expr);
            let next_write = def
                .windows
                .iter()
                .map(|w| next_time_boundary(base_time, w.window))
                .collect();
            self.by_expr.insert(
                expr.to_string(),
                RunList {
                    next_write,
                    paths: HashMap::new(),
                },
            );
        }
    }

    /// Folds one sample into every bucket of its path.
    ///
    /// Returns true when this is the first sample ever seen for the path,
    /// in which case the caller must emit an index-write notification.
    pub fn accumulate(&mut self, sample: &Sample) -> bool {
        let (slot, first_sight) = match self.by_path.get(&sample.path) {
            Some(&slot) => (slot, false),
            None => {
                let expr = self.rollups.classify(&sample.path).to_string();
                let window_count = self.rollups.def(&expr).windows.len();

                let slot = self.arena.len();
                self.arena.push(PathStats {
                    expr: expr.clone(),
                    counts: vec![0; window_count],
                    values: vec![0.0; window_count],
                });

                self.by_path.insert(sample.path.clone(), slot);
                if let Some(run_list) = self.by_expr.get_mut(&expr) {
                    run_list.paths.insert(sample.path.clone(), slot);
                }

                (slot, true)
            }
        };

        let method = self.rollups.def(&self.arena[slot].expr).method;
        let stats = &mut self.arena[slot];
        let v = sample.value;

        match method {
            Method::Average => {
                for i in 0..stats.values.len() {
                    stats.values[i] = (stats.values[i] * stats.counts[i] as f64 + v)
                        / (stats.counts[i] + 1) as f64;
                }
            }
            Method::Max => {
                for i in 0..stats.values.len() {
                    if stats.counts[i] == 0 || stats.values[i] < v {
                        stats.values[i] = v;
                    }
                }
            }
            Method::Min => {
                for i in 0..stats.values.len() {
                    if stats.counts[i] == 0 || stats.values[i] > v {
                        stats.values[i] = v;
                    }
                }
            }
            Method::Sum => {
                for value in &mut stats.values {
                    *value += v;
                }
            }
        }

        for count in &mut stats.counts {
            *count += 1;
        }

        first_sight
    }

    /// Number of unique paths currently tracked.
    pub fn path_count(&self) -> usize {
        self.by_path.len()
    }

    /// The (count, value) bucket for a path and window index, if the path
    /// has been seen.
    pub fn bucket(&self, path: &str, window: usize) -> Option<(u64, f64)> {
        let &slot = self.by_path.get(path)?;
        let stats = &self.arena[slot];
        Some((*stats.counts.get(window)?, *stats.values.get(window)?))
    }

    /// Arena slot lookup through the path view. Test support for the
    /// two-level indexing invariant.
    #[cfg(test)]
    pub(crate) fn slot_by_path(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    /// Arena slot lookup through the expression view. Test support for
    /// the two-level indexing invariant.
    #[cfg(test)]
    pub(crate) fn slot_by_expr(&self, expr: &str, path: &str) -> Option<usize> {
        self.by_expr.get(expr)?.paths.get(path).copied()
    }
}
