pub mod batch;
pub mod flush;
pub mod query;
pub mod rollup;
pub mod schema;
pub mod timer;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use scylla::{Session, SessionBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Rollups, StoreConfig};
use crate::health::HealthMetrics;
use crate::metric::{ApiResponse, MetricRequest, Sample};

use self::batch::{BatchWriter, CqlSink};
use self::query::QueryContext;
use self::rollup::RollupState;

/// Connects to the backing store. Fatal on failure; the service cannot
/// do its job without it.
pub async fn connect(cfg: &StoreConfig) -> Result<Session> {
    SessionBuilder::new()
        .known_nodes(&cfg.hosts)
        .build()
        .await
        .with_context(|| format!("connecting to backing store at {:?}", cfg.hosts))
}

/// The store manager: sole owner and mutator of all rollup accumulation
/// state, driven by a single select loop.
///
/// Because every mutation happens on this loop, the accumulator needs no
/// locks; read queries run in spawned workers that only touch the
/// concurrency-safe session.
pub struct StoreManager {
    state: RollupState,
    writer: BatchWriter<CqlSink>,
    query_ctx: Arc<QueryContext>,
    health: Arc<HealthMetrics>,

    samples_rx: mpsc::Receiver<Sample>,
    queries_rx: mpsc::Receiver<MetricRequest>,
    reload_rx: mpsc::Receiver<oneshot::Sender<()>>,
    index_tx: mpsc::Sender<Sample>,

    set_timeout: mpsc::Sender<Duration>,
    timeout_rx: mpsc::Receiver<()>,

    cancel: CancellationToken,
}

/// Channel ends the store manager consumes.
pub struct StoreChannels {
    pub samples_rx: mpsc::Receiver<Sample>,
    pub queries_rx: mpsc::Receiver<MetricRequest>,
    pub reload_rx: mpsc::Receiver<oneshot::Sender<()>>,
    pub index_tx: mpsc::Sender<Sample>,
}

impl StoreManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &StoreConfig,
        rollups: Arc<Rollups>,
        session: Arc<Session>,
        health: Arc<HealthMetrics>,
        channels: StoreChannels,
        set_timeout: mpsc::Sender<Duration>,
        timeout_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        let state = RollupState::new(Arc::clone(&rollups), SystemTime::now());
        let writer = BatchWriter::new(
            CqlSink::new(Arc::clone(&session), cfg.keyspace.clone()),
            cfg.batch_size,
        );
        let query_ctx = Arc::new(QueryContext {
            session,
            keyspace: cfg.keyspace.clone(),
            rollups,
            health: Arc::clone(&health),
        });

        Self {
            state,
            writer,
            query_ctx,
            health,
            samples_rx: channels.samples_rx,
            queries_rx: channels.queries_rx,
            reload_rx: channels.reload_rx,
            index_tx: channels.index_tx,
            set_timeout,
            timeout_rx,
            cancel,
        }
    }

    /// Runs the event loop until cancellation, then performs the final
    /// terminating flush.
    pub async fn run(mut self) {
        info!("store manager started");

        // Kick the timer so the first flush cycle happens promptly.
        let _ = self.set_timeout.try_send(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("store manager received quit");
                    self.flush(true).await;
                    info!("store manager stopped");
                    return;
                }
                Some(ack) = self.reload_rx.recv() => {
                    debug!("store manager received reconfiguration request");
                    self.flush(true).await;
                    self.state.reset(SystemTime::now());
                    info!("rollup state flushed and reset");
                    let _ = ack.send(());
                }
                Some(sample) = self.samples_rx.recv() => {
                    self.accumulate(sample).await;
                }
                Some(request) = self.queries_rx.recv() => {
                    self.dispatch(request);
                }
                Some(()) = self.timeout_rx.recv() => {
                    self.flush(false).await;
                }
            }
        }
    }

    /// Folds one sample into its buckets, emitting a first-sight
    /// notification for the index writer when the path is new.
    async fn accumulate(&mut self, sample: Sample) {
        debug!(path = %sample.path, value = sample.value, "accumulate");

        if self.state.accumulate(&sample) {
            if self.index_tx.send(sample).await.is_err() {
                warn!("index writer channel closed; path not indexed");
            }
        }
    }

    /// Dispatches a read request. GET runs in its own worker task;
    /// DELETE is acknowledged as a no-op.
    fn dispatch(&self, request: MetricRequest) {
        match request.method.to_lowercase().as_str() {
            "delete" => {
                let timer = self
                    .health
                    .request_duration
                    .with_label_values(&["delete"])
                    .start_timer();
                let _ = request.reply.send(ApiResponse::ok(Vec::new()));
                timer.observe_duration();
            }
            _ => {
                let ctx = Arc::clone(&self.query_ctx);
                let timer = self
                    .health
                    .request_duration
                    .with_label_values(&["get"])
                    .start_timer();
                tokio::spawn(async move {
                    query::query_get(ctx, request).await;
                    timer.observe_duration();
                });
            }
        }
    }

    /// One flush cycle: persist closed (or, when terminating, all
    /// non-empty) buckets and re-arm the timer for the earliest future
    /// window close.
    async fn flush(&mut self, terminating: bool) {
        self.health.paths_tracked.set(self.state.path_count() as f64);

        let base_time = SystemTime::now();
        let summary = self
            .state
            .flush(&mut self.writer, terminating, base_time, Some(self.health.as_ref()))
            .await;

        if terminating {
            if summary.rows > 0 {
                info!(
                    rows = summary.rows,
                    "terminating flush emitted open-window aggregates",
                );
            }
            return;
        }

        let delay = summary
            .next_flush
            .duration_since(base_time)
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));

        // Non-blocking: if the timer has not consumed the previous
        // submission yet, this one is dropped and the next cycle rearms.
        let _ = self.set_timeout.try_send(delay);
    }
}
