use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scylla::frame::value::CqlTimestamp;
use scylla::Session;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::config::{RollupDef, Rollups, Window};
use crate::health::HealthMetrics;
use crate::metric::{ApiResponse, MetricRequest, MetricResponse};

/// Shared immutable context for spawned read workers.
pub(crate) struct QueryContext {
    pub session: Arc<Session>,
    pub keyspace: String,
    pub rollups: Arc<Rollups>,
    pub health: Arc<HealthMetrics>,
}

/// Picks the first window whose retention covers `time_delta`, falling
/// back to the coarsest window for ranges older than every retention.
fn select_window(def: &RollupDef, time_delta: Duration) -> Option<&Window> {
    def.windows
        .iter()
        .find(|w| time_delta <= w.retention)
        .or_else(|| def.windows.last())
}

/// Serves one range-read request. Runs in its own task; never touches
/// accumulator state.
pub(crate) async fn query_get(ctx: Arc<QueryContext>, req: MetricRequest) {
    let MetricRequest {
        from,
        to,
        method: _,
        query,
        reply,
    } = req;

    debug!(paths = ?query, from, to, "read query");

    if query.is_empty() || query[0].is_empty() {
        deliver(reply, ApiResponse::bad_request("no query specified"));
        return;
    }

    // The age of the range start decides which rollup table to read.
    let from_time = UNIX_EPOCH + Duration::from_secs(from.max(0) as u64);
    let time_delta = SystemTime::now()
        .duration_since(from_time)
        .unwrap_or(Duration::ZERO);

    let mut step = 0i64;
    let mut series = BTreeMap::new();

    for path in &query {
        let expr = ctx.rollups.classify(path);
        let def = ctx.rollups.def(expr);
        let Some(window) = select_window(def, time_delta) else {
            continue;
        };
        step = window.window.as_secs() as i64;

        let stmt = format!(
            "SELECT stat FROM {}.{} WHERE path = ? AND time >= ? AND time <= ?",
            ctx.keyspace, window.table,
        );

        let mut stats = Vec::new();
        match ctx
            .session
            .query(
                stmt,
                (
                    path.as_str(),
                    CqlTimestamp(from * 1000),
                    CqlTimestamp(to * 1000),
                ),
            )
            .await
        {
            Ok(result) => match result.rows_typed::<(f64,)>() {
                Ok(rows) => {
                    for row in rows {
                        match row {
                            Ok((stat,)) => stats.push(stat),
                            Err(e) => {
                                error!(error = %e, path = %path, "reading stat row");
                                ctx.health.store_read_errors.inc();
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, path = %path, "reading stat rows");
                    ctx.health.store_read_errors.inc();
                }
            },
            Err(e) => {
                error!(error = %e, path = %path, "stat range query failed");
                ctx.health.store_read_errors.inc();
            }
        }

        series.insert(path.clone(), stats);
    }

    let response = MetricResponse {
        from,
        to,
        step,
        series,
    };
    let payload = serde_json::to_vec(&response).unwrap_or_default();

    deliver(reply, ApiResponse::ok(payload));
}

/// Best-effort response delivery. The caller may have timed out and
/// dropped its receiver; that is not an error here.
fn deliver(reply: oneshot::Sender<ApiResponse>, response: ApiResponse) {
    if reply.send(response).is_err() {
        debug!("response receiver dropped before delivery");
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, Rollups};

    use super::*;

    fn rollups() -> Rollups {
        let cfg: Config = serde_yaml::from_str(
            r#"
rollups:
  CATCHALL:
    method: average
    windows:
      - { window: 10s, retention: 1h }
      - { window: 1m, retention: 1d }
      - { window: 10m, retention: 30d }
rollup_priority: ["CATCHALL"]
"#,
        )
        .expect("valid yaml");
        Rollups::compile(&cfg).expect("compiles")
    }

    #[test]
    fn test_select_window_walks_retentions_in_order() {
        let rollups = rollups();
        let def = rollups.def("CATCHALL");

        let w = select_window(def, Duration::from_secs(600)).expect("window");
        assert_eq!(w.table, "rollup_10_3600");

        let w = select_window(def, Duration::from_secs(7200)).expect("window");
        assert_eq!(w.table, "rollup_60_86400");

        let w = select_window(def, Duration::from_secs(5 * 86_400)).expect("window");
        assert_eq!(w.table, "rollup_600_2592000");
    }

    #[test]
    fn test_select_window_clamps_to_coarsest() {
        let rollups = rollups();
        let def = rollups.def("CATCHALL");

        let w = select_window(def, Duration::from_secs(365 * 86_400)).expect("window");
        assert_eq!(w.table, "rollup_600_2592000");
    }

    #[tokio::test]
    async fn test_deliver_ignores_dropped_receiver() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        deliver(tx, ApiResponse::ok(Vec::new()));
    }
}
