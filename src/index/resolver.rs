use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::HealthMetrics;
use crate::metric::PathRequest;

use super::encoding::{decode_member, range_lower, range_upper};

/// One discovered path in a resolve response. `tenant` is always empty;
/// reserved for extension.
#[derive(Debug, Serialize, PartialEq)]
pub struct PathEntry {
    pub path: String,
    pub depth: usize,
    pub tenant: String,
    pub leaf: bool,
}

/// How a query's matches are narrowed after the range scan.
enum QueryKind {
    /// No wildcard: the range alone pins a single path.
    Exact,
    /// A single trailing wildcard: the range is the answer.
    Prefix,
    /// Multiple or interior wildcards: filter decoded paths by regex.
    Multi(Regex),
}

/// A classified query with its index scan range.
struct PlannedQuery {
    depth: usize,
    lower: String,
    upper: String,
    kind: QueryKind,
}

/// Classifies a query by its wildcards and builds the scan range over
/// the sorted index.
fn plan(query: &str) -> Result<PlannedQuery> {
    let depth = query.split('.').count();
    let pieces: Vec<&str> = query.split('*').collect();

    let (lower, kind) = if pieces.len() == 1 {
        (range_lower(depth, query, true), QueryKind::Exact)
    } else if pieces.len() == 2 && pieces[1].is_empty() {
        (range_lower(depth, pieces[0], false), QueryKind::Prefix)
    } else {
        // Matched against the decoded path, so anchor both ends.
        let raw = format!("^{}$", pieces.join(".*"));
        let re = Regex::new(&raw)
            .with_context(|| format!("compiling wildcard expression {raw:?}"))?;
        (range_lower(depth, pieces[0], false), QueryKind::Multi(re))
    };

    let upper = range_upper(&lower);

    Ok(PlannedQuery {
        depth,
        lower,
        upper,
        kind,
    })
}

/// Applies the post-scan narrowing for a query kind.
fn filter_members(members: Vec<String>, kind: &QueryKind) -> Vec<String> {
    match kind {
        QueryKind::Exact | QueryKind::Prefix => members,
        QueryKind::Multi(re) => members
            .into_iter()
            .filter(|m| decode_member(m).is_some_and(|(path, _)| re.is_match(path)))
            .collect(),
    }
}

/// Serializes matched members into the resolve response. The reported
/// depth is the query's node count.
fn assemble(members: &[String], depth: usize) -> Vec<u8> {
    let entries: Vec<PathEntry> = members
        .iter()
        .filter_map(|m| {
            decode_member(m).map(|(path, leaf)| PathEntry {
                path: path.to_string(),
                depth,
                tenant: String::new(),
                leaf,
            })
        })
        .collect();

    serde_json::to_vec(&entries).unwrap_or_else(|_| b"[]".to_vec())
}

/// Answers path-discovery queries against the sorted secondary index.
///
/// Stateless apart from the index connection; each query runs in its own
/// task with a cloned connection handle.
pub struct PathResolver {
    connection: MultiplexedConnection,
    path_key: String,
    health: Arc<HealthMetrics>,
}

impl PathResolver {
    pub fn new(
        connection: MultiplexedConnection,
        path_key: String,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            connection,
            path_key,
            health,
        }
    }

    /// Consumes discovery requests until cancellation.
    pub async fn run(self, mut requests: mpsc::Receiver<PathRequest>, cancel: CancellationToken) {
        info!("path resolver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("path resolver received quit");
                    return;
                }
                request = requests.recv() => {
                    let Some(request) = request else { return };

                    let connection = self.connection.clone();
                    let path_key = self.path_key.clone();
                    let health = Arc::clone(&self.health);

                    tokio::spawn(async move {
                        let timer = health
                            .request_duration
                            .with_label_values(&["paths"])
                            .start_timer();
                        let payload =
                            resolve(connection, &path_key, &health, &request.query).await;
                        timer.observe_duration();

                        let _ = request.reply.send(payload);
                    });
                }
            }
        }
    }
}

/// Resolves one query. Index errors, malformed wildcard expressions, and
/// empty scans all yield a serialized empty list; a resolve never panics.
async fn resolve(
    mut connection: MultiplexedConnection,
    path_key: &str,
    health: &HealthMetrics,
    query: &str,
) -> Vec<u8> {
    debug!(query, "resolving path query");

    let plan = match plan(query) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, query, "unresolvable path query");
            return b"[]".to_vec();
        }
    };

    let members: Vec<String> = match connection
        .zrangebylex(path_key, plan.lower.as_str(), plan.upper.as_str())
        .await
    {
        Ok(members) => members,
        Err(e) => {
            error!(error = %e, query, "index range scan failed");
            health.index_errors.inc();
            return b"[]".to_vec();
        }
    };

    let members = filter_members(members, &plan.kind);
    assemble(&members, plan.depth)
}

#[cfg(test)]
mod tests {
    use crate::index::encoding::encode_member;

    use super::*;

    /// The index fixture shared by the wildcard scenarios.
    fn index() -> Vec<String> {
        vec![
            encode_member(4, "a.b.c.d", false),
            encode_member(5, "a.b.c.d.e", true),
            encode_member(5, "a.b.c.d.f", true),
        ]
    }

    /// Range-scan simulation: the members of the sorted set that fall
    /// inside the plan's bounds, in lexicographic order.
    fn scan(members: &[String], plan: &PlannedQuery) -> Vec<String> {
        let lo = &plan.lower[1..];
        let hi = &plan.upper[1..];
        let mut hits: Vec<String> = members
            .iter()
            .filter(|m| m.as_str() >= lo && m.as_str() <= hi)
            .cloned()
            .collect();
        hits.sort();
        hits
    }

    fn entries(payload: &[u8]) -> Vec<PathEntry> {
        let values: Vec<serde_json::Value> =
            serde_json::from_slice(payload).expect("valid json");
        values
            .into_iter()
            .map(|v| PathEntry {
                path: v["path"].as_str().expect("path").to_string(),
                depth: v["depth"].as_u64().expect("depth") as usize,
                tenant: v["tenant"].as_str().expect("tenant").to_string(),
                leaf: v["leaf"].as_bool().expect("leaf"),
            })
            .collect()
    }

    #[test]
    fn test_plan_classifies_exact() {
        let plan = plan("a.b.c").expect("plans");
        assert!(matches!(plan.kind, QueryKind::Exact));
        assert_eq!(plan.depth, 3);
        assert_eq!(plan.lower, "[0003:a.b.c:");
        assert_eq!(plan.upper, "[0003:a.b.c\\:\\xff");
    }

    #[test]
    fn test_plan_classifies_trailing_wildcard() {
        let plan = plan("a.b.c.d.*").expect("plans");
        assert!(matches!(plan.kind, QueryKind::Prefix));
        assert_eq!(plan.depth, 5);
        assert_eq!(plan.lower, "[0005:a.b.c.d.");
    }

    #[test]
    fn test_plan_classifies_multi_wildcard() {
        let plan = plan("a.*.c.*.e").expect("plans");
        assert!(matches!(plan.kind, QueryKind::Multi(_)));
        assert_eq!(plan.depth, 5);
        assert_eq!(plan.lower, "[0005:a.");
    }

    #[test]
    fn test_trailing_wildcard_scenario() {
        let plan = plan("a.b.c.d.*").expect("plans");
        let hits = filter_members(scan(&index(), &plan), &plan.kind);
        let result = entries(&assemble(&hits, plan.depth));

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].path, "a.b.c.d.e");
        assert_eq!(result[1].path, "a.b.c.d.f");
        assert!(result.iter().all(|e| e.depth == 5 && e.leaf && e.tenant.is_empty()));
    }

    #[test]
    fn test_multi_wildcard_scenario() {
        let plan = plan("a.*.c.*.e").expect("plans");
        let hits = filter_members(scan(&index(), &plan), &plan.kind);
        let result = entries(&assemble(&hits, plan.depth));

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, "a.b.c.d.e");
        assert!(result[0].leaf);
    }

    #[test]
    fn test_exact_lookup_excludes_other_depths() {
        let plan = plan("a.b.c.d").expect("plans");
        let hits = filter_members(scan(&index(), &plan), &plan.kind);
        let result = entries(&assemble(&hits, plan.depth));

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, "a.b.c.d");
        assert!(!result[0].leaf);
    }

    #[test]
    fn test_multi_wildcard_is_anchored() {
        // Substring matches against longer paths must not leak through.
        let members = vec![
            encode_member(3, "a.b.c", true),
            encode_member(3, "a.bb.c", true),
            encode_member(3, "xa.b.cx", true),
        ];

        let plan = plan("a.*.c").expect("plans");
        let hits = filter_members(scan(&members, &plan), &plan.kind);
        let result = entries(&assemble(&hits, plan.depth));

        let paths: Vec<&str> = result.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.b.c", "a.bb.c"]);
    }

    #[test]
    fn test_plan_rejects_invalid_wildcard_expression() {
        assert!(plan("a.(*.c").is_err());
    }

    #[test]
    fn test_assemble_empty_is_json_empty_list() {
        assert_eq!(assemble(&[], 3), b"[]");
    }
}
