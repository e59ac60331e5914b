use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::HealthMetrics;
use crate::metric::Sample;

use super::encoding::encode_member;

/// Index members for a path and all of its ancestors. Only the full path
/// is a leaf; the sorted set deduplicates repeats.
pub fn ancestor_members(path: &str) -> Vec<String> {
    let nodes: Vec<&str> = path.split('.').collect();

    (1..=nodes.len())
        .map(|depth| {
            let prefix = nodes[..depth].join(".");
            encode_member(depth, &prefix, depth == nodes.len())
        })
        .collect()
}

/// Populates the sorted path index from first-sight notifications.
///
/// Single consumer of the index-write channel; writes are idempotent so
/// re-notification after a reconfiguration reset is harmless.
pub struct IndexWriter {
    connection: MultiplexedConnection,
    path_key: String,
    health: Arc<HealthMetrics>,
}

impl IndexWriter {
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

    /// Consumes first-sight samples until cancellation. Index errors are
    /// logged and counted; the sample's path is simply not discoverable
    /// until it is seen again after a reset.
    pub async fn run(mut self, mut samples: mpsc::Receiver<Sample>, cancel: CancellationToken) {
        info!("index writer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("index writer received quit");
                    return;
                }
                sample = samples.recv() => {
                    let Some(sample) = sample else { return };

                    if let Err(e) = self.write_path(&sample.path).await {
                        error!(error = %e, path = %sample.path, "index write failed");
                        self.health.index_errors.inc();
                    }
                }
            }
        }
    }

    async fn write_path(&mut self, path: &str) -> Result<()> {
        debug!(path, "indexing path");

        for member in ancestor_members(path) {
            let _: () = self
                .connection
                .zadd(&self.path_key, member, 0)
                .await
                .context("writing index member")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_members_cover_every_prefix() {
        assert_eq!(
            ancestor_members("a.b.c"),
            vec!["0001:a:false", "0002:a.b:false", "0003:a.b.c:true"],
        );
    }

    #[test]
    fn test_single_node_path_is_a_leaf() {
        assert_eq!(ancestor_members("a"), vec!["0001:a:true"]);
    }
}
