use std::time::Duration;

use anyhow::{Context, Result};
use scylla::Session;
use tracing::{debug, info};

use crate::config::{Rollups, StoreConfig};

/// Seconds deleted rows linger before compaction may reclaim them.
const GC_GRACE_SECONDS: u64 = 864_000; // 10 days

/// Ensures the keyspace and every rollup table exist.
///
/// Any failure here is fatal: without its schema the service cannot do
/// its job.
pub async fn bootstrap(session: &Session, cfg: &StoreConfig, rollups: &Rollups) -> Result<()> {
    let options = if cfg.replication_options.is_empty() {
        String::new()
    } else {
        format!(", {}", cfg.replication_options)
    };

    let create_keyspace = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': '{}'{}}}",
        cfg.keyspace, cfg.replication_strategy, options,
    );
    debug!(query = %create_keyspace, "creating keyspace");

    session
        .query(create_keyspace, ())
        .await
        .with_context(|| format!("creating keyspace {}", cfg.keyspace))?;

    for (table, retention) in rollups.tables() {
        let create_table = table_ddl(&cfg.keyspace, &table, retention);
        debug!(query = %create_table, "creating table");
        info!(table = %table, "ensuring rollup table");

        session
            .query(create_table, ())
            .await
            .with_context(|| format!("creating table {table}"))?;
    }

    Ok(())
}

/// The DDL for one rollup table: rows keyed by path, clustered by time,
/// expiring a little after their retention so reads never see a gap at
/// the retention edge.
fn table_ddl(keyspace: &str, table: &str, retention: Duration) -> String {
    let ttl = (retention.as_secs() as f64 * 1.1) as u64;
    format!(
        "CREATE TABLE IF NOT EXISTS {keyspace}.{table} \
         (path text, time timestamp, stat double, PRIMARY KEY (path, time)) \
         WITH COMPACT STORAGE \
         AND CLUSTERING ORDER BY (time ASC) \
         AND compaction = {{'class': 'org.apache.cassandra.db.compaction.DateTieredCompactionStrategy'}} \
         AND compression = {{'sstable_compression': 'org.apache.cassandra.io.compress.LZ4Compressor'}} \
         AND dclocal_read_repair_chance = 0.1 \
         AND default_time_to_live = {ttl} \
         AND gc_grace_seconds = {GC_GRACE_SECONDS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ddl_ttl_is_retention_plus_ten_percent() {
        let ddl = table_ddl("metrics", "rollup_10_600", Duration::from_secs(600));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS metrics.rollup_10_600"));
        assert!(ddl.contains("default_time_to_live = 660"));
        assert!(ddl.contains("gc_grace_seconds = 864000"));
        assert!(ddl.contains("PRIMARY KEY (path, time)"));
        assert!(ddl.contains("CLUSTERING ORDER BY (time ASC)"));
    }

    #[test]
    fn test_table_ddl_week_retention() {
        let ddl = table_ddl("metrics", "rollup_60_604800", Duration::from_secs(604_800));
        assert!(ddl.contains("default_time_to_live = 665280"));
    }
}
