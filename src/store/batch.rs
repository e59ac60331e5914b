use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use scylla::batch::{Batch, BatchType};
use scylla::frame::value::CqlTimestamp;
use scylla::prepared_statement::PreparedStatement;
use scylla::Session;

use super::flush::epoch_millis;

/// One aggregate ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRow {
    pub path: String,
    pub time: SystemTime,
    pub value: f64,
}

/// Destination for grouped stat rows. The production implementation
/// writes CQL batches; tests substitute an in-memory sink.
pub trait StatSink: Send {
    /// Persist one group of rows into `table`. Rows are dropped by the
    /// caller whether or not the write succeeds.
    fn write_rows(
        &mut self,
        table: &str,
        rows: &[StatRow],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Buffers stat rows grouped by table and writes size-limited batches.
///
/// Switching tables implicitly flushes the previous table's residual rows.
pub struct BatchWriter<S> {
    sink: S,
    max_rows: usize,
    table: String,
    rows: Vec<StatRow>,
}

impl<S: StatSink> BatchWriter<S> {
    /// Creates a writer that flushes whenever `max_rows` rows accumulate.
    pub fn new(sink: S, max_rows: usize) -> Self {
        Self {
            sink,
            max_rows: max_rows.max(1),
            table: String::new(),
            rows: Vec::new(),
        }
    }

    /// Binds the writer to a table, writing any residual rows held for
    /// the previously bound table.
    pub async fn prepare(&mut self, table: &str) -> Result<()> {
        if self.table != table {
            let residual = self.write().await;
            self.table = table.to_string();
            residual?;
        }
        Ok(())
    }

    /// Appends one row, writing the batch once it reaches the size limit.
    pub async fn append(&mut self, path: &str, time: SystemTime, value: f64) -> Result<()> {
        self.rows.push(StatRow {
            path: path.to_string(),
            time,
            value,
        });

        if self.rows.len() >= self.max_rows {
            return self.write().await;
        }

        Ok(())
    }

    /// Writes any buffered rows. The buffer is emptied either way; a
    /// failed batch is dropped, not retried.
    pub async fn write(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        let rows = std::mem::take(&mut self.rows);
        self.sink.write_rows(&self.table, &rows).await
    }

    /// Number of rows currently buffered.
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// The sink, for inspection in tests.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Writes stat rows to the backing store as unlogged CQL batches, one
/// prepared insert statement per table.
pub struct CqlSink {
    session: Arc<Session>,
    keyspace: String,
    prepared: HashMap<String, PreparedStatement>,
}

impl CqlSink {
    pub fn new(session: Arc<Session>, keyspace: String) -> Self {
        Self {
            session,
            keyspace,
            prepared: HashMap::new(),
        }
    }

    async fn statement(&mut self, table: &str) -> Result<PreparedStatement> {
        if let Some(ps) = self.prepared.get(table) {
            return Ok(ps.clone());
        }

        let ps = self
            .session
            .prepare(format!(
                "INSERT INTO {}.{} (path, time, stat) VALUES (?, ?, ?)",
                self.keyspace, table,
            ))
            .await
            .with_context(|| format!("preparing insert for table {table}"))?;

        self.prepared.insert(table.to_string(), ps.clone());
        Ok(ps)
    }
}

impl StatSink for CqlSink {
    async fn write_rows(&mut self, table: &str, rows: &[StatRow]) -> Result<()> {
        let ps = self.statement(table).await?;

        let mut batch = Batch::new(BatchType::Unlogged);
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            batch.append_statement(ps.clone());
            values.push((
                row.path.clone(),
                CqlTimestamp(epoch_millis(row.time)),
                row.value,
            ));
        }

        self.session
            .batch(&batch, values)
            .await
            .with_context(|| format!("writing {} rows to table {table}", rows.len()))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Collects written rows in memory, optionally failing every write.
    #[derive(Default)]
    pub struct MemSink {
        pub written: Vec<(String, Vec<StatRow>)>,
        pub fail: bool,
    }

    impl StatSink for MemSink {
        async fn write_rows(&mut self, table: &str, rows: &[StatRow]) -> Result<()> {
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            self.written.push((table.to_string(), rows.to_vec()));
            Ok(())
        }
    }
}
