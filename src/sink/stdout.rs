//! Standard output destination for dry runs and debugging
//!
//! Prints every committed row as one JSON line. Rows of an open transaction
//! are held back until commit, so rolled-back batches never show up.

use super::destination::{ConflictPolicy, Destination};
use super::mapper::SinkRow;
use crate::core::errors::{SinkError, SinkResult};
use chrono::Utc;
use serde::Serialize;
use std::io::{self, Stdout, Write};
use tracing::{debug, info};

#[derive(Serialize)]
struct PrintedRow<'a> {
    table: &'a str,
    #[serde(flatten)]
    row: &'a SinkRow,
}

/// Destination that writes committed rows to a byte sink, stdout by default
pub struct StdoutDestination<W: Write = Stdout> {
    out: W,
    staged: Vec<(String, SinkRow)>,
    closed: bool,
}

impl StdoutDestination<Stdout> {
    /// Create a new stdout destination
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }
}

impl Default for StdoutDestination<Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> StdoutDestination<W> {
    pub fn with_writer(out: W) -> Self {
        Self {
            out,
            staged: Vec::new(),
            closed: false,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    fn ensure_open(&self) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::connection("Stdout destination is closed"));
        }
        Ok(())
    }
}

impl<W: Write> Destination for StdoutDestination<W> {
    fn kind(&self) -> &'static str {
        "stdout"
    }

    fn create_table_statement(&self, table: &str) -> String {
        format!("-- table {} is implicit on stdout", table)
    }

    fn execute_ddl(&mut self, statement: &str) -> SinkResult<()> {
        self.ensure_open()?;
        debug!("Skipping DDL on stdout: {}", statement);
        Ok(())
    }

    fn insert_batch(
        &mut self,
        table: &str,
        rows: &[SinkRow],
        _on_conflict: ConflictPolicy,
    ) -> SinkResult<u64> {
        self.ensure_open()?;
        self.staged
            .extend(rows.iter().map(|row| (table.to_string(), row.clone())));
        Ok(rows.len() as u64)
    }

    fn commit(&mut self) -> SinkResult<()> {
        self.ensure_open()?;
        let recorded_at = Utc::now();

        for (table, mut row) in self.staged.drain(..) {
            row.recorded_at = Some(recorded_at);
            let line = serde_json::to_string(&PrintedRow {
                table: &table,
                row: &row,
            })
            .map_err(|e| SinkError::write(format!("Failed to serialize row: {}", e)))?;
            writeln!(self.out, "{}", line)
                .map_err(|e| SinkError::write(format!("Failed to write row: {}", e)))?;
        }

        self.out
            .flush()
            .map_err(|e| SinkError::write(format!("Failed to flush output: {}", e)))
    }

    fn rollback(&mut self) -> SinkResult<()> {
        self.staged.clear();
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if !self.closed {
            info!("Shutting down stdout destination");
            self.staged.clear();
            self.closed = true;
            self.out.flush()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use uuid::Uuid;

    fn row(destination: &str) -> SinkRow {
        SinkRow {
            id: Uuid::new_v4(),
            destination: destination.to_string(),
            key: Some("{\"id\":1}".to_string()),
            value: None,
            recorded_at: None,
        }
    }

    #[test]
    fn test_prints_committed_rows_only() {
        let mut destination = StdoutDestination::with_writer(Vec::new());

        destination
            .insert_batch("raw_events", &[row("S.A")], ConflictPolicy::Fail)
            .unwrap();
        destination.rollback().unwrap();
        destination
            .insert_batch("raw_events", &[row("S.B")], ConflictPolicy::Fail)
            .unwrap();
        destination.commit().unwrap();

        let output = String::from_utf8(destination.writer().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);

        let printed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(printed["table"], "raw_events");
        assert_eq!(printed["destination"], "S.B");
        assert_eq!(printed["key"], "{\"id\":1}");
        assert!(printed["value"].is_null());
        assert!(printed["recorded_at"].is_string());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut destination = StdoutDestination::with_writer(Vec::new());
        destination.close().unwrap();
        destination.close().unwrap();
        assert!(destination.is_closed());
        assert!(destination.commit().is_err());
    }
}
