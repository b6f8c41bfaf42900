use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::models::{PipelineResult, RunRecord};

/// Record the outcome of one pipeline run against `target`.
pub async fn record(
    conn: &Connection,
    target: String,
    source: String,
    result: &PipelineResult,
) -> Result<()> {
    let id = result.run_id.clone();
    let stage = result.stage.as_str().to_string();
    let success = result.success;
    let exit_code = result.exit_code;
    let message = result.message.clone();

    conn.call(move |c| {
        c.execute(
            "INSERT INTO runs (id, target, source, stage, success, exit_code, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, target, source, stage, success, exit_code, message],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Most recent runs first, optionally for one target only.
pub async fn list(conn: &Connection, target: Option<String>, limit: usize) -> Result<Vec<RunRecord>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id, target, source, stage, success, exit_code, message, created_at
             FROM runs
             WHERE (?1 IS NULL OR target = ?1)
             ORDER BY rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![target, limit as i64], |row| {
            Ok(RunRecord {
                id: row.get(0)?,
                target: row.get(1)?,
                source: row.get(2)?,
                stage: row.get(3)?,
                success: row.get(4)?,
                exit_code: row.get(5)?,
                message: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list runs: {}", e))
}
