//! FileConversion repository: the `file_conversions` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, DatabaseError};
use crate::model::FileConversion;

fn conversion_from_row(row: &Row<'_>) -> Result<FileConversion, rusqlite::Error> {
    Ok(FileConversion {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        file_name: row.get("file_name")?,
        input_key: row.get("input_key")?,
        output_key: row.get("output_key")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
        attempts: row.get("attempts")?,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_timestamp(&row.get::<_, String>("updated_at")?)?,
    })
}

pub fn insert(conn: &Connection, fc: &FileConversion) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO file_conversions (id, job_id, file_name, input_key, output_key, status,
             error_message, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            fc.id,
            fc.job_id,
            fc.file_name,
            fc.input_key,
            fc.output_key,
            fc.status,
            fc.error_message,
            fc.attempts,
            format_timestamp(&fc.created_at),
            format_timestamp(&fc.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<FileConversion>, DatabaseError> {
    let fc = conn
        .query_row(
            "SELECT * FROM file_conversions WHERE id = ?1",
            params![id],
            conversion_from_row,
        )
        .optional()?;
    Ok(fc)
}

/// All conversions of a job, in upload order.
pub fn list_by_job(conn: &Connection, job_id: &str) -> Result<Vec<FileConversion>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM file_conversions WHERE job_id = ?1 ORDER BY rowid")?;
    let rows = stmt
        .query_map(params![job_id], conversion_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of conversions of a job that have not reached a terminal status.
pub fn count_unfinished(conn: &Connection, job_id: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM file_conversions
         WHERE job_id = ?1 AND status NOT IN ('completed', 'failed')",
        params![job_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Ids of every conversion, across all jobs, not yet terminal.
pub fn list_unfinished_ids(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM file_conversions
         WHERE status NOT IN ('completed', 'failed')
         ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Marks a delivery of the conversion task and bumps its attempt counter.
///
/// Accepts `pending` and `in_progress` (a redelivered task); returns false
/// when the conversion is already terminal.
pub fn mark_in_progress(
    conn: &Connection,
    id: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE file_conversions SET status = 'in_progress', attempts = attempts + 1, updated_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'in_progress')",
        params![id, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// `→ completed` with the output location. No-op (false) if already terminal.
pub fn complete(
    conn: &Connection,
    id: &str,
    output_key: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    if output_key.is_empty() {
        return Err(DatabaseError::Invariant(format!(
            "conversion {} cannot complete without an output location",
            id
        )));
    }
    let changed = conn.execute(
        "UPDATE file_conversions SET status = 'completed', output_key = ?2, error_message = NULL,
                                     updated_at = ?3
         WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
        params![id, output_key, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// `→ failed` with the error detail. No-op (false) if already terminal.
pub fn fail(
    conn: &Connection,
    id: &str,
    error_message: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    if error_message.is_empty() {
        return Err(DatabaseError::Invariant(format!(
            "conversion {} cannot fail without an error detail",
            id
        )));
    }
    let changed = conn.execute(
        "UPDATE file_conversions SET status = 'failed', error_message = ?2, output_key = NULL,
                                     updated_at = ?3
         WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
        params![id, error_message, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}
