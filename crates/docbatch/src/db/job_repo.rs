//! Job repository: the `jobs` table.
//!
//! Every status change is a conditional UPDATE whose WHERE clause encodes the
//! allowed source states; callers learn from the returned `bool` whether
//! their transition took effect.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, DatabaseError};
use crate::model::{Job, Status};

fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    Ok(Job {
        id: row.get("id")?,
        status: row.get("status")?,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_timestamp(&row.get::<_, String>("updated_at")?)?,
        download_url: row.get("download_url")?,
        archive_key: row.get("archive_key")?,
    })
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, status, created_at, updated_at, download_url, archive_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.id,
            job.status,
            format_timestamp(&job.created_at),
            format_timestamp(&job.updated_at),
            job.download_url,
            job.archive_key,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
        .optional()?;
    Ok(job)
}

/// Lists the most recently created jobs.
pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<Job>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1")?;
    let jobs = stmt
        .query_map(params![limit], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Open jobs with no unfinished conversion left: the barrier still owes
/// them a decision.
pub fn list_awaiting_barrier(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT j.id FROM jobs j
         WHERE j.status NOT IN ('completed', 'failed')
           AND NOT EXISTS (
               SELECT 1 FROM file_conversions f
               WHERE f.job_id = j.id AND f.status NOT IN ('completed', 'failed')
           )
         ORDER BY j.created_at",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// `pending → in_progress`. Returns false if the job already left `pending`.
pub fn mark_in_progress(
    conn: &Connection,
    id: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
        params![id, Status::InProgress, format_timestamp(now), Status::Pending],
    )?;
    Ok(changed == 1)
}

/// Takes the archive claim for a non-terminal job.
///
/// Succeeds when nobody holds the claim or the previous holder's lease has
/// expired. At most one caller can observe `true` for a given lease window.
pub fn try_claim_archive(
    conn: &Connection,
    id: &str,
    token: &str,
    now: &DateTime<Utc>,
    expires_at: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET archive_claim = ?2, archive_claim_expires_at = ?3, updated_at = ?4
         WHERE id = ?1
           AND status NOT IN ('completed', 'failed')
           AND (archive_claim IS NULL OR archive_claim_expires_at <= ?4)",
        params![id, token, format_timestamp(expires_at), format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Drops the claim if `token` still holds it.
pub fn release_archive_claim(
    conn: &Connection,
    id: &str,
    token: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET archive_claim = NULL, archive_claim_expires_at = NULL
         WHERE id = ?1 AND archive_claim = ?2",
        params![id, token],
    )?;
    Ok(changed == 1)
}

/// Claim holder's `→ completed` transition, recording the download reference.
pub fn complete(
    conn: &Connection,
    id: &str,
    token: &str,
    download_url: &str,
    archive_key: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    if download_url.is_empty() {
        return Err(DatabaseError::Invariant(format!(
            "job {} cannot complete without a download reference",
            id
        )));
    }
    let changed = conn.execute(
        "UPDATE jobs SET status = 'completed', download_url = ?3, archive_key = ?4, updated_at = ?5,
                         archive_claim = NULL, archive_claim_expires_at = NULL
         WHERE id = ?1 AND archive_claim = ?2 AND status NOT IN ('completed', 'failed')",
        params![id, token, download_url, archive_key, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Claim holder's `→ failed` transition for a job with no usable output.
pub fn fail(
    conn: &Connection,
    id: &str,
    token: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'failed', updated_at = ?3,
                         archive_claim = NULL, archive_claim_expires_at = NULL
         WHERE id = ?1 AND archive_claim = ?2 AND status NOT IN ('completed', 'failed')",
        params![id, token, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Deletes a job; its file conversions go with it (`ON DELETE CASCADE`).
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            status: Status::Pending,
            created_at: now,
            updated_at: now,
            download_url: None,
            archive_key: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("job-1"))?;
            let found = find_by_id(conn, "job-1")?.unwrap();
            assert_eq!(found.status, Status::Pending);
            assert!(found.download_url.is_none());
            assert!(find_by_id(conn, "nonexistent")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_mark_in_progress_only_from_pending() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            assert!(mark_in_progress(conn, "j", &Utc::now())?);
            assert!(!mark_in_progress(conn, "j", &Utc::now())?);
            assert_eq!(find_by_id(conn, "j")?.unwrap().status, Status::InProgress);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            let now = Utc::now();
            let expires = now + Duration::minutes(15);

            assert!(try_claim_archive(conn, "j", "a", &now, &expires)?);
            assert!(!try_claim_archive(conn, "j", "b", &now, &expires)?);

            assert!(!release_archive_claim(conn, "j", "b")?);
            assert!(release_archive_claim(conn, "j", "a")?);
            assert!(try_claim_archive(conn, "j", "b", &now, &expires)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_expired_claim_can_be_taken_over() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            let start = Utc::now();
            assert!(try_claim_archive(
                conn,
                "j",
                "crashed",
                &start,
                &(start + Duration::seconds(5))
            )?);

            let later = start + Duration::seconds(10);
            assert!(try_claim_archive(
                conn,
                "j",
                "rescuer",
                &later,
                &(later + Duration::seconds(5))
            )?);

            // The original holder can no longer finish the job.
            assert!(!complete(conn, "j", "crashed", "http://x/dl", "j/j.zip", &later)?);
            assert!(complete(conn, "j", "rescuer", "http://x/dl", "j/j.zip", &later)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_complete_sets_reference_once() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            let now = Utc::now();
            assert!(try_claim_archive(conn, "j", "t", &now, &(now + Duration::minutes(1)))?);
            assert!(complete(conn, "j", "t", "http://host/dl", "j/j.zip", &now)?);

            let job = find_by_id(conn, "j")?.unwrap();
            assert_eq!(job.status, Status::Completed);
            assert_eq!(job.download_url.as_deref(), Some("http://host/dl"));
            assert_eq!(job.archive_key.as_deref(), Some("j/j.zip"));

            // Terminal jobs cannot be claimed or completed again.
            assert!(!try_claim_archive(conn, "j", "t2", &now, &(now + Duration::minutes(1)))?);
            assert!(!complete(conn, "j", "t", "http://other", "j/j.zip", &now)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_complete_rejects_empty_reference() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            assert!(matches!(
                complete(conn, "j", "t", "", "j/j.zip", &Utc::now()),
                Err(DatabaseError::Invariant(_))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_fail_requires_claim() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            let now = Utc::now();
            assert!(!fail(conn, "j", "t", &now)?);
            assert!(try_claim_archive(conn, "j", "t", &now, &(now + Duration::minutes(1)))?);
            assert!(fail(conn, "j", "t", &now)?);

            let job = find_by_id(conn, "j")?.unwrap();
            assert_eq!(job.status, Status::Failed);
            assert!(job.download_url.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_recent_orders_newest_first() {
        let db = test_db();
        db.with_conn(|conn| {
            let mut old = sample_job("old");
            old.created_at = Utc::now() - Duration::days(1);
            insert(conn, &old)?;
            insert(conn, &sample_job("new"))?;

            let jobs = list_recent(conn, 10)?;
            assert_eq!(jobs.len(), 2);
            assert_eq!(jobs[0].id, "new");
            assert_eq!(list_recent(conn, 1)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &sample_job("j"))?;
            assert!(delete(conn, "j")?);
            assert!(!delete(conn, "j")?);
            assert!(find_by_id(conn, "j")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_awaiting_barrier() {
        let db = test_db();
        db.with_conn(|conn| {
            for id in ["open", "settled", "done"] {
                insert(conn, &sample_job(id))?;
            }
            conn.execute_batch(
                "INSERT INTO file_conversions (id, job_id, file_name, input_key, status, created_at, updated_at)
                     VALUES ('a', 'open', 'a.docx', 'open/a.docx', 'in_progress', 'now', 'now');
                 INSERT INTO file_conversions (id, job_id, file_name, input_key, status, error_message, created_at, updated_at)
                     VALUES ('b', 'settled', 'b.docx', 'settled/b.docx', 'failed', 'boom', 'now', 'now');",
            )?;
            let now = Utc::now();
            assert!(try_claim_archive(conn, "done", "t", &now, &(now + Duration::minutes(1)))?);
            assert!(fail(conn, "done", "t", &now)?);

            assert_eq!(list_awaiting_barrier(conn)?, vec!["settled"]);
            Ok(())
        })
        .unwrap();
    }
}
