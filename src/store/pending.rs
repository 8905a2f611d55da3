//! Claim bookkeeping for the `pending` outbox table.
//!
//! A row is `Unclaimed` (jobid and failed both NULL), `Claimed` (jobid set
//! while a send is in flight) or `Failed` (failed set, never picked up again
//! until explicitly retried).

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::RecordStore;
use crate::db::RowCursor;
use crate::error::Result;

/// Replay state of an outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
  Unclaimed,
  Claimed { job_id: String },
  Failed { reason: String },
}

/// Summary of an outbox row without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
  pub id: String,
  pub timestamp: Option<DateTime<Utc>>,
  pub state: PendingState,
}

impl RecordStore {
  /// Ids of rows eligible for replay, oldest first.
  pub async fn unclaimed_ids(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT id FROM 'pending' WHERE jobid IS NULL AND failed IS NULL ORDER BY timestamp, id",
      )?;
      let mut rows = stmt.query([])?;
      let mut ids = Vec::new();
      while let Some(row) = rows.next()? {
        if let Some(id) = row.get_string("id")? {
          ids.push(id);
        }
      }
      Ok(ids)
    })
  }

  /// Mark `id` as being sent under `job_id`.
  ///
  /// Returns false when the row is gone, failed, or already claimed by
  /// another job.
  pub async fn claim(&self, id: &str, job_id: &str) -> Result<bool> {
    let changed = self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          Ok(conn.execute(
            "UPDATE 'pending' SET jobid = ?1 WHERE id = ?2 AND jobid IS NULL AND failed IS NULL",
            params![job_id, id],
          )?)
        })
      })
      .await?;
    Ok(changed == 1)
  }

  /// Hand a claimed row back for a later replay.
  pub async fn release(&self, id: &str, job_id: &str) -> Result<()> {
    self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          conn.execute(
            "UPDATE 'pending' SET jobid = NULL WHERE id = ?1 AND jobid = ?2",
            params![id, job_id],
          )?;
          Ok(())
        })
      })
      .await
  }

  /// Delete a delivered row, provided it is still held by `job_id`.
  pub async fn complete(&self, id: &str, job_id: &str) -> Result<bool> {
    let changed = self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          Ok(conn.execute(
            "DELETE FROM 'pending' WHERE id = ?1 AND jobid = ?2",
            params![id, job_id],
          )?)
        })
      })
      .await?;
    Ok(changed == 1)
  }

  /// Park a row that can never be delivered as-is.
  ///
  /// With `job_id`, only a row still claimed by that job is parked; without
  /// one, only an unclaimed row. Returns false when the row was left alone.
  pub async fn mark_failed(&self, id: &str, job_id: Option<&str>, reason: &str) -> Result<bool> {
    let changed = self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          let changed = match job_id {
            Some(job_id) => conn.execute(
              "UPDATE 'pending' SET jobid = NULL, failed = ?2 WHERE id = ?1 AND jobid = ?3",
              params![id, reason, job_id],
            )?,
            None => conn.execute(
              "UPDATE 'pending' SET failed = ?2 WHERE id = ?1 AND jobid IS NULL",
              params![id, reason],
            )?,
          };
          Ok(changed)
        })
      })
      .await?;
    Ok(changed == 1)
  }

  /// Release every claim. Returns how many rows were claimed.
  pub async fn clear_jobs(&self) -> Result<usize> {
    self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          Ok(conn.execute(
            "UPDATE 'pending' SET jobid = NULL WHERE jobid IS NOT NULL",
            [],
          )?)
        })
      })
      .await
  }

  /// Return failed rows to the replay queue. Returns how many were failed.
  pub async fn retry_failed(&self) -> Result<usize> {
    self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          Ok(conn.execute(
            "UPDATE 'pending' SET failed = NULL WHERE failed IS NOT NULL",
            [],
          )?)
        })
      })
      .await
  }

  /// Every outbox row with its state, oldest first.
  pub async fn pending_entries(&self) -> Result<Vec<PendingEntry>> {
    self.db.with_conn(|conn| {
      let mut stmt =
        conn.prepare("SELECT id, timestamp, jobid, failed FROM 'pending' ORDER BY timestamp, id")?;
      let mut rows = stmt.query([])?;
      let mut entries = Vec::new();
      while let Some(row) = rows.next()? {
        let state = match (row.get_string("jobid")?, row.get_string("failed")?) {
          (_, Some(reason)) => PendingState::Failed { reason },
          (Some(job_id), None) => PendingState::Claimed { job_id },
          (None, None) => PendingState::Unclaimed,
        };
        let timestamp = row
          .get_string("timestamp")?
          .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
          .map(|t| t.with_timezone(&Utc));
        entries.push(PendingEntry {
          id: row.get_string("id")?.unwrap_or_default(),
          timestamp,
          state,
        });
      }
      Ok(entries)
    })
  }
}
