//! SQLite backing store: connection handle, schema and row access.

pub mod columns;
pub mod gate;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, Row};
use serde::Serialize;

use crate::error::{Error, Result};

/// File name of the database inside the data directory.
pub const DB_FILE_NAME: &str = "service-call.sqlite";

/// The three logical tables of the offline store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
  /// Requests that have been answered by the network at least once
  Requests,
  /// Responses, keyed by the id of their `requests` row
  Responses,
  /// Outbox of requests made while offline
  Pending,
}

impl Table {
  pub const ALL: [Table; 3] = [Table::Requests, Table::Responses, Table::Pending];

  pub fn name(self) -> &'static str {
    match self {
      Table::Requests => "requests",
      Table::Responses => "responses",
      Table::Pending => "pending",
    }
  }

  /// Only the outbox carries job and failure markers.
  pub fn is_outbox(self) -> bool {
    matches!(self, Table::Pending)
  }

  pub(crate) fn create_sql(self) -> String {
    let extended = if self.is_outbox() {
      "'jobid' TEXT, 'failed' TEXT, "
    } else {
      ""
    };
    format!(
      "CREATE TABLE IF NOT EXISTS '{}' ('id' TEXT NOT NULL, 'timestamp' TEXT NOT NULL, {}'data0' TEXT, PRIMARY KEY('id'))",
      self.name(),
      extended
    )
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Read access to a single result row by column name.
///
/// Everything above the database module reads rows through this, so the
/// record layer never depends on how a particular binding exposes cells.
pub trait RowCursor {
  fn get_string(&self, column: &str) -> Result<Option<String>>;
}

impl RowCursor for Row<'_> {
  fn get_string(&self, column: &str) -> Result<Option<String>> {
    Ok(self.get::<_, Option<String>>(column)?)
  }
}

/// Process-wide handle to the offline database file.
pub struct Database {
  conn: Mutex<Option<Connection>>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    let db = Self {
      conn: Mutex::new(Some(conn)),
      path: Some(path.to_path_buf()),
    };
    db.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened offline store");
    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let db = Self {
      conn: Mutex::new(Some(Connection::open_in_memory()?)),
      path: None,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path under the user's data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("could not determine data directory".to_string()))?;

    Ok(data_dir.join("offline-call").join(DB_FILE_NAME))
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Create any missing tables and bring older outbox tables up to date.
  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| create_tables(conn))
  }

  /// Run `f` against the open connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    let conn = guard.as_mut().ok_or(Error::StoreClosed)?;
    f(conn)
  }

  /// Drop every table and recreate the empty schema.
  pub fn drop_all_tables(&self) -> Result<()> {
    self.with_conn(|conn| {
      for table in Table::ALL {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS '{}'", table.name()))?;
      }
      create_tables(conn)
    })
  }

  /// Close the connection. Every later operation fails with `StoreClosed`.
  pub fn close(&self) -> Result<()> {
    let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
      tracing::debug!("closed offline store");
    }
    Ok(())
  }
}

fn create_tables(conn: &Connection) -> Result<()> {
  for table in Table::ALL {
    conn.execute_batch(&table.create_sql())?;
  }

  // Outbox tables created before failure tracking existed
  let columns = columns::table_columns(conn, Table::Pending)?;
  if !columns.iter().any(|c| c == "failed") {
    conn.execute_batch("ALTER TABLE 'pending' ADD COLUMN 'failed' TEXT")?;
  }

  Ok(())
}
