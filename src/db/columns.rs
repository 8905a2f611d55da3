//! Column-store adapter.
//!
//! A record's payload is sharded across `data0..dataN` columns because a single
//! SQLite cell cannot hold an arbitrarily large string. Tables only ever grow
//! new data columns; nothing here removes one.

use rusqlite::Connection;

use super::{RowCursor, Table};
use crate::error::Result;

const DATA_COLUMN_PREFIX: &str = "data";

/// Name of the `index`th fragment column.
pub fn data_column(index: usize) -> String {
  format!("{}{}", DATA_COLUMN_PREFIX, index)
}

/// Fragment index of a column named like `data12`.
fn data_column_index(name: &str) -> Option<usize> {
  let digits = name.strip_prefix(DATA_COLUMN_PREFIX)?;
  if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  digits.parse().ok()
}

/// Every column of `table`, in schema order, read from the live schema.
pub fn table_columns(conn: &Connection, table: Table) -> Result<Vec<String>> {
  let mut stmt = conn.prepare(&format!("PRAGMA table_info('{}')", table.name()))?;
  let mut rows = stmt.query([])?;
  let mut names = Vec::new();
  while let Some(row) = rows.next()? {
    if let Some(name) = row.get_string("name")? {
      names.push(name);
    }
  }
  Ok(names)
}

/// The fragment columns of `table`, ordered by index.
///
/// Always introspected rather than cached: another writer may have grown the
/// table since the last call.
pub fn column_names(conn: &Connection, table: Table) -> Result<Vec<String>> {
  let mut indexed: Vec<(usize, String)> = table_columns(conn, table)?
    .into_iter()
    .filter_map(|name| data_column_index(&name).map(|i| (i, name)))
    .collect();
  indexed.sort_by_key(|(i, _)| *i);
  Ok(indexed.into_iter().map(|(_, name)| name).collect())
}

/// Make sure `table` has at least `count` fragment columns.
///
/// Returns the number of fragment columns present afterwards, which may be
/// larger than `count`.
pub fn ensure_columns(conn: &Connection, table: Table, count: usize) -> Result<usize> {
  let existing = column_names(conn, table)?.len();
  if count <= existing {
    return Ok(existing);
  }

  for index in existing..count {
    conn.execute_batch(&format!(
      "ALTER TABLE '{}' ADD COLUMN {} TEXT",
      table.name(),
      data_column(index)
    ))?;
  }
  tracing::debug!(table = %table, from = existing, to = count, "expanded fragment columns");

  Ok(count)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;

  #[test]
  fn test_data_column_index() {
    assert_eq!(data_column_index("data0"), Some(0));
    assert_eq!(data_column_index("data17"), Some(17));
    assert_eq!(data_column_index("data"), None);
    assert_eq!(data_column_index("dataX"), None);
    assert_eq!(data_column_index("jobid"), None);
    assert_eq!(data_column_index("metadata1"), None);
  }

  #[test]
  fn test_fresh_table_has_one_data_column() {
    let db = Database::open_in_memory().unwrap();
    let names = db
      .with_conn(|conn| column_names(conn, Table::Requests))
      .unwrap();
    assert_eq!(names, vec!["data0"]);
  }

  #[test]
  fn test_ensure_columns_grows() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
      assert_eq!(ensure_columns(conn, Table::Pending, 4)?, 4);
      assert_eq!(
        column_names(conn, Table::Pending)?,
        vec!["data0", "data1", "data2", "data3"]
      );
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn test_ensure_columns_never_shrinks() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
      ensure_columns(conn, Table::Responses, 3)?;
      assert_eq!(ensure_columns(conn, Table::Responses, 1)?, 3);
      assert_eq!(ensure_columns(conn, Table::Responses, 3)?, 3);
      assert_eq!(column_names(conn, Table::Responses)?.len(), 3);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn test_columns_ordered_numerically() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
      ensure_columns(conn, Table::Requests, 12)?;
      let names = column_names(conn, Table::Requests)?;
      assert_eq!(names[2], "data2");
      assert_eq!(names[10], "data10");
      assert_eq!(names[11], "data11");
      Ok(())
    })
    .unwrap();
  }
}
