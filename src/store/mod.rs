//! Record store over the `requests`, `responses` and `pending` tables.
//!
//! Every record is an id, a creation timestamp and an encoded payload spread
//! across fragment columns. Writes go through the store's [`Gate`]; reads do
//! not.

mod pending;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::codec::{PayloadCodec, PayloadTransform, TransformKind, MAX_FRAGMENT_SIZE};
use crate::db::columns::{self, data_column};
use crate::db::gate::Gate;
use crate::db::{Database, RowCursor};
use crate::error::{CodecError, Error, Result};
use crate::ids::{IdGenerator, UuidGenerator};

pub use crate::db::Table;
pub use pending::{PendingEntry, PendingState};

/// A decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T = Value> {
  pub id: String,
  pub timestamp: DateTime<Utc>,
  pub data: T,
  /// Claim token; only ever set on `pending` rows.
  pub job_id: Option<String>,
}

/// How to locate a record: by primary key or by payload equality.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a, V: ?Sized> {
  Id(&'a str),
  Content(&'a V),
}

/// Options for opening a [`RecordStore`].
#[derive(Clone)]
pub struct StoreOptions {
  /// Database file; `None` keeps everything in memory.
  pub path: Option<PathBuf>,
  pub transform: Arc<dyn PayloadTransform>,
  pub fragment_size: usize,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      path: None,
      transform: TransformKind::default().build(),
      fragment_size: MAX_FRAGMENT_SIZE,
    }
  }
}

impl StoreOptions {
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      path: Some(path.into()),
      ..Self::default()
    }
  }

  pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
    self.transform = transform;
    self
  }

  pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
    self.fragment_size = fragment_size;
    self
  }
}

/// Sole owner of every stored record.
pub struct RecordStore {
  db: Database,
  gate: Gate,
  codec: PayloadCodec,
  ids: Arc<dyn IdGenerator>,
}

impl RecordStore {
  pub fn new(db: Database, codec: PayloadCodec, ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      db,
      gate: Gate::new("offline-store"),
      codec,
      ids,
    }
  }

  /// Open the database described by `options` with random UUID ids.
  pub fn open(options: &StoreOptions) -> Result<Self> {
    let db = match &options.path {
      Some(path) => Database::open(path)?,
      None => Database::open_in_memory()?,
    };
    let codec =
      PayloadCodec::new(Arc::clone(&options.transform)).with_fragment_size(options.fragment_size);
    Ok(Self::new(db, codec, Arc::new(UuidGenerator)))
  }

  pub fn codec(&self) -> &PayloadCodec {
    &self.codec
  }

  pub fn ids(&self) -> &dyn IdGenerator {
    self.ids.as_ref()
  }

  /// Upsert `value` under `id`, generating an id when none is given.
  ///
  /// Schema growth, delete, insert and the fragment updates run as one gated
  /// step, the last three inside a single transaction.
  pub async fn put<T: Serialize + ?Sized>(
    &self,
    table: Table,
    value: &T,
    id: Option<&str>,
  ) -> Result<String> {
    let fragments = self.codec.encode(value)?;
    let id = id.map(str::to_string).unwrap_or_else(|| self.ids.new_id());
    let timestamp = now_timestamp();

    self
      .gate
      .with_exclusive_access(|| async {
        self
          .db
          .with_conn(|conn| write_record(conn, table, &id, &timestamp, &fragments))
      })
      .await?;

    tracing::trace!(table = %table, id = %id, fragments = fragments.len(), "stored record");
    Ok(id)
  }

  /// Id of the row holding `value`, inserting it first if no row does.
  ///
  /// The lookup and the insert happen under one gate acquisition, so two
  /// concurrent callers with equal content end up sharing a single row.
  pub async fn put_unique<T: Serialize + ?Sized>(&self, table: Table, value: &T) -> Result<String> {
    let fragments = self.codec.encode(value)?;

    self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          if let Some(id) = find_id_by_fragments(conn, table, &fragments)? {
            return Ok(id);
          }
          let id = self.ids.new_id();
          write_record(conn, table, &id, &now_timestamp(), &fragments)?;
          Ok(id)
        })
      })
      .await
  }

  /// Fetch a record by id or by content.
  pub async fn get<T, V>(&self, table: Table, lookup: Lookup<'_, V>) -> Result<Option<Record<T>>>
  where
    T: DeserializeOwned,
    V: Serialize + ?Sized,
  {
    match lookup {
      Lookup::Id(id) => self.get_by_id(table, id).await,
      Lookup::Content(value) => self.find(table, value).await,
    }
  }

  pub async fn get_by_id<T: DeserializeOwned>(
    &self,
    table: Table,
    id: &str,
  ) -> Result<Option<Record<T>>> {
    let raw = self.db.with_conn(|conn| read_raw(conn, table, id))?;
    raw.map(|raw| self.decode_raw(raw)).transpose()
  }

  /// Find the record whose payload encodes to the same fragments as `value`.
  ///
  /// Candidate ids are narrowed one fragment column at a time. More than one
  /// survivor means the table holds duplicate content.
  pub async fn find<T, V>(&self, table: Table, value: &V) -> Result<Option<Record<T>>>
  where
    T: DeserializeOwned,
    V: Serialize + ?Sized,
  {
    let fragments = self.codec.encode(value)?;
    let id = self
      .db
      .with_conn(|conn| find_id_by_fragments(conn, table, &fragments))?;

    match id {
      Some(id) => self.get_by_id(table, &id).await,
      None => Ok(None),
    }
  }

  /// Current number of fragment columns on `table`.
  pub fn column_count(&self, table: Table) -> Result<usize> {
    self
      .db
      .with_conn(|conn| Ok(columns::column_names(conn, table)?.len()))
  }

  /// Number of rows in `table`.
  pub fn count(&self, table: Table) -> Result<usize> {
    self.db.with_conn(|conn| {
      let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM '{}'", table.name()),
        [],
        |row| row.get(0),
      )?;
      Ok(n as usize)
    })
  }

  /// Drop every row and every grown column of `table`. Irreversible.
  pub async fn drop_table(&self, table: Table) -> Result<()> {
    self
      .gate
      .with_exclusive_access(|| async {
        self.db.with_conn(|conn| {
          conn.execute_batch(&format!("DROP TABLE IF EXISTS '{}'", table.name()))?;
          conn.execute_batch(&table.create_sql())?;
          Ok(())
        })
      })
      .await?;
    tracing::info!(table = %table, "dropped table");
    Ok(())
  }

  /// Drop all three tables. Irreversible.
  pub async fn drop_all_tables(&self) -> Result<()> {
    self
      .gate
      .with_exclusive_access(|| async { self.db.drop_all_tables() })
      .await?;
    tracing::info!("dropped all offline tables");
    Ok(())
  }

  /// Close the database once every queued write has finished.
  pub async fn close(&self) -> Result<()> {
    self
      .gate
      .with_exclusive_access(|| async { self.db.close() })
      .await
  }

  fn decode_raw<T: DeserializeOwned>(&self, raw: RawRecord) -> Result<Record<T>> {
    let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
      .map_err(|e| CodecError(format!("invalid timestamp '{}': {}", raw.timestamp, e)))?
      .with_timezone(&Utc);
    let data = self.codec.decode(&raw.fragments)?;
    Ok(Record {
      id: raw.id,
      timestamp,
      data,
      job_id: raw.job_id,
    })
  }
}

/// A row as stored, before the payload is decoded.
struct RawRecord {
  id: String,
  timestamp: String,
  job_id: Option<String>,
  fragments: Vec<String>,
}

/// ISO-8601 UTC with millisecond precision.
fn now_timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_record(
  conn: &mut Connection,
  table: Table,
  id: &str,
  timestamp: &str,
  fragments: &[String],
) -> Result<()> {
  columns::ensure_columns(conn, table, fragments.len())?;

  let name = table.name();
  let tx = conn.transaction()?;
  tx.execute(&format!("DELETE FROM '{}' WHERE id = ?1", name), params![id])?;
  tx.execute(
    &format!("INSERT INTO '{}' (id, timestamp) VALUES (?1, ?2)", name),
    params![id, timestamp],
  )?;
  for (index, fragment) in fragments.iter().enumerate() {
    tx.execute(
      &format!("UPDATE '{}' SET {} = ?1 WHERE id = ?2", name, data_column(index)),
      params![fragment, id],
    )?;
  }
  tx.commit()?;
  Ok(())
}

fn read_raw(conn: &Connection, table: Table, id: &str) -> Result<Option<RawRecord>> {
  let data_columns = columns::column_names(conn, table)?;
  let mut fields = vec!["id".to_string(), "timestamp".to_string()];
  if table.is_outbox() {
    fields.push("jobid".to_string());
  }
  fields.extend(data_columns.iter().cloned());

  let mut stmt = conn.prepare(&format!(
    "SELECT {} FROM '{}' WHERE id = ?1",
    fields.join(", "),
    table.name()
  ))?;
  let mut rows = stmt.query(params![id])?;
  let Some(row) = rows.next()? else {
    return Ok(None);
  };

  let job_id = if table.is_outbox() {
    row.get_string("jobid")?
  } else {
    None
  };

  // Fragments are contiguous from data0; the first NULL ends the payload.
  let mut fragments = Vec::with_capacity(data_columns.len());
  for column in &data_columns {
    match row.get_string(column)? {
      Some(fragment) => fragments.push(fragment),
      None => break,
    }
  }

  Ok(Some(RawRecord {
    id: row.get_string("id")?.unwrap_or_default(),
    timestamp: row.get_string("timestamp")?.unwrap_or_default(),
    job_id,
    fragments,
  }))
}

/// Ids in `table` matching `predicate`, optionally restricted to `within`.
fn select_ids(
  conn: &Connection,
  table: Table,
  predicate: &str,
  value: Option<&str>,
  within: Option<&[String]>,
) -> Result<Vec<String>> {
  let mut sql = format!("SELECT id FROM '{}' WHERE {}", table.name(), predicate);
  let mut args: Vec<&str> = value.into_iter().collect();
  if let Some(ids) = within {
    let placeholders = vec!["?"; ids.len()].join(", ");
    sql.push_str(&format!(" AND id IN ({})", placeholders));
    args.extend(ids.iter().map(String::as_str));
  }

  let mut stmt = conn.prepare(&sql)?;
  let mut rows = stmt.query(params_from_iter(args))?;
  let mut ids = Vec::new();
  while let Some(row) = rows.next()? {
    if let Some(id) = row.get_string("id")? {
      ids.push(id);
    }
  }
  Ok(ids)
}

fn find_id_by_fragments(
  conn: &Connection,
  table: Table,
  fragments: &[String],
) -> Result<Option<String>> {
  let data_columns = columns::column_names(conn, table)?;
  if fragments.len() > data_columns.len() {
    // No row was ever written with this many fragments.
    return Ok(None);
  }

  let mut candidates: Option<Vec<String>> = None;
  for (index, fragment) in fragments.iter().enumerate() {
    let predicate = format!("{} = ?", data_columns[index]);
    let ids = select_ids(conn, table, &predicate, Some(fragment), candidates.as_deref())?;
    if ids.is_empty() {
      return Ok(None);
    }
    candidates = Some(ids);
  }

  // A longer payload can share every one of our fragments as a prefix.
  if let Some(next) = data_columns.get(fragments.len()) {
    let predicate = format!("{} IS NULL", next);
    candidates = Some(select_ids(conn, table, &predicate, None, candidates.as_deref())?);
  }

  let mut ids = candidates.unwrap_or_default();
  match ids.len() {
    0 => Ok(None),
    1 => Ok(ids.pop()),
    matches => Err(Error::StoreCorruption { table, matches }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> RecordStore {
    RecordStore::open(&StoreOptions::default()).unwrap()
  }

  fn small_fragment_store() -> RecordStore {
    RecordStore::open(&StoreOptions::default().with_fragment_size(16)).unwrap()
  }

  #[tokio::test]
  async fn test_put_and_get_by_id() {
    let store = store();
    let value = json!({"url": "https://api.example.com/items", "method": "GET"});
    let id = store.put(Table::Requests, &value, None).await.unwrap();

    let record: Record = store.get_by_id(Table::Requests, &id).await.unwrap().unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.data, value);
    assert_eq!(record.job_id, None);
  }

  #[tokio::test]
  async fn test_get_missing_id() {
    let store = store();
    let record: Option<Record> = store.get_by_id(Table::Requests, "nope").await.unwrap();
    assert!(record.is_none());
  }

  #[tokio::test]
  async fn test_put_with_same_id_replaces() {
    let store = small_fragment_store();
    let long = json!({"body": "a long payload that needs several fragments"});
    let short = json!({"b": 1});

    store.put(Table::Responses, &long, Some("r1")).await.unwrap();
    store.put(Table::Responses, &short, Some("r1")).await.unwrap();

    assert_eq!(store.count(Table::Responses).unwrap(), 1);
    let record: Record = store.get_by_id(Table::Responses, "r1").await.unwrap().unwrap();
    assert_eq!(record.data, short);
  }

  #[tokio::test]
  async fn test_find_by_content() {
    let store = store();
    let v1 = json!({"url": "/a", "method": "GET"});
    let v2 = json!({"url": "/b", "method": "GET"});
    let id1 = store.put(Table::Requests, &v1, None).await.unwrap();
    let id2 = store.put(Table::Requests, &v2, None).await.unwrap();

    let found: Record = store.find(Table::Requests, &v1).await.unwrap().unwrap();
    assert_eq!(found.id, id1);
    let found: Record = store.find(Table::Requests, &v2).await.unwrap().unwrap();
    assert_eq!(found.id, id2);

    let missing: Option<Record> = store
      .find(Table::Requests, &json!({"url": "/c"}))
      .await
      .unwrap();
    assert!(missing.is_none());
  }

  #[tokio::test]
  async fn test_find_multi_fragment_content() {
    let store = small_fragment_store();
    let v1 = json!({"url": "/same/prefix/for/both", "body": {"n": 1}});
    let v2 = json!({"url": "/same/prefix/for/both", "body": {"n": 2}});
    let id1 = store.put(Table::Requests, &v1, None).await.unwrap();
    let id2 = store.put(Table::Requests, &v2, None).await.unwrap();
    assert!(store.codec().encode(&v1).unwrap().len() > 2);

    let found: Record = store.find(Table::Requests, &v1).await.unwrap().unwrap();
    assert_eq!(found.id, id1);
    let found: Record = store.find(Table::Requests, &v2).await.unwrap().unwrap();
    assert_eq!(found.id, id2);
  }

  #[tokio::test]
  async fn test_find_does_not_match_longer_payload_with_same_prefix() {
    let store = RecordStore::open(
      &StoreOptions::default()
        .with_transform(Arc::new(crate::codec::IdentityTransform))
        .with_fragment_size(4),
    )
    .unwrap();
    // "1234" is exactly one fragment and also the first fragment of "12345".
    store.put(Table::Requests, &json!(12345), None).await.unwrap();

    let found: Option<Record> = store.find(Table::Requests, &json!(1234)).await.unwrap();
    assert!(found.is_none());
  }

  #[tokio::test]
  async fn test_duplicate_content_is_corruption() {
    let store = store();
    let value = json!({"url": "/dup"});
    store.put(Table::Requests, &value, Some("a")).await.unwrap();
    store.put(Table::Requests, &value, Some("b")).await.unwrap();

    let result: Result<Option<Record>> = store.find(Table::Requests, &value).await;
    assert!(matches!(
      result,
      Err(Error::StoreCorruption {
        table: Table::Requests,
        matches: 2
      })
    ));
  }

  #[tokio::test]
  async fn test_put_unique_reuses_existing_row() {
    let store = Arc::new(store());
    let value = json!({"url": "/unique"});

    let mut handles = Vec::new();
    for _ in 0..8 {
      let store = Arc::clone(&store);
      let value = value.clone();
      handles.push(tokio::spawn(async move {
        store.put_unique(Table::Requests, &value).await.unwrap()
      }));
    }
    let mut ids = Vec::new();
    for handle in handles {
      ids.push(handle.await.unwrap());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.count(Table::Requests).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_lookup_enum() {
    let store = store();
    let value = json!({"k": "v"});
    let id = store.put(Table::Requests, &value, None).await.unwrap();

    let by_id: Record = store
      .get(Table::Requests, Lookup::<Value>::Id(&id))
      .await
      .unwrap()
      .unwrap();
    let by_content: Record = store
      .get(Table::Requests, Lookup::Content(&value))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(by_id, by_content);
  }

  #[tokio::test]
  async fn test_column_growth_is_monotonic() {
    let store = small_fragment_store();
    assert_eq!(store.column_count(Table::Responses).unwrap(), 1);

    let big = json!({"payload": "x".repeat(100)});
    let needed = store.codec().encode(&big).unwrap().len();
    store.put(Table::Responses, &big, None).await.unwrap();
    assert!(store.column_count(Table::Responses).unwrap() >= needed);

    store.put(Table::Responses, &json!({}), None).await.unwrap();
    assert!(store.column_count(Table::Responses).unwrap() >= needed);
  }

  #[tokio::test]
  async fn test_drop_table_resets_rows_and_columns() {
    let store = small_fragment_store();
    store
      .put(Table::Requests, &json!({"payload": "y".repeat(64)}), None)
      .await
      .unwrap();
    assert!(store.column_count(Table::Requests).unwrap() > 1);

    store.drop_table(Table::Requests).await.unwrap();
    assert_eq!(store.count(Table::Requests).unwrap(), 0);
    assert_eq!(store.column_count(Table::Requests).unwrap(), 1);

    // Still usable afterwards
    store.put(Table::Requests, &json!(1), None).await.unwrap();
    assert_eq!(store.count(Table::Requests).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_drop_all_tables() {
    let store = store();
    for table in Table::ALL {
      store.put(table, &json!({"t": table.name()}), None).await.unwrap();
    }
    store.drop_all_tables().await.unwrap();
    for table in Table::ALL {
      assert_eq!(store.count(table).unwrap(), 0);
    }
  }

  #[tokio::test]
  async fn test_concurrent_puts_do_not_interleave() {
    let store = Arc::new(small_fragment_store());
    let mut handles = Vec::new();
    for i in 0..20 {
      let store = Arc::clone(&store);
      handles.push(tokio::spawn(async move {
        let value = json!({"i": i, "pad": "z".repeat(i * 7)});
        store.put(Table::Responses, &value, Some("shared")).await.unwrap();
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    assert_eq!(store.count(Table::Responses).unwrap(), 1);
    let record: Record = store.get_by_id(Table::Responses, "shared").await.unwrap().unwrap();
    let i = record.data["i"].as_u64().unwrap() as usize;
    assert_eq!(record.data["pad"], json!("z".repeat(i * 7)));
  }

  #[tokio::test]
  async fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions::at(dir.path().join("service-call.sqlite"));
    let value = json!({"persisted": true});

    let id = {
      let store = RecordStore::open(&options).unwrap();
      let id = store.put(Table::Pending, &value, None).await.unwrap();
      store.close().await.unwrap();
      id
    };

    let store = RecordStore::open(&options).unwrap();
    let record: Record = store.get_by_id(Table::Pending, &id).await.unwrap().unwrap();
    assert_eq!(record.data, value);
  }

  #[tokio::test]
  async fn test_closed_store() {
    let store = store();
    store.close().await.unwrap();
    let result = store.put(Table::Requests, &json!(1), None).await;
    assert!(matches!(result, Err(Error::StoreClosed)));
  }
}
