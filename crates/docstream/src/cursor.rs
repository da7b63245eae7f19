//! Record cursor: save, remove and lazy load over a logical connection.
//!
//! A [`Cursor`] carries the usual record-stream fields (filter, sort, limit,
//! skip) and implements [`Stream`]. Nothing happens until the first poll,
//! which starts one load cycle:
//!
//! ```text
//! poll_next → load()
//!   → open()                       (acquire shared client)
//!   → find(filter, options)
//!     → each document: _id → id, push downstream
//!     → end:   done(), end of stream
//!     → error: done(), push error, end of stream
//! ```
//!
//! Records travel through a bounded channel, so the driver stream only
//! advances as fast as the consumer pulls.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bson::Document;
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::LogicalConnection;
use crate::driver::{FindOptions, NATIVE_ID_FIELD, SaveOutcome, SortDirection};
use crate::error::{Error, Result};
use crate::ident::{self, ID_FIELD, Record};

/// Records buffered between the load task and the consumer.
const READ_AHEAD: usize = 16;

pub struct Cursor {
    conn: LogicalConnection,
    query: Record,
    sort: Vec<(String, SortDirection)>,
    limit: Option<u64>,
    skip: Option<u64>,
    /// Set while a load cycle runs; makes `load` idempotent.
    reading: Arc<AtomicBool>,
    rx: Option<mpsc::Receiver<Result<Record>>>,
    finished: bool,
}

impl Cursor {
    pub(crate) fn new(conn: LogicalConnection) -> Self {
        Self {
            conn,
            query: Record::new(),
            sort: Vec::new(),
            limit: None,
            skip: None,
            reading: Arc::new(AtomicBool::new(false)),
            rx: None,
            finished: false,
        }
    }

    /// Only load records matching `query`. An `id` key matches on the
    /// native identifier.
    pub fn filter(self, query: Record) -> Self {
        Self { query, ..self }
    }

    /// Append a sort key. Earlier keys take precedence.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    /// Load at most `limit` records. Zero means no limit.
    pub fn limit(self, limit: u64) -> Self {
        Self {
            limit: Some(limit).filter(|n| *n > 0),
            ..self
        }
    }

    /// Skip the first `skip` matching records.
    pub fn skip(self, skip: u64) -> Self {
        Self {
            skip: Some(skip).filter(|n| *n > 0),
            ..self
        }
    }

    pub fn connection(&self) -> &LogicalConnection {
        &self.conn
    }

    /// Whether a load cycle is currently running.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Insert or update `record`.
    ///
    /// On insert the stored record, with its new `id`, is merged into
    /// `record` in place.
    pub async fn save(&self, record: &mut Record) -> Result<()> {
        let lease = self.conn.open().await?;
        let doc = ident::record_to_document(record);
        let outcome = lease.collection().save(doc).await;
        lease.done();

        match outcome.map_err(Error::operation)? {
            SaveOutcome::Inserted(stored) => {
                ident::merge_in_place(record, ident::document_to_record(stored));
                debug!(
                    collection = %self.conn.collection(),
                    id = ?record.get(ID_FIELD),
                    "record inserted"
                );
            }
            SaveOutcome::Updated(count) => {
                debug!(collection = %self.conn.collection(), count = count, "record updated");
            }
        }
        Ok(())
    }

    /// Delete the stored record with `record`'s id.
    ///
    /// A record without a usable id is rejected before any connection is
    /// opened: missing, `null`, `false`, zero and the empty string all count
    /// as no id.
    pub async fn remove(&self, record: &Record) -> Result<()> {
        let id = record
            .get(ID_FIELD)
            .filter(|id| !is_blank_id(id))
            .ok_or_else(|| {
                Error::Validation("unable to remove a record without an id".to_string())
            })?;

        let lease = self.conn.open().await?;
        let mut filter = Document::new();
        filter.insert(NATIVE_ID_FIELD, ident::to_native_id(id));
        let outcome = lease.collection().remove(filter).await;
        lease.done();

        let removed = outcome.map_err(Error::operation)?;
        debug!(collection = %self.conn.collection(), removed = removed, "record removed");
        Ok(())
    }

    /// Start a load cycle unless one is already running.
    ///
    /// Must be called from within a tokio runtime. Polling the cursor calls
    /// this on first use; call it explicitly to reload after the stream ended.
    pub fn load(&mut self) {
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        self.rx = Some(rx);
        self.finished = false;

        let task = LoadTask {
            conn: self.conn.clone(),
            filter: ident::query_to_document(&self.query),
            options: self.find_options(),
            reading: Arc::clone(&self.reading),
            tx,
        };
        tokio::spawn(task.run());
    }

    /// Run one load cycle to completion and collect every record.
    pub async fn to_vec(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    fn find_options(&self) -> FindOptions {
        FindOptions {
            limit: self.limit,
            skip: self.skip,
            sort: self
                .sort
                .iter()
                .map(|(field, direction)| (ident::sort_field_to_native(field), *direction))
                .collect(),
        }
    }
}

impl Stream for Cursor {
    type Item = Result<Record>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.rx.is_none() {
            this.load();
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(None) => {
                this.rx = None;
                this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("collection", &self.conn.collection())
            .field("query", &self.query)
            .field("sort", &self.sort)
            .field("limit", &self.limit)
            .field("skip", &self.skip)
            .field("reading", &self.is_reading())
            .finish_non_exhaustive()
    }
}

fn is_blank_id(id: &Value) -> bool {
    match id {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// State moved into the spawned load task.
struct LoadTask {
    conn: LogicalConnection,
    filter: Document,
    options: FindOptions,
    reading: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<Record>>,
}

impl LoadTask {
    async fn run(self) {
        let LoadTask {
            conn,
            filter,
            options,
            reading,
            tx,
        } = self;

        let outcome = drain(&conn, filter, options, &tx).await;
        // The lease is already released; reset before the terminal signal so
        // a consumer reacting to it can start another cycle.
        reading.store(false, Ordering::Release);
        if let Err(err) = outcome {
            debug!(collection = %conn.collection(), error = %err, "load failed");
            let _ = tx.send(Err(err)).await;
        }
    }
}

async fn drain(
    conn: &LogicalConnection,
    filter: Document,
    options: FindOptions,
    tx: &mpsc::Sender<Result<Record>>,
) -> Result<()> {
    // A failed open holds nothing, so nothing is released here.
    let lease = conn.open().await?;
    let mut stream = lease
        .collection()
        .find(filter, options)
        .await
        .map_err(Error::operation)?;

    let mut count = 0u64;
    while let Some(item) = stream.next().await {
        let doc = item.map_err(Error::operation)?;
        if tx.send(Ok(ident::document_to_record(doc))).await.is_err() {
            debug!(collection = %conn.collection(), "cursor dropped mid-load");
            return Ok(());
        }
        count += 1;
    }
    lease.done();
    debug!(collection = %conn.collection(), count = count, "load drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::ConnectOptions;
    use crate::memory::MemoryDriver;
    use crate::pool::ConnectionPool;

    const ADDR: &str = "mem://cursor";

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup() -> (MemoryDriver, ConnectionPool, LogicalConnection) {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let conn = pool.connect(ADDR, ConnectOptions::new("items")).unwrap();
        (driver, pool, conn)
    }

    #[test]
    fn zero_limit_and_skip_are_unset() {
        let (_, _, conn) = setup();
        let cursor = conn.cursor().limit(0).skip(0);
        let options = cursor.find_options();
        assert_eq!(options.limit, None);
        assert_eq!(options.skip, None);
    }

    #[test]
    fn find_options_map_sort_pairs() {
        let (_, _, conn) = setup();
        let cursor = conn
            .cursor()
            .sort("id", SortDirection::Descending)
            .sort("name", SortDirection::Ascending)
            .limit(5)
            .skip(2);
        let options = cursor.find_options();
        assert_eq!(options.limit, Some(5));
        assert_eq!(options.skip, Some(2));
        assert_eq!(
            options.sort,
            vec![
                ("_id".to_string(), SortDirection::Descending),
                ("name".to_string(), SortDirection::Ascending),
            ]
        );
    }

    #[tokio::test]
    async fn save_assigns_id_in_place() {
        let (_, _, conn) = setup();
        let cursor = conn.cursor();
        let mut rec = record(json!({"hello": "world"}));

        cursor.save(&mut rec).await.unwrap();
        let id = rec.get("id").and_then(Value::as_str).unwrap();
        assert_eq!(id.len(), 24);
        assert_eq!(rec.get("hello"), Some(&json!("world")));
    }

    #[tokio::test]
    async fn remove_without_id_never_connects() {
        let (driver, pool, conn) = setup();
        let err = conn.cursor().remove(&record(json!({"a": 1}))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        for blank in [json!(null), json!(""), json!(false), json!(0), json!(0.0)] {
            let err = conn
                .cursor()
                .remove(&record(json!({"id": blank})))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{blank} should be rejected");
        }
        assert_eq!(driver.connect_count(), 0);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn remove_accepts_non_blank_scalar_ids() {
        let (driver, _pool, conn) = setup();
        for id in [json!(7), json!(true), json!("legacy-key")] {
            conn.cursor().remove(&record(json!({"id": id}))).await.unwrap();
        }
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn load_is_idempotent_while_reading() {
        let (_, _, conn) = setup();
        let mut cursor = conn.cursor();
        cursor.load();
        assert!(cursor.is_reading());
        cursor.load();
        let records = cursor.to_vec().await.unwrap();
        assert!(records.is_empty());
        assert!(!cursor.is_reading());
    }

    #[tokio::test]
    async fn ended_stream_stays_ended_until_reloaded() {
        let (_, _, conn) = setup();
        let writer = conn.cursor();
        writer.save(&mut record(json!({"n": 1}))).await.unwrap();

        let mut cursor = conn.cursor();
        assert_eq!(cursor.to_vec().await.unwrap().len(), 1);
        assert!(cursor.next().await.is_none());

        cursor.load();
        assert_eq!(cursor.to_vec().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_failure_is_terminal_and_resets_guard() {
        let (driver, pool, conn) = setup();
        driver.fail_next_connects(1, "connection refused");

        let mut cursor = conn.cursor();
        let first = cursor.next().await.unwrap();
        assert!(matches!(first, Err(Error::Connect(_))));
        assert!(cursor.next().await.is_none());
        assert!(!cursor.is_reading());
        assert!(pool.is_empty());

        // The guard was reset, so a retry goes through.
        cursor.load();
        assert!(cursor.to_vec().await.unwrap().is_empty());
    }
}
