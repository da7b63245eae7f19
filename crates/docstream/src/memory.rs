//! In-process reference driver.
//!
//! [`MemoryDriver`] keeps one set of collections per address, so data
//! survives a client being closed and reopened, the same way a real server
//! would. It counts connects and closes and can be told to fail upcoming
//! connects, which makes it the driver of choice for tests.
//!
//! Filters support equality (including array membership), `$eq`, `$ne`,
//! `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, and top-level
//! `$and` / `$or`. Dotted paths reach into embedded documents.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use futures_util::StreamExt;
use tracing::debug;

use crate::config::ConnectOptions;
use crate::driver::{
    Client, Collection, DocumentStream, Driver, DriverError, FindOptions, NATIVE_ID_FIELD,
    SaveOutcome, SortDirection,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle; clones share storage and counters.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    connects: AtomicU64,
    closes: AtomicU64,
    connect_failures: Mutex<VecDeque<String>>,
    connect_latency: Mutex<Duration>,
}

#[derive(Default)]
struct MemoryDatabase {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: make every connect take `latency`.
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        *lock(&self.inner.connect_latency) = latency;
        self
    }

    /// Fail the next `count` connect calls with `message`.
    pub fn fail_next_connects(&self, count: usize, message: &str) {
        let mut failures = lock(&self.inner.connect_failures);
        failures.extend(std::iter::repeat_n(message.to_string(), count));
    }

    /// Connect calls made so far, failed ones included.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Clients closed so far.
    pub fn close_count(&self) -> u64 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Copy of every document stored in `collection` at `address`.
    pub fn documents(&self, address: &str, collection: &str) -> Vec<Document> {
        let databases = lock(&self.inner.databases);
        databases
            .get(address)
            .and_then(|db| lock(&db.collections).get(collection).cloned())
            .map(|coll| lock(&coll.docs).clone())
            .unwrap_or_default()
    }

    fn database(&self, address: &str) -> Arc<MemoryDatabase> {
        let mut databases = lock(&self.inner.databases);
        Arc::clone(databases.entry(address.to_string()).or_default())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(
        &self,
        address: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Client>, DriverError> {
        let attempt = self.inner.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *lock(&self.inner.connect_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failure = lock(&self.inner.connect_failures).pop_front();
        if let Some(message) = failure {
            debug!(address = %address, attempt = attempt, "memory connect failed on request");
            return Err(DriverError::new(message));
        }
        Ok(Arc::new(MemoryClient {
            database: self.database(address),
            driver: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    database: Arc<MemoryDatabase>,
    driver: Arc<MemoryInner>,
    closed: AtomicBool,
}

#[async_trait]
impl Client for MemoryClient {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        let mut collections = lock(&self.database.collections);
        let coll: Arc<MemoryCollection> = Arc::clone(collections.entry(name.to_string()).or_default());
        coll
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.driver.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct MemoryCollection {
    docs: Mutex<Vec<Document>>,
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn save(&self, mut doc: Document) -> Result<SaveOutcome, DriverError> {
        if !doc.contains_key(NATIVE_ID_FIELD) {
            doc.insert(NATIVE_ID_FIELD, ObjectId::new());
        }
        let id = doc.get(NATIVE_ID_FIELD).cloned().unwrap_or(Bson::Null);

        let mut docs = lock(&self.docs);
        let before = docs.len();
        docs.retain(|stored| stored.get(NATIVE_ID_FIELD) != Some(&id));
        let replaced = before - docs.len();
        docs.push(doc.clone());

        if replaced > 0 {
            Ok(SaveOutcome::Updated(replaced as u64))
        } else {
            Ok(SaveOutcome::Inserted(doc))
        }
    }

    async fn remove(&self, filter: Document) -> Result<u64, DriverError> {
        let mut docs = lock(&self.docs);
        let before = docs.len();
        docs.retain(|doc| !matches_filter(doc, &filter));
        Ok((before - docs.len()) as u64)
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<DocumentStream, DriverError> {
        let mut results: Vec<Document> = lock(&self.docs)
            .iter()
            .filter(|doc| matches_filter(doc, &filter))
            .cloned()
            .collect();

        if !options.sort.is_empty() {
            results.sort_by(|a, b| compare_by_keys(a, b, &options.sort));
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map_or(usize::MAX, |n| n as usize);
        let page: Vec<Document> = results.into_iter().skip(skip).take(limit).collect();

        Ok(futures_util::stream::iter(page.into_iter().map(Ok)).boxed())
    }
}

// ── Filter evaluation ───────────────────────────────────────────────

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, cond)| match (key.as_str(), cond) {
        ("$and", Bson::Array(clauses)) => clauses.iter().all(|c| clause_matches(doc, c)),
        ("$or", Bson::Array(clauses)) => clauses.iter().any(|c| clause_matches(doc, c)),
        (path, cond) => field_matches(lookup(doc, path), cond),
    })
}

fn clause_matches(doc: &Document, clause: &Bson) -> bool {
    match clause {
        Bson::Document(filter) => matches_filter(doc, filter),
        _ => false,
    }
}

fn is_operator_doc(cond: &Bson) -> Option<&Document> {
    match cond {
        Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => Some(ops),
        _ => None,
    }
}

fn field_matches(value: Option<&Bson>, cond: &Bson) -> bool {
    let Some(ops) = is_operator_doc(cond) else {
        return equals_or_contains(value, cond);
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => equals_or_contains(value, operand),
        "$ne" => !equals_or_contains(value, operand),
        "$gt" => ordered(value, operand, |o| o == CmpOrdering::Greater),
        "$gte" => ordered(value, operand, |o| o != CmpOrdering::Less),
        "$lt" => ordered(value, operand, |o| o == CmpOrdering::Less),
        "$lte" => ordered(value, operand, |o| o != CmpOrdering::Greater),
        "$in" => match operand {
            Bson::Array(items) => items.iter().any(|item| equals_or_contains(value, item)),
            _ => false,
        },
        "$nin" => match operand {
            Bson::Array(items) => !items.iter().any(|item| equals_or_contains(value, item)),
            _ => true,
        },
        "$exists" => value.is_some() == matches!(operand, Bson::Boolean(true)),
        _ => false,
    })
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| bson_eq(item, expected))
        }
        Some(actual) => bson_eq(actual, expected),
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(CmpOrdering) -> bool) -> bool {
    value
        .and_then(|v| compare_same_kind(v, operand))
        .is_some_and(accept)
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Compare values of the same kind; numbers compare across widths.
fn compare_same_kind(a: &Bson, b: &Bson) -> Option<CmpOrdering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(CmpOrdering::Equal),
        _ => None,
    }
}

/// Cross-type order used for sorting: missing/null, numbers, strings,
/// documents, arrays, object ids, booleans, dates.
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) => 0,
        Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
        Some(Bson::String(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::ObjectId(_)) => 5,
        Some(Bson::Boolean(_)) => 6,
        Some(Bson::DateTime(_)) => 7,
        Some(_) => 8,
    }
}

fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> CmpOrdering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_kind(x, y).unwrap_or(CmpOrdering::Equal),
        _ => CmpOrdering::Equal,
    }
}

fn compare_by_keys(a: &Document, b: &Document, keys: &[(String, SortDirection)]) -> CmpOrdering {
    for (field, direction) in keys {
        let ord = compare_values(lookup(a, field), lookup(b, field));
        let ord = match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    CmpOrdering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    async fn collect(coll: &MemoryCollection, filter: Document, options: FindOptions) -> Vec<Document> {
        let stream = coll.find(filter, options).await.unwrap();
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn save_inserts_then_updates() {
        let coll = MemoryCollection::default();
        let SaveOutcome::Inserted(stored) = coll.save(doc! {"a": 1}).await.unwrap() else {
            panic!("expected insert");
        };
        let id = stored.get_object_id("_id").unwrap();

        let outcome = coll.save(doc! {"_id": id, "a": 2}).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Updated(1));

        let all = collect(&coll, Document::new(), FindOptions::default()).await;
        assert_eq!(all, vec![doc! {"_id": id, "a": 2}]);
    }

    #[tokio::test]
    async fn remove_by_filter() {
        let coll = MemoryCollection::default();
        coll.save(doc! {"_id": "x", "k": 1}).await.unwrap();
        coll.save(doc! {"_id": "y", "k": 2}).await.unwrap();

        assert_eq!(coll.remove(doc! {"_id": "x"}).await.unwrap(), 1);
        assert_eq!(coll.remove(doc! {"_id": "x"}).await.unwrap(), 0);
        assert_eq!(collect(&coll, Document::new(), FindOptions::default()).await.len(), 1);
    }

    #[test]
    fn filter_operators() {
        let d = doc! {"n": 5_i64, "s": "abc", "tags": ["a", "b"], "sub": {"x": 1}};
        assert!(matches_filter(&d, &doc! {"n": 5_i32}));
        assert!(matches_filter(&d, &doc! {"n": {"$gt": 4, "$lte": 5.0}}));
        assert!(!matches_filter(&d, &doc! {"n": {"$lt": 5}}));
        assert!(matches_filter(&d, &doc! {"s": {"$in": ["zzz", "abc"]}}));
        assert!(matches_filter(&d, &doc! {"s": {"$nin": ["zzz"]}}));
        assert!(matches_filter(&d, &doc! {"tags": "b"}));
        assert!(matches_filter(&d, &doc! {"sub.x": 1}));
        assert!(matches_filter(&d, &doc! {"missing": {"$exists": false}}));
        assert!(matches_filter(&d, &doc! {"$or": [{"n": 1}, {"s": "abc"}]}));
        assert!(!matches_filter(&d, &doc! {"$and": [{"n": 5}, {"s": "nope"}]}));
        assert!(matches_filter(&d, &doc! {"s": {"$ne": "xyz"}}));
    }

    #[tokio::test]
    async fn find_sorts_skips_and_limits() {
        let coll = MemoryCollection::default();
        for (name, age) in [("d", 30), ("a", 20), ("c", 30), ("b", 10)] {
            coll.save(doc! {"name": name, "age": age}).await.unwrap();
        }
        let options = FindOptions {
            sort: vec![
                ("age".to_string(), SortDirection::Descending),
                ("name".to_string(), SortDirection::Ascending),
            ],
            skip: Some(1),
            limit: Some(2),
        };
        let names: Vec<String> = collect(&coll, Document::new(), options)
            .await
            .iter()
            .map(|d| d.get_str("name").unwrap().to_string())
            .collect();
        assert_eq!(names, ["d", "a"]);
    }

    #[tokio::test]
    async fn data_outlives_clients() {
        let driver = MemoryDriver::new();
        let options = ConnectOptions::new("c");
        let client = driver.connect("mem://x", &options).await.unwrap();
        client.collection("c").save(doc! {"v": 1}).await.unwrap();
        client.close().await;
        client.close().await;
        assert_eq!(driver.close_count(), 1);

        let again = driver.connect("mem://x", &options).await.unwrap();
        let stream = again.collection("c").find(Document::new(), FindOptions::default()).await.unwrap();
        assert_eq!(stream.count().await, 1);
        assert_eq!(driver.documents("mem://x", "c").len(), 1);
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(2, "timed out");
        let options = ConnectOptions::new("c");
        assert!(driver.connect("mem://x", &options).await.is_err());
        assert!(driver.connect("mem://x", &options).await.is_err());
        assert!(driver.connect("mem://x", &options).await.is_ok());
    }
}
