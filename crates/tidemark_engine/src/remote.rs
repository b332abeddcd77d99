//! Remote store capability.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tidemark_protocol::{
    compare_values, Clause, PageCursor, QueryPage, QueryParams, Record, RemoteAck, RemoteObject,
};

/// A paginated, filterable remote object collection.
///
/// This trait abstracts the transport, allowing for different
/// implementations (HTTP clients for a hosted backend, in-memory for tests).
///
/// # Invariants
///
/// - `query` honours `params.order_by` ascending across pages: every object
///   of page `k + 1` sorts at or after every object of page `k`
/// - `create` and `update` return the server-assigned modification time,
///   non-decreasing per object
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches one page. `cursor` is `None` for the first page and the
    /// previous page's `next_cursor` afterwards.
    async fn query(
        &self,
        collection: &str,
        params: &QueryParams,
        cursor: Option<&PageCursor>,
    ) -> SyncResult<QueryPage>;

    /// Creates `object` in `collection` and returns its assigned id and time.
    async fn create(&self, collection: &str, object: &RemoteObject) -> SyncResult<RemoteAck>;

    /// Overwrites the object identified by `object.id`.
    async fn update(&self, object: &RemoteObject) -> SyncResult<RemoteAck>;
}

/// An in-memory remote collection.
///
/// Assigns `uuid` ids and strictly increasing modification times, evaluates
/// [`Clause`] filters, sorts ascending and pages with offset cursors. Faults
/// can be injected for testing: disconnection, a failing query page,
/// rejected writes and artificial latency. The highest number of creates and
/// updates in progress at once is tracked.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    buckets: RwLock<BTreeMap<String, Vec<RemoteObject>>>,
    last_time: Mutex<i64>,
    default_page_size: u32,
    connected: AtomicBool,
    fail_query_after: Mutex<Option<usize>>,
    reject_writes: RwLock<Option<Clause>>,
    latency: Mutex<Option<Duration>>,
    queries: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    writes_in_flight: AtomicUsize,
    peak_writes_in_flight: AtomicUsize,
}

/// Counts one create or update as in progress until dropped.
struct WriteInFlight<'a>(&'a AtomicUsize);

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    /// Creates an empty store with a default page size of 100.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(BTreeMap::new()),
            last_time: Mutex::new(0),
            default_page_size: 100,
            connected: AtomicBool::new(true),
            fail_query_after: Mutex::new(None),
            reject_writes: RwLock::new(None),
            latency: Mutex::new(None),
            queries: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            writes_in_flight: AtomicUsize::new(0),
            peak_writes_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sets the page size used when a query does not request one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = page_size.max(1);
        self
    }

    /// Stores an object as if another client had written it at `modified_at`.
    ///
    /// Returns the assigned id. Later server-assigned times are strictly
    /// greater than `modified_at`.
    pub fn seed(&self, collection: &str, fields: Record, modified_at: i64) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let object = RemoteObject::new(fields)
            .with_id(id.clone())
            .with_modified_at(modified_at);

        {
            let mut last = self.last_time.lock();
            *last = (*last).max(modified_at);
        }
        self.buckets
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(object);
        id
    }

    /// Overwrites an existing object's fields as another client would.
    ///
    /// Returns the new modification time, or `None` if the id is unknown.
    pub fn touch(&self, id: &str, fields: Record) -> Option<i64> {
        let modified_at = self.next_time();
        let mut buckets = self.buckets.write();
        let object = buckets
            .values_mut()
            .flat_map(|objects| objects.iter_mut())
            .find(|o| o.id.as_deref() == Some(id))?;
        object.fields = fields;
        object.modified_at = Some(modified_at);
        Some(modified_at)
    }

    /// Returns the objects of a collection in modification order.
    pub fn objects(&self, collection: &str) -> Vec<RemoteObject> {
        let mut objects = self
            .buckets
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default();
        objects.sort_by_key(|o| o.modified_at);
        objects
    }

    /// Returns an object by id.
    pub fn get(&self, id: &str) -> Option<RemoteObject> {
        self.buckets
            .read()
            .values()
            .flatten()
            .find(|o| o.id.as_deref() == Some(id))
            .cloned()
    }

    /// Returns the number of objects in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.buckets.read().get(collection).map_or(0, Vec::len)
    }

    /// Sets the connected state. A disconnected store fails every call
    /// with [`SyncError::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Lets `pages` more queries succeed, then fails the next one.
    pub fn fail_query_after(&self, pages: usize) {
        *self.fail_query_after.lock() = Some(pages);
    }

    /// Rejects every create or update whose object matches `clause`.
    pub fn reject_writes_matching(&self, clause: Clause) {
        *self.reject_writes.write() = Some(clause);
    }

    /// Stops rejecting writes.
    pub fn accept_all_writes(&self) {
        *self.reject_writes.write() = None;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of query calls received.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of create calls received.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of update calls received.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Highest number of creates and updates that were in progress at once.
    pub fn peak_writes_in_flight(&self) -> usize {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }

    fn begin_write(&self) -> WriteInFlight<'_> {
        let now = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes_in_flight.fetch_max(now, Ordering::SeqCst);
        WriteInFlight(&self.writes_in_flight)
    }

    fn next_time(&self) -> i64 {
        let mut last = self.last_time.lock();
        *last += 1;
        *last
    }

    async fn enter(&self) -> SyncResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }

    fn check_write(&self, object: &RemoteObject) -> SyncResult<()> {
        match &*self.reject_writes.read() {
            Some(clause) if clause.matches(object) => Err(SyncError::ServerError(format!(
                "write rejected for object {:?}",
                object.id
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn query(
        &self,
        collection: &str,
        params: &QueryParams,
        cursor: Option<&PageCursor>,
    ) -> SyncResult<QueryPage> {
        self.enter().await?;
        self.queries.fetch_add(1, Ordering::SeqCst);

        {
            let mut fail = self.fail_query_after.lock();
            match *fail {
                Some(0) => {
                    *fail = None;
                    return Err(SyncError::transport_retryable("injected query failure"));
                }
                Some(n) => *fail = Some(n - 1),
                None => {}
            }
        }

        let offset = match cursor {
            Some(cursor) => cursor.as_str().parse::<usize>().map_err(|_| {
                SyncError::Protocol(format!("invalid cursor {:?}", cursor.as_str()))
            })?,
            None => 0,
        };

        let mut matching: Vec<RemoteObject> = self
            .buckets
            .read()
            .get(collection)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| params.clause.matches(o))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(field) = &params.order_by {
            matching.sort_by(|a, b| match (a.get(field), b.get(field)) {
                (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(CmpOrdering::Equal),
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            });
        }

        let page_size = params.page_size.unwrap_or(self.default_page_size).max(1) as usize;
        let start = offset.min(matching.len());
        let end = (start + page_size).min(matching.len());
        let objects = matching[start..end].to_vec();

        Ok(if end < matching.len() {
            QueryPage::with_next(objects, PageCursor::new(end.to_string()))
        } else {
            QueryPage::last(objects)
        })
    }

    async fn create(&self, collection: &str, object: &RemoteObject) -> SyncResult<RemoteAck> {
        let _in_flight = self.begin_write();
        self.enter().await?;
        self.creates.fetch_add(1, Ordering::SeqCst);

        if object.is_persisted() {
            return Err(SyncError::Protocol(
                "create called with an object that already has an id".into(),
            ));
        }
        self.check_write(object)?;

        let id = uuid::Uuid::new_v4().to_string();
        let modified_at = self.next_time();
        let mut stored = object.clone();
        stored.id = Some(id.clone());
        stored.modified_at = Some(modified_at);

        self.buckets
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(stored);

        Ok(RemoteAck::new(id, modified_at))
    }

    async fn update(&self, object: &RemoteObject) -> SyncResult<RemoteAck> {
        let _in_flight = self.begin_write();
        self.enter().await?;
        self.updates.fetch_add(1, Ordering::SeqCst);

        let Some(id) = object.id.as_deref() else {
            return Err(SyncError::Protocol("update called without an object id".into()));
        };
        self.check_write(object)?;

        let modified_at = self.next_time();
        let mut buckets = self.buckets.write();
        let stored = buckets
            .values_mut()
            .flat_map(|objects| objects.iter_mut())
            .find(|o| o.id.as_deref() == Some(id))
            .ok_or_else(|| SyncError::ServerError(format!("object {id} not found")))?;
        stored.fields = object.fields.clone();
        stored.modified_at = Some(modified_at);

        Ok(RemoteAck::new(id, modified_at))
    }
}
