//! Connection pool: one shared client per address.
//!
//! Any number of logical connections may point at the same address. They
//! share a single physical [`Client`], created lazily on first use,
//! reference-counted by outstanding acquires, and closed only after it has
//! sat unused for the idle close delay.
//!
//! # Lifecycle
//!
//! ```text
//! acquire(address)
//!   → no entry           → create entry (ref_count = 1), spawn connect, wait
//!   → entry connecting   → ref_count += 1, queue behind the in-flight connect
//!   → entry connected    → cancel idle timer, ref_count += 1, return client
//!
//! connect task
//!   → timeout error, attempts left → retry
//!   → success → resolve waiters in FIFO order, keep client
//!   → failure → resolve waiters with the error, drop entry
//!
//! release(address)
//!   → ref_count -= 1
//!   → ref_count == 0 → arm idle timer → fires with ref_count still 0
//!                                        → remove entry, close client
//! ```
//!
//! All entry state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Arming, cancelling and firing the idle timer all
//! happen under that lock, and the timer re-checks the entry epoch before
//! closing, so a reuse and a close can never both win.
//!
//! Every entry carries a generation. A [`Checkout`] remembers the generation
//! it was taken from, and a release only counts against that same entry:
//! once an entry is closed or shut down and a new one is created for the
//! address, late releases for the old one are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectOptions;
use crate::connection::LogicalConnection;
use crate::driver::{Client, Driver};
use crate::error::{Error, Result};

type ClientResult = Result<Arc<dyn Client>>;

enum EntryState {
    /// A connect task is running; waiters are resolved in push order.
    Connecting { waiters: Vec<oneshot::Sender<ClientResult>> },
    /// The shared client is up. `idle_timer` is set iff `ref_count == 0`.
    Connected {
        client: Arc<dyn Client>,
        idle_timer: Option<JoinHandle<()>>,
    },
}

/// Per-address bookkeeping.
struct PoolEntry {
    state: EntryState,
    /// Unique per entry for the lifetime of the pool.
    generation: u64,
    /// Outstanding acquires not yet matched by a release.
    ref_count: usize,
    /// Bumped on every arm/cancel of the idle timer.
    epoch: u64,
    /// Taken from the options of the acquire that created the entry.
    idle_close_delay: Duration,
}

/// Snapshot of one pool entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Outstanding acquires (including ones still waiting on a connect).
    pub ref_count: usize,
    /// Whether the shared client is established.
    pub connected: bool,
    /// Whether an idle close is scheduled.
    pub idle_close_pending: bool,
    /// Acquires queued behind the in-flight connect.
    pub waiters: usize,
}

struct PoolInner {
    driver: Arc<dyn Driver>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    next_generation: AtomicU64,
}

/// A successful [`ConnectionPool::acquire`]: the shared client plus the
/// generation of the entry it came from.
///
/// Hand the generation back to [`ConnectionPool::release`].
#[derive(Clone)]
pub struct Checkout {
    client: Arc<dyn Client>,
    generation: u64,
}

impl Checkout {
    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Registry of shared clients keyed by address.
///
/// Cheap to clone; clones share the same registry. Applications normally
/// create one pool and hand it (or the [`LogicalConnection`]s it produces)
/// to everything that talks to the store.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create an empty pool that connects through `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register a logical connection to `address`.
    ///
    /// Options are validated here, synchronously. Nothing is connected until
    /// the first [`LogicalConnection::open`].
    pub fn connect(
        &self,
        address: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<LogicalConnection> {
        let collection = options.validate()?.to_string();
        let address = address.into();
        debug!(address = %address, collection = %collection, "logical connection registered");
        Ok(LogicalConnection::new(self.clone(), address, collection, options))
    }

    /// Obtain the shared client for `address`, connecting if necessary.
    ///
    /// Every successful call must be matched by one [`release`](Self::release)
    /// with the returned generation. A failed call owes nothing. Dropping the
    /// returned future before it resolves gives the interest back.
    pub async fn acquire(&self, address: &str, options: &ConnectOptions) -> Result<Checkout> {
        let (rx, generation) = {
            let mut entries = self.inner.lock();
            match entries.get_mut(address) {
                Some(entry) => {
                    entry.ref_count += 1;
                    let generation = entry.generation;
                    match &mut entry.state {
                        EntryState::Connected { client, idle_timer } => {
                            let client = Arc::clone(client);
                            if let Some(timer) = idle_timer.take() {
                                timer.abort();
                                entry.epoch += 1;
                                debug!(address = %address, "idle close cancelled");
                            }
                            debug!(
                                address = %address,
                                ref_count = entry.ref_count,
                                "reused shared client"
                            );
                            return Ok(Checkout { client, generation });
                        }
                        EntryState::Connecting { waiters } => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            debug!(
                                address = %address,
                                waiters = waiters.len(),
                                "queued behind in-flight connect"
                            );
                            (rx, generation)
                        }
                    }
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    entries.insert(
                        address.to_string(),
                        PoolEntry {
                            state: EntryState::Connecting { waiters: vec![tx] },
                            generation,
                            ref_count: 1,
                            epoch: 0,
                            idle_close_delay: options.idle_close_delay,
                        },
                    );
                    self.spawn_connect(address.to_string(), generation, options.clone());
                    (rx, generation)
                }
            }
        };

        let mut pending = PendingAcquire {
            pool: self,
            address,
            generation,
            rx,
            settled: false,
        };
        let outcome = (&mut pending.rx).await;
        pending.settled = true;
        match outcome {
            Ok(result) => result.map(|client| Checkout { client, generation }),
            Err(_) => Err(Error::Connect(format!(
                "connect to {address} ended without a result"
            ))),
        }
    }

    /// Give back one interest in the `generation` entry for `address`.
    ///
    /// When the count reaches zero the idle timer is armed. Releasing an
    /// address with no outstanding interest, or for an entry that has since
    /// been closed and replaced, is logged and ignored.
    pub fn release(&self, address: &str, generation: u64) {
        let mut entries = self.inner.lock();
        self.inner.release_locked(&mut entries, address, generation);
    }

    /// Snapshot of the entry for `address`, if there is one.
    pub fn stats(&self, address: &str) -> Option<PoolStats> {
        let entries = self.inner.lock();
        entries.get(address).map(|entry| match &entry.state {
            EntryState::Connecting { waiters } => PoolStats {
                ref_count: entry.ref_count,
                connected: false,
                idle_close_pending: false,
                waiters: waiters.len(),
            },
            EntryState::Connected { idle_timer, .. } => PoolStats {
                ref_count: entry.ref_count,
                connected: true,
                idle_close_pending: idle_timer.is_some(),
                waiters: 0,
            },
        })
    }

    /// Number of addresses currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no address is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log statistics for every entry at `info` level.
    pub fn log_stats(&self) {
        let entries = self.inner.lock();
        for (address, entry) in entries.iter() {
            let (connected, idle_close_pending) = match &entry.state {
                EntryState::Connecting { .. } => (false, false),
                EntryState::Connected { idle_timer, .. } => (true, idle_timer.is_some()),
            };
            info!(
                address = %address,
                ref_count = entry.ref_count,
                connected = connected,
                idle_close_pending = idle_close_pending,
                "pool statistics"
            );
        }
    }

    /// Close every connected client now, regardless of outstanding interest.
    ///
    /// Entries still connecting are left to settle. Leases taken before
    /// shutdown release against the removed generation and are ignored, even
    /// if the address has been reconnected since. Returns the number of
    /// clients closed.
    pub async fn shutdown(&self) -> usize {
        let closing: Vec<(String, Arc<dyn Client>)> = {
            let mut entries = self.inner.lock();
            let connected: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| matches!(entry.state, EntryState::Connected { .. }))
                .map(|(address, _)| address.clone())
                .collect();
            connected
                .into_iter()
                .filter_map(|address| match entries.remove(&address) {
                    Some(PoolEntry {
                        state: EntryState::Connected { client, idle_timer },
                        ref_count,
                        ..
                    }) => {
                        if let Some(timer) = idle_timer {
                            timer.abort();
                        }
                        if ref_count > 0 {
                            warn!(
                                address = %address,
                                ref_count = ref_count,
                                "closing client with outstanding leases"
                            );
                        }
                        Some((address, client))
                    }
                    _ => None,
                })
                .collect()
        };

        for (address, client) in &closing {
            client.close().await;
            debug!(address = %address, "closed client during shutdown");
        }
        info!(closed = closing.len(), "connection pool shut down");
        closing.len()
    }

    fn spawn_connect(&self, address: String, generation: u64, options: ConnectOptions) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = connect_with_retry(inner.driver.as_ref(), &address, &options).await;
            inner.finish_connect(&address, generation, result);
        });
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_connect(self: &Arc<Self>, address: &str, generation: u64, result: ClientResult) {
        let mut entries = self.lock();
        let Some(entry) = entries
            .get_mut(address)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        let EntryState::Connecting { waiters } = &mut entry.state else {
            return;
        };
        let waiters = std::mem::take(waiters);

        match result {
            Ok(client) => {
                entry.state = EntryState::Connected {
                    client: Arc::clone(&client),
                    idle_timer: None,
                };
                let idle = entry.ref_count == 0;
                info!(address = %address, waiters = waiters.len(), "shared client connected");
                for waiter in waiters {
                    // A closed receiver has already given its interest back.
                    let _ = waiter.send(Ok(Arc::clone(&client)));
                }
                if idle {
                    self.arm_idle_timer(&mut entries, address);
                }
            }
            Err(err) => {
                entries.remove(address);
                warn!(address = %address, error = %err, waiters = waiters.len(), "connect failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    fn release_locked(
        self: &Arc<Self>,
        entries: &mut HashMap<String, PoolEntry>,
        address: &str,
        generation: u64,
    ) {
        let Some(entry) = entries.get_mut(address) else {
            warn!(address = %address, "release for unknown address ignored");
            return;
        };
        if entry.generation != generation {
            warn!(
                address = %address,
                generation = generation,
                current = entry.generation,
                "release for a replaced client ignored"
            );
            return;
        }
        if entry.ref_count == 0 {
            warn!(address = %address, "release without a matching acquire ignored");
            return;
        }
        entry.ref_count -= 1;
        debug!(address = %address, ref_count = entry.ref_count, "interest released");

        if entry.ref_count == 0 && matches!(entry.state, EntryState::Connected { .. }) {
            self.arm_idle_timer(entries, address);
        }
    }

    fn arm_idle_timer(
        self: &Arc<Self>,
        entries: &mut HashMap<String, PoolEntry>,
        address: &str,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime left to run the close on; drop the client instead.
            entries.remove(address);
            debug!(address = %address, "no runtime for idle close, client dropped");
            return;
        };
        let Some(entry) = entries.get_mut(address) else {
            return;
        };
        let EntryState::Connected { idle_timer, .. } = &mut entry.state else {
            return;
        };
        if let Some(previous) = idle_timer.take() {
            previous.abort();
        }
        entry.epoch += 1;
        let delay = entry.idle_close_delay;
        *idle_timer = Some(runtime.spawn(idle_close(
            Arc::downgrade(self),
            address.to_string(),
            entry.generation,
            entry.epoch,
            delay,
        )));
        debug!(address = %address, idle_close_delay = ?delay, "idle close scheduled");
    }
}

/// Bounded connect loop. Only the transient timeout signature is retried.
async fn connect_with_retry(
    driver: &dyn Driver,
    address: &str,
    options: &ConnectOptions,
) -> ClientResult {
    let max_attempts = options.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match driver.connect(address, options).await {
            Ok(client) => {
                debug!(address = %address, attempt = attempt, "driver connected");
                return Ok(client);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    address = %address,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %err,
                    "connect timed out, retrying"
                );
            }
            Err(err) => return Err(Error::connect(err)),
        }
    }
}

async fn idle_close(
    pool: Weak<PoolInner>,
    address: String,
    generation: u64,
    epoch: u64,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let client = {
        let mut entries = pool.lock();
        let expired = entries.get(&address).is_some_and(|entry| {
            entry.generation == generation
                && entry.epoch == epoch
                && entry.ref_count == 0
                && matches!(entry.state, EntryState::Connected { .. })
        });
        if !expired {
            return;
        }
        match entries.remove(&address) {
            Some(PoolEntry {
                state: EntryState::Connected { client, .. },
                ..
            }) => client,
            _ => return,
        }
    };
    client.close().await;
    info!(address = %address, idle_close_delay = ?delay, "closed idle client");
}

/// Gives the interest back if an `acquire` is dropped mid-wait.
struct PendingAcquire<'a> {
    pool: &'a ConnectionPool,
    address: &'a str,
    generation: u64,
    rx: oneshot::Receiver<ClientResult>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // The connect task delivers under the registry lock, so with the lock
        // held the channel contents and the entry state agree.
        let inner = &self.pool.inner;
        let mut entries = inner.lock();
        self.rx.close();
        match self.rx.try_recv() {
            // Failed connects have already balanced the count.
            Ok(Err(_)) => {}
            _ => {
                debug!(address = %self.address, "abandoned acquire released");
                inner.release_locked(&mut entries, self.address, self.generation);
            }
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
