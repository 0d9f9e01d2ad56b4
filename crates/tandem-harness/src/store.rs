//! In-memory transactional row store.
//!
//! A small table of keyed rows with just enough transaction semantics to
//! reproduce classic two-transaction races: isolation levels that differ in
//! which pending writes a read can see, and row locks whose conflicting
//! requests block until the holder commits or rolls back.
//!
//! # Visibility
//!
//! | isolation        | plain reads see                                  |
//! |------------------|--------------------------------------------------|
//! | ReadUncommitted  | own writes, then other pending writes, then committed |
//! | ReadCommitted    | own writes, then committed                       |
//! | RepeatableRead   | own writes, then a snapshot taken at first read  |
//!
//! Locking reads (`select_for_share`, `select_for_update`) and writes always
//! work on the latest committed row.
//!
//! # Locks
//!
//! Shared locks are compatible with each other. Exclusive locks conflict with
//! everything held by another transaction. All locks are released when the
//! transaction ends. A blocked request gives up after
//! [`StoreConfig::lock_timeout`].

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::error::StoreError;

/// Row primary key.
pub type RowId = u64;

/// Transaction identifier, unique per store.
pub type TxId = u64;

/// Default time a lock request waits before failing.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Display name
    pub name: String,
    /// Numeric payload (a balance, a salary, a counter)
    pub value: i64,
}

impl Row {
    /// Create a row.
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self { name: name.into(), value }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Reads may observe other transactions' pending writes
    ReadUncommitted,
    /// Reads observe committed state at the time of the read
    #[default]
    ReadCommitted,
    /// Reads observe the committed state as of the first read
    RepeatableRead,
}

/// Row store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Longest a lock or insert request may block
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}

impl StoreConfig {
    /// Override the lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct RowLock {
    exclusive: Option<TxId>,
    shared: BTreeSet<TxId>,
}

impl RowLock {
    fn conflicts(&self, tx: TxId, mode: LockMode) -> bool {
        let foreign_exclusive = self.exclusive.is_some_and(|holder| holder != tx);
        match mode {
            LockMode::Shared => foreign_exclusive,
            LockMode::Exclusive => foreign_exclusive || self.shared.iter().any(|&holder| holder != tx),
        }
    }

    fn grant(&mut self, tx: TxId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(tx);
            },
            LockMode::Exclusive => self.exclusive = Some(tx),
        }
    }

    fn release(&mut self, tx: TxId) {
        self.shared.remove(&tx);
        if self.exclusive == Some(tx) {
            self.exclusive = None;
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug)]
struct Tables {
    committed: BTreeMap<RowId, Row>,
    /// Uncommitted writes, per transaction
    pending: HashMap<TxId, BTreeMap<RowId, Row>>,
    locks: HashMap<RowId, RowLock>,
    next_tx: TxId,
}

impl Tables {
    fn conflicts(&self, id: RowId, tx: TxId, mode: LockMode) -> bool {
        self.locks.get(&id).is_some_and(|lock| lock.conflicts(tx, mode))
    }

    fn own(&self, tx: TxId, id: RowId) -> Option<&Row> {
        self.pending.get(&tx).and_then(|writes| writes.get(&id))
    }

    /// Pending write of another transaction. Only the exclusive holder of a
    /// row can have one.
    fn dirty(&self, tx: TxId, id: RowId) -> Option<&Row> {
        let holder = self.locks.get(&id)?.exclusive.filter(|&holder| holder != tx)?;
        self.own(holder, id)
    }

    /// Latest row as a locking read or a write sees it.
    fn current(&self, tx: TxId, id: RowId) -> Option<&Row> {
        self.own(tx, id).or_else(|| self.committed.get(&id))
    }

    fn release_all(&mut self, tx: TxId) {
        self.locks.retain(|_, lock| {
            lock.release(tx);
            !lock.is_free()
        });
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    released: Condvar,
    config: StoreConfig,
}

/// Shared handle to an in-memory row table.
///
/// Cheap to clone; clones see the same rows and locks. Mutex poisoning is
/// recovered, so a panicking party cannot wedge the other one.
#[derive(Debug, Clone)]
pub struct RowStore {
    shared: Arc<Shared>,
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: StoreConfig) -> Self {
        let tables =
            Tables { committed: BTreeMap::new(), pending: HashMap::new(), locks: HashMap::new(), next_tx: 1 };
        Self { shared: Arc::new(Shared { tables: Mutex::new(tables), released: Condvar::new(), config }) }
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Write a committed row directly, bypassing transactions and locks.
    ///
    /// Meant for scenario setup.
    pub fn seed(&self, id: RowId, row: Row) {
        self.tables().committed.insert(id, row);
    }

    /// Committed row, as seen outside any transaction.
    pub fn get(&self, id: RowId) -> Option<Row> {
        self.tables().committed.get(&id).cloned()
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.tables().committed.len()
    }

    /// True if no row is committed.
    pub fn is_empty(&self) -> bool {
        self.tables().committed.is_empty()
    }

    /// Open a transaction.
    pub fn begin(&self, isolation: Isolation) -> Transaction {
        let id = {
            let mut tables = self.tables();
            let id = tables.next_tx;
            tables.next_tx += 1;
            id
        };
        tracing::debug!(tx = id, ?isolation, "Transaction started");
        Transaction { store: self.clone(), id, isolation, snapshot: None, open: true }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.shared.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `tx` may hold `mode` on `id`, then grant it.
    fn acquire(&self, tx: TxId, id: RowId, mode: LockMode) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let mut tables = self.tables();
        if tables.conflicts(id, tx, mode) {
            let timeout = self.shared.config.lock_timeout;
            tracing::debug!(tx, row = id, ?mode, "Waiting for row lock");

            tables = self
                .shared
                .released
                .wait_timeout_while(tables, timeout, |t| t.conflicts(id, tx, mode))
                .unwrap_or_else(PoisonError::into_inner)
                .0;

            if tables.conflicts(id, tx, mode) {
                tracing::warn!(tx, row = id, ?mode, timeout_ms = timeout.as_millis(), "Row lock timed out");
                return Err(StoreError::LockTimeout { id, waited: timeout });
            }
            tracing::debug!(tx, row = id, ?mode, "Row lock acquired after wait");
        }

        tables.locks.entry(id).or_default().grant(tx, mode);
        Ok(tables)
    }

    /// End `tx`, publishing its writes if `commit`, and wake every waiter.
    fn finish(&self, tx: TxId, commit: bool) -> usize {
        let mut tables = self.tables();
        let writes = tables.pending.remove(&tx).unwrap_or_default();
        let count = writes.len();
        if commit {
            tables.committed.extend(writes);
        }
        tables.release_all(tx);
        drop(tables);

        self.shared.released.notify_all();
        count
    }
}

/// Open transaction on a [`RowStore`].
///
/// Dropping an open transaction rolls it back.
#[derive(Debug)]
pub struct Transaction {
    store: RowStore,
    id: TxId,
    isolation: Isolation,
    snapshot: Option<BTreeMap<RowId, Row>>,
    open: bool,
}

impl Transaction {
    /// Transaction identifier.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Isolation level the transaction was opened with.
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Plain read. Never blocks.
    pub fn select(&mut self, id: RowId) -> Option<Row> {
        let tables = self.store.tables();
        if let Some(row) = tables.own(self.id, id) {
            return Some(row.clone());
        }

        match self.isolation {
            Isolation::ReadUncommitted => tables.dirty(self.id, id).or_else(|| tables.committed.get(&id)).cloned(),
            Isolation::ReadCommitted => tables.committed.get(&id).cloned(),
            Isolation::RepeatableRead => {
                self.snapshot.get_or_insert_with(|| tables.committed.clone()).get(&id).cloned()
            },
        }
    }

    /// Number of rows visible to a plain read. Never blocks.
    pub fn count(&mut self) -> usize {
        let tables = self.store.tables();
        let mut visible: BTreeSet<RowId> = match self.isolation {
            Isolation::ReadUncommitted => tables
                .committed
                .keys()
                .chain(tables.pending.values().flat_map(BTreeMap::keys))
                .copied()
                .collect(),
            Isolation::ReadCommitted => tables.committed.keys().copied().collect(),
            Isolation::RepeatableRead => {
                self.snapshot.get_or_insert_with(|| tables.committed.clone()).keys().copied().collect()
            },
        };
        if let Some(writes) = tables.pending.get(&self.id) {
            visible.extend(writes.keys().copied());
        }
        visible.len()
    }

    /// Read the latest row under a shared lock.
    ///
    /// Blocks while another transaction holds the row exclusively.
    pub fn select_for_share(&mut self, id: RowId) -> Result<Option<Row>, StoreError> {
        let tables = self.store.acquire(self.id, id, LockMode::Shared)?;
        Ok(tables.current(self.id, id).cloned())
    }

    /// Read the latest row under an exclusive lock.
    ///
    /// Blocks while another transaction holds any lock on the row.
    pub fn select_for_update(&mut self, id: RowId) -> Result<Option<Row>, StoreError> {
        let tables = self.store.acquire(self.id, id, LockMode::Exclusive)?;
        Ok(tables.current(self.id, id).cloned())
    }

    /// Modify the latest version of a row under an exclusive lock.
    ///
    /// Returns the row as written.
    pub fn update<F>(&mut self, id: RowId, change: F) -> Result<Row, StoreError>
    where
        F: FnOnce(&mut Row),
    {
        let mut tables = self.store.acquire(self.id, id, LockMode::Exclusive)?;
        let mut row = tables.current(self.id, id).cloned().ok_or(StoreError::RowNotFound { id })?;
        change(&mut row);

        tracing::debug!(tx = self.id, row = id, value = row.value, "Row updated");
        tables.pending.entry(self.id).or_default().insert(id, row.clone());
        Ok(row)
    }

    /// Insert a new row.
    ///
    /// If another transaction has a pending insert of the same id, blocks
    /// until it ends and fails with `DuplicateKey` if it committed.
    pub fn insert(&mut self, id: RowId, row: Row) -> Result<(), StoreError> {
        if self.store.tables().current(self.id, id).is_some() {
            return Err(StoreError::DuplicateKey { id });
        }

        let mut tables = self.store.acquire(self.id, id, LockMode::Exclusive)?;
        if tables.current(self.id, id).is_some() {
            tracing::debug!(tx = self.id, row = id, "Insert lost to a committed row");
            return Err(StoreError::DuplicateKey { id });
        }

        tracing::debug!(tx = self.id, row = id, "Row inserted");
        tables.pending.entry(self.id).or_default().insert(id, row);
        Ok(())
    }

    /// Publish every write and release every lock.
    pub fn commit(mut self) {
        self.open = false;
        let writes = self.store.finish(self.id, true);
        tracing::debug!(tx = self.id, writes, "Transaction committed");
    }

    /// Discard every write and release every lock.
    pub fn rollback(mut self) {
        self.open = false;
        let writes = self.store.finish(self.id, false);
        tracing::debug!(tx = self.id, writes, "Transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            let writes = self.store.finish(self.id, false);
            tracing::debug!(tx = self.id, writes, "Open transaction dropped, rolled back");
        }
    }
}
