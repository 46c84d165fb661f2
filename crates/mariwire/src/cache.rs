//! Prepared statement cache.
//!
//! Server-side statement handles are keyed by SQL text in an LRU map of
//! bounded size. Every [`PrepareCache::acquire`] takes one use of a handle
//! and every [`PrepareCache::release`] gives it back. A handle is never
//! closed on the server while a use is outstanding: evicting a busy entry
//! detaches it from the map and its COM_STMT_CLOSE goes out with the last
//! release.
//!
//! Eviction prefers the least recently used entry with no outstanding use.
//! When every entry is busy the least recent one is evicted anyway, so the
//! map never holds more than `capacity` entries.
//!
//! Concurrent misses for the same SQL text share one PREPARE round trip:
//! the first caller performs it, later callers wait for its result.
//!
//! A capacity of 0 disables caching: each acquire prepares a fresh handle
//! and the last release closes it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use lru::LruCache;
use mariwire_core::error::CacheError;
use mariwire_core::{Cx, Error};

use crate::protocol::StmtPrepareOk;

/// Issues PREPARE and CLOSE commands on behalf of the cache.
pub trait PrepareBackend: Send + Sync {
    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Result<StmtPrepareOk, Error>> + Send;

    fn close(&self, cx: &Cx, statement_id: u32) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A server-side prepared statement handle and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPrepareResult {
    pub sql: String,
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    /// A close has been scheduled (evicted, or the cache is disabled)
    pub closing: bool,
    /// Outstanding executions referencing this handle
    pub use_count: u32,
    /// Occupies a cache slot
    pub cached: bool,
}

impl ServerPrepareResult {
    fn new(sql: &str, ok: StmtPrepareOk, cached: bool) -> Self {
        Self {
            sql: sql.to_string(),
            statement_id: ok.statement_id,
            num_columns: ok.num_columns,
            num_params: ok.num_params,
            closing: !cached,
            use_count: 1,
            cached,
        }
    }
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub closes: u64,
}

/// Told when the leading PREPARE for its SQL text settles.
type Waiter = oneshot::Sender<Result<(), Error>>;

struct CacheState {
    entries: LruCache<String, ServerPrepareResult>,
    /// Evicted or uncached handles with outstanding uses
    detached: HashMap<u32, ServerPrepareResult>,
    /// SQL texts with a PREPARE in flight, and who waits for it
    inflight: HashMap<String, Vec<Waiter>>,
    /// Closes owed but not yet sent
    pending_closes: VecDeque<u32>,
    stats: CacheStats,
}

/// Bounded cache of server-side prepared statements.
pub struct PrepareCache<B> {
    backend: B,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<B> std::fmt::Debug for PrepareCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PrepareCache")
            .field("capacity", &self.capacity)
            .field("len", &state.entries.len())
            .field("detached", &state.detached.len())
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

fn cache_error(message: impl Into<String>) -> Error {
    Error::Cache(CacheError {
        message: message.into(),
    })
}

enum Lookup {
    Hit(ServerPrepareResult),
    Wait(oneshot::Receiver<Result<(), Error>>),
    Lead,
    Uncached,
}

impl<B> PrepareCache<B> {
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            capacity,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                detached: HashMap::new(),
                inflight: HashMap::new(),
                pending_closes: VecDeque::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Cached entries, least recently used first.
    pub fn snapshot(&self) -> Vec<ServerPrepareResult> {
        self.lock()
            .entries
            .iter()
            .rev()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Handles evicted while in use, awaiting their last release.
    pub fn detached(&self) -> Vec<ServerPrepareResult> {
        let mut handles: Vec<_> = self.lock().detached.values().cloned().collect();
        handles.sort_by_key(|h| h.statement_id);
        handles
    }

    /// Forget every cached handle after the server dropped them (session
    /// reset). Idle handles are discarded; busy ones stay detached until
    /// their last release. Returns the number of entries removed.
    pub fn invalidate(&self) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        while let Some((_, mut entry)) = state.entries.pop_lru() {
            removed += 1;
            if entry.use_count > 0 {
                entry.closing = true;
                entry.cached = false;
                state.detached.insert(entry.statement_id, entry);
            }
        }
        removed
    }
}

impl<B: PrepareBackend> PrepareCache<B> {
    /// Take one use of the handle for `sql`, preparing it on a miss.
    pub async fn acquire(&self, cx: &Cx, sql: &str) -> Result<ServerPrepareResult, Error> {
        self.flush_pending_closes(cx).await;

        loop {
            let lookup = {
                let mut state = self.lock();
                if !self.is_enabled() {
                    state.stats.misses += 1;
                    Lookup::Uncached
                } else if let Some(entry) = state.entries.get_mut(sql) {
                    entry.use_count += 1;
                    let hit = entry.clone();
                    state.stats.hits += 1;
                    Lookup::Hit(hit)
                } else if let Some(waiters) = state.inflight.get_mut(sql) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Lookup::Wait(rx)
                } else {
                    state.stats.misses += 1;
                    state.inflight.insert(sql.to_string(), Vec::new());
                    Lookup::Lead
                }
            };

            match lookup {
                Lookup::Hit(handle) => return Ok(handle),
                // prepared (or the leader gave up): look again
                Lookup::Wait(rx) => match rx.await {
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(())) | Err(oneshot::Canceled) => continue,
                },
                Lookup::Lead => {
                    let handle = self.lead_prepare(cx, sql).await?;
                    // the use goes back if we are dropped before returning it
                    let mut lease = Lease::new(self, handle.clone());
                    self.flush_pending_closes(cx).await;
                    lease.handle = None;
                    return Ok(handle);
                }
                Lookup::Uncached => {
                    let ok = self.backend.prepare(cx, sql).await?;
                    let handle = ServerPrepareResult::new(sql, ok, false);
                    self.lock()
                        .detached
                        .insert(handle.statement_id, handle.clone());
                    return Ok(handle);
                }
            }
        }
    }

    /// Prepare `sql` and cache it. Any eviction close is queued, not sent.
    async fn lead_prepare(&self, cx: &Cx, sql: &str) -> Result<ServerPrepareResult, Error> {
        let mut guard = InflightGuard {
            cache: self,
            sql,
            armed: true,
        };
        let result = self.backend.prepare(cx, sql).await;
        guard.armed = false;

        let (outcome, waiters) = {
            let mut state = self.lock();
            let waiters = state.inflight.remove(sql).unwrap_or_default();
            let outcome = result.map(|ok| {
                let handle = ServerPrepareResult::new(sql, ok, true);
                if let Some(statement_id) = self.make_room(&mut state) {
                    state.pending_closes.push_back(statement_id);
                }
                state.entries.put(sql.to_string(), handle.clone());
                handle
            });
            (outcome, waiters)
        };

        for waiter in waiters {
            let signal = match &outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(e.duplicate()),
            };
            // a waiter that went away has nothing to give back
            let _ = waiter.send(signal);
        }
        outcome
    }

    /// Evict down to `capacity - 1` entries. Returns an idle victim to close.
    fn make_room(&self, state: &mut CacheState) -> Option<u32> {
        if state.entries.len() < self.capacity {
            return None;
        }
        let idle = state
            .entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.use_count == 0)
            .map(|(sql, _)| sql.clone());
        let (sql, mut victim) = match idle {
            Some(sql) => state.entries.pop_entry(&sql)?,
            None => state.entries.pop_lru()?,
        };
        victim.closing = true;
        victim.cached = false;
        state.stats.evictions += 1;

        if victim.use_count == 0 {
            tracing::debug!(statement_id = victim.statement_id, sql = %sql, "evicting prepared statement");
            Some(victim.statement_id)
        } else {
            tracing::debug!(
                statement_id = victim.statement_id,
                uses = victim.use_count,
                "evicting busy prepared statement, close deferred"
            );
            state.detached.insert(victim.statement_id, victim);
            None
        }
    }

    /// Give back one use of `handle`, closing it if it was the last use of
    /// an evicted or uncached handle.
    pub async fn release(&self, cx: &Cx, handle: &ServerPrepareResult) -> Result<(), Error> {
        let to_close = {
            let mut state = self.lock();
            Self::release_locked(&mut state, handle)?
        };
        if let Some(statement_id) = to_close {
            self.close_statement(cx, statement_id).await;
        }
        self.flush_pending_closes(cx).await;
        Ok(())
    }

    /// Release without awaiting; a resulting close is sent by the next
    /// [`acquire`](Self::acquire) or [`release`](Self::release).
    pub fn release_deferred(&self, handle: &ServerPrepareResult) {
        let mut state = self.lock();
        match Self::release_locked(&mut state, handle) {
            Ok(Some(statement_id)) => state.pending_closes.push_back(statement_id),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "deferred release failed"),
        }
    }

    fn release_locked(
        state: &mut CacheState,
        handle: &ServerPrepareResult,
    ) -> Result<Option<u32>, Error> {
        let id = handle.statement_id;
        if let Some(entry) = state
            .entries
            .peek_mut(&handle.sql)
            .filter(|e| e.statement_id == id)
        {
            if entry.use_count == 0 {
                return Err(cache_error(format!(
                    "release of statement {id} without an outstanding use"
                )));
            }
            entry.use_count -= 1;
            return Ok(None);
        }

        let Some(entry) = state.detached.get_mut(&id) else {
            return Err(cache_error(format!("release of unknown statement {id}")));
        };
        if entry.use_count == 0 {
            return Err(cache_error(format!(
                "release of statement {id} without an outstanding use"
            )));
        }
        entry.use_count -= 1;
        if entry.use_count > 0 {
            return Ok(None);
        }
        state.detached.remove(&id);
        Ok(Some(id))
    }

    async fn flush_pending_closes(&self, cx: &Cx) {
        loop {
            let next = self.lock().pending_closes.pop_front();
            let Some(statement_id) = next else {
                return;
            };
            self.close_statement(cx, statement_id).await;
        }
    }

    /// Close failures are logged and otherwise ignored. A close abandoned
    /// midway is queued again.
    async fn close_statement(&self, cx: &Cx, statement_id: u32) {
        let mut guard = CloseGuard {
            cache: self,
            statement_id,
            armed: true,
        };
        let result = self.backend.close(cx, statement_id).await;
        guard.armed = false;

        self.lock().stats.closes += 1;
        if let Err(e) = result {
            tracing::warn!(statement_id, error = %e, "failed to close prepared statement");
        }
    }
}

struct CloseGuard<'a, B> {
    cache: &'a PrepareCache<B>,
    statement_id: u32,
    armed: bool,
}

impl<B> Drop for CloseGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(statement_id = self.statement_id, "close abandoned, requeued");
            self.cache.lock().pending_closes.push_back(self.statement_id);
        }
    }
}

/// Clears the in-flight marker if the leading PREPARE is abandoned, so
/// waiters retry instead of hanging.
struct InflightGuard<'a, B> {
    cache: &'a PrepareCache<B>,
    sql: &'a str,
    armed: bool,
}

impl<B> Drop for InflightGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().inflight.remove(self.sql);
        }
    }
}

/// One use of a handle that is released when dropped.
///
/// [`Lease::release`] releases and sends any resulting close right away;
/// dropping the lease (for example when the caller is cancelled) releases
/// without awaiting.
pub struct Lease<'a, B: PrepareBackend> {
    cache: &'a PrepareCache<B>,
    handle: Option<ServerPrepareResult>,
}

impl<'a, B: PrepareBackend> Lease<'a, B> {
    pub fn new(cache: &'a PrepareCache<B>, handle: ServerPrepareResult) -> Self {
        Self {
            cache,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&ServerPrepareResult> {
        self.handle.as_ref()
    }

    pub async fn release(mut self, cx: &Cx) -> Result<(), Error> {
        match self.handle.take() {
            Some(handle) => self.cache.release(cx, &handle).await,
            None => Ok(()),
        }
    }
}

impl<B: PrepareBackend> Drop for Lease<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cache.release_deferred(&handle);
        }
    }
}
