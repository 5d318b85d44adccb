//! In-flight deduplication of identical sources
//!
//! Concurrent requests for the same [`SourceReference`] share one execution,
//! and a request for a source whose result is still live reuses it. Every
//! waiter receives its own [`PublishedHandle`], so sharing never changes the
//! release obligations of a caller.
//!
//! A shared execution is abandoned only when every waiter has gone away.

use crate::error::{PipelineError, Result};
use crate::publish::{PublishedHandle, PublishedReference, ResourceTable};
use crate::source::SourceReference;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

type SharedRun = Shared<BoxFuture<'static, Result<PublishedHandle>>>;

enum RegistryEntry {
    InFlight {
        id: u64,
        run: SharedRun,
        waiters: usize,
        cancel: CancellationToken,
    },
    Completed(PublishedReference),
}

/// Counters describing registry activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Executions started
    pub started: u64,
    /// Requests that joined an execution already in flight
    pub joined: u64,
    /// Requests served from a still-live completed result
    pub reused: u64,
    /// Executions abandoned because every waiter went away
    pub abandoned: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<SourceReference, RegistryEntry>,
    next_id: u64,
    stats: RegistryStats,
}

/// Registry of executions keyed by source
#[derive(Clone)]
pub struct InflightRegistry {
    table: ResourceTable,
    inner: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for InflightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl InflightRegistry {
    #[must_use]
    pub fn new(table: ResourceTable) -> Self {
        Self {
            table,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain a handle for `source`, starting an execution only if needed
    ///
    /// `start` receives a token that is cancelled when the execution is
    /// abandoned. The caller's own `token` only detaches this caller.
    ///
    /// # Errors
    /// - The shared execution's failure, cloned for every waiter
    /// - `PipelineError::Cancelled` if `token` fires first
    pub async fn acquire<F>(
        &self,
        source: &SourceReference,
        token: &CancellationToken,
        start: F,
    ) -> Result<PublishedHandle>
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<PublishedHandle>>,
    {
        if token.is_cancelled() {
            return Err(PipelineError::cancelled(format!(
                "Request for {} cancelled before start",
                source
            )));
        }

        let (id, run) = {
            let mut inner = self.lock();
            self.prune(&mut inner);

            if let Some(handle) = self.reuse(&mut inner, source) {
                return Ok(handle);
            }

            match inner.entries.get_mut(source) {
                Some(RegistryEntry::InFlight {
                    id, run, waiters, ..
                }) => {
                    *waiters += 1;
                    let joined = (*id, run.clone());
                    inner.stats.joined += 1;
                    log::debug!("Joining in-flight execution for {}", source);
                    joined
                },
                _ => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.stats.started += 1;

                    let cancel = CancellationToken::new();
                    let run = self.wrap(source.clone(), id, start(cancel.clone()));
                    inner.entries.insert(
                        source.clone(),
                        RegistryEntry::InFlight {
                            id,
                            run: run.clone(),
                            waiters: 1,
                            cancel,
                        },
                    );
                    (id, run)
                },
            }
        };

        let mut waiter = Waiter {
            registry: self,
            source,
            id,
            attached: true,
        };

        tokio::select! {
            result = run => {
                waiter.attached = false;
                result
            },
            () = token.cancelled() => Err(PipelineError::cancelled(format!(
                "Request for {} cancelled while in flight",
                source
            ))),
        }
    }

    /// Serve a still-live completed result; stale entries are dropped
    fn reuse(
        &self,
        inner: &mut RegistryInner,
        source: &SourceReference,
    ) -> Option<PublishedHandle> {
        let reference = match inner.entries.get(source) {
            Some(RegistryEntry::Completed(reference)) => reference.clone(),
            _ => return None,
        };
        match self.table.retain(&reference) {
            Some(handle) => {
                inner.stats.reused += 1;
                log::debug!("Reusing {} for {}", reference, source);
                Some(handle)
            },
            None => {
                inner.entries.remove(source);
                None
            },
        }
    }

    fn wrap(
        &self,
        source: SourceReference,
        id: u64,
        execution: BoxFuture<'static, Result<PublishedHandle>>,
    ) -> SharedRun {
        let registry = self.clone();
        async move {
            let result = execution.await;
            registry.complete(&source, id, &result);
            result
        }
        .boxed()
        .shared()
    }

    fn complete(&self, source: &SourceReference, id: u64, result: &Result<PublishedHandle>) {
        let mut inner = self.lock();
        let current = matches!(
            inner.entries.get(source),
            Some(RegistryEntry::InFlight { id: entry_id, .. }) if *entry_id == id
        );
        if !current {
            return;
        }
        match result {
            Ok(handle) => {
                inner
                    .entries
                    .insert(source.clone(), RegistryEntry::Completed(handle.reference().clone()));
            },
            Err(_) => {
                inner.entries.remove(source);
            },
        }
    }

    fn detach(&self, source: &SourceReference, id: u64) {
        let mut inner = self.lock();
        let abandon = match inner.entries.get_mut(source) {
            Some(RegistryEntry::InFlight {
                id: entry_id,
                waiters,
                cancel,
                ..
            }) if *entry_id == id => {
                *waiters = waiters.saturating_sub(1);
                if *waiters == 0 {
                    cancel.cancel();
                    true
                } else {
                    false
                }
            },
            _ => false,
        };
        if abandon {
            inner.entries.remove(source);
            inner.stats.abandoned += 1;
            log::debug!("Abandoned execution for {}", source);
        }
    }

    fn prune(&self, inner: &mut RegistryInner) {
        let table = &self.table;
        inner.entries.retain(|_, entry| match entry {
            RegistryEntry::Completed(reference) => table.is_live(reference),
            RegistryEntry::InFlight { .. } => true,
        });
    }

    /// Number of executions currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| matches!(e, RegistryEntry::InFlight { .. }))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.lock().stats
    }
}

/// Detaches a waiter that leaves before its execution completes
struct Waiter<'a> {
    registry: &'a InflightRegistry,
    source: &'a SourceReference,
    id: u64,
    attached: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.attached {
            self.registry.detach(self.source, self.id);
        }
    }
}
