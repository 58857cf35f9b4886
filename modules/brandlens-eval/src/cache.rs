//! Per-run memo of org enrichment with single-flight loading.
//!
//! The mutex guards only map membership. Loaders run outside it, and
//! concurrent callers for the same org wait on a watch channel for the
//! leader's result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use brandlens_common::OrgContext;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("org context load failed for {org_id}: {message}")]
    LoadFailed { org_id: Uuid, message: String },

    #[error("org context load for {0} was abandoned before completing")]
    Abandoned(Uuid),
}

type LoadResult = Result<Arc<OrgContext>, CacheError>;
type Slot = watch::Receiver<Option<LoadResult>>;

#[derive(Default)]
struct State {
    ready: HashMap<Uuid, Arc<OrgContext>>,
    inflight: HashMap<Uuid, Slot>,
}

enum Role {
    Hit(Arc<OrgContext>),
    Wait(Slot),
    Lead(watch::Sender<Option<LoadResult>>),
}

#[derive(Default)]
pub struct OrgContextCache {
    state: Mutex<State>,
    loads: AtomicUsize,
}

impl OrgContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached context, join an in-flight load, or run `loader`.
    ///
    /// Successful loads are kept for the cache's lifetime. Failures are
    /// delivered to every waiter and not cached, so a later call retries.
    pub async fn get<F, Fut>(&self, org_id: Uuid, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<OrgContext>>,
    {
        let role = {
            let mut state = self.lock();
            if let Some(ctx) = state.ready.get(&org_id) {
                Role::Hit(Arc::clone(ctx))
            } else if let Some(slot) = state.inflight.get(&org_id) {
                Role::Wait(slot.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.inflight.insert(org_id, rx);
                Role::Lead(tx)
            }
        };

        match role {
            Role::Hit(ctx) => Ok(ctx),
            Role::Wait(slot) => {
                debug!(org = %org_id, "Waiting on in-flight org context load");
                wait(org_id, slot).await
            }
            Role::Lead(tx) => self.lead(org_id, tx, loader).await,
        }
    }

    async fn lead<F, Fut>(
        &self,
        org_id: Uuid,
        tx: watch::Sender<Option<LoadResult>>,
        loader: F,
    ) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<OrgContext>>,
    {
        let mut guard = InflightGuard {
            cache: self,
            org_id,
            armed: true,
        };
        self.loads.fetch_add(1, Ordering::Relaxed);

        let result = match loader().await {
            Ok(ctx) => {
                info!(
                    org = %org_id,
                    variations = ctx.name_variations.len(),
                    "Org context loaded"
                );
                Ok(Arc::new(ctx))
            }
            Err(e) => Err(CacheError::LoadFailed {
                org_id,
                message: format!("{e:#}"),
            }),
        };

        {
            let mut state = self.lock();
            state.inflight.remove(&org_id);
            if let Ok(ctx) = &result {
                state.ready.insert(org_id, Arc::clone(ctx));
            }
        }
        guard.armed = false;

        tx.send_replace(Some(result.clone()));
        result
    }

    /// Number of loader invocations so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn wait(org_id: Uuid, mut slot: Slot) -> LoadResult {
    match slot.wait_for(Option::is_some).await {
        Ok(value) => (*value)
            .clone()
            .unwrap_or(Err(CacheError::Abandoned(org_id))),
        Err(_) => Err(CacheError::Abandoned(org_id)),
    }
}

/// Clears the in-flight entry if the leading future is dropped mid-load, so
/// waiters see `Abandoned` and the next caller starts a fresh load.
struct InflightGuard<'a> {
    cache: &'a OrgContextCache,
    org_id: Uuid,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().inflight.remove(&self.org_id);
        }
    }
}
