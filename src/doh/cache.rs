//! Response cache in front of a `ServerConnection`, keyed by question.
//!
//! The first caller for a key starts the upstream fetch and reports `Miss`;
//! callers arriving while it is in flight share the same future and report
//! `Pending`. A successful response is kept until its first answer's TTL,
//! less the time it had already spent in HTTP caches, runs out.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

use super::{CacheStatus, DohError, DohFuture, DohResponse, ServerConnection};
use crate::clock::Clock;
use crate::dns::{self, QueryKey};
use crate::logger::{self, BreadcrumbFlags};

type SharedFetch = Shared<BoxFuture<'static, Result<DohResponse, DohError>>>;

enum Slot {
    Pending(SharedFetch),
    Ready {
        response: DohResponse,
        expires_at_ms: u64,
        last_used_ms: u64,
    },
}

#[derive(Default)]
struct CacheState {
    entries: FxHashMap<QueryKey, Slot>,
}

impl CacheState {
    /// Make room for one more entry: expired entries go first, then the
    /// least recently used ready entry. In-flight entries are never evicted.
    fn evict(&mut self, capacity: usize, now_ms: u64) {
        if self.entries.len() < capacity {
            return;
        }
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at_ms, .. } => *expires_at_ms > now_ms,
            Slot::Pending(_) => true,
        });
        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { last_used_ms, .. } => Some((key, *last_used_ms)),
                    Slot::Pending(_) => None,
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

enum Lookup {
    Hit(DohResponse),
    Join(SharedFetch, CacheStatus),
}

pub struct CachingServerConnection {
    inner: Arc<dyn ServerConnection>,
    state: Arc<Mutex<CacheState>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

impl CachingServerConnection {
    /// `runtime` runs upstream fetches so they complete even when the caller
    /// that started them goes away.
    pub fn new(
        inner: Arc<dyn ServerConnection>,
        capacity: usize,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(CacheState::default())),
            capacity: capacity.max(1),
            clock,
            runtime,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: QueryKey, query: &[u8]) -> Lookup {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        match state.entries.get_mut(&key) {
            Some(Slot::Ready {
                response,
                expires_at_ms,
                last_used_ms,
            }) if *expires_at_ms > now => {
                *last_used_ms = now;
                return Lookup::Hit(response.clone());
            }
            Some(Slot::Pending(fetch)) => return Lookup::Join(fetch.clone(), CacheStatus::Pending),
            _ => {}
        }

        state.entries.remove(&key);
        state.evict(self.capacity, now);
        let fetch = self.start_fetch(key.clone(), query);
        state.entries.insert(key, Slot::Pending(fetch.clone()));
        Lookup::Join(fetch, CacheStatus::Miss)
    }

    fn start_fetch(&self, key: QueryKey, query: &[u8]) -> SharedFetch {
        let upstream = self.inner.perform_request(query);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let task = self.runtime.spawn(async move {
            let result = upstream.await;
            store(&state, key, &result, clock.now_ms());
            result
        });
        async move { task.await.unwrap_or(Err(DohError::Canceled)) }
            .boxed()
            .shared()
    }
}

/// Replace the pending slot for `key` with the fetched response, or drop it
/// when the response is unusable or already stale.
fn store(state: &Mutex<CacheState>, key: QueryKey, result: &Result<DohResponse, DohError>, now_ms: u64) {
    let expires_at_ms = match result {
        Ok(response) if response.is_success() => match dns::extract_ttl(&response.body) {
            Ok(ttl) => {
                let lifetime = u64::from(ttl) * 1000;
                let remaining = lifetime.saturating_sub(response.age_ms(now_ms));
                (remaining > 0).then_some(now_ms + remaining)
            }
            Err(_) => None,
        },
        _ => None,
    };

    let mut state = state.lock();
    match (expires_at_ms, result) {
        (Some(expires_at_ms), Ok(response)) => {
            logger::breadcrumb(
                BreadcrumbFlags::CACHE,
                format!("cached {} type {} for {}ms", key.name, key.qtype, expires_at_ms - now_ms),
            );
            state.entries.insert(
                key,
                Slot::Ready {
                    response: response.clone(),
                    expires_at_ms,
                    last_used_ms: now_ms,
                },
            );
        }
        _ => {
            state.entries.remove(&key);
        }
    }
}

impl ServerConnection for CachingServerConnection {
    fn perform_request(&self, query: &[u8]) -> DohFuture {
        let key = match dns::parse_query(query) {
            Ok(parsed) => parsed.key(),
            // Not cacheable; let the server judge it.
            Err(_) => return self.inner.perform_request(query),
        };

        match self.lookup(key, query) {
            Lookup::Hit(mut response) => {
                response.cache_status = Some(CacheStatus::Hit);
                futures::future::ready(Ok(response)).boxed()
            }
            Lookup::Join(fetch, status) => async move {
                let mut response = fetch.await?;
                response.cache_status = Some(status);
                Ok(response)
            }
            .boxed(),
        }
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }

    fn reset_if_current(&self, generation: u64) -> bool {
        self.inner.reset_if_current(generation)
    }

    fn url(&self) -> Option<&str> {
        self.inner.url()
    }
}
