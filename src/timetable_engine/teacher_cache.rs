//! Process-wide TTL cache for the teacher initials → full name map.
//!
//! The mapping is identical for every session of the same upstream tenant,
//! so a single slot is enough. The mutex is held across the refresh fetch,
//! which also collapses concurrent misses into one upstream call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::EngineResult;

pub type TeacherMap = Arc<HashMap<String, String>>;

struct CachedMap {
    fetched_at: Instant,
    ttl: Duration,
    map: TeacherMap,
}

#[derive(Default)]
pub struct TeacherMapCache {
    slot: Mutex<Option<CachedMap>>,
}

impl TeacherMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached map, refreshing it through `fetch` when the slot
    /// is empty or expired. A failed refresh degrades to an empty map which
    /// is cached for the full TTL; missing initials then resolve to
    /// themselves downstream.
    pub async fn get_or_fetch<F, Fut>(&self, ttl: Duration, fetch: F) -> TeacherMap
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<HashMap<String, String>>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.fetched_at.elapsed() < cached.ttl {
                return cached.map.clone();
            }
            debug!("teacher map cache expired, refreshing");
        }

        let map = match fetch().await {
            Ok(map) => {
                debug!("teacher map refreshed with {} entries", map.len());
                map
            }
            Err(err) => {
                warn!("teacher map fetch failed, caching empty map: {err}");
                HashMap::new()
            }
        };
        let map: TeacherMap = Arc::new(map);
        *slot = Some(CachedMap {
            fetched_at: Instant::now(),
            ttl,
            map: map.clone(),
        });
        map
    }
}
