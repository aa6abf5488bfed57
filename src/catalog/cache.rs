//! TTL cache for role catalogs with refresh coalescing.
//!
//! Concurrent requests for a cold or expired role share one in-flight
//! discovery round: the first caller holds the role's refresh lock while the
//! others queue on it and then read the freshly inserted set.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{CachedToolSet, ToolDescriptor};
use crate::{clock::Clock, config::Role, error::GatewayResult};

pub struct ToolCatalogCache {
    entries: DashMap<Role, CachedToolSet>,
    refresh_locks: DashMap<Role, Arc<Mutex<()>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ToolCatalogCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Cached set for the role, only while younger than its TTL.
    pub fn get_fresh(&self, role: Role) -> Option<CachedToolSet> {
        let entry = self.entries.get(&role)?;
        if entry.is_fresh(self.clock.now()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, role: Role, tools: Vec<ToolDescriptor>) -> CachedToolSet {
        let set = CachedToolSet::new(tools, self.clock.now(), self.ttl);
        self.entries.insert(role, set.clone());
        set
    }

    pub fn invalidate(&self, role: Role) {
        if self.entries.remove(&role).is_some() {
            debug!("invalidated tool catalog for role '{}'", role);
        }
    }

    fn refresh_lock(&self, role: Role) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(role)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Serve the fresh cached set, or run `refresh` exactly once across all
    /// concurrent callers for this role and cache its result.
    pub async fn get_or_refresh<F, Fut>(&self, role: Role, refresh: F) -> GatewayResult<CachedToolSet>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<Vec<ToolDescriptor>>>,
    {
        if let Some(set) = self.get_fresh(role) {
            return Ok(set);
        }

        let lock = self.refresh_lock(role);
        let _guard = lock.lock().await;

        // Another caller may have completed the round while we queued.
        if let Some(set) = self.get_fresh(role) {
            return Ok(set);
        }

        let tools = refresh().await?;
        Ok(self.insert(role, tools))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({}),
            server: "pms".to_string(),
        }
    }

    #[tokio::test]
    async fn test_serves_cached_until_ttl() {
        let clock = ManualClock::starting_now();
        let cache = ToolCatalogCache::new(Duration::seconds(300), clock.clone());

        cache.insert(Role::Guest, vec![tool("search_rooms")]);
        assert!(cache.get_fresh(Role::Guest).is_some());

        clock.advance(Duration::seconds(299));
        assert!(cache.get_fresh(Role::Guest).is_some());

        clock.advance(Duration::seconds(1));
        assert!(cache.get_fresh(Role::Guest).is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_refresh() {
        let clock = ManualClock::starting_now();
        let cache = ToolCatalogCache::new(Duration::seconds(60), clock.clone());
        let rounds = AtomicUsize::new(0);

        let set = cache
            .get_or_refresh(Role::Guest, || async {
                rounds.fetch_add(1, Ordering::SeqCst);
                Ok(vec![tool("search_rooms")])
            })
            .await
            .expect("refresh");
        assert_eq!(set.tools.len(), 1);
        assert_eq!(rounds.load(Ordering::SeqCst), 1);

        // Fresh: no second round.
        cache
            .get_or_refresh(Role::Guest, || async {
                rounds.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            })
            .await
            .expect("cached");
        assert_eq!(rounds.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(61));
        cache
            .get_or_refresh(Role::Guest, || async {
                rounds.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            })
            .await
            .expect("re-refresh");
        assert_eq!(rounds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_cold_callers_coalesce() {
        let clock = ManualClock::starting_now();
        let cache = Arc::new(ToolCatalogCache::new(Duration::seconds(300), clock));
        let rounds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let rounds = Arc::clone(&rounds);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(Role::Guest, || async move {
                        rounds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(vec![tool("search_rooms")])
                    })
                    .await
                    .expect("refresh")
            }));
        }

        for handle in handles {
            let set = handle.await.expect("join");
            assert_eq!(set.tools.len(), 1);
        }
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_not_cached() {
        let clock = ManualClock::starting_now();
        let cache = ToolCatalogCache::new(Duration::seconds(300), clock);

        let err = cache
            .get_or_refresh(Role::Guest, || async {
                Err(crate::error::GatewayError::UpstreamUnreachable {
                    server: "pms".to_string(),
                    message: "connection refused".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::GatewayError::UpstreamUnreachable { .. }
        ));
        assert!(cache.get_fresh(Role::Guest).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_rediscovery() {
        let clock = ManualClock::starting_now();
        let cache = ToolCatalogCache::new(Duration::seconds(300), clock);
        cache.insert(Role::Manager, vec![tool("get_revenue_report")]);
        cache.invalidate(Role::Manager);
        assert!(cache.get_fresh(Role::Manager).is_none());
    }
}
