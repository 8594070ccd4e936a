use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kinspect_core::ClusterRef;
use lru::LruCache;
use tracing::debug;

use super::ResourceRequest;

/// Which terminator produced a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheOp {
    List,
    Get,
    Doc(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    cluster: ClusterRef,
    op: CacheOp,
    request: ResourceRequest,
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Read-through response cache shared by every sandbox in the process.
///
/// Keys are the full request shape (cluster, terminator, request); each entry
/// carries the TTL its caller asked for. Only successful responses are stored.
pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(
        &self,
        cluster: &ClusterRef,
        op: &CacheOp,
        request: &ResourceRequest,
    ) -> Option<serde_json::Value> {
        let key = CacheKey {
            cluster: cluster.clone(),
            op: op.clone(),
            request: request.clone(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                debug!(cluster = %cluster, ?op, "resource cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(
        &self,
        cluster: &ClusterRef,
        op: CacheOp,
        request: &ResourceRequest,
        value: serde_json::Value,
        ttl: Duration,
    ) {
        let Some(expires_at) = Instant::now().checked_add(ttl).filter(|_| !ttl.is_zero()) else {
            return;
        };
        let key = CacheKey {
            cluster: cluster.clone(),
            op,
            request: request.clone(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(
            key,
            CacheEntry { value, expires_at },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Gvk;

    fn pods() -> ResourceRequest {
        ResourceRequest {
            gvk: Some(Gvk::new("", "v1", "Pod")),
            ..Default::default()
        }
    }

    #[test]
    fn hit_until_expiry() {
        let cache = ResponseCache::new(8);
        let demo = ClusterRef::from("demo");
        cache.put(&demo, CacheOp::List, &pods(), serde_json::json!([1]), Duration::from_millis(30));
        assert_eq!(cache.get(&demo, &CacheOp::List, &pods()), Some(serde_json::json!([1])));
        assert_eq!(cache.get(&demo, &CacheOp::Get, &pods()), None);
        assert_eq!(cache.get(&ClusterRef::from("other"), &CacheOp::List, &pods()), None);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get(&demo, &CacheOp::List, &pods()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = ResponseCache::new(8);
        let demo = ClusterRef::from("demo");
        cache.put(&demo, CacheOp::List, &pods(), serde_json::json!([]), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn overflowing_ttl_is_not_stored() {
        let cache = ResponseCache::new(8);
        let demo = ClusterRef::from("demo");
        cache.put(&demo, CacheOp::List, &pods(), serde_json::json!([]), Duration::MAX);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = ResponseCache::new(1);
        let demo = ClusterRef::from("demo");
        let ttl = Duration::from_secs(60);
        cache.put(&demo, CacheOp::List, &pods(), serde_json::json!(1), ttl);
        cache.put(&demo, CacheOp::Doc("spec".into()), &pods(), serde_json::json!(2), ttl);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&demo, &CacheOp::List, &pods()), None);
    }
}
