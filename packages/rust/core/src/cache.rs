//! Read-side graph cache.
//!
//! Graph queries populate it; the pipeline stages only invalidate it after
//! writes that change the graph.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Key prefix of full-graph query results.
pub const FULL_GRAPH_PREFIX: &str = "graph:full:";
/// Key prefix of local-graph query results.
pub const LOCAL_GRAPH_PREFIX: &str = "graph:local:";

pub trait GraphCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value, ttl: Duration);
    /// Drop every cached graph query result.
    fn invalidate_graph(&self);
}

/// In-process TTL cache.
#[derive(Default)]
pub struct MemoryGraphCache {
    entries: Mutex<HashMap<String, (Instant, Value)>>,
}

impl MemoryGraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GraphCache for MemoryGraphCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (Instant::now() + ttl, value));
        }
    }

    fn invalidate_graph(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|k, _| {
                !k.starts_with(FULL_GRAPH_PREFIX) && !k.starts_with(LOCAL_GRAPH_PREFIX)
            });
        }
    }
}

/// Cache that stores nothing.
pub struct NoopGraphCache;

impl GraphCache for NoopGraphCache {
    fn get(&self, _key: &str) -> Option<Value> {
        None
    }
    fn set(&self, _key: &str, _value: Value, _ttl: Duration) {}
    fn invalidate_graph(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_expire() {
        let cache = MemoryGraphCache::new();
        cache.set("graph:full:100:0", json!({"nodes": []}), Duration::from_secs(60));
        cache.set("graph:local:a:2", json!(1), Duration::ZERO);

        assert!(cache.get("graph:full:100:0").is_some());
        assert!(cache.get("graph:local:a:2").is_none());
    }

    #[test]
    fn invalidation_only_touches_graph_keys() {
        let cache = MemoryGraphCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("graph:full:100:0", json!(1), ttl);
        cache.set("graph:local:a:2", json!(2), ttl);
        cache.set("article:paris", json!(3), ttl);

        cache.invalidate_graph();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("article:paris").is_some());
    }
}
