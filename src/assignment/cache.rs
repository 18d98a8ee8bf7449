use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::debug;

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    Expired,
    Deleted,
}

/// Notification that a TTL key went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key: String,
    /// Value held by the key when it went away
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Popped {
    pub member: String,
    pub score: f64,
    /// Members left in the set after the pop
    pub remaining: usize,
}

/// Shared cache holding derived assignment state: ranked provider pools,
/// reservations with a time-to-live, and per-order exclude lists.
#[async_trait]
pub trait AssignmentCache: Send + Sync {
    async fn ranked_set_add(&self, key: &str, member: &str, score: f64) -> AppResult<()>;

    /// Atomically remove and return the highest-scored member not in
    /// `exclude`. The member stays claimed for `claim_ttl`, so a rebuild of
    /// the set cannot hand it out again while its reservation is live.
    async fn ranked_set_pop_highest(
        &self,
        key: &str,
        exclude: &[String],
        claim_ttl: Duration,
    ) -> AppResult<Option<Popped>>;

    /// Drop a claim and put the member back
    async fn ranked_set_release(&self, key: &str, member: &str, score: f64) -> AppResult<()>;

    /// Swap in a freshly computed set in one step; claimed members are left out.
    /// Returns the new size.
    async fn ranked_set_replace(&self, key: &str, members: Vec<(String, f64)>) -> AppResult<usize>;

    /// Members from highest to lowest score
    async fn ranked_set_members(&self, key: &str) -> AppResult<Vec<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Removes the key and publishes a `Deleted` event when it existed
    async fn delete(&self, key: &str) -> AppResult<bool>;

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn list_range(&self, key: &str) -> AppResult<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<KeyEvent>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct RankedSet {
    members: HashMap<String, f64>,
    claims: HashMap<String, Instant>,
}

impl RankedSet {
    fn drop_stale_claims(&mut self, now: Instant) {
        self.claims.retain(|_, until| *until > now);
    }

    fn ordered(&self) -> Vec<(&String, f64)> {
        let mut members: Vec<(&String, f64)> =
            self.members.iter().map(|(m, s)| (m, *s)).collect();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        members
    }
}

struct List {
    items: Vec<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    ranked: HashMap<String, RankedSet>,
    values: HashMap<String, Entry>,
    lists: HashMap<String, List>,
}

/// Redis-like in-memory assignment cache.
///
/// Every operation runs under one mutex, which gives the pop and replace
/// primitives the same atomicity a server-side script would.
#[derive(Clone)]
pub struct MemoryAssignmentCache {
    state: Arc<Mutex<CacheState>>,
    events: broadcast::Sender<KeyEvent>,
}

impl Default for MemoryAssignmentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAssignmentCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            events,
        }
    }

    /// Remove expired keys and publish an `Expired` event for each
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<KeyEvent> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .values
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for set in state.ranked.values_mut() {
                set.drop_stale_claims(now);
            }
            state.lists.retain(|_, list| list.expires_at > now);
            keys.into_iter()
                .filter_map(|key| {
                    state.values.remove(&key).map(|entry| KeyEvent {
                        kind: KeyEventKind::Expired,
                        key,
                        value: entry.value,
                    })
                })
                .collect()
        };

        let count = expired.len();
        for event in expired {
            debug!("⌛ Cache key expired: {}", event.key);
            // no subscribers is fine
            let _ = self.events.send(event);
        }
        count
    }

    /// Background task that sweeps expired keys every `every`
    pub fn start_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }
}

#[async_trait]
impl AssignmentCache for MemoryAssignmentCache {
    async fn ranked_set_add(&self, key: &str, member: &str, score: f64) -> AppResult<()> {
        self.state
            .lock()
            .ranked
            .entry(key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn ranked_set_pop_highest(
        &self,
        key: &str,
        exclude: &[String],
        claim_ttl: Duration,
    ) -> AppResult<Option<Popped>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(set) = state.ranked.get_mut(key) else {
            return Ok(None);
        };
        set.drop_stale_claims(now);

        let chosen = set
            .ordered()
            .into_iter()
            .find(|(member, _)| !exclude.iter().any(|e| e == *member))
            .map(|(member, score)| (member.clone(), score));

        Ok(chosen.map(|(member, score)| {
            set.members.remove(&member);
            set.claims.insert(member.clone(), now + claim_ttl);
            Popped {
                member,
                score,
                remaining: set.members.len(),
            }
        }))
    }

    async fn ranked_set_release(&self, key: &str, member: &str, score: f64) -> AppResult<()> {
        let mut state = self.state.lock();
        let set = state.ranked.entry(key.to_string()).or_default();
        set.claims.remove(member);
        set.members.insert(member.to_string(), score);
        Ok(())
    }

    async fn ranked_set_replace(&self, key: &str, members: Vec<(String, f64)>) -> AppResult<usize> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let set = state.ranked.entry(key.to_string()).or_default();
        set.drop_stale_claims(now);

        let claims = &set.claims;
        let fresh: HashMap<String, f64> = members
            .into_iter()
            .filter(|(member, _)| !claims.contains_key(member))
            .collect();
        set.members = fresh;
        Ok(set.members.len())
    }

    async fn ranked_set_members(&self, key: &str) -> AppResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .ranked
            .get(key)
            .map(|set| set.ordered().into_iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.state.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .values
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let removed = self.state.lock().values.remove(key);
        match removed {
            Some(entry) => {
                let _ = self.events.send(KeyEvent {
                    kind: KeyEventKind::Deleted,
                    key: key.to_string(),
                    value: entry.value,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let list = state.lists.entry(key.to_string()).or_insert_with(|| List {
            items: Vec::new(),
            expires_at: now,
        });
        if list.expires_at <= now {
            list.items.clear();
        }
        list.items.push(value.to_string());
        list.expires_at = now + ttl;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> AppResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .lists
            .get(key)
            .filter(|list| list.expires_at > now)
            .map(|list| list.items.clone())
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLAIM: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_pop_returns_highest_not_excluded() {
        let cache = MemoryAssignmentCache::new();
        cache.ranked_set_add("bucket", "low", 1.0).await.unwrap();
        cache.ranked_set_add("bucket", "high", 5.0).await.unwrap();
        cache.ranked_set_add("bucket", "mid", 3.0).await.unwrap();

        let popped = cache
            .ranked_set_pop_highest("bucket", &["high".to_string()], CLAIM)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.member, "mid");
        assert_eq!(popped.remaining, 2);
        assert_eq!(
            cache.ranked_set_members("bucket").await.unwrap(),
            vec!["high", "low"]
        );
    }

    #[tokio::test]
    async fn test_replace_skips_claimed_members() {
        let cache = MemoryAssignmentCache::new();
        cache.ranked_set_add("bucket", "a", 2.0).await.unwrap();
        cache.ranked_set_add("bucket", "b", 1.0).await.unwrap();

        let popped = cache
            .ranked_set_pop_highest("bucket", &[], CLAIM)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.member, "a");

        let size = cache
            .ranked_set_replace("bucket", vec![("a".into(), 2.0), ("b".into(), 1.0)])
            .await
            .unwrap();
        assert_eq!(size, 1);

        cache.ranked_set_release("bucket", "a", 2.0).await.unwrap();
        assert_eq!(
            cache.ranked_set_members("bucket").await.unwrap(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_pops_never_share_a_member() {
        let cache = MemoryAssignmentCache::new();
        for i in 0..20 {
            cache
                .ranked_set_add("bucket", &format!("p{}", i), i as f64)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .ranked_set_pop_highest("bucket", &[], CLAIM)
                    .await
                    .unwrap()
                    .map(|p| p.member)
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let member = handle.await.unwrap().unwrap();
            assert!(seen.insert(member), "member handed out twice");
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_expiry_publishes_event_with_value() {
        let cache = MemoryAssignmentCache::new();
        let mut events = cache.subscribe();

        cache
            .set_with_ttl("order_request_1", "payload", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(cache.get("order_request_1").await.unwrap().as_deref(), Some("payload"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("order_request_1").await.unwrap().is_none());
        assert_eq!(cache.sweep_expired(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, KeyEventKind::Expired);
        assert_eq!(event.key, "order_request_1");
        assert_eq!(event.value, "payload");
    }

    #[tokio::test]
    async fn test_delete_publishes_event() {
        let cache = MemoryAssignmentCache::new();
        let mut events = cache.subscribe();

        cache.set_with_ttl("k", "v", CLAIM).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, KeyEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_lists_expire_and_are_swept() {
        let cache = MemoryAssignmentCache::new();
        cache.list_push("order_exclude_list_a", "prov-1", Duration::from_millis(20)).await.unwrap();
        cache.list_push("order_exclude_list_a", "prov-2", Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.list_range("order_exclude_list_a").await.unwrap(), vec!["prov-1", "prov-2"]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.list_range("order_exclude_list_a").await.unwrap().is_empty());

        cache.sweep_expired();
        assert!(cache.state.lock().lists.is_empty());
    }
}
