use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::key::MsgKey;
use crate::message::Message;

/// TTL stamped onto records of a stale answer.
pub(crate) const STALE_TTL: u32 = 5;

#[derive(Clone)]
struct StoredEntry {
    resp: Message,
    expires_at: Instant,
}

pub(crate) enum TableHit {
    /// Entry within its TTL; records carry the remaining lifetime.
    Fresh(Message),
    /// Entry past its TTL but inside the lazy window.
    Stale(Message),
    Miss,
}

/// Bounded key→entry table with least-recently-used eviction and lazy
/// expiry: entries past their TTL plus the lazy window are garbage and
/// removed on the lookup that finds them.
pub(crate) struct CacheTable {
    entries: DashMap<MsgKey, StoredEntry>,
    order: Mutex<Vec<MsgKey>>, // front = least recently used
    capacity: usize,
}

impl CacheTable {
    pub(crate) fn new(capacity: usize) -> Self {
        CacheTable {
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub(crate) fn get(&self, key: &MsgKey, lazy_window: Duration) -> TableHit {
        let now = Instant::now();
        let (resp, expires_at) = match self.entries.get(key) {
            Some(entry) => (entry.resp.clone(), entry.expires_at),
            None => return TableHit::Miss,
        };

        if now < expires_at {
            self.touch(key);
            let remaining = (expires_at - now).as_secs().max(1) as u32;
            let mut resp = resp;
            for record in resp.records_mut() {
                record.ttl = remaining;
            }
            return TableHit::Fresh(resp);
        }

        if now < expires_at + lazy_window {
            let mut resp = resp;
            for record in resp.records_mut() {
                record.ttl = STALE_TTL;
            }
            return TableHit::Stale(resp);
        }

        // Evictable garbage; removal is lazy.
        self.remove(key);
        TableHit::Miss
    }

    pub(crate) fn insert(&self, key: MsgKey, resp: Message, ttl: Duration) {
        while self.entries.len() >= self.capacity {
            let victim = self.order.lock().first().copied();
            match victim {
                Some(victim) => {
                    self.remove(&victim);
                    debug!("evicted least-recently-used cache entry");
                }
                None => break,
            }
        }

        self.entries.insert(
            key,
            StoredEntry {
                resp,
                expires_at: Instant::now() + ttl,
            },
        );
        self.touch(&key);
    }

    fn touch(&self, key: &MsgKey) {
        let mut order = self.order.lock();
        order.retain(|k| k != key);
        order.push(*key);
    }

    fn remove(&self, key: &MsgKey) {
        self.entries.remove(key);
        self.order.lock().retain(|k| k != key);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries still alive at snapshot time, with their remaining TTL.
    pub(crate) fn snapshot(&self) -> Vec<(MsgKey, Message, Duration)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter_map(|entry| {
                let remaining = entry.expires_at.checked_duration_since(now)?;
                Some((*entry.key(), entry.resp.clone(), remaining))
            })
            .collect()
    }
}

/// Query/hit counters, relaxed since they only feed observability.
#[derive(Debug, Default)]
pub struct CacheStats {
    query_total: AtomicU64,
    hit_total: AtomicU64,
    lazy_hit_total: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_query(&self) {
        self.query_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lazy_hit(&self) {
        self.lazy_hit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.query_total.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hit_total.load(Ordering::Relaxed)
    }

    pub fn lazy_hits(&self) -> u64 {
        self.lazy_hit_total.load(Ordering::Relaxed)
    }
}

/// At-most-one in-flight refresh per key: an atomic insert-if-absent
/// table whose guard releases the key on drop, success or failure.
pub(crate) struct InflightTable {
    pending: DashMap<MsgKey, ()>,
}

impl InflightTable {
    pub(crate) fn new() -> Self {
        InflightTable {
            pending: DashMap::new(),
        }
    }

    pub(crate) fn try_begin(self: &Arc<Self>, key: MsgKey) -> Option<InflightGuard> {
        use dashmap::mapref::entry::Entry;
        match self.pending.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(InflightGuard {
                    table: Arc::clone(self),
                    key,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) struct InflightGuard {
    table: Arc<InflightTable>,
    key: MsgKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.pending.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, RecordType};

    fn key(name: &str) -> MsgKey {
        MsgKey::from_query(&Message::query(name, RecordType::A)).unwrap()
    }

    #[tokio::test]
    async fn lru_eviction_order() {
        let table = CacheTable::new(2);
        table.insert(key("a.com"), Message::default(), Duration::from_secs(60));
        table.insert(key("b.com"), Message::default(), Duration::from_secs(60));
        table.insert(key("c.com"), Message::default(), Duration::from_secs(60));

        assert!(matches!(
            table.get(&key("a.com"), Duration::ZERO),
            TableHit::Miss
        ));
        assert!(matches!(
            table.get(&key("b.com"), Duration::ZERO),
            TableHit::Fresh(_)
        ));
        assert!(matches!(
            table.get(&key("c.com"), Duration::ZERO),
            TableHit::Fresh(_)
        ));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_window_then_garbage() {
        let table = CacheTable::new(8);
        table.insert(key("a.com"), Message::default(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            table.get(&key("a.com"), Duration::from_secs(10)),
            TableHit::Stale(_)
        ));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            table.get(&key("a.com"), Duration::from_secs(10)),
            TableHit::Miss
        ));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn inflight_is_exclusive_until_dropped() {
        let table = Arc::new(InflightTable::new());
        let guard = table.try_begin(key("a.com")).unwrap();
        assert!(table.try_begin(key("a.com")).is_none());
        assert!(table.try_begin(key("b.com")).is_some());

        drop(guard);
        assert!(table.try_begin(key("a.com")).is_some());
    }
}
