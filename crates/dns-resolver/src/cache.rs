//! The resource-record cache (component C3): a bounded, TTL-expiring
//! store mapping FQDN to the set of records known for it.
//!
//! Every entry lives in a slab (`Inner::slab`), and both indexes -
//! `by_domain` (FQDN to the entries for that domain) and `by_ttl` (an
//! expiration-ordered map) - hold slab indices rather than the entry
//! itself, so eviction is a single slab free plus two map removals.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use dns_types::protocol::types::{DomainName, RecordTypeWithData, ResourceRecord};

use crate::clock::{system_clock, Clock};

/// `capacity` bounds the number of entries the cache may hold at
/// once; values less than 1 disable caching entirely (every insert is
/// silently dropped). `max_ttl_millis` caps how long any entry may
/// live regardless of its declared TTL.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub capacity: usize,
    pub max_ttl_millis: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_ttl_millis: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Orders entries by absolute expiration first, then by insertion
/// order, giving a total order even between entries that expire at
/// the same millisecond.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct TtlKey {
    expiration_millis: u64,
    counter: u64,
}

struct CacheEntry {
    domain: DomainName,
    record: ResourceRecord,
    expiration_millis: u64,
    ttl_key: TtlKey,
}

struct Inner {
    slab: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    by_domain: HashMap<DomainName, Vec<usize>>,
    by_ttl: BTreeMap<TtlKey, usize>,
    counter: u64,
    config: CacheConfig,
}

impl Inner {
    fn new(config: CacheConfig) -> Self {
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            by_domain: HashMap::new(),
            by_ttl: BTreeMap::new(),
            counter: 0,
            config,
        }
    }

    fn len(&self) -> usize {
        self.by_ttl.len()
    }

    fn next_ttl_key(&mut self, expiration_millis: u64) -> TtlKey {
        let counter = self.counter;
        self.counter += 1;
        TtlKey {
            expiration_millis,
            counter,
        }
    }

    fn alloc(&mut self, entry: CacheEntry) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slab[idx] = Some(entry);
            idx
        } else {
            self.slab.push(Some(entry));
            self.slab.len() - 1
        }
    }

    /// Removes the slab entry at `idx` from the slab and the ttl
    /// index. Does not touch `by_domain` - the caller does that,
    /// since callers usually already hold the domain.
    fn free_slot(&mut self, idx: usize) -> Option<CacheEntry> {
        let entry = self.slab[idx].take()?;
        self.free.push(idx);
        self.by_ttl.remove(&entry.ttl_key);
        Some(entry)
    }

    fn detach_from_domain(&mut self, domain: &DomainName, idx: usize) {
        if let Some(handles) = self.by_domain.get_mut(domain) {
            handles.retain(|&h| h != idx);
            if handles.is_empty() {
                self.by_domain.remove(domain);
            }
        }
    }

    /// Evicts the single entry with the earliest absolute expiration.
    fn evict_earliest(&mut self) {
        let Some((_, &idx)) = self.by_ttl.iter().next() else {
            return;
        };
        if let Some(entry) = self.free_slot(idx) {
            self.detach_from_domain(&entry.domain, idx);
        }
    }

    /// Removes every expired entry for `domain`, leaving only
    /// unexpired ones behind (lazy purge).
    fn purge_expired(&mut self, domain: &DomainName, now_millis: u64) {
        let Some(handles) = self.by_domain.get(domain).cloned() else {
            return;
        };
        let mut expired = Vec::new();
        for idx in handles {
            if let Some(entry) = &self.slab[idx] {
                if entry.expiration_millis <= now_millis {
                    expired.push(idx);
                }
            }
        }
        for idx in expired {
            if let Some(entry) = self.free_slot(idx) {
                self.detach_from_domain(&entry.domain, idx);
            }
        }
    }

    fn find_same(&self, domain: &DomainName, record: &ResourceRecord) -> Option<usize> {
        self.by_domain.get(domain)?.iter().copied().find(|&idx| {
            self.slab[idx]
                .as_ref()
                .is_some_and(|entry| entry.record.is_same(record))
        })
    }
}

/// Thread-safe handle to the cache. Cloning is cheap (it's a thin
/// `Arc` wrapper) and every clone shares the same underlying store.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(config))),
            clock,
        }
    }

    /// Inserts a single record, following the rules in the cache's
    /// design: records of the `Unimplemented` type are silently
    /// dropped (never admitted, however well-formed their RDATA), an
    /// effective expiration at or before "now" is silently dropped,
    /// and a record matching an existing (domain, class, type, rdata)
    /// triple overwrites that entry in place rather than duplicating
    /// it.
    pub fn insert(&self, record: ResourceRecord) {
        if matches!(record.rtype_with_data, RecordTypeWithData::Unimplemented { .. }) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.config.capacity < 1 {
            return;
        }

        let now = self.clock.now_millis();
        let declared = now.saturating_add(u64::from(record.ttl).saturating_mul(1000));
        let capped = now.saturating_add(inner.config.max_ttl_millis);
        let expiration_millis = declared.min(capped);
        if expiration_millis <= now {
            return;
        }

        let domain = record.name.clone();

        if let Some(idx) = inner.find_same(&domain, &record) {
            let ttl_key = inner.next_ttl_key(expiration_millis);
            if let Some(old) = &inner.slab[idx] {
                let old_key = old.ttl_key;
                inner.by_ttl.remove(&old_key);
            }
            inner.by_ttl.insert(ttl_key, idx);
            inner.slab[idx] = Some(CacheEntry {
                domain,
                record,
                expiration_millis,
                ttl_key,
            });
            return;
        }

        while inner.len() >= inner.config.capacity {
            inner.evict_earliest();
        }

        let ttl_key = inner.next_ttl_key(expiration_millis);
        let idx = inner.alloc(CacheEntry {
            domain: domain.clone(),
            record,
            expiration_millis,
            ttl_key,
        });
        inner.by_domain.entry(domain).or_default().push(idx);
        inner.by_ttl.insert(ttl_key, idx);
    }

    /// Inserts every record in `records`, e.g. the answer, authority,
    /// and additional sections of a response.
    pub fn insert_all(&self, records: impl IntoIterator<Item = ResourceRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Returns every unexpired record stored for `domain`. Purges any
    /// expired entries it encounters along the way.
    pub fn get(&self, domain: &DomainName) -> Vec<ResourceRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now_millis();
        inner.purge_expired(domain, now);
        inner
            .by_domain
            .get(domain)
            .map(|handles| {
                handles
                    .iter()
                    .filter_map(|&idx| inner.slab[idx].as_ref().map(|e| e.record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties both indexes and resets the ttl-key counter to zero.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.slab.clear();
        inner.free.clear();
        inner.by_domain.clear();
        inner.by_ttl.clear();
        inner.counter = 0;
    }
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;
    use crate::clock::FakeClock;

    pub fn fake_cache(config: CacheConfig, start_millis: u64) -> (Cache, FakeClock) {
        let clock = FakeClock::new(start_millis);
        let cache = Cache::with_clock(config, Arc::new(clock.clone()));
        (cache, clock)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::{a_record, domain, unimplemented_record};

    use super::test_util::fake_cache;
    use super::*;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            max_ttl_millis: u64::MAX / 2,
        }
    }

    #[test]
    fn insert_then_get() {
        let (cache, _clock) = fake_cache(config(10), 0);
        let rr = a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1));
        cache.insert(rr.clone());

        assert_eq!(vec![rr], cache.get(&domain("www.example.com.")));
    }

    #[test]
    fn unimplemented_records_are_never_cached() {
        let (cache, _clock) = fake_cache(config(10), 0);
        let rr = unimplemented_record("weird.example.com.", &[1, 2, 3]);
        cache.insert(rr);

        assert_eq!(0, cache.len());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let (cache, clock) = fake_cache(config(10), 0);
        let mut rr = a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1));
        rr.ttl = 10;
        cache.insert(rr);

        clock.advance(10_001);
        assert!(cache.get(&domain("www.example.com.")).is_empty());
        assert_eq!(0, cache.len());
    }

    /// Scenario 4: capacity=2, insert R1 (ttl=100), R2 (ttl=50), R3
    /// (ttl=200) at a fixed reference clock. Eviction is strictly by
    /// earliest absolute expiration, so R2 (expiring at t=50s, before
    /// R1's t=100s) is the one evicted, leaving R1 and R3.
    #[test]
    fn cache_eviction_removes_earliest_absolute_expiration() {
        let (cache, _clock) = fake_cache(config(2), 0);

        let mut r1 = a_record("r1.example.com.", Ipv4Addr::new(1, 1, 1, 1));
        r1.ttl = 100;
        let mut r2 = a_record("r2.example.com.", Ipv4Addr::new(2, 2, 2, 2));
        r2.ttl = 50;
        let mut r3 = a_record("r3.example.com.", Ipv4Addr::new(3, 3, 3, 3));
        r3.ttl = 200;

        cache.insert(r1.clone());
        cache.insert(r2.clone());
        cache.insert(r3.clone());

        assert_eq!(2, cache.len());
        assert_eq!(vec![r1], cache.get(&domain("r1.example.com.")));
        assert!(cache.get(&domain("r2.example.com.")).is_empty());
        assert_eq!(vec![r3], cache.get(&domain("r3.example.com.")));
    }

    /// Scenario 5: inserting the same (domain, class, type, rdata)
    /// twice merges in place, refreshing the expiration rather than
    /// creating a second entry.
    #[test]
    fn duplicate_insert_merges_and_refreshes_expiration() {
        let (cache, _clock) = fake_cache(config(10), 0);

        let mut rr = a_record("a.example.com.", Ipv4Addr::new(10, 0, 0, 1));
        rr.ttl = 60;
        cache.insert(rr.clone());

        rr.ttl = 120;
        cache.insert(rr.clone());

        assert_eq!(1, cache.len());
        assert_eq!(vec![rr], cache.get(&domain("a.example.com.")));
    }

    #[test]
    fn max_ttl_caps_declared_expiration() {
        let (cache, clock) = fake_cache(
            CacheConfig {
                capacity: 10,
                max_ttl_millis: 5_000,
            },
            0,
        );
        let mut rr = a_record("capped.example.com.", Ipv4Addr::new(1, 1, 1, 1));
        rr.ttl = 3600;
        cache.insert(rr);

        clock.advance(5_001);
        assert!(cache.get(&domain("capped.example.com.")).is_empty());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let (cache, _clock) = fake_cache(config(0), 0);
        cache.insert(a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(0, cache.len());
    }

    #[test]
    fn clear_resets_counter_and_entries() {
        let (cache, _clock) = fake_cache(config(10), 0);
        cache.insert(a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1)));
        cache.clear();
        assert_eq!(0, cache.len());
        cache.insert(a_record("www.example.com.", Ipv4Addr::new(2, 2, 2, 2)));
        assert_eq!(1, cache.len());
    }
}
