//! Kademlia routing table with liveness-probed LRU eviction.

use std::sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::common::{Contact, Id, NUM_BUCKETS};
use crate::kbucket::KBucket;

/// Liveness capability used by the eviction policy, supplied by the
/// transport after construction. Must not be called with the table lock
/// held.
pub type LivenessProbe = Box<dyn Fn(&Contact) -> bool + Send + Sync>;

/// This node's view of its peers: one [KBucket] per bit of distance from
/// the owner id. The owner itself is never stored.
pub struct RoutingTable {
    me: Id,
    buckets: RwLock<Vec<KBucket>>,
    probe: OnceLock<LivenessProbe>,
}

impl RoutingTable {
    pub fn new(me: Id) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| KBucket::new()).collect();

        RoutingTable {
            me,
            buckets: RwLock::new(buckets),
            probe: OnceLock::new(),
        }
    }

    /// Wire the liveness probe used when a full bucket must decide
    /// between its LRU contact and a newcomer. May be set once.
    pub fn set_probe(&self, probe: LivenessProbe) {
        let _ = self.probe.set(probe);
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.me
    }

    /// Total number of contacts across all buckets.
    pub fn size(&self) -> usize {
        self.read_buckets().iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read_buckets().iter().all(|b| b.is_empty())
    }

    pub fn contains(&self, id: &Id) -> bool {
        let index = self.me.bucket_index(id);
        self.read_buckets()[index].contains(id)
    }

    // === Public Methods ===

    /// Record or refresh a peer observed on any message exchange.
    ///
    /// When the peer's bucket is full, the least recently observed
    /// contact is probed with the table lock released; an unresponsive
    /// LRU is evicted in favour of the newcomer, a responsive one is kept
    /// and the newcomer remembered in the replacement cache.
    pub fn observe(&self, contact: Contact) {
        if contact.id == self.me {
            return;
        }

        let index = self.me.bucket_index(&contact.id);

        let lru = {
            let mut buckets = self.write_buckets();
            let bucket = &mut buckets[index];

            if bucket.contains(&contact.id) || !bucket.is_full() {
                bucket.insert_mru(contact);
                return;
            }

            bucket.lru()
        };

        let Some(lru) = lru else {
            return;
        };

        // Probe with no table lock held; the reader's handlers observe
        // inbound senders through this same lock.
        let alive = self.probe.get().map(|probe| probe(&lru)).unwrap_or(false);

        let mut buckets = self.write_buckets();
        let bucket = &mut buckets[index];

        if alive {
            // The LRU just proved itself: keep it, freshest first, and
            // only remember the newcomer as a replacement.
            bucket.promote(&lru.id);
            bucket.push_replacement(contact);
        } else {
            bucket.remove(&lru.id);
            bucket.insert_mru(contact);
            debug!(evicted = %lru.id(), inserted = %contact.id(), "Evicted unresponsive contact");
        }
    }

    /// Up to `n` known contacts sorted by ascending XOR distance to
    /// `target`, gathered from the target's bucket outwards.
    pub fn closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let center = self.me.bucket_index(target);
        let mut result: Vec<Contact> = Vec::with_capacity(n);

        {
            let buckets = self.read_buckets();
            result.extend(buckets[center].iter().copied());

            let mut i = 1;
            while result.len() < n && (i <= center || center + i < NUM_BUCKETS) {
                if i <= center {
                    result.extend(buckets[center - i].iter().copied());
                }
                if center + i < NUM_BUCKETS {
                    result.extend(buckets[center + i].iter().copied());
                }
                i += 1;
            }
        }

        result.sort_by(|a, b| {
            a.id.xor(target).cmp(&b.id.xor(target)).then_with(|| {
                (a.address().ip(), a.address().port()).cmp(&(b.address().ip(), b.address().port()))
            })
        });
        result.truncate(n);

        result
    }

    // === Private Methods ===

    fn read_buckets(&self) -> RwLockReadGuard<'_, Vec<KBucket>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_buckets(&self) -> RwLockWriteGuard<'_, Vec<KBucket>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("me", &self.me)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::MAX_BUCKET_SIZE_K;
    use std::net::SocketAddr;

    fn zero_id() -> Id {
        "0000000000000000000000000000000000000000".parse().unwrap()
    }

    /// A contact landing in bucket 0 relative to the zero id.
    fn far_contact(port: u16) -> Contact {
        let mut id = Id::random();
        id.0[0] = 0xff;

        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn should_not_add_self() {
        let me = Id::random();
        let table = RoutingTable::new(me);

        table.observe(Contact::new(me, SocketAddr::from(([0, 0, 0, 0], 0))));

        assert!(table.is_empty());
    }

    #[test]
    fn observe_deduplicates() {
        let table = RoutingTable::new(Id::random());
        let contact = Contact::random();

        table.observe(contact);
        table.observe(contact);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn closest_sorted_by_distance() {
        let table = RoutingTable::new(Id::random());
        let target = Id::random();

        for _ in 0..100 {
            table.observe(Contact::random());
        }

        let closest = table.closest(&target, MAX_BUCKET_SIZE_K);
        assert!(closest.len() <= MAX_BUCKET_SIZE_K);

        let distances: Vec<Id> = closest.iter().map(|c| c.id.xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(distances, sorted);
    }

    #[test]
    fn closest_expands_past_center_bucket() {
        let me = zero_id();
        let table = RoutingTable::new(me);

        // All contacts land in bucket 0; a nearby target lives elsewhere.
        for port in 0..5 {
            table.observe(far_contact(9000 + port));
        }

        let target: Id = "0000000000000000000000000000000000000001".parse().unwrap();
        assert_eq!(table.closest(&target, 10).len(), 5);
    }

    #[test]
    fn dead_lru_evicted() {
        let table = RoutingTable::new(zero_id());
        table.set_probe(Box::new(|_| false));

        let oldest = far_contact(9000);
        table.observe(oldest);
        for port in 1..MAX_BUCKET_SIZE_K as u16 {
            table.observe(far_contact(9000 + port));
        }
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);

        let newcomer = far_contact(9999);
        table.observe(newcomer);

        assert!(!table.contains(&oldest.id));
        assert!(table.contains(&newcomer.id));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn alive_lru_retained() {
        let table = RoutingTable::new(zero_id());
        table.set_probe(Box::new(|_| true));

        let oldest = far_contact(9000);
        table.observe(oldest);
        for port in 1..MAX_BUCKET_SIZE_K as u16 {
            table.observe(far_contact(9000 + port));
        }

        let newcomer = far_contact(9999);
        table.observe(newcomer);

        assert!(table.contains(&oldest.id));
        assert!(!table.contains(&newcomer.id));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);

        // The survivor was just seen, so it is now the freshest entry.
        let buckets = table.read_buckets();
        assert_eq!(buckets[0].iter().next().unwrap().id, oldest.id);
        assert!(buckets[0].replacement_contains(&newcomer.id));
    }

    #[test]
    fn no_probe_means_eviction() {
        let table = RoutingTable::new(zero_id());

        let oldest = far_contact(9000);
        table.observe(oldest);
        for port in 1..MAX_BUCKET_SIZE_K as u16 {
            table.observe(far_contact(9000 + port));
        }

        table.observe(far_contact(9999));

        assert!(!table.contains(&oldest.id));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
    }
}
