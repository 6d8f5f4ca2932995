//! The iterative α-parallel lookup driving node and value searches.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::common::{Contact, Id, MAX_BUCKET_SIZE_K};
use crate::rpc::{FindValueReply, Transport};

/// α: how many peers are queried concurrently per lookup round.
pub(crate) const ALPHA: usize = 3;

/// How many known contacts each round considers when picking the next
/// unvisited peers.
const LOOKUP_WINDOW: usize = 1024;

/// Outcome of a VALUE-mode lookup.
pub(crate) enum ValueOutcome {
    Found {
        value: Vec<u8>,
        from: Contact,
        /// Every peer queried during this lookup, for path caching.
        queried: Vec<Contact>,
    },
    NotFound,
}

/// Iteratively query closer and closer peers for contacts near `target`
/// until the closest known contact stops improving. Returns the K
/// closest contacts from the refreshed routing table, nearest first.
pub(crate) fn lookup_nodes(transport: &Arc<Transport>, target: &Id) -> Vec<Contact> {
    let mut rounds = Rounds::new(transport, *target);

    while let Some(batch) = rounds.next_batch() {
        let (tx, rx) = flume::bounded::<()>(batch.len());

        for peer in batch {
            let transport = Arc::clone(transport);
            let target = *target;
            let tx = tx.clone();
            thread::spawn(move || {
                // The reply's contacts are observed into the routing
                // table by the transport; a timeout teaches us nothing.
                let _ = transport.find_node(&peer, &target);
                let _ = tx.send(());
            });
        }
        drop(tx);

        // Join the whole round before testing convergence.
        for _ in rx.iter() {}

        if rounds.converged() {
            break;
        }
    }

    transport.routing_table.closest(target, MAX_BUCKET_SIZE_K)
}

/// Like [lookup_nodes], but asks for the value under `key` and stops as
/// soon as any peer returns it.
pub(crate) fn lookup_value(transport: &Arc<Transport>, key: &str, target: &Id) -> ValueOutcome {
    let mut rounds = Rounds::new(transport, *target);
    let mut queried: Vec<Contact> = Vec::new();

    while let Some(batch) = rounds.next_batch() {
        queried.extend(batch.iter().copied());

        let (tx, rx) = flume::bounded::<Option<(Vec<u8>, Contact)>>(batch.len());

        for peer in batch {
            let transport = Arc::clone(transport);
            let key = key.to_string();
            let tx = tx.clone();
            thread::spawn(move || {
                let hit = match transport.find_value(&peer, &key) {
                    Ok(FindValueReply::Value(value)) => Some((value, peer)),
                    _ => None,
                };
                let _ = tx.send(hit);
            });
        }
        drop(tx);

        let mut found = None;
        for result in rx.iter() {
            if result.is_some() {
                // First value wins; stragglers finish on their own and
                // their sends are discarded with the channel.
                found = result;
                break;
            }
        }

        if let Some((value, from)) = found {
            debug!(key, from = %from.id(), "Lookup found value");
            return ValueOutcome::Found {
                value,
                from,
                queried,
            };
        }

        if rounds.converged() {
            break;
        }
    }

    debug!(key, visited = rounds.visited.len(), "Lookup exhausted without value");
    ValueOutcome::NotFound
}

/// Round state shared by both lookup modes: the visited set and the
/// convergence test over the best known distance.
struct Rounds<'a> {
    transport: &'a Arc<Transport>,
    target: Id,
    visited: HashSet<SocketAddr>,
    last_best: Option<Id>,
}

impl<'a> Rounds<'a> {
    fn new(transport: &'a Arc<Transport>, target: Id) -> Self {
        Rounds {
            transport,
            target,
            visited: HashSet::new(),
            last_best: None,
        }
    }

    /// Up to α not-yet-visited contacts nearest the target, drawn from a
    /// fresh view of the routing table. None once no candidates remain.
    fn next_batch(&mut self) -> Option<Vec<Contact>> {
        let candidates = self
            .transport
            .routing_table
            .closest(&self.target, LOOKUP_WINDOW);

        let mut batch = Vec::with_capacity(ALPHA);
        for contact in candidates {
            if batch.len() >= ALPHA {
                break;
            }
            if self.visited.insert(contact.address()) {
                batch.push(contact);
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// True when the closest known contact did not get strictly closer
    /// since the previous round.
    fn converged(&mut self) -> bool {
        let best = match self.transport.routing_table.closest(&self.target, 1).first() {
            Some(contact) => contact.id.xor(&self.target),
            None => return true,
        };

        let converged = match &self.last_best {
            Some(last_best) => best >= *last_best,
            None => false,
        };
        self.last_best = Some(best);

        converged
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::testing::spawn_transport;
    use std::time::Duration;

    #[test]
    fn empty_table_terminates_immediately() {
        let (a, ..) = spawn_transport(Duration::from_millis(200));

        assert!(lookup_nodes(&a, &Id::random()).is_empty());
    }

    #[test]
    fn lookup_walks_towards_target() {
        let (a, a_table, _) = spawn_transport(Duration::from_secs(1));
        let (b, b_table, _) = spawn_transport(Duration::from_secs(1));
        let (c, ..) = spawn_transport(Duration::from_secs(1));

        // a only knows b; b knows c.
        a_table.observe(*b.me());
        b_table.observe(*c.me());

        let closest = lookup_nodes(&a, c.me().id());

        assert!(closest.iter().any(|contact| contact.id == c.me().id));
        assert!(a_table.contains(c.me().id()));

        // Nearest first.
        let target = *c.me().id();
        let distances: Vec<Id> = closest.iter().map(|n| n.id.xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn value_lookup_finds_replica_two_hops_out() {
        let (a, a_table, _) = spawn_transport(Duration::from_secs(1));
        let (b, b_table, _) = spawn_transport(Duration::from_secs(1));
        let (c, _, c_store) = spawn_transport(Duration::from_secs(1));

        let key = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";
        c_store.store(key, b"hello world");

        a_table.observe(*b.me());
        b_table.observe(*c.me());

        let target: Id = key.parse().unwrap();
        match lookup_value(&a, key, &target) {
            ValueOutcome::Found {
                value,
                from,
                queried,
            } => {
                assert_eq!(value, b"hello world");
                assert_eq!(from.id, c.me().id);
                assert!(queried.iter().any(|q| q.id == b.me().id));
            }
            ValueOutcome::NotFound => panic!("expected the value"),
        }
    }

    #[test]
    fn value_lookup_not_found_converges() {
        let (a, a_table, _) = spawn_transport(Duration::from_millis(300));
        let (b, ..) = spawn_transport(Duration::from_millis(300));

        a_table.observe(*b.me());

        let key = "00112233445566778899aabbccddeeff00112233";
        let target: Id = key.parse().unwrap();

        assert!(matches!(
            lookup_value(&a, key, &target),
            ValueOutcome::NotFound
        ));
    }
}
