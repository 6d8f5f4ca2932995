//! Dht node handle: lifecycle, the put/get API, and background
//! maintenance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::{hash_value, Contact, Id, MAX_BUCKET_SIZE_K};
use crate::routing_table::RoutingTable;
use crate::rpc::lookup::{self, ValueOutcome};
use crate::rpc::{Transport, DEFAULT_REQUEST_TIMEOUT};
use crate::store::{OriginSet, ValueStore};
use crate::{Error, Result};

/// How often origin keys are pushed back out to the currently closest
/// peers.
pub(crate) const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Bound on waiting for the reader to exit at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
/// Configuration for a node; see [Dht::builder].
pub struct DhtBuilder {
    listen: Option<SocketAddr>,
    id: Option<Id>,
    bootstrap: Option<SocketAddr>,
    request_timeout: Duration,
    republish_interval: Duration,
}

impl Default for DhtBuilder {
    fn default() -> Self {
        DhtBuilder {
            listen: None,
            id: None,
            bootstrap: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
        }
    }
}

impl DhtBuilder {
    /// Address to bind and announce. Required; peers route back to it,
    /// so it must be reachable rather than a wildcard.
    pub fn listen(mut self, address: SocketAddr) -> Self {
        self.listen = Some(address);
        self
    }

    /// Override the node id, which is generated randomly by default.
    pub fn id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Join the network through an existing node at this address.
    pub fn bootstrap(mut self, address: SocketAddr) -> Self {
        self.bootstrap = Some(address);
        self
    }

    /// Per-request timeout (default 800 ms).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Interval between republish passes over origin keys (default 15
    /// minutes).
    pub fn republish_interval(mut self, interval: Duration) -> Self {
        self.republish_interval = interval;
        self
    }

    /// Bind the socket, start the reader, table updater, and republisher
    /// threads, and join via the bootstrap peer when one is configured.
    pub fn build(self) -> Result<Dht> {
        let listen = self
            .listen
            .ok_or(Error::Static("listen address is required"))?;
        let id = self.id.unwrap_or_else(Id::random);

        let routing_table = Arc::new(RoutingTable::new(id));
        let store = Arc::new(ValueStore::new());
        let (observer, observations) = flume::unbounded();

        let transport = Arc::new(Transport::bind(
            id,
            listen,
            self.request_timeout,
            Arc::clone(&routing_table),
            Arc::clone(&store),
            observer,
        )?);

        // The eviction probe is a plain PING through a non-owning handle,
        // so the table never keeps the transport alive.
        let probe_transport = Arc::downgrade(&transport);
        routing_table.set_probe(Box::new(move |contact: &Contact| {
            match probe_transport.upgrade() {
                Some(transport) => transport.ping(contact.address()).is_ok(),
                None => false,
            }
        }));

        let (stopped, read_stopped) = flume::bounded(1);
        let reader = Arc::clone(&transport);
        thread::Builder::new()
            .name("kadmos-reader".to_string())
            .spawn(move || reader.run_reader(stopped))?;

        // Drain reader-side observations into the table, one at a time,
        // off the reader thread.
        let updater_table = Arc::clone(&routing_table);
        let updater_transport = Arc::downgrade(&transport);
        thread::Builder::new()
            .name("kadmos-table".to_string())
            .spawn(move || loop {
                match observations.recv_timeout(Duration::from_millis(250)) {
                    Ok(contact) => updater_table.observe(contact),
                    Err(flume::RecvTimeoutError::Timeout) => match updater_transport.upgrade() {
                        Some(transport) if !transport.is_shutdown() => {}
                        _ => break,
                    },
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            })?;

        let (republish_stop, stop) = flume::bounded(1);

        let dht = Dht(Arc::new(Inner {
            transport: Arc::clone(&transport),
            routing_table,
            store,
            origins: OriginSet::new(),
            republish_stop,
            read_stopped,
        }));

        // The republisher holds only a weak handle, so dropping the last
        // Dht clone tears everything down.
        let republisher = Arc::downgrade(&dht.0);
        let interval = self.republish_interval;
        thread::Builder::new()
            .name("kadmos-republish".to_string())
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(flume::RecvTimeoutError::Timeout) => {
                        let Some(inner) = republisher.upgrade() else {
                            break;
                        };
                        inner.republish_origin_keys();
                    }
                    Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(id = %dht.id(), address = %dht.local_addr(), "Node listening");

        if let Some(bootstrap) = self.bootstrap {
            dht.0.join(bootstrap);
        }

        Ok(dht)
    }
}

#[derive(Debug, Clone)]
/// A running DHT node. Clones share the same node; the node shuts down
/// when explicitly asked to or when the last clone is dropped.
pub struct Dht(Arc<Inner>);

impl Dht {
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> &Id {
        self.0.transport.me().id()
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.transport.local_addr()
    }

    /// Returns the number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.0.routing_table.size()
    }

    // === Public Methods ===

    /// Store `value` in the DHT and return its 40 character hex key.
    ///
    /// The origin always keeps a local copy, so a put succeeds even when
    /// no peer is reachable; replication failures are absorbed.
    pub fn put(&self, value: &[u8]) -> Result<String> {
        let key_id = hash_value(value);
        let key = key_id.to_string();

        self.0.store.store(&key, value);
        self.0.origins.insert(&key);
        debug!(key = %key, size = value.len(), "Stored value locally");

        self.0.replicate_to_closest(&key, &key_id, value);

        Ok(key)
    }

    /// Fetch the value under a 40 character hex key, together with the
    /// address it came from. `Ok(None)` means no reachable replica had
    /// it; a malformed key fails before any network traffic.
    pub fn get(&self, key: &str) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let key_id: Id = key.parse()?;
        let key = key_id.to_string();

        if let Some(value) = self.0.store.load(&key) {
            return Ok(Some((value, self.local_addr())));
        }

        match lookup::lookup_value(&self.0.transport, &key, &key_id) {
            ValueOutcome::Found {
                value,
                from,
                queried,
            } => {
                // Cache locally, then seed the best on-path peer that
                // did not have it.
                self.0.store.store(&key, &value);
                self.0.path_cache(&key, &key_id, &value, &queried, &from);

                Ok(Some((value, from.address())))
            }
            ValueOutcome::NotFound => Ok(None),
        }
    }

    /// Stop the maintenance tasks, close the transport, and wait for the
    /// reader to exit with a bounded timeout.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}

#[derive(Debug)]
struct Inner {
    transport: Arc<Transport>,
    routing_table: Arc<RoutingTable>,
    store: Arc<ValueStore>,
    origins: OriginSet,
    republish_stop: flume::Sender<()>,
    read_stopped: flume::Receiver<()>,
}

impl Inner {
    /// PING the bootstrap peer, then look up our own id to populate the
    /// routing table around us.
    fn join(&self, bootstrap: SocketAddr) {
        match self.transport.ping(bootstrap) {
            Ok(peer) => {
                self.routing_table.observe(peer);
                debug!(peer = %peer.id(), "Joined via bootstrap peer");
            }
            Err(error) => {
                warn!(?error, %bootstrap, "Bootstrap ping failed");
            }
        }

        let me = *self.transport.me().id();
        lookup::lookup_nodes(&self.transport, &me);
    }

    /// Refresh the neighbourhood around the key, then STORE at each of
    /// the K closest peers, concurrently. Failures are tolerated and not
    /// retried. Runs with no store or origin lock held.
    fn replicate_to_closest(&self, key: &str, key_id: &Id, value: &[u8]) {
        lookup::lookup_nodes(&self.transport, key_id);

        let contacts = self.routing_table.closest(key_id, MAX_BUCKET_SIZE_K);
        let me = self.transport.local_addr();

        let mut handles = Vec::with_capacity(contacts.len());
        for contact in contacts {
            if contact.address() == me {
                continue;
            }

            let transport = Arc::clone(&self.transport);
            let key = key.to_string();
            let value = value.to_vec();
            handles.push(thread::spawn(move || {
                if let Err(error) = transport.store(&contact, &key, &value) {
                    debug!(?error, peer = %contact.id(), "STORE not acknowledged");
                }
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Store the value at the closest queried peer that is neither the
    /// responder nor ourselves, seeding the key's neighbourhood before
    /// the origin republishes.
    fn path_cache(
        &self,
        key: &str,
        key_id: &Id,
        value: &[u8],
        queried: &[Contact],
        source: &Contact,
    ) {
        let me = self.transport.local_addr();
        let best = queried
            .iter()
            .filter(|c| c.address() != source.address() && c.address() != me)
            .min_by_key(|c| c.id.xor(key_id));

        if let Some(peer) = best {
            debug!(key, peer = %peer.id(), "Path-caching value");
            if let Err(error) = self.transport.store(peer, key, value) {
                debug!(?error, "Path-cache STORE not acknowledged");
            }
        }
    }

    /// Push every origin key back out to its currently closest peers.
    /// Values are copied out before any network I/O happens.
    fn republish_origin_keys(&self) {
        let keys = self.origins.snapshot();
        if keys.is_empty() {
            return;
        }
        debug!(count = keys.len(), "Republishing origin keys");

        for key in keys {
            let Some(value) = self.store.load(&key) else {
                continue;
            };
            let Ok(key_id) = key.parse::<Id>() else {
                continue;
            };

            self.replicate_to_closest(&key, &key_id, &value);
        }
    }

    fn shutdown(&self) {
        let _ = self.republish_stop.send(());
        self.transport.shutdown();
        let _ = self.read_stopped.recv_timeout(SHUTDOWN_TIMEOUT);
        debug!(id = %self.transport.me().id(), "Node shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node() -> Dht {
        Dht::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .request_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test]
    fn listen_address_is_required() {
        assert!(Dht::builder().build().is_err());
    }

    #[test]
    fn put_returns_content_hash() {
        let dht = node();

        let key = dht.put(b"hello world").unwrap();
        assert_eq!(key, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");

        dht.shutdown();
    }

    #[test]
    fn local_put_get_roundtrip() {
        let dht = node();

        let key = dht.put(b"some bytes").unwrap();
        let (value, from) = dht.get(&key).unwrap().expect("origin keeps a copy");

        assert_eq!(value, b"some bytes");
        assert_eq!(from, dht.local_addr());

        dht.shutdown();
    }

    #[test]
    fn caller_buffer_is_copied() {
        let dht = node();

        let mut buffer = b"mutable".to_vec();
        let key = dht.put(&buffer).unwrap();
        buffer[0] = b'X';

        let (value, _) = dht.get(&key).unwrap().unwrap();
        assert_eq!(value, b"mutable");

        dht.shutdown();
    }

    #[test]
    fn get_rejects_malformed_keys() {
        let dht = node();

        assert!(dht.get("abc").is_err());
        assert!(dht.get("").is_err());
        assert!(dht
            .get("zz112233445566778899aabbccddeeff00112233")
            .is_err());

        dht.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dht = node();
        let clone = dht.clone();

        dht.shutdown();
        clone.shutdown();
    }
}
