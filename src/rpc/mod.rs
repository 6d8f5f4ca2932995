//! UDP transport: outgoing requests with correlated responses, and the
//! single reader that demultiplexes datagrams and serves inbound RPCs.

mod inflight;
pub(crate) mod lookup;

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{Contact, Id, MAX_BUCKET_SIZE_K};
use crate::messages::{Envelope, Kind, MessageId, WireContact, MAX_DATAGRAM_SIZE};
use crate::routing_table::RoutingTable;
use crate::store::ValueStore;
use crate::{Error, Result};

use inflight::InflightTable;
use std::sync::Arc;

/// Default request timeout before abandoning an inflight request to a
/// non-responding peer.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(800);

/// Either leg of a FIND_VALUE reply: the value itself, or the closest
/// contacts the peer knows to the key. Never both.
pub(crate) enum FindValueReply {
    Value(Vec<u8>),
    Contacts(Vec<Contact>),
}

/// A UdpSocket wrapper that formats, correlates, and serves DHT requests
/// and responses for one node.
pub(crate) struct Transport {
    me: Contact,
    socket: UdpSocket,
    inflight: InflightTable,
    routing_table: Arc<RoutingTable>,
    store: Arc<ValueStore>,
    request_timeout: Duration,
    shutdown: AtomicBool,
    /// Reader-side observations go through this queue so the reader
    /// never waits on a completion slot when a full bucket needs an
    /// eviction probe.
    observer: flume::Sender<Contact>,
}

impl Transport {
    pub fn bind(
        id: Id,
        listen: SocketAddr,
        request_timeout: Duration,
        routing_table: Arc<RoutingTable>,
        store: Arc<ValueStore>,
        observer: flume::Sender<Contact>,
    ) -> Result<Transport> {
        let socket = UdpSocket::bind(listen)?;
        socket.set_nonblocking(true)?;

        let me = Contact::new(id, socket.local_addr()?);

        Ok(Transport {
            me,
            socket,
            inflight: InflightTable::new(),
            routing_table,
            store,
            request_timeout,
            shutdown: AtomicBool::new(false),
            observer,
        })
    }

    // === Getters ===

    pub fn me(&self) -> &Contact {
        &self.me
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.me.address()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Run the read loop until shutdown: decode each datagram, deposit
    /// responses into their inflight slots, and serve requests. Signals
    /// `stopped` on exit.
    pub fn run_reader(self: Arc<Self>, stopped: flume::Sender<()>) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        while !self.is_shutdown() {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(100)); // yield for a bit
                }
                Err(e) => {
                    trace!(?e, "recv_from failed unexpectedly");
                }
            }
        }

        let _ = stopped.send(());
    }

    /// Stop accepting work: the reader exits on its next pass and every
    /// pending waiter observes a closed transport.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.inflight.close();
    }

    /// PING a peer address and wait for its PONG. Returns the responder
    /// as announced in the reply.
    pub fn ping(&self, to: SocketAddr) -> Result<Contact> {
        let envelope = Envelope::ping(WireContact::from_contact(&self.me), MessageId::random());
        let response = self.request(to, envelope)?;

        response.from.to_contact()
    }

    /// Ask `peer` for its closest contacts to `target`. The responder and
    /// everything it returns are observed into the routing table before
    /// this returns.
    pub fn find_node(&self, peer: &Contact, target: &Id) -> Result<Vec<Contact>> {
        let envelope = Envelope::find_node(
            WireContact::from_contact(&self.me),
            MessageId::random(),
            *target,
        );
        let response = self.request(peer.address(), envelope)?;

        Ok(self.learn_contacts(&response))
    }

    /// Ask `peer` for the value under `key`, or failing that its closest
    /// contacts to the key.
    pub fn find_value(&self, peer: &Contact, key: &str) -> Result<FindValueReply> {
        let envelope = Envelope::find_value(
            WireContact::from_contact(&self.me),
            MessageId::random(),
            key,
        );
        let response = self.request(peer.address(), envelope)?;

        let contacts = self.learn_contacts(&response);
        match response.value {
            Some(value) => Ok(FindValueReply::Value(value)),
            None => Ok(FindValueReply::Contacts(contacts)),
        }
    }

    /// STORE a value at a peer and wait for its acknowledgement.
    pub fn store(&self, peer: &Contact, key: &str, value: &[u8]) -> Result<()> {
        let envelope = Envelope::store(
            WireContact::from_contact(&self.me),
            MessageId::random(),
            key,
            value.to_vec(),
        );
        self.request(peer.address(), envelope)?;

        Ok(())
    }

    // === Private Methods ===

    /// Send a request and await its response, a timeout, or shutdown.
    /// The inflight slot is removed on every exit path.
    fn request(&self, to: SocketAddr, envelope: Envelope) -> Result<Envelope> {
        let message_id = envelope.message_id;
        let slot = self.inflight.register(message_id)?;

        self.send(to, &envelope);

        let result = match slot.recv_timeout(self.request_timeout) {
            Ok(response) => Ok(response),
            Err(flume::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::TransportClosed),
        };

        self.inflight.remove(&message_id);

        result
    }

    fn send(&self, to: SocketAddr, envelope: &Envelope) {
        match envelope.to_bytes() {
            Ok(bytes) => {
                trace!(kind = ?envelope.kind, message_id = %envelope.message_id, ?to, "Sending message");
                if let Err(error) = self.socket.send_to(&bytes, to) {
                    debug!(?error, ?to, "Error sending message");
                }
            }
            Err(error) => {
                debug!(?error, "Error encoding message");
            }
        }
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                trace!(?error, ?from, "Dropping malformed datagram");
                return;
            }
        };

        trace!(kind = ?envelope.kind, message_id = %envelope.message_id, ?from, "Received message");

        // Learn the sender off the reader thread; the observation may end
        // up probing a full bucket's LRU.
        if let Ok(sender) = envelope.from.to_contact() {
            let _ = self.observer.send(sender);
        }

        if envelope.is_response() {
            if !self.inflight.deliver(envelope) {
                trace!("Dropping response with no matching inflight request");
            }
            return;
        }

        self.handle_request(envelope, from);
    }

    /// Serve an inbound request. Replies go straight back to the source
    /// address; invalid requests get no acknowledgement at all.
    fn handle_request(&self, request: Envelope, from: SocketAddr) {
        let me = WireContact::from_contact(&self.me);

        match request.kind {
            Kind::Ping => {
                self.send(from, &Envelope::pong(me, request.message_id));
            }
            Kind::FindNode => {
                let Some(target) = request.target_id else {
                    return;
                };

                let contacts = self.closest_wire(&target);
                self.send(
                    from,
                    &Envelope::find_node_ok(me, request.message_id, contacts),
                );
            }
            Kind::FindValue => {
                let Some(key) = request.key.as_deref() else {
                    return;
                };
                let Ok(key_id) = key.parse::<Id>() else {
                    return;
                };

                match self.store.load(key) {
                    Some(value) => self.send(
                        from,
                        &Envelope::find_value_ok_value(me, request.message_id, key, value),
                    ),
                    None => {
                        let contacts = self.closest_wire(&key_id);
                        self.send(
                            from,
                            &Envelope::find_value_ok_contacts(me, request.message_id, key, contacts),
                        );
                    }
                }
            }
            Kind::Store => {
                let Some(key) = request.key.as_deref() else {
                    return;
                };
                let Some(value) = request.value.as_deref() else {
                    return;
                };
                if key.parse::<Id>().is_err() {
                    debug!(key, ?from, "Dropping STORE with invalid key");
                    return;
                }

                self.store.store(key, value);
                self.send(from, &Envelope::store_ok(me, request.message_id));
            }
            // Response kinds are handled by the correlation path.
            _ => {}
        }
    }

    /// Observe the responder and every returned contact, so they are
    /// visible to the caller's lookup round before it completes.
    fn learn_contacts(&self, response: &Envelope) -> Vec<Contact> {
        if let Ok(responder) = response.from.to_contact() {
            self.routing_table.observe(responder);
        }

        let mut contacts = Vec::new();
        for wire in response.contacts.iter().flatten() {
            if let Ok(contact) = wire.to_contact() {
                self.routing_table.observe(contact);
                contacts.push(contact);
            }
        }

        contacts
    }

    fn closest_wire(&self, target: &Id) -> Vec<WireContact> {
        self.routing_table
            .closest(target, MAX_BUCKET_SIZE_K)
            .iter()
            .map(WireContact::from_contact)
            .collect()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("me", &self.me)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}
