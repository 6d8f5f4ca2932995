//! Track pending outbound requests and deliver responses to their waiters.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::messages::{Envelope, MessageId};
use crate::{Error, Result};

/// One entry per outstanding request: a single-capacity completion slot
/// the reader deposits the matching response into. Entries are removed
/// on completion, timeout, or shutdown; a request never occupies a slot
/// after its waiter has returned.
pub(crate) struct InflightTable {
    slots: Mutex<Slots>,
}

struct Slots {
    map: HashMap<MessageId, flume::Sender<Envelope>>,
    closed: bool,
}

impl InflightTable {
    pub fn new() -> Self {
        InflightTable {
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a completion slot for a fresh request and return its
    /// receiving end. Fails once the transport has shut down.
    pub fn register(&self, id: MessageId) -> Result<flume::Receiver<Envelope>> {
        let mut slots = self.lock();

        if slots.closed {
            return Err(Error::TransportClosed);
        }

        let (tx, rx) = flume::bounded(1);
        slots.map.insert(id, tx);

        Ok(rx)
    }

    pub fn remove(&self, id: &MessageId) {
        self.lock().map.remove(id);
    }

    /// Deposit a response into its slot without blocking the caller.
    /// Responses with no matching slot (late arrivals after a timeout)
    /// or whose slot is already occupied are discarded.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        let sender = self.lock().map.get(&envelope.message_id).cloned();

        match sender {
            // The deposit happens with the table lock released.
            Some(sender) => sender.try_send(envelope).is_ok(),
            None => false,
        }
    }

    /// Refuse new registrations and drop every pending slot, so current
    /// waiters observe a closed transport instead of a silent timeout.
    pub fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        slots.map.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::WireContact;
    use crate::Id;
    use std::time::Duration;

    fn envelope(id: MessageId) -> Envelope {
        let from = WireContact {
            id: Id::random(),
            address: "127.0.0.1:9001".to_string(),
        };

        Envelope::pong(from, id)
    }

    #[test]
    fn deliver_to_waiter() {
        let table = InflightTable::new();
        let id = MessageId::random();

        let rx = table.register(id).unwrap();
        assert!(table.deliver(envelope(id)));

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.message_id, id);
    }

    #[test]
    fn slot_capacity_is_one() {
        let table = InflightTable::new();
        let id = MessageId::random();

        let _rx = table.register(id).unwrap();
        assert!(table.deliver(envelope(id)));
        assert!(!table.deliver(envelope(id)));
    }

    #[test]
    fn unknown_response_dropped() {
        let table = InflightTable::new();

        assert!(!table.deliver(envelope(MessageId::random())));
    }

    #[test]
    fn removed_after_completion() {
        let table = InflightTable::new();
        let id = MessageId::random();

        let _rx = table.register(id).unwrap();
        assert_eq!(table.len(), 1);

        table.remove(&id);
        assert_eq!(table.len(), 0);
        assert!(!table.deliver(envelope(id)));
    }

    #[test]
    fn close_wakes_waiters_and_refuses_registration() {
        let table = InflightTable::new();
        let rx = table.register(MessageId::random()).unwrap();

        table.close();

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)),
            Err(flume::RecvTimeoutError::Disconnected)
        ));
        assert!(matches!(
            table.register(MessageId::random()),
            Err(Error::TransportClosed)
        ));
    }
}
