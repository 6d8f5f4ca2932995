//! Struct and implementation of the Contact entry in the routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq)]
/// A peer as observed by this node: its Id and its announced address.
pub struct Contact {
    pub(crate) id: Id,
    pub(crate) address: SocketAddr,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact { id, address }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Creates a contact with a random Id for testing purposes.
    pub fn random() -> Contact {
        Contact {
            id: Id::random(),
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl Debug for Contact {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}
