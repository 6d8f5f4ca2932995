//! Serialize and deserialize DHT wire envelopes.

use std::fmt::{self, Debug, Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{Contact, Id};
use crate::{Error, Result};

/// Maximum size of a single datagram; bounded by the receive buffer.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// A 128-bit request identifier; a response echoes its request's id.
pub(crate) struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random id; unique with overwhelming probability.
    pub fn random() -> MessageId {
        let mut rng = rand::thread_rng();

        MessageId(rng.gen())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("message id must be 16 bytes"))?;

        Ok(MessageId(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Message kind; requests and their acknowledgements.
pub(crate) enum Kind {
    Ping,
    Pong,
    FindNode,
    FindNodeOk,
    FindValue,
    FindValueOk,
    Store,
    StoreOk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A contact as carried on the wire: hex id and announced address.
pub(crate) struct WireContact {
    pub id: Id,
    pub address: String,
}

impl WireContact {
    pub fn from_contact(contact: &Contact) -> WireContact {
        WireContact {
            id: contact.id,
            address: contact.address.to_string(),
        }
    }

    /// Parse back into a [Contact]; fails on an unparseable address.
    pub fn to_contact(&self) -> Result<Contact> {
        let address = self
            .address
            .parse()
            .map_err(|_| Error::Static("invalid contact address"))?;

        Ok(Contact::new(self.id, address))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The single self-describing envelope for every message on the wire.
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    pub from: WireContact,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Vec<WireContact>>,
}

impl Envelope {
    fn base(kind: Kind, from: WireContact, message_id: MessageId) -> Envelope {
        Envelope {
            kind,
            from,
            message_id,
            target_id: None,
            key: None,
            value: None,
            contacts: None,
        }
    }

    pub fn ping(from: WireContact, message_id: MessageId) -> Envelope {
        Envelope::base(Kind::Ping, from, message_id)
    }

    pub fn pong(from: WireContact, message_id: MessageId) -> Envelope {
        Envelope::base(Kind::Pong, from, message_id)
    }

    pub fn find_node(from: WireContact, message_id: MessageId, target: Id) -> Envelope {
        Envelope {
            target_id: Some(target),
            ..Envelope::base(Kind::FindNode, from, message_id)
        }
    }

    pub fn find_node_ok(
        from: WireContact,
        message_id: MessageId,
        contacts: Vec<WireContact>,
    ) -> Envelope {
        Envelope {
            contacts: Some(contacts),
            ..Envelope::base(Kind::FindNodeOk, from, message_id)
        }
    }

    pub fn find_value(from: WireContact, message_id: MessageId, key: &str) -> Envelope {
        Envelope {
            key: Some(key.to_string()),
            ..Envelope::base(Kind::FindValue, from, message_id)
        }
    }

    pub fn find_value_ok_value(
        from: WireContact,
        message_id: MessageId,
        key: &str,
        value: Vec<u8>,
    ) -> Envelope {
        Envelope {
            key: Some(key.to_string()),
            value: Some(value),
            ..Envelope::base(Kind::FindValueOk, from, message_id)
        }
    }

    pub fn find_value_ok_contacts(
        from: WireContact,
        message_id: MessageId,
        key: &str,
        contacts: Vec<WireContact>,
    ) -> Envelope {
        Envelope {
            key: Some(key.to_string()),
            contacts: Some(contacts),
            ..Envelope::base(Kind::FindValueOk, from, message_id)
        }
    }

    pub fn store(
        from: WireContact,
        message_id: MessageId,
        key: &str,
        value: Vec<u8>,
    ) -> Envelope {
        Envelope {
            key: Some(key.to_string()),
            value: Some(value),
            ..Envelope::base(Kind::Store, from, message_id)
        }
    }

    pub fn store_ok(from: WireContact, message_id: MessageId) -> Envelope {
        Envelope::base(Kind::StoreOk, from, message_id)
    }

    /// True for acknowledgement kinds, which are correlated to an
    /// inflight request instead of dispatched to a handler.
    pub fn is_response(&self) -> bool {
        matches!(
            self.kind,
            Kind::Pong | Kind::FindNodeOk | Kind::FindValueOk | Kind::StoreOk
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sender() -> WireContact {
        WireContact {
            id: Id::random(),
            address: "127.0.0.1:9001".to_string(),
        }
    }

    #[test]
    fn roundtrip_ping() {
        let envelope = Envelope::ping(sender(), MessageId::random());
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert!(!envelope.is_response());
    }

    #[test]
    fn roundtrip_find_node_ok() {
        let contacts = vec![sender(), sender()];
        let envelope = Envelope::find_node_ok(sender(), MessageId::random(), contacts.clone());
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.contacts, Some(contacts));
        assert!(decoded.is_response());
    }

    #[test]
    fn roundtrip_store_value_bytes() {
        let value = vec![0u8, 1, 2, 255];
        let key = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";
        let envelope = Envelope::store(sender(), MessageId::random(), key, value.clone());
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.key.as_deref(), Some(key));
        assert_eq!(decoded.value, Some(value));
    }

    #[test]
    fn kind_wire_names() {
        let envelope = Envelope::find_value(sender(), MessageId::random(), "ab");
        let bytes = envelope.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("\"FIND_VALUE\""));
    }

    #[test]
    fn optional_fields_omitted() {
        let envelope = Envelope::pong(sender(), MessageId::random());
        let text = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();

        assert!(!text.contains("target_id"));
        assert!(!text.contains("value"));
    }

    #[test]
    fn malformed_bytes_fail() {
        assert!(Envelope::from_bytes(b"not json").is_err());
        assert!(Envelope::from_bytes(b"{\"type\":\"BOGUS\"}").is_err());
    }

    #[test]
    fn wire_contact_bad_address() {
        let wire = WireContact {
            id: Id::random(),
            address: "not-an-address".to_string(),
        };

        assert!(wire.to_contact().is_err());
    }
}
