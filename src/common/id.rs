//! Kademlia node Id, lookup target, or content key
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1_smol::Sha1;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

/// The number of buckets in a routing table, one per possible
/// most-significant differing bit.
pub const NUM_BUCKETS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Kademlia node Id, lookup target, or content key.
///
/// Ids order bytewise, which is the big-endian unsigned interpretation
/// used to compare XOR distances.
pub struct Id(pub(crate) [u8; ID_SIZE]);

impl Id {
    /// Generate a random Id from the thread-local CSPRNG.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR distance between this Id and another.
    ///
    /// Distances compare as big-endian unsigned integers through the
    /// derived `Ord`; distance to self is all zeros.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0u8; ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// The routing table bucket index for `other` relative to this Id:
    /// the position of the most significant set bit of the XOR distance,
    /// where 0 is the MSB. Equal Ids map to the last bucket.
    pub fn bucket_index(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let x = self.0[i] ^ other.0[i];

            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }

        NUM_BUCKETS - 1
    }
}

/// SHA-1 content hash of `value`, as an [Id].
pub fn hash_value(value: &[u8]) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(value);

    Id(hasher.digest().bytes())
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidKey(s.to_string()))?;

        Id::from_bytes(bytes)
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    fn try_from(s: &str) -> Result<Id> {
        s.parse()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
