//! # Kadmos
//! Rust implementation of a Kademlia distributed hash table node with a
//! content-addressed put/get API over UDP.
//!
//! Each node stores values under the SHA-1 hash of their bytes and finds
//! replicas through iterative, parallel lookups over the XOR metric.

mod common;
mod error;
mod kbucket;
mod messages;
mod routing_table;
mod rpc;
mod store;

pub mod cli;
pub mod dht;

pub use crate::common::{hash_value, Contact, Id, ID_SIZE, MAX_BUCKET_SIZE_K};
pub use crate::routing_table::RoutingTable;
pub use dht::{Dht, DhtBuilder};
pub use error::Error;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
