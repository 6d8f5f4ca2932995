//! Miscellaneous common structs used throughout the library.

mod contact;
mod id;

pub use contact::*;
pub use id::*;

/// K = the replication factor, and the maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
