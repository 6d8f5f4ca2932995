//! Kbuckets
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
};

use crate::common::{Contact, Id, MAX_BUCKET_SIZE_K};

/// Maximum number of contacts remembered in a bucket's replacement cache.
pub(crate) const REPLACEMENT_CACHE_SIZE: usize = 32;

/// A bounded list of contacts ordered most-recently-observed first, with
/// a replacement cache of recently seen contacts that did not fit.
pub struct KBucket {
    /// Front = most recently observed, back = least recently observed.
    contacts: VecDeque<Contact>,
    replacements: VecDeque<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: VecDeque::with_capacity(MAX_BUCKET_SIZE_K),
            replacements: VecDeque::new(),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= MAX_BUCKET_SIZE_K
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    /// The least recently observed contact, if any.
    pub fn lru(&self) -> Option<Contact> {
        self.contacts.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Move an existing contact to the most-recently-observed position.
    /// Returns false if the contact is not in the bucket.
    pub fn promote(&mut self, id: &Id) -> bool {
        match self.contacts.iter().position(|c| c.id == *id) {
            Some(index) => {
                let contact = self.contacts.remove(index).expect("position just found");
                self.contacts.push_front(contact);
                true
            }
            None => false,
        }
    }

    /// Insert a contact at the most-recently-observed position, promoting
    /// it instead if already present, and doing nothing when the bucket
    /// is full. Returns true if the contact is in the bucket afterwards.
    pub fn insert_mru(&mut self, contact: Contact) -> bool {
        if self.promote(&contact.id) {
            return true;
        }

        if self.is_full() {
            return false;
        }

        // The main list and the replacement cache never share an id.
        self.replacements.retain(|c| c.id != contact.id);
        self.contacts.push_front(contact);
        true
    }

    /// Remove a contact by id. Returns true if it was present.
    pub fn remove(&mut self, id: &Id) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.id != *id);

        self.contacts.len() != before
    }

    /// Remember a contact that did not fit in the full bucket. The cache
    /// is deduplicated, disjoint from the main list, and drops its oldest
    /// entry when full.
    pub fn push_replacement(&mut self, contact: Contact) {
        if self.contains(&contact.id) {
            return;
        }
        if self.replacements.iter().any(|c| c.id == contact.id) {
            return;
        }

        if self.replacements.len() >= REPLACEMENT_CACHE_SIZE {
            self.replacements.pop_front();
        }
        self.replacements.push_back(contact);
    }

    pub fn replacements_len(&self) -> usize {
        self.replacements.len()
    }

    pub fn replacement_contains(&self, id: &Id) -> bool {
        self.replacements.iter().any(|c| c.id == *id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucket{{ contacts: {}, replacements: {} }}",
            self.contacts.len(),
            self.replacements.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn max_size() {
        let mut bucket = KBucket::new();
        for _ in 0..MAX_BUCKET_SIZE_K {
            assert!(bucket.insert_mru(Contact::random()));
        }

        assert!(bucket.is_full());
        assert!(!bucket.insert_mru(Contact::random()));
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn newest_in_front() {
        let mut bucket = KBucket::new();
        let first = Contact::random();
        let second = Contact::random();

        bucket.insert_mru(first);
        bucket.insert_mru(second);

        assert_eq!(bucket.iter().next().unwrap().id, second.id);
        assert_eq!(bucket.lru().unwrap().id, first.id);
    }

    #[test]
    fn promote_moves_to_front() {
        let mut bucket = KBucket::new();
        let first = Contact::random();
        let second = Contact::random();

        bucket.insert_mru(first);
        bucket.insert_mru(second);

        assert!(bucket.promote(&first.id));
        assert_eq!(bucket.iter().next().unwrap().id, first.id);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn insert_deduplicates() {
        let mut bucket = KBucket::new();
        let contact = Contact::random();

        bucket.insert_mru(contact);
        bucket.insert_mru(contact);

        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn replacement_cache_bounded_and_disjoint() {
        let mut bucket = KBucket::new();
        let resident = Contact::random();
        bucket.insert_mru(resident);

        // A resident contact never enters the cache.
        bucket.push_replacement(resident);
        assert_eq!(bucket.replacements_len(), 0);

        let oldest = Contact::random();
        bucket.push_replacement(oldest);
        bucket.push_replacement(oldest);
        assert_eq!(bucket.replacements_len(), 1);

        for _ in 0..REPLACEMENT_CACHE_SIZE {
            bucket.push_replacement(Contact::random());
        }

        assert_eq!(bucket.replacements_len(), REPLACEMENT_CACHE_SIZE);
        assert!(!bucket.replacement_contains(&oldest.id));
    }

    #[test]
    fn promoting_out_of_cache_on_insert() {
        let mut bucket = KBucket::new();
        let contact = Contact::random();

        bucket.push_replacement(contact);
        assert!(bucket.replacement_contains(&contact.id));

        bucket.insert_mru(contact);
        assert!(bucket.contains(&contact.id));
        assert!(!bucket.replacement_contains(&contact.id));
    }
}
