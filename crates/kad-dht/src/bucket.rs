//! K-bucket: a bounded, LRU-ordered list of contacts covering one range of
//! the keyspace.

use std::collections::VecDeque;

use crate::contact::Contact;
use crate::id::NodeId;
use crate::K;

/// Result of [`KBucket::add`].
#[derive(Debug)]
pub enum AddResult {
    /// The contact was newly appended.
    Added,
    /// An existing contact was moved to the tail and refreshed.
    Updated,
    /// The bucket is full. The caller should ping `candidate` (the
    /// least-recently-seen contact) and call [`KBucket::remove`] or
    /// [`KBucket::replace_candidate`] depending on the outcome.
    Full {
        /// The least-recently-seen contact in the bucket.
        candidate: Contact,
    },
}

/// A single k-bucket holding up to `k` contacts, covering the closed range
/// `[range_lo, range_hi]` of the keyspace. Both bounds are inclusive because
/// `NodeId::split_range` hands out `(lo, mid)` / `(mid + 1, hi)` pairs that
/// are themselves closed ranges — a half-open convention here would drop the
/// midpoint id from both halves of every split.
#[derive(Debug)]
pub struct KBucket {
    range_lo: NodeId,
    range_hi: NodeId,
    /// Contacts ordered by `last_seen` ascending: index 0 is oldest.
    contacts: VecDeque<Contact>,
    capacity: usize,
    last_accessed: u64,
}

impl KBucket {
    /// Create an empty bucket covering `[range_lo, range_hi]` with the
    /// default capacity `k`.
    pub fn new(range_lo: NodeId, range_hi: NodeId) -> Self {
        Self::with_capacity(range_lo, range_hi, K)
    }

    /// Create an empty bucket with an explicit capacity (tests use small
    /// values such as 4).
    pub fn with_capacity(range_lo: NodeId, range_hi: NodeId, capacity: usize) -> Self {
        Self {
            range_lo,
            range_hi,
            contacts: VecDeque::with_capacity(capacity),
            capacity,
            last_accessed: now_secs(),
        }
    }

    /// Lower bound of the covered range (inclusive).
    pub fn range_lo(&self) -> &NodeId {
        &self.range_lo
    }

    /// Upper bound of the covered range (inclusive).
    pub fn range_hi(&self) -> &NodeId {
        &self.range_hi
    }

    /// Whether `id` falls within this bucket's `[range_lo, range_hi]`.
    pub fn covers(&self, id: &NodeId) -> bool {
        *id >= self.range_lo && *id <= self.range_hi
    }

    /// Whether the bucket has reached capacity.
    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    /// Number of contacts currently held.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the bucket holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.id == *id)
    }

    /// Add or refresh a contact. See [`AddResult`] for the state machine.
    pub fn add(&mut self, contact: Contact) -> AddResult {
        if let Some(idx) = self.position(&contact.id) {
            let mut existing = self.contacts.remove(idx).expect("index from position");
            existing.touch();
            self.contacts.push_back(existing);
            return AddResult::Updated;
        }

        if !self.is_full() {
            self.contacts.push_back(contact);
            return AddResult::Added;
        }

        AddResult::Full {
            candidate: self.contacts.front().cloned().expect("full bucket is non-empty"),
        }
    }

    /// Look up a contact by id.
    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        self.contacts.iter().find(|c| c.id == *id).cloned()
    }

    /// Remove `id`. If `force` is false, only increments the contact's
    /// failure count and removes it once that count would exceed
    /// `FAILED_RPC_LIMIT`; if `force` is true, removes immediately.
    pub fn remove(&mut self, id: &NodeId, force: bool) -> Option<Contact> {
        let idx = self.position(id)?;
        if force {
            return self.contacts.remove(idx);
        }
        let contact = self.contacts.get_mut(idx).expect("index from position");
        contact.mark_failed();
        if contact.is_stale() {
            self.contacts.remove(idx)
        } else {
            None
        }
    }

    /// Replace the least-recently-seen contact (the one returned as
    /// `candidate` from a previous `Full` result) with a new contact,
    /// after the caller has confirmed the candidate is unreachable.
    pub fn replace_candidate(&mut self, candidate_id: &NodeId, new_contact: Contact) {
        if let Some(idx) = self.position(candidate_id) {
            self.contacts.remove(idx);
        }
        self.contacts.push_back(new_contact);
    }

    /// All contacts, optionally excluding one id (e.g. the requester).
    pub fn contacts(&self, exclude: Option<&NodeId>) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| exclude != Some(&c.id))
            .cloned()
            .collect()
    }

    /// Mark this bucket as freshly accessed, for the refresh sweep.
    pub fn touch(&mut self) {
        self.last_accessed = now_secs();
    }

    /// Seconds since this bucket was last accessed.
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    /// Split this bucket at its midpoint, consuming it and redistributing
    /// its contacts into the two halves.
    ///
    /// Returns `(lower_half, upper_half)`, both at this bucket's capacity.
    pub fn split(self) -> crate::Result<(KBucket, KBucket)> {
        let ((lo1, hi1), (lo2, hi2)) = NodeId::split_range(&self.range_lo, &self.range_hi)?;
        let mut lower = KBucket::with_capacity(lo1, hi1, self.capacity);
        let mut upper = KBucket::with_capacity(lo2, hi2, self.capacity);
        for contact in self.contacts {
            if lower.covers(&contact.id) {
                lower.contacts.push_back(contact);
            } else {
                upper.contacts.push_back(contact);
            }
        }
        Ok((lower, upper))
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
