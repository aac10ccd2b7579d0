use std::collections::VecDeque;

use rand::Rng;

use super::identifier::{Contact, KadId, ID_LENGTH};

/// Outcome of a bucket or routing table insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertOutcome {
    /// Normal insertion.
    Inserted,
    /// The id was already present; treated as a liveness touch and moved to
    /// the most-recently-seen position, endpoint updated.
    Refreshed,
    /// The bucket is at capacity; the newcomer was rejected.
    Full,
    /// The contact is the local node and is never stored.
    IsSelf,
}

/// Holds up to `k` contacts at one prefix distance from the local id.
/// The most-recently-seen contact sits at the front of the deque.
#[derive(Debug)]
pub struct Bucket {
    depth: usize,
    k: usize,
    contacts: VecDeque<Contact>,
}

impl Bucket {
    fn new(depth: usize, k: usize) -> Self {
        Self {
            depth,
            k,
            contacts: VecDeque::with_capacity(k),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, id: &KadId) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            // Seen again: move to MRU and pick up any endpoint change.
            self.contacts.remove(pos);
            self.contacts.push_front(contact);
            InsertOutcome::Refreshed
        } else if self.contacts.len() < self.k {
            self.contacts.push_front(contact);
            InsertOutcome::Inserted
        } else {
            // At capacity. A newcomer is rejected; the LRU-ping eviction of
            // the Kademlia paper would probe self.contacts.back() here.
            InsertOutcome::Full
        }
    }

    fn remove(&mut self, id: &KadId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

/// The 160-bucket prefix-keyed routing structure.
///
/// Bucket `i` holds contacts at bucket distance `i + 1` from the local id;
/// distance 0 means the id is our own and is never stored. Only the local
/// identifier is kept here, not the owning node, so the structure
/// serializes without a reference cycle.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: KadId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: KadId, k: usize) -> Self {
        let buckets = (0..ID_LENGTH).map(|depth| Bucket::new(depth, k)).collect();
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> KadId {
        self.local_id
    }

    fn bucket_index(&self, id: &KadId) -> Option<usize> {
        match self.local_id.bucket_distance(id) {
            0 => None,
            d => Some(d - 1),
        }
    }

    /// Insert a contact into the bucket for its distance. The local node is
    /// ignored; an already-known id counts as a liveness touch.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        match self.bucket_index(&contact.id) {
            None => InsertOutcome::IsSelf,
            Some(index) => {
                let outcome = self.buckets[index].insert(contact);
                if outcome == InsertOutcome::Full {
                    tracing::debug!(
                        id = %contact.id.short_hex(),
                        depth = index,
                        "bucket full, contact rejected"
                    );
                }
                outcome
            }
        }
    }

    /// Remove the contact with this id, if present. Uses the same
    /// `bucket_distance - 1` index as insert.
    pub fn remove(&mut self, id: &KadId) -> bool {
        match self.bucket_index(id) {
            None => false,
            Some(index) => self.buckets[index].remove(id),
        }
    }

    pub fn contains(&self, id: &KadId) -> bool {
        match self.bucket_index(id) {
            None => false,
            Some(index) => self.buckets[index].contains(id),
        }
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// Every contact in the table, bucket order.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts().copied())
            .collect()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// Up to `num` contacts sorted by ascending XOR distance to `target`.
    ///
    /// Seeds from the bucket the target would land in, then walks outward
    /// symmetrically until enough contacts are collected, and re-sorts by
    /// the raw XOR distance (finer than the bucket index).
    pub fn find_closest(&self, target: &KadId, num: usize) -> Vec<Contact> {
        let seed = self
            .bucket_index(target)
            .unwrap_or(0)
            .min(ID_LENGTH - 1);

        let mut closest: Vec<Contact> = Vec::with_capacity(num);
        closest.extend(self.buckets[seed].contacts().copied());

        for i in 1..ID_LENGTH {
            if closest.len() >= num {
                break;
            }
            if seed >= i {
                closest.extend(self.buckets[seed - i].contacts().copied());
            }
            if seed + i < ID_LENGTH {
                closest.extend(self.buckets[seed + i].contacts().copied());
            }
        }

        closest.sort_by_key(|c| c.id.distance(target));
        closest.truncate(num);
        closest
    }

    /// One target identifier per bucket distance 1..=159, each chosen so a
    /// lookup for it lands in that bucket: the bit at `160 - i` (counted
    /// from the most significant bit) is flipped and every lower bit is
    /// randomized.
    pub fn refresh_targets(&self) -> Vec<KadId> {
        let mut targets = Vec::with_capacity(ID_LENGTH - 1);
        for i in 1..ID_LENGTH {
            let flip = ID_LENGTH - i;
            let mut id = self
                .local_id
                .with_bit(flip, self.local_id.get_bit_at(flip) ^ 1);
            let mut rng = rand::rng();
            for j in (flip + 1)..ID_LENGTH {
                id = id.with_bit(j, rng.random::<bool>() as u8);
            }
            targets.push(id);
        }
        targets
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::{id_with_first_byte, make_contact};

    #[test]
    fn insert_lands_in_the_distance_bucket() {
        let local = id_with_first_byte(0x00);
        let mut rt = RoutingTable::new(local, 5);

        let peer = make_contact(1, 4001, 0x80); // differs in the MSB
        assert_eq!(rt.insert(peer), InsertOutcome::Inserted);

        let depth = local.bucket_distance(&peer.id) - 1;
        assert_eq!(depth, 159);
        let holding: Vec<usize> = rt
            .buckets()
            .filter(|b| b.contains(&peer.id))
            .map(Bucket::depth)
            .collect();
        assert_eq!(holding, vec![depth]);
    }

    #[test]
    fn local_id_is_never_stored() {
        let local = id_with_first_byte(0xAA);
        let mut rt = RoutingTable::new(local, 5);
        let me = Contact::new(local, std::net::Ipv4Addr::LOCALHOST, 4000);
        assert_eq!(rt.insert(me), InsertOutcome::IsSelf);
        assert!(rt.is_empty());
    }

    #[test]
    fn reinsert_is_a_liveness_touch() {
        let local = id_with_first_byte(0x00);
        let mut rt = RoutingTable::new(local, 5);

        let first = make_contact(1, 4001, 0x80);
        rt.insert(first);
        let moved = Contact::new(first.id, first.address, 4999);
        assert_eq!(rt.insert(moved), InsertOutcome::Refreshed);

        assert_eq!(rt.len(), 1);
        let stored = rt.all_contacts()[0];
        assert_eq!(stored.port, 4999);
    }

    #[test]
    fn full_bucket_rejects_newcomers() {
        let local = id_with_first_byte(0x00);
        let mut rt = RoutingTable::new(local, 2);

        // All three land in the top bucket (MSB differs).
        let a = make_contact(1, 4001, 0x80);
        let b = make_contact(2, 4002, 0x81);
        let c = make_contact(3, 4003, 0x82);
        assert_eq!(rt.insert(a), InsertOutcome::Inserted);
        assert_eq!(rt.insert(b), InsertOutcome::Inserted);
        assert_eq!(rt.insert(c), InsertOutcome::Full);
        assert!(!rt.contains(&c.id));
    }

    #[test]
    fn remove_uses_the_insert_bucket() {
        let local = id_with_first_byte(0x00);
        let mut rt = RoutingTable::new(local, 5);
        let peer = make_contact(1, 4001, 0x04);
        rt.insert(peer);
        assert!(rt.contains(&peer.id));
        assert!(rt.remove(&peer.id));
        assert!(!rt.contains(&peer.id));
        assert!(!rt.remove(&peer.id));
    }

    #[test]
    fn find_closest_is_sorted_and_bounded() {
        let local = id_with_first_byte(0x00);
        let mut rt = RoutingTable::new(local, 20);

        for b in [0x01u8, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80] {
            rt.insert(make_contact(b, 4000 + b as u16, b));
        }

        let target = id_with_first_byte(0x03);
        let found = rt.find_closest(&target, 4);
        assert_eq!(found.len(), 4);
        for pair in found.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }

        // Asking for more than the table holds returns everything.
        let all = rt.find_closest(&target, 100);
        assert_eq!(all.len(), 8);
        let mut ids: Vec<_> = all.iter().map(|c| c.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn refresh_targets_cover_their_buckets() {
        let local = KadId::random();
        let rt = RoutingTable::new(local, 5);
        let targets = rt.refresh_targets();
        assert_eq!(targets.len(), ID_LENGTH - 1);
        for (i, target) in targets.iter().enumerate() {
            assert_eq!(local.bucket_distance(target), i + 1);
        }
    }
}
