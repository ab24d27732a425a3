//! # Routing Table
//!
//! A flattened prefix trie of k-buckets. Each [`Bucket`] covers one region of
//! the identifier space (all ids sharing its `depth`-bit prefix) and holds up
//! to `k` contacts plus a bounded replacement cache of overflow candidates.
//! The bucket covering the local node's own region splits when full, so the
//! table grows detail around the local identifier and stays coarse far away.
//!
//! None of these operations fail: rejections come back as `false` or absent
//! entries and the caller decides what to log.
//!
//! ## Identity collisions
//!
//! A newcomer claiming the id of an existing live contact at a different
//! address is treated as a spoof attempt and dropped, unless the incumbent
//! has been quiet past the minimum reconnection window. Long-standing
//! identity wins until it times out; this is deliberate asymmetric trust.

use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::contact::{Contact, ContactState};
use crate::kuid::{Kuid, KUID_BITS};

/// One region of the identifier space: up to `k` residents plus a bounded
/// replacement cache.
#[derive(Clone, Debug)]
pub struct Bucket {
    prefix: Kuid,
    depth: usize,
    contacts: Vec<Contact>,
    cache: Vec<Contact>,
    last_touch_ms: u64,
}

impl Bucket {
    fn new(prefix: Kuid, depth: usize) -> Self {
        Self {
            prefix,
            depth,
            contacts: Vec::new(),
            cache: Vec::new(),
            last_touch_ms: 0,
        }
    }

    /// True when `id` falls inside this bucket's region.
    fn covers(&self, id: &Kuid) -> bool {
        id.common_prefix_len(&self.prefix) >= self.depth
    }

    pub fn prefix(&self) -> Kuid {
        self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn replacement_cache(&self) -> &[Contact] {
        &self.cache
    }

    fn is_stale(&self, window_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_touch_ms) >= window_ms
    }

    fn touch(&mut self, now_ms: u64) {
        self.last_touch_ms = now_ms;
    }

    /// Split into the two child regions, redistributing residents and cache.
    fn split(self) -> (Bucket, Bucket) {
        let left = Bucket::new(self.prefix.unset_bit(self.depth), self.depth + 1);
        let right = Bucket::new(self.prefix.set_bit(self.depth), self.depth + 1);
        let mut left = left;
        let mut right = right;
        left.last_touch_ms = self.last_touch_ms;
        right.last_touch_ms = self.last_touch_ms;
        for contact in self.contacts {
            if left.covers(&contact.id) {
                left.contacts.push(contact);
            } else {
                right.contacts.push(contact);
            }
        }
        for contact in self.cache {
            if left.covers(&contact.id) {
                left.cache.push(contact);
            } else {
                right.cache.push(contact);
            }
        }
        (left, right)
    }

    /// Most recently seen cache entry, removed from the cache.
    fn take_freshest_replacement(&mut self) -> Option<Contact> {
        let idx = self
            .cache
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.last_seen_ms)?
            .0;
        Some(self.cache.remove(idx))
    }
}

/// The prefix-indexed routing table for one node.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    local_id: Kuid,
    config: DhtConfig,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: Kuid, config: DhtConfig) -> Self {
        Self {
            local_id,
            config,
            buckets: vec![Bucket::new(Kuid::MIN, 0)],
        }
    }

    pub fn local_id(&self) -> Kuid {
        self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Number of resident contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    fn bucket_index(&self, id: &Kuid) -> usize {
        // Buckets partition the space, so exactly one covers any id.
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .unwrap_or(0)
    }

    /// Look up a resident contact by id.
    pub fn contact(&self, id: &Kuid) -> Option<&Contact> {
        let idx = self.bucket_index(id);
        self.buckets[idx].contacts.iter().find(|c| &c.id == id)
    }

    /// Offer a contact to the table.
    ///
    /// Existing entries are updated in place (address, instance id, liveness).
    /// New contacts go into their bucket, splitting the local-region bucket
    /// when full; a full non-splittable bucket accepts the newcomer only as a
    /// replacement for a down resident, otherwise it lands in the bucket's
    /// replacement cache.
    ///
    /// Returns whether the contact was accepted (inserted or updated); a
    /// cache placement and a spoof rejection both report `false`.
    pub fn add_contact(&mut self, contact: Contact, is_live: bool, now_ms: u64) -> bool {
        if contact.id == self.local_id {
            return false;
        }

        match self.update_existing(&contact, is_live, now_ms) {
            ExistingOutcome::Updated => return true,
            ExistingOutcome::SpoofRejected => return false,
            ExistingOutcome::NotPresent => {}
        }

        loop {
            let idx = self.bucket_index(&contact.id);
            if self.buckets[idx].contacts.len() < self.config.k {
                let bucket = &mut self.buckets[idx];
                let mut contact = contact;
                if is_live {
                    contact.mark_alive(now_ms);
                    bucket.touch(now_ms);
                } else {
                    contact.mark_unknown();
                }
                bucket.cache.retain(|c| c.id != contact.id);
                bucket.contacts.push(contact);
                return true;
            }

            if self.can_split(idx) {
                let bucket = self.buckets.remove(idx);
                let (left, right) = bucket.split();
                self.buckets.insert(idx, right);
                self.buckets.insert(idx, left);
                continue;
            }

            return self.replace_or_cache(idx, contact, is_live, now_ms);
        }
    }

    /// Record a failed exchange with `id`.
    ///
    /// At the failure budget the contact is marked down and, when the bucket
    /// has a replacement candidate, immediately swapped out for the most
    /// recently seen cache entry.
    pub fn handle_failure(&mut self, id: &Kuid) {
        if *id == self.local_id {
            return;
        }
        let idx = self.bucket_index(id);
        let max = self.config.max_failures;

        if let Some(pos) = self.buckets[idx].contacts.iter().position(|c| &c.id == id) {
            let died = self.buckets[idx].contacts[pos].record_failure(max);
            if died {
                trace!(id = %id, "contact exceeded failure budget");
                if let Some(mut replacement) = self.buckets[idx].take_freshest_replacement() {
                    replacement.mark_unknown();
                    debug!(dead = %id, promoted = %replacement.id, "promoting replacement contact");
                    self.buckets[idx].contacts.remove(pos);
                    self.buckets[idx].contacts.push(replacement);
                }
            }
            return;
        }

        if let Some(pos) = self.buckets[idx].cache.iter().position(|c| &c.id == id) {
            if self.buckets[idx].cache[pos].record_failure(max) {
                self.buckets[idx].cache.remove(pos);
            }
        }
    }

    /// The `count` contacts nearest to `target`, ascending by XOR distance,
    /// ties broken toward the most recently confirmed. Down contacts are
    /// excluded.
    pub fn select_closest(&self, target: &Kuid, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<&Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| !c.is_dead())
            .collect();
        candidates.sort_by(|a, b| {
            target
                .xor(&a.id)
                .cmp(&target.xor(&b.id))
                .then(b.last_seen_ms.cmp(&a.last_seen_ms))
        });
        candidates.into_iter().take(count).cloned().collect()
    }

    /// Random lookup targets for buckets whose last touch exceeds the
    /// staleness window (all buckets when `force` is set). The node layer
    /// runs the lookups and reports back via [`RoutingTable::mark_refreshed`].
    pub fn refresh_targets(&self, force: bool, now_ms: u64) -> Vec<Kuid> {
        let window = self.config.bucket_refresh_after.as_millis() as u64;
        self.buckets
            .iter()
            .filter(|b| !b.contacts.is_empty() && (force || b.is_stale(window, now_ms)))
            .map(|b| Kuid::random_within(b.prefix, b.depth))
            .collect()
    }

    /// Stamp the bucket covering `target` as freshly refreshed.
    pub fn mark_refreshed(&mut self, target: &Kuid, now_ms: u64) {
        let idx = self.bucket_index(target);
        self.buckets[idx].touch(now_ms);
    }

    fn can_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        if bucket.depth >= KUID_BITS - 1 {
            return false;
        }
        let covers_local = bucket.covers(&self.local_id);
        // Depth-limit rule: away from the local region a bucket only splits
        // while its depth is not a multiple of the symbol size.
        let depth_ok = bucket.depth % self.config.depth_limit != 0 || bucket.depth == 0;
        covers_local || depth_ok
    }

    fn update_existing(&mut self, contact: &Contact, is_live: bool, now_ms: u64) -> ExistingOutcome {
        let idx = self.bucket_index(&contact.id);
        let min_reconnect = self.config.min_reconnect_time.as_millis() as u64;

        let (existing, in_cache) = {
            let bucket = &mut self.buckets[idx];
            if let Some(e) = bucket.contacts.iter_mut().find(|c| c.id == contact.id) {
                (Some(e), false)
            } else if let Some(e) = bucket.cache.iter_mut().find(|c| c.id == contact.id) {
                (Some(e), true)
            } else {
                (None, false)
            }
        };

        let Some(existing) = existing else {
            return ExistingOutcome::NotPresent;
        };

        if is_live {
            if existing.is_dead() || existing.addr == contact.addr {
                existing.addr = contact.addr;
                existing.instance_id = contact.instance_id;
                existing.mark_alive(now_ms);
            } else if !existing.has_been_quiet_for(min_reconnect, now_ms) {
                // Same id, different address, incumbent alive recently:
                // identity claim stands, drop the newcomer.
                debug!(
                    id = %contact.id,
                    incumbent = %existing.addr,
                    claimant = %contact.addr,
                    "rejecting identity collision inside reconnection window"
                );
                return ExistingOutcome::SpoofRejected;
            } else {
                // Incumbent went quiet past the window; the newcomer wins.
                existing.addr = contact.addr;
                existing.instance_id = contact.instance_id;
                existing.mark_alive(now_ms);
            }
        } else if existing.is_dead() {
            existing.addr = contact.addr;
            existing.instance_id = contact.instance_id;
            existing.mark_unknown();
        }

        if !in_cache && is_live {
            self.buckets[idx].touch(now_ms);
        }
        ExistingOutcome::Updated
    }

    fn replace_or_cache(
        &mut self,
        idx: usize,
        mut contact: Contact,
        is_live: bool,
        now_ms: u64,
    ) -> bool {
        if is_live {
            // A live newcomer may displace a resident that is already down.
            let stale = self.buckets[idx]
                .contacts
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_dead())
                .max_by_key(|(_, c)| c.failures)
                .map(|(i, _)| i);
            if let Some(pos) = stale {
                let evicted = self.buckets[idx].contacts.remove(pos);
                trace!(evicted = %evicted.id, newcomer = %contact.id, "replacing down resident");
                contact.mark_alive(now_ms);
                self.buckets[idx].contacts.push(contact);
                self.buckets[idx].touch(now_ms);
                return true;
            }
        }

        // Bounded replacement cache; an older entry gives way to a fresher one.
        let bucket = &mut self.buckets[idx];
        contact.last_seen_ms = if is_live { now_ms } else { contact.last_seen_ms };
        if bucket.cache.len() >= self.config.replacement_cache_size {
            let oldest = bucket
                .cache
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.last_seen_ms)
                .map(|(i, _)| i);
            match oldest {
                Some(pos) if bucket.cache[pos].last_seen_ms <= contact.last_seen_ms => {
                    bucket.cache.remove(pos);
                }
                _ => return false,
            }
        }
        trace!(id = %contact.id, "bucket full, caching as replacement");
        bucket.cache.push(contact);
        false
    }
}

enum ExistingOutcome {
    Updated,
    SpoofRejected,
    NotPresent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr_for_port(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> DhtConfig {
        DhtConfig {
            k: 4,
            replacement_cache_size: 2,
            max_failures: 2,
            min_reconnect_time: Duration::from_millis(1_000),
            ..DhtConfig::default()
        }
    }

    fn contact_with_prefix(first: u8, port: u16) -> Contact {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        bytes[18] = (port >> 8) as u8;
        bytes[19] = port as u8;
        Contact::new(Kuid::from_bytes(bytes), addr_for_port(port), 0)
    }

    fn local_id() -> Kuid {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x00;
        Kuid::from_bytes(bytes)
    }

    #[test]
    fn accepts_until_bucket_full_then_splits_near_local() {
        let mut table = RoutingTable::new(local_id(), config());
        // Ids near the local region (leading zero bit) keep splitting.
        for port in 1..=12u16 {
            let c = contact_with_prefix(0x00, port);
            assert!(table.add_contact(c, true, 1_000));
        }
        assert_eq!(table.len(), 12);
        assert!(table.buckets().len() > 1);
    }

    #[test]
    fn far_bucket_overflow_goes_to_replacement_cache() {
        let cfg = config();
        let mut table = RoutingTable::new(local_id(), cfg.clone());
        // All in the 0x80 region, far from local id 0x00.
        let mut accepted = 0;
        for port in 1..=10u16 {
            if table.add_contact(contact_with_prefix(0x80, port), true, 1_000) {
                accepted += 1;
            }
        }
        // k residents; the rest cached or dropped, never more than k.
        assert!(accepted >= cfg.k);
        let far_bucket = table
            .buckets()
            .iter()
            .find(|b| !b.contacts().is_empty() && b.contacts()[0].id.bit(0))
            .expect("far bucket exists");
        assert!(far_bucket.contacts().len() <= cfg.k);
        assert!(!far_bucket.replacement_cache().is_empty());
        assert!(far_bucket.replacement_cache().len() <= cfg.replacement_cache_size);
    }

    #[test]
    fn failures_mark_down_and_exclude_from_selection() {
        let cfg = config();
        let mut table = RoutingTable::new(local_id(), cfg.clone());
        let c = contact_with_prefix(0xf0, 9);
        table.add_contact(c.clone(), true, 1_000);
        for _ in 0..cfg.max_failures {
            table.handle_failure(&c.id);
        }
        assert!(table.contact(&c.id).map(|c| c.is_dead()).unwrap_or(true));
        assert!(table.select_closest(&c.id, 8).iter().all(|x| x.id != c.id));
    }

    #[test]
    fn dead_resident_is_replaced_by_promoted_cache_entry() {
        let cfg = config();
        let mut table = RoutingTable::new(local_id(), cfg.clone());
        for port in 1..=4u16 {
            table.add_contact(contact_with_prefix(0x80, port), true, 1_000);
        }
        // Overflow entry lands in the cache.
        let overflow = contact_with_prefix(0x80, 50);
        assert!(!table.add_contact(overflow.clone(), true, 2_000));

        let victim = contact_with_prefix(0x80, 1);
        for _ in 0..cfg.max_failures {
            table.handle_failure(&victim.id);
        }
        assert!(table.contact(&victim.id).is_none());
        assert!(table.contact(&overflow.id).is_some());
    }

    #[test]
    fn collision_rejected_inside_reconnection_window() {
        let mut table = RoutingTable::new(local_id(), config());
        let original = contact_with_prefix(0x80, 7);
        table.add_contact(original.clone(), true, 10_000);

        let mut spoof = original.clone();
        spoof.addr = addr_for_port(666);
        // Inside the window: dropped, original address retained.
        assert!(!table.add_contact(spoof.clone(), true, 10_500));
        assert_eq!(table.contact(&original.id).unwrap().addr, original.addr);

        // Past the window: the claim is honored.
        assert!(table.add_contact(spoof.clone(), true, 20_000));
        assert_eq!(table.contact(&original.id).unwrap().addr, spoof.addr);
    }

    #[test]
    fn select_closest_orders_by_distance() {
        let mut table = RoutingTable::new(local_id(), config());
        let near = contact_with_prefix(0x01, 1);
        let far = contact_with_prefix(0xf0, 2);
        table.add_contact(near.clone(), true, 1_000);
        table.add_contact(far.clone(), true, 1_000);
        let selected = table.select_closest(&local_id(), 2);
        assert_eq!(selected[0].id, near.id);
        assert_eq!(selected[1].id, far.id);
    }

    #[test]
    fn refresh_targets_fall_inside_their_bucket() {
        let mut table = RoutingTable::new(local_id(), config());
        for port in 1..=12u16 {
            table.add_contact(contact_with_prefix(0x00, port), true, 0);
        }
        let targets = table.refresh_targets(true, u64::MAX / 2);
        assert!(!targets.is_empty());
        for target in &targets {
            let idx = table.bucket_index(target);
            assert!(table.buckets()[idx].covers(target));
        }
    }
}
