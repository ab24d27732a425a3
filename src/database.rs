//! # Signed Value Store
//!
//! Values are attributable: every [`KeyValue`] carries its publisher's public
//! key and an Ed25519 signature over the key, flags, creation time, and
//! payload. Verification happens before any state mutation and fails closed.
//!
//! Each key holds a [`ValueBag`] with at most one value per publisher. The
//! network master key gets override privileges: its values bypass capacity
//! limits, may lock a bag against other writers ([`ValueFlags::LOCK`]), and
//! may wipe a bag before inserting ([`ValueFlags::CLEAR`]).
//!
//! The [`Database`] bounds total keys with an LRU map and keeps a binary trie
//! over the resident keys in lockstep, so "which stored key is nearest to
//! this identifier" is answerable without scanning.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::crypto::{Keypair, PublicKey, SignatureError, VALUE_SIGNATURE_DOMAIN};
use crate::kuid::{Kuid, KUID_BITS};

/// Per-value mode bits, carried on the wire and covered by the signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueFlags(u8);

impl ValueFlags {
    pub const NONE: ValueFlags = ValueFlags(0);
    /// Wipe the key's existing values before inserting this one.
    /// Honored only for master-signed values.
    pub const CLEAR: ValueFlags = ValueFlags(0b01);
    /// Lock the key's collection against non-master writers for as long as
    /// the bag stays non-empty. Honored only for master-signed values.
    pub const LOCK: ValueFlags = ValueFlags(0b10);

    #[inline]
    pub fn contains(&self, other: ValueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(self, other: ValueFlags) -> ValueFlags {
        ValueFlags(self.0 | other.0)
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Why a store was refused. Returned to the caller and surfaced to the
/// sender; never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreRejection {
    #[error("value signature did not verify: {0}")]
    BadSignature(SignatureError),
    #[error("value creation time is implausibly far in the future")]
    ClockSkew,
    #[error("collection is locked by a master-signed value")]
    Locked,
    #[error("collection is at capacity for untrusted publishers")]
    Full,
}

/// One signed value as stored and as carried on the wire.
///
/// `republished_at_ms`, `origin_local`, and `num_locs` are local bookkeeping
/// and never serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Kuid,
    pub payload: Vec<u8>,
    pub publisher: PublicKey,
    pub signature: Vec<u8>,
    pub flags: ValueFlags,
    pub created_at_ms: u64,
    #[serde(skip)]
    pub republished_at_ms: u64,
    #[serde(skip)]
    pub origin_local: bool,
    /// How many custodians acknowledged the last publish of this value;
    /// scales the republish interval. Zero until the first publish.
    #[serde(skip)]
    pub num_locs: u32,
}

impl KeyValue {
    /// Create and sign a locally-originated value.
    pub fn new_local(
        keypair: &Keypair,
        key: Kuid,
        payload: Vec<u8>,
        flags: ValueFlags,
        now_ms: u64,
    ) -> Self {
        let mut value = Self {
            key,
            payload,
            publisher: keypair.public_key(),
            signature: Vec::new(),
            flags,
            created_at_ms: now_ms,
            republished_at_ms: 0,
            origin_local: true,
            num_locs: 0,
        };
        value.signature = keypair.sign(VALUE_SIGNATURE_DOMAIN, &value.signable_bytes());
        value
    }

    /// The byte string the signature covers: key, flags, creation time,
    /// payload, in fixed order.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KUID_BITS / 8 + 1 + 8 + self.payload.len());
        out.extend_from_slice(self.key.as_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.created_at_ms.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Verify the publisher's signature.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.publisher
            .verify(VALUE_SIGNATURE_DOMAIN, &self.signable_bytes(), &self.signature)
    }

    /// The publisher's position in the identifier space.
    #[inline]
    pub fn publisher_id(&self) -> Kuid {
        self.publisher.id()
    }

    /// An empty payload is a signed removal request.
    #[inline]
    pub fn is_removal(&self) -> bool {
        self.payload.is_empty()
    }

    fn is_signed_by(&self, key: &Option<PublicKey>) -> bool {
        key.as_ref().is_some_and(|k| *k == self.publisher)
    }
}

/// Per-key collection: at most one value per publisher, plus a lock bit.
#[derive(Clone, Debug, Default)]
pub struct ValueBag {
    values: HashMap<Kuid, KeyValue>,
    locked: bool,
}

impl ValueBag {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn values(&self) -> impl Iterator<Item = &KeyValue> {
        self.values.values()
    }

    pub fn value_from(&self, publisher_id: &Kuid) -> Option<&KeyValue> {
        self.values.get(publisher_id)
    }

    /// Insert a verified value. `is_master` grants lock/clear/capacity
    /// privileges; `max_per_key` caps distinct publishers.
    fn add(
        &mut self,
        value: KeyValue,
        is_master: bool,
        max_per_key: usize,
    ) -> Result<(), StoreRejection> {
        if self.locked && !is_master {
            return Err(StoreRejection::Locked);
        }

        let publisher_id = value.publisher_id();

        if value.is_removal() {
            self.values.remove(&publisher_id);
            if self.values.is_empty() {
                self.locked = false;
            }
            return Ok(());
        }

        if is_master && value.flags.contains(ValueFlags::CLEAR) {
            self.values.clear();
            self.locked = false;
        }

        let replacing = self.values.contains_key(&publisher_id);
        if !replacing && !is_master && self.values.len() >= max_per_key {
            return Err(StoreRejection::Full);
        }

        if is_master && value.flags.contains(ValueFlags::LOCK) {
            self.locked = true;
        }
        self.values.insert(publisher_id, value);
        Ok(())
    }

    fn remove(&mut self, publisher_id: &Kuid) -> Option<KeyValue> {
        let removed = self.values.remove(publisher_id);
        if self.values.is_empty() {
            self.locked = false;
        }
        removed
    }
}

/// Binary trie over resident keys; answers nearest-key queries by XOR
/// distance. Kept in lockstep with the LRU map by the single write path.
#[derive(Clone, Debug, Default)]
struct KeyTrie {
    root: Option<TrieNode>,
}

/// Path-compressed: a branch stores the bit index where its two subtrees
/// diverge, so depth in the tree does not track depth in the key.
#[derive(Clone, Debug)]
enum TrieNode {
    Leaf(Kuid),
    Branch {
        bit: usize,
        zero: Box<TrieNode>,
        one: Box<TrieNode>,
    },
}

impl TrieNode {
    /// Any key under this node; all of them agree on every bit above the
    /// node's branch index.
    fn representative(&self) -> Kuid {
        match self {
            TrieNode::Leaf(key) => *key,
            TrieNode::Branch { zero, .. } => zero.representative(),
        }
    }

    fn branch_at(split: usize, a: TrieNode, b_key: Kuid) -> TrieNode {
        let b = TrieNode::Leaf(b_key);
        let (zero, one) = if b_key.bit(split) { (a, b) } else { (b, a) };
        TrieNode::Branch {
            bit: split,
            zero: Box::new(zero),
            one: Box::new(one),
        }
    }
}

impl KeyTrie {
    fn insert(&mut self, key: Kuid) {
        match self.root.take() {
            None => self.root = Some(TrieNode::Leaf(key)),
            Some(node) => self.root = Some(Self::insert_at(node, key)),
        }
    }

    fn insert_at(node: TrieNode, key: Kuid) -> TrieNode {
        match node {
            TrieNode::Leaf(existing) => {
                if existing == key {
                    TrieNode::Leaf(existing)
                } else {
                    let split = existing.common_prefix_len(&key);
                    TrieNode::branch_at(split, TrieNode::Leaf(existing), key)
                }
            }
            TrieNode::Branch { bit, zero, one } => {
                let prefix = zero.representative();
                let split = prefix.common_prefix_len(&key);
                if split < bit {
                    // Diverges above this branch: insert a new branch on top.
                    let node = TrieNode::Branch { bit, zero, one };
                    TrieNode::branch_at(split, node, key)
                } else if key.bit(bit) {
                    TrieNode::Branch {
                        bit,
                        zero,
                        one: Box::new(Self::insert_at(*one, key)),
                    }
                } else {
                    TrieNode::Branch {
                        bit,
                        zero: Box::new(Self::insert_at(*zero, key)),
                        one,
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: &Kuid) {
        if let Some(node) = self.root.take() {
            self.root = Self::remove_at(node, key);
        }
    }

    fn remove_at(node: TrieNode, key: &Kuid) -> Option<TrieNode> {
        match node {
            TrieNode::Leaf(existing) => (existing != *key).then_some(TrieNode::Leaf(existing)),
            TrieNode::Branch { bit, zero, one } => {
                let (zero, one) = if key.bit(bit) {
                    (Some(*zero), Self::remove_at(*one, key))
                } else {
                    (Self::remove_at(*zero, key), Some(*one))
                };
                match (zero, one) {
                    (Some(z), Some(o)) => Some(TrieNode::Branch {
                        bit,
                        zero: Box::new(z),
                        one: Box::new(o),
                    }),
                    // A one-armed branch collapses into its remaining child.
                    (Some(only), None) | (None, Some(only)) => Some(only),
                    (None, None) => None,
                }
            }
        }
    }

    /// The resident key XOR-nearest to `target`, if any. At every branch the
    /// subtrees agree on all bits above the branch index, so following the
    /// target's bit minimizes the distance.
    fn select_nearest(&self, target: &Kuid) -> Option<Kuid> {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                TrieNode::Leaf(key) => return Some(*key),
                TrieNode::Branch { bit, zero, one } => {
                    node = if target.bit(*bit) { one } else { zero };
                }
            }
        }
    }
}

/// Bounded, trie-indexed map of keys to signed value collections.
pub struct Database {
    config: DhtConfig,
    bags: LruCache<Kuid, ValueBag>,
    index: KeyTrie,
}

impl Database {
    pub fn new(config: DhtConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_keys.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            bags: LruCache::new(cap),
            index: KeyTrie::default(),
        }
    }

    fn is_master(&self, value: &KeyValue) -> bool {
        value.is_signed_by(&self.config.master_key)
    }

    /// Verify and insert a value.
    ///
    /// The signature is checked before anything else; a value that does not
    /// verify never touches state. Capacity, lock, and clock-skew rules come
    /// from the config. Inserting a key past `max_keys` evicts the least
    /// recently used key, with its trie entry, atomically.
    pub fn add(&mut self, value: KeyValue, now_ms: u64) -> Result<(), StoreRejection> {
        if let Err(err) = value.verify() {
            debug!(key = %value.key, "rejecting unverifiable value");
            return Err(StoreRejection::BadSignature(err));
        }

        let skew = self.config.max_clock_skew.as_millis() as u64;
        if value.created_at_ms > now_ms.saturating_add(skew) {
            debug!(key = %value.key, created_at_ms = value.created_at_ms, "rejecting future-dated value");
            return Err(StoreRejection::ClockSkew);
        }

        let is_master = self.is_master(&value);
        let max_per_key = self.config.max_values_per_key;
        let key = value.key;

        if let Some(bag) = self.bags.get_mut(&key) {
            bag.add(value, is_master, max_per_key)?;
            if bag.is_empty() {
                self.bags.pop(&key);
                self.index.remove(&key);
            }
            return Ok(());
        }

        let mut bag = ValueBag::default();
        bag.add(value, is_master, max_per_key)?;
        if bag.is_empty() {
            // Removal for a key we never held.
            return Ok(());
        }
        if let Some((evicted_key, _)) = self.bags.push(key, bag) {
            if evicted_key != key {
                trace!(evicted = %evicted_key, "key capacity reached, evicting");
                self.index.remove(&evicted_key);
            }
        }
        self.index.insert(key);
        Ok(())
    }

    /// All values under `key`. Touches the key's LRU position.
    pub fn get(&mut self, key: &Kuid) -> Vec<KeyValue> {
        self.bags
            .get(key)
            .map(|bag| bag.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Read without affecting LRU order.
    pub fn peek(&self, key: &Kuid) -> Option<&ValueBag> {
        self.bags.peek(key)
    }

    /// Drop one publisher's value under `key`. Returns the removed value.
    pub fn remove(&mut self, key: &Kuid, publisher_id: &Kuid) -> Option<KeyValue> {
        let bag = self.bags.peek_mut(key)?;
        let removed = bag.remove(publisher_id);
        if bag.is_empty() {
            self.bags.pop(key);
            self.index.remove(key);
        }
        removed
    }

    /// The stored key nearest to `target` by XOR distance.
    pub fn select_nearest(&self, target: &Kuid) -> Option<Kuid> {
        self.index.select_nearest(target)
    }

    /// Whether a value has outlived its welcome. Locally-originated values
    /// never expire here; remote values use the full TTL when master-signed
    /// and half of it otherwise.
    pub fn is_expired(&self, value: &KeyValue, now_ms: u64) -> bool {
        if value.origin_local {
            return false;
        }
        let ttl = if self.is_master(value) {
            self.config.value_ttl
        } else {
            self.config.anonymous_value_ttl
        };
        now_ms.saturating_sub(value.created_at_ms) >= ttl.as_millis() as u64
    }

    /// Whether a locally-originated value is due for republishing.
    ///
    /// The interval scales with how widely the last publish landed: a value
    /// on few custodians republishes sooner, floored at the configured
    /// minimum. Remote values are never republished by this node.
    pub fn is_republish_due(&self, value: &KeyValue, now_ms: u64) -> bool {
        if !value.origin_local {
            return false;
        }
        let base = self.config.republish_interval.as_millis() as u64;
        let floor = self.config.min_republish_interval.as_millis() as u64;
        let k = self.config.k.max(1) as u64;
        let scaled = base * u64::from(value.num_locs).min(k) / k;
        let interval = scaled.max(floor);
        let last = value.republished_at_ms.max(value.created_at_ms);
        now_ms.saturating_sub(last) >= interval
    }

    /// Record a completed publish for a local value.
    pub fn mark_republished(
        &mut self,
        key: &Kuid,
        publisher_id: &Kuid,
        num_locs: u32,
        now_ms: u64,
    ) {
        if let Some(bag) = self.bags.peek_mut(key) {
            if let Some(value) = bag.values.get_mut(publisher_id) {
                value.republished_at_ms = now_ms;
                value.num_locs = num_locs;
            }
        }
    }

    /// Snapshot of every stored value. Does not affect LRU order.
    pub fn values(&self) -> Vec<KeyValue> {
        self.bags
            .iter()
            .flat_map(|(_, bag)| bag.values().cloned())
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.bags.len()
    }

    pub fn value_count(&self) -> usize {
        self.bags.iter().map(|(_, bag)| bag.len()).sum()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("keys", &self.key_count())
            .field("values", &self.value_count())
            .finish()
    }
}
