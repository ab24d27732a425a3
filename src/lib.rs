//! # Mangrove - Kademlia-Derived Distributed Hash Table
//!
//! Mangrove is a DHT node library built on:
//!
//! - **Identifiers**: 160-bit KUIDs under the XOR metric; node ids are
//!   derived from Ed25519 public keys
//! - **Routing**: a prefix trie of splitting k-buckets with per-bucket
//!   replacement caches and liveness tracking
//! - **Storage**: signed, attributable values with per-key collections,
//!   master-key trust rules, and bounded capacity
//! - **Maintenance**: a republish/expiration daemon and periodic bucket
//!   refreshes keep replicas alive under churn
//!
//! ## Architecture
//!
//! The node uses the **Actor Pattern** for safe concurrent state:
//! - [`DhtNode`] is a cheap-to-clone public handle; a private actor owns the
//!   routing table and database and processes commands sequentially
//! - Network operations (lookups, stores, bootstrap) run on the handle;
//!   actor commands are fast state ops, so inbound dispatch never waits
//!   behind an operation in flight
//! - The transport is an external collaborator behind the [`DhtRpc`] trait;
//!   inbound frames are dispatched through [`DhtNode::handle_request`]
//!
//! ## Security Model
//!
//! - Every stored value carries its publisher's public key and a
//!   domain-separated Ed25519 signature, verified before any state changes
//! - A configured master key may lock or clear per-key collections and
//!   bypass capacity rules
//! - Identity collisions are rejected while the incumbent is live;
//!   deserialization is size-bounded; all maps and caches are bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `kuid` | 160-bit identifiers and the XOR distance metric |
//! | `contact` | Peer records and the Unknown/Live/Down liveness machine |
//! | `config` | Every tunable in one `DhtConfig` |
//! | `crypto` | Ed25519 keypairs, domain-separated signing, the master key |
//! | `routing` | Splitting k-bucket table with replacement caches |
//! | `database` | Signed value store with trust and capacity rules |
//! | `messages` | Wire types with bounded bincode decoding |
//! | `rpc` | The `DhtRpc` transport seam |
//! | `node` | Handle + actor: lookups, quorum stores, bootstrap, forwarding |
//! | `publisher` | Republish/expiration daemon |

pub mod config;
pub mod contact;
pub mod crypto;
pub mod database;
pub mod kuid;
pub mod messages;
pub mod node;
pub mod publisher;
pub mod routing;
pub mod rpc;

pub use config::{DhtConfig, StoreQuorum};
pub use contact::{Contact, ContactState};
pub use crypto::{Keypair, PublicKey, SignatureError};
pub use database::{KeyValue, StoreRejection, ValueFlags};
pub use kuid::{Kuid, KUID_BITS, KUID_LEN};
pub use messages::{Request, Response, MAX_VALUE_SIZE};
pub use node::{BootstrapError, BootstrapReport, DhtNode, NodeStats, StoreReport};
pub use publisher::{PassReport, Publisher};
pub use rpc::DhtRpc;
