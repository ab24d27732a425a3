//! Transport seam for the DHT.
//!
//! The node never talks to sockets directly; it drives a [`DhtRpc`]
//! implementation supplied at construction. Production wires this to a real
//! datagram or stream transport, tests wire it to an in-memory registry with
//! injectable failures. Timeouts and retry budgets are applied by the node
//! layer, not by implementations.

use anyhow::Result;
use async_trait::async_trait;

use crate::contact::Contact;
use crate::database::KeyValue;
use crate::kuid::Kuid;

/// The four DHT verbs, addressed to a specific remote contact.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Liveness check. A reply returns the responder's current contact,
    /// including its instance id.
    async fn ping(&self, to: &Contact, from: Contact) -> Result<Contact>;

    /// The k contacts the remote considers closest to `target`.
    async fn find_node(&self, to: &Contact, from: Contact, target: Kuid) -> Result<Vec<Contact>>;

    /// Values under `key` held by the remote, plus contacts closer to the
    /// key. Both may be non-empty at once.
    async fn find_value(
        &self,
        to: &Contact,
        from: Contact,
        key: Kuid,
    ) -> Result<(Vec<KeyValue>, Vec<Contact>)>;

    /// Offer a signed value. `Ok(false)` is an explicit rejection by the
    /// remote's database rules; `Err` is a transport failure.
    async fn store(&self, to: &Contact, from: Contact, value: KeyValue) -> Result<bool>;
}
