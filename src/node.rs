//! # The DHT Node
//!
//! [`DhtNode`] is a cloneable handle; all mutable state (routing table,
//! database, size-estimate history) lives in a private actor task and is
//! reached through a command channel. Replies come back over oneshots, so
//! handles can be shared freely across tasks without locks.
//!
//! Network operations run on the handle side, never inside the actor.
//! Every actor command is a fast state read or mutation; an iterative
//! lookup, store fan-out, bootstrap, or republish in flight therefore never
//! delays inbound dispatch. The handle fetches lookup seeds with one quick
//! command, drives the RPCs itself, and reports confirmations and failures
//! back as it goes.
//!
//! The three network operations:
//!
//! - **Iterative lookup** — alpha-parallel rounds over a distance-sorted
//!   shortlist, converging when a round uncovers nothing closer.
//! - **Quorum store** — fan out a signed value to the k closest live
//!   contacts and report exactly who accepted.
//! - **Two-phase bootstrap** — ping a seed and look up the local id, then
//!   refresh every populated bucket and report whether anything new
//!   appeared.
//!
//! Inbound traffic enters through [`DhtNode::handle_request`]. When it
//! reveals a newly joined neighbor, replica forwarding runs on a detached
//! task so the inbound path never waits on the network either.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::crypto::Keypair;
use crate::database::{Database, KeyValue, StoreRejection, ValueFlags};
use crate::kuid::Kuid;
use crate::messages::{Request, Response, MAX_VALUE_SIZE};
use crate::routing::RoutingTable;
use crate::rpc::DhtRpc;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const SIZE_ESTIMATE_HISTORY: usize = 20;

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Joining the network failed.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("no bootstrap host responded")]
    NoBootstrapHost,
    #[error("node is shutting down")]
    ShuttingDown,
}

/// Outcome of a [`DhtNode::bootstrap`] call.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// The seed that answered phase one.
    pub seed: Contact,
    /// Whether the phase-two bucket refresh discovered contacts the table
    /// had never seen.
    pub new_contacts_found: bool,
    /// Routing-table population after both phases.
    pub contacts: usize,
}

/// Outcome of a store fan-out.
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub key: Kuid,
    /// How many contacts the value was offered to.
    pub targeted: usize,
    /// Exactly the contacts that acknowledged acceptance.
    pub accepted: Vec<Contact>,
    /// Whether `accepted` meets the configured quorum.
    pub quorum_met: bool,
}

/// Read-only snapshot of node internals for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub contacts: usize,
    pub buckets: usize,
    pub keys: usize,
    pub values: usize,
    pub estimated_network_size: u64,
}

/// Fast state reads and mutations served by the actor. Nothing here awaits
/// the network.
enum Command {
    HandleRequest {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    /// Seed candidates for a handle-side lookup.
    LookupSeeds {
        target: Kuid,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    /// A contact answered an RPC; mark it live.
    ContactConfirmed {
        contact: Contact,
    },
    ReportFailure {
        id: Kuid,
    },
    LocalPut {
        value: KeyValue,
        reply: oneshot::Sender<Result<(), StoreRejection>>,
    },
    LocalGet {
        key: Kuid,
        reply: oneshot::Sender<Vec<KeyValue>>,
    },
    MarkRepublished {
        key: Kuid,
        publisher_id: Kuid,
        num_locs: u32,
    },
    RefreshTargets {
        force: bool,
        reply: oneshot::Sender<Vec<Kuid>>,
    },
    MarkRefreshed {
        target: Kuid,
    },
    /// Offer stored replicas to a newly discovered closer custodian.
    ForwardReplicas {
        contact: Contact,
    },
    PublishPlan {
        reply: oneshot::Sender<PublishPlan>,
    },
    /// Fetch a local value if it is still present and due for republish.
    TakeDueValue {
        key: Kuid,
        publisher_id: Kuid,
        reply: oneshot::Sender<Option<KeyValue>>,
    },
    DatabaseValues {
        reply: oneshot::Sender<Vec<KeyValue>>,
    },
    Contacts {
        reply: oneshot::Sender<Vec<Contact>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
}

/// What the republish daemon should do this pass.
#[derive(Debug, Default)]
pub(crate) struct PublishPlan {
    /// Remote values dropped for exceeding their TTL.
    pub expired: usize,
    /// Local values due for republishing, identified by (key, publisher).
    pub due: Vec<(Kuid, Kuid)>,
}

/// Cloneable handle to a running DHT node.
pub struct DhtNode<R: DhtRpc> {
    command_tx: mpsc::Sender<Command>,
    local: Contact,
    keypair: Keypair,
    shutdown: CancellationToken,
    rpc: Arc<R>,
    config: DhtConfig,
}

impl<R: DhtRpc> Clone for DhtNode<R> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            local: self.local.clone(),
            keypair: self.keypair.clone(),
            shutdown: self.shutdown.clone(),
            rpc: Arc::clone(&self.rpc),
            config: self.config.clone(),
        }
    }
}

impl<R: DhtRpc> std::fmt::Debug for DhtNode<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode").field("local", &self.local).finish()
    }
}

impl<R: DhtRpc> DhtNode<R> {
    /// Bind a node to `addr` and spawn its actor. `instance_id` should be
    /// bumped on every intentional restart so peers can tell a rejoin from
    /// stale routing state.
    pub fn spawn(
        keypair: Keypair,
        addr: SocketAddr,
        instance_id: u32,
        config: DhtConfig,
        rpc: Arc<R>,
    ) -> Self {
        let local = Contact::new(keypair.id(), addr, instance_id);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let handle = Self {
            command_tx,
            local: local.clone(),
            keypair,
            shutdown: shutdown.clone(),
            rpc: Arc::clone(&rpc),
            config: config.clone(),
        };

        let actor = DhtNodeActor {
            local,
            routing: RoutingTable::new(handle.local.id, config.clone()),
            database: Database::new(config.clone()),
            size_estimates: VecDeque::new(),
            config,
            rpc,
            handle: handle.clone(),
        };
        tokio::spawn(actor.run(command_rx, shutdown));
        handle
    }

    /// Spawn the periodic bucket-refresh task. Runs until [`DhtNode::stop`].
    pub fn start_maintenance(&self) {
        let node = self.clone();
        let interval = self.config.maintenance_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                node.refresh_buckets(false).await;
            }
        });
    }

    /// Cancel the actor and every task spawned from this node.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn local_id(&self) -> Kuid {
        self.local.id
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    async fn command<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    async fn notify(&self, command: Command) {
        let _ = self.command_tx.send(command).await;
    }

    fn report_failure(&self, id: Kuid) {
        // Best effort; a full queue just loses one failure observation.
        let _ = self.command_tx.try_send(Command::ReportFailure { id });
    }

    /// Join the network through the given seed addresses.
    ///
    /// Phase one pings seeds in order until one answers, then looks up the
    /// local id to populate the nearby keyspace. Phase two refreshes every
    /// populated bucket. Replicas are forwarded to newly discovered closer
    /// custodians afterwards. Idempotent.
    pub async fn bootstrap(
        &self,
        seeds: Vec<SocketAddr>,
    ) -> Result<BootstrapReport, BootstrapError> {
        // Phase one: find a live seed.
        let mut seed_contact = None;
        for addr in seeds {
            let placeholder = Contact::new(Kuid::MIN, addr, 0);
            match timeout(self.config.rpc_timeout, self.rpc.ping(&placeholder, self.local.clone()))
                .await
            {
                Ok(Ok(contact)) if contact.id != self.local.id => {
                    self.notify(Command::ContactConfirmed { contact: contact.clone() }).await;
                    seed_contact = Some(contact);
                    break;
                }
                Ok(Ok(_)) => {
                    debug!(%addr, "bootstrap seed is ourselves, skipping");
                }
                Ok(Err(err)) => {
                    debug!(%addr, %err, "bootstrap seed did not respond");
                }
                Err(_) => {
                    debug!(%addr, "bootstrap seed timed out");
                }
            }
        }
        let seed = seed_contact.ok_or(BootstrapError::NoBootstrapHost)?;
        info!(seed = %seed.id, "bootstrap phase one: seed answered");

        // Looking up our own id fills the buckets nearest to us.
        let _ = self.iterative_lookup(self.local.id, false).await;

        // Phase two: refresh every populated bucket.
        let new_contacts_found = self.refresh_buckets(true).await;
        let contacts = self.contacts().await.len();
        info!(contacts, new_contacts_found, "bootstrap complete");
        Ok(BootstrapReport { seed, new_contacts_found, contacts })
    }

    /// Sign `payload` and store it on the k closest nodes to `key`.
    pub async fn put(&self, key: Kuid, payload: Vec<u8>) -> Result<StoreReport> {
        self.put_with_flags(key, payload, ValueFlags::NONE).await
    }

    pub async fn put_with_flags(
        &self,
        key: Kuid,
        payload: Vec<u8>,
        flags: ValueFlags,
    ) -> Result<StoreReport> {
        if payload.len() > MAX_VALUE_SIZE {
            return Err(anyhow!(
                "payload exceeds maximum value size ({} > {MAX_VALUE_SIZE})",
                payload.len()
            ));
        }
        let value = KeyValue::new_local(&self.keypair, key, payload, flags, unix_now_ms());
        let publisher_id = value.publisher_id();

        // Keep the local replica (a removal empties it instead).
        let local = self
            .command(|reply| Command::LocalPut { value: value.clone(), reply })
            .await
            .ok_or_else(|| anyhow!("node is shutting down"))?;
        if let Err(err) = local {
            return Err(anyhow!("local store rejected: {err}"));
        }

        let report = self.store_on_network(value).await;
        if report.quorum_met {
            self.notify(Command::MarkRepublished {
                key,
                publisher_id,
                num_locs: report.accepted.len() as u32,
            })
            .await;
        }
        Ok(report)
    }

    /// Publish a signed removal for this node's value under `key`.
    pub async fn remove(&self, key: Kuid) -> Result<StoreReport> {
        self.put_with_flags(key, Vec::new(), ValueFlags::NONE).await
    }

    /// Fetch every value stored under `key`, locally or on the network.
    pub async fn get(&self, key: Kuid) -> Result<Vec<KeyValue>> {
        let local = self
            .command(|reply| Command::LocalGet { key, reply })
            .await
            .ok_or_else(|| anyhow!("node is shutting down"))?;
        if !local.is_empty() {
            return Ok(local);
        }
        let (_, values) = self.iterative_lookup(key, true).await;
        // One entry per publisher; when custodians disagree the freshest
        // signed copy wins.
        let mut best: HashMap<Kuid, KeyValue> = HashMap::new();
        for value in values.into_iter().filter(|v| v.verify().is_ok()) {
            match best.entry(value.publisher_id()) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if value.created_at_ms > slot.get().created_at_ms {
                        slot.insert(value);
                    }
                }
            }
        }
        Ok(best.into_values().collect())
    }

    /// Dispatch an unsolicited inbound request. The transport calls this
    /// with every decoded [`Request`] and writes the [`Response`] back.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        self.command(|reply| Command::HandleRequest { request, reply })
            .await
            .ok_or_else(|| anyhow!("node is shutting down"))
    }

    /// Run refresh lookups for stale buckets (all populated buckets when
    /// `force`). Returns whether any previously unknown contact appeared.
    pub async fn refresh_buckets(&self, force: bool) -> bool {
        let Some(targets) = self
            .command(|reply| Command::RefreshTargets { force, reply })
            .await
        else {
            return false;
        };
        if targets.is_empty() {
            return false;
        }
        let known_before: HashSet<Kuid> = self.contacts().await.iter().map(|c| c.id).collect();

        for target in targets {
            let _ = self.iterative_lookup(target, false).await;
            self.notify(Command::MarkRefreshed { target }).await;
        }

        let mut found_new = false;
        // Newly discovered closer custodians should receive our replicas
        // without waiting for them to talk to us first.
        for contact in self.contacts().await {
            if !known_before.contains(&contact.id) {
                found_new = true;
                self.notify(Command::ForwardReplicas { contact }).await;
            }
        }
        found_new
    }

    /// All resident routing-table contacts.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.command(|reply| Command::Contacts { reply })
            .await
            .unwrap_or_default()
    }

    /// Snapshot of every stored value, the database counterpart of
    /// [`DhtNode::contacts`].
    pub async fn database_values(&self) -> Vec<KeyValue> {
        self.command(|reply| Command::DatabaseValues { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> Option<NodeStats> {
        self.command(|reply| Command::Stats { reply }).await
    }

    pub async fn estimated_network_size(&self) -> u64 {
        self.stats().await.map(|s| s.estimated_network_size).unwrap_or(1)
    }

    pub(crate) async fn publish_plan(&self) -> Option<PublishPlan> {
        self.command(|reply| Command::PublishPlan { reply }).await
    }

    /// Republish one local value. Returns `Ok(None)` when the value was
    /// removed or already refreshed since the daemon's plan was made.
    pub(crate) async fn publish_value(
        &self,
        key: Kuid,
        publisher_id: Kuid,
    ) -> Result<Option<StoreReport>> {
        let value = self
            .command(|reply| Command::TakeDueValue { key, publisher_id, reply })
            .await
            .ok_or_else(|| anyhow!("node is shutting down"))?;
        let Some(value) = value else {
            return Ok(None);
        };
        let report = self.store_on_network(value).await;
        if report.quorum_met {
            self.notify(Command::MarkRepublished {
                key,
                publisher_id,
                num_locs: report.accepted.len() as u32,
            })
            .await;
        } else {
            warn!(key = %key, accepted = report.accepted.len(), targeted = report.targeted,
                "republish fell short of quorum");
        }
        Ok(Some(report))
    }

    // ---- handle-side network operations -----------------------------------

    /// Alpha-parallel iterative lookup, driven entirely from the handle.
    /// Seeds come from one fast actor command; confirmations and failures
    /// flow back the same way, so the actor keeps serving inbound traffic
    /// throughout. Returns the closest responding contacts (at most k,
    /// ascending by distance) and, when `find_values`, any values found.
    async fn iterative_lookup(
        &self,
        target: Kuid,
        find_values: bool,
    ) -> (Vec<Contact>, Vec<KeyValue>) {
        let k = self.config.k;
        let deadline = tokio::time::Instant::now() + self.config.lookup_timeout;

        // Distance-keyed shortlist; BTreeMap keeps it sorted for free.
        let mut shortlist: BTreeMap<Kuid, Contact> = BTreeMap::new();
        let seeds = self
            .command(|reply| Command::LookupSeeds { target, reply })
            .await
            .unwrap_or_default();
        for contact in seeds {
            shortlist.insert(target.xor(&contact.id), contact);
        }
        let mut queried: HashSet<Kuid> = HashSet::new();
        let mut responded: HashSet<Kuid> = HashSet::new();
        let mut values: Vec<KeyValue> = Vec::new();
        let mut best_distance: Option<Kuid> = None;

        for round in 0..self.config.max_lookup_rounds {
            if tokio::time::Instant::now() >= deadline {
                debug!(target = %target, round, "lookup deadline reached");
                break;
            }

            let batch: Vec<Contact> = shortlist
                .values()
                .filter(|c| !queried.contains(&c.id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for contact in batch {
                queried.insert(contact.id);
                let rpc = Arc::clone(&self.rpc);
                let local = self.local.clone();
                let rpc_timeout = self.config.rpc_timeout;
                let retries = self.config.rpc_retries;
                join_set.spawn(async move {
                    let mut last_err = anyhow!("no attempt made");
                    for _ in 0..=retries {
                        let attempt = async {
                            if find_values {
                                rpc.find_value(&contact, local.clone(), target).await
                            } else {
                                rpc.find_node(&contact, local.clone(), target)
                                    .await
                                    .map(|nodes| (Vec::new(), nodes))
                            }
                        };
                        match timeout(rpc_timeout, attempt).await {
                            Ok(Ok(result)) => return (contact, Ok(result)),
                            Ok(Err(err)) => last_err = err,
                            Err(_) => last_err = anyhow!("rpc timed out"),
                        }
                    }
                    (contact, Err(last_err))
                });
            }

            let mut found_closer = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok((mut found_values, contacts)) => {
                        responded.insert(contact.id);
                        self.notify(Command::ContactConfirmed { contact: contact.clone() })
                            .await;
                        if !found_values.is_empty() {
                            values.append(&mut found_values);
                        }
                        for candidate in contacts {
                            if candidate.id == self.local.id {
                                continue;
                            }
                            let distance = target.xor(&candidate.id);
                            if best_distance.map_or(true, |best| distance < best) {
                                found_closer = true;
                            }
                            shortlist.entry(distance).or_insert(candidate);
                        }
                    }
                    Err(err) => {
                        trace!(peer = %contact.id, %err, "lookup query failed");
                        self.report_failure(contact.id);
                        shortlist.remove(&target.xor(&contact.id));
                    }
                }
            }

            if find_values && !values.is_empty() {
                break;
            }

            if let Some(distance) = shortlist.keys().next() {
                best_distance = Some(match best_distance {
                    Some(best) if best <= *distance => best,
                    _ => *distance,
                });
            }

            // Converged: nothing closer appeared and the k best are queried.
            let top_queried = shortlist
                .values()
                .take(k)
                .all(|c| queried.contains(&c.id));
            if !found_closer && top_queried {
                break;
            }
        }

        let closest: Vec<Contact> = shortlist
            .values()
            .filter(|c| responded.contains(&c.id))
            .take(k)
            .cloned()
            .collect();
        (closest, values)
    }

    /// Fan a signed value out to the k closest contacts. The report lists
    /// exactly the contacts that acknowledged acceptance.
    async fn store_on_network(&self, value: KeyValue) -> StoreReport {
        let key = value.key;
        let (targets, _) = self.iterative_lookup(key, false).await;
        let targets = if targets.is_empty() {
            // Nothing responded to the lookup; fall back to the table.
            self.command(|reply| Command::LookupSeeds { target: key, reply })
                .await
                .unwrap_or_default()
        } else {
            targets
        };

        let mut join_set = JoinSet::new();
        for contact in &targets {
            let rpc = Arc::clone(&self.rpc);
            let local = self.local.clone();
            let value = value.clone();
            let contact = contact.clone();
            let rpc_timeout = self.config.rpc_timeout;
            join_set.spawn(async move {
                match timeout(rpc_timeout, rpc.store(&contact, local, value)).await {
                    Ok(Ok(accepted)) => (contact, Ok(accepted)),
                    Ok(Err(err)) => (contact, Err(err)),
                    Err(_) => (contact, Err(anyhow!("store timed out"))),
                }
            });
        }

        let mut accepted = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok(true) => accepted.push(contact),
                Ok(false) => {
                    trace!(peer = %contact.id, key = %key, "store declined by remote");
                }
                Err(err) => {
                    trace!(peer = %contact.id, %err, "store rpc failed");
                    self.report_failure(contact.id);
                }
            }
        }

        let targeted = targets.len();
        let quorum_met = self.config.store_quorum.is_met(accepted.len(), targeted);
        // Sort the report by distance so callers see custodians in rank order.
        accepted.sort_by_key(|c| key.xor(&c.id));
        debug!(key = %key, targeted, accepted = accepted.len(), quorum_met, "store fan-out finished");
        StoreReport { key, targeted, accepted, quorum_met }
    }
}

struct DhtNodeActor<R: DhtRpc> {
    local: Contact,
    routing: RoutingTable,
    database: Database,
    size_estimates: VecDeque<u64>,
    config: DhtConfig,
    rpc: Arc<R>,
    handle: DhtNode<R>,
}

impl<R: DhtRpc> DhtNodeActor<R> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!(id = %self.local.id, addr = %self.local.addr, "dht node started");
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match command {
                Command::HandleRequest { request, reply } => {
                    let _ = reply.send(self.handle_request(request));
                }
                Command::LookupSeeds { target, reply } => {
                    let _ = reply.send(self.routing.select_closest(&target, self.config.k));
                }
                Command::ContactConfirmed { contact } => {
                    self.routing.add_contact(contact, true, unix_now_ms());
                }
                Command::ReportFailure { id } => {
                    self.routing.handle_failure(&id);
                }
                Command::LocalPut { value, reply } => {
                    let _ = reply.send(self.database.add(value, unix_now_ms()));
                }
                Command::LocalGet { key, reply } => {
                    let _ = reply.send(self.database.get(&key));
                }
                Command::MarkRepublished { key, publisher_id, num_locs } => {
                    self.database
                        .mark_republished(&key, &publisher_id, num_locs, unix_now_ms());
                }
                Command::RefreshTargets { force, reply } => {
                    let _ = reply.send(self.routing.refresh_targets(force, unix_now_ms()));
                }
                Command::MarkRefreshed { target } => {
                    self.routing.mark_refreshed(&target, unix_now_ms());
                }
                Command::ForwardReplicas { contact } => {
                    self.forward_replicas_to(contact);
                }
                Command::PublishPlan { reply } => {
                    let _ = reply.send(self.publish_plan());
                }
                Command::TakeDueValue { key, publisher_id, reply } => {
                    let _ = reply.send(self.take_due_value(key, publisher_id));
                }
                Command::DatabaseValues { reply } => {
                    let _ = reply.send(self.database.values());
                }
                Command::Contacts { reply } => {
                    let contacts = self
                        .routing
                        .buckets()
                        .iter()
                        .flat_map(|b| b.contacts().iter().cloned())
                        .collect();
                    let _ = reply.send(contacts);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(NodeStats {
                        contacts: self.routing.len(),
                        buckets: self.routing.buckets().len(),
                        keys: self.database.key_count(),
                        values: self.database.value_count(),
                        estimated_network_size: self.estimated_network_size(),
                    });
                }
            }
        }
        info!(id = %self.local.id, "dht node stopped");
    }

    // ---- inbound ----------------------------------------------------------

    fn handle_request(&mut self, request: Request) -> Response {
        let now = unix_now_ms();
        let from = request.sender().clone();
        self.observe_sender(&from, now);

        match request {
            Request::Ping { .. } => Response::Pong { from: self.local.clone() },
            Request::FindNode { target, .. } => Response::Nodes {
                from: self.local.clone(),
                contacts: self.closest_excluding(&target, &from.id),
            },
            Request::FindValue { key, .. } => Response::Value {
                from: self.local.clone(),
                values: self.database.get(&key),
                closer: self.closest_excluding(&key, &from.id),
            },
            Request::Store { mut value, .. } => {
                // Local bookkeeping is never trusted from the wire.
                value.origin_local = false;
                value.republished_at_ms = 0;
                value.num_locs = 0;
                let accepted = match self.database.add(value, now) {
                    Ok(()) => true,
                    Err(err) => {
                        // Surfaced to the sender in the ack, not an error.
                        debug!(peer = %from.id, %err, "store rejected");
                        false
                    }
                };
                Response::StoreAck { from: self.local.clone(), accepted }
            }
        }
    }

    fn closest_excluding(&self, target: &Kuid, requester: &Kuid) -> Vec<Contact> {
        let mut contacts = self.routing.select_closest(target, self.config.k + 1);
        contacts.retain(|c| &c.id != requester);
        contacts.truncate(self.config.k);
        contacts
    }

    /// Feed the routing table from inbound traffic, and kick off replica
    /// forwarding when the sender is a genuinely new arrival: an id the
    /// table has never confirmed, or a known id back with a bumped instance
    /// id. A stale rejoin (same instance id) changes nothing.
    fn observe_sender(&mut self, from: &Contact, now_ms: u64) {
        if from.id == self.local.id {
            return;
        }
        let newly_joined = match self.routing.contact(&from.id) {
            None => true,
            Some(known) => from.instance_id > known.instance_id,
        };
        let accepted = self.routing.add_contact(from.clone(), true, now_ms);
        if newly_joined && accepted {
            trace!(peer = %from.id, instance_id = from.instance_id, "new arrival observed");
            self.forward_replicas_to(from.clone());
        }
    }

    // ---- cache forwarding -------------------------------------------------

    /// Hand stored values to a newly joined node that now ranks ahead of us
    /// for their keys. Runs detached so inbound handling never blocks on
    /// the network.
    fn forward_replicas_to(&mut self, newcomer: Contact) {
        let mut outgoing: Vec<KeyValue> = Vec::new();
        for value in self.database.values() {
            let key = value.key;
            if !key.is_nearer(&newcomer.id, &self.local.id) {
                continue;
            }
            // Only forward when the newcomer lands in the key's custodian set.
            let custodians = self.routing.select_closest(&key, self.config.k);
            if custodians.iter().any(|c| c.id == newcomer.id) {
                outgoing.push(value);
            }
        }
        if outgoing.is_empty() {
            return;
        }
        debug!(peer = %newcomer.id, count = outgoing.len(), "forwarding replicas to closer node");
        let rpc = Arc::clone(&self.rpc);
        let local = self.local.clone();
        let node = self.handle.clone();
        let rpc_timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            for value in outgoing {
                let send = rpc.store(&newcomer, local.clone(), value);
                match timeout(rpc_timeout, send).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        debug!(peer = %newcomer.id, %err, "replica forward failed");
                        node.report_failure(newcomer.id);
                        break;
                    }
                    Err(_) => {
                        node.report_failure(newcomer.id);
                        break;
                    }
                }
            }
        });
    }

    // ---- republish support ------------------------------------------------

    fn publish_plan(&mut self) -> PublishPlan {
        let now = unix_now_ms();
        let mut plan = PublishPlan::default();
        for value in self.database.values() {
            if self.database.is_expired(&value, now) {
                if self.database.remove(&value.key, &value.publisher_id()).is_some() {
                    trace!(key = %value.key, "expired value removed");
                    plan.expired += 1;
                }
            } else if self.database.is_republish_due(&value, now) {
                plan.due.push((value.key, value.publisher_id()));
            }
        }
        plan
    }

    fn take_due_value(&mut self, key: Kuid, publisher_id: Kuid) -> Option<KeyValue> {
        let now = unix_now_ms();
        match self.database.peek(&key).and_then(|bag| bag.value_from(&publisher_id)) {
            Some(v) if v.origin_local && self.database.is_republish_due(v, now) => Some(v.clone()),
            _ => None,
        }
    }

    // ---- size estimation --------------------------------------------------

    /// Estimate the network population from the spacing of our nearest
    /// neighbors: with N uniformly random ids, the i-th closest sits at an
    /// expected distance of `i * 2^160 / N`, so a least-squares fit through
    /// the observed distances yields N. A bounded history smooths churn.
    fn estimated_network_size(&mut self) -> u64 {
        let neighbors = self.routing.select_closest(&self.local.id, self.config.k);
        let estimate = if neighbors.len() < 2 {
            (self.routing.len() + 1) as u64
        } else {
            let mut sum_i_sq = 0.0_f64;
            let mut sum_i_d = 0.0_f64;
            for (i, contact) in neighbors.iter().enumerate() {
                let rank = (i + 1) as f64;
                let distance = self.local.id.xor(&contact.id);
                // Leading 8 bytes as a fraction of the full keyspace.
                let top = u64::from_be_bytes(
                    distance.as_bytes()[..8].try_into().unwrap_or([0; 8]),
                );
                let frac = top as f64 / (u64::MAX as f64);
                sum_i_sq += rank * rank;
                sum_i_d += rank * frac;
            }
            if sum_i_d <= f64::EPSILON {
                (self.routing.len() + 1) as u64
            } else {
                (sum_i_sq / sum_i_d).round().max(1.0) as u64
            }
        };

        self.size_estimates.push_back(estimate);
        if self.size_estimates.len() > SIZE_ESTIMATE_HISTORY {
            self.size_estimates.pop_front();
        }
        let mut sorted: Vec<u64> = self.size_estimates.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        median.max((self.routing.len() + 1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Request;
    use async_trait::async_trait;
    use std::time::Duration;

    /// A transport where nobody answers.
    struct DeadNetwork;

    #[async_trait]
    impl DhtRpc for DeadNetwork {
        async fn ping(&self, _to: &Contact, _from: Contact) -> Result<Contact> {
            Err(anyhow!("unreachable"))
        }
        async fn find_node(
            &self,
            _to: &Contact,
            _from: Contact,
            _target: Kuid,
        ) -> Result<Vec<Contact>> {
            Err(anyhow!("unreachable"))
        }
        async fn find_value(
            &self,
            _to: &Contact,
            _from: Contact,
            _key: Kuid,
        ) -> Result<(Vec<KeyValue>, Vec<Contact>)> {
            Err(anyhow!("unreachable"))
        }
        async fn store(&self, _to: &Contact, _from: Contact, _value: KeyValue) -> Result<bool> {
            Err(anyhow!("unreachable"))
        }
    }

    /// A transport where every query hangs for a second before failing.
    struct SlowNetwork;

    #[async_trait]
    impl DhtRpc for SlowNetwork {
        async fn ping(&self, _to: &Contact, _from: Contact) -> Result<Contact> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(anyhow!("unreachable"))
        }
        async fn find_node(
            &self,
            _to: &Contact,
            _from: Contact,
            _target: Kuid,
        ) -> Result<Vec<Contact>> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(anyhow!("unreachable"))
        }
        async fn find_value(
            &self,
            _to: &Contact,
            _from: Contact,
            _key: Kuid,
        ) -> Result<(Vec<KeyValue>, Vec<Contact>)> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(anyhow!("unreachable"))
        }
        async fn store(&self, _to: &Contact, _from: Contact, _value: KeyValue) -> Result<bool> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(anyhow!("unreachable"))
        }
    }

    fn test_node(seed: u8) -> DhtNode<DeadNetwork> {
        DhtNode::spawn(
            Keypair::from_secret_bytes(&[seed; 32]),
            format!("127.0.0.1:{}", 9000 + seed as u16).parse().unwrap(),
            0,
            DhtConfig {
                rpc_timeout: Duration::from_millis(50),
                lookup_timeout: Duration::from_millis(200),
                ..DhtConfig::default()
            },
            Arc::new(DeadNetwork),
        )
    }

    fn peer(seed: u8) -> (Keypair, Contact) {
        let keypair = Keypair::from_secret_bytes(&[seed; 32]);
        let contact = Contact::new(
            keypair.id(),
            format!("127.0.0.1:{}", 10_000 + seed as u16).parse().unwrap(),
            1,
        );
        (keypair, contact)
    }

    #[tokio::test]
    async fn bootstrap_without_any_live_seed_is_a_distinguished_error() {
        let node = test_node(1);
        let result = node.bootstrap(vec!["127.0.0.1:1".parse().unwrap()]).await;
        assert!(matches!(result, Err(BootstrapError::NoBootstrapHost)));
        node.stop();
    }

    #[tokio::test]
    async fn ping_request_registers_the_sender() {
        let node = test_node(1);
        let (_, from) = peer(2);
        let response = node
            .handle_request(Request::Ping { from: from.clone() })
            .await
            .unwrap();
        assert!(matches!(response, Response::Pong { .. }));
        let contacts = node.contacts().await;
        assert!(contacts.iter().any(|c| c.id == from.id));
        node.stop();
    }

    #[tokio::test]
    async fn find_node_excludes_the_requester() {
        let node = test_node(1);
        let (_, a) = peer(2);
        let (_, b) = peer(3);
        node.handle_request(Request::Ping { from: a.clone() }).await.unwrap();
        node.handle_request(Request::Ping { from: b.clone() }).await.unwrap();

        let response = node
            .handle_request(Request::FindNode { from: a.clone(), target: a.id })
            .await
            .unwrap();
        let Response::Nodes { contacts, .. } = response else {
            panic!("wrong variant");
        };
        assert!(contacts.iter().all(|c| c.id != a.id));
        assert!(contacts.iter().any(|c| c.id == b.id));
        node.stop();
    }

    #[tokio::test]
    async fn stored_value_is_served_back_and_bad_value_is_declined() {
        let node = test_node(1);
        let (publisher, from) = peer(2);
        let key = Kuid::from_content(b"somewhere");
        let value = KeyValue::new_local(&publisher, key, b"data".to_vec(), ValueFlags::NONE, unix_now_ms());

        let response = node
            .handle_request(Request::Store { from: from.clone(), value: value.clone() })
            .await
            .unwrap();
        assert!(matches!(response, Response::StoreAck { accepted: true, .. }));

        let response = node
            .handle_request(Request::FindValue { from: from.clone(), key })
            .await
            .unwrap();
        let Response::Value { values, .. } = response else {
            panic!("wrong variant");
        };
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].payload, b"data");

        let mut forged = value;
        forged.payload = b"tampered".to_vec();
        let response = node
            .handle_request(Request::Store { from, value: forged })
            .await
            .unwrap();
        assert!(matches!(response, Response::StoreAck { accepted: false, .. }));
        node.stop();
    }

    #[tokio::test]
    async fn inbound_requests_are_answered_while_a_lookup_is_in_flight() {
        // Slow transport, generous per-query timeout: the lookup stays in
        // flight for a full second.
        let node = DhtNode::spawn(
            Keypair::from_secret_bytes(&[1; 32]),
            "127.0.0.1:9101".parse().unwrap(),
            0,
            DhtConfig {
                rpc_timeout: Duration::from_secs(2),
                lookup_timeout: Duration::from_secs(5),
                ..DhtConfig::default()
            },
            Arc::new(SlowNetwork),
        );
        // Seed the table so the lookup has someone to query.
        let (_, seed_peer) = peer(2);
        node.handle_request(Request::Ping { from: seed_peer }).await.unwrap();

        let lookup_node = node.clone();
        let key = Kuid::from_content(b"slow");
        let lookup = tokio::spawn(async move { lookup_node.get(key).await });
        // Give the lookup time to reach the network.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_, from) = peer(3);
        let answered = timeout(
            Duration::from_millis(300),
            node.handle_request(Request::Ping { from }),
        )
        .await;
        assert!(
            answered.is_ok(),
            "inbound ping must be answered while a lookup is in flight"
        );

        lookup.abort();
        node.stop();
    }

    #[tokio::test]
    async fn put_with_unreachable_network_keeps_local_copy_but_misses_quorum() {
        let node = test_node(1);
        let key = Kuid::from_content(b"lonely");
        let report = node.put(key, b"value".to_vec()).await.unwrap();
        assert!(!report.quorum_met);
        assert!(report.accepted.is_empty());

        // The local replica is still served.
        let values = node.get(key).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].payload, b"value");
        node.stop();
    }

    #[tokio::test]
    async fn database_values_exposes_the_stored_snapshot() {
        let node = test_node(1);
        assert!(node.database_values().await.is_empty());

        let key = Kuid::from_content(b"inspectable");
        node.put(key, b"visible".to_vec()).await.unwrap();

        let snapshot = node.database_values().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, key);
        assert_eq!(snapshot[0].payload, b"visible");
        assert!(snapshot[0].origin_local);
        node.stop();
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_up_front() {
        let node = test_node(1);
        let key = Kuid::from_content(b"big");
        let result = node.put(key, vec![0u8; MAX_VALUE_SIZE + 1]).await;
        assert!(result.is_err());
        node.stop();
    }

    #[tokio::test]
    async fn stats_reflect_observed_peers() {
        let node = test_node(1);
        for seed in 2..8u8 {
            let (_, from) = peer(seed);
            node.handle_request(Request::Ping { from }).await.unwrap();
        }
        let stats = node.stats().await.unwrap();
        assert_eq!(stats.contacts, 6);
        assert!(stats.estimated_network_size >= 7);
        node.stop();
    }
}
