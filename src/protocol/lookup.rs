use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::KadConfig;
use crate::core::identifier::{Contact, Distance, KadId};
use crate::core::routing_table::RoutingTable;
use crate::core::storage::{Content, GetParameter};
use crate::error::KadError;

use super::message::Message;
use super::transport::{Delivery, KadServer, SWEEP_INTERVAL};

/// Where a contact stands within one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Unasked,
    Awaiting,
    Asked,
    Failed,
}

/// What the query messages ask for. Node lookups converge on contacts;
/// content lookups additionally terminate on matching content replies.
enum LookupKind {
    Node,
    Content { params: GetParameter, want: usize },
}

#[derive(Debug)]
struct Seen {
    contact: Contact,
    status: Status,
}

/// The bounded-parallelism iterative lookup.
///
/// Contacts are kept in a map ordered by XOR distance to the target, each
/// tagged with a status. After every reply and every timeout the step
/// function tops the in-flight window back up to alpha, always asking the
/// closest unasked contacts among the k closest seen so far. The caller's
/// task suspends on the event channel; replies and timeouts are delivered
/// there by the transport.
pub(crate) struct Lookup {
    k: usize,
    alpha: usize,
    operation_timeout: Duration,
    local: Contact,
    target: KadId,
    kind: LookupKind,
    server: KadServer,
    routing_table: Arc<Mutex<RoutingTable>>,
    nodes: BTreeMap<Distance, Seen>,
    in_flight: HashMap<u32, Contact>,
    found: Vec<Content>,
    terminated: bool,
}

impl Lookup {
    fn new(
        config: &KadConfig,
        local: Contact,
        target: KadId,
        kind: LookupKind,
        server: KadServer,
        routing_table: Arc<Mutex<RoutingTable>>,
    ) -> Self {
        Self {
            k: config.k,
            alpha: config.concurrency,
            operation_timeout: config.operation_timeout,
            local,
            target,
            kind,
            server,
            routing_table,
            nodes: BTreeMap::new(),
            in_flight: HashMap::new(),
            found: Vec::new(),
            terminated: false,
        }
    }

    /// Converge on the k closest responders to `target`.
    pub(crate) async fn find_nodes(
        config: &KadConfig,
        local: Contact,
        target: KadId,
        server: KadServer,
        routing_table: Arc<Mutex<RoutingTable>>,
    ) -> Result<Vec<Contact>, KadError> {
        let lookup = Self::new(config, local, target, LookupKind::Node, server, routing_table);
        match lookup.execute().await? {
            LookupOutcome::Nodes(nodes) => Ok(nodes),
            LookupOutcome::Content(_) => unreachable!("node lookup yielded content"),
        }
    }

    /// Collect up to `want` distinct content items matching `params`,
    /// terminating as soon as enough are held.
    pub(crate) async fn find_content(
        config: &KadConfig,
        local: Contact,
        params: GetParameter,
        want: usize,
        server: KadServer,
        routing_table: Arc<Mutex<RoutingTable>>,
    ) -> Result<Vec<Content>, KadError> {
        let target = params.key;
        let lookup = Self::new(
            config,
            local,
            target,
            LookupKind::Content { params, want },
            server,
            routing_table,
        );
        match lookup.execute().await? {
            LookupOutcome::Content(found) => Ok(found),
            LookupOutcome::Nodes(_) => unreachable!("content lookup yielded nodes"),
        }
    }

    async fn execute(mut self) -> Result<LookupOutcome, KadError> {
        // The local node counts as already asked; everything we know seeds
        // the candidate set.
        self.add_unseen(self.local, Status::Asked);
        let known = self.routing_table.lock().all_contacts();
        for contact in known {
            self.add_unseen(contact, Status::Unasked);
        }

        let (tx, mut rx) = mpsc::channel(64);
        self.step(&tx).await?;

        // Two sweep ticks of slack on top of the no-progress window, so a
        // request timing out at exactly the operation timeout is observed
        // as progress instead of racing the global abort.
        let window = self.operation_timeout + 2 * SWEEP_INTERVAL;

        while !self.terminated {
            match timeout(window, rx.recv()).await {
                Err(_) => return Err(KadError::RoutingTimeout),
                Ok(None) => return Err(KadError::Shutdown),
                Ok(Some(Delivery::Reply { correlation, message })) => {
                    self.on_reply(correlation, message, &tx).await?;
                }
                Ok(Some(Delivery::Timeout { correlation })) => {
                    self.on_timeout(correlation, &tx).await?;
                }
            }
        }

        Ok(self.finish())
    }

    /// Top the in-flight window up to alpha, or mark the lookup terminated
    /// once there is nothing left to ask and nothing left in flight.
    async fn step(&mut self, tx: &mpsc::Sender<Delivery>) -> Result<(), KadError> {
        if self.in_flight.len() >= self.alpha {
            return Ok(());
        }

        let candidates = self.candidates();
        if candidates.is_empty() && self.in_flight.is_empty() {
            self.terminated = true;
            return Ok(());
        }

        for contact in candidates {
            if self.in_flight.len() >= self.alpha {
                break;
            }
            let query = self.build_query();
            let correlation = self.server.send_request(contact, query, tx.clone()).await?;
            self.set_status(&contact, Status::Awaiting);
            self.in_flight.insert(correlation, contact);
        }
        Ok(())
    }

    /// The unasked contacts among the k closest seen that have not failed,
    /// closest first.
    fn candidates(&self) -> Vec<Contact> {
        self.nodes
            .values()
            .filter(|seen| seen.status != Status::Failed)
            .take(self.k)
            .filter(|seen| seen.status == Status::Unasked)
            .map(|seen| seen.contact)
            .collect()
    }

    fn build_query(&self) -> Message {
        match &self.kind {
            LookupKind::Node => Message::NodeLookupRequest {
                origin: self.local,
                target: self.target,
            },
            LookupKind::Content { params, .. } => Message::ContentLookupRequest {
                origin: self.local,
                params: params.clone(),
            },
        }
    }

    async fn on_reply(
        &mut self,
        correlation: u32,
        message: Message,
        tx: &mpsc::Sender<Delivery>,
    ) -> Result<(), KadError> {
        let Some(responder) = self.in_flight.remove(&correlation) else {
            tracing::debug!(correlation, "reply for a request this lookup no longer tracks");
            return Ok(());
        };

        self.routing_table.lock().insert(responder);
        self.set_status(&responder, Status::Asked);

        match message {
            Message::NodeReply { nodes, .. } => {
                for contact in nodes {
                    self.add_unseen(contact, Status::Unasked);
                }
            }
            Message::ContentReply { content, .. } => {
                if let LookupKind::Content { params, want } = &self.kind {
                    if params.matches(&content) && !self.found.contains(&content) {
                        self.found.push(content);
                    }
                    if self.found.len() >= *want {
                        self.terminated = true;
                        return Ok(());
                    }
                }
            }
            other => {
                tracing::debug!(code = ?other.code(), "unexpected reply kind during lookup");
            }
        }

        self.step(tx).await
    }

    async fn on_timeout(
        &mut self,
        correlation: u32,
        tx: &mpsc::Sender<Delivery>,
    ) -> Result<(), KadError> {
        let Some(contact) = self.in_flight.remove(&correlation) else {
            tracing::debug!(correlation, "timeout for a request this lookup no longer tracks");
            return Ok(());
        };

        // Unresponsive contacts leave both the lookup and the table.
        self.set_status(&contact, Status::Failed);
        self.routing_table.lock().remove(&contact.id);

        self.step(tx).await
    }

    fn add_unseen(&mut self, contact: Contact, status: Status) {
        self.nodes
            .entry(contact.id.distance(&self.target))
            .or_insert(Seen { contact, status });
    }

    fn set_status(&mut self, contact: &Contact, status: Status) {
        if let Some(seen) = self.nodes.get_mut(&contact.id.distance(&self.target)) {
            seen.status = status;
        }
    }

    fn finish(self) -> LookupOutcome {
        match self.kind {
            LookupKind::Content { .. } => LookupOutcome::Content(self.found),
            LookupKind::Node => LookupOutcome::Nodes(
                self.nodes
                    .values()
                    .filter(|seen| seen.status == Status::Asked)
                    .take(self.k)
                    .map(|seen| seen.contact)
                    .collect(),
            ),
        }
    }
}

enum LookupOutcome {
    Nodes(Vec<Contact>),
    Content(Vec<Content>),
}
