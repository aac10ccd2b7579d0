use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::config::KadConfig;
use crate::core::identifier::{Contact, KadId};
use crate::core::routing_table::RoutingTable;
use crate::core::storage::{Content, ContentStore, GetParameter};
use crate::error::KadError;
use crate::protocol::lookup::Lookup;
use crate::protocol::message::Message;
use crate::protocol::transport::{Delivery, KadServer, SWEEP_INTERVAL};
use crate::protocol::Handlers;
use crate::snapshot;

/// A Kademlia node: one UDP endpoint participating in the overlay.
///
/// Construction binds the socket and spawns the transport task plus a
/// background task that refreshes the overlay every restore interval.
/// Operations run on the caller's task and converge through the lookup
/// engine. `shutdown` stops both tasks and, when configured, writes the
/// snapshot files for [`Kad::load_from_file`] to restore from.
pub struct Kad {
    inner: Arc<KadInner>,
    refresher: tokio::task::JoinHandle<()>,
}

pub(crate) struct KadInner {
    pub(crate) config: KadConfig,
    pub(crate) owner: String,
    pub(crate) local: Contact,
    pub(crate) routing_table: Arc<Mutex<RoutingTable>>,
    pub(crate) store: Arc<Mutex<ContentStore>>,
    server: KadServer,
}

impl Kad {
    /// Start a node under `owner` with the given identifier, bound to
    /// `address:port`. Port 0 picks an ephemeral port; the advertised
    /// contact carries whatever port was actually bound.
    pub async fn new(
        owner: &str,
        id: KadId,
        address: Ipv4Addr,
        port: u16,
        config: KadConfig,
    ) -> Result<Self, KadError> {
        let socket = UdpSocket::bind((address, port)).await?;
        let port = socket.local_addr()?.port();
        let local = Contact::new(id, address, port);

        let routing_table = Arc::new(Mutex::new(RoutingTable::new(id, config.k)));
        let store = Arc::new(Mutex::new(ContentStore::new()));

        let handlers = Handlers::new(local, config.k, routing_table.clone(), store.clone());
        let server = KadServer::spawn(socket, handlers, config.operation_timeout);

        let inner = Arc::new(KadInner {
            config,
            owner: owner.to_owned(),
            local,
            routing_table,
            store,
            server,
        });

        tracing::info!(
            owner,
            id = %local.id.short_hex(),
            port,
            "node started"
        );

        let refresher = tokio::spawn({
            let inner = inner.clone();
            async move {
                let mut ticker = interval(inner.config.restore_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await; // the first tick completes immediately
                loop {
                    ticker.tick().await;
                    if let Err(e) = inner.refresh().await {
                        tracing::warn!(error = %e, "periodic refresh failed");
                    }
                }
            }
        });

        Ok(Self { inner, refresher })
    }

    /// Restore a node from the snapshot files written at shutdown.
    pub async fn load_from_file(owner: &str, config: KadConfig) -> Result<Self, KadError> {
        snapshot::load(owner, config).await
    }

    /// Join the overlay through a known peer: handshake, insert it, look up
    /// our own id to populate the nearby buckets, then refresh the rest.
    pub async fn connect(&self, bootstrap: Contact) -> Result<(), KadError> {
        self.inner.connect(bootstrap).await
    }

    /// Place `content` on the k closest nodes to its key. Returns how many
    /// nodes it was stored on (the local node included when it qualifies).
    pub async fn put(&self, content: Content) -> Result<usize, KadError> {
        self.inner.put(content).await
    }

    /// Fetch content: the local store first, then a content lookup
    /// collecting up to `n_req` distinct items from the network.
    pub async fn get(&self, param: GetParameter, n_req: usize) -> Result<Vec<Content>, KadError> {
        self.inner.get(param, n_req).await
    }

    /// The k closest reachable contacts to `target`.
    pub async fn find_node(&self, target: KadId) -> Result<Vec<Contact>, KadError> {
        self.inner.node_lookup(target).await
    }

    /// Re-look-up every bucket and re-place local content.
    pub async fn refresh(&self) -> Result<(), KadError> {
        self.inner.refresh().await
    }

    /// Leave cleanly: stop the refresher and the transport (outstanding
    /// requests observe timeouts), then save state when configured.
    pub async fn shutdown(&self) -> Result<(), KadError> {
        self.refresher.abort();
        self.inner.server.shutdown().await;
        if self.inner.config.save_state_on_shutdown {
            snapshot::save(&self.inner)?;
        }
        tracing::info!(owner = %self.inner.owner, "node stopped");
        Ok(())
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn local_contact(&self) -> Contact {
        self.inner.local
    }

    pub fn port(&self) -> u16 {
        self.inner.local.port
    }

    /// Seed the routing table directly, without any wire exchange.
    pub fn insert_contact(&self, contact: Contact) {
        self.inner.routing_table.lock().insert(contact);
    }

    /// Everything currently in the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.routing_table.lock().all_contacts()
    }

    /// Everything currently in the local content store.
    pub fn contents(&self) -> Vec<Content> {
        self.inner.store.lock().all()
    }

    pub(crate) fn store_local(&self, content: Content) {
        self.inner.store.lock().put(content);
    }
}

impl KadInner {
    async fn connect(&self, bootstrap: Contact) -> Result<(), KadError> {
        // Handshake first, so a dead bootstrap fails fast instead of
        // lingering in the table.
        let (tx, mut rx) = mpsc::channel(8);
        self.server
            .send_request(
                bootstrap,
                Message::ConnectRequest { origin: self.local },
                tx,
            )
            .await?;

        let window = self.config.operation_timeout + 2 * SWEEP_INTERVAL;
        match timeout(window, rx.recv()).await {
            Ok(Some(Delivery::Reply { message: Message::ConnectReply { .. }, .. })) => {}
            Ok(Some(Delivery::Reply { .. })) | Ok(Some(Delivery::Timeout { .. })) | Err(_) => {
                return Err(KadError::RoutingTimeout);
            }
            Ok(None) => return Err(KadError::Shutdown),
        }

        self.routing_table.lock().insert(bootstrap);

        // Self-lookup populates the buckets nearest to us, per the join
        // procedure; a refresh then touches the rest of the id space.
        let _ = self.node_lookup(self.local.id).await?;
        self.refresh().await
    }

    pub(crate) async fn node_lookup(&self, target: KadId) -> Result<Vec<Contact>, KadError> {
        Lookup::find_nodes(
            &self.config,
            self.local,
            target,
            self.server.clone(),
            self.routing_table.clone(),
        )
        .await
    }

    async fn put(&self, content: Content) -> Result<usize, KadError> {
        let responders = self.node_lookup(content.key).await?;

        let mut stored = 0;
        for contact in responders {
            if contact.id == self.local.id {
                self.store.lock().put(content.clone());
                stored += 1;
                continue;
            }
            let request = Message::StoreRequest {
                origin: self.local,
                content: content.clone(),
            };
            match self.server.send_datagram(contact, request).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    tracing::warn!(
                        peer = %contact.id.short_hex(),
                        error = %e,
                        "store dispatch failed"
                    );
                }
            }
        }

        tracing::debug!(key = %content.key.short_hex(), stored, "content placed");
        Ok(stored)
    }

    async fn get(&self, param: GetParameter, n_req: usize) -> Result<Vec<Content>, KadError> {
        if let Some(content) = self.store.lock().get(&param) {
            return Ok(vec![content.clone()]);
        }

        let found = Lookup::find_content(
            &self.config,
            self.local,
            param,
            n_req.max(1),
            self.server.clone(),
            self.routing_table.clone(),
        )
        .await?;

        if found.is_empty() {
            Err(KadError::ContentNotFound)
        } else {
            Ok(found)
        }
    }

    pub(crate) async fn refresh(&self) -> Result<(), KadError> {
        // One lookup per bucket distance; failures are logged, not fatal.
        let targets = self.routing_table.lock().refresh_targets();
        let lookups = targets.into_iter().map(|target| self.node_lookup(target));
        for result in join_all(lookups).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "bucket refresh lookup failed");
            }
        }

        // Re-place everything we hold so it survives churn.
        let params = self.store.lock().keys();
        for param in params {
            let held = self.store.lock().get(&param).cloned();
            if let Some(content) = held {
                if let Err(e) = self.put(content).await {
                    tracing::warn!(
                        key = %param.key.short_hex(),
                        error = %e,
                        "content refresh failed"
                    );
                }
            }
        }
        Ok(())
    }
}
