use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::identifier::Contact;
use crate::core::routing_table::RoutingTable;
use crate::core::storage::ContentStore;

pub mod message;
pub(crate) mod lookup;
pub(crate) mod transport;

use self::message::Message;

/// Routes incoming requests to their per-code behaviour. Set up once at
/// transport construction and driven from the receive loop.
///
/// Every request inserts its origin contact into the routing table before
/// being answered; replies are correlated back to lookups elsewhere and the
/// lookup engine records those responders itself.
pub(crate) struct Handlers {
    local: Contact,
    k: usize,
    routing_table: Arc<Mutex<RoutingTable>>,
    store: Arc<Mutex<ContentStore>>,
}

impl Handlers {
    pub(crate) fn new(
        local: Contact,
        k: usize,
        routing_table: Arc<Mutex<RoutingTable>>,
        store: Arc<Mutex<ContentStore>>,
    ) -> Self {
        Self {
            local,
            k,
            routing_table,
            store,
        }
    }

    /// Handle one request; the returned message is sent back under the
    /// request's correlation id.
    pub(crate) fn dispatch(&self, message: Message) -> Option<Message> {
        self.routing_table.lock().insert(*message.origin());

        match message {
            Message::ConnectRequest { origin } => {
                tracing::debug!(peer = %origin.id.short_hex(), "connect handshake");
                Some(Message::ConnectReply { origin: self.local })
            }

            Message::NodeLookupRequest { target, .. } => {
                let nodes = self.routing_table.lock().find_closest(&target, self.k);
                Some(Message::NodeReply {
                    origin: self.local,
                    nodes,
                })
            }

            Message::StoreRequest { origin, content } => {
                tracing::debug!(
                    key = %content.key.short_hex(),
                    peer = %origin.id.short_hex(),
                    "storing content"
                );
                self.store.lock().put(content);
                None
            }

            Message::ContentLookupRequest { params, .. } => {
                let held = self.store.lock().get(&params).cloned();
                match held {
                    Some(content) => Some(Message::ContentReply {
                        origin: self.local,
                        content,
                    }),
                    // Not held here: answer with the closest nodes we know,
                    // exactly as for a node lookup of the content key.
                    None => {
                        let nodes = self.routing_table.lock().find_closest(&params.key, self.k);
                        Some(Message::NodeReply {
                            origin: self.local,
                            nodes,
                        })
                    }
                }
            }

            // Replies are routed by correlation id before dispatch; one
            // arriving here means the transport misclassified it.
            other => {
                tracing::debug!(code = ?other.code(), "dropping reply routed to the request handlers");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::storage::{Content, GetParameter};
    use crate::test_support::test_support::{id_with_first_byte, make_contact};

    fn handlers_for(k: usize) -> (Handlers, Arc<Mutex<RoutingTable>>, Arc<Mutex<ContentStore>>) {
        let local = make_contact(9, 4900, 0xAA);
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(local.id, k)));
        let store = Arc::new(Mutex::new(ContentStore::new()));
        (
            Handlers::new(local, k, routing_table.clone(), store.clone()),
            routing_table,
            store,
        )
    }

    #[test]
    fn connect_request_is_acknowledged_and_origin_learned() {
        let (handlers, routing_table, _) = handlers_for(5);
        let peer = make_contact(1, 4001, 0x01);

        let reply = handlers.dispatch(Message::ConnectRequest { origin: peer });

        assert!(matches!(reply, Some(Message::ConnectReply { origin }) if origin == handlers.local));
        assert!(routing_table.lock().contains(&peer.id));
    }

    #[test]
    fn node_lookup_returns_closest_sorted() {
        let (handlers, routing_table, _) = handlers_for(2);
        for b in [0x01u8, 0x02, 0x40] {
            routing_table.lock().insert(make_contact(b, 4000 + b as u16, b));
        }

        let peer = make_contact(7, 4007, 0x70);
        let target = id_with_first_byte(0x03);
        let reply = handlers.dispatch(Message::NodeLookupRequest {
            origin: peer,
            target,
        });

        let Some(Message::NodeReply { nodes, .. }) = reply else {
            panic!("expected NodeReply, got {reply:?}");
        };
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].id.distance(&target) <= nodes[1].id.distance(&target));
    }

    #[test]
    fn store_request_populates_the_store() {
        let (handlers, _, store) = handlers_for(5);
        let peer = make_contact(1, 4001, 0x01);
        let content = Content::new(crate::core::identifier::KadId::from_hashed(&"k"), b"v".to_vec());

        let reply = handlers.dispatch(Message::StoreRequest {
            origin: peer,
            content: content.clone(),
        });

        assert!(reply.is_none());
        assert_eq!(store.lock().get(&GetParameter::new(content.key)), Some(&content));
    }

    #[test]
    fn content_lookup_answers_with_content_or_nodes() {
        let (handlers, routing_table, store) = handlers_for(5);
        let peer = make_contact(1, 4001, 0x01);
        routing_table.lock().insert(make_contact(2, 4002, 0x02));

        let key = crate::core::identifier::KadId::from_hashed(&"held");
        let params = GetParameter::new(key);

        let miss = handlers.dispatch(Message::ContentLookupRequest {
            origin: peer,
            params: params.clone(),
        });
        assert!(matches!(miss, Some(Message::NodeReply { .. })));

        let content = Content::new(key, b"v".to_vec());
        store.lock().put(content.clone());
        let hit = handlers.dispatch(Message::ContentLookupRequest {
            origin: peer,
            params,
        });
        assert!(matches!(hit, Some(Message::ContentReply { content: c, .. }) if c == content));
    }
}
