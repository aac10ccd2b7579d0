use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::core::identifier::Contact;
use crate::error::KadError;

use super::message::{Message, MAX_MESSAGE_SIZE};
use super::Handlers;

/// How often the pending-reply table is checked for expired deadlines.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// What a pending-reply registrant receives: the correlated reply, or a
/// timeout once the deadline passes. One of the two, never both.
#[derive(Debug)]
pub(crate) enum Delivery {
    Reply { correlation: u32, message: Message },
    Timeout { correlation: u32 },
}

#[derive(Debug)]
struct PendingReply {
    to: Contact,
    deadline: Instant,
    replies: mpsc::Sender<Delivery>,
}

enum ServerCommand {
    /// Send a request under a fresh correlation id and register the reply
    /// channel with a deadline.
    Request {
        to: Contact,
        message: Message,
        replies: mpsc::Sender<Delivery>,
        done: oneshot::Sender<Result<u32, KadError>>,
    },
    /// Fire-and-forget datagram; nothing is registered.
    Datagram {
        to: Contact,
        message: Message,
        done: oneshot::Sender<Result<(), KadError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the transport task. Cheap to clone; all socket I/O and the
/// pending-reply table live on the task behind it.
#[derive(Clone)]
pub(crate) struct KadServer {
    tx: mpsc::Sender<ServerCommand>,
}

impl KadServer {
    /// Spawn the transport task over a bound socket.
    pub(crate) fn spawn(socket: UdpSocket, handlers: Handlers, operation_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = ServerActor {
            socket,
            rx,
            handlers,
            operation_timeout,
            pending: HashMap::new(),
            next_correlation: 1,
        };
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Send a request and register `replies` for the correlated answer.
    /// Returns the allocated correlation id.
    pub(crate) async fn send_request(
        &self,
        to: Contact,
        message: Message,
        replies: mpsc::Sender<Delivery>,
    ) -> Result<u32, KadError> {
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(ServerCommand::Request {
                to,
                message,
                replies,
                done,
            })
            .await
            .map_err(|_| KadError::Shutdown)?;
        outcome.await.map_err(|_| KadError::Shutdown)?
    }

    /// Send a message that expects no reply.
    pub(crate) async fn send_datagram(&self, to: Contact, message: Message) -> Result<(), KadError> {
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(ServerCommand::Datagram { to, message, done })
            .await
            .map_err(|_| KadError::Shutdown)?;
        outcome.await.map_err(|_| KadError::Shutdown)?
    }

    /// Stop the receive loop. Every outstanding pending reply is delivered a
    /// timeout first, so waiting lookups observe their requests failing.
    pub(crate) async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.tx.send(ServerCommand::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }
}

struct ServerActor {
    socket: UdpSocket,
    rx: mpsc::Receiver<ServerCommand>,
    handlers: Handlers,
    operation_timeout: Duration,
    pending: HashMap<u32, PendingReply>,
    next_correlation: u32,
}

impl ServerActor {
    async fn run(mut self) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];

        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                        Err(e) => {
                            // An unrecoverable socket fault tears the node down.
                            tracing::error!(error = %e, "receive loop failed, stopping transport");
                            self.expire_all();
                            break;
                        }
                    }
                }

                maybe_command = self.rx.recv() => {
                    match maybe_command {
                        Some(ServerCommand::Request { to, message, replies, done }) => {
                            let result = self.send_request(to, message, replies).await;
                            let _ = done.send(result);
                        }
                        Some(ServerCommand::Datagram { to, message, done }) => {
                            let correlation = self.allocate_correlation();
                            let result = self.transmit(correlation, &to, &message).await;
                            let _ = done.send(result);
                        }
                        Some(ServerCommand::Shutdown { done }) => {
                            self.expire_all();
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            self.expire_all();
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.sweep_timeouts(Instant::now());
                }
            }
        }
    }

    /// Fresh correlation id: monotonically increasing, wrapping, re-drawn
    /// while it collides with a live request.
    fn allocate_correlation(&mut self) -> u32 {
        loop {
            let id = self.next_correlation;
            self.next_correlation = self.next_correlation.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn send_request(
        &mut self,
        to: Contact,
        message: Message,
        replies: mpsc::Sender<Delivery>,
    ) -> Result<u32, KadError> {
        let correlation = self.allocate_correlation();
        self.transmit(correlation, &to, &message).await?;
        self.pending.insert(
            correlation,
            PendingReply {
                to,
                deadline: Instant::now() + self.operation_timeout,
                replies,
            },
        );
        Ok(correlation)
    }

    async fn transmit(&self, correlation: u32, to: &Contact, message: &Message) -> Result<(), KadError> {
        let bytes = message.encode(correlation)?;
        self.socket.send_to(&bytes, to.socket_addr()).await?;
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: &[u8], src: SocketAddr) {
        let (correlation, message) = match Message::decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(%src, error = %e, "dropping malformed datagram");
                return;
            }
        };

        if message.is_reply() {
            match self.pending.remove(&correlation) {
                Some(entry) => {
                    tracing::trace!(correlation, peer = %entry.to.id.short_hex(), "reply");
                    if entry.replies.try_send(Delivery::Reply { correlation, message }).is_err() {
                        tracing::debug!(correlation, "reply receiver is gone");
                    }
                }
                // A reply nobody asked for. Dropped without any state change.
                None => tracing::debug!(correlation, %src, "dropping reply with unknown correlation id"),
            }
        } else if let Some(reply) = self.handlers.dispatch(message) {
            // Answer under the request's correlation id, back to where the
            // datagram actually came from.
            match reply.encode(correlation) {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, src).await {
                        tracing::warn!(%src, error = %e, "failed to send reply");
                    }
                }
                Err(e) => tracing::warn!(%src, error = %e, "reply does not fit a datagram"),
            }
        }
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(correlation, _)| *correlation)
            .collect();

        for correlation in expired {
            if let Some(entry) = self.pending.remove(&correlation) {
                tracing::debug!(
                    correlation,
                    peer = %entry.to.id.short_hex(),
                    "request timed out"
                );
                let _ = entry.replies.try_send(Delivery::Timeout { correlation });
            }
        }
    }

    /// Deliver a timeout for everything still outstanding.
    fn expire_all(&mut self) {
        for (correlation, entry) in self.pending.drain() {
            let _ = entry.replies.try_send(Delivery::Timeout { correlation });
        }
    }
}
