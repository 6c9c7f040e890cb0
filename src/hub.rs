//! Subscription graph and broadcast fanout.
//!
//! The hub maps channels to connection ids and holds the one send handle per
//! connection: a bounded queue drained by that connection's writer task.
//! Broadcasts serialize the message once and `try_send` to a snapshot of the
//! member set — a queue that is full or closed means the consumer is too
//! slow or gone, and the connection is dropped from every set rather than
//! waited on.

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;

use crate::types::ServerMessage;

pub type ConnId = u64;

/// Outbound queue depth per connection. A consumer that lets this many
/// frames pile up is evicted.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(String),
    Close { code: u16, reason: &'static str },
}

/// Send half of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    sender: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a message without blocking; `false` means the consumer is full
    /// or gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_raw(json),
            Err(error) => {
                tracing::error!(conn = self.id, ?error, "failed to serialize outbound message");
                false
            }
        }
    }

    fn send_raw(&self, json: String) -> bool {
        self.sender.try_send(OutboundFrame::Message(json)).is_ok()
    }

    /// Queue a close frame; the writer task sends it and shuts the socket.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.sender.try_send(OutboundFrame::Close { code, reason });
    }
}

/// A fanout channel: one auction's bid stream, or one vault's quote stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Auction(String),
    Vault(u64, String),
}

impl ChannelKey {
    pub fn auction(auction_id: &str) -> Self {
        ChannelKey::Auction(auction_id.to_string())
    }

    /// Vault channels are keyed by lowercase address.
    pub fn vault(chain_id: u64, vault_address: &str) -> Self {
        ChannelKey::Vault(chain_id, vault_address.to_lowercase())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Auction(id) => write!(f, "auction:{id}"),
            ChannelKey::Vault(chain_id, vault) => write!(f, "vault:{chain_id}:{vault}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionHub {
    connections: DashMap<ConnId, ConnectionHandle>,
    channels: DashMap<ChannelKey, HashSet<ConnId>>,
    observers: DashSet<ConnId>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.id(), handle);
    }

    /// Remove the connection from every channel, the observer set, and the
    /// connection table. Returns how many channels it was subscribed to.
    pub fn deregister(&self, conn: ConnId) -> usize {
        let dropped = self.unsubscribe_all(conn);
        self.connections.remove(&conn);
        dropped
    }

    pub fn connection(&self, conn: ConnId) -> Option<ConnectionHandle> {
        self.connections.get(&conn).map(|handle| handle.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Idempotent; returns `true` on a new membership.
    pub fn subscribe(&self, channel: ChannelKey, conn: ConnId) -> bool {
        self.channels.entry(channel).or_default().insert(conn)
    }

    pub fn unsubscribe(&self, channel: &ChannelKey, conn: ConnId) -> bool {
        let Some(mut members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            drop(members);
            self.channels.remove_if(channel, |_, members| members.is_empty());
        }
        removed
    }

    pub fn unsubscribe_all(&self, conn: ConnId) -> usize {
        let mut dropped = 0;
        for mut entry in self.channels.iter_mut() {
            if entry.value_mut().remove(&conn) {
                dropped += 1;
            }
        }
        self.channels.retain(|_, members| !members.is_empty());
        self.observers.remove(&conn);
        dropped
    }

    pub fn observe(&self, conn: ConnId) -> bool {
        self.observers.insert(conn)
    }

    pub fn unobserve(&self, conn: ConnId) -> bool {
        self.observers.remove(&conn).is_some()
    }

    pub fn is_subscribed(&self, channel: &ChannelKey, conn: ConnId) -> bool {
        self.channels
            .get(channel)
            .map(|members| members.contains(&conn))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.channels.get(channel).map(|members| members.len()).unwrap_or(0)
    }

    /// Fan a message out to a channel. Serialized once; members whose queue
    /// rejects the frame are evicted from every set before this returns.
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, channel: &ChannelKey, message: &ServerMessage) -> usize {
        let members: Vec<ConnId> = match self.channels.get(channel) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        self.deliver(&members, message)
    }

    /// Fan a message out to every connected client.
    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        let members: Vec<ConnId> = self.connections.iter().map(|entry| *entry.key()).collect();
        self.deliver(&members, message)
    }

    /// Fan a message out to the vault-observer set.
    pub fn broadcast_observers(&self, message: &ServerMessage) -> usize {
        let members: Vec<ConnId> = self.observers.iter().map(|id| *id).collect();
        self.deliver(&members, message)
    }

    /// Fan a message out to the union of a channel's subscribers and the
    /// observer set. A connection in both gets the message exactly once.
    pub fn broadcast_with_observers(&self, channel: &ChannelKey, message: &ServerMessage) -> usize {
        let mut members: HashSet<ConnId> = match self.channels.get(channel) {
            Some(members) => members.iter().copied().collect(),
            None => HashSet::new(),
        };
        members.extend(self.observers.iter().map(|id| *id));
        let members: Vec<ConnId> = members.into_iter().collect();
        self.deliver(&members, message)
    }

    fn deliver(&self, members: &[ConnId], message: &ServerMessage) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(?error, "failed to serialize broadcast");
                return 0;
            }
        };
        let mut delivered = 0;
        let mut evicted: Vec<ConnId> = Vec::new();
        for conn in members {
            let sent = self
                .connections
                .get(conn)
                .map(|handle| handle.send_raw(json.clone()))
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                evicted.push(*conn);
            }
        }
        for conn in evicted {
            tracing::debug!(conn, "evicting unwritable connection from fanout");
            self.deregister(conn);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmptyPayload;

    fn handle(id: ConnId) -> (ConnectionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (ConnectionHandle::new(id, tx), rx)
    }

    fn pong() -> ServerMessage {
        ServerMessage::Pong { payload: EmptyPayload {} }
    }

    #[test]
    fn subscribe_is_idempotent_and_symmetric() {
        let hub = SubscriptionHub::new();
        let (h, _rx) = handle(1);
        hub.register(h);
        let channel = ChannelKey::auction("a-1");

        assert!(hub.subscribe(channel.clone(), 1));
        assert!(!hub.subscribe(channel.clone(), 1));
        assert_eq!(hub.subscriber_count(&channel), 1);

        assert!(hub.unsubscribe(&channel, 1));
        assert!(!hub.unsubscribe(&channel, 1));
        assert_eq!(hub.subscriber_count(&channel), 0);
    }

    #[test]
    fn broadcast_reaches_each_member_once_in_order() {
        let hub = SubscriptionHub::new();
        let (ha, mut rx_a) = handle(1);
        let (hb, mut rx_b) = handle(2);
        hub.register(ha);
        hub.register(hb);
        let channel = ChannelKey::auction("a-1");
        hub.subscribe(channel.clone(), 1);
        hub.subscribe(channel.clone(), 2);

        assert_eq!(hub.broadcast(&channel, &pong()), 2);
        assert_eq!(hub.broadcast(&channel, &pong()), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = 0;
            while let Ok(frame) = rx.try_recv() {
                assert!(matches!(frame, OutboundFrame::Message(_)));
                seen += 1;
            }
            assert_eq!(seen, 2);
        }
    }

    #[test]
    fn slow_consumer_is_evicted_after_one_failed_attempt() {
        let hub = SubscriptionHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.register(ConnectionHandle::new(1, tx));
        let (healthy, mut rx_healthy) = handle(2);
        hub.register(healthy);
        let channel = ChannelKey::auction("a-1");
        hub.subscribe(channel.clone(), 1);
        hub.subscribe(channel.clone(), 2);

        // First broadcast fills conn 1's single-slot queue.
        assert_eq!(hub.broadcast(&channel, &pong()), 2);
        // Second broadcast finds it unwritable and evicts it.
        assert_eq!(hub.broadcast(&channel, &pong()), 1);
        assert!(!hub.is_subscribed(&channel, 1));
        assert!(hub.connection(1).is_none());
        // The healthy member keeps receiving.
        assert_eq!(hub.broadcast(&channel, &pong()), 1);
        assert!(rx_healthy.try_recv().is_ok());
    }

    #[test]
    fn closed_consumer_leaves_every_set() {
        let hub = SubscriptionHub::new();
        let (h, rx) = handle(1);
        hub.register(h);
        hub.subscribe(ChannelKey::auction("a-1"), 1);
        hub.subscribe(ChannelKey::vault(8453, "0xAbCd"), 1);
        hub.observe(1);
        drop(rx);

        assert_eq!(hub.broadcast(&ChannelKey::auction("a-1"), &pong()), 0);
        assert!(!hub.is_subscribed(&ChannelKey::auction("a-1"), 1));
        assert!(!hub.is_subscribed(&ChannelKey::vault(8453, "0xabcd"), 1));
        assert_eq!(hub.broadcast_observers(&pong()), 0);
        assert!(hub.connection(1).is_none());
    }

    #[test]
    fn deregister_reports_dropped_channels() {
        let hub = SubscriptionHub::new();
        let (h, _rx) = handle(7);
        hub.register(h);
        hub.subscribe(ChannelKey::auction("a-1"), 7);
        hub.subscribe(ChannelKey::auction("a-2"), 7);
        hub.observe(7);

        assert_eq!(hub.deregister(7), 2);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.broadcast_observers(&pong()), 0);
    }

    #[test]
    fn vault_channel_key_normalizes_case() {
        assert_eq!(
            ChannelKey::vault(8453, "0xAbCdEf0000000000000000000000000000000000"),
            ChannelKey::vault(8453, "0xabcdef0000000000000000000000000000000000")
        );
        assert_eq!(
            ChannelKey::vault(8453, "0xabcd").to_string(),
            "vault:8453:0xabcd"
        );
    }
}
