//! # Location Stream Client
//!
//! Per-trip subscription to a real-time location channel.
//!
//! The pub/sub transport (connection, auth, channel multiplexing) is an
//! external collaborator behind [`LocationTransport`]. This client only:
//! - subscribes at most once per trip id
//! - forwards location events to the session through a bounded channel
//! - mirrors the transport's connection status
//!
//! It never reconnects on its own; that policy belongs to the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{LocationUpdate, Result, StreamConfig, TrackerError};

/// Connection status of the trip channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Event delivered by a transport subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Already-decoded location event
    Location(LocationUpdate),
    /// Undecoded JSON payload
    Raw(String),
    /// Transport-level status change
    Status(ConnectionState),
}

/// Identifies one subscriber on a channel.
pub type SubscriptionId = u64;

/// Receiving end of one transport subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Pub/sub transport seam.
///
/// `subscribe` registers interest in a channel; `unsubscribe` releases that
/// one subscriber and leaves others on the same channel untouched.
pub trait LocationTransport: Send + Sync + 'static {
    fn subscribe(&self, channel: &str) -> Result<Subscription>;
    fn unsubscribe(&self, channel: &str, id: SubscriptionId);
}

struct ActiveSubscription {
    trip_id: String,
    channel: String,
    subscription_id: SubscriptionId,
    task: JoinHandle<()>,
    updates: mpsc::Receiver<LocationUpdate>,
}

/// Subscribes to one trip's location channel at a time.
pub struct LocationStreamClient<T: LocationTransport> {
    transport: Arc<T>,
    config: StreamConfig,
    active: Option<ActiveSubscription>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: LocationTransport> LocationStreamClient<T> {
    pub fn new(transport: Arc<T>, config: StreamConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            active: None,
            state_tx,
        }
    }

    /// Subscribe to `trip_id` when `active`, otherwise make sure nothing is
    /// subscribed. Returns `true` only when a new subscription was made.
    ///
    /// Must be called from within a tokio runtime; the forwarding task is
    /// spawned on the current one.
    pub fn enable(&mut self, trip_id: &str, active: bool) -> Result<bool> {
        if !active {
            self.disable();
            return Ok(false);
        }
        if self
            .active
            .as_ref()
            .is_some_and(|sub| sub.trip_id == trip_id)
        {
            debug!("[LocationStream] Already subscribed to trip {}", trip_id);
            return Ok(false);
        }
        // Switching trips: drop the old channel first
        self.disable();

        let channel = self.config.channel_for(trip_id);
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            TrackerError::Transport {
                channel: channel.clone(),
                message: format!("no async runtime: {}", e),
            }
        })?;

        self.state_tx.send_replace(ConnectionState::Connecting);
        let subscription = match self.transport.subscribe(&channel) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("[LocationStream] Subscribe to {} failed: {}", channel, e);
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        // Fresh buffer per subscription so a previous trip's events never leak
        let (updates_tx, updates) = mpsc::channel(self.config.buffer_size.max(1));
        let task = runtime.spawn(forward_events(
            subscription.events,
            updates_tx,
            self.state_tx.clone(),
        ));
        info!("[LocationStream] Subscribed to {}", channel);
        self.active = Some(ActiveSubscription {
            trip_id: trip_id.to_string(),
            channel,
            subscription_id: subscription.id,
            task,
            updates,
        });
        Ok(true)
    }

    /// Unsubscribe. Safe to call repeatedly.
    pub fn disable(&mut self) {
        if let Some(sub) = self.active.take() {
            sub.task.abort();
            self.transport.unsubscribe(&sub.channel, sub.subscription_id);
            info!("[LocationStream] Unsubscribed from {}", sub.channel);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    pub fn subscribed_trip(&self) -> Option<&str> {
        self.active.as_ref().map(|sub| sub.trip_id.as_str())
    }

    pub fn status(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait for the next location event. Returns `None` when nothing is
    /// subscribed.
    pub async fn recv(&mut self) -> Option<LocationUpdate> {
        match self.active.as_mut() {
            Some(sub) => sub.updates.recv().await,
            None => None,
        }
    }

    /// Next buffered location event, without waiting.
    pub fn try_recv(&mut self) -> Option<LocationUpdate> {
        self.active.as_mut()?.updates.try_recv().ok()
    }
}

impl<T: LocationTransport> Drop for LocationStreamClient<T> {
    fn drop(&mut self) {
        if let Some(sub) = self.active.take() {
            sub.task.abort();
            self.transport.unsubscribe(&sub.channel, sub.subscription_id);
        }
    }
}

async fn forward_events(
    mut events: mpsc::Receiver<TransportEvent>,
    updates: mpsc::Sender<LocationUpdate>,
    state: watch::Sender<ConnectionState>,
) {
    while let Some(event) = events.recv().await {
        let update = match event {
            TransportEvent::Status(s) => {
                debug!("[LocationStream] Status -> {:?}", s);
                state.send_replace(s);
                continue;
            }
            TransportEvent::Location(update) => update,
            TransportEvent::Raw(payload) => match LocationUpdate::from_json(&payload) {
                Ok(update) => update,
                Err(e) => {
                    debug!("[LocationStream] Dropping payload: {}", e);
                    continue;
                }
            },
        };
        if updates.send(update).await.is_err() {
            break;
        }
    }
    state.send_replace(ConnectionState::Disconnected);
}

// ============================================================================
// In-process transport
// ============================================================================

/// In-process fan-out transport.
///
/// Useful for embedding the tracker next to a server that already receives
/// location pushes, and for tests.
#[derive(Default)]
pub struct LocalTransport {
    channels: Mutex<HashMap<String, Vec<(SubscriptionId, mpsc::Sender<TransportEvent>)>>>,
    next_id: AtomicU64,
    offline: Mutex<bool>,
}

const LOCAL_CHANNEL_CAPACITY: usize = 64;

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent subscribes fail, as a broker outage would.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap_or_else(|e| e.into_inner()) = offline;
    }

    /// Deliver an event to every subscriber of `channel`. Returns how many
    /// subscribers received it; full or closed subscribers are skipped.
    pub fn publish(&self, channel: &str, event: TransportEvent) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = channels.get_mut(channel) else {
            return 0;
        };
        senders.retain(|(_, tx)| !tx.is_closed());
        senders
            .iter()
            .filter(|(_, tx)| tx.try_send(event.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(channel)
            .map_or(0, |senders| senders.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }
}

impl LocationTransport for LocalTransport {
    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if *self.offline.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(TrackerError::Transport {
                channel: channel.to_string(),
                message: "transport offline".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel(LOCAL_CHANNEL_CAPACITY);
        // Local delivery is connected as soon as it is registered
        let _ = tx.try_send(TransportEvent::Status(ConnectionState::Connected));
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        Ok(Subscription { id, events })
    }

    fn unsubscribe(&self, channel: &str, id: SubscriptionId) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|(sub_id, _)| *sub_id != id);
            if senders.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireTimestamp;
    use std::time::Duration;

    fn client(transport: &Arc<LocalTransport>) -> LocationStreamClient<LocalTransport> {
        LocationStreamClient::new(Arc::clone(transport), StreamConfig::default())
    }

    async fn wait_for(client: &LocationStreamClient<LocalTransport>, want: ConnectionState) {
        let mut rx = client.watch_status();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == want))
            .await
            .expect("status timeout")
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);

        assert!(client.enable("trip-1", true).unwrap());
        assert!(!client.enable("trip-1", true).unwrap());
        assert_eq!(transport.subscriber_count("trip-location.trip-1"), 1);
        assert_eq!(client.subscribed_trip(), Some("trip-1"));
    }

    #[tokio::test]
    async fn test_inactive_does_not_subscribe() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);

        assert!(!client.enable("trip-1", false).unwrap());
        assert!(!client.is_subscribed());
        assert_eq!(transport.subscriber_count("trip-location.trip-1"), 0);
        assert_eq!(client.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_forwards_locations_and_status() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);
        client.enable("7", true).unwrap();
        wait_for(&client, ConnectionState::Connected).await;

        transport.publish(
            "trip-location.7",
            TransportEvent::Location(LocationUpdate::new(12.9, 80.1, 1_000)),
        );
        transport.publish(
            "trip-location.7",
            TransportEvent::Raw(r#"{"lat":12.91,"lng":80.11,"timestamp":2000}"#.to_string()),
        );
        transport.publish("trip-location.7", TransportEvent::Raw("garbage".to_string()));

        let first = client.recv().await.unwrap();
        assert_eq!(first.lat, Some(12.9));
        let second = client.recv().await.unwrap();
        assert_eq!(second.lat, Some(12.91));

        transport.publish(
            "trip-location.7",
            TransportEvent::Status(ConnectionState::Connecting),
        );
        wait_for(&client, ConnectionState::Connecting).await;
    }

    #[tokio::test]
    async fn test_disable_twice_is_safe() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);
        client.enable("trip-1", true).unwrap();

        client.disable();
        client.disable();
        assert!(!client.is_subscribed());
        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert_eq!(transport.subscriber_count("trip-location.trip-1"), 0);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_switching_trips_resubscribes() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);
        client.enable("a", true).unwrap();
        assert!(client.enable("b", true).unwrap());
        assert_eq!(transport.subscriber_count("trip-location.a"), 0);
        assert_eq!(transport.subscriber_count("trip-location.b"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_degrades_to_disconnected() {
        let transport = Arc::new(LocalTransport::new());
        transport.set_offline(true);
        let mut client = client(&transport);

        let err = client.enable("trip-1", true).unwrap_err();
        assert!(matches!(err, TrackerError::Transport { .. }));
        assert_eq!(client.status(), ConnectionState::Disconnected);
        assert!(!client.is_subscribed());

        // Transport back: enabling again works
        transport.set_offline(false);
        assert!(client.enable("trip-1", true).unwrap());
    }

    #[tokio::test]
    async fn test_disable_leaves_other_clients_on_same_trip() {
        let transport = Arc::new(LocalTransport::new());
        let mut a = client(&transport);
        let mut b = client(&transport);
        a.enable("9", true).unwrap();
        b.enable("9", true).unwrap();
        assert_eq!(transport.subscriber_count("trip-location.9"), 2);

        a.disable();
        assert_eq!(transport.subscriber_count("trip-location.9"), 1);
        assert!(b.is_subscribed());

        let delivered = transport.publish(
            "trip-location.9",
            TransportEvent::Location(LocationUpdate::new(12.9, 80.1, 1_000)),
        );
        assert_eq!(delivered, 1);
        assert_eq!(b.recv().await.unwrap().timestamp, Some(WireTimestamp::Millis(1_000)));

        b.disable();
        assert_eq!(transport.subscriber_count("trip-location.9"), 0);
    }

    #[test]
    fn test_enable_without_runtime_is_transport_error() {
        let transport = Arc::new(LocalTransport::new());
        let mut client = client(&transport);
        let err = client.enable("trip-1", true).unwrap_err();
        assert!(matches!(err, TrackerError::Transport { .. }));
        assert_eq!(transport.subscriber_count("trip-location.trip-1"), 0);
    }
}
