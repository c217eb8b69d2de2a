//! MQTT Broker Core
//!
//! The [`Broker`] owns the session registry and the retained store, fans
//! published messages out to every session and runs one connection task per
//! client. Cloning a `Broker` is cheap; clones share all state.

mod connection;
mod retained;

pub use connection::{Connection, ConnectionError};
pub use retained::{RetainedMessage, RetainedStore, RetainedUpdate};

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelAdapter, MqttChannel};
use crate::message::ApplicationMessage;
use crate::protocol::{Connect, ProtocolVersion, QoS, ReasonCode};
use crate::session::{
    EnqueueOutcome, Session, SessionLimits, SessionRequest, SessionStatus, SessionStore,
};

const SESSION_EXPIRY_SWEEP: Duration = Duration::from_secs(1);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_packet_size: usize,
    /// Time allowed between accepting a socket and receiving CONNECT
    pub connect_timeout: Duration,
    /// Keep alive assigned to v5 clients that ask for none (0 = leave disabled)
    pub default_keep_alive: u16,
    /// Upper bound on the keep alive v5 clients may request
    pub max_keep_alive: u16,
    /// How long to wait for PUBACK/PUBREC/PUBCOMP before resending
    pub ack_timeout: Duration,
    /// Resends before a delivery is reported as failed
    pub max_retries: u32,
    pub retain_available: bool,
    pub max_topic_alias: u16,
    pub session_limits: SessionLimits,
}

impl BrokerConfig {
    pub fn max_qos(&self) -> QoS {
        self.session_limits.max_qos
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 10_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(10),
            default_keep_alive: 0,
            max_keep_alive: 65535,
            ack_timeout: Duration::from_secs(20),
            max_retries: 3,
            retain_available: true,
            max_topic_alias: 64,
            session_limits: SessionLimits::default(),
        }
    }
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        session_present: bool,
    },
    ClientDisconnected {
        client_id: Arc<str>,
    },
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
        recipients: usize,
    },
    /// A QoS 1/2 delivery ran out of retries
    DeliveryFailed {
        client_id: Arc<str>,
        packet_id: u16,
        topic: Arc<str>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    SessionNotFound(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
        }
    }
}

impl std::error::Error for BrokerError {}

/// A session bound to one connection
#[derive(Debug, Clone)]
pub struct SessionAttachment {
    pub session: Arc<Session>,
    /// Identifies this connection to the session, see [`Session::attach`]
    pub generation: u64,
    pub session_present: bool,
    /// The broker generated the client id
    pub assigned_client_id: bool,
}

impl SessionAttachment {
    pub fn client_id(&self) -> &Arc<str> {
        self.session.client_id()
    }
}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    sessions: Arc<SessionStore>,
    retained: Arc<RetainedStore>,
    /// Live connection tasks
    connections: Arc<AtomicUsize>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionStore::new()),
            retained: Arc::new(RetainedStore::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            events,
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Bind the configured address and serve until [`Broker::shutdown`]
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut expiry_sweep = tokio::time::interval(SESSION_EXPIRY_SWEEP);
        expiry_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let channel = MqttChannel::new(stream, addr.to_string())
                            .with_max_packet_size(self.config.max_packet_size);
                        let broker = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = broker.serve(channel).await {
                                debug!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                _ = expiry_sweep.tick() => {
                    let purged = self.sessions.purge_expired(Instant::now());
                    if purged > 0 {
                        debug!(purged, "expired sessions removed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Drive one client connection to completion
    pub async fn serve<C: ChannelAdapter>(&self, channel: C) -> Result<(), ConnectionError> {
        let _slot = ConnectionSlot::acquire(&self.connections);
        Connection::new(channel, self.clone()).run().await
    }

    /// Stop the listener and every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub(crate) fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub fn session(&self, client_id: &str) -> Result<Arc<Session>, BrokerError> {
        self.sessions
            .get(client_id)
            .ok_or_else(|| BrokerError::SessionNotFound(client_id.to_string()))
    }

    pub fn session_status(&self, client_id: &str) -> Result<SessionStatus, BrokerError> {
        self.session(client_id).map(|s| s.status())
    }

    /// Create or resume the session a CONNECT asks for
    ///
    /// The previous connection for the same client id, if any, is told to
    /// close. A rejected CONNECT yields the CONNACK reason code.
    pub fn create_or_resume_session(&self, connect: &Connect) -> Result<SessionAttachment, ReasonCode> {
        if connect.client_id.is_empty() && !connect.clean_session {
            return Err(ReasonCode::ClientIdNotValid);
        }

        let will = match &connect.will {
            Some(will) => {
                if will.qos > self.config.max_qos() {
                    return Err(ReasonCode::QoSNotSupported);
                }
                if will.retain && !self.config.retain_available {
                    return Err(ReasonCode::RetainNotSupported);
                }
                Some(ApplicationMessage::from_will(will).map_err(|_| ReasonCode::TopicNameInvalid)?)
            }
            None => None,
        };

        let assigned_client_id = connect.client_id.is_empty();
        let client_id = if assigned_client_id {
            generate_client_id()
        } else {
            connect.client_id.clone()
        };

        let request = if connect.is_v5() {
            SessionRequest::v5(
                connect.clean_session,
                connect.properties.session_expiry_interval,
                will,
            )
        } else {
            SessionRequest::v3(connect.clean_session, will)
        };

        let opened = self
            .sessions
            .open(&client_id, request, &self.config.session_limits);
        if opened.replaced.is_some() {
            debug!(client_id = %client_id, "discarded previous session");
        }

        Ok(SessionAttachment {
            session: opened.session,
            generation: opened.generation,
            session_present: opened.session_present,
            assigned_client_id,
        })
    }

    /// Release a connection's hold on its session
    ///
    /// Publishes the will if asked to and the connection still owned the
    /// session. Sessions that end at disconnect are removed from the
    /// registry unless another connection resumed them meanwhile.
    pub fn disconnect_session(&self, attachment: &SessionAttachment, publish_will: bool) {
        let session = &attachment.session;
        let client_id = session.client_id().clone();

        let Some(detached) = session.detach(attachment.generation) else {
            debug!(client_id = %client_id, "session taken over, skipping teardown");
            return;
        };

        if publish_will {
            if let Some(will) = detached.will {
                debug!(client_id = %client_id, topic = will.topic(), "publishing will");
                self.publish(&will, Some(&client_id));
            }
        }

        if detached.ends_session && !self.sessions.remove_detached(session) {
            debug!(client_id = %client_id, "session resumed during teardown, keeping it");
        }
        self.emit(BrokerEvent::ClientDisconnected { client_id });
    }

    /// Fan `message` out to every session with a matching subscription
    ///
    /// Retained messages also update the retained store. Returns the number
    /// of sessions the message was queued for.
    pub fn publish(&self, message: &ApplicationMessage, sender: Option<&Arc<str>>) -> usize {
        if message.retain() && self.config.retain_available {
            self.retained.publish(message);
        }

        let mut recipients = 0;
        for session in self.sessions.sessions() {
            let Some(outcome) = session.enqueue_application_message(message, sender, false) else {
                continue;
            };
            recipients += 1;
            match outcome {
                EnqueueOutcome::Queued => {}
                EnqueueOutcome::DroppedOldest(_) => {
                    warn!(client_id = %session.client_id(), "queue full, dropped oldest message");
                }
                EnqueueOutcome::Rejected => {
                    warn!(client_id = %session.client_id(), topic = message.topic(), "queue full, rejected message");
                }
            }
        }

        trace!(topic = message.topic(), recipients, "published");
        self.emit(BrokerEvent::MessagePublished {
            topic: message.topic_arc().clone(),
            qos: message.qos(),
            retain: message.retain(),
            recipients,
        });
        recipients
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Counts a live connection for as long as it is held
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    format!("relaymq-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Subscription, Will};
    use bytes::Bytes;

    fn connect(client_id: &str, clean_session: bool) -> Connect {
        Connect {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        }
    }

    fn message(topic: &str, payload: &'static str, qos: QoS, retain: bool) -> ApplicationMessage {
        ApplicationMessage::new(topic, payload, qos, retain).unwrap()
    }

    #[test]
    fn test_sensor_fan_out() {
        let broker = Broker::default();
        let a = broker.create_or_resume_session(&connect("A", true)).unwrap();
        broker.create_or_resume_session(&connect("B", true)).unwrap();
        a.session
            .subscribe(&[Subscription::new("sensors/#", QoS::AtLeastOnce)], broker.retained());

        let sender: Arc<str> = Arc::from("B");
        let recipients = broker.publish(
            &message("sensors/temp", "21.5", QoS::AtLeastOnce, false),
            Some(&sender),
        );
        assert_eq!(recipients, 1);

        let status = broker.session_status("A").unwrap();
        assert_eq!(status.pending_messages, 1);
        let delivery = a.session.dequeue_next().unwrap();
        assert_eq!(delivery.message.topic(), "sensors/temp");
        assert_eq!(delivery.qos, QoS::AtLeastOnce);
        assert!(!delivery.is_retained);
        assert_eq!(delivery.sender_client_id.as_deref(), Some("B"));
    }

    #[test]
    fn test_retained_publish_and_delete() {
        let broker = Broker::default();
        broker.publish(&message("x/y", "v", QoS::AtLeastOnce, true), None);
        assert_eq!(broker.retained_count(), 1);

        broker.publish(&message("x/y", "", QoS::AtMostOnce, true), None);
        assert_eq!(broker.retained_count(), 0);

        let a = broker.create_or_resume_session(&connect("A", true)).unwrap();
        a.session
            .subscribe(&[Subscription::new("x/+", QoS::ExactlyOnce)], broker.retained());
        assert_eq!(a.session.pending_message_count(), 0);
    }

    #[test]
    fn test_retain_unavailable() {
        let broker = Broker::new(BrokerConfig {
            retain_available: false,
            ..Default::default()
        });
        broker.publish(&message("x", "v", QoS::AtMostOnce, true), None);
        assert_eq!(broker.retained_count(), 0);
    }

    #[test]
    fn test_session_not_found() {
        let broker = Broker::default();
        assert_eq!(
            broker.session("ghost").unwrap_err(),
            BrokerError::SessionNotFound("ghost".into())
        );
    }

    #[test]
    fn test_client_id_rules() {
        let broker = Broker::default();
        assert_eq!(
            broker.create_or_resume_session(&connect("", false)).unwrap_err(),
            ReasonCode::ClientIdNotValid
        );

        let assigned = broker.create_or_resume_session(&connect("", true)).unwrap();
        assert!(assigned.assigned_client_id);
        assert!(assigned.client_id().starts_with("relaymq-"));
        let other = broker.create_or_resume_session(&connect("", true)).unwrap();
        assert_ne!(assigned.client_id(), other.client_id());
    }

    #[test]
    fn test_persistent_session_survives_disconnect() {
        let broker = Broker::default();
        let first = broker.create_or_resume_session(&connect("p", false)).unwrap();
        first
            .session
            .subscribe(&[Subscription::new("t", QoS::AtLeastOnce)], broker.retained());
        broker.disconnect_session(&first, false);

        broker.publish(&message("t", "queued", QoS::AtLeastOnce, false), None);

        let second = broker.create_or_resume_session(&connect("p", false)).unwrap();
        assert!(second.session_present);
        assert_eq!(second.session.pending_message_count(), 1);
    }

    #[test]
    fn test_clean_session_removed_on_disconnect() {
        let broker = Broker::default();
        let attachment = broker.create_or_resume_session(&connect("c", true)).unwrap();
        assert_eq!(broker.session_count(), 1);
        broker.disconnect_session(&attachment, false);
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn test_will_published_only_when_asked() {
        let broker = Broker::default();
        let watcher = broker.create_or_resume_session(&connect("w", true)).unwrap();
        watcher
            .session
            .subscribe(&[Subscription::new("wills/#", QoS::AtMostOnce)], broker.retained());

        let mut with_will = connect("dying", true);
        with_will.will = Some(Will {
            topic: "wills/dying".into(),
            payload: Bytes::from_static(b"bye"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Default::default(),
        });

        let first = broker.create_or_resume_session(&with_will).unwrap();
        broker.disconnect_session(&first, false);
        assert_eq!(watcher.session.pending_message_count(), 0);

        let second = broker.create_or_resume_session(&with_will).unwrap();
        broker.disconnect_session(&second, true);
        assert_eq!(watcher.session.pending_message_count(), 1);
    }

    #[test]
    fn test_takeover_skips_old_teardown() {
        let broker = Broker::default();
        let first = broker.create_or_resume_session(&connect("t", false)).unwrap();
        let second = broker.create_or_resume_session(&connect("t", false)).unwrap();
        assert!(!first.session.is_current(first.generation));

        broker.disconnect_session(&first, true);
        assert!(second.session.is_connected());
        assert_eq!(broker.session_count(), 1);
    }

    fn connect_v5(client_id: &str, clean_start: bool, session_expiry: Option<u32>) -> Connect {
        let mut connect = connect(client_id, clean_start);
        connect.protocol_version = ProtocolVersion::V5;
        connect.properties.session_expiry_interval = session_expiry;
        connect
    }

    #[test]
    fn test_reconnect_survives_late_teardown() {
        let broker = Broker::default();
        let leaving = broker.create_or_resume_session(&connect("r", true)).unwrap();
        assert!(leaving.session.detach(leaving.generation).unwrap().ends_session);

        let back = broker.create_or_resume_session(&connect("r", false)).unwrap();
        assert!(!back.session_present);
        back.session
            .subscribe(&[Subscription::new("t", QoS::AtLeastOnce)], broker.retained());

        // the old connection's registry cleanup runs after the reconnect
        assert!(!broker.sessions().remove_detached(&leaving.session));
        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.publish(&message("t", "x", QoS::AtLeastOnce, false), None), 1);
        assert_eq!(back.session.pending_message_count(), 1);
    }

    #[test]
    fn test_v5_without_session_expiry_ends_at_disconnect() {
        let broker = Broker::default();
        let first = broker
            .create_or_resume_session(&connect_v5("e", false, None))
            .unwrap();
        first
            .session
            .subscribe(&[Subscription::new("t", QoS::AtLeastOnce)], broker.retained());
        broker.disconnect_session(&first, false);
        assert_eq!(broker.session_count(), 0);

        let second = broker
            .create_or_resume_session(&connect_v5("e", false, None))
            .unwrap();
        assert!(!second.session_present);
        assert_eq!(second.session.subscription_count(), 0);
    }

    #[test]
    fn test_v5_session_expiry_keeps_session() {
        let broker = Broker::default();
        let first = broker
            .create_or_resume_session(&connect_v5("e", false, Some(3600)))
            .unwrap();
        broker.disconnect_session(&first, false);
        assert_eq!(broker.session_count(), 1);

        let second = broker
            .create_or_resume_session(&connect_v5("e", false, Some(3600)))
            .unwrap();
        assert!(second.session_present);
    }
}
