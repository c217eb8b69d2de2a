//! Client sessions
//!
//! A [`Session`] outlives the network connection that created it when the
//! client asked for a persistent session. It owns the client's
//! subscriptions, the queue of messages waiting to be sent, the in-flight
//! QoS 1/2 handshakes in both directions and the will message.
//!
//! All mutable state sits behind one lock per session, so publishers on
//! other connections can enqueue while the owning connection task sends
//! and acknowledges. Sessions never lock each other.

mod inflight;
mod queue;
mod subscriptions;

pub use inflight::{
    AckOutcome, FailedDelivery, InflightWindow, OutboundState, PacketIdAllocator, Retransmissions,
};
pub use queue::{ApplicationMessageQueue, EnqueueOutcome, OverflowPolicy, QueuedDelivery};
pub use subscriptions::{SubscriptionEntry, SubscriptionMatch, SubscriptionSet};

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::broker::RetainedStore;
use crate::message::ApplicationMessage;
use crate::protocol::{
    Packet, QoS, ReasonCode, RetainHandling, Subscription, SubscriptionOptions,
};
use crate::topic::{matches, validate_topic_filter};

/// Per-session resource limits
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Outbound QoS 1/2 deliveries awaiting acknowledgement
    pub max_inflight: usize,
    pub max_queued_messages: usize,
    pub overflow_policy: OverflowPolicy,
    /// Inbound QoS 2 messages awaiting PUBREL
    pub max_awaiting_rel: usize,
    /// Granted subscription QoS is capped to this
    pub max_qos: QoS,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_queued_messages: 1000,
            overflow_policy: OverflowPolicy::DropOldest,
            max_awaiting_rel: 100,
            max_qos: QoS::ExactlyOnce,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub client_id: Arc<str>,
    pub created_at: SystemTime,
    pub connected: bool,
    pub clean_session: bool,
    pub subscriptions: usize,
    pub pending_messages: usize,
    pub inflight_messages: usize,
    pub dropped_messages: u64,
    pub failed_deliveries: u64,
}

/// What a connection leaves behind when it detaches
#[derive(Debug)]
pub struct Detached {
    pub will: Option<ApplicationMessage>,
    /// The session ends with this connection and should leave the registry
    pub ends_session: bool,
}

/// How long a session outlives its connection
///
/// `None` keeps it until a clean start discards it.
pub type SessionExpiry = Option<Duration>;

/// What a CONNECT asks of the session it lands on
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Discard any stored session before attaching
    pub clean_start: bool,
    pub expiry: SessionExpiry,
    pub will: Option<ApplicationMessage>,
}

impl SessionRequest {
    /// MQTT 3.x semantics: a clean session also ends at disconnect
    pub fn v3(clean_session: bool, will: Option<ApplicationMessage>) -> Self {
        Self {
            clean_start: clean_session,
            expiry: if clean_session { Some(Duration::ZERO) } else { None },
            will,
        }
    }

    /// MQTT 5 semantics: absent or zero Session Expiry Interval ends the
    /// session at disconnect, `u32::MAX` never expires
    pub fn v5(clean_start: bool, expiry_interval: Option<u32>, will: Option<ApplicationMessage>) -> Self {
        let expiry = match expiry_interval.unwrap_or(0) {
            u32::MAX => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        };
        Self {
            clean_start,
            expiry,
            will,
        }
    }
}

struct SessionState {
    expiry: SessionExpiry,
    disconnected_at: Option<Instant>,
    connected: bool,
    /// Bumped on every attach; a connection holding an older value has
    /// been taken over
    generation: u64,
    will: Option<ApplicationMessage>,
    subscriptions: SubscriptionSet,
    queue: ApplicationMessageQueue,
    packet_ids: PacketIdAllocator,
    inflight: InflightWindow,
    dropped_messages: u64,
    failed_deliveries: u64,
}

pub struct Session {
    client_id: Arc<str>,
    created_at: SystemTime,
    limits: SessionLimits,
    state: Mutex<SessionState>,
    wakeup: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(client_id: impl Into<Arc<str>>, clean_session: bool, limits: SessionLimits) -> Self {
        let queue = ApplicationMessageQueue::new(limits.max_queued_messages, limits.overflow_policy);
        Self {
            client_id: client_id.into(),
            created_at: SystemTime::now(),
            state: Mutex::new(SessionState {
                expiry: if clean_session { Some(Duration::ZERO) } else { None },
                disconnected_at: None,
                connected: false,
                generation: 0,
                will: None,
                subscriptions: SubscriptionSet::new(),
                queue,
                packet_ids: PacketIdAllocator::new(),
                inflight: InflightWindow::new(),
                dropped_messages: 0,
                failed_deliveries: 0,
            }),
            limits,
            wakeup: Notify::new(),
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// The session ends when its connection does
    pub fn clean_session(&self) -> bool {
        self.state.lock().expiry == Some(Duration::ZERO)
    }

    pub fn expiry(&self) -> SessionExpiry {
        self.state.lock().expiry
    }

    /// Disconnected for longer than the session expiry interval
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match (state.connected, state.expiry, state.disconnected_at) {
            (false, Some(expiry), Some(at)) => now.saturating_duration_since(at) >= expiry,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    // --- connection lifecycle ---

    /// Bind a new connection to this session
    ///
    /// Any connection attached earlier stops being current and is woken so
    /// it can close. Returns the generation the new connection must present
    /// to [`Session::detach`].
    pub fn attach(&self, expiry: SessionExpiry, will: Option<ApplicationMessage>) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connected = true;
            state.disconnected_at = None;
            state.expiry = expiry;
            state.will = will;
            state.generation
        };
        self.wakeup.notify_waiters();
        generation
    }

    /// Wake and invalidate the current connection without attaching a new one
    pub fn displace(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connected = false;
            state.disconnected_at = Some(Instant::now());
        }
        self.wakeup.notify_waiters();
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Mark the session disconnected if `generation` still owns it
    ///
    /// Returns `None` when another connection has taken the session over.
    pub fn detach(&self, generation: u64) -> Option<Detached> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return None;
        }
        state.connected = false;
        state.disconnected_at = Some(Instant::now());
        Some(Detached {
            will: state.will.take(),
            ends_session: state.expiry == Some(Duration::ZERO),
        })
    }

    pub fn take_will(&self) -> Option<ApplicationMessage> {
        self.state.lock().will.take()
    }

    /// Resolves when there may be something new to send, or the session
    /// was taken over
    pub fn notified(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    // --- subscriptions ---

    /// Add or replace subscriptions, returning one reason code per filter
    ///
    /// Retained messages matching the new filters are queued once per
    /// topic at the effective QoS, subject to each filter's retain
    /// handling.
    pub fn subscribe(&self, subscriptions: &[Subscription], retained: &RetainedStore) -> Vec<ReasonCode> {
        self.subscribe_with_identifier(subscriptions, None, retained)
    }

    pub fn subscribe_with_identifier(
        &self,
        subscriptions: &[Subscription],
        identifier: Option<u32>,
        retained: &RetainedStore,
    ) -> Vec<ReasonCode> {
        let mut codes = Vec::with_capacity(subscriptions.len());
        let mut replay: Vec<(&str, QoS)> = Vec::new();
        let mut state = self.state.lock();

        for sub in subscriptions {
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!(client_id = %self.client_id, filter = %sub.filter, "rejected filter: {}", reason);
                codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }

            let granted = sub.options.qos.min(self.limits.max_qos);
            let options = SubscriptionOptions {
                qos: granted,
                ..sub.options
            };
            let is_new = state
                .subscriptions
                .insert(&sub.filter, SubscriptionEntry { options, identifier });

            let send_retained = match options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendAtSubscribeIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
            if send_retained {
                replay.push((sub.filter.as_str(), granted));
            }
            codes.push(ReasonCode::granted(granted));
        }

        if !replay.is_empty() {
            let filters: Vec<&str> = replay.iter().map(|(f, _)| *f).collect();
            for message in retained.get(&filters) {
                let Some(granted) = replay
                    .iter()
                    .filter(|(f, _)| matches(f, message.topic()))
                    .map(|(_, q)| *q)
                    .max()
                else {
                    continue;
                };
                let qos = message.qos().min(granted);
                let mut delivery = QueuedDelivery::new(message, None, qos, true);
                delivery.subscription_identifiers = identifier.into_iter().collect();
                self.push(&mut state, delivery);
            }
        }

        drop(state);
        self.wakeup.notify_one();
        codes
    }

    pub fn unsubscribe(&self, filters: &[String]) -> Vec<ReasonCode> {
        let mut state = self.state.lock();
        filters
            .iter()
            .map(|filter| {
                if validate_topic_filter(filter).is_err() {
                    ReasonCode::TopicFilterInvalid
                } else if state.subscriptions.remove(filter) {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect()
    }

    pub fn subscription(&self, filter: &str) -> Option<SubscriptionEntry> {
        self.state.lock().subscriptions.get(filter).copied()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    // --- outbound delivery ---

    /// Queue `message` if any subscription matches its topic
    ///
    /// Returns `None` when nothing matched. `is_retained` marks deliveries
    /// that must carry the RETAIN flag regardless of subscription options.
    pub fn enqueue_application_message(
        &self,
        message: &ApplicationMessage,
        sender: Option<&Arc<str>>,
        is_retained: bool,
    ) -> Option<EnqueueOutcome> {
        let from_self = sender.is_some_and(|s| **s == *self.client_id);
        let mut state = self.state.lock();
        let matched = state.subscriptions.match_topic(message.topic(), from_self)?;

        let qos = message.qos().min(matched.qos);
        let retain = is_retained || (matched.retain_as_published && message.retain());
        let mut delivery = QueuedDelivery::new(message.clone(), sender.cloned(), qos, retain);
        delivery.subscription_identifiers = matched.identifiers;

        let outcome = self.push(&mut state, delivery);
        drop(state);
        self.wakeup.notify_one();
        Some(outcome)
    }

    fn push(&self, state: &mut SessionState, delivery: QueuedDelivery) -> EnqueueOutcome {
        let outcome = state.queue.enqueue(delivery);
        if outcome.is_overflow() {
            state.dropped_messages += 1;
            debug!(
                client_id = %self.client_id,
                policy = ?self.limits.overflow_policy,
                "message queue full, dropped a message"
            );
        }
        outcome
    }

    /// Take the next queued delivery that can be sent now
    ///
    /// QoS 1/2 deliveries get a fresh packet id and enter the in-flight
    /// window. Returns `None` when the queue is empty or the head is
    /// blocked on a full window; order is never skipped around.
    pub fn dequeue_next(&self) -> Option<QueuedDelivery> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        loop {
            let mut delivery = state.queue.dequeue_next()?;
            if delivery.is_expired(now) {
                trace!(client_id = %self.client_id, topic = delivery.message.topic(), "dropping expired message");
                state.dropped_messages += 1;
                continue;
            }
            if delivery.qos == QoS::AtMostOnce {
                return Some(delivery);
            }
            if state.inflight.outbound_len() >= self.limits.max_inflight {
                state.queue.requeue_front(delivery);
                return None;
            }

            let inflight = &state.inflight;
            let Some(packet_id) = state.packet_ids.allocate(|id| inflight.contains(id)) else {
                state.queue.requeue_front(delivery);
                return None;
            };
            delivery.packet_id = Some(packet_id);
            state.inflight.track(delivery.clone(), now);
            return Some(delivery);
        }
    }

    /// Every PUBLISH that can be sent right now
    pub fn drain_ready(&self) -> Vec<Packet> {
        std::iter::from_fn(|| self.dequeue_next())
            .map(|d| Packet::Publish(d.to_publish()))
            .collect()
    }

    pub fn acknowledge_puback(&self, packet_id: u16) -> AckOutcome {
        let outcome = self.state.lock().inflight.puback(packet_id);
        self.after_ack(outcome)
    }

    pub fn acknowledge_pubrec(&self, packet_id: u16, accepted: bool) -> AckOutcome {
        let outcome = self
            .state
            .lock()
            .inflight
            .pubrec(packet_id, accepted, Instant::now());
        self.after_ack(outcome)
    }

    pub fn acknowledge_pubcomp(&self, packet_id: u16) -> AckOutcome {
        let outcome = self.state.lock().inflight.pubcomp(packet_id);
        self.after_ack(outcome)
    }

    fn after_ack(&self, outcome: AckOutcome) -> AckOutcome {
        if outcome == AckOutcome::Completed {
            // a window slot opened up
            self.wakeup.notify_one();
        }
        outcome
    }

    /// Resend or give up on unacknowledged deliveries
    pub fn collect_retransmissions(
        &self,
        now: Instant,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> Retransmissions {
        let out = {
            let mut state = self.state.lock();
            let out = state
                .inflight
                .collect_retransmissions(now, ack_timeout, max_retries);
            state.failed_deliveries += out.failed.len() as u64;
            out
        };
        if !out.failed.is_empty() {
            self.wakeup.notify_one();
        }
        out
    }

    /// Packets to resend when a persistent session is resumed
    pub fn resume_inflight(&self) -> Vec<Packet> {
        self.state.lock().inflight.resend_all(Instant::now())
    }

    // --- inbound QoS 2 ---

    /// Hold an inbound QoS 2 message until PUBREL
    ///
    /// `Ok(false)` means the packet id is already awaiting release and the
    /// message is a retransmission.
    pub fn receive_qos2(&self, packet_id: u16, message: ApplicationMessage) -> Result<bool, ReasonCode> {
        let mut state = self.state.lock();
        if state.inflight.awaiting_release(packet_id) {
            return Ok(false);
        }
        if state.inflight.inbound_len() >= self.limits.max_awaiting_rel {
            return Err(ReasonCode::ReceiveMaxExceeded);
        }
        Ok(state.inflight.store_inbound(packet_id, message))
    }

    pub fn release_qos2(&self, packet_id: u16) -> Option<ApplicationMessage> {
        self.state.lock().inflight.release_inbound(packet_id)
    }

    // --- introspection ---

    pub fn pending_message_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.state.lock().inflight.outbound_len()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        SessionStatus {
            client_id: self.client_id.clone(),
            created_at: self.created_at,
            connected: state.connected,
            clean_session: state.expiry == Some(Duration::ZERO),
            subscriptions: state.subscriptions.len(),
            pending_messages: state.queue.len(),
            inflight_messages: state.inflight.outbound_len(),
            dropped_messages: state.dropped_messages,
            failed_deliveries: state.failed_deliveries,
        }
    }
}

/// Outcome of [`SessionStore::open`]
#[derive(Debug)]
pub struct OpenedSession {
    pub session: Arc<Session>,
    /// Generation of the attached connection, see [`Session::attach`]
    pub generation: u64,
    pub session_present: bool,
    /// Session that was discarded by a clean start or because it expired
    pub replaced: Option<Arc<Session>>,
}

/// Registry of sessions keyed by client id
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume the client's session, or start a new one, and attach the
    /// connection to it
    ///
    /// A clean start or an expired session starts fresh and discards
    /// whatever was stored for the client id. The attach happens while the
    /// registry entry is held, so a concurrent [`SessionStore::remove_detached`]
    /// never drops a session that is being resumed.
    pub fn open(&self, client_id: &str, request: SessionRequest, limits: &SessionLimits) -> OpenedSession {
        let new_session = || Arc::new(Session::new(client_id, request.clean_start, limits.clone()));

        match self.sessions.entry(Arc::from(client_id)) {
            Entry::Occupied(mut entry) => {
                if request.clean_start || entry.get().is_expired(Instant::now()) {
                    let session = new_session();
                    let replaced = entry.insert(session.clone());
                    replaced.displace();
                    let generation = session.attach(request.expiry, request.will);
                    OpenedSession {
                        session,
                        generation,
                        session_present: false,
                        replaced: Some(replaced),
                    }
                } else {
                    let session = entry.get().clone();
                    let generation = session.attach(request.expiry, request.will);
                    OpenedSession {
                        session,
                        generation,
                        session_present: true,
                        replaced: None,
                    }
                }
            }
            Entry::Vacant(entry) => {
                let session = new_session();
                let generation = session.attach(request.expiry, request.will);
                entry.insert(session.clone());
                OpenedSession {
                    session,
                    generation,
                    session_present: false,
                    replaced: None,
                }
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Remove `session` if it is still the one registered for its client id
    /// and no connection has attached to it since it was detached
    pub fn remove_detached(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.client_id(), |_, s| {
                Arc::ptr_eq(s, session) && !s.is_connected()
            })
            .is_some()
    }

    /// Drop every disconnected session whose expiry interval has elapsed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut purged = 0;
        self.sessions.retain(|_, s| {
            let expired = s.is_expired(now);
            purged += usize::from(expired);
            !expired
        });
        purged
    }

    /// Snapshot of every registered session
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.sessions().iter().map(|s| s.status()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
