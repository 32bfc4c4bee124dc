//! Typed, topic-based publish/subscribe bus.
//!
//! A [`ChannelRegistry`] owns exactly one channel per topic name. Components
//! never build channels themselves; they ask the registry for one of the two
//! handles bound to a topic:
//!
//! | Handle | Operations |
//! |---|---|
//! | [`PublicationChannel`] | `new_message`, `publish` |
//! | [`SubscriptionChannel`] | `register_on_message_callback`, `unregister` |
//!
//! Both handles for the same topic name share one backing channel, so a
//! handler registered by one component sees every message published by any
//! other component on that topic.
//!
//! # Delivery
//!
//! Delivery is a synchronous fan-out on the publishing thread. Each message
//! is handed to a snapshot of the handler list taken when its delivery
//! starts, in registration order. A per-channel delivery lock keeps two
//! messages on the same topic from interleaving at any handler. A handler
//! that returns an error or panics is logged and skipped; the remaining
//! handlers and the publisher are unaffected.
//!
//! A handler may publish again on the topic it is handling, directly or
//! through a chain of other topics. Such a publish does not wait for the
//! delivery lock. The message is queued and delivered on the same thread
//! once the current fan-out completes, so per-topic order still holds.

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use guidance_types::{GuidanceError, HandlerError};
use tracing::{debug, error, warn};

/// Anything that can travel on the bus.
///
/// `Default` supplies the zero-valued message returned by
/// [`PublicationChannel::new_message`].
pub trait Message: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> Message for T {}

/// A subscription callback.
pub type Handler<M> = Arc<dyn Fn(&M) -> Result<(), HandlerError> + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Topic
// ────────────────────────────────────────────────────────────────────────────

/// Immutable `(name, payload type)` identifier of a channel.
#[derive(Clone)]
pub struct Topic {
    name: Arc<str>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Topic {
    /// Topic `name` carrying payloads of type `M`.
    pub fn of<M: 'static>(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified name of the payload type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.type_id == other.type_id
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.type_id.hash(state);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("payload", &self.type_name)
            .finish()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handler bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Identifies one registered handler on one channel.
///
/// Ids are never reused, so removing a handler leaves the ids of the others
/// valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Published from inside a handler of the same topic; delivery follows
    /// once the in-flight fan-out completes.
    pub queued: bool,
}

impl DeliveryReport {
    /// Total number of handlers the message was handed to.
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

struct Registration<M> {
    id: HandlerId,
    handler: Handler<M>,
}

// Derive would demand `M: Clone`.
impl<M> Clone for Registration<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Channel
// ────────────────────────────────────────────────────────────────────────────

thread_local! {
    // Channels whose fan-out is running on this thread, innermost last.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a channel as delivering on the current thread until dropped.
struct DeliveryMark(usize);

impl DeliveryMark {
    fn enter(key: usize) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(key));
        Self(key)
    }

    fn is_active(key: usize) -> bool {
        DELIVERING.with(|d| d.borrow().contains(&key))
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut active = d.borrow_mut();
            if let Some(pos) = active.iter().rposition(|k| *k == self.0) {
                active.remove(pos);
            }
        });
    }
}

struct Channel<M> {
    topic: Topic,
    // Copy-on-write: registration swaps in a new list, delivery clones the Arc.
    handlers: RwLock<Arc<Vec<Registration<M>>>>,
    delivery: Mutex<()>,
    // Messages published by this channel's own handlers, drained by the
    // thread holding `delivery`.
    pending: Mutex<VecDeque<M>>,
    next_id: AtomicU64,
}

impl<M: Message> Channel<M> {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            handlers: RwLock::new(Arc::new(Vec::new())),
            delivery: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, handler: Handler<M>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push(Registration { id, handler });
        *handlers = Arc::new(next);
        debug!(topic = %self.topic, handler = %id, "handler registered");
        id
    }

    fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !handlers.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<_> = handlers.iter().filter(|r| r.id != id).cloned().collect();
        *handlers = Arc::new(next);
        debug!(topic = %self.topic, handler = %id, "handler unregistered");
        true
    }

    fn snapshot(&self) -> Arc<Vec<Registration<M>>> {
        Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn deliver(&self, message: M) -> DeliveryReport {
        let key = self.key();
        if DeliveryMark::is_active(key) {
            // Waiting on `delivery` here would wait on ourselves.
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(message);
            debug!(topic = %self.topic, "publish from a handler queued behind the in-flight delivery");
            return DeliveryReport {
                queued: true,
                ..DeliveryReport::default()
            };
        }

        let _in_flight = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let _mark = DeliveryMark::enter(key);
        let report = self.fan_out(&message);
        loop {
            let next = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(next) = next else { break };
            self.fan_out(&next);
        }
        report
    }

    fn fan_out(&self, message: &M) -> DeliveryReport {
        let snapshot = self.snapshot();
        let mut report = DeliveryReport::default();

        for registration in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(message))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        topic = %self.topic,
                        handler = %registration.id,
                        error = %e,
                        "subscription handler failed"
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        topic = %self.topic,
                        handler = %registration.id,
                        panic = panic_message(payload.as_ref()),
                        "subscription handler panicked"
                    );
                }
            }
        }
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handles
// ────────────────────────────────────────────────────────────────────────────

/// Send side of a topic.
pub struct PublicationChannel<M> {
    channel: Arc<Channel<M>>,
}

impl<M> Clone for PublicationChannel<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<M: Message> PublicationChannel<M> {
    /// A fresh, zero-valued message for the caller to fill in.
    pub fn new_message(&self) -> M {
        M::default()
    }

    /// Deliver `message` to every handler currently registered on the topic.
    ///
    /// Called from inside one of this topic's handlers, the message is queued
    /// and the returned report has `queued` set; it reaches the handlers
    /// right after the delivery in progress.
    pub fn publish(&self, message: M) -> DeliveryReport {
        self.channel.deliver(message)
    }

    pub fn topic(&self) -> &Topic {
        &self.channel.topic
    }

    /// `true` when `subscription` is backed by the same channel.
    pub fn feeds(&self, subscription: &SubscriptionChannel<M>) -> bool {
        Arc::ptr_eq(&self.channel, &subscription.channel)
    }
}

/// Receive side of a topic.
pub struct SubscriptionChannel<M> {
    channel: Arc<Channel<M>>,
}

impl<M> Clone for SubscriptionChannel<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<M: Message> SubscriptionChannel<M> {
    /// Append `handler` to the topic's handler list.
    ///
    /// The handler sees every message whose delivery starts after this call
    /// returns.
    pub fn register_on_message_callback<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&M) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.channel.register(Arc::new(handler))
    }

    /// Remove a previously registered handler. Returns `false` if `id` is not
    /// registered on this topic.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.channel.unregister(id)
    }

    pub fn handler_count(&self) -> usize {
        self.channel.snapshot().len()
    }

    pub fn topic(&self) -> &Topic {
        &self.channel.topic
    }

    /// `true` when both handles are backed by the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

struct ChannelEntry {
    topic: Topic,
    channel: Arc<dyn Any + Send + Sync>,
}

/// Process-wide owner of every channel. Clone it cheaply – all clones share
/// the same topic map.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send side of `topic_name`, creating the channel on first use.
    ///
    /// # Errors
    ///
    /// [`GuidanceError::TopicTypeMismatch`] when the name is already bound to
    /// a different payload type.
    pub fn get_publication_channel<M: Message>(
        &self,
        topic_name: &str,
    ) -> Result<PublicationChannel<M>, GuidanceError> {
        Ok(PublicationChannel {
            channel: self.channel(topic_name)?,
        })
    }

    /// Receive side of `topic_name`, creating the channel on first use.
    ///
    /// # Errors
    ///
    /// [`GuidanceError::TopicTypeMismatch`] when the name is already bound to
    /// a different payload type.
    pub fn get_subscription_channel<M: Message>(
        &self,
        topic_name: &str,
    ) -> Result<SubscriptionChannel<M>, GuidanceError> {
        Ok(SubscriptionChannel {
            channel: self.channel(topic_name)?,
        })
    }

    /// Every topic installed so far, sorted by name.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.read().values().map(|e| e.topic.clone()).collect();
        topics.sort_by(|a, b| a.name().cmp(b.name()));
        topics
    }

    fn channel<M: Message>(&self, topic_name: &str) -> Result<Arc<Channel<M>>, GuidanceError> {
        let requested = Topic::of::<M>(topic_name);

        // Fast path: already installed, shared lock only.
        {
            let channels = self.read();
            if let Some(entry) = channels.get(topic_name) {
                return downcast_entry(entry, &requested);
            }
        }

        // Another caller may have installed it between the two locks, so the
        // insert is a lookup-or-insert under the exclusive lock.
        let mut channels = self.write();
        let entry = channels.entry(topic_name.to_string()).or_insert_with(|| {
            debug!(topic = %requested, payload = requested.type_name(), "channel created");
            ChannelEntry {
                topic: requested.clone(),
                channel: Arc::new(Channel::<M>::new(requested.clone())),
            }
        });
        downcast_entry(entry, &requested)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

fn downcast_entry<M: Message>(
    entry: &ChannelEntry,
    requested: &Topic,
) -> Result<Arc<Channel<M>>, GuidanceError> {
    if entry.topic.type_id() != requested.type_id() {
        error!(
            topic = %requested,
            registered = entry.topic.type_name(),
            requested = requested.type_name(),
            "topic payload type conflict"
        );
        return Err(GuidanceError::TopicTypeMismatch {
            topic: requested.name().to_string(),
            registered: entry.topic.type_name().to_string(),
            requested: requested.type_name().to_string(),
        });
    }
    Arc::clone(&entry.channel)
        .downcast::<Channel<M>>()
        .map_err(|_| GuidanceError::Channel(format!("channel for '{requested}' has an unexpected layout")))
}
