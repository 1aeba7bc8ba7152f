//! Subscription registry.
//!
//! Application code may subscribe to the same `(pattern, format)` from many
//! places; the console only ever sees one wire subscription for it. Each
//! call gets its own consumer (its own receiver) attached to a shared entry,
//! and the entry's refcount is its consumer count. The wire UNSUBSCRIBE goes
//! out only when the last consumer leaves.
//!
//! The table is shared with the reactor, which routes pushes into it and
//! replays it after a reconnect. Its lock is never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use faderproto::{
    Body, Envelope, MeteringDecoder, MeteringEncoding, MeteringFrame, PathPattern,
    SubscribeAck, SubscribeTarget, ValueFormat,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::channel::Requester;
use crate::error::{ConnectionError, LinkError};
use crate::meter_queue::LatestQueue;
use crate::mirror::{ParameterValue, StateMirror};

/// Identifies one deduplicated subscription. Every consumer of the same
/// `(pattern, format)` sees the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

type ConsumerId = u64;

/// One consumer of a parameter subscription.
#[derive(Debug)]
pub struct ParameterSubscription {
    handle: SubscriptionHandle,
    consumer: ConsumerId,
    pattern: String,
    format: ValueFormat,
    updates: mpsc::UnboundedReceiver<ParameterValue>,
}

impl ParameterSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format(&self) -> ValueFormat {
        self.format
    }

    /// Next update, in console send order. `None` once the client closes.
    pub async fn recv(&mut self) -> Option<ParameterValue> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ParameterValue> {
        self.updates.try_recv().ok()
    }
}

/// One consumer of a metering stream.
#[derive(Debug)]
pub struct MeteringSubscription {
    handle: SubscriptionHandle,
    consumer: ConsumerId,
    path: String,
    encoding: MeteringEncoding,
    queue: Arc<LatestQueue<MeteringFrame>>,
}

impl MeteringSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Encoding requested at subscribe time.
    pub fn encoding(&self) -> MeteringEncoding {
        self.encoding
    }

    /// Newest undelivered frame. `None` once the client closes.
    pub async fn recv(&self) -> Option<MeteringFrame> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<MeteringFrame> {
        self.queue.try_recv()
    }

    /// Frames this consumer never saw because newer ones replaced them.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Wire SUBSCRIBE in flight
    Pending,
    Active,
    /// Console refused the replay; retried by the next subscriber or reconnect
    Lapsed,
}

enum Consumers {
    Parameter(Vec<(ConsumerId, mpsc::UnboundedSender<ParameterValue>)>),
    Metering {
        decoder: Option<MeteringDecoder>,
        queues: Vec<(ConsumerId, Arc<LatestQueue<MeteringFrame>>)>,
    },
}

impl Consumers {
    fn len(&self) -> usize {
        match self {
            Consumers::Parameter(c) => c.len(),
            Consumers::Metering { queues, .. } => queues.len(),
        }
    }

    fn remove(&mut self, consumer: ConsumerId) -> bool {
        let before = self.len();
        match self {
            Consumers::Parameter(c) => c.retain(|(id, _)| *id != consumer),
            Consumers::Metering { queues, .. } => queues.retain(|(id, _)| *id != consumer),
        }
        self.len() < before
    }

    fn close(&mut self) {
        match self {
            Consumers::Parameter(c) => c.clear(),
            Consumers::Metering { queues, .. } => {
                for (_, q) in queues.drain(..) {
                    q.close();
                }
            }
        }
    }
}

struct Entry {
    pattern: PathPattern,
    target: SubscribeTarget,
    state: EntryState,
    server_id: Option<String>,
    consumers: Consumers,
    /// Consumers attached while the SUBSCRIBE was in flight
    waiters: Vec<(ConsumerId, oneshot::Sender<Result<(), LinkError>>)>,
}

impl Entry {
    fn refcount(&self) -> usize {
        self.consumers.len()
    }
}

#[derive(Default)]
struct TableInner {
    next_handle: u64,
    next_consumer: u64,
    /// Keyed by handle, so iteration is registration order
    entries: BTreeMap<u64, Entry>,
    by_key: HashMap<(String, SubscribeTarget), u64>,
    by_server_id: HashMap<String, u64>,
}

impl TableInner {
    fn remove(&mut self, handle: u64) -> Option<Entry> {
        let entry = self.entries.remove(&handle)?;
        self.by_key
            .remove(&(entry.pattern.as_str().to_string(), entry.target));
        if let Some(sid) = &entry.server_id {
            self.by_server_id.remove(sid);
        }
        Some(entry)
    }
}

pub(crate) enum NewConsumer {
    Parameter(mpsc::UnboundedSender<ParameterValue>),
    Metering(Arc<LatestQueue<MeteringFrame>>),
}

pub(crate) enum AttachState {
    /// Caller must send the wire SUBSCRIBE
    Issue,
    /// Someone else's SUBSCRIBE is in flight
    Wait(oneshot::Receiver<Result<(), LinkError>>),
    /// Already active; consumer has been seeded
    Ready,
}

pub(crate) enum Release {
    /// Other consumers remain
    Shared,
    /// Last consumer left; tear down the wire subscription if it has one
    Last {
        pattern: String,
        server_id: Option<String>,
    },
    Unknown,
}

/// An ack that arrived for an entry nobody wants any more.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Orphan {
    pub pattern: String,
    pub server_id: String,
}

pub(crate) struct ReplayItem {
    pub handle: SubscriptionHandle,
    pub pattern: String,
    pub target: SubscribeTarget,
}

/// Registry state shared between the facade and the reactor.
pub(crate) struct SubscriptionTable {
    name: String,
    inner: Mutex<TableInner>,
    mirror: Arc<StateMirror>,
    queue_depth: usize,
}

impl SubscriptionTable {
    pub(crate) fn new(name: &str, mirror: Arc<StateMirror>, queue_depth: usize) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(TableInner::default()),
            mirror,
            queue_depth,
        }
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Add a consumer for `(pattern, target)`, creating the entry if needed.
    pub(crate) fn attach(
        &self,
        pattern: PathPattern,
        target: SubscribeTarget,
        consumer: NewConsumer,
    ) -> (SubscriptionHandle, ConsumerId, AttachState) {
        let mut inner = self.inner.lock();
        let consumer_id = inner.next_consumer;
        inner.next_consumer += 1;

        let key = (pattern.as_str().to_string(), target);
        if let Some(&handle) = inner.by_key.get(&key) {
            if let Some(entry) = inner.entries.get_mut(&handle) {
                let state = match entry.state {
                    EntryState::Pending => {
                        let (tx, rx) = oneshot::channel();
                        entry.waiters.push((consumer_id, tx));
                        AttachState::Wait(rx)
                    }
                    // Nothing is live on the wire; this caller resubscribes
                    EntryState::Lapsed => {
                        entry.state = EntryState::Pending;
                        AttachState::Issue
                    }
                    EntryState::Active => {
                        if let (NewConsumer::Parameter(tx), SubscribeTarget::Parameter { format }) =
                            (&consumer, target)
                        {
                            for value in self.mirror.matching(&entry.pattern, format) {
                                let _ = tx.send(value);
                            }
                        }
                        AttachState::Ready
                    }
                };
                push_consumer(&mut entry.consumers, consumer_id, consumer);
                trace!(
                    "{}: {} now has {} consumers",
                    self.name,
                    key.0,
                    entry.refcount()
                );
                return (SubscriptionHandle(handle), consumer_id, state);
            }
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let mut consumers = match target {
            SubscribeTarget::Parameter { .. } => Consumers::Parameter(Vec::new()),
            SubscribeTarget::Metering { .. } => Consumers::Metering {
                decoder: None,
                queues: Vec::new(),
            },
        };
        push_consumer(&mut consumers, consumer_id, consumer);
        inner.entries.insert(
            handle,
            Entry {
                pattern,
                target,
                state: EntryState::Pending,
                server_id: None,
                consumers,
                waiters: Vec::new(),
            },
        );
        inner.by_key.insert(key, handle);
        (SubscriptionHandle(handle), consumer_id, AttachState::Issue)
    }

    /// Bind an entry to the console's acknowledgement.
    ///
    /// Writes the snapshot to the mirror and delivers it to every consumer
    /// before anyone waiting on the entry is released. Used for first
    /// subscribes and for replays.
    ///
    /// Returns false when the entry is gone and the ack has nobody to serve.
    pub(crate) fn activate(&self, handle: SubscriptionHandle, ack: SubscribeAck) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&handle.0) else {
            return false;
        };

        let previous = entry.server_id.replace(ack.subscription_id.clone());
        entry.state = EntryState::Active;

        match (&mut entry.consumers, entry.target) {
            (Consumers::Parameter(consumers), SubscribeTarget::Parameter { format }) => {
                for update in &ack.values {
                    if update.format != format {
                        continue;
                    }
                    let value = self.mirror.apply(&update.path, update.format, update.value.clone());
                    for (_, tx) in consumers.iter() {
                        let _ = tx.send(value.clone());
                    }
                }
            }
            (Consumers::Metering { decoder, .. }, SubscribeTarget::Metering { encoding }) => {
                let encoding = ack.encoding.unwrap_or(encoding);
                if let Some(d) = decoder.as_mut() {
                    d.rebind(ack.subscription_id.clone(), encoding);
                } else {
                    *decoder = Some(MeteringDecoder::new(ack.subscription_id.clone(), encoding));
                }
            }
            _ => {}
        }

        for (_, waiter) in entry.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        debug!(
            "{}: {} active as {} ({} consumers)",
            self.name,
            entry.pattern,
            ack.subscription_id,
            entry.refcount()
        );

        if let Some(old) = previous {
            inner.by_server_id.remove(&old);
        }
        inner.by_server_id.insert(ack.subscription_id, handle.0);
        true
    }

    /// A SUBSCRIBE issued by `consumer` failed.
    ///
    /// The issuer and everyone who attached while it was in flight are
    /// detached and failed. An entry that still has older consumers (a lapsed
    /// entry being revived) goes back to `Lapsed`; otherwise it is removed.
    ///
    /// Returns true if the ack beat the failure and the entry is active, in
    /// which case nothing is torn down.
    pub(crate) fn fail(
        &self,
        handle: SubscriptionHandle,
        consumer: ConsumerId,
        error: &LinkError,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&handle.0) else {
            return false;
        };
        if entry.state == EntryState::Active {
            debug!(
                "{}: {} was acknowledged before the caller gave up ({})",
                self.name, entry.pattern, error
            );
            return true;
        }

        debug!("{}: {} failed: {}", self.name, entry.pattern, error);
        entry.consumers.remove(consumer);
        for (id, waiter) in entry.waiters.drain(..) {
            entry.consumers.remove(id);
            let _ = waiter.send(Err(error.clone()));
        }
        if entry.refcount() > 0 {
            entry.state = EntryState::Lapsed;
        } else if let Some(mut entry) = inner.remove(handle.0) {
            entry.consumers.close();
        }
        false
    }

    /// Mark an entry whose replay the console refused.
    pub(crate) fn lapse(&self, handle: SubscriptionHandle) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&handle.0) {
            entry.state = EntryState::Lapsed;
        }
    }

    pub(crate) fn release(&self, handle: SubscriptionHandle, consumer: ConsumerId) -> Release {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&handle.0) else {
            return Release::Unknown;
        };
        if !entry.consumers.remove(consumer) {
            return Release::Unknown;
        }
        if entry.refcount() > 0 {
            return Release::Shared;
        }
        match inner.remove(handle.0) {
            Some(entry) => Release::Last {
                pattern: entry.pattern.as_str().to_string(),
                server_id: entry.server_id,
            },
            None => Release::Unknown,
        }
    }

    pub(crate) fn refcount(&self, handle: SubscriptionHandle) -> usize {
        self.inner
            .lock()
            .entries
            .get(&handle.0)
            .map(Entry::refcount)
            .unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Entries to resubscribe after a reconnect, in registration order.
    pub(crate) fn replay_plan(&self) -> Vec<ReplayItem> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.state != EntryState::Pending)
            .map(|(handle, e)| ReplayItem {
                handle: SubscriptionHandle(*handle),
                pattern: e.pattern.as_str().to_string(),
                target: e.target,
            })
            .collect()
    }

    /// Forget all server ids; they die with the connection.
    pub(crate) fn detach_all(&self) {
        let mut inner = self.inner.lock();
        inner.by_server_id.clear();
        for entry in inner.entries.values_mut() {
            entry.server_id = None;
        }
    }

    /// Close every consumer and fail every waiter.
    pub(crate) fn close_all(&self) {
        let mut inner = self.inner.lock();
        for (_, mut entry) in std::mem::take(&mut inner.entries) {
            for (_, waiter) in entry.waiters.drain(..) {
                let _ = waiter.send(Err(LinkError::Closed));
            }
            entry.consumers.close();
        }
        inner.by_key.clear();
        inner.by_server_id.clear();
    }

    /// Route one PUSH envelope.
    ///
    /// The mirror is updated once; each consumer of each matching entry is
    /// notified once. Returns wire subscriptions whose consumers have all
    /// gone away without unsubscribing.
    pub(crate) fn on_push(&self, push: &Envelope) -> Vec<Orphan> {
        match &push.body {
            Body::Value { format, value } => {
                let value = self.mirror.apply(&push.path, *format, value.clone());
                self.fan_out_value(&value)
            }
            Body::Metering(payload) => {
                let mut inner = self.inner.lock();
                let Some(&handle) = inner.by_server_id.get(&payload.subscription_id) else {
                    debug!(
                        "{}: Metering frame for unknown subscription {}",
                        self.name, payload.subscription_id
                    );
                    return Vec::new();
                };
                let Some(entry) = inner.entries.get_mut(&handle) else {
                    return Vec::new();
                };
                let Consumers::Metering { decoder: Some(decoder), queues } = &mut entry.consumers
                else {
                    return Vec::new();
                };
                match decoder.decode(payload) {
                    Ok(frame) => {
                        queues.retain(|(_, q)| Arc::strong_count(q) > 1);
                        for (_, q) in queues.iter() {
                            if q.push(frame.clone()) {
                                trace!("{}: Superseded a metering frame on {}", self.name, push.path);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{}: Dropping metering frame on {} ({}): {}",
                            self.name, push.path, payload.subscription_id, e
                        );
                    }
                }
                if entry.refcount() == 0 {
                    return inner
                        .remove(handle)
                        .and_then(|e| orphan_of(&e))
                        .into_iter()
                        .collect();
                }
                Vec::new()
            }
            Body::ConsoleInfo(info) => {
                self.mirror.set_console_info(info.clone());
                Vec::new()
            }
            Body::AppState(state) => {
                self.mirror.set_app_state(state.clone());
                Vec::new()
            }
            other => {
                debug!("{}: Ignoring push body {:?} on {}", self.name, other, push.path);
                Vec::new()
            }
        }
    }

    fn fan_out_value(&self, value: &ParameterValue) -> Vec<Orphan> {
        let mut inner = self.inner.lock();
        let mut emptied = Vec::new();

        for (handle, entry) in inner.entries.iter_mut() {
            if entry.state == EntryState::Pending
                || entry.target != (SubscribeTarget::Parameter { format: value.format })
                || !entry.pattern.matches(&value.path)
            {
                continue;
            }
            if let Consumers::Parameter(consumers) = &mut entry.consumers {
                consumers.retain(|(_, tx)| tx.send(value.clone()).is_ok());
            }
            if entry.refcount() == 0 {
                emptied.push(*handle);
            }
        }

        emptied
            .into_iter()
            .filter_map(|handle| inner.remove(handle))
            .filter_map(|entry| orphan_of(&entry))
            .collect()
    }
}

fn push_consumer(consumers: &mut Consumers, id: ConsumerId, consumer: NewConsumer) {
    match (consumers, consumer) {
        (Consumers::Parameter(list), NewConsumer::Parameter(tx)) => list.push((id, tx)),
        (Consumers::Metering { queues, .. }, NewConsumer::Metering(q)) => queues.push((id, q)),
        _ => {}
    }
}

fn orphan_of(entry: &Entry) -> Option<Orphan> {
    entry.server_id.as_ref().map(|sid| Orphan {
        pattern: entry.pattern.as_str().to_string(),
        server_id: sid.clone(),
    })
}

/// Public face of the registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    table: Arc<SubscriptionTable>,
    requester: Requester,
    timeout: Duration,
}

/// Fails the entry if the subscribing future is dropped mid-request.
struct PendingGuard<'a> {
    table: &'a SubscriptionTable,
    handle: SubscriptionHandle,
    consumer: ConsumerId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.fail(self.handle, self.consumer, &LinkError::Closed);
        }
    }
}

impl SubscriptionRegistry {
    pub(crate) fn new(table: Arc<SubscriptionTable>, requester: Requester, timeout: Duration) -> Self {
        Self {
            table,
            requester,
            timeout,
        }
    }

    /// Subscribe to parameter changes under `pattern`.
    ///
    /// Returns once the console's snapshot of every matching path is in the
    /// mirror and queued on the returned subscription.
    pub async fn subscribe(
        &self,
        pattern: &str,
        format: ValueFormat,
    ) -> Result<ParameterSubscription, LinkError> {
        let parsed = PathPattern::parse(pattern)?;
        let target = SubscribeTarget::Parameter { format };
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, consumer, attach) = self.table.attach(parsed, target, NewConsumer::Parameter(tx));
        self.settle(handle, consumer, pattern, target, attach).await?;
        Ok(ParameterSubscription {
            handle,
            consumer,
            pattern: pattern.to_string(),
            format,
            updates: rx,
        })
    }

    /// Subscribe to the metering stream at `path`.
    pub async fn subscribe_metering(
        &self,
        path: &str,
        encoding: MeteringEncoding,
    ) -> Result<MeteringSubscription, LinkError> {
        let parsed = PathPattern::parse(path)?;
        let target = SubscribeTarget::Metering { encoding };
        let queue = Arc::new(LatestQueue::new(self.table.queue_depth()));
        let (handle, consumer, attach) =
            self.table
                .attach(parsed, target, NewConsumer::Metering(Arc::clone(&queue)));
        self.settle(handle, consumer, path, target, attach).await?;
        Ok(MeteringSubscription {
            handle,
            consumer,
            path: path.to_string(),
            encoding,
            queue,
        })
    }

    pub async fn unsubscribe(&self, subscription: ParameterSubscription) -> Result<(), LinkError> {
        self.release(subscription.handle, subscription.consumer).await
    }

    pub async fn unsubscribe_metering(
        &self,
        subscription: MeteringSubscription,
    ) -> Result<(), LinkError> {
        subscription.queue.close();
        self.release(subscription.handle, subscription.consumer).await
    }

    /// Consumers currently sharing `handle`.
    pub fn refcount(&self, handle: SubscriptionHandle) -> usize {
        self.table.refcount(handle)
    }

    /// Number of distinct wire subscriptions held.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn settle(
        &self,
        handle: SubscriptionHandle,
        consumer: ConsumerId,
        pattern: &str,
        target: SubscribeTarget,
        attach: AttachState,
    ) -> Result<(), LinkError> {
        match attach {
            AttachState::Ready => Ok(()),
            AttachState::Wait(rx) => rx.await.unwrap_or(Err(LinkError::Closed)),
            AttachState::Issue => {
                let mut guard = PendingGuard {
                    table: &self.table,
                    handle,
                    consumer,
                    armed: true,
                };
                let reply = self
                    .requester
                    .subscribe(handle, Envelope::subscribe(pattern, target), self.timeout)
                    .await;
                guard.armed = false;

                // A successful ack was already applied by the reactor
                let outcome = reply.and_then(|reply| match reply.body {
                    Body::Subscribed(_) => Ok(()),
                    Body::Error(e) => Err(LinkError::Subscription {
                        code: e.code,
                        message: e.message,
                    }),
                    _ => Err(LinkError::unexpected_reply(&reply)),
                });
                match outcome {
                    Err(e) if !self.table.fail(handle, consumer, &e) => Err(e),
                    // Timed out, but the reactor applied the ack first
                    _ => Ok(()),
                }
            }
        }
    }

    async fn release(&self, handle: SubscriptionHandle, consumer: ConsumerId) -> Result<(), LinkError> {
        match self.table.release(handle, consumer) {
            Release::Shared | Release::Unknown | Release::Last { server_id: None, .. } => Ok(()),
            Release::Last {
                pattern,
                server_id: Some(server_id),
            } => {
                let reply = self
                    .requester
                    .request(Envelope::unsubscribe(pattern, server_id), self.timeout)
                    .await;
                match reply {
                    Ok(reply) => match reply.body {
                        Body::Ack => Ok(()),
                        Body::Error(e) => Err(LinkError::Subscription {
                            code: e.code,
                            message: e.message,
                        }),
                        _ => Err(LinkError::unexpected_reply(&reply)),
                    },
                    // The wire subscription dies with the connection
                    Err(LinkError::Connection(
                        ConnectionError::NotConnected | ConnectionError::ConnectionLost,
                    )) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}
