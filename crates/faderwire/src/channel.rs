//! Transport channel: one reactor task owns the console connection.
//!
//! Architecture:
//! - The link (sink + stream) is owned by a dedicated reactor task
//! - Callers encode their envelope, register a token in the correlation map,
//!   and hand the text to the reactor over an mpsc channel
//! - Replies are matched to callers by token and delivered over oneshot
//! - PUSH frames are routed into the subscription table
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected → Connecting → (replay) → Connected
//!                    ↑                       │ lost
//!                    └──── Reconnecting ←────┘
//! ```
//!
//! `Connected` is published only after every retained subscription has been
//! replayed and acknowledged. Terminal `Disconnected` follows an explicit
//! close or an exhausted retry budget.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faderproto::{Body, Envelope};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::connector::{Connector, FrameSink, FrameStream, Link};
use crate::error::{ConnectionError, LinkError};
use crate::mirror::StateMirror;
use crate::registry::{SubscriptionHandle, SubscriptionTable};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition, as seen on [`crate::ConsoleClient::events`].
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    /// Consecutive failed attempts so far
    pub attempt: u32,
    /// Why we left the previous state, if it was a failure
    pub error: Option<LinkError>,
    pub at: DateTime<Utc>,
}

/// Command sent to the reactor task
pub(crate) enum Command {
    /// Write an encoded request; its reply resolves `token`
    Send { token: u64, text: String },
    /// Shutdown the reactor gracefully
    Shutdown,
}

/// A request waiting for its reply
struct Pending {
    operation: String,
    /// Set for SUBSCRIBE, so the reactor can activate the entry in frame order
    subscription: Option<SubscriptionHandle>,
    response_tx: oneshot::Sender<Result<Envelope, LinkError>>,
}

/// Token allocation and the token → pending map.
#[derive(Default)]
pub(crate) struct Correlation {
    last_token: AtomicU64,
    pending: DashMap<u64, Pending>,
}

impl Correlation {
    /// Tokens start at 1 and are never reused.
    pub(crate) fn next_token(&self) -> u64 {
        self.last_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take(&self, token: u64) -> Option<Pending> {
        self.pending.remove(&token).map(|(_, p)| p)
    }

    fn fail(&self, token: u64, error: LinkError) {
        if let Some(pending) = self.take(token) {
            trace!("Failing {} ({}): {}", pending.operation, token, error);
            let _ = pending.response_tx.send(Err(error));
        }
    }

    fn fail_all(&self, error: &LinkError) -> usize {
        let tokens: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let count = tokens.len();
        for token in tokens {
            self.fail(token, error.clone());
        }
        count
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Publishes connection state to the watch channel, the event stream and the mirror.
pub(crate) struct ConnectionMonitor {
    name: String,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    mirror: Arc<StateMirror>,
}

impl ConnectionMonitor {
    pub(crate) fn new(name: &str, mirror: Arc<StateMirror>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.to_string(),
            state_tx,
            events,
            mirror,
        }
    }

    fn publish(&self, state: ConnectionState, attempt: u32, error: Option<LinkError>) {
        debug!("{}: {} (attempt {})", self.name, state, attempt);
        self.mirror.set_connection_state(state);
        self.state_tx.send_replace(state);
        let _ = self.events.send(ConnectionEvent {
            state,
            attempt,
            error,
            at: Utc::now(),
        });
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Caller side of the channel. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Requester {
    cmd_tx: mpsc::UnboundedSender<Command>,
    correlation: Arc<Correlation>,
    state: watch::Receiver<ConnectionState>,
}

impl Requester {
    /// Send `envelope` and wait up to `timeout` for its reply.
    pub(crate) async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, LinkError> {
        self.send(envelope, None, timeout).await
    }

    /// Like [`request`](Self::request), but an acknowledgement activates
    /// `handle` in the reactor before any later frame is routed.
    pub(crate) async fn subscribe(
        &self,
        handle: SubscriptionHandle,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, LinkError> {
        self.send(envelope, Some(handle), timeout).await
    }

    async fn send(
        &self,
        envelope: Envelope,
        subscription: Option<SubscriptionHandle>,
        timeout: Duration,
    ) -> Result<Envelope, LinkError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(LinkError::not_connected());
        }

        let token = self.correlation.next_token();
        let operation = format!("{} {}", envelope.method, envelope.path);
        let text = envelope.with_id(token).encode()?;

        let (response_tx, response_rx) = oneshot::channel();
        self.correlation.pending.insert(
            token,
            Pending {
                operation: operation.clone(),
                subscription,
                response_tx,
            },
        );

        if self.cmd_tx.send(Command::Send { token, text }).is_err() {
            self.correlation.pending.remove(&token);
            return Err(LinkError::Closed);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.correlation.pending.remove(&token);
                debug!("{} ({}) timed out after {:?}", operation, token, timeout);
                Err(LinkError::Timeout {
                    operation,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.correlation.in_flight()
    }
}

pub(crate) struct ChannelSettings {
    pub name: String,
    pub backoff: BackoffPolicy,
    pub replay_timeout: Duration,
}

/// Spawn the reactor. Must be called inside a tokio runtime.
pub(crate) fn spawn(
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    table: Arc<SubscriptionTable>,
    mirror: Arc<StateMirror>,
) -> (Requester, Arc<ConnectionMonitor>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let correlation = Arc::new(Correlation::default());
    let monitor = Arc::new(ConnectionMonitor::new(&settings.name, Arc::clone(&mirror)));

    let requester = Requester {
        cmd_tx,
        correlation: Arc::clone(&correlation),
        state: monitor.watch(),
    };

    let reactor = Reactor {
        name: settings.name,
        connector,
        backoff: settings.backoff,
        replay_timeout: settings.replay_timeout,
        cmd_rx,
        correlation,
        table,
        mirror,
        monitor: Arc::clone(&monitor),
    };
    let handle = tokio::spawn(reactor.run());

    (requester, monitor, handle)
}

enum SessionEnd {
    Shutdown,
    Lost(LinkError),
}

/// The reactor task - owns the link, handles all I/O.
struct Reactor {
    name: String,
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    replay_timeout: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    correlation: Arc<Correlation>,
    table: Arc<SubscriptionTable>,
    mirror: Arc<StateMirror>,
    monitor: Arc<ConnectionMonitor>,
}

impl Reactor {
    async fn run(mut self) {
        debug!("{}: Reactor task started", self.name);
        let mut failures: u32 = 0;

        loop {
            self.monitor
                .publish(ConnectionState::Connecting, failures, None);

            let connector = Arc::clone(&self.connector);
            let Some(connected) = self
                .while_offline(async move { connector.connect().await })
                .await
            else {
                break;
            };

            let error = match connected {
                Ok(link) => {
                    info!("{}: Connected to {}", self.name, self.connector.describe());
                    match self.session(link, &mut failures).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => LinkError::Connection(e),
            };

            let failed = self.correlation.fail_all(&LinkError::connection_lost());
            let stale = self.mirror.mark_all_stale();
            self.table.detach_all();
            failures = failures.saturating_add(1);
            warn!(
                "{}: Connection failed (attempt {}): {} - failed {} pending, {} values stale",
                self.name, failures, error, failed, stale
            );

            if self.backoff.exhausted(failures) {
                let error = LinkError::Connection(ConnectionError::RetriesExhausted {
                    attempts: failures,
                });
                warn!("{}: {}", self.name, error);
                self.monitor
                    .publish(ConnectionState::Disconnected, failures, Some(error));
                self.finish();
                return;
            }

            self.monitor
                .publish(ConnectionState::Reconnecting, failures, Some(error));
            let delay = self.backoff.delay_for_attempt(failures);
            debug!("{}: Reconnecting in {:?}", self.name, delay);
            if self.while_offline(tokio::time::sleep(delay)).await.is_none() {
                break;
            }
        }

        info!("{}: Closed", self.name);
        self.monitor
            .publish(ConnectionState::Disconnected, failures, None);
        self.finish();
    }

    /// Fail everything still in flight and close all consumers.
    fn finish(&mut self) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Command::Send { token, .. } = cmd {
                self.correlation.fail(token, LinkError::Closed);
            }
        }
        self.correlation.fail_all(&LinkError::Closed);
        self.table.close_all();
        debug!("{}: Reactor task exiting", self.name);
    }

    /// Drive `fut` while rejecting requests. Returns `None` on shutdown.
    async fn while_offline<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Some(out),
                cmd = self.cmd_rx.recv() => {
                    if !self.reject(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Fail a request that arrived while not connected. False means stop.
    fn reject(&self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send { token, .. }) => {
                self.correlation.fail(token, LinkError::not_connected());
                true
            }
            Some(Command::Shutdown) | None => false,
        }
    }

    async fn session(&mut self, link: Link, failures: &mut u32) -> SessionEnd {
        let Link {
            mut sink,
            mut stream,
        } = link;

        if let Err(end) = self.replay(&mut sink, &mut stream).await {
            return end;
        }
        *failures = 0;
        self.monitor.publish(ConnectionState::Connected, 0, None);

        loop {
            tokio::select! {
                // Bias towards processing commands first to avoid starvation
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send { token, text }) => {
                        trace!("{}: Sending request {}", self.name, token);
                        if let Err(e) = sink.send(text).await {
                            warn!("{}: Send failed for {}: {}", self.name, token, e);
                            self.correlation.fail(token, LinkError::connection_lost());
                            return SessionEnd::Lost(e);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!(
                            "{}: Reactor shutting down, failing {} pending requests",
                            self.name,
                            self.correlation.in_flight()
                        );
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        for out in self.on_frame(&text) {
                            if let Err(e) = sink.send(out).await {
                                return SessionEnd::Lost(e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{}: Receive error: {}", self.name, e);
                        return SessionEnd::Lost(e);
                    }
                    None => {
                        warn!("{}: Connection closed by console", self.name);
                        return SessionEnd::Lost(LinkError::connection_lost());
                    }
                },
            }
        }
    }

    /// Resubscribe every retained subscription, one at a time, in
    /// registration order.
    async fn replay(
        &mut self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> Result<(), SessionEnd> {
        let plan = self.table.replay_plan();
        if plan.is_empty() {
            return Ok(());
        }
        info!("{}: Replaying {} subscriptions", self.name, plan.len());

        for item in plan {
            let token = self.correlation.next_token();
            let text = match Envelope::subscribe(item.pattern.clone(), item.target)
                .with_id(token)
                .encode()
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("{}: Cannot encode replay of {}: {}", self.name, item.pattern, e);
                    continue;
                }
            };
            sink.send(text).await.map_err(SessionEnd::Lost)?;

            let reply = self.await_reply(token, sink, stream).await?;
            match reply.body {
                Body::Subscribed(ack) => {
                    let server_id = ack.subscription_id.clone();
                    trace!("{}: Replayed {} as {}", self.name, item.pattern, server_id);
                    if !self.table.activate(item.handle, ack) {
                        if let Some(out) = self.unsubscribe_frame(&item.pattern, &server_id) {
                            sink.send(out).await.map_err(SessionEnd::Lost)?;
                        }
                    }
                }
                Body::Error(e) => {
                    warn!(
                        "{}: Console refused replay of {} ({}): {}",
                        self.name, item.pattern, e.code, e.message
                    );
                    self.table.lapse(item.handle);
                }
                other => {
                    warn!(
                        "{}: Unexpected replay reply for {}: {:?}",
                        self.name, item.pattern, other
                    );
                    self.table.lapse(item.handle);
                }
            }
        }
        Ok(())
    }

    /// Read frames until the reply for `token` arrives, routing everything else.
    async fn await_reply(
        &mut self,
        token: u64,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> Result<Envelope, SessionEnd> {
        let deadline = tokio::time::sleep(self.replay_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(SessionEnd::Lost(LinkError::Timeout {
                        operation: format!("replay ({})", token),
                        timeout_ms: self.replay_timeout.as_millis() as u64,
                    }));
                }
                cmd = self.cmd_rx.recv() => {
                    if !self.reject(cmd) {
                        let _ = sink.close().await;
                        return Err(SessionEnd::Shutdown);
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        let envelope = match faderproto::decode(text.as_bytes()) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("{}: Dropping malformed frame: {}", self.name, e);
                                continue;
                            }
                        };
                        if !envelope.is_push() && envelope.id == Some(token) {
                            return Ok(envelope);
                        }
                        for out in self.dispatch(envelope) {
                            sink.send(out).await.map_err(SessionEnd::Lost)?;
                        }
                    }
                    Some(Err(e)) => return Err(SessionEnd::Lost(e)),
                    None => return Err(SessionEnd::Lost(LinkError::connection_lost())),
                },
            }
        }
    }

    /// Handle one inbound frame. Returns frames to write back.
    fn on_frame(&self, text: &str) -> Vec<String> {
        match faderproto::decode(text.as_bytes()) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                warn!("{}: Dropping malformed frame: {}", self.name, e);
                Vec::new()
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) -> Vec<String> {
        if envelope.is_push() {
            return self
                .table
                .on_push(&envelope)
                .into_iter()
                .filter_map(|orphan| self.unsubscribe_frame(&orphan.pattern, &orphan.server_id))
                .collect();
        }
        self.on_reply(envelope).into_iter().collect()
    }

    fn on_reply(&self, reply: Envelope) -> Option<String> {
        let token = reply.id?;
        let Some(pending) = self.correlation.take(token) else {
            debug!(
                "{}: Discarding orphan reply {} for {} {}",
                self.name, token, reply.method, reply.path
            );
            // A late ack still holds a subscription on the console
            if let Body::Subscribed(ack) = &reply.body {
                return self.unsubscribe_frame(&reply.path, &ack.subscription_id);
            }
            return None;
        };
        trace!("{}: Received reply for {} ({})", self.name, pending.operation, token);

        let mut outbound = None;
        match &reply.body {
            Body::Subscribed(ack) => {
                if let Some(handle) = pending.subscription {
                    if !self.table.activate(handle, ack.clone()) {
                        outbound = self.unsubscribe_frame(&reply.path, &ack.subscription_id);
                    }
                }
            }
            Body::Value { format, value } => {
                self.mirror.apply(&reply.path, *format, value.clone());
            }
            Body::ConsoleInfo(info) => self.mirror.set_console_info(info.clone()),
            Body::AppState(state) => self.mirror.set_app_state(state.clone()),
            _ => {}
        }

        let _ = pending.response_tx.send(Ok(reply));
        outbound
    }

    /// Fire-and-forget UNSUBSCRIBE for a subscription nobody holds.
    fn unsubscribe_frame(&self, pattern: &str, server_id: &str) -> Option<String> {
        let token = self.correlation.next_token();
        debug!(
            "{}: Releasing unclaimed subscription {} on {}",
            self.name, server_id, pattern
        );
        match Envelope::unsubscribe(pattern, server_id)
            .with_id(token)
            .encode()
        {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("{}: Cannot encode unsubscribe for {}: {}", self.name, pattern, e);
                None
            }
        }
    }
}
