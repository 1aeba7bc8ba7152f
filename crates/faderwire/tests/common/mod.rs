//! Scripted in-memory console for integration tests.
//!
//! Each `connect()` opens a fresh pair of channels and spawns a server task
//! that answers requests from a value table. Tests can push frames, drop the
//! connection, refuse new connections, or make paths go silent or fail.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faderproto::{
    AppState, Body, ConsoleInfo, Envelope, Method, ParamUpdate, ParamValue, PathPattern,
    RemoteError, SubscribeAck, SubscribeTarget, ValueFormat, APP_STATE_PATH, CONSOLE_INFO_PATH,
};
use faderwire::{
    BackoffPolicy, ConnectionError, ConnectionState, Connector, ConsoleClient, Link, LinkConfig,
    LinkError,
};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct WireSubscription {
    pattern: PathPattern,
    target: SubscribeTarget,
}

#[derive(Default)]
struct Inner {
    values: Mutex<HashMap<(String, ValueFormat), ParamValue>>,
    requests: Mutex<Vec<Envelope>>,
    session: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    subscriptions: Mutex<HashMap<String, WireSubscription>>,
    silent: Mutex<HashSet<String>>,
    rejected: Mutex<HashMap<String, RemoteError>>,
    echo_set: AtomicBool,
    refuse: AtomicBool,
    connects: AtomicUsize,
    generation: AtomicU64,
    next_subscription: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MockConsole {
    inner: Arc<Inner>,
}

impl MockConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, path: &str, format: ValueFormat, value: impl Into<ParamValue>) -> Self {
        self.set_value(path, format, value);
        self
    }

    pub fn set_value(&self, path: &str, format: ValueFormat, value: impl Into<ParamValue>) {
        self.inner
            .values
            .lock()
            .insert((path.to_string(), format), value.into());
    }

    pub fn value(&self, path: &str, format: ValueFormat) -> Option<ParamValue> {
        self.inner
            .values
            .lock()
            .get(&(path.to_string(), format))
            .cloned()
    }

    /// Never answer requests on `path`.
    pub fn silence(&self, path: &str) {
        self.inner.silent.lock().insert(path.to_string());
    }

    pub fn unsilence(&self, path: &str) {
        self.inner.silent.lock().remove(path);
    }

    /// Answer every request on `path` with an error body.
    pub fn reject(&self, path: &str, code: &str, message: &str) {
        self.inner
            .rejected
            .lock()
            .insert(path.to_string(), RemoteError::new(code, message));
    }

    pub fn accept(&self, path: &str) {
        self.inner.rejected.lock().remove(path);
    }

    pub fn echo_set(&self, echo: bool) {
        self.inner.echo_set.store(echo, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Every request received so far, across connections.
    pub fn requests(&self) -> Vec<Envelope> {
        self.inner.requests.lock().clone()
    }

    pub fn requests_with(&self, method: Method) -> Vec<Envelope> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.inner.requests.lock().clear();
    }

    /// Live wire subscriptions: server id → pattern.
    pub fn subscriptions(&self) -> HashMap<String, String> {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .map(|(id, sub)| (id.clone(), sub.pattern.as_str().to_string()))
            .collect()
    }

    /// Send raw text to the connected client.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        match self.inner.session.lock().as_ref() {
            Some((_, tx)) => tx.unbounded_send(text.into()).is_ok(),
            None => false,
        }
    }

    pub fn push(&self, envelope: Envelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Update the table and push the change to matching subscriptions.
    pub fn change(&self, path: &str, format: ValueFormat, value: impl Into<ParamValue>) {
        let value = value.into();
        self.set_value(path, format, value.clone());
        self.inner.notify(path, format, &value);
    }

    /// Hang up. Subscriptions on the console side die with the connection.
    pub fn drop_connection(&self) {
        self.inner.session.lock().take();
        self.inner.subscriptions.lock().clear();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn client(&self) -> ConsoleClient {
        self.client_with(test_config())
    }

    pub fn client_with(&self, config: LinkConfig) -> ConsoleClient {
        ConsoleClient::with_connector(config, Arc::new(self.clone()))
    }
}

/// Fast timeouts and backoff for tests.
pub fn test_config() -> LinkConfig {
    LinkConfig {
        name: "mock".to_string(),
        request_timeout: Duration::from_millis(500),
        replay_timeout: Duration::from_millis(500),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: false,
            max_attempts: None,
        },
        meter_queue_depth: 2,
    }
}

/// Build a client and wait for it to connect.
pub async fn connected(console: &MockConsole) -> ConsoleClient {
    let client = console.client();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .expect("client should connect");
    client
}

/// Poll until `check` holds or the wait budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

impl Inner {
    fn send(&self, generation: u64, text: String) {
        if let Some((current, tx)) = self.session.lock().as_ref() {
            if *current == generation {
                let _ = tx.unbounded_send(text);
            }
        }
    }

    fn notify(&self, path: &str, format: ValueFormat, value: &ParamValue) {
        let interested = self.subscriptions.lock().values().any(|sub| {
            sub.target == SubscribeTarget::Parameter { format } && sub.pattern.matches(path)
        });
        if !interested {
            return;
        }
        let push = Envelope::push(
            path,
            Body::Value {
                format,
                value: value.clone(),
            },
        );
        if let (Ok(text), Some((_, tx))) = (push.encode(), self.session.lock().as_ref()) {
            let _ = tx.unbounded_send(text);
        }
    }

    fn handle(&self, generation: u64, text: &str) {
        let request = match faderproto::decode_request(text.as_bytes()) {
            Ok(request) => request,
            Err(_) => return,
        };
        self.requests.lock().push(request.clone());

        if self.silent.lock().contains(&request.path) {
            return;
        }
        let rejected = self.rejected.lock().get(&request.path).cloned();
        if let Some(err) = rejected {
            self.reply(generation, &request, Body::Error(err));
            return;
        }

        let mut after = None;
        let body = match (&request.method, &request.body) {
            (Method::Get, Body::Query { format }) => match request.path.as_str() {
                CONSOLE_INFO_PATH => Body::ConsoleInfo(ConsoleInfo {
                    name: "Mock Console".into(),
                    model: Some("MX-32".into()),
                    firmware: Some("1.4.2".into()),
                }),
                APP_STATE_PATH => Body::AppState(AppState::new("ready")),
                path => {
                    let format = format.unwrap_or(ValueFormat::Val);
                    match self.values.lock().get(&(path.to_string(), format)) {
                        Some(value) => Body::Value {
                            format,
                            value: value.clone(),
                        },
                        None => Body::Error(RemoteError::new("not_found", path)),
                    }
                }
            },
            (Method::Set, Body::Assign { format, value }) => {
                self.values
                    .lock()
                    .insert((request.path.clone(), *format), value.clone());
                after = Some((*format, value.clone()));
                if self.echo_set.load(Ordering::SeqCst) {
                    Body::Value {
                        format: *format,
                        value: value.clone(),
                    }
                } else {
                    Body::Ack
                }
            }
            (Method::Subscribe, Body::Subscribe(target)) => {
                let Ok(pattern) = PathPattern::parse(&request.path) else {
                    self.reply(
                        generation,
                        &request,
                        Body::Error(RemoteError::new("bad_pattern", &request.path)),
                    );
                    return;
                };
                let id = format!(
                    "sub-{}",
                    self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1
                );
                let mut ack = SubscribeAck::new(id.clone());
                match target {
                    SubscribeTarget::Parameter { format } => {
                        let mut values: Vec<ParamUpdate> = self
                            .values
                            .lock()
                            .iter()
                            .filter(|((path, f), _)| f == format && pattern.matches(path))
                            .map(|((path, f), v)| ParamUpdate::new(path.clone(), *f, v.clone()))
                            .collect();
                        values.sort_by(|a, b| a.path.cmp(&b.path));
                        ack.values = values;
                    }
                    SubscribeTarget::Metering { encoding } => ack.encoding = Some(*encoding),
                }
                self.subscriptions.lock().insert(
                    id,
                    WireSubscription {
                        pattern,
                        target: *target,
                    },
                );
                Body::Subscribed(ack)
            }
            (Method::Unsubscribe, Body::Unsubscribe { subscription_id }) => {
                self.subscriptions.lock().remove(subscription_id);
                Body::Ack
            }
            _ => Body::Error(RemoteError::new("bad_request", "unsupported")),
        };

        self.reply(generation, &request, body);
        if let Some((format, value)) = after {
            self.notify(&request.path, format, &value);
        }
    }

    fn reply(&self, generation: u64, request: &Envelope, body: Body) {
        if let Ok(text) = Envelope::reply_to(request, body).encode() {
            self.send(generation, text);
        }
    }
}

#[async_trait]
impl Connector for MockConsole {
    async fn connect(&self) -> Result<Link, ConnectionError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused {
                endpoint: self.describe(),
                reason: "refused by test".into(),
            });
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (to_server, mut from_client) = mpsc::unbounded::<String>();
        let (to_client, from_server) = mpsc::unbounded::<String>();
        *self.inner.session.lock() = Some((generation, to_client));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(text) = from_client.next().await {
                inner.handle(generation, &text);
            }
        });

        let sink = to_server.sink_map_err(|_| LinkError::connection_lost());
        let stream = from_server.map(Ok::<String, LinkError>);
        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }

    fn describe(&self) -> String {
        "mock://console".to_string()
    }
}
