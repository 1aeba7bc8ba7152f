//! The console client: one connection, one registry, one mirror.

use std::sync::Arc;
use std::time::Duration;

use faderconf::FaderConfig;
use faderproto::{
    AppState, Body, ConsoleInfo, Envelope, MeteringEncoding, ParamValue, ValueFormat,
    APP_STATE_PATH, CONSOLE_INFO_PATH,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backoff::BackoffPolicy;
use crate::channel::{self, ChannelSettings, ConnectionEvent, ConnectionMonitor, ConnectionState, Requester};
use crate::connector::{Connector, WsConnector};
use crate::error::{ConnectionError, LinkError};
use crate::mirror::{Freshness, ParameterValue, StateMirror};
use crate::registry::{
    MeteringSubscription, ParameterSubscription, SubscriptionHandle, SubscriptionRegistry,
    SubscriptionTable,
};

/// Runtime settings for one client, usually built from [`FaderConfig`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Prefix for log lines
    pub name: String,
    pub request_timeout: Duration,
    pub replay_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub meter_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "console".to_string(),
            request_timeout: Duration::from_millis(5000),
            replay_timeout: Duration::from_millis(5000),
            backoff: BackoffPolicy::default(),
            meter_queue_depth: 2,
        }
    }
}

impl LinkConfig {
    pub fn from_config(config: &FaderConfig) -> Self {
        Self {
            name: config.console.name.clone(),
            request_timeout: Duration::from_millis(config.timeouts.request_ms),
            replay_timeout: Duration::from_millis(config.timeouts.replay_ms),
            backoff: BackoffPolicy::from_config(&config.reconnect),
            meter_queue_depth: config.metering.queue_depth,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Client for one mixing console.
///
/// Construction spawns the reactor, which connects in the background.
/// Use [`wait_for_state`](Self::wait_for_state) to block until connected.
pub struct ConsoleClient {
    config: LinkConfig,
    requester: Requester,
    registry: SubscriptionRegistry,
    mirror: Arc<StateMirror>,
    monitor: Arc<ConnectionMonitor>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleClient {
    /// Connect to the WebSocket endpoint named in `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &FaderConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.console.endpoint.clone()));
        Self::with_connector(LinkConfig::from_config(config), connector)
    }

    /// Must be called from within a tokio runtime.
    pub fn with_connector(config: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        info!("{}: Starting client for {}", config.name, connector.describe());

        let mirror = Arc::new(StateMirror::new());
        let table = Arc::new(SubscriptionTable::new(
            &config.name,
            Arc::clone(&mirror),
            config.meter_queue_depth,
        ));

        let settings = ChannelSettings {
            name: config.name.clone(),
            backoff: config.backoff.clone(),
            replay_timeout: config.replay_timeout,
        };
        let (requester, monitor, reactor) =
            channel::spawn(settings, connector, Arc::clone(&table), Arc::clone(&mirror));

        let registry = SubscriptionRegistry::new(table, requester.clone(), config.request_timeout);

        Self {
            config,
            requester,
            registry,
            mirror,
            monitor,
            reactor: Mutex::new(Some(reactor)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // --- Subscriptions ---

    pub async fn subscribe(
        &self,
        pattern: &str,
        format: ValueFormat,
    ) -> Result<ParameterSubscription, LinkError> {
        self.registry.subscribe(pattern, format).await
    }

    pub async fn subscribe_metering(
        &self,
        path: &str,
        encoding: MeteringEncoding,
    ) -> Result<MeteringSubscription, LinkError> {
        self.registry.subscribe_metering(path, encoding).await
    }

    pub async fn unsubscribe(&self, subscription: ParameterSubscription) -> Result<(), LinkError> {
        self.registry.unsubscribe(subscription).await
    }

    pub async fn unsubscribe_metering(
        &self,
        subscription: MeteringSubscription,
    ) -> Result<(), LinkError> {
        self.registry.unsubscribe_metering(subscription).await
    }

    pub fn refcount(&self, handle: SubscriptionHandle) -> usize {
        self.registry.refcount(handle)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // --- Writes ---

    /// Set `path` in engineering units.
    pub async fn set_plain(
        &self,
        path: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), LinkError> {
        self.set(path, ValueFormat::Val, value.into()).await
    }

    /// Set `path` as a normalized 0..=1 position.
    pub async fn set_normalized(&self, path: &str, value: f64) -> Result<(), LinkError> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(LinkError::InvalidValue(format!(
                "normalized value for {} must be within 0..=1, got {}",
                path, value
            )));
        }
        self.set(path, ValueFormat::Norm, ParamValue::Number(value)).await
    }

    /// Optimistic write: the mirror shows `value` once the request goes out.
    /// A SET that never reached the console leaves the previous entry in
    /// place; any other failure leaves the written value marked stale.
    async fn set(&self, path: &str, format: ValueFormat, value: ParamValue) -> Result<(), LinkError> {
        if path.is_empty() {
            return Err(LinkError::InvalidValue("empty path".into()));
        }
        if self.state() != ConnectionState::Connected {
            return Err(LinkError::not_connected());
        }
        let previous = self.mirror.get(path, format);
        self.mirror
            .set_local_optimistic(path, format, value.clone());

        let result = self
            .requester
            .request(Envelope::set(path, format, value), self.config.request_timeout)
            .await;

        let outcome = match result {
            Ok(reply) => match reply.body {
                Body::Ack => {
                    self.mirror.confirm_optimistic(path, format);
                    Ok(())
                }
                // The echoed value was written to the mirror by the reactor
                Body::Value { .. } => Ok(()),
                Body::Error(e) => Err(LinkError::Rejected {
                    code: e.code,
                    message: e.message,
                }),
                _ => Err(LinkError::unexpected_reply(&reply)),
            },
            Err(e) => Err(e),
        };

        match &outcome {
            Err(LinkError::Connection(ConnectionError::NotConnected)) => {
                debug!("{}: SET {} was never sent", self.config.name, path);
                self.mirror.restore_optimistic(path, format, previous);
            }
            Err(e) => {
                debug!("{}: SET {} failed: {}", self.config.name, path, e);
                self.mirror.retract_optimistic(path, format);
            }
            Ok(()) => {}
        }
        outcome
    }

    // --- Reads ---

    /// Mirrored value, without touching the network.
    pub fn get(&self, path: &str, format: ValueFormat) -> Option<ParameterValue> {
        self.mirror.get(path, format)
    }

    pub fn freshness(&self, path: &str, format: ValueFormat) -> Freshness {
        self.mirror.freshness(path, format)
    }

    /// Ask the console for the current value of `path`. The answer also lands in the mirror.
    pub async fn fetch(&self, path: &str, format: ValueFormat) -> Result<ParameterValue, LinkError> {
        let reply = self.request(Envelope::get(path, Some(format))).await?;
        match reply.body {
            Body::Value { format: got, value } => Ok(self
                .mirror
                .get(&reply.path, got)
                .unwrap_or_else(|| self.mirror.apply(&reply.path, got, value))),
            _ => Err(LinkError::unexpected_reply(&reply)),
        }
    }

    pub async fn fetch_console_info(&self) -> Result<ConsoleInfo, LinkError> {
        let reply = self.request(Envelope::get(CONSOLE_INFO_PATH, None)).await?;
        match reply.body {
            Body::ConsoleInfo(info) => Ok(info),
            _ => Err(LinkError::unexpected_reply(&reply)),
        }
    }

    pub async fn fetch_app_state(&self) -> Result<AppState, LinkError> {
        let reply = self.request(Envelope::get(APP_STATE_PATH, None)).await?;
        match reply.body {
            Body::AppState(state) => Ok(state),
            _ => Err(LinkError::unexpected_reply(&reply)),
        }
    }

    /// Send a request, turning a console error reply into [`LinkError::Rejected`].
    async fn request(&self, envelope: Envelope) -> Result<Envelope, LinkError> {
        let reply = self
            .requester
            .request(envelope, self.config.request_timeout)
            .await?;
        match reply.body {
            Body::Error(e) => Err(LinkError::Rejected {
                code: e.code,
                message: e.message,
            }),
            _ => Ok(reply),
        }
    }

    // --- Connection ---

    pub fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.monitor.watch()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.monitor.events()
    }

    /// Wait until the connection reaches `want`.
    pub async fn wait_for_state(
        &self,
        want: ConnectionState,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut rx = self.monitor.watch();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| *state == want))
            .await
            .map(|reached| reached.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout {
                operation: format!("wait for {}", want),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn mirror(&self) -> &Arc<StateMirror> {
        &self.mirror
    }

    /// Requests waiting on a reply.
    pub fn in_flight(&self) -> usize {
        self.requester.in_flight()
    }

    /// Shut the reactor down. Pending requests fail with [`LinkError::Closed`]
    /// and every subscription stream ends.
    pub async fn close(&self) {
        self.requester.shutdown();
        let handle = self.reactor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ConsoleClient {
    fn drop(&mut self) {
        self.requester.shutdown();
    }
}
