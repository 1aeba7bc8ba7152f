//! Client engine for mixing-console control servers.
//!
//! A [`ConsoleClient`] owns one connection to a console and keeps:
//! - a transport channel that correlates requests with replies and
//!   reconnects with backoff, replaying subscriptions before it reports
//!   itself connected again
//! - a subscription registry that shares one wire subscription between
//!   every local consumer of the same pattern
//! - a [`StateMirror`] of the last known value of every parameter seen
//!
//! ```no_run
//! use faderconf::FaderConfig;
//! use faderproto::ValueFormat;
//! use faderwire::{ConnectionState, ConsoleClient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConsoleClient::connect(&FaderConfig::load()?);
//! client.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)).await?;
//!
//! let mut faders = client.subscribe("ch.*.mix.lvl", ValueFormat::Norm).await?;
//! client.set_normalized("ch.0.mix.lvl", 0.75).await?;
//! while let Some(update) = faders.recv().await {
//!     println!("{} = {:?}", update.path, update.value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod client;
pub mod connector;
pub mod error;
pub mod meter_queue;
pub mod mirror;
pub mod registry;

pub use backoff::BackoffPolicy;
pub use channel::{ConnectionEvent, ConnectionState};
pub use client::{ConsoleClient, LinkConfig};
pub use connector::{Connector, FrameSink, FrameStream, Link, WsConnector};
pub use error::{ConnectionError, LinkError};
pub use meter_queue::LatestQueue;
pub use mirror::{Freshness, ParameterValue, StateMirror, ValueOrigin};
pub use registry::{
    MeteringSubscription, ParameterSubscription, SubscriptionHandle, SubscriptionRegistry,
};
