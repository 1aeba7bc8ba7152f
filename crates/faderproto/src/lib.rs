//! faderproto - Wire types for the mixing-console control connection
//!
//! Everything in this crate is pure: no sockets, no tasks, no clocks. The
//! `faderwire` crate owns the connection and uses these types to talk to it.
//!
//! ## Envelope
//!
//! Every frame is a JSON envelope:
//!
//! ```text
//! { "id": 7, "path": "ch.0.mix.lvl", "method": "SET", "body": { ... } }
//! ```
//!
//! - `id` correlates a reply to its request; PUSH frames carry none
//! - `path` is a dotted parameter address (`ch.0.mix.lvl`)
//! - `method` is GET, SET, SUBSCRIBE, UNSUBSCRIBE or PUSH
//! - `body` depends on method and direction; see [`Body`]
//!
//! ## Metering
//!
//! Metering arrives either as JSON floats or as base64-packed big-endian
//! int16 scaled by 1/100. [`MeteringDecoder`] turns both into a
//! [`MeteringFrame`] with a per-subscription sequence number.
//!
//! ## Paths
//!
//! Subscriptions take a [`PathPattern`]: `*` matches one segment, `**` any
//! number of segments.

pub mod envelope;
pub mod metering;
pub mod path;
pub mod value;

pub use envelope::{
    decode, decode_request, encode, Body, Envelope, EnvelopeError, Method, PathCategory,
    RemoteError, SubscribeAck, SubscribeTarget, APP_STATE_PATH, CONSOLE_INFO_PATH,
};
pub use metering::{
    decode_packed, encode_packed, unpack_int16_be, DecodeError, MeteringDecoder,
    MeteringEncoding, MeteringFrame, MeteringPayload, MeteringSamples, SAMPLE_SCALE,
};
pub use path::{PathPattern, PatternError};
pub use value::{AppState, ConsoleInfo, ParamUpdate, ParamValue, UnknownFormat, ValueFormat};
