//! Envelope codec.
//!
//! Every message on the console connection is one JSON text frame:
//!
//! ```text
//! { "id": 7, "path": "ch.0.mix.lvl", "method": "SET", "body": { "format": "norm", "value": 0.8 } }
//! ```
//!
//! `id` correlates a reply with its request and is absent on PUSH frames.
//! `body` is untyped on the wire only; [`Body`] is the typed form, chosen by
//! method, direction and path category (see [`PathCategory`]).
//!
//! Decoding never panics. Anything malformed comes back as an
//! [`EnvelopeError`] so the transport can drop one frame and keep going.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::metering::{DecodeError, MeteringEncoding, MeteringPayload};
use crate::value::{AppState, ConsoleInfo, ParamUpdate, ParamValue, ValueFormat};

/// Reserved path carrying [`ConsoleInfo`]
pub const CONSOLE_INFO_PATH: &str = "console.info";

/// Reserved path carrying [`AppState`]
pub const APP_STATE_PATH: &str = "app.state";

/// Envelope method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Set,
    Subscribe,
    Unsubscribe,
    /// Unsolicited server → client update
    Push,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Subscribe => "SUBSCRIBE",
            Method::Unsubscribe => "UNSUBSCRIBE",
            Method::Push => "PUSH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "SET" => Ok(Method::Set),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            "UNSUBSCRIBE" => Ok(Method::Unsubscribe),
            "PUSH" => Ok(Method::Push),
            other => Err(EnvelopeError::UnknownMethod(other.to_string())),
        }
    }
}

/// Which decode rules apply to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCategory {
    ConsoleInfo,
    AppState,
    Parameter,
}

impl PathCategory {
    pub fn of(path: &str) -> Self {
        match path {
            CONSOLE_INFO_PATH => PathCategory::ConsoleInfo,
            APP_STATE_PATH => PathCategory::AppState,
            _ => PathCategory::Parameter,
        }
    }
}

/// What a SUBSCRIBE request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeTarget {
    /// Parameter changes in the given format
    Parameter { format: ValueFormat },
    /// Metering stream in the given encoding
    Metering { encoding: MeteringEncoding },
}

/// Server acknowledgement of a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeAck {
    pub subscription_id: String,
    /// Authoritative encoding for metering subscriptions
    pub encoding: Option<MeteringEncoding>,
    /// Current value of every path the pattern matched
    pub values: Vec<ParamUpdate>,
}

impl SubscribeAck {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            encoding: None,
            values: Vec::new(),
        }
    }
}

/// Error reported by the console in a reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Typed envelope body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    /// GET request
    Query { format: Option<ValueFormat> },
    /// SET request
    Assign { format: ValueFormat, value: ParamValue },
    /// SUBSCRIBE request
    Subscribe(SubscribeTarget),
    /// UNSUBSCRIBE request
    Unsubscribe { subscription_id: String },
    /// Parameter value (GET reply, SET echo, PUSH)
    Value { format: ValueFormat, value: ParamValue },
    /// SUBSCRIBE reply
    Subscribed(SubscribeAck),
    /// Metering PUSH, still encoded
    Metering(MeteringPayload),
    ConsoleInfo(ConsoleInfo),
    AppState(AppState),
    /// Bare acknowledgement
    Ack,
    Error(RemoteError),
}

impl Body {
    fn kind(&self) -> &'static str {
        match self {
            Body::Empty => "empty",
            Body::Query { .. } => "query",
            Body::Assign { .. } => "assign",
            Body::Subscribe(_) => "subscribe",
            Body::Unsubscribe { .. } => "unsubscribe",
            Body::Value { .. } => "value",
            Body::Subscribed(_) => "subscribed",
            Body::Metering(_) => "metering",
            Body::ConsoleInfo(_) => "console_info",
            Body::AppState(_) => "app_state",
            Body::Ack => "ack",
            Body::Error(_) => "error",
        }
    }

    /// Whether this body is allowed with `method`, in either direction.
    fn fits(&self, method: Method) -> bool {
        match method {
            Method::Get => matches!(
                self,
                Body::Query { .. }
                    | Body::Value { .. }
                    | Body::ConsoleInfo(_)
                    | Body::AppState(_)
                    | Body::Error(_)
            ),
            Method::Set => matches!(
                self,
                Body::Assign { .. } | Body::Value { .. } | Body::Ack | Body::Error(_)
            ),
            Method::Subscribe => {
                matches!(self, Body::Subscribe(_) | Body::Subscribed(_) | Body::Error(_))
            }
            Method::Unsubscribe => {
                matches!(self, Body::Unsubscribe { .. } | Body::Ack | Body::Error(_))
            }
            Method::Push => matches!(
                self,
                Body::Value { .. } | Body::Metering(_) | Body::ConsoleInfo(_) | Body::AppState(_)
            ),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Body::Empty | Body::Ack => json!({}),
            Body::Query { format } => match format {
                Some(f) => json!({ "format": f }),
                None => json!({}),
            },
            Body::Assign { format, value } | Body::Value { format, value } => {
                json!({ "format": format, "value": value })
            }
            Body::Subscribe(SubscribeTarget::Parameter { format }) => json!({ "format": format }),
            Body::Subscribe(SubscribeTarget::Metering { encoding }) => {
                json!({ "encoding": encoding })
            }
            Body::Unsubscribe { subscription_id } => json!({ "subscriptionId": subscription_id }),
            Body::Subscribed(ack) => {
                let mut obj = Map::new();
                obj.insert("subscriptionId".into(), json!(ack.subscription_id));
                if let Some(enc) = ack.encoding {
                    obj.insert("encoding".into(), json!(enc));
                }
                if !ack.values.is_empty() {
                    obj.insert("values".into(), json!(ack.values));
                }
                Value::Object(obj)
            }
            Body::Metering(payload) => payload.to_json(),
            Body::ConsoleInfo(info) => json!(info),
            Body::AppState(state) => json!(state),
            Body::Error(err) => json!({ "error": err }),
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation token; `None` only on PUSH
    pub id: Option<u64>,
    pub path: String,
    pub method: Method,
    pub body: Body,
}

impl Envelope {
    pub fn new(method: Method, path: impl Into<String>, body: Body) -> Self {
        Self {
            id: None,
            path: path.into(),
            method,
            body,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn get(path: impl Into<String>, format: Option<ValueFormat>) -> Self {
        Self::new(Method::Get, path, Body::Query { format })
    }

    pub fn set(path: impl Into<String>, format: ValueFormat, value: impl Into<ParamValue>) -> Self {
        Self::new(
            Method::Set,
            path,
            Body::Assign {
                format,
                value: value.into(),
            },
        )
    }

    pub fn subscribe(pattern: impl Into<String>, target: SubscribeTarget) -> Self {
        Self::new(Method::Subscribe, pattern, Body::Subscribe(target))
    }

    pub fn unsubscribe(pattern: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self::new(
            Method::Unsubscribe,
            pattern,
            Body::Unsubscribe {
                subscription_id: subscription_id.into(),
            },
        )
    }

    pub fn push(path: impl Into<String>, body: Body) -> Self {
        Self::new(Method::Push, path, body)
    }

    /// Build the reply to `request`: same id, path and method.
    pub fn reply_to(request: &Envelope, body: Body) -> Self {
        Self {
            id: request.id,
            path: request.path.clone(),
            method: request.method,
            body,
        }
    }

    pub fn is_push(&self) -> bool {
        self.method == Method::Push
    }

    /// Serialize to wire text.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        encode(self)
    }
}

/// Codec errors. Each one costs a single frame, never the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope JSON: {0}")]
    Json(String),
    #[error("Envelope path is empty")]
    EmptyPath,
    #[error("Unknown method: {0:?}")]
    UnknownMethod(String),
    #[error("{method} envelope is missing its correlation id")]
    MissingId { method: Method },
    #[error("{method} envelope on {path:?} has an invalid body: {reason}")]
    BodyShape {
        method: Method,
        path: String,
        reason: String,
    },
    #[error("Malformed metering payload: {0}")]
    Metering(#[from] DecodeError),
}

impl EnvelopeError {
    fn shape(method: Method, path: &str, reason: impl Into<String>) -> Self {
        EnvelopeError::BodyShape {
            method,
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    path: String,
    method: String,
    #[serde(default)]
    body: Value,
}

/// Encode an envelope to wire text after validating path and body shape.
pub fn encode(envelope: &Envelope) -> Result<String, EnvelopeError> {
    if envelope.path.is_empty() {
        return Err(EnvelopeError::EmptyPath);
    }
    if !envelope.body.fits(envelope.method) {
        return Err(EnvelopeError::shape(
            envelope.method,
            &envelope.path,
            format!("{} body not allowed", envelope.body.kind()),
        ));
    }
    let wire = WireEnvelope {
        id: envelope.id,
        path: envelope.path.clone(),
        method: envelope.method.as_str().to_string(),
        body: envelope.body.to_json(),
    };
    serde_json::to_string(&wire).map_err(|e| EnvelopeError::Json(e.to_string()))
}

/// Decode a server → client frame (reply or push).
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let (id, path, method, body) = parse_wire(bytes)?;

    if method != Method::Push && id.is_none() {
        return Err(EnvelopeError::MissingId { method });
    }

    let body = decode_inbound_body(method, &path, body)?;
    Ok(Envelope {
        id,
        path,
        method,
        body,
    })
}

/// Decode a client → server frame (request).
pub fn decode_request(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let (id, path, method, body) = parse_wire(bytes)?;

    if method == Method::Push {
        return Err(EnvelopeError::shape(method, &path, "clients never push"));
    }
    if id.is_none() {
        return Err(EnvelopeError::MissingId { method });
    }

    let body = decode_request_body(method, &path, body)?;
    Ok(Envelope {
        id,
        path,
        method,
        body,
    })
}

fn parse_wire(bytes: &[u8]) -> Result<(Option<u64>, String, Method, Value), EnvelopeError> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    if wire.path.is_empty() {
        return Err(EnvelopeError::EmptyPath);
    }
    let method: Method = wire.method.parse()?;
    Ok((wire.id, wire.path, method, wire.body))
}

fn body_object(method: Method, path: &str, body: Value) -> Result<Map<String, Value>, EnvelopeError> {
    match body {
        Value::Object(obj) => Ok(obj),
        Value::Null => Ok(Map::new()),
        other => Err(EnvelopeError::shape(
            method,
            path,
            format!("expected an object, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn field<T: serde::de::DeserializeOwned>(
    obj: &Map<String, Value>,
    name: &str,
    method: Method,
    path: &str,
) -> Result<T, EnvelopeError> {
    let v = obj
        .get(name)
        .ok_or_else(|| EnvelopeError::shape(method, path, format!("missing {:?}", name)))?;
    serde_json::from_value(v.clone())
        .map_err(|e| EnvelopeError::shape(method, path, format!("bad {:?}: {}", name, e)))
}

fn optional_field<T: serde::de::DeserializeOwned>(
    obj: &Map<String, Value>,
    name: &str,
    method: Method,
    path: &str,
) -> Result<Option<T>, EnvelopeError> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field(obj, name, method, path).map(Some),
    }
}

fn decode_value(obj: &Map<String, Value>, method: Method, path: &str) -> Result<Body, EnvelopeError> {
    Ok(Body::Value {
        format: field(obj, "format", method, path)?,
        value: field(obj, "value", method, path)?,
    })
}

fn decode_category(
    obj: Map<String, Value>,
    method: Method,
    path: &str,
) -> Result<Option<Body>, EnvelopeError> {
    match PathCategory::of(path) {
        PathCategory::ConsoleInfo => serde_json::from_value(Value::Object(obj))
            .map(|info| Some(Body::ConsoleInfo(info)))
            .map_err(|e| EnvelopeError::shape(method, path, e.to_string())),
        PathCategory::AppState => serde_json::from_value(Value::Object(obj))
            .map(|state| Some(Body::AppState(state)))
            .map_err(|e| EnvelopeError::shape(method, path, e.to_string())),
        PathCategory::Parameter => Ok(None),
    }
}

fn decode_inbound_body(method: Method, path: &str, body: Value) -> Result<Body, EnvelopeError> {
    let obj = body_object(method, path, body)?;

    if method != Method::Push {
        if let Some(err) = obj.get("error") {
            let err: RemoteError = serde_json::from_value(err.clone())
                .map_err(|e| EnvelopeError::shape(method, path, format!("bad error: {}", e)))?;
            return Ok(Body::Error(err));
        }
    }

    match method {
        Method::Get => match decode_category(obj.clone(), method, path)? {
            Some(body) => Ok(body),
            None => decode_value(&obj, method, path),
        },
        Method::Set => {
            if obj.contains_key("value") {
                decode_value(&obj, method, path)
            } else {
                Ok(Body::Ack)
            }
        }
        Method::Subscribe => {
            let encoding = match obj.get("encoding").and_then(Value::as_str) {
                Some(marker) => Some(marker.parse::<MeteringEncoding>()?),
                None => None,
            };
            Ok(Body::Subscribed(SubscribeAck {
                subscription_id: field(&obj, "subscriptionId", method, path)?,
                encoding,
                values: optional_field(&obj, "values", method, path)?.unwrap_or_default(),
            }))
        }
        Method::Unsubscribe => Ok(Body::Ack),
        Method::Push => {
            if let Some(body) = decode_category(obj.clone(), method, path)? {
                return Ok(body);
            }
            if let Some(metering) = MeteringPayload::from_json(&obj) {
                return Ok(Body::Metering(metering?));
            }
            decode_value(&obj, method, path)
        }
    }
}

fn decode_request_body(method: Method, path: &str, body: Value) -> Result<Body, EnvelopeError> {
    let obj = body_object(method, path, body)?;

    match method {
        Method::Get => Ok(Body::Query {
            format: optional_field(&obj, "format", method, path)?,
        }),
        Method::Set => Ok(Body::Assign {
            format: field(&obj, "format", method, path)?,
            value: field(&obj, "value", method, path)?,
        }),
        Method::Subscribe => {
            let format: Option<ValueFormat> = optional_field(&obj, "format", method, path)?;
            let encoding = match obj.get("encoding").and_then(Value::as_str) {
                Some(marker) => Some(marker.parse::<MeteringEncoding>()?),
                None => None,
            };
            match (format, encoding) {
                (Some(format), None) => Ok(Body::Subscribe(SubscribeTarget::Parameter { format })),
                (None, Some(encoding)) => {
                    Ok(Body::Subscribe(SubscribeTarget::Metering { encoding }))
                }
                (Some(_), Some(_)) => Err(EnvelopeError::shape(
                    method,
                    path,
                    "format and encoding are mutually exclusive",
                )),
                (None, None) => Err(EnvelopeError::shape(
                    method,
                    path,
                    "missing \"format\" or \"encoding\"",
                )),
            }
        }
        Method::Unsubscribe => Ok(Body::Unsubscribe {
            subscription_id: field(&obj, "subscriptionId", method, path)?,
        }),
        Method::Push => Err(EnvelopeError::shape(method, path, "clients never push")),
    }
}
