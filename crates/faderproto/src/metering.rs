//! Metering payloads and the decoder that turns them into canonical frames.
//!
//! Two wire encodings exist for the same data:
//!
//! - **json**: `samples` is an array (or ordered object) of already-scaled floats
//! - **binary**: `data` is base64; the decoded bytes are signed 16-bit
//!   big-endian integers, one per channel slot, scaled by 1/100
//!
//! ```text
//! 0x04 0xD2  →  1234  →  12.34
//! 0xFF 0x9C  →  -100  →  -1.00
//! ```
//!
//! The encoding of a stream is fixed when the subscription is acknowledged.
//! A frame is never reinterpreted because of its shape.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Divisor from packed int16 to canonical float
pub const SAMPLE_SCALE: f32 = 100.0;

/// Bytes per packed sample
pub const PACKED_SAMPLE_BYTES: usize = 2;

/// Metering wire encoding, declared per subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeteringEncoding {
    Json,
    Binary,
}

impl MeteringEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeteringEncoding::Json => "json",
            MeteringEncoding::Binary => "binary",
        }
    }
}

impl fmt::Display for MeteringEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeteringEncoding {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(MeteringEncoding::Json),
            "binary" => Ok(MeteringEncoding::Binary),
            other => Err(DecodeError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Errors decoding a single metering frame. The stream survives all of them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64 in metering payload: {0}")]
    InvalidBase64(String),
    #[error("Packed metering payload has odd length {0} (must be a multiple of 2)")]
    OddLength(usize),
    #[error("Unknown metering encoding marker: {0:?}")]
    UnknownEncoding(String),
    #[error("Metering frame shape is {received} but subscription declared {declared}")]
    EncodingMismatch {
        declared: MeteringEncoding,
        received: MeteringEncoding,
    },
    #[error("Metering sample {index} is not a number")]
    NonNumericSample { index: usize },
}

/// Raw sample container as it appeared on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MeteringSamples {
    /// JSON-encoded, already scaled
    Scaled(Vec<f64>),
    /// base64 of packed big-endian int16
    Packed(String),
}

impl MeteringSamples {
    /// The encoding this container shape belongs to.
    pub fn shape(&self) -> MeteringEncoding {
        match self {
            MeteringSamples::Scaled(_) => MeteringEncoding::Json,
            MeteringSamples::Packed(_) => MeteringEncoding::Binary,
        }
    }
}

/// Body of a metering PUSH before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringPayload {
    pub subscription_id: String,
    /// Optional explicit marker carried by the frame, kept raw so unknown
    /// markers can be reported.
    pub encoding: Option<String>,
    pub samples: MeteringSamples,
}

impl MeteringPayload {
    pub fn json(subscription_id: impl Into<String>, samples: Vec<f64>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            encoding: None,
            samples: MeteringSamples::Scaled(samples),
        }
    }

    pub fn binary(subscription_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            encoding: None,
            samples: MeteringSamples::Packed(data.into()),
        }
    }

    /// Parse the metering fields out of a push body object.
    ///
    /// Returns `None` when the object isn't metering-shaped (no
    /// `subscriptionId`, or neither `samples` nor `data`).
    pub(crate) fn from_json(
        body: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Result<Self, DecodeError>> {
        let subscription_id = body.get("subscriptionId")?.as_str()?.to_string();
        let encoding = body
            .get("encoding")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let samples = if let Some(samples) = body.get("samples") {
            match scaled_samples(samples) {
                Ok(s) => MeteringSamples::Scaled(s),
                Err(e) => return Some(Err(e)),
            }
        } else if let Some(data) = body.get("data") {
            match data.as_str() {
                Some(d) => MeteringSamples::Packed(d.to_string()),
                None => return Some(Err(DecodeError::InvalidBase64("data is not a string".into()))),
            }
        } else {
            return None;
        };

        Some(Ok(Self {
            subscription_id,
            encoding,
            samples,
        }))
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "subscriptionId".into(),
            serde_json::Value::String(self.subscription_id.clone()),
        );
        if let Some(enc) = &self.encoding {
            obj.insert("encoding".into(), serde_json::Value::String(enc.clone()));
        }
        match &self.samples {
            MeteringSamples::Scaled(s) => {
                obj.insert("samples".into(), serde_json::json!(s));
            }
            MeteringSamples::Packed(d) => {
                obj.insert("data".into(), serde_json::Value::String(d.clone()));
            }
        }
        serde_json::Value::Object(obj)
    }
}

/// Accept `[1.0, 2.0]` or `{"l": 1.0, "r": 2.0}` (object order preserved).
fn scaled_samples(value: &serde_json::Value) -> Result<Vec<f64>, DecodeError> {
    let items: Vec<&serde_json::Value> = match value {
        serde_json::Value::Array(a) => a.iter().collect(),
        serde_json::Value::Object(o) => o.values().collect(),
        _ => return Err(DecodeError::NonNumericSample { index: 0 }),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, v)| v.as_f64().ok_or(DecodeError::NonNumericSample { index }))
        .collect()
}

/// Canonical metering frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringFrame {
    pub subscription_id: String,
    /// Per-subscription counter; a gap means frames were dropped
    pub sequence: u64,
    pub channel_samples: Vec<f32>,
    pub source_encoding: MeteringEncoding,
}

impl MeteringFrame {
    pub fn channel_count(&self) -> usize {
        self.channel_samples.len()
    }
}

/// Interpret bytes as big-endian int16 samples scaled by 1/100.
pub fn unpack_int16_be(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % PACKED_SAMPLE_BYTES != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(PACKED_SAMPLE_BYTES)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32 / SAMPLE_SCALE)
        .collect())
}

/// base64 → packed int16 → floats.
pub fn decode_packed(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
    unpack_int16_be(&bytes)
}

/// Inverse of [`decode_packed`], rounding to the nearest hundredth and
/// saturating at the int16 range. Used by console-side peers and tests.
pub fn encode_packed(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * PACKED_SAMPLE_BYTES);
    for s in samples {
        let raw = (s * SAMPLE_SCALE)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&raw.to_be_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Stateful decoder for one metering subscription.
#[derive(Debug, Clone)]
pub struct MeteringDecoder {
    subscription_id: String,
    encoding: MeteringEncoding,
    next_sequence: u64,
}

impl MeteringDecoder {
    pub fn new(subscription_id: impl Into<String>, encoding: MeteringEncoding) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            encoding,
            next_sequence: 0,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn encoding(&self) -> MeteringEncoding {
        self.encoding
    }

    /// Rebind to a new server subscription id (after a reconnect replay).
    /// The sequence keeps counting so consumers see one continuous stream.
    pub fn rebind(&mut self, subscription_id: impl Into<String>, encoding: MeteringEncoding) {
        self.subscription_id = subscription_id.into();
        self.encoding = encoding;
    }

    /// Decode one payload. Every call consumes a sequence number, including
    /// calls that fail, so a dropped frame shows up as a gap.
    pub fn decode(&mut self, payload: &MeteringPayload) -> Result<MeteringFrame, DecodeError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Some(marker) = &payload.encoding {
            let marked: MeteringEncoding = marker.parse()?;
            if marked != self.encoding {
                return Err(DecodeError::EncodingMismatch {
                    declared: self.encoding,
                    received: marked,
                });
            }
        }

        let received = payload.samples.shape();
        if received != self.encoding {
            return Err(DecodeError::EncodingMismatch {
                declared: self.encoding,
                received,
            });
        }

        let channel_samples = match &payload.samples {
            MeteringSamples::Scaled(s) => s.iter().map(|v| *v as f32).collect(),
            MeteringSamples::Packed(d) => decode_packed(d)?,
        };

        Ok(MeteringFrame {
            subscription_id: self.subscription_id.clone(),
            sequence,
            channel_samples,
            source_encoding: self.encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn packed_reference_values() {
        let samples = unpack_int16_be(&[0x04, 0xD2]).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(close(samples[0], 12.34), "got {}", samples[0]);

        let minus_hundred = (-100i16).to_be_bytes();
        let samples = unpack_int16_be(&minus_hundred).unwrap();
        assert!(close(samples[0], -1.0), "got {}", samples[0]);
    }

    #[test]
    fn byte_order_is_big_endian() {
        // Little-endian reading of these bytes would give 0xD204
        let samples = unpack_int16_be(&[0x04, 0xD2, 0x80, 0x00]).unwrap();
        assert!(close(samples[0], 12.34));
        assert!(close(samples[1], -327.68));
    }

    #[test]
    fn odd_length_is_rejected() {
        assert_eq!(unpack_int16_be(&[0x04, 0xD2, 0x01]), Err(DecodeError::OddLength(3)));
        // "BNIB" is base64 for 0x04 0xD2 0x01
        assert_eq!(decode_packed("BNIB"), Err(DecodeError::OddLength(3)));
    }

    #[test]
    fn bad_base64_is_rejected() {
        assert!(matches!(decode_packed("not base64!"), Err(DecodeError::InvalidBase64(_))));
    }

    #[test]
    fn packing_is_the_inverse_of_unpacking() {
        let encoded = encode_packed(&[12.34, -1.0, 0.0]);
        let decoded = decode_packed(&encoded).unwrap();
        assert!(close(decoded[0], 12.34));
        assert!(close(decoded[1], -1.0));
        assert!(close(decoded[2], 0.0));
        assert_eq!(encode_packed(&[12.34]), "BNI=");
    }

    #[test]
    fn decoder_counts_every_frame() {
        let mut dec = MeteringDecoder::new("m1", MeteringEncoding::Binary);

        let ok = dec.decode(&MeteringPayload::binary("m1", "BNI=")).unwrap();
        assert_eq!(ok.sequence, 0);
        assert_eq!(ok.source_encoding, MeteringEncoding::Binary);

        assert!(dec.decode(&MeteringPayload::binary("m1", "BNIB")).is_err());

        let next = dec.decode(&MeteringPayload::binary("m1", "BNI=")).unwrap();
        assert_eq!(next.sequence, 2, "the failed frame leaves a visible gap");
    }

    #[test]
    fn decoder_refuses_shape_mismatch() {
        let mut dec = MeteringDecoder::new("m1", MeteringEncoding::Binary);
        let err = dec
            .decode(&MeteringPayload::json("m1", vec![1.0, 2.0]))
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::EncodingMismatch {
                declared: MeteringEncoding::Binary,
                received: MeteringEncoding::Json,
            }
        );
    }

    #[test]
    fn decoder_checks_explicit_marker() {
        let mut dec = MeteringDecoder::new("m1", MeteringEncoding::Json);
        let mut payload = MeteringPayload::json("m1", vec![1.0]);
        payload.encoding = Some("ulaw".into());
        assert_eq!(
            dec.decode(&payload),
            Err(DecodeError::UnknownEncoding("ulaw".into()))
        );

        payload.encoding = Some("json".into());
        assert!(dec.decode(&payload).is_ok());
    }

    #[test]
    fn json_samples_keep_order_and_count() {
        let mut dec = MeteringDecoder::new("m2", MeteringEncoding::Json);
        let frame = dec
            .decode(&MeteringPayload::json("m2", vec![-60.0, -12.5, 0.0, -3.25]))
            .unwrap();
        assert_eq!(frame.channel_samples, vec![-60.0, -12.5, 0.0, -3.25]);
    }

    #[test]
    fn object_samples_keep_wire_order() {
        let body: serde_json::Value =
            serde_json::from_str(r#"{"subscriptionId":"m3","samples":{"r":-6.0,"l":-3.0,"c":-9.0}}"#)
                .unwrap();
        let payload = MeteringPayload::from_json(body.as_object().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(payload.samples, MeteringSamples::Scaled(vec![-6.0, -3.0, -9.0]));
    }
}
