//! `{channel, payload}` framing shared by every message on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A JSON object payload. Envelopes never carry scalars or arrays.
pub type Payload = Map<String, Value>;

/// Logical channel of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Bridge-level requests and replies (directory, locks, sessions).
    Control,
    /// Opaque agent commands, responses and events.
    Data,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::Data => "data",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("envelope is missing the `channel` field")]
    MissingChannel,

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("envelope `payload` must be a JSON object")]
    PayloadNotObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(channel: Channel, payload: Payload) -> Self {
        Self { channel, payload }
    }

    /// Serialize `payload` into an envelope on `channel`.
    pub fn encode<T: Serialize>(channel: Channel, payload: &T) -> Result<Self, EnvelopeError> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => Ok(Self::new(channel, map)),
            _ => Err(EnvelopeError::PayloadNotObject),
        }
    }

    pub fn control<T: Serialize>(payload: &T) -> Result<Self, EnvelopeError> {
        Self::encode(Channel::Control, payload)
    }

    pub fn data(payload: Payload) -> Self {
        Self::new(Channel::Data, payload)
    }

    /// Parse a raw text frame.
    ///
    /// Field-by-field validation gives callers a precise reason to put in the
    /// `malformed_envelope` error they send back.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let channel = match object.remove("channel") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingChannel),
            Some(Value::String(name)) => match name.as_str() {
                "control" => Channel::Control,
                "data" => Channel::Data,
                _ => return Err(EnvelopeError::UnknownChannel(name)),
            },
            Some(other) => return Err(EnvelopeError::UnknownChannel(other.to_string())),
        };

        match object.remove("payload") {
            Some(Value::Object(payload)) => Ok(Self::new(channel, payload)),
            _ => Err(EnvelopeError::PayloadNotObject),
        }
    }

    /// Decode the payload into a typed message.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(Value::Object(self.payload.clone()))
    }

    /// The payload's `type` discriminator, if any.
    pub fn payload_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> String {
        // A struct of an enum and a string-keyed map always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
