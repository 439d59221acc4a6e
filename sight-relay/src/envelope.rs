//! The `{to, payload}` unit exchanged on the relay topic.
//!
//! Untyped JSON stops here: callers hand in a [`Value`] and get back a typed
//! [`Envelope`] or an [`EnvelopeError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sight_identity::Did;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("message is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `to` field")]
    MissingRecipient,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: Did,
    /// `null` when the sender omitted it.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Addresses a local request to its own `to` field. The whole request,
    /// `to` included, becomes the payload.
    pub fn wrap(request: Value) -> Result<Self, EnvelopeError> {
        let to = recipient(as_object(&request)?)?;
        Ok(Self {
            to,
            payload: request,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut value: Value = serde_json::from_slice(bytes)?;
        let to = recipient(as_object(&value)?)?;
        let payload = value
            .as_object_mut()
            .and_then(|object| object.remove("payload"))
            .unwrap_or(Value::Null);
        Ok(Self { to, payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn is_for(&self, did: &Did) -> bool {
        self.to == *did
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, EnvelopeError> {
    value.as_object().ok_or(EnvelopeError::NotAnObject)
}

fn recipient(object: &Map<String, Value>) -> Result<Did, EnvelopeError> {
    object
        .get("to")
        .and_then(Value::as_str)
        .map(Did::from)
        .ok_or(EnvelopeError::MissingRecipient)
}
