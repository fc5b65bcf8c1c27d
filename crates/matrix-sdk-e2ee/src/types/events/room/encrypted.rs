// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Types for the `m.room.encrypted` room and to-device events.

use std::collections::BTreeMap;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::EventError,
    types::{
        deserialize_curve_key, deserialize_optional_curve_key, events::EventType,
        serialize_curve_key, serialize_optional_curve_key, EventEncryptionAlgorithm,
    },
};

/// An `m.room.encrypted` room event, as found in a room timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The unique ID of the event.
    pub event_id: OwnedEventId,
    /// Timestamp on the originating homeserver when this event was sent.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The content of the event.
    pub content: RoomEncryptedEventContent,
    /// Information about the event that isn't signed or encrypted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unsigned: BTreeMap<String, Value>,
}

/// The content of an `m.room.encrypted` room event, encrypted with
/// `m.megolm.v1.aes-sha2`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomEncryptedEventContent {
    /// The encryption algorithm that was used.
    pub algorithm: EventEncryptionAlgorithm,
    /// The base64 encoded Megolm message.
    pub ciphertext: String,
    /// The ID of the session used to encrypt the message.
    pub session_id: String,
    /// The Curve25519 key of the sender.
    ///
    /// Deprecated, but still sent by most clients.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_curve_key",
        serialize_with = "serialize_optional_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_key: Option<Curve25519PublicKey>,
    /// The ID of the sending device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
    /// The relation of the event, kept in the clear so servers can aggregate
    /// it.
    #[serde(rename = "m.relates_to", default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Value>,
}

impl RoomEncryptedEventContent {
    /// Parse the Megolm message this content carries.
    pub fn megolm_message(&self) -> Result<MegolmMessage, EventError> {
        if self.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(EventError::UnsupportedAlgorithm);
        }

        MegolmMessage::from_base64(&self.ciphertext).map_err(|_| EventError::MalformedCiphertext)
    }
}

impl EventType for RoomEncryptedEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

/// One Olm message of an `m.room.encrypted` to-device event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// `0` for a pre-key message, `1` for a normal message.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// The base64 encoded message.
    pub body: String,
}

impl From<OlmMessage> for OlmCiphertext {
    fn from(message: OlmMessage) -> Self {
        let (message_type, body) = message.to_parts();
        Self { message_type, body: vodozemac::base64_encode(body) }
    }
}

/// The content of an `m.room.encrypted` to-device event, encrypted with
/// `m.olm.v1.curve25519-aes-sha2`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEncryptedEventContent {
    /// The encryption algorithm that was used.
    pub algorithm: EventEncryptionAlgorithm,
    /// The Curve25519 key of the sender.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The encrypted messages, keyed by the Curve25519 identity key of each
    /// recipient device.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

impl ToDeviceEncryptedEventContent {
    /// Wrap a single Olm message for the device with the given identity key.
    pub fn new(
        sender_key: Curve25519PublicKey,
        recipient_key: Curve25519PublicKey,
        message: OlmMessage,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key,
            ciphertext: BTreeMap::from([(recipient_key.to_base64(), message.into())]),
        }
    }

    /// Get the Olm message that was encrypted for the device with the given
    /// identity key.
    pub fn message_for(
        &self,
        own_identity_key: Curve25519PublicKey,
    ) -> Result<OlmMessage, EventError> {
        if self.algorithm != EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 {
            return Err(EventError::UnsupportedAlgorithm);
        }

        let ciphertext = self
            .ciphertext
            .get(&own_identity_key.to_base64())
            .ok_or(EventError::MissingCiphertext)?;

        let body = vodozemac::base64_decode(&ciphertext.body)
            .map_err(|_| EventError::MalformedCiphertext)?;

        OlmMessage::from_parts(ciphertext.message_type, &body)
            .map_err(|_| EventError::MalformedCiphertext)
    }
}

impl EventType for ToDeviceEncryptedEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}
