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

//! Module containing specialized event types that were decrypted using the Olm
//! protocol

use std::{collections::BTreeMap, fmt::Debug};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Ed25519PublicKey;

use super::{
    forwarded_room_key::ForwardedRoomKeyContent, from_value, room_key::RoomKeyContent, EventType,
};
use crate::types::{deserialize_ed25519_key, serialize_ed25519_key};

/// The content of an `m.dummy` event.
///
/// It carries nothing. We send one over an Olm session we force-created to
/// replace a wedged one, so that the other side learns about the new session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DummyEventContent {
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl EventType for DummyEventContent {
    const EVENT_TYPE: &'static str = "m.dummy";
}

/// An `m.dummy` event that was decrypted using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm
pub type DecryptedDummyEvent = DecryptedOlmV1Event<DummyEventContent>;

/// An `m.room_key` event that was decrypted using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm
pub type DecryptedRoomKeyEvent = DecryptedOlmV1Event<RoomKeyContent>;

/// An `m.forwarded_room_key` event that was decrypted using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm
pub type DecryptedForwardedRoomKeyEvent = DecryptedOlmV1Event<ForwardedRoomKeyContent>;

/// An enum over the various events that were decrypted using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm.
#[derive(Debug)]
pub enum AnyDecryptedOlmEvent {
    /// The `m.room_key` decrypted to-device event.
    RoomKey(DecryptedRoomKeyEvent),
    /// The `m.forwarded_room_key` decrypted to-device event.
    ForwardedRoomKey(DecryptedForwardedRoomKeyEvent),
    /// The `m.dummy` decrypted to-device event.
    Dummy(DecryptedDummyEvent),
    /// A decrypted to-device event of an unknown or custom type.
    Custom(Box<ToDeviceCustomEvent>),
}

impl AnyDecryptedOlmEvent {
    /// The sender of the event, as set by the sender of the event.
    pub fn sender(&self) -> &UserId {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.sender,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.sender,
            AnyDecryptedOlmEvent::Dummy(e) => &e.sender,
            AnyDecryptedOlmEvent::Custom(e) => &e.sender,
        }
    }

    /// The intended recipient of the event, as set by the sender of the event.
    pub fn recipient(&self) -> &UserId {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.recipient,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.recipient,
            AnyDecryptedOlmEvent::Dummy(e) => &e.recipient,
            AnyDecryptedOlmEvent::Custom(e) => &e.recipient,
        }
    }

    /// The sender's signing keys of the encrypted event.
    pub fn keys(&self) -> &OlmV1Keys {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.keys,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.keys,
            AnyDecryptedOlmEvent::Dummy(e) => &e.keys,
            AnyDecryptedOlmEvent::Custom(e) => &e.keys,
        }
    }

    /// The recipient's signing keys of the encrypted event.
    pub fn recipient_keys(&self) -> &OlmV1Keys {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.recipient_keys,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.recipient_keys,
            AnyDecryptedOlmEvent::Dummy(e) => &e.recipient_keys,
            AnyDecryptedOlmEvent::Custom(e) => &e.recipient_keys,
        }
    }

    /// The event type of the encrypted event.
    pub fn event_type(&self) -> &str {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => e.content.event_type(),
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => e.content.event_type(),
            AnyDecryptedOlmEvent::Dummy(e) => e.content.event_type(),
            AnyDecryptedOlmEvent::Custom(e) => &e.event_type,
        }
    }
}

/// An `m.olm.v1.curve25519-aes-sha2` decrypted to-device event.
#[derive(Clone, Debug, Deserialize)]
pub struct DecryptedOlmV1Event<C>
where
    C: EventType + Debug + Sized + Serialize,
{
    /// The sender of the event, as set by the sender of the event.
    pub sender: OwnedUserId,
    /// The device that sent the event, as set by the sender of the event.
    #[serde(default)]
    pub sender_device: Option<OwnedDeviceId>,
    /// The intended recipient of the event, as set by the sender of the event.
    pub recipient: OwnedUserId,
    /// The sender's signing keys of the encrypted event.
    pub keys: OlmV1Keys,
    /// The recipient's signing keys of the encrypted event.
    pub recipient_keys: OlmV1Keys,
    /// The content of the event.
    pub content: C,
}

impl<C: EventType + Debug + Sized + Serialize> DecryptedOlmV1Event<C> {
    /// Build the plaintext of an Olm encrypted event.
    pub fn new(
        sender: &UserId,
        sender_device: OwnedDeviceId,
        sender_key: Ed25519PublicKey,
        recipient: &UserId,
        recipient_key: Ed25519PublicKey,
        content: C,
    ) -> Self {
        Self {
            sender: sender.to_owned(),
            sender_device: Some(sender_device),
            recipient: recipient.to_owned(),
            keys: OlmV1Keys { ed25519: sender_key },
            recipient_keys: OlmV1Keys { ed25519: recipient_key },
            content,
        }
    }
}

impl<C: EventType + Debug + Sized + Serialize> Serialize for DecryptedOlmV1Event<C> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // The event type lives in `C`, put it back into the JSON.
        #[derive(Serialize)]
        struct Helper<'a, C: EventType + Debug + Sized + Serialize> {
            sender: &'a UserId,
            #[serde(skip_serializing_if = "Option::is_none")]
            sender_device: Option<&'a OwnedDeviceId>,
            recipient: &'a UserId,
            keys: &'a OlmV1Keys,
            recipient_keys: &'a OlmV1Keys,
            content: &'a C,
            #[serde(rename = "type")]
            event_type: &'a str,
        }

        Helper {
            sender: &self.sender,
            sender_device: self.sender_device.as_ref(),
            recipient: &self.recipient,
            keys: &self.keys,
            recipient_keys: &self.recipient_keys,
            content: &self.content,
            event_type: self.content.event_type(),
        }
        .serialize(serializer)
    }
}

/// A decrypted to-device event with an unknown type and content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceCustomEvent {
    /// The sender of the encrypted to-device event.
    pub sender: OwnedUserId,
    /// The recipient of the encrypted to-device event.
    pub recipient: OwnedUserId,
    /// The sender's signing keys of the encrypted event.
    pub keys: OlmV1Keys,
    /// The recipient's signing keys of the encrypted event.
    pub recipient_keys: OlmV1Keys,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    #[serde(default)]
    pub content: Value,
}

/// Public keys used for an m.olm.v1.curve25519-aes-sha2 event.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OlmV1Keys {
    /// The Ed25519 public key of the `m.olm.v1.curve25519-aes-sha2` keys.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

impl<'de> Deserialize<'de> for AnyDecryptedOlmEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let json = Value::deserialize(deserializer)?;
        let event_type = json.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match event_type {
            RoomKeyContent::EVENT_TYPE => AnyDecryptedOlmEvent::RoomKey(from_value(json)?),
            ForwardedRoomKeyContent::EVENT_TYPE => {
                AnyDecryptedOlmEvent::ForwardedRoomKey(from_value(json)?)
            }
            DummyEventContent::EVENT_TYPE => AnyDecryptedOlmEvent::Dummy(from_value(json)?),
            _ => AnyDecryptedOlmEvent::Custom(from_value(json)?),
        })
    }
}
