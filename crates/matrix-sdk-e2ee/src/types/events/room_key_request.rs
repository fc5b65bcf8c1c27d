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

//! Types for `m.room_key_request` to-device events.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{EventType, ToDeviceEvent};
use crate::types::{
    deserialize_optional_curve_key, serialize_optional_curve_key, EventEncryptionAlgorithm,
};

/// The `m.room_key_request` to-device event.
pub type RoomKeyRequestEvent = ToDeviceEvent<RoomKeyRequestContent>;

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a new key request or a cancellation of a previous
    /// request.
    pub action: Action,
    /// Information about the requested key. Required when action is
    /// `request`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    /// ID of the device requesting the key.
    pub requesting_device_id: OwnedDeviceId,
    /// A random string uniquely identifying the request for a key.
    ///
    /// If the key is requested multiple times, it should be reused. It should
    /// also reused in order to cancel a request.
    pub request_id: OwnedTransactionId,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl RoomKeyRequestContent {
    /// Create a new content for a `m.room_key_request` event with the action
    /// set to request a room key with the given `RequestedKeyInfo`.
    pub fn new_request(
        info: RequestedKeyInfo,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: Action::Request,
            body: Some(info),
            requesting_device_id,
            request_id,
            other: BTreeMap::new(),
        }
    }

    /// Create a new content for a `m.room_key_request` event with the action
    /// set to cancel a room key request.
    pub fn new_cancellation(
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: Action::Cancellation,
            body: None,
            requesting_device_id,
            request_id,
            other: BTreeMap::new(),
        }
    }
}

impl EventType for RoomKeyRequestContent {
    const EVENT_TYPE: &'static str = "m.room_key_request";
}

/// The action of a key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Request a room key.
    #[serde(rename = "request")]
    Request,
    /// Cancel a previous room key request.
    #[serde(rename = "request_cancellation")]
    Cancellation,
}

/// Information about the room key being requested.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The encryption algorithm the requested key in this content is to be
    /// used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session
    /// originally.
    ///
    /// Deprecated, but still sent by most clients.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_curve_key",
        serialize_with = "serialize_optional_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_key: Option<Curve25519PublicKey>,
    /// The ID of the session that the key is for.
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// Create info for a `m.megolm.v1.aes-sha2` room key.
    pub fn new(
        room_id: OwnedRoomId,
        sender_key: Option<Curve25519PublicKey>,
        session_id: String,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            sender_key,
            session_id,
        }
    }

    /// A string identifying the requested key, usable as a database key.
    ///
    /// The deprecated sender key isn't part of it, the session id is unique
    /// on its own.
    pub fn as_key(&self) -> String {
        format!("keyRequest:{}:{}:{}", self.room_id, self.session_id, self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use serde_json::json;

    use super::{Action, RoomKeyRequestEvent};

    #[test]
    fn test_key_request_and_cancellation() -> Result<(), serde_json::Error> {
        let request = json!({
            "sender": "@alice:example.org",
            "content": {
                "action": "request",
                "body": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "room_id": "!Cuyf34gef24t:localhost",
                    "sender_key": "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU",
                    "session_id": "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ"
                },
                "request_id": "1495474790150.19",
                "requesting_device_id": "RJYKSTBOIE"
            },
            "type": "m.room_key_request"
        });

        let event: RoomKeyRequestEvent = serde_json::from_value(request.clone())?;
        assert_eq!(event.content.action, Action::Request);
        assert_let!(Some(info) = &event.content.body);
        assert_eq!(info.session_id, "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ");
        assert_eq!(serde_json::to_value(&event)?, request);

        let cancellation = json!({
            "sender": "@alice:example.org",
            "content": {
                "action": "request_cancellation",
                "request_id": "1495474790150.19",
                "requesting_device_id": "RJYKSTBOIE"
            },
            "type": "m.room_key_request"
        });

        let event: RoomKeyRequestEvent = serde_json::from_value(cancellation.clone())?;
        assert_eq!(event.content.action, Action::Cancellation);
        assert!(event.content.body.is_none());
        assert_eq!(serde_json::to_value(&event)?, cancellation);

        Ok(())
    }
}
