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

//! Types for the `m.room_key.withheld` events.

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedDeviceId, OwnedRoomId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{EventType, ToDeviceEvent};
use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// The `m.room_key.withheld` to-device event.
pub type RoomKeyWithheldEvent = ToDeviceEvent<RoomKeyWithheldContent>;

/// The `m.room_key.withheld` event content.
///
/// Devices that purposely do not send megolm keys to a device may instead send
/// an m.room_key.withheld event as a to-device message to the device to
/// indicate that it should not expect to receive keys for the message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyWithheldContent {
    /// The encryption algorithm of the withheld session.
    pub algorithm: EventEncryptionAlgorithm,
    /// A machine-readable code for why the key was not sent.
    pub code: WithheldCode,
    /// A human-readable reason for why the key was not sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The room where the key is used. Absent for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// The ID of the session. Absent for `m.no_olm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The device curve25519 key of the session creator.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The device ID of the device sending the withheld message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_device: Option<OwnedDeviceId>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl RoomKeyWithheldContent {
    /// Creates a withheld content for the given megolm session.
    ///
    /// `m.no_olm` notices are not about a single session, the room and
    /// session ids are left out for them.
    pub fn new(
        code: WithheldCode,
        room_id: OwnedRoomId,
        session_id: String,
        sender_key: Curve25519PublicKey,
        from_device: OwnedDeviceId,
    ) -> Self {
        let (room_id, session_id) = if code == WithheldCode::NoOlm {
            (None, None)
        } else {
            (Some(room_id), Some(session_id))
        };

        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            reason: Some(code.to_string()),
            code,
            room_id,
            session_id,
            sender_key,
            from_device: Some(from_device),
            other: BTreeMap::new(),
        }
    }
}

impl EventType for RoomKeyWithheldContent {
    const EVENT_TYPE: &'static str = "m.room_key.withheld";
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomKeyWithheldContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKeyWithheldContent")
            .field("code", &self.code)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .field("from_device", &self.from_device)
            .finish_non_exhaustive()
    }
}

/// A machine-readable code for why the megolm key was not sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WithheldCode {
    /// the user/device was blacklisted.
    Blacklisted,

    /// the user/devices is unverified.
    Unverified,

    /// The user/device is not allowed have the key. For example, this would
    /// usually be sent in response to a key request if the user was not in
    /// the room when the message was sent.
    Unauthorised,

    /// Sent in reply to a key request if the device that the key is requested
    /// from does not have the requested key.
    Unavailable,

    /// An olm session could not be established.
    /// This may happen, for example, if the sender was unable to obtain a
    /// one-time key from the recipient.
    NoOlm,

    /// A code we don't know about.
    Custom(String),
}

impl WithheldCode {
    /// The code as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::Custom(c) => c,
        }
    }
}

impl From<&str> for WithheldCode {
    fn from(code: &str) -> Self {
        match code {
            "m.blacklisted" => WithheldCode::Blacklisted,
            "m.unverified" => WithheldCode::Unverified,
            "m.unauthorised" => WithheldCode::Unauthorised,
            "m.unavailable" => WithheldCode::Unavailable,
            "m.no_olm" => WithheldCode::NoOlm,
            other => WithheldCode::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
            WithheldCode::Custom(c) => c,
        };

        f.write_str(string)
    }
}

impl Serialize for WithheldCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WithheldCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = String::deserialize(deserializer)?;
        Ok(code.as_str().into())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id};
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::{RoomKeyWithheldContent, RoomKeyWithheldEvent, WithheldCode};

    #[test]
    fn test_withheld_codes() {
        for code in ["m.blacklisted", "m.unverified", "m.unauthorised", "m.unavailable", "m.no_olm"]
        {
            let parsed: WithheldCode = serde_json::from_value(json!(code)).unwrap();
            assert!(!matches!(parsed, WithheldCode::Custom(_)));
            assert_eq!(serde_json::to_value(&parsed).unwrap(), json!(code));
        }

        let custom: WithheldCode = serde_json::from_value(json!("org.example.code")).unwrap();
        assert_eq!(custom, WithheldCode::Custom("org.example.code".to_owned()));
        assert_eq!(custom.to_string(), "org.example.code");
    }

    #[test]
    fn test_no_olm_content_omits_the_session() {
        let content = RoomKeyWithheldContent::new(
            WithheldCode::NoOlm,
            room_id!("!DwLygpkclUAfQNnfva:localhost:8481").to_owned(),
            "0ZcULv8j1nqVWx6kFCd5BvE9MFhFD0WUdi29ktvYLXc".to_owned(),
            Curve25519PublicKey::from_bytes([0u8; 32]),
            device_id!("ALICEDEVICE").to_owned(),
        );

        assert!(content.room_id.is_none());
        assert!(content.session_id.is_none());
        assert_eq!(content.reason.as_deref(), Some("Unable to establish a secure channel."));
    }

    #[test]
    fn test_withheld_event_deserialization() -> Result<(), serde_json::Error> {
        let json = json!({
            "sender": "@alice:example.org",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "code": "m.unverified",
                "from_device": "DEVICEID",
                "reason": "The sender has disabled encrypting to unverified devices.",
                "room_id": "!DwLygpkclUAfQNnfva:localhost:8481",
                "sender_key": "9n7mdWKOjr9c4NTlG6zV8dbFtNK79q9vZADoh7nMUwA",
                "session_id": "0ZcULv8j1nqVWx6kFCd5BvE9MFhFD0WUdi29ktvYLXc",
            },
            "type": "m.room_key.withheld",
        });

        let event: RoomKeyWithheldEvent = serde_json::from_value(json.clone())?;
        assert_eq!(event.content.code, WithheldCode::Unverified);
        assert_eq!(serde_json::to_value(&event)?, json);

        Ok(())
    }
}
