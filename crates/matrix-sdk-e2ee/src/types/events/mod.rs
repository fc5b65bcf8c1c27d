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

//! Types modeling end-to-end encryption related Matrix events
//!
//! These types aim to provide a more strict variant of the equivalent Ruma
//! types. Secret material inside them (session keys) is zeroized by
//! vodozemac once the type is dropped.

pub mod forwarded_room_key;
pub mod olm_v1;
pub mod room;
pub mod room_key;
pub mod room_key_request;
pub mod room_key_withheld;

use std::{collections::BTreeMap, fmt::Debug};

use ruma::OwnedUserId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use self::{
    olm_v1::DummyEventContent, room::encrypted::ToDeviceEncryptedEventContent,
    room_key_request::RoomKeyRequestContent, room_key_withheld::RoomKeyWithheldContent,
};

/// A trait for event contents to define their event type.
pub trait EventType {
    /// The event type of the event content.
    const EVENT_TYPE: &'static str;

    /// Get the event type of the event content.
    fn event_type(&self) -> &str {
        Self::EVENT_TYPE
    }
}

/// A to-device event, as received through sync.
#[derive(Clone, Debug)]
pub struct ToDeviceEvent<C> {
    /// The sender of the to-device event.
    pub sender: OwnedUserId,
    /// The content of the to-device event.
    pub content: C,
    /// Any other, non-specced fields of the event.
    pub(crate) other: BTreeMap<String, Value>,
}

impl<C: EventType> ToDeviceEvent<C> {
    /// Create a new `ToDeviceEvent`.
    pub fn new(sender: OwnedUserId, content: C) -> Self {
        Self { sender, content, other: BTreeMap::new() }
    }

    /// The event type of the event.
    pub fn event_type(&self) -> &str {
        self.content.event_type()
    }
}

#[derive(Deserialize)]
struct ToDeviceEventHelper<C> {
    sender: OwnedUserId,
    content: C,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl<C: EventType + Serialize> Serialize for ToDeviceEvent<C> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Helper<'a, C> {
            sender: &'a OwnedUserId,
            content: &'a C,
            #[serde(rename = "type")]
            event_type: &'a str,
            #[serde(flatten)]
            other: &'a BTreeMap<String, Value>,
        }

        Helper {
            sender: &self.sender,
            content: &self.content,
            event_type: self.content.event_type(),
            other: &self.other,
        }
        .serialize(serializer)
    }
}

impl<'de, C: EventType + DeserializeOwned> Deserialize<'de> for ToDeviceEvent<C> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let helper = ToDeviceEventHelper::<C>::deserialize(deserializer)?;

        if helper.event_type != C::EVENT_TYPE {
            return Err(serde::de::Error::custom(format!(
                "expected a {} event, got {}",
                C::EVENT_TYPE,
                helper.event_type
            )));
        }

        Ok(Self { sender: helper.sender, content: helper.content, other: helper.other })
    }
}

/// A to-device event with an unknown type and content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceCustomEvent {
    /// The sender of the to-device event.
    pub sender: OwnedUserId,
    /// The content of the event.
    pub content: Value,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
}

/// An enum over the to-device events the crate handles in the clear.
#[derive(Clone, Debug)]
pub enum ToDeviceEvents {
    /// The `m.room.encrypted` to-device event.
    RoomEncrypted(ToDeviceEvent<ToDeviceEncryptedEventContent>),
    /// The `m.room_key_request` to-device event.
    RoomKeyRequest(ToDeviceEvent<RoomKeyRequestContent>),
    /// The `m.room_key.withheld` to-device event.
    RoomKeyWithheld(ToDeviceEvent<RoomKeyWithheldContent>),
    /// The `m.dummy` to-device event.
    Dummy(ToDeviceEvent<DummyEventContent>),
    /// Any other to-device event, passed through untouched.
    Custom(ToDeviceCustomEvent),
}

impl ToDeviceEvents {
    /// The sender of the to-device event.
    pub fn sender(&self) -> &ruma::UserId {
        match self {
            ToDeviceEvents::RoomEncrypted(e) => &e.sender,
            ToDeviceEvents::RoomKeyRequest(e) => &e.sender,
            ToDeviceEvents::RoomKeyWithheld(e) => &e.sender,
            ToDeviceEvents::Dummy(e) => &e.sender,
            ToDeviceEvents::Custom(e) => &e.sender,
        }
    }

    /// The event type of the to-device event.
    pub fn event_type(&self) -> &str {
        match self {
            ToDeviceEvents::RoomEncrypted(e) => e.event_type(),
            ToDeviceEvents::RoomKeyRequest(e) => e.event_type(),
            ToDeviceEvents::RoomKeyWithheld(e) => e.event_type(),
            ToDeviceEvents::Dummy(e) => e.event_type(),
            ToDeviceEvents::Custom(e) => &e.event_type,
        }
    }
}

impl<'de> Deserialize<'de> for ToDeviceEvents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let json = Value::deserialize(deserializer)?;
        let event_type = json.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match event_type {
            ToDeviceEncryptedEventContent::EVENT_TYPE => {
                ToDeviceEvents::RoomEncrypted(from_value(json)?)
            }
            RoomKeyRequestContent::EVENT_TYPE => ToDeviceEvents::RoomKeyRequest(from_value(json)?),
            RoomKeyWithheldContent::EVENT_TYPE => {
                ToDeviceEvents::RoomKeyWithheld(from_value(json)?)
            }
            DummyEventContent::EVENT_TYPE => ToDeviceEvents::Dummy(from_value(json)?),
            _ => ToDeviceEvents::Custom(from_value(json)?),
        })
    }
}

fn from_value<T, E>(value: Value) -> Result<T, E>
where
    T: DeserializeOwned,
    E: serde::de::Error,
{
    serde_json::from_value(value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::ToDeviceEvents;

    #[test]
    fn test_to_device_events_dispatch_on_type() {
        let event: ToDeviceEvents = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "type": "m.dummy",
            "content": {},
        }))
        .unwrap();
        assert_matches!(event, ToDeviceEvents::Dummy(_));

        let event: ToDeviceEvents = serde_json::from_value(json!({
            "sender": "@alice:example.org",
            "type": "org.example.custom",
            "content": { "foo": "bar" },
        }))
        .unwrap();
        assert_matches!(event, ToDeviceEvents::Custom(custom));
        assert_eq!(custom.event_type, "org.example.custom");
        assert_eq!(custom.content["foo"], "bar");
    }

    #[test]
    fn test_to_device_event_rejects_mismatched_type() {
        let result: Result<super::ToDeviceEvent<super::olm_v1::DummyEventContent>, _> =
            serde_json::from_value(json!({
                "sender": "@alice:example.org",
                "type": "m.room_key_request",
                "content": {},
            }));

        assert!(result.is_err());
    }
}
