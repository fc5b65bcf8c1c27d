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

//! Types for `m.room_key` to-device events.

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::megolm::SessionKey;

use super::EventType;
use crate::types::EventEncryptionAlgorithm;

/// The `m.room_key` to-device event content.
///
/// Only ever received inside an Olm encrypted to-device event.
#[derive(Deserialize, Serialize)]
pub struct RoomKeyContent {
    /// The algorithm of the room key, always `m.megolm.v1.aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key to be exchanged. Can be used to create a
    /// [`InboundGroupSession`](crate::olm::InboundGroupSession).
    pub session_key: SessionKey,
    /// Whether the sender marked this key as safe to share with users who
    /// join the room later.
    #[serde(
        default,
        rename = "org.matrix.msc3061.shared_history",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub shared_history: bool,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl RoomKeyContent {
    /// Create a new `m.megolm.v1.aes-sha2` `m.room_key` content.
    pub fn new(
        room_id: OwnedRoomId,
        session_id: String,
        session_key: SessionKey,
        shared_history: bool,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            session_id,
            session_key,
            shared_history,
            other: BTreeMap::new(),
        }
    }
}

impl EventType for RoomKeyContent {
    const EVENT_TYPE: &'static str = "m.room_key";
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("shared_history", &self.shared_history)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RoomKeyContent;

    const SHARED_HISTORY_FIELD: &str = "org.matrix.msc3061.shared_history";

    fn json() -> serde_json::Value {
        json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": "!Cuyf34gef24t:localhost",
            "session_id": "ZFD6+OmV7fVCsJ7Gap8UnORH8EnmiAkes8FAvQuCw/I",
            "session_key": "AgAAAADNp1EbxXYOGmJtyX4AkD1bvJvAUyPkbIaKxtnGKjv\
                            SQ3E/4mnuqdM4vsmNzpO1EeWzz1rDkUpYhYE9kP7sJhgLXi\
                            jVv80fMPHfGc49hPdu8A+xnwD4SQiYdFmSWJOIqsxeo/fiH\
                            tino//CDQENtcKuEt0I9s0+Kk4YSH310Szse2RQ+vjple31\
                            QrCexmqfFJzkR/BJ5ogJHrPBQL0LgsPyglIbMTLg7qygIaY\
                            U5Fe2QdKMH7nTZPNIRHh1RaMfHVETAUJBax88EWZBoifk80\
                            gdHUwHSgMk77vCc2a5KHKLDA",
            "m.custom": "something custom",
        })
    }

    #[test]
    fn test_room_key_shared_history_flag() -> Result<(), serde_json::Error> {
        let content: RoomKeyContent = serde_json::from_value(json())?;
        assert!(!content.shared_history);

        let mut with_history = json();
        with_history[SHARED_HISTORY_FIELD] = true.into();
        let content: RoomKeyContent = serde_json::from_value(with_history.clone())?;
        assert!(content.shared_history);

        let serialized = serde_json::to_value(content)?;
        assert_eq!(serialized, with_history);

        Ok(())
    }
}
