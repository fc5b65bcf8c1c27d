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

//! Types for `m.forwarded_room_key` to-device events.

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

use super::EventType;
use crate::types::{
    deserialize_curve_key, deserialize_curve_key_vec, deserialize_ed25519_key,
    serialize_curve_key, serialize_curve_key_vec, serialize_ed25519_key,
    EventEncryptionAlgorithm,
};

/// The `m.forwarded_room_key` to-device event content.
///
/// Sent in response to a key request, or to share room history with an
/// invited user. Only ever received inside an Olm encrypted to-device event.
#[derive(Deserialize, Serialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the forwarded key, always `m.megolm.v1.aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[serde(
        rename = "sender_key",
        deserialize_with = "deserialize_curve_key",
        serialize_with = "serialize_curve_key"
    )]
    pub claimed_sender_key: Curve25519PublicKey,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key to be exchanged, exported at some message index.
    pub session_key: ExportedSessionKey,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(
        rename = "sender_claimed_ed25519_key",
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub claimed_ed25519_key: Ed25519PublicKey,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(
        default,
        deserialize_with = "deserialize_curve_key_vec",
        serialize_with = "serialize_curve_key_vec"
    )]
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
    /// Whether the key is being shared with a newly invited user as part of
    /// the room history.
    #[serde(
        default,
        rename = "org.matrix.msc3061.shared_history",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub shared_history: bool,
    #[serde(flatten)]
    pub(crate) other: BTreeMap<String, Value>,
}

impl EventType for ForwardedRoomKeyContent {
    const EVENT_TYPE: &'static str = "m.forwarded_room_key";
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("claimed_sender_key", &self.claimed_sender_key)
            .field("claimed_ed25519_key", &self.claimed_ed25519_key)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .field("shared_history", &self.shared_history)
            .finish_non_exhaustive()
    }
}
