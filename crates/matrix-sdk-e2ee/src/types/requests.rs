// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Requests the crate hands to the [`Transport`](crate::Transport).

use std::collections::BTreeMap;

use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedDeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{backup::RoomKeyBackup, OneTimeKeys};

/// Customized version of
/// `ruma_client_api::to_device::send_event_to_device::v3::Request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to a content for a message event to be
    /// sent to the user's device. Individual message events can be sent
    /// to devices, but all events must be of the same type.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
}

impl ToDeviceRequest {
    /// Create a new owned to-device request for a single device.
    pub fn new(
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        event_type: &str,
        content: Value,
    ) -> Self {
        let mut request = Self::empty(event_type);
        request.add(recipient, recipient_device, content);

        request
    }

    /// Create a request without any messages; fill it with [`Self::add`].
    pub fn empty(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: TransactionId::new(),
            messages: BTreeMap::new(),
        }
    }

    /// Add a message for the given device.
    pub fn add(
        &mut self,
        recipient: &UserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        content: Value,
    ) {
        self.messages
            .entry(recipient.to_owned())
            .or_default()
            .insert(recipient_device.into(), content);
    }

    /// Gets the total number of messages this request carries.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }
}

/// The devices we want a one-time key of, with the algorithm of the key.
pub type KeysClaimRequest = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>;

/// The one-time keys the server handed out for a [`KeysClaimRequest`].
pub type KeysClaimResponse = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OneTimeKeys>>;

/// A batch of room keys to upload to a backup version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The backup version that these room keys should be part of.
    pub version: String,
    /// The map from room id to a backed up room key that we're going to
    /// upload to the server.
    pub rooms: RoomKeyBackup,
}

impl KeysBackupRequest {
    /// The number of keys the request carries.
    pub fn key_count(&self) -> usize {
        self.rooms.values().map(BTreeMap::len).sum()
    }
}
