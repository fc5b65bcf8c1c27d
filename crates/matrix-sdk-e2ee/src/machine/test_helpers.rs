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

//! An in-memory [`Transport`] and helpers wiring [`OlmMachine`]s together
//! through it.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use ruma::{
    device_id, serde::Base64, to_device::DeviceIdOrAllDevices, user_id, DeviceId, OwnedDeviceId,
    OwnedRoomId, OwnedUserId, UserId,
};
use serde_json::json;

use crate::{
    store::MemoryStore,
    transport::{Transport, TransportError},
    types::{
        backup::{BackupVersion, RoomKeyBackup},
        events::ToDeviceEvents,
        requests::{KeysBackupRequest, KeysClaimRequest, KeysClaimResponse, ToDeviceRequest},
        OneTimeKeys, SignedKey,
    },
    utilities::MockClock,
    OlmMachine,
};

pub(crate) fn alice_id() -> &'static UserId {
    user_id!("@alice:example.org")
}

pub(crate) fn alice_device_id() -> &'static DeviceId {
    device_id!("JLAFKJWSCS")
}

pub(crate) fn bob_id() -> &'static UserId {
    user_id!("@bob:example.com")
}

pub(crate) fn bob_device_id() -> &'static DeviceId {
    device_id!("NTHHPZDPRN")
}

#[derive(Debug, Default)]
struct Inner {
    sent: Vec<ToDeviceRequest>,
    one_time_keys: BTreeMap<(OwnedUserId, OwnedDeviceId), Vec<(String, SignedKey)>>,
    claimed: usize,
    fail_sends: bool,
    fail_uploads: bool,
    uploads: usize,
    backup_version: Option<BackupVersion>,
    backups: BTreeMap<String, RoomKeyBackup>,
}

/// A homeserver stand-in that records what it is sent and hands out the
/// one-time keys and backups it was given.
///
/// Clones share their state.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<StdMutex<Inner>>,
}

impl MockTransport {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Take the to-device requests sent so far.
    pub(crate) fn take_sent_requests(&self) -> Vec<ToDeviceRequest> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Make the given one-time keys claimable for the device.
    pub(crate) fn add_one_time_keys(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: OneTimeKeys,
    ) {
        self.lock()
            .one_time_keys
            .entry((user_id.to_owned(), device_id.to_owned()))
            .or_default()
            .extend(keys);
    }

    /// The number of one-time keys that were handed out.
    pub(crate) fn claimed_count(&self) -> usize {
        self.lock().claimed
    }

    /// Make `send_to_device` fail, claiming keys keeps working.
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Make `upload_room_keys` fail.
    pub(crate) fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// The number of successful backup uploads.
    pub(crate) fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    /// Set the backup version the server reports as current.
    pub(crate) fn set_backup_version(&self, version: BackupVersion) {
        self.lock().backup_version = Some(version);
    }

    /// The room and session ids of the keys uploaded to the given backup
    /// version.
    pub(crate) fn backed_up_keys(&self, version: &str) -> Vec<(OwnedRoomId, String)> {
        self.lock()
            .backups
            .get(version)
            .map(|rooms| {
                rooms
                    .iter()
                    .flat_map(|(room_id, sessions)| {
                        sessions.keys().map(move |s| (room_id.clone(), s.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Flip a bit in the ciphertext of one backed up key, so its MAC no
    /// longer checks out.
    pub(crate) fn corrupt_backed_up_key(&self, version: &str) {
        let mut inner = self.lock();
        let key = inner
            .backups
            .get_mut(version)
            .and_then(|rooms| rooms.values_mut().next())
            .and_then(|sessions| sessions.values_mut().next())
            .expect("The backup should contain at least one key");

        let mut ciphertext = key.session_data.ciphertext.as_bytes().to_vec();
        ciphertext[0] ^= 0x01;
        key.session_data.ciphertext = Base64::new(ciphertext);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if inner.fail_sends {
            return Err(TransportError::Network("the mock transport is offline".to_owned()));
        }

        inner.sent.push(request.clone());

        Ok(())
    }

    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        let mut inner = self.lock();
        let mut response = KeysClaimResponse::new();

        for (user_id, devices) in request {
            for device_id in devices.into_keys() {
                let key = inner
                    .one_time_keys
                    .get_mut(&(user_id.clone(), device_id.clone()))
                    .and_then(Vec::pop);

                if let Some((key_id, key)) = key {
                    inner.claimed += 1;
                    response
                        .entry(user_id.clone())
                        .or_default()
                        .insert(device_id, OneTimeKeys::from([(key_id, key)]));
                }
            }
        }

        Ok(response)
    }

    async fn upload_room_keys(&self, request: &KeysBackupRequest) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if inner.fail_uploads {
            return Err(TransportError::Server("M_UNKNOWN".to_owned()));
        }

        inner.uploads += 1;
        let backup = inner.backups.entry(request.version.clone()).or_default();

        for (room_id, sessions) in &request.rooms {
            backup.entry(room_id.clone()).or_default().extend(sessions.clone());
        }

        Ok(())
    }

    async fn get_backup_version(
        &self,
        version: Option<&str>,
    ) -> Result<Option<BackupVersion>, TransportError> {
        let inner = self.lock();

        Ok(inner
            .backup_version
            .clone()
            .filter(|current| version.map_or(true, |v| v == current.version)))
    }

    async fn download_room_keys(&self, version: &str) -> Result<RoomKeyBackup, TransportError> {
        Ok(self.lock().backups.get(version).cloned().unwrap_or_default())
    }
}

/// Create a machine with an in-memory store and a mock clock.
pub(crate) async fn get_machine(
    user_id: &UserId,
    device_id: &DeviceId,
    transport: &MockTransport,
    clock: &MockClock,
) -> OlmMachine {
    OlmMachine::new(
        user_id,
        device_id,
        MemoryStore::new(),
        Arc::new(transport.clone()),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap()
}

/// Let the machine publish one-time keys to the mock server.
pub(crate) async fn publish_one_time_keys(
    machine: &OlmMachine,
    transport: &MockTransport,
    count: usize,
) {
    let keys = machine.generate_one_time_keys(count).await.unwrap();
    transport.add_one_time_keys(machine.user_id(), machine.device_id(), keys);
}

/// Two machines sharing one mock server, each knowing the other's device.
///
/// Bob has published one-time keys, Alice can open an Olm session with him.
pub(crate) async fn get_machine_pair() -> (OlmMachine, OlmMachine, MockTransport, MockClock) {
    let transport = MockTransport::default();
    let clock = MockClock::default();

    let alice = get_machine(alice_id(), alice_device_id(), &transport, &clock).await;
    let bob = get_machine(bob_id(), bob_device_id(), &transport, &clock).await;

    alice.receive_device_keys(bob.user_id(), vec![bob.device_keys().await]).await.unwrap();
    bob.receive_device_keys(alice.user_id(), vec![alice.device_keys().await]).await.unwrap();

    publish_one_time_keys(&bob, &transport, 5).await;

    (alice, bob, transport, clock)
}

/// Turn the messages of the given requests that are addressed to the
/// recipient into to-device events.
pub(crate) fn to_device_events_for(
    requests: &[ToDeviceRequest],
    sender: &UserId,
    recipient: &OlmMachine,
) -> Vec<ToDeviceEvents> {
    requests
        .iter()
        .flat_map(|request| {
            request
                .messages
                .get(recipient.user_id())
                .into_iter()
                .flat_map(|devices| devices.iter())
                .filter(|(device, _)| {
                    **device == DeviceIdOrAllDevices::AllDevices
                        || **device == DeviceIdOrAllDevices::from(recipient.device_id().to_owned())
                })
                .map(|(_, content)| {
                    serde_json::from_value(json!({
                        "sender": sender,
                        "type": request.event_type,
                        "content": content,
                    }))
                    .unwrap()
                })
        })
        .collect()
}

/// Deliver the messages of the given requests to the recipient.
pub(crate) async fn deliver(requests: &[ToDeviceRequest], sender: &UserId, recipient: &OlmMachine) {
    let events = to_device_events_for(requests, sender, recipient);
    recipient.receive_to_device_events(&events).await.unwrap();
}
