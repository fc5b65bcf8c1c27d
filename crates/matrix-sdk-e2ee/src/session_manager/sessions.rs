// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedUserId, UserId};
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    error::{OlmError, OlmResult},
    identities::DeviceData,
    locks::RwLock as StdRwLock,
    olm::Session,
    store::{Result as StoreResult, Store},
    transport::Transport,
    types::{
        events::{
            olm_v1::DummyEventContent, room::encrypted::ToDeviceEncryptedEventContent, EventType,
        },
        requests::{KeysClaimRequest, KeysClaimResponse, ToDeviceRequest},
    },
    utilities::elapsed,
};

/// A device whose Olm session we failed to decrypt with, identified by its
/// owner and its base64 encoded Curve25519 key.
type WedgedDevice = (OwnedUserId, String);

/// Creates Olm sessions and replaces wedged ones.
#[derive(Debug, Clone)]
pub(crate) struct SessionManager {
    store: Store,
    transport: Arc<dyn Transport>,
    /// Devices we failed to decrypt an Olm message from.
    wedged_devices: Arc<StdRwLock<BTreeSet<WedgedDevice>>>,
    /// When we last forced a new session with a wedged device.
    last_forced: Arc<StdRwLock<BTreeMap<WedgedDevice, MilliSecondsSinceUnixEpoch>>>,
}

impl SessionManager {
    /// A new session with the same device is forced at most once in this
    /// period.
    const MIN_FORCE_SESSION_PERIOD: Duration = Duration::from_secs(60 * 60);
    const KEY_CLAIM_ALGORITHM: &'static str = "signed_curve25519";

    pub(crate) fn new(store: Store, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            wedged_devices: Default::default(),
            last_forced: Default::default(),
        }
    }

    /// Find the devices of the given users we don't share an Olm session
    /// with.
    ///
    /// Returns a request claiming a one-time key for each of them, the
    /// response should be passed to [`SessionManager::create_sessions`].
    pub(crate) async fn get_missing_sessions(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<KeysClaimRequest> {
        let mut missing: KeysClaimRequest = BTreeMap::new();

        for (user_id, devices) in self.store.get_devices_of(users).await? {
            for device in devices {
                if user_id == self.store.user_id() && device.device_id() == self.store.device_id()
                {
                    continue;
                }

                if !device.supports_olm() {
                    trace!(
                        ?user_id,
                        device_id = ?device.device_id(),
                        "The device doesn't support Olm"
                    );
                    continue;
                }

                let Some(sender_key) = device.curve25519_key() else {
                    warn!(
                        ?user_id,
                        device_id = ?device.device_id(),
                        "The device doesn't have a Curve25519 key, can't create an Olm session"
                    );
                    continue;
                };

                let is_missing = match self.store.get_sessions(&sender_key.to_base64()).await? {
                    Some(sessions) => sessions.lock().await.is_empty(),
                    None => true,
                };

                if is_missing {
                    missing.entry(user_id.clone()).or_default().insert(
                        device.device_id().to_owned(),
                        Self::KEY_CLAIM_ALGORITHM.to_owned(),
                    );
                }
            }
        }

        Ok(missing)
    }

    /// Create new Olm sessions from the one-time keys the server handed out.
    ///
    /// Keys for devices we don't know, or whose signature doesn't check out,
    /// are skipped.
    ///
    /// Returns the devices we now share a new session with.
    pub(crate) async fn create_sessions(
        &self,
        response: &KeysClaimResponse,
    ) -> OlmResult<Vec<DeviceData>> {
        let created = self.create_sessions_helper(response, false).await?;
        Ok(created.into_iter().map(|(device, _)| device).collect())
    }

    async fn create_sessions_helper(
        &self,
        response: &KeysClaimResponse,
        forced: bool,
    ) -> OlmResult<Vec<(DeviceData, Session)>> {
        let now = self.store.now();
        let mut created = Vec::new();

        {
            let account = self.store.account().await;

            for (user_id, user_devices) in response {
                for (device_id, key_map) in user_devices {
                    let device = match self.store.get_device(user_id, device_id).await {
                        Ok(Some(d)) => d,
                        Ok(None) => {
                            warn!(
                                ?user_id,
                                ?device_id,
                                "Tried to create an Olm session, but the device is unknown"
                            );
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                ?user_id,
                                ?device_id,
                                error = ?e,
                                "Tried to create an Olm session, but the device can't be loaded"
                            );
                            continue;
                        }
                    };

                    let mut session = match account.create_outbound_session(&device, key_map, now)
                    {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(
                                ?user_id,
                                ?device_id,
                                error = ?e,
                                "Couldn't create an Olm session"
                            );
                            continue;
                        }
                    };

                    // A forced session has to win the selection on our side
                    // right away, it replaces a wedged one.
                    if forced {
                        session.last_message_received_at = now;
                    }

                    info!(
                        ?user_id,
                        ?device_id,
                        session_id = session.session_id(),
                        forced,
                        "Created a new outbound Olm session"
                    );

                    created.push((device, session));
                }
            }
        }

        let sessions: Vec<Session> = created.iter().map(|(_, s)| s.clone()).collect();

        if !sessions.is_empty() {
            self.store.save_sessions(&sessions).await?;
        }

        Ok(created)
    }

    /// Make sure we share an Olm session with every device of the given
    /// users, claiming one-time keys for the ones we're missing.
    ///
    /// Devices the server has no one-time key for are left without a
    /// session.
    #[instrument(skip_all)]
    pub(crate) async fn ensure_sessions(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<Vec<DeviceData>> {
        let request = self.get_missing_sessions(users).await?;

        if request.is_empty() {
            return Ok(Vec::new());
        }

        debug!(missing = ?request, "Claiming one-time keys to create missing Olm sessions");

        let response = self.transport.claim_one_time_keys(request).await?;
        self.create_sessions(&response).await
    }

    /// Remember that an Olm message from the given device couldn't be
    /// decrypted.
    pub(crate) fn mark_device_as_wedged(&self, sender: &UserId, sender_key: Curve25519PublicKey) {
        let device = (sender.to_owned(), sender_key.to_base64());

        if self.wedged_devices.write().insert(device) {
            debug!(?sender, ?sender_key, "Marking a device as wedged");
        }
    }

    /// Is the device with the given key waiting for a new Olm session.
    pub(crate) fn is_device_wedged(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> bool {
        self.wedged_devices.read().contains(&(sender.to_owned(), sender_key.to_base64()))
    }

    /// Create a new Olm session with every wedged device and send an
    /// `m.dummy` event over it, so the other side replaces its session too.
    ///
    /// A new session is forced with the same device at most once an hour.
    #[instrument(skip_all)]
    pub(crate) async fn unwedge_devices_if_needed(&self) -> OlmResult<()> {
        let now = self.store.now();

        let to_unwedge: Vec<WedgedDevice> = {
            let wedged_devices = self.wedged_devices.read();
            let mut last_forced = self.last_forced.write();

            wedged_devices
                .iter()
                .filter(|device| {
                    let recently_forced = last_forced
                        .get(*device)
                        .is_some_and(|t| elapsed(*t, now) < Self::MIN_FORCE_SESSION_PERIOD);

                    if recently_forced {
                        debug!(
                            user_id = ?device.0,
                            sender_key = device.1,
                            "A new Olm session was already forced recently"
                        );
                        false
                    } else {
                        last_forced.insert((*device).clone(), now);
                        true
                    }
                })
                .cloned()
                .collect()
        };

        if to_unwedge.is_empty() {
            trace!("No wedged devices need a new Olm session");
            return Ok(());
        }

        let mut request: KeysClaimRequest = BTreeMap::new();

        for (user_id, sender_key) in &to_unwedge {
            let device = self
                .store
                .get_user_devices(user_id)
                .await?
                .into_values()
                .find(|d| d.curve25519_key().map(|k| k.to_base64()).as_ref() == Some(sender_key));

            if let Some(device) = device {
                request
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device.device_id().to_owned(), Self::KEY_CLAIM_ALGORITHM.to_owned());
            } else {
                warn!(?user_id, sender_key, "Can't unwedge an unknown device");
            }
        }

        if request.is_empty() {
            return Ok(());
        }

        info!(devices = ?request, "Forcing new Olm sessions with wedged devices");

        let response = self.transport.claim_one_time_keys(request).await?;
        let created = self.create_sessions_helper(&response, true).await?;

        if created.is_empty() {
            return Ok(());
        }

        let content = serde_json::to_value(DummyEventContent::default())?;
        let mut to_device = ToDeviceRequest::empty(ToDeviceEncryptedEventContent::EVENT_TYPE);
        let mut used_sessions = Vec::with_capacity(created.len());

        for (device, mut session) in created {
            let encrypted = session
                .encrypt(&device, DummyEventContent::EVENT_TYPE, content.clone(), now)
                .await?;

            to_device.add(
                device.user_id(),
                device.device_id().to_owned(),
                serde_json::to_value(encrypted)?,
            );
            used_sessions.push((device, session));
        }

        let sessions: Vec<Session> = used_sessions.iter().map(|(_, s)| s.clone()).collect();
        self.store.save_sessions(&sessions).await?;

        if let Err(e) = self.transport.send_to_device(&to_device).await {
            error!(error = ?e, "Failed to send the m.dummy events to the wedged devices");
            return Err(e.into());
        }

        let mut wedged_devices = self.wedged_devices.write();

        for (device, _) in &used_sessions {
            if let Some(key) = device.curve25519_key() {
                wedged_devices.remove(&(device.user_id().to_owned(), key.to_base64()));
            }
        }

        Ok(())
    }
}

/// Encrypt the given event for a device, using the Olm session we last
/// received a message on.
///
/// Returns the session that was used, its ratchet moved forward and it needs
/// to be saved.
pub(crate) async fn encrypt_for_device(
    store: &Store,
    device: &DeviceData,
    event_type: &str,
    content: Value,
) -> OlmResult<(Session, ToDeviceEncryptedEventContent)> {
    let sender_key = device.curve25519_key().ok_or(OlmError::MissingSession)?;
    let mut session = store.last_used_session(sender_key).await?.ok_or(OlmError::MissingSession)?;

    let encrypted = session.encrypt(device, event_type, content, store.now()).await?;

    Ok((session, encrypted))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches2::{assert_let, assert_matches};
    use ruma::{device_id, user_id};
    use vodozemac::olm::OlmMessage;

    use super::{encrypt_for_device, SessionManager};
    use crate::{
        error::OlmError,
        identities::DeviceData,
        machine::test_helpers::MockTransport,
        olm::Account,
        store::{Changes, MemoryStore, Store},
        types::{events::room::encrypted::ToDeviceEncryptedEventContent, requests::KeysClaimResponse},
        utilities::{Clock, MockClock},
    };

    struct Setup {
        manager: SessionManager,
        store: Store,
        bob: Account,
        transport: MockTransport,
        clock: MockClock,
    }

    async fn setup() -> Setup {
        let clock = MockClock::default();
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let own_device = DeviceData::from_account(&alice);
        let mut bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let store = Store::new(alice, Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        let pickle = store.account().await.pickle();
        store.save_changes(Changes { account: Some(pickle), ..Default::default() }).await.unwrap();

        let bob_device = DeviceData::try_from(&bob.device_keys()).unwrap();
        store.save_device_data(&[own_device, bob_device]).await.unwrap();

        let transport = MockTransport::default();
        bob.generate_one_time_keys(5);
        transport.add_one_time_keys(bob.user_id(), bob.device_id(), bob.signed_one_time_keys());
        bob.mark_keys_as_published();

        let manager = SessionManager::new(store.clone(), Arc::new(transport.clone()));

        Setup { manager, store, bob, transport, clock }
    }

    #[tokio::test]
    async fn test_missing_sessions_are_created() {
        let Setup { manager, store, bob, transport, .. } = setup().await;
        let users = [store.user_id().to_owned(), bob.user_id().to_owned()];

        let missing = manager.get_missing_sessions(users.iter().map(|u| u.as_ref())).await.unwrap();
        assert_eq!(missing.len(), 1, "Our own device never needs a session");
        assert!(missing[bob.user_id()].contains_key(bob.device_id()));

        let created = manager.ensure_sessions(users.iter().map(|u| u.as_ref())).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(transport.claimed_count(), 1);

        let missing = manager.get_missing_sessions(users.iter().map(|u| u.as_ref())).await.unwrap();
        assert!(missing.is_empty());

        // Nothing is claimed once every session exists.
        manager.ensure_sessions(users.iter().map(|u| u.as_ref())).await.unwrap();
        assert_eq!(transport.claimed_count(), 1);
    }

    #[tokio::test]
    async fn test_keys_for_unknown_devices_are_skipped() {
        let Setup { manager, .. } = setup().await;
        let mut mallory = Account::new(user_id!("@mallory:localhost"), device_id!("MALLORY"));
        mallory.generate_one_time_keys(1);

        let response: KeysClaimResponse = [(
            mallory.user_id().to_owned(),
            [(mallory.device_id().to_owned(), mallory.signed_one_time_keys())].into(),
        )]
        .into();

        assert!(manager.create_sessions(&response).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_encrypting_without_a_session_fails() {
        let Setup { store, bob, .. } = setup().await;
        let device = store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();

        let result = encrypt_for_device(&store, &device, "m.dummy", serde_json::json!({})).await;
        assert_matches!(result, Err(OlmError::MissingSession));
    }

    #[tokio::test]
    async fn test_unwedging_sends_a_dummy_over_a_new_session() {
        let Setup { manager, store, mut bob, transport, clock } = setup().await;
        let bob_key = bob.identity_keys().curve25519;

        manager.ensure_sessions([bob.user_id()]).await.unwrap();
        let old_session = store.last_used_session(bob_key).await.unwrap().unwrap();

        manager.mark_device_as_wedged(bob.user_id(), bob_key);
        assert!(manager.is_device_wedged(bob.user_id(), bob_key));

        clock.advance(Duration::from_secs(5));
        manager.unwedge_devices_if_needed().await.unwrap();
        assert!(!manager.is_device_wedged(bob.user_id(), bob_key));

        let new_session = store.last_used_session(bob_key).await.unwrap().unwrap();
        assert_ne!(new_session.session_id(), old_session.session_id());
        assert_eq!(new_session.last_message_received_at, clock.now());

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room.encrypted");

        let content = &sent[0].messages[bob.user_id()];
        let content: ToDeviceEncryptedEventContent =
            serde_json::from_value(content.values().next().unwrap().clone()).unwrap();
        assert_let!(OlmMessage::PreKey(prekey) = content.message_for(bob_key).unwrap());
        assert_eq!(prekey.session_id(), new_session.session_id());

        let result = bob
            .create_inbound_session(content.sender_key, &prekey, clock.now())
            .unwrap();
        assert!(result.plaintext.contains("m.dummy"));

        // Wedged again right away, the next attempt has to wait an hour.
        manager.mark_device_as_wedged(bob.user_id(), bob_key);
        manager.unwedge_devices_if_needed().await.unwrap();
        assert!(transport.take_sent_requests().is_empty());
        assert!(manager.is_device_wedged(bob.user_id(), bob_key));

        clock.advance(Duration::from_secs(60 * 60));
        manager.unwedge_devices_if_needed().await.unwrap();
        assert_eq!(transport.take_sent_requests().len(), 1);
        assert!(!manager.is_device_wedged(bob.user_id(), bob_key));
    }
}
