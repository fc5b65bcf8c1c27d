// Copyright 2020 The Matrix.org Foundation C.I.C.
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
};

use itertools::{Either, Itertools};
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{encrypt_for_device, SessionManager};
use crate::{
    error::{MegolmError, MegolmResult, OlmError, OlmResult},
    identities::DeviceData,
    locks::RwLock as StdRwLock,
    machine::GlobalSettings,
    olm::{
        shared_history_from_history_visibility, EncryptionSettings, InboundGroupSession,
        OutboundGroupSession, Session, ShareInfo, ShareInfoSet, ShareState,
    },
    store::{Changes, Result as StoreResult, Store},
    transport::Transport,
    types::{
        events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            room::encrypted::{RoomEncryptedEventContent, ToDeviceEncryptedEventContent},
            room_key::RoomKeyContent,
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
            EventType,
        },
        requests::ToDeviceRequest,
    },
};

/// Servers reject to-device requests that are too large, room keys are sent
/// to at most this many devices per request.
const MAX_TO_DEVICE_MESSAGES: usize = 250;

#[derive(Clone, Debug)]
pub(crate) struct GroupSessionCache {
    store: Store,
    sessions: Arc<StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>>,
}

impl GroupSessionCache {
    pub(crate) fn new(store: Store) -> Self {
        Self { store, sessions: Default::default() }
    }

    pub(crate) fn insert(&self, session: OutboundGroupSession) {
        self.sessions.write().insert(session.room_id().to_owned(), session);
    }

    /// Either get a session for the given room from the cache or load it from
    /// the store.
    pub(crate) async fn get_or_load(
        &self,
        room_id: &RoomId,
    ) -> StoreResult<Option<OutboundGroupSession>> {
        if let Some(s) = self.sessions.read().get(room_id) {
            return Ok(Some(s.clone()));
        }

        match self.store.get_outbound_group_session(room_id).await {
            Ok(Some(session)) => {
                self.sessions.write().insert(room_id.to_owned(), session.clone());
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!(?room_id, error = ?e, "Couldn't restore an outbound group session");
                Err(e)
            }
        }
    }

    /// Get an outbound group session for a room, if one exists.
    pub(crate) fn get(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.sessions.read().get(room_id).cloned()
    }

    /// Get the outbound group session of the room, if it has the given id.
    pub(crate) async fn get_with_id(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> StoreResult<Option<OutboundGroupSession>> {
        Ok(self.get_or_load(room_id).await?.filter(|o| o.session_id() == session_id))
    }
}

/// The devices a room key should be shared with, and the ones it should be
/// withheld from.
#[derive(Debug, Default)]
struct CollectRecipientsResult {
    /// The room key has to be rotated before it is shared.
    should_rotate: bool,
    devices: BTreeMap<OwnedUserId, Vec<DeviceData>>,
    withheld_devices: Vec<(DeviceData, WithheldCode)>,
}

/// The to-device messages carrying a room key to a chunk of devices.
struct EncryptedShare {
    request: ToDeviceRequest,
    share_infos: ShareInfoSet,
    used_sessions: Vec<Session>,
    /// Devices we have no Olm session with.
    no_olm: Vec<DeviceData>,
}

/// Creates, rotates and distributes the room keys of the rooms we send
/// messages to.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    store: Store,
    transport: Arc<dyn Transport>,
    /// The currently active outbound group sessions.
    sessions: GroupSessionCache,
    session_manager: SessionManager,
    settings: Arc<StdRwLock<GlobalSettings>>,
}

impl GroupSessionManager {
    pub(crate) fn new(
        store: Store,
        transport: Arc<dyn Transport>,
        session_manager: SessionManager,
        settings: Arc<StdRwLock<GlobalSettings>>,
    ) -> Self {
        Self {
            sessions: GroupSessionCache::new(store.clone()),
            store,
            transport,
            session_manager,
            settings,
        }
    }

    pub(crate) fn session_cache(&self) -> &GroupSessionCache {
        &self.sessions
    }

    /// Mark the outbound session of the room as invalid, the next call to
    /// [`GroupSessionManager::share_room_key`] creates a new one.
    pub(crate) async fn discard_outbound_session(&self, room_id: &RoomId) -> StoreResult<bool> {
        let Some(session) = self.sessions.get_or_load(room_id).await? else {
            return Ok(false);
        };

        session.invalidate_session();
        self.store
            .save_changes(Changes { outbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        info!(?room_id, "Discarded the outbound group session");

        Ok(true)
    }

    /// Encrypt the given event for the room.
    ///
    /// The room key has to be shared with
    /// [`GroupSessionManager::share_room_key`] first.
    pub(crate) async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        let now = self.store.now();

        let session = self
            .sessions
            .get_or_load(room_id)
            .await?
            .filter(|s| s.shared() && !s.invalidated() && !s.expired(now))
            .ok_or_else(|| MegolmError::MissingOutboundSession(room_id.to_owned()))?;

        let content = session.encrypt(event_type, content).await;

        self.store
            .save_changes(Changes { outbound_group_sessions: vec![session], ..Default::default() })
            .await?;

        Ok(content)
    }

    async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<(OutboundGroupSession, InboundGroupSession)> {
        let (outbound, inbound) = self
            .store
            .static_account()
            .create_group_session_pair(room_id, settings, self.store.now())
            .await?;

        self.sessions.insert(outbound.clone());

        info!(
            ?room_id,
            session_id = outbound.session_id(),
            "Created a new outbound group session"
        );

        Ok((outbound, inbound))
    }

    /// Get the usable outbound session of the room, or create a new one.
    ///
    /// A newly created session comes with its inbound half.
    async fn get_or_create_outbound_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<(OutboundGroupSession, Option<InboundGroupSession>)> {
        let now = self.store.now();

        match self.sessions.get_or_load(room_id).await? {
            Some(s) if !s.expired(now) && !s.invalidated() => Ok((s, None)),
            Some(s) => {
                debug!(
                    ?room_id,
                    session_id = s.session_id(),
                    expired = s.expired(now),
                    invalidated = s.invalidated(),
                    "The outbound group session can't be used anymore, rotating it"
                );
                let (outbound, inbound) =
                    self.create_outbound_group_session(room_id, settings).await?;
                Ok((outbound, Some(inbound)))
            }
            None => {
                let (outbound, inbound) =
                    self.create_outbound_group_session(room_id, settings).await?;
                Ok((outbound, Some(inbound)))
            }
        }
    }

    /// Decide which devices get the room key and whether the key needs to be
    /// rotated first.
    ///
    /// The key is rotated if a user or a device that received it is gone, if a
    /// device that received it got blacklisted, or if the history visibility
    /// moved to a different bucket.
    async fn collect_session_recipients(
        &self,
        users: &BTreeSet<&UserId>,
        settings: &EncryptionSettings,
        only_allow_trusted_devices: bool,
        outbound: &OutboundGroupSession,
    ) -> StoreResult<CollectRecipientsResult> {
        // Devices that were refused the key don't count, only the ones that
        // can decrypt with it.
        let shared_with: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>> = outbound
            .shared_with()
            .into_iter()
            .filter_map(|(user_id, devices)| {
                let devices: BTreeSet<OwnedDeviceId> = devices
                    .into_iter()
                    .filter(|(_, info)| matches!(info, ShareInfo::Shared(_)))
                    .map(|(device_id, _)| device_id)
                    .collect();
                (!devices.is_empty()).then_some((user_id, devices))
            })
            .collect();

        let user_left = shared_with.keys().any(|u| !users.contains(&**u));
        let visibility_changed =
            outbound.needs_rotation_due_to_visibility_change(&settings.history_visibility);
        let algorithm_changed = outbound.settings().algorithm != settings.algorithm;

        let mut should_rotate = user_left || visibility_changed || algorithm_changed;
        let mut result = CollectRecipientsResult::default();

        for user_id in users {
            let user_devices = self.store.get_user_devices(user_id).await?;

            if !should_rotate {
                if let Some(shared) = shared_with.get(*user_id) {
                    // A device that got the key was deleted, or we stopped
                    // trusting it.
                    should_rotate = shared.iter().any(|device_id| {
                        user_devices.get(device_id).map_or(true, |d| d.is_blacklisted())
                    });
                }
            }

            let (allowed, withheld): (Vec<_>, Vec<_>) = user_devices
                .into_values()
                .filter(|d| {
                    d.user_id() != self.store.user_id() || d.device_id() != self.store.device_id()
                })
                .partition_map(|d| {
                    if d.is_blacklisted() {
                        Either::Right((d, WithheldCode::Blacklisted))
                    } else if only_allow_trusted_devices && !d.is_verified() {
                        Either::Right((d, WithheldCode::Unverified))
                    } else {
                        Either::Left(d)
                    }
                });

            result.devices.entry((*user_id).to_owned()).or_default().extend(allowed);
            result.withheld_devices.extend(withheld);
        }

        if should_rotate {
            debug!(
                user_left,
                visibility_changed,
                algorithm_changed,
                "The room key needs to be rotated before it is shared"
            );
        }

        result.should_rotate = should_rotate;

        Ok(result)
    }

    /// Encrypt the room key for a chunk of devices.
    async fn encrypt_session_for(
        &self,
        content: &Value,
        devices: &[DeviceData],
        message_index: u32,
    ) -> OlmResult<EncryptedShare> {
        let mut share = EncryptedShare {
            request: ToDeviceRequest::empty(ToDeviceEncryptedEventContent::EVENT_TYPE),
            share_infos: BTreeMap::new(),
            used_sessions: Vec::new(),
            no_olm: Vec::new(),
        };

        for device in devices {
            let result =
                encrypt_for_device(&self.store, device, RoomKeyContent::EVENT_TYPE, content.clone())
                    .await;

            match result {
                Ok((session, encrypted)) => {
                    share.request.add(
                        device.user_id(),
                        device.device_id().to_owned(),
                        serde_json::to_value(encrypted)?,
                    );
                    share.share_infos.entry(device.user_id().to_owned()).or_default().insert(
                        device.device_id().to_owned(),
                        ShareInfo::new_shared(
                            session.sender_key,
                            message_index,
                            device.olm_wedging_index,
                        ),
                    );
                    share.used_sessions.push(session);
                }
                Err(OlmError::MissingSession) => {
                    debug!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        "No Olm session with the device, withholding the room key"
                    );
                    share.no_olm.push(device.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(share)
    }

    /// Queue `m.room_key.withheld` notices for the given devices.
    fn queue_withheld_requests(
        outbound: &OutboundGroupSession,
        withheld: Vec<(DeviceData, WithheldCode)>,
    ) -> OlmResult<()> {
        for chunk in withheld.chunks(MAX_TO_DEVICE_MESSAGES) {
            let mut request = ToDeviceRequest::empty(RoomKeyWithheldContent::EVENT_TYPE);
            let mut share_infos: ShareInfoSet = BTreeMap::new();

            for (device, code) in chunk {
                let content = outbound.withheld_code(code.clone());
                request.add(
                    device.user_id(),
                    device.device_id().to_owned(),
                    serde_json::to_value(content)?,
                );
                share_infos
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .insert(device.device_id().to_owned(), ShareInfo::new_withheld(code.clone()));
            }

            outbound.add_request(request.txn_id.clone(), Arc::new(request), share_infos);
        }

        Ok(())
    }

    /// Send out the queued requests of the outbound session.
    ///
    /// A request that fails to send is dropped together with every request
    /// after it, the devices they addressed stay unshared.
    async fn send_pending_requests(&self, outbound: &OutboundGroupSession) -> OlmResult<()> {
        let mut result = Ok(());

        for request in outbound.pending_requests() {
            if result.is_err() {
                outbound.discard_request(&request.txn_id);
                continue;
            }

            match self.transport.send_to_device(&request).await {
                Ok(()) => {
                    trace!(
                        txn_id = ?request.txn_id,
                        event_type = request.event_type,
                        message_count = request.message_count(),
                        "Sent a room key to-device request"
                    );
                    outbound.mark_request_as_sent(&request.txn_id);
                }
                Err(e) => {
                    warn!(
                        txn_id = ?request.txn_id,
                        error = ?e,
                        "Failed to send a room key to-device request"
                    );
                    outbound.discard_request(&request.txn_id);
                    result = Err(e.into());
                }
            }
        }

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![outbound.clone()],
                ..Default::default()
            })
            .await?;

        result
    }

    /// Make sure the room key of the room is shared with every device of the
    /// given users, creating or rotating it if needed.
    ///
    /// Devices that shouldn't get the key are sent an `m.room_key.withheld`
    /// notice instead. Devices that already got the key are skipped.
    #[instrument(skip(self, users, settings))]
    pub(crate) async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: impl IntoIterator<Item = &UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<()> {
        trace!("Checking if the room key needs to be shared");

        let users: BTreeSet<&UserId> = users.into_iter().collect();
        let mut changes = Changes::default();

        let (mut outbound, inbound) =
            self.get_or_create_outbound_session(room_id, settings.clone()).await?;

        if let Some(inbound) = inbound {
            changes.inbound_group_sessions.push(inbound);
        }

        // Olm sessions are established before the recipients are collected so
        // devices without one can be told why they don't get the key.
        self.session_manager.ensure_sessions(users.iter().copied()).await?;

        let (global_only_trusted, share_keys_on_invite) = {
            let global = self.settings.read();
            (global.only_allow_trusted_devices, global.share_keys_on_invite)
        };
        let only_trusted = settings.only_allow_trusted_devices || global_only_trusted;

        let recipients =
            self.collect_session_recipients(&users, &settings, only_trusted, &outbound).await?;

        if recipients.should_rotate {
            let (new_outbound, new_inbound) =
                self.create_outbound_group_session(room_id, settings.clone()).await?;
            changes.inbound_group_sessions.push(new_inbound);
            outbound = new_outbound;
        }

        let devices: Vec<DeviceData> = recipients
            .devices
            .into_values()
            .flatten()
            .filter(|d| outbound.is_shared_with(d) == ShareState::NotShared)
            .collect();

        let shared_history = share_keys_on_invite
            && shared_history_from_history_visibility(&outbound.settings().history_visibility);
        let mut withheld = recipients.withheld_devices;

        if !devices.is_empty() {
            let message_index = outbound.message_index().await;
            let content = serde_json::to_value(outbound.as_content(shared_history).await)?;

            for chunk in devices.chunks(MAX_TO_DEVICE_MESSAGES) {
                let share = self.encrypt_session_for(&content, chunk, message_index).await?;

                withheld.extend(share.no_olm.into_iter().map(|d| (d, WithheldCode::NoOlm)));
                changes.sessions.extend(share.used_sessions);

                if share.request.message_count() > 0 {
                    outbound.add_request(
                        share.request.txn_id.clone(),
                        Arc::new(share.request),
                        share.share_infos,
                    );
                }
            }
        }

        let withheld: Vec<_> =
            withheld.into_iter().filter(|(d, code)| !outbound.is_withheld_to(d, code)).collect();

        if !withheld.is_empty() {
            info!(
                devices = withheld.len(),
                session_id = outbound.session_id(),
                "Withholding the room key from some devices"
            );
            Self::queue_withheld_requests(&outbound, withheld)?;
        }

        let pending = outbound.pending_request_ids();

        if pending.is_empty() {
            if !outbound.shared() {
                debug!(session_id = outbound.session_id(), "The room key is shared with everyone");
                outbound.mark_as_shared();
            }
        } else {
            info!(
                session_id = outbound.session_id(),
                request_count = pending.len(),
                "Sharing the room key"
            );
        }

        changes.outbound_group_sessions.push(outbound.clone());
        self.store.save_changes(changes).await?;

        if !pending.is_empty() {
            self.send_pending_requests(&outbound).await?;
        }

        Ok(())
    }

    /// Forward the room keys of a room with a shared history to a newly
    /// invited user, so they can read the messages sent before they joined.
    ///
    /// Nothing is sent unless sharing keys on invite is enabled and the
    /// history visibility of the room allows it.
    ///
    /// Returns the number of room keys that were forwarded.
    #[instrument(skip(self, settings))]
    pub(crate) async fn share_room_history_with(
        &self,
        room_id: &RoomId,
        invitee: &UserId,
        settings: &EncryptionSettings,
    ) -> OlmResult<usize> {
        let (share_keys_on_invite, global_only_trusted) = {
            let global = self.settings.read();
            (global.share_keys_on_invite, global.only_allow_trusted_devices)
        };

        if !share_keys_on_invite {
            trace!("Sharing keys on invite is disabled");
            return Ok(0);
        }

        if !shared_history_from_history_visibility(&settings.history_visibility) {
            debug!(
                history_visibility = ?settings.history_visibility,
                "The history of the room isn't shared, not forwarding any room keys"
            );
            return Ok(0);
        }

        let sessions: Vec<InboundGroupSession> = self
            .store
            .get_inbound_group_sessions_by_room_id(room_id)
            .await?
            .into_iter()
            .filter(|s| s.shared_history())
            .collect();

        if sessions.is_empty() {
            return Ok(0);
        }

        self.session_manager.ensure_sessions([invitee]).await?;

        let only_trusted = settings.only_allow_trusted_devices || global_only_trusted;
        let devices: Vec<DeviceData> = self
            .store
            .get_user_devices(invitee)
            .await?
            .into_values()
            .filter(|d| !d.is_blacklisted() && (!only_trusted || d.is_verified()))
            .collect();

        let mut requests = Vec::new();
        let mut used_sessions = Vec::new();

        for session in &sessions {
            let mut content: ForwardedRoomKeyContent = session.export().await.into();
            content.shared_history = true;
            let content = serde_json::to_value(content)?;

            let mut request = ToDeviceRequest::empty(ToDeviceEncryptedEventContent::EVENT_TYPE);

            for device in &devices {
                match encrypt_for_device(
                    &self.store,
                    device,
                    ForwardedRoomKeyContent::EVENT_TYPE,
                    content.clone(),
                )
                .await
                {
                    Ok((olm_session, encrypted)) => {
                        request.add(
                            device.user_id(),
                            device.device_id().to_owned(),
                            serde_json::to_value(encrypted)?,
                        );
                        used_sessions.push(olm_session);
                    }
                    Err(OlmError::MissingSession) => {
                        warn!(
                            device_id = ?device.device_id(),
                            "No Olm session with the invited device, can't forward the room key"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            if request.message_count() > 0 {
                requests.push(request);
            }
        }

        if requests.is_empty() {
            return Ok(0);
        }

        self.store.save_sessions(&used_sessions).await?;

        for request in &requests {
            self.transport.send_to_device(request).await?;
        }

        info!(room_key_count = requests.len(), "Forwarded the room history to an invited user");

        Ok(requests.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::{assert_let, assert_matches};
    use ruma::{
        device_id, events::room::history_visibility::HistoryVisibility, room_id, user_id,
        RoomId,
    };
    use serde_json::{json, Value};
    use vodozemac::olm::OlmMessage;

    use super::GroupSessionManager;
    use crate::{
        error::{MegolmError, OlmError},
        identities::{DeviceData, LocalTrust},
        locks::RwLock as StdRwLock,
        machine::{test_helpers::MockTransport, GlobalSettings},
        olm::{Account, EncryptionSettings, ShareState},
        session_manager::SessionManager,
        store::{Changes, MemoryStore, Store},
        types::{
            events::room::encrypted::ToDeviceEncryptedEventContent, requests::ToDeviceRequest,
        },
        utilities::{Clock, MockClock},
    };

    fn room_id() -> &'static RoomId {
        room_id!("!test:localhost")
    }

    struct Setup {
        manager: GroupSessionManager,
        store: Store,
        bob: Account,
        transport: MockTransport,
        settings: Arc<StdRwLock<GlobalSettings>>,
        clock: MockClock,
    }

    async fn setup(bob_has_keys: bool, bob_trust: LocalTrust) -> Setup {
        let clock = MockClock::default();
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let own_device = DeviceData::from_account(&alice);
        let mut bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));

        let store = Store::new(alice, Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        let pickle = store.account().await.pickle();
        store.save_changes(Changes { account: Some(pickle), ..Default::default() }).await.unwrap();

        let mut bob_device = DeviceData::try_from(&bob.device_keys()).unwrap();
        bob_device.set_trust_state(bob_trust);
        store.save_device_data(&[own_device, bob_device]).await.unwrap();

        let transport = MockTransport::default();

        if bob_has_keys {
            bob.generate_one_time_keys(5);
            transport.add_one_time_keys(bob.user_id(), bob.device_id(), bob.signed_one_time_keys());
            bob.mark_keys_as_published();
        }

        let transport_arc = Arc::new(transport.clone());
        let settings: Arc<StdRwLock<GlobalSettings>> = Default::default();
        let session_manager = SessionManager::new(store.clone(), transport_arc.clone());
        let manager =
            GroupSessionManager::new(store.clone(), transport_arc, session_manager, settings.clone());

        Setup { manager, store, bob, transport, settings, clock }
    }

    fn members(store: &Store, bob: &Account) -> Vec<ruma::OwnedUserId> {
        vec![store.user_id().to_owned(), bob.user_id().to_owned()]
    }

    /// Decrypt the pre-key message the request carries for bob.
    fn decrypt_for_bob(bob: &mut Account, request: &ToDeviceRequest, clock: &MockClock) -> Value {
        let content = request.messages[bob.user_id()].values().next().unwrap().clone();
        let content: ToDeviceEncryptedEventContent = serde_json::from_value(content).unwrap();
        assert_let!(
            OlmMessage::PreKey(prekey) = content.message_for(bob.identity_keys().curve25519).unwrap()
        );

        let result = bob.create_inbound_session(content.sender_key, &prekey, clock.now()).unwrap();
        serde_json::from_str(&result.plaintext).unwrap()
    }

    #[tokio::test]
    async fn test_room_key_is_shared_once() {
        let Setup { manager, store, mut bob, transport, clock, .. } =
            setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room.encrypted");
        assert_eq!(sent[0].message_count(), 1, "Our own device never gets the key");

        let outbound = manager.session_cache().get(room_id()).unwrap();
        assert!(outbound.shared());

        let event = decrypt_for_bob(&mut bob, &sent[0], &clock);
        assert_eq!(event["type"], "m.room_key");
        assert_eq!(event["content"]["session_id"], outbound.session_id());

        let bob_device = store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert_eq!(outbound.is_shared_with(&bob_device), ShareState::Shared(0));

        // We can decrypt our own messages.
        let inbound = store
            .get_inbound_group_session(room_id(), outbound.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.first_known_index(), 0);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();
        assert!(transport.take_sent_requests().is_empty());
        assert_eq!(
            manager.session_cache().get(room_id()).unwrap().session_id(),
            outbound.session_id()
        );
    }

    #[tokio::test]
    async fn test_failed_send_leaves_the_device_unshared() {
        let Setup { manager, store, bob, transport, .. } = setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        transport.set_fail_sends(true);
        let result = manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await;
        assert_matches!(result, Err(OlmError::Transport(_)));

        let outbound = manager.session_cache().get(room_id()).unwrap();
        let bob_device = store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert_eq!(outbound.is_shared_with(&bob_device), ShareState::NotShared);
        assert!(!outbound.shared());

        transport.set_fail_sends(false);
        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        assert_eq!(transport.take_sent_requests().len(), 1);
        assert_matches!(outbound.is_shared_with(&bob_device), ShareState::Shared(_));
        assert!(outbound.shared());
    }

    #[tokio::test]
    async fn test_blacklisted_devices_are_withheld() {
        let Setup { manager, store, bob, transport, .. } =
            setup(true, LocalTrust::BlackListed).await;
        let users = members(&store, &bob);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key.withheld");

        let content = sent[0].messages[bob.user_id()].values().next().unwrap();
        assert_eq!(content["code"], "m.blacklisted");
        assert_eq!(content["room_id"], room_id().as_str());

        // The notice is only sent once.
        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();
        assert!(transport.take_sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unverified_devices_are_withheld_if_only_trusted_allowed() {
        let Setup { manager, store, bob, transport, settings, .. } =
            setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        settings.write().only_allow_trusted_devices = true;

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        let content = sent[0].messages[bob.user_id()].values().next().unwrap();
        assert_eq!(content["code"], "m.unverified");
    }

    #[tokio::test]
    async fn test_devices_without_olm_session_get_no_olm() {
        let Setup { manager, store, bob, transport, .. } = setup(false, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key.withheld");

        let content = sent[0].messages[bob.user_id()].values().next().unwrap();
        assert_eq!(content["code"], "m.no_olm");
        assert!(content.get("room_id").is_none());
        assert!(content.get("session_id").is_none());
    }

    #[tokio::test]
    async fn test_rotation_on_visibility_bucket_change() {
        let Setup { manager, store, bob, transport, .. } = setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();
        transport.take_sent_requests();
        let first = manager.session_cache().get(room_id()).unwrap();

        // Shared and world readable are in the same bucket.
        let settings = EncryptionSettings {
            history_visibility: HistoryVisibility::WorldReadable,
            ..Default::default()
        };
        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), settings)
            .await
            .unwrap();
        assert_eq!(manager.session_cache().get(room_id()).unwrap().session_id(), first.session_id());
        assert!(transport.take_sent_requests().is_empty());

        let settings = EncryptionSettings {
            history_visibility: HistoryVisibility::Joined,
            ..Default::default()
        };
        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), settings)
            .await
            .unwrap();

        let second = manager.session_cache().get(room_id()).unwrap();
        assert_ne!(second.session_id(), first.session_id());
        assert_eq!(transport.take_sent_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_when_a_member_leaves() {
        let Setup { manager, store, bob, .. } = setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();
        let first = manager.session_cache().get(room_id()).unwrap();

        manager.share_room_key(room_id(), [store.user_id()], Default::default()).await.unwrap();

        let second = manager.session_cache().get(room_id()).unwrap();
        assert_ne!(second.session_id(), first.session_id());
    }

    #[tokio::test]
    async fn test_encryption_needs_a_shared_session() {
        let Setup { manager, store, bob, .. } = setup(true, LocalTrust::Unset).await;
        let users = members(&store, &bob);

        let result = manager.encrypt(room_id(), "m.room.message", json!({"body": "Hi"})).await;
        assert_matches!(result, Err(MegolmError::MissingOutboundSession(_)));

        manager
            .share_room_key(room_id(), users.iter().map(|u| u.as_ref()), Default::default())
            .await
            .unwrap();

        let content =
            manager.encrypt(room_id(), "m.room.message", json!({"body": "Hi"})).await.unwrap();
        let outbound = manager.session_cache().get(room_id()).unwrap();
        assert_eq!(content.session_id, outbound.session_id());
        assert_eq!(outbound.message_index().await, 1);

        assert!(manager.discard_outbound_session(room_id()).await.unwrap());
        let result = manager.encrypt(room_id(), "m.room.message", json!({"body": "Hi"})).await;
        assert_matches!(result, Err(MegolmError::MissingOutboundSession(_)));
    }

    #[tokio::test]
    async fn test_room_history_is_forwarded_to_invitees() {
        let Setup { manager, store, mut bob, transport, settings, clock } =
            setup(true, LocalTrust::Unset).await;

        // Alice is alone in the room at first.
        manager.share_room_key(room_id(), [store.user_id()], Default::default()).await.unwrap();
        assert!(transport.take_sent_requests().is_empty());

        let forwarded = manager
            .share_room_history_with(room_id(), bob.user_id(), &Default::default())
            .await
            .unwrap();
        assert_eq!(forwarded, 0, "Sharing keys on invite is disabled by default");

        settings.write().share_keys_on_invite = true;

        let joined_only =
            EncryptionSettings { history_visibility: HistoryVisibility::Joined, ..Default::default() };
        let forwarded =
            manager.share_room_history_with(room_id(), bob.user_id(), &joined_only).await.unwrap();
        assert_eq!(forwarded, 0);

        let forwarded = manager
            .share_room_history_with(room_id(), bob.user_id(), &Default::default())
            .await
            .unwrap();
        assert_eq!(forwarded, 1);

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);

        let event = decrypt_for_bob(&mut bob, &sent[0], &clock);
        assert_eq!(event["type"], "m.forwarded_room_key");
        assert_eq!(event["content"]["org.matrix.msc3061.shared_history"], true);
        assert_eq!(
            event["content"]["session_id"],
            manager.session_cache().get(room_id()).unwrap().session_id()
        );
    }
}
