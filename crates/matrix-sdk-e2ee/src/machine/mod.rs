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
    collections::{btree_map::Entry, BTreeMap},
    io::Read,
    sync::Arc,
};

use as_variant::as_variant;
use futures_util::future::join_all;
use ruma::{
    serde::JsonObject, DeviceId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, field::display, info, instrument, trace, warn, Span};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    backups::{BackupError, BackupMachine},
    error::{MegolmError, MegolmResult, OlmError, OlmResult},
    file_encryption::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError},
    gossiping::GossipMachine,
    identities::{self, DeviceData, LocalTrust, RoomShield, ShieldSnapshot, UserIdentity},
    locks::RwLock as StdRwLock,
    olm::{
        Account, DecryptionResult, EncryptionSettings, ExportedRoomKey, IdentityKeys,
        InboundGroupSession, OlmDecryptionInfo, SenderDataType,
    },
    session_manager::{GroupSessionManager, SessionManager},
    store::{
        Changes, CryptoStoreError, DeviceChanges, IdentityChanges, IntoCryptoStore,
        Result as StoreResult, RoomKeyImportResult, Store,
    },
    transport::Transport,
    types::{
        events::{
            olm_v1::AnyDecryptedOlmEvent,
            room::encrypted::{
                EncryptedEvent, RoomEncryptedEventContent, ToDeviceEncryptedEventContent,
            },
            ToDeviceCustomEvent, ToDeviceEvent, ToDeviceEvents,
        },
        DeviceKeys, OneTimeKeys,
    },
    utilities::Clock,
};

#[cfg(test)]
pub(crate) mod test_helpers;

/// Settings that apply to every room the machine encrypts for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Withhold room keys from every unverified device, whatever the room
    /// settings say.
    pub only_allow_trusted_devices: bool,
    /// Forward the room keys of rooms with a shared history to users we
    /// invite, and accept such keys from the users who invite us.
    pub share_keys_on_invite: bool,
}

/// How much we trust the device that sent an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// The device is verified, and owns the key that signed the room key.
    Verified,
    /// The device is known but we didn't verify it.
    Unverified,
    /// We don't know the device that created the room key.
    UnknownDevice,
    /// The Ed25519 key the room key claims doesn't belong to the device with
    /// its Curve25519 key, someone is impersonating the device.
    MismatchedKeys,
}

/// Where a decrypted room event came from, and how much we trust it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionInfo {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The device that created the room key, if we know it.
    pub sender_device: Option<OwnedDeviceId>,
    /// The Curve25519 key of the device that created the room key.
    pub sender_curve25519_key: Curve25519PublicKey,
    /// The Ed25519 key the room key claims to be signed with.
    pub claimed_ed25519_key: Ed25519PublicKey,
    /// The id of the room key.
    pub session_id: String,
    /// The message index the event was encrypted at.
    pub message_index: u32,
    /// The Curve25519 keys of the devices that forwarded the room key to us.
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
    /// The room key didn't come directly from its creator, it was forwarded,
    /// imported from a file or restored from a backup.
    pub forwarded: bool,
    /// Every device that forwarded the room key is one of our own verified
    /// devices, or the verified device that created it.
    pub forwarding_chain_trusted: bool,
    /// The trust in the device that created the room key.
    pub verification_state: VerificationState,
}

/// A successfully decrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The cleartext event, with the `sender`, `event_id`,
    /// `origin_server_ts` and `unsigned` fields of the encrypted event.
    pub event: JsonObject,
    /// Where the event came from.
    pub encryption_info: EncryptionInfo,
}

/// A to-device event after the machine handled it.
#[derive(Clone, Debug)]
pub enum ProcessedToDeviceEvent {
    /// An Olm encrypted event that was decrypted.
    Decrypted {
        /// The decrypted event.
        raw_event: Value,
        /// The Curve25519 key of the sending device.
        sender_key: Curve25519PublicKey,
        /// The sending device, if we know it.
        sender_device: Option<OwnedDeviceId>,
    },
    /// An Olm encrypted event we couldn't decrypt.
    UnableToDecrypt {
        /// The sender of the event.
        sender: OwnedUserId,
    },
    /// An event the machine handled in the clear, with its type.
    PlainText(String),
    /// An event the machine doesn't know about.
    Custom(ToDeviceCustomEvent),
}

impl ProcessedToDeviceEvent {
    /// The decrypted event, if the event was Olm encrypted and could be
    /// decrypted.
    pub fn decrypted_event(&self) -> Option<&Value> {
        as_variant!(self, Self::Decrypted { raw_event, .. } => raw_event)
    }
}

/// State machine implementation of the Olm/Megolm encryption protocol used for
/// Matrix end to end encryption.
///
/// The machine never touches the network itself, requests go out through the
/// [`Transport`] it was created with.
#[derive(Clone)]
pub struct OlmMachine {
    inner: Arc<OlmMachineInner>,
}

struct OlmMachineInner {
    /// The unique user id that owns this account.
    user_id: OwnedUserId,
    /// The unique device ID of the device that holds this account.
    device_id: OwnedDeviceId,
    /// Store for the encryption keys.
    store: Store,
    settings: Arc<StdRwLock<GlobalSettings>>,
    /// Creates Olm sessions and replaces wedged ones.
    session_manager: SessionManager,
    /// Keeps track of our outbound group sessions.
    group_session_manager: GroupSessionManager,
    /// Handles outgoing and incoming key requests.
    key_request_machine: GossipMachine,
    /// Uploads room keys to the server-side backup.
    backup_machine: BackupMachine,
    /// Timeline → `sender_key|session_id|message_index` → event id, the
    /// message indices already used in each timeline.
    decrypted_indices: StdRwLock<BTreeMap<String, BTreeMap<String, OwnedEventId>>>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a new machine, restoring the account from the store or creating
    /// a new one if the store is empty.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `store` - The store the keys are persisted in.
    ///
    /// * `transport` - Sends the requests of the machine to the homeserver.
    ///
    /// * `clock` - The time source for session timestamps and rotation.
    #[instrument(skip(store, transport, clock), fields(ed25519_key, curve25519_key))]
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        store: impl IntoCryptoStore,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let crypto_store = store.into_crypto_store();

        let (account, created) = match crypto_store.load_account().await? {
            Some(account) => {
                if user_id != account.user_id() || device_id != account.device_id() {
                    return Err(CryptoStoreError::MismatchedAccount {
                        expected: (user_id.to_owned(), device_id.to_owned()),
                        got: (account.user_id().to_owned(), account.device_id().to_owned()),
                    });
                }

                debug!("Restored an Olm account");
                (account, false)
            }
            None => {
                debug!("Creating a new Olm account");
                (Account::new(user_id, device_id), true)
            }
        };

        Span::current()
            .record("ed25519_key", display(account.identity_keys().ed25519))
            .record("curve25519_key", display(account.identity_keys().curve25519));

        let own_device = created.then(|| DeviceData::from_account(&account));
        let pickle = created.then(|| account.pickle());
        let store = Store::new(account, crypto_store, clock);

        if created {
            let changes = Changes {
                account: pickle,
                devices: DeviceChanges {
                    new: own_device.into_iter().collect(),
                    ..Default::default()
                },
                ..Default::default()
            };
            store.save_changes(changes).await?;
        }

        let saved_keys = store.load_backup_keys().await?;
        let backup_key = saved_keys.decryption_key.and_then(|key| {
            saved_keys.backup_version.map(|version| {
                let backup_key = key.megolm_v1_public_key();
                backup_key.set_version(version);
                backup_key
            })
        });

        let settings: Arc<StdRwLock<GlobalSettings>> = Default::default();
        let session_manager = SessionManager::new(store.clone(), transport.clone());
        let group_session_manager = GroupSessionManager::new(
            store.clone(),
            transport.clone(),
            session_manager.clone(),
            settings.clone(),
        );
        let key_request_machine = GossipMachine::new(
            store.clone(),
            transport.clone(),
            session_manager.clone(),
            group_session_manager.session_cache().clone(),
            settings.clone(),
        );
        let backup_machine = BackupMachine::new(store.clone(), transport, backup_key);

        Ok(Self {
            inner: Arc::new(OlmMachineInner {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                store,
                settings,
                session_manager,
                group_session_manager,
                key_request_machine,
                backup_machine,
                decrypted_indices: Default::default(),
            }),
        })
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The unique device ID that identifies this `OlmMachine`.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.inner.store.static_account().identity_keys()
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The machine that uploads our room keys to the server-side backup.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.inner.backup_machine
    }

    /// The settings that apply to every room.
    pub fn settings(&self) -> GlobalSettings {
        self.inner.settings.read().clone()
    }

    /// Forward the room history to users we invite, and accept history
    /// forwarded to us when we're invited.
    pub fn enable_share_key_on_invite(&self, enabled: bool) {
        self.inner.settings.write().share_keys_on_invite = enabled;
    }

    /// Withhold room keys from all unverified devices.
    pub fn set_only_allow_trusted_devices(&self, only_trusted: bool) {
        self.inner.settings.write().only_allow_trusted_devices = only_trusted;
    }

    /// Our own device keys, signed by our account, to publish to the server.
    pub async fn device_keys(&self) -> DeviceKeys {
        self.inner.store.account().await.device_keys()
    }

    /// Generate new one-time keys and mark them as published.
    ///
    /// The returned keys are signed and must be uploaded to the server, other
    /// devices claim them to create Olm sessions with us.
    pub async fn generate_one_time_keys(&self, count: usize) -> StoreResult<OneTimeKeys> {
        let mut account = self.inner.store.account().await;

        account.generate_one_time_keys(count);
        let keys = account.signed_one_time_keys();
        account.mark_keys_as_published();

        let changes = Changes { account: Some(account.pickle()), ..Default::default() };
        self.inner.store.save_changes(changes).await?;

        Ok(keys)
    }

    /// Update the devices of a user with the result of a key query.
    ///
    /// `device_keys` must be the complete device list of the user, devices we
    /// know about that aren't part of it are removed. Device keys with an
    /// invalid signature are ignored.
    #[instrument(skip(self, device_keys))]
    pub async fn receive_device_keys(
        &self,
        user_id: &UserId,
        device_keys: Vec<DeviceKeys>,
    ) -> StoreResult<DeviceChanges> {
        let mut stored = self.inner.store.get_user_devices(user_id).await?;
        let mut changes = DeviceChanges::default();

        for keys in device_keys {
            if keys.user_id != user_id {
                warn!(device_user_id = ?keys.user_id, "Ignoring device keys of a different user");
                continue;
            }

            // Our own device comes from our account, not from the server.
            if user_id == self.user_id() && keys.device_id == self.device_id() {
                stored.remove(self.device_id());
                continue;
            }

            match stored.remove(&keys.device_id) {
                Some(mut device) => match device.update_device(&keys) {
                    Ok(true) => changes.changed.push(device),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(device_id = ?keys.device_id, error = ?e, "Failed to update a device")
                    }
                },
                None => match DeviceData::try_from(&keys) {
                    Ok(device) => {
                        info!(device_id = ?keys.device_id, "Adding a new device");
                        changes.new.push(device);
                    }
                    Err(e) => {
                        warn!(
                            device_id = ?keys.device_id,
                            error = ?e,
                            "Failed to create a new device"
                        )
                    }
                },
            }
        }

        changes.deleted = stored
            .into_values()
            .filter(|d| !(d.user_id() == self.user_id() && d.device_id() == self.device_id()))
            .collect();

        let to_save = Changes { devices: changes.clone(), ..Default::default() };
        self.inner.store.save_changes(to_save).await?;

        Ok(changes)
    }

    /// Update the cross-signing identity of a user.
    ///
    /// A new master key resets the verification of the identity, and the
    /// cross-signing trust of the user's devices, since those were signed
    /// by the old identity.
    ///
    /// Returns `true` if the identity is new or changed.
    #[instrument(skip(self, master_key))]
    pub async fn receive_user_identity(
        &self,
        user_id: &UserId,
        master_key: Ed25519PublicKey,
    ) -> StoreResult<bool> {
        let mut changes = Changes::default();

        match self.inner.store.get_user_identity(user_id).await? {
            Some(mut identity) => {
                if !identity.update(master_key) {
                    return Ok(false);
                }

                changes.identities =
                    IdentityChanges { changed: vec![identity], ..Default::default() };
                changes.devices.changed = self
                    .inner
                    .store
                    .get_user_devices(user_id)
                    .await?
                    .into_values()
                    .map(|mut d| {
                        d.set_cross_signing_trusted(false);
                        d
                    })
                    .collect();
            }
            None => {
                let identity = UserIdentity::new(user_id.to_owned(), master_key);
                changes.identities = IdentityChanges { new: vec![identity], ..Default::default() };
            }
        }

        self.inner.store.save_changes(changes).await?;

        Ok(true)
    }

    /// Mark the identity of the user as verified.
    ///
    /// Returns `false` if we don't know the identity.
    pub async fn verify_user_identity(&self, user_id: &UserId) -> StoreResult<bool> {
        self.update_user_identity(user_id, UserIdentity::mark_as_verified).await
    }

    /// Accept that a user we verified in the past isn't verified anymore.
    ///
    /// Returns `false` if we don't know the identity.
    pub async fn withdraw_verification(&self, user_id: &UserId) -> StoreResult<bool> {
        self.update_user_identity(user_id, UserIdentity::withdraw_verification).await
    }

    async fn update_user_identity(
        &self,
        user_id: &UserId,
        update: impl FnOnce(&mut UserIdentity),
    ) -> StoreResult<bool> {
        let Some(mut identity) = self.inner.store.get_user_identity(user_id).await? else {
            return Ok(false);
        };

        update(&mut identity);

        let changes = Changes {
            identities: IdentityChanges { changed: vec![identity], ..Default::default() },
            ..Default::default()
        };
        self.inner.store.save_changes(changes).await?;

        Ok(true)
    }

    /// Set the local trust state of a device.
    ///
    /// Returns `false` if we don't know the device.
    #[instrument(skip(self))]
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> StoreResult<bool> {
        let Some(mut device) = self.inner.store.get_device(user_id, device_id).await? else {
            return Ok(false);
        };

        device.set_trust_state(trust);
        self.inner.store.save_device_data(&[device]).await?;

        Ok(true)
    }

    /// Record whether the device is signed by the self-signing key of its
    /// owner's verified identity.
    ///
    /// Returns `false` if we don't know the device.
    pub async fn set_cross_signing_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trusted: bool,
    ) -> StoreResult<bool> {
        let Some(mut device) = self.inner.store.get_device(user_id, device_id).await? else {
            return Ok(false);
        };

        device.set_cross_signing_trusted(trusted);
        self.inner.store.save_device_data(&[device]).await?;

        Ok(true)
    }

    /// Handle a to-device event we received from the server.
    ///
    /// Olm encrypted events are decrypted and the room keys they carry are
    /// stored. Key requests are answered once the event has been handled.
    ///
    /// A failure to decrypt isn't an error, it is reported as
    /// [`ProcessedToDeviceEvent::UnableToDecrypt`]. Only store failures are.
    pub async fn receive_to_device_event(
        &self,
        event: &ToDeviceEvents,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        let processed = self.handle_to_device_event(event).await?;
        self.process_key_requests().await;

        Ok(processed)
    }

    /// Handle a batch of to-device events, answering the key requests among
    /// them once all of them have been handled.
    pub async fn receive_to_device_events(
        &self,
        events: &[ToDeviceEvents],
    ) -> OlmResult<Vec<ProcessedToDeviceEvent>> {
        let mut processed = Vec::with_capacity(events.len());

        for event in events {
            processed.push(self.handle_to_device_event(event).await?);
        }

        self.process_key_requests().await;

        Ok(processed)
    }

    async fn process_key_requests(&self) {
        if let Err(e) = self.inner.key_request_machine.collect_incoming_key_requests().await {
            warn!(error = ?e, "Failed to answer the incoming key requests");
        }
    }

    #[instrument(skip_all, fields(sender = ?event.sender(), event_type = event.event_type()))]
    async fn handle_to_device_event(
        &self,
        event: &ToDeviceEvents,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        trace!("Received a to-device event");

        match event {
            ToDeviceEvents::RoomEncrypted(e) => self.decrypt_to_device_event(e).await,
            ToDeviceEvents::RoomKeyRequest(e) => {
                self.inner.key_request_machine.receive_incoming_key_request(e);
                Ok(ProcessedToDeviceEvent::PlainText(event.event_type().to_owned()))
            }
            ToDeviceEvents::RoomKeyWithheld(e) => {
                self.inner.key_request_machine.receive_withheld(e).await?;
                Ok(ProcessedToDeviceEvent::PlainText(event.event_type().to_owned()))
            }
            ToDeviceEvents::Dummy(_) => {
                Ok(ProcessedToDeviceEvent::PlainText(event.event_type().to_owned()))
            }
            ToDeviceEvents::Custom(e) => Ok(ProcessedToDeviceEvent::Custom(e.clone())),
        }
    }

    async fn decrypt_to_device_event(
        &self,
        event: &ToDeviceEvent<ToDeviceEncryptedEventContent>,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        let result = {
            let mut account = self.inner.store.account().await;
            account.decrypt_to_device_event(&self.inner.store, event).await
        };

        match result {
            Ok(info) => self.handle_decrypted_to_device_event(info).await,
            Err(OlmError::SessionWedged(sender, sender_key)) => {
                self.inner.session_manager.mark_device_as_wedged(&sender, sender_key);
                Ok(ProcessedToDeviceEvent::UnableToDecrypt { sender })
            }
            Err(OlmError::Store(e)) => Err(e.into()),
            Err(e) => {
                warn!(sender = ?event.sender, error = ?e, "Failed to decrypt a to-device event");
                Ok(ProcessedToDeviceEvent::UnableToDecrypt { sender: event.sender.clone() })
            }
        }
    }

    async fn handle_decrypted_to_device_event(
        &self,
        info: OlmDecryptionInfo,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        let OlmDecryptionInfo { session, result } = info;
        let DecryptionResult { event, raw_event, sender_key, sender_device } = result;

        let created = session.created();
        self.inner.store.save_sessions(&[session.session()]).await?;

        match &*event {
            AnyDecryptedOlmEvent::RoomKey(e) => {
                match InboundGroupSession::from_room_key_content(
                    sender_key,
                    e.keys.ed25519,
                    &e.content,
                ) {
                    Ok(session) => {
                        if let Some(session) =
                            self.inner.store.merge_received_group_session(session).await?
                        {
                            self.inner.store.save_inbound_group_sessions(&[session]).await?;
                        }
                    }
                    Err(e) => {
                        warn!(?sender_key, error = ?e, "Received an invalid room key");
                    }
                }
            }
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => {
                self.inner
                    .key_request_machine
                    .receive_forwarded_room_key(&e.sender, sender_key, &e.content)
                    .await?;
            }
            AnyDecryptedOlmEvent::Dummy(_) => {
                trace!(?sender_key, "Received an m.dummy event");
            }
            AnyDecryptedOlmEvent::Custom(_) => {}
        }

        // Requests we couldn't answer for lack of an Olm session can be
        // answered now.
        if created {
            if let Some(device) = &sender_device {
                self.inner.key_request_machine.retry_keyshare(device.user_id(), device.device_id());
            }
        }

        Ok(ProcessedToDeviceEvent::Decrypted {
            raw_event,
            sender_key,
            sender_device: sender_device.map(|d| d.device_id().to_owned()),
        })
    }

    /// Create new Olm sessions with the devices we failed to decrypt an Olm
    /// message from, and let them know with an `m.dummy` event.
    pub async fn unwedge_devices_if_needed(&self) -> OlmResult<()> {
        self.inner.session_manager.unwedge_devices_if_needed().await
    }

    /// The id of the Olm session we would encrypt with for the given device.
    pub async fn last_used_session_id(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<String>> {
        let Some(sender_key) = self
            .inner
            .store
            .get_device(user_id, device_id)
            .await?
            .and_then(|d| d.curve25519_key())
        else {
            return Ok(None);
        };

        Ok(self
            .inner
            .store
            .last_used_session(sender_key)
            .await?
            .map(|s| s.session_id().to_owned()))
    }

    /// Decrypt an event from a room timeline.
    ///
    /// A missing room key is requested from our other devices, and from the
    /// sender if we verified them, unless the sender told us it won't share
    /// the key.
    ///
    /// # Arguments
    ///
    /// * `event` - The event that should be decrypted.
    ///
    /// * `room_id` - The ID of the room where the event was sent to.
    ///
    /// * `timeline` - The timeline the event is shown in. Two different events
    ///   of one timeline using the same message index are rejected as a
    ///   replay. `None` skips the check.
    #[instrument(
        skip_all,
        fields(
            ?room_id,
            event_id = ?event.event_id,
            sender = ?event.sender,
            session_id = event.content.session_id
        )
    )]
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        timeline: Option<&str>,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let session_id = &event.content.session_id;

        let Some(session) =
            self.inner.store.get_inbound_group_session(room_id, session_id).await?
        else {
            return Err(self.handle_missing_room_key(room_id, event).await);
        };

        let (decrypted, message_index) = session.decrypt(event).await?;

        if let Some(timeline) = timeline {
            self.check_replay(timeline, &session, message_index, event)?;
        }

        let encryption_info = self.encryption_info(&session, &event.sender, message_index).await?;

        trace!(
            message_index,
            verification_state = ?encryption_info.verification_state,
            "Decrypted a room event"
        );

        Ok(DecryptedRoomEvent { event: decrypted, encryption_info })
    }

    async fn handle_missing_room_key(
        &self,
        room_id: &RoomId,
        event: &EncryptedEvent,
    ) -> MegolmError {
        let session_id = &event.content.session_id;

        match self.inner.store.get_withheld_info(room_id, session_id).await {
            Ok(Some(withheld)) => {
                debug!(code = ?withheld.code, "The room key was withheld from us");
                return MegolmError::MissingRoomKey(Some(withheld.code));
            }
            Ok(None) => {}
            Err(e) => return e.into(),
        }

        if let Err(e) = self.inner.key_request_machine.request_key(room_id, event).await {
            warn!(error = ?e, "Failed to request the missing room key");
        }

        MegolmError::MissingRoomKey(None)
    }

    fn check_replay(
        &self,
        timeline: &str,
        session: &InboundGroupSession,
        message_index: u32,
        event: &EncryptedEvent,
    ) -> MegolmResult<()> {
        let key = format!(
            "{}|{}|{}",
            session.sender_key().to_base64(),
            session.session_id(),
            message_index
        );

        let mut timelines = self.inner.decrypted_indices.write();

        match timelines.entry(timeline.to_owned()).or_default().entry(key) {
            Entry::Occupied(e) if *e.get() != event.event_id => {
                warn!(
                    message_index,
                    first_event_id = ?e.get(),
                    "A different event of the timeline was already decrypted at this message index"
                );
                Err(MegolmError::DuplicatedMessageIndex(message_index))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(event.event_id.clone());
                Ok(())
            }
        }
    }

    /// Forget the message indices decrypted in the given timeline, for
    /// example because the timeline was cleared and will be reloaded.
    pub fn reset_replay_attack_check_in_timeline(&self, timeline: &str) {
        self.inner.decrypted_indices.write().remove(timeline);
    }

    async fn encryption_info(
        &self,
        session: &InboundGroupSession,
        sender: &UserId,
        message_index: u32,
    ) -> StoreResult<EncryptionInfo> {
        let claimed_ed25519_key = session.signing_keys().ed25519;
        let device =
            self.inner.store.get_device_from_curve_key(sender, session.sender_key()).await?;

        let verification_state = match &device {
            None => VerificationState::UnknownDevice,
            Some(d) if d.ed25519_key() != Some(claimed_ed25519_key) => {
                VerificationState::MismatchedKeys
            }
            Some(d) if d.is_verified() => VerificationState::Verified,
            Some(_) => VerificationState::Unverified,
        };

        let chain = session.forwarding_key_chain().to_vec();

        let forwarding_chain_trusted = if chain.is_empty() {
            true
        } else {
            let own_devices = self.inner.store.get_user_devices(self.user_id()).await?;
            let creator_verified = verification_state == VerificationState::Verified;

            chain.iter().all(|key| {
                (creator_verified && *key == session.sender_key())
                    || own_devices
                        .values()
                        .any(|d| d.curve25519_key() == Some(*key) && d.is_verified())
            })
        };

        Ok(EncryptionInfo {
            sender: sender.to_owned(),
            sender_device: device.map(|d| d.device_id().to_owned()),
            sender_curve25519_key: session.sender_key(),
            claimed_ed25519_key,
            session_id: session.session_id().to_owned(),
            message_index,
            forwarding_curve25519_key_chain: chain,
            forwarded: session.sender_data_type() != SenderDataType::Direct,
            forwarding_chain_trusted,
            verification_state,
        })
    }

    /// Make sure the room key of the room is shared with all the devices of
    /// the given members, creating or rotating the key if needed.
    ///
    /// Must be called before [`OlmMachine::encrypt_room_event`].
    pub async fn ensure_outbound_session(
        &self,
        room_id: &RoomId,
        members: impl IntoIterator<Item = &UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<()> {
        self.inner.group_session_manager.share_room_key(room_id, members, settings).await
    }

    /// Encrypt an event for the room.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The id of the room the event will be sent to.
    ///
    /// * `event_type` - The type of the plaintext event.
    ///
    /// * `content` - The plaintext content of the event.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        self.inner.group_session_manager.encrypt(room_id, event_type, content).await
    }

    /// Invalidate the room key of the room, the next message is encrypted
    /// with a new one.
    ///
    /// Returns `true` if there was a room key to invalidate.
    pub async fn discard_outbound_session(&self, room_id: &RoomId) -> StoreResult<bool> {
        self.inner.group_session_manager.discard_outbound_session(room_id).await
    }

    /// A user was invited to the room, forward the room history to them if
    /// sharing keys on invite is enabled and the room history is shared.
    ///
    /// Returns the number of forwarded room keys.
    pub async fn on_member_invited(
        &self,
        room_id: &RoomId,
        invitee: &UserId,
        settings: &EncryptionSettings,
    ) -> OlmResult<usize> {
        self.inner.group_session_manager.share_room_history_with(room_id, invitee, settings).await
    }

    /// Request the room key of the event from our other devices, and from
    /// the sender if we verified them.
    ///
    /// Returns `false` if a request is already outstanding or there is
    /// nobody to ask.
    pub async fn request_room_key_for_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
    ) -> OlmResult<bool> {
        self.inner.key_request_machine.request_key(room_id, event).await
    }

    /// Cancel the outstanding request for the room key of the event and send
    /// a new one, for example after we verified a new device.
    pub async fn re_request_room_key_for_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
    ) -> OlmResult<bool> {
        self.inner.key_request_machine.re_request_key(room_id, event).await
    }

    /// Send the key requests the transport failed to deliver.
    ///
    /// Returns the number of requests that were sent.
    pub async fn send_unsent_key_requests(&self) -> OlmResult<usize> {
        self.inner.key_request_machine.send_unsent_requests().await
    }

    /// Compute the shield of a room from what we know about its members.
    ///
    /// # Arguments
    ///
    /// * `members` - The active members of the room, us included.
    ///
    /// * `is_direct` - Is the room a direct message room.
    pub async fn compute_shield(
        &self,
        members: &[OwnedUserId],
        is_direct: bool,
    ) -> StoreResult<RoomShield> {
        let mut snapshot = ShieldSnapshot::new(self.user_id().to_owned());

        for user_id in members {
            if let Some(identity) = self.inner.store.get_user_identity(user_id).await? {
                snapshot.add_identity(identity);
            }

            for device in self.inner.store.get_user_devices(user_id).await?.into_values() {
                snapshot.add_device(device);
            }
        }

        Ok(identities::compute_shield(members, is_direct, &snapshot))
    }

    /// Export all our room keys, encrypted with the given passphrase, in the
    /// armored key export format.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - The passphrase the export is encrypted with.
    ///
    /// * `rounds` - The number of PBKDF2 rounds, see
    ///   [`encrypt_room_key_export`].
    #[instrument(skip(self, passphrase))]
    pub async fn export_room_keys(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<String, KeyExportError> {
        let sessions = self.inner.store.get_inbound_group_sessions().await?;
        let keys: Vec<ExportedRoomKey> = join_all(sessions.iter().map(|s| s.export())).await;

        info!(key_count = keys.len(), "Exporting room keys");

        encrypt_room_key_export(&keys, passphrase, rounds)
    }

    /// Import the room keys of an armored key export.
    ///
    /// Keys we already have at an equal or better index are skipped.
    #[instrument(skip_all)]
    pub async fn import_room_keys(
        &self,
        export: impl Read,
        passphrase: &str,
    ) -> Result<RoomKeyImportResult, KeyExportError> {
        let keys = decrypt_room_key_export(export, passphrase)?;
        Ok(self.import_exported_room_keys(keys).await?)
    }

    /// Import room keys that were already decrypted with
    /// [`decrypt_room_key_export`].
    pub async fn import_exported_room_keys(
        &self,
        exported_keys: Vec<ExportedRoomKey>,
    ) -> StoreResult<RoomKeyImportResult> {
        self.inner.store.import_room_keys(exported_keys, None).await
    }

    /// Upload every room key that isn't backed up yet to the active backup.
    ///
    /// Returns the number of uploaded keys.
    pub async fn backup_all_group_sessions(&self) -> Result<usize, BackupError> {
        self.inner.backup_machine.backup_all_group_sessions().await
    }

    /// Restore the room keys of a backup whose key was derived from a
    /// passphrase.
    pub async fn restore_key_backup_with_password(
        &self,
        version: &str,
        password: &str,
    ) -> Result<RoomKeyImportResult, BackupError> {
        self.inner.backup_machine.restore_key_backup_with_password(version, password).await
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc, time::Duration};

    use assert_matches2::{assert_let, assert_matches};
    use ruma::{
        device_id, event_id, events::room::history_visibility::HistoryVisibility, room_id,
        user_id, OwnedUserId, RoomId,
    };
    use serde_json::{json, Value};

    use super::{
        test_helpers::{
            alice_id, bob_id, deliver, get_machine, get_machine_pair, publish_one_time_keys,
            to_device_events_for, MockTransport,
        },
        OlmMachine, ProcessedToDeviceEvent, VerificationState,
    };
    use crate::{
        backups::BackupDecryptionKey,
        error::MegolmError,
        identities::{LocalTrust, RoomShield},
        olm::EncryptionSettings,
        store::{CryptoStore, CryptoStoreError, IntoCryptoStore, MemoryStore},
        types::{
            backup::{BackupVersion, RoomKeyBackupInfo},
            events::{
                room::encrypted::{EncryptedEvent, RoomEncryptedEventContent},
                room_key_withheld::WithheldCode,
            },
        },
        utilities::{millis, MockClock},
    };

    fn room_id() -> &'static RoomId {
        room_id!("!test:example.org")
    }

    fn encrypted_event(
        sender: &OlmMachine,
        event_id: &str,
        content: RoomEncryptedEventContent,
    ) -> EncryptedEvent {
        EncryptedEvent {
            sender: sender.user_id().to_owned(),
            event_id: event_id.try_into().unwrap(),
            origin_server_ts: millis(1),
            content,
            unsigned: Default::default(),
        }
    }

    /// Alice shares a room key with Bob and encrypts a message with it.
    async fn share_and_encrypt(
        alice: &OlmMachine,
        bob: &OlmMachine,
        transport: &MockTransport,
    ) -> EncryptedEvent {
        alice
            .ensure_outbound_session(room_id(), [bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        deliver(&transport.take_sent_requests(), alice.user_id(), bob).await;

        let content = json!({"body": "It is a secret to everybody"});
        let content =
            alice.encrypt_room_event(room_id(), "m.room.message", content).await.unwrap();

        encrypted_event(alice, "$message:example.org", content)
    }

    #[tokio::test]
    async fn test_create_and_restore_machine() {
        let store = MemoryStore::new().into_crypto_store();
        let transport = MockTransport::default();
        let clock = Arc::new(MockClock::default());

        let machine = OlmMachine::new(
            alice_id(),
            device_id!("ALICEDEVICE"),
            store.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        )
        .await
        .unwrap();

        let own_device =
            store.get_device(alice_id(), device_id!("ALICEDEVICE")).await.unwrap().unwrap();
        assert!(own_device.is_verified());

        let restored = OlmMachine::new(
            alice_id(),
            device_id!("ALICEDEVICE"),
            store.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        )
        .await
        .unwrap();
        assert_eq!(restored.identity_keys(), machine.identity_keys());

        let result = OlmMachine::new(
            alice_id(),
            device_id!("OTHERDEVICE"),
            store,
            Arc::new(transport),
            clock,
        )
        .await;
        assert_matches!(result, Err(CryptoStoreError::MismatchedAccount { .. }));
    }

    #[tokio::test]
    async fn test_room_key_sharing_and_decryption() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        let event = share_and_encrypt(&alice, &bob, &transport).await;

        let decrypted = bob.decrypt_room_event(&event, room_id(), None).await.unwrap();

        assert_eq!(decrypted.event["content"]["body"], "It is a secret to everybody");
        assert_eq!(decrypted.event["sender"], alice_id().as_str());

        let info = &decrypted.encryption_info;
        assert_eq!(info.sender_device.as_deref(), Some(alice.device_id()));
        assert_eq!(info.sender_curve25519_key, alice.identity_keys().curve25519);
        assert_eq!(info.verification_state, VerificationState::Unverified);
        assert_eq!(info.message_index, 0);
        assert!(!info.forwarded);

        bob.set_local_trust(alice.user_id(), alice.device_id(), LocalTrust::Verified)
            .await
            .unwrap();
        let decrypted = bob.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.encryption_info.verification_state, VerificationState::Verified);

        // The sender can read its own messages.
        let decrypted = alice.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.encryption_info.verification_state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_replayed_message_index_is_rejected() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        let event = share_and_encrypt(&alice, &bob, &transport).await;

        let timeline = Some("main");

        bob.decrypt_room_event(&event, room_id(), timeline).await.unwrap();
        // Decrypting the same event again is fine.
        bob.decrypt_room_event(&event, room_id(), timeline).await.unwrap();

        let mut replayed = event.clone();
        replayed.event_id = event_id!("$replayed:example.org").to_owned();

        let error = bob.decrypt_room_event(&replayed, room_id(), timeline).await.unwrap_err();
        assert_matches!(error, MegolmError::DuplicatedMessageIndex(0));

        // Other timelines, and events without a timeline, aren't affected.
        bob.decrypt_room_event(&replayed, room_id(), Some("thread")).await.unwrap();
        bob.decrypt_room_event(&replayed, room_id(), None).await.unwrap();

        bob.reset_replay_attack_check_in_timeline("main");
        bob.decrypt_room_event(&replayed, room_id(), timeline).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_room_key_is_requested() {
        let (alice, bob, transport, _) = get_machine_pair().await;

        alice
            .ensure_outbound_session(room_id(), [alice.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        let content = alice
            .encrypt_room_event(room_id(), "m.room.message", json!({"body": "Hi"}))
            .await
            .unwrap();
        let event = encrypted_event(&alice, "$message:example.org", content);

        // Without a verified device to ask, nothing is sent.
        let error = bob.decrypt_room_event(&event, room_id(), None).await.unwrap_err();
        assert_matches!(error, MegolmError::MissingRoomKey(None));
        assert!(transport.take_sent_requests().is_empty());

        bob.set_local_trust(alice.user_id(), alice.device_id(), LocalTrust::Verified)
            .await
            .unwrap();

        let error = bob.decrypt_room_event(&event, room_id(), None).await.unwrap_err();
        assert_matches!(error, MegolmError::MissingRoomKey(None));

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key_request");

        // The request is outstanding, decrypting again doesn't send another.
        bob.decrypt_room_event(&event, room_id(), None).await.unwrap_err();
        assert!(transport.take_sent_requests().is_empty());

        // Asking again explicitly cancels the old request first.
        assert!(bob.re_request_room_key_for_event(&event, room_id()).await.unwrap());
        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 2);
        let action = |i: usize| {
            sent[i].messages[alice.user_id()].values().next().unwrap()["action"].clone()
        };
        assert_eq!(action(0), "request_cancellation");
        assert_eq!(action(1), "request");
    }

    #[tokio::test]
    async fn test_withheld_room_key_is_not_requested() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        bob.set_local_trust(alice.user_id(), alice.device_id(), LocalTrust::Verified)
            .await
            .unwrap();

        alice.set_only_allow_trusted_devices(true);
        let event = share_and_encrypt(&alice, &bob, &transport).await;

        let error = bob.decrypt_room_event(&event, room_id(), None).await.unwrap_err();
        assert_matches!(error, MegolmError::MissingRoomKey(Some(WithheldCode::Unverified)));
        assert!(transport.take_sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_wedged_session_is_replaced() {
        let (alice, bob, transport, clock) = get_machine_pair().await;
        publish_one_time_keys(&alice, &transport, 5).await;

        // Alice opens a session with Bob, Bob answers over it.
        share_and_encrypt(&alice, &bob, &transport).await;
        bob.ensure_outbound_session(room_id(), [alice.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        let bobs_key = transport.take_sent_requests();
        deliver(&bobs_key, bob.user_id(), &alice).await;

        let old_session =
            alice.last_used_session_id(bob.user_id(), bob.device_id()).await.unwrap().unwrap();

        // The message was already used, it no longer decrypts.
        let events = to_device_events_for(&bobs_key, bob.user_id(), &alice);
        let processed = alice.receive_to_device_event(&events[0]).await.unwrap();
        assert_matches!(processed, ProcessedToDeviceEvent::UnableToDecrypt { .. });

        clock.advance(Duration::from_secs(10));
        let claimed = transport.claimed_count();
        alice.unwedge_devices_if_needed().await.unwrap();
        assert_eq!(transport.claimed_count(), claimed + 1);

        let new_session =
            alice.last_used_session_id(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert_ne!(new_session, old_session);

        let sent = transport.take_sent_requests();
        assert_eq!(sent.len(), 1);

        let events = to_device_events_for(&sent, alice.user_id(), &bob);
        let processed = bob.receive_to_device_event(&events[0]).await.unwrap();
        assert_let!(Some(raw_event) = processed.decrypted_event());
        assert_eq!(raw_event["type"], "m.dummy");
        assert_eq!(
            bob.last_used_session_id(alice.user_id(), alice.device_id()).await.unwrap(),
            Some(new_session)
        );

        // The device isn't wedged anymore, nothing else is claimed.
        alice.unwedge_devices_if_needed().await.unwrap();
        assert_eq!(transport.claimed_count(), claimed + 1);
    }

    #[tokio::test]
    async fn test_key_export_and_import() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        let event = share_and_encrypt(&alice, &bob, &transport).await;

        let export = bob.export_room_keys("It's a secret", 10).await.unwrap();

        let other =
            get_machine(bob_id(), device_id!("BOBSNEWDEVICE"), &transport, &MockClock::default())
                .await;
        assert_matches!(
            other.import_room_keys(Cursor::new(export.clone()), "wrong").await,
            Err(crate::file_encryption::KeyExportError::InvalidMac)
        );

        let result =
            other.import_room_keys(Cursor::new(export.clone()), "It's a secret").await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (1, 1));

        let decrypted = other.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "It is a secret to everybody");
        assert!(decrypted.encryption_info.forwarded);

        // A second import has nothing new to offer.
        let result = other.import_room_keys(Cursor::new(export), "It's a secret").await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (0, 1));
    }

    #[tokio::test]
    async fn test_backup_and_restore_with_password() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        let event = share_and_encrypt(&alice, &bob, &transport).await;

        let salt = "MmMsAlty";
        let decryption_key = BackupDecryptionKey::from_passphrase("backup passphrase", salt, 1000);
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version("1".to_owned());

        let mut auth_data = backup_key.auth_data();
        auth_data.private_key_salt = Some(salt.to_owned());
        auth_data.private_key_iterations = Some(1000);
        transport.set_backup_version(BackupVersion {
            version: "1".to_owned(),
            info: RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data),
        });

        bob.backup_machine().enable_backup_v1(backup_key).await.unwrap();
        assert_eq!(bob.backup_all_group_sessions().await.unwrap(), 1);
        assert_eq!(bob.backup_all_group_sessions().await.unwrap(), 0);

        let other =
            get_machine(bob_id(), device_id!("BOBSNEWDEVICE"), &transport, &MockClock::default())
                .await;
        let result =
            other.restore_key_backup_with_password("1", "backup passphrase").await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (1, 1));

        let decrypted = other.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "It is a secret to everybody");
    }

    #[tokio::test]
    async fn test_room_history_is_shared_on_invite() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        let settings = EncryptionSettings {
            history_visibility: HistoryVisibility::Shared,
            ..Default::default()
        };

        alice
            .ensure_outbound_session(room_id(), [alice.user_id()], settings.clone())
            .await
            .unwrap();
        let content = alice
            .encrypt_room_event(room_id(), "m.room.message", json!({"body": "Before Bob"}))
            .await
            .unwrap();
        let event = encrypted_event(&alice, "$history:example.org", content);

        // Disabled by default.
        assert_eq!(alice.on_member_invited(room_id(), bob.user_id(), &settings).await.unwrap(), 0);

        alice.enable_share_key_on_invite(true);
        bob.enable_share_key_on_invite(true);

        assert_eq!(alice.on_member_invited(room_id(), bob.user_id(), &settings).await.unwrap(), 1);
        deliver(&transport.take_sent_requests(), alice.user_id(), &bob).await;

        let decrypted = bob.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "Before Bob");
        assert!(decrypted.encryption_info.forwarded);
        assert!(!decrypted.encryption_info.forwarding_chain_trusted);

        // Private history isn't forwarded.
        let joined = EncryptionSettings {
            history_visibility: HistoryVisibility::Joined,
            ..Default::default()
        };
        assert_eq!(alice.on_member_invited(room_id(), bob.user_id(), &joined).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_key_requests_are_answered_for_own_verified_devices() {
        let transport = MockTransport::default();
        let clock = MockClock::default();

        let alice = get_machine(alice_id(), device_id!("ALICEFIRST"), &transport, &clock).await;
        let alice2 = get_machine(alice_id(), device_id!("ALICESECOND"), &transport, &clock).await;

        let own_devices = vec![alice.device_keys().await, alice2.device_keys().await];
        alice.receive_device_keys(alice_id(), own_devices.clone()).await.unwrap();
        alice2.receive_device_keys(alice_id(), own_devices).await.unwrap();
        alice.set_local_trust(alice_id(), alice2.device_id(), LocalTrust::Verified).await.unwrap();
        alice2.set_local_trust(alice_id(), alice.device_id(), LocalTrust::Verified).await.unwrap();
        publish_one_time_keys(&alice2, &transport, 5).await;

        alice
            .ensure_outbound_session(room_id(), [alice_id()], EncryptionSettings::default())
            .await
            .unwrap();
        // The room key went to Alice's second device too, drop it.
        transport.take_sent_requests();

        let content = alice
            .encrypt_room_event(room_id(), "m.room.message", json!({"body": "Hello"}))
            .await
            .unwrap();
        let event = encrypted_event(&alice, "$message:example.org", content);

        assert_matches!(
            alice2.decrypt_room_event(&event, room_id(), None).await,
            Err(MegolmError::MissingRoomKey(None))
        );

        let request = transport.take_sent_requests();
        deliver(&request, alice_id(), &alice).await;

        let forwarded = transport.take_sent_requests();
        assert_eq!(forwarded.len(), 1);
        deliver(&forwarded, alice_id(), &alice2).await;

        let decrypted = alice2.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "Hello");
        assert!(decrypted.encryption_info.forwarded);
        assert!(decrypted.encryption_info.forwarding_chain_trusted);
        assert_eq!(decrypted.encryption_info.verification_state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_key_request_is_answered_by_the_verified_sender() {
        let (alice, bob, transport, _) = get_machine_pair().await;
        bob.set_local_trust(alice.user_id(), alice.device_id(), LocalTrust::Verified)
            .await
            .unwrap();

        alice
            .ensure_outbound_session(room_id(), [bob.user_id()], EncryptionSettings::default())
            .await
            .unwrap();
        // The room key never reaches Bob.
        transport.take_sent_requests();

        let content = alice
            .encrypt_room_event(room_id(), "m.room.message", json!({"body": "Hello"}))
            .await
            .unwrap();
        let event = encrypted_event(&alice, "$message:example.org", content);

        assert_matches!(
            bob.decrypt_room_event(&event, room_id(), None).await,
            Err(MegolmError::MissingRoomKey(None))
        );

        let request = transport.take_sent_requests();
        assert_eq!(request.len(), 1);
        assert!(request[0].messages.contains_key(alice.user_id()));
        deliver(&request, bob.user_id(), &alice).await;

        let forwarded = transport.take_sent_requests();
        assert_eq!(forwarded.len(), 1);
        deliver(&forwarded, alice.user_id(), &bob).await;

        let decrypted = bob.decrypt_room_event(&event, room_id(), None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "Hello");
        assert!(decrypted.encryption_info.forwarded);
        assert!(decrypted.encryption_info.forwarding_chain_trusted);
        assert_eq!(decrypted.encryption_info.verification_state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_device_list_updates() {
        let (alice, bob, ..) = get_machine_pair().await;
        let second_device = get_machine(
            bob_id(),
            device_id!("BOBSECOND"),
            &MockTransport::default(),
            &MockClock::default(),
        )
        .await;

        let changes = alice
            .receive_device_keys(
                bob_id(),
                vec![bob.device_keys().await, second_device.device_keys().await],
            )
            .await
            .unwrap();
        assert_eq!(changes.new.len(), 1);
        assert!(changes.deleted.is_empty());

        let changes = alice
            .receive_device_keys(bob_id(), vec![second_device.device_keys().await])
            .await
            .unwrap();
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].device_id(), bob.device_id());

        // A device signed by someone else is ignored.
        let mut forged = bob.device_keys().await;
        forged.device_id = device_id!("FORGED").to_owned();
        let changes = alice
            .receive_device_keys(bob_id(), vec![second_device.device_keys().await, forged])
            .await
            .unwrap();
        assert!(changes.new.is_empty());

        // Our own device is never removed.
        alice.receive_device_keys(alice_id(), vec![]).await.unwrap();
        assert!(alice.store().get_device(alice_id(), alice.device_id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shield_follows_verification() {
        let (alice, bob, ..) = get_machine_pair().await;
        let members: Vec<OwnedUserId> = vec![alice_id().to_owned(), bob_id().to_owned()];
        let bob_master_key = bob.identity_keys().ed25519;

        assert_eq!(alice.compute_shield(&members, true).await.unwrap(), RoomShield::Default);

        assert!(alice.receive_user_identity(bob_id(), bob_master_key).await.unwrap());
        assert!(!alice.receive_user_identity(bob_id(), bob_master_key).await.unwrap());
        alice.verify_user_identity(bob_id()).await.unwrap();

        // Bob is verified, his device isn't.
        assert_eq!(alice.compute_shield(&members, true).await.unwrap(), RoomShield::Warning);

        alice.set_cross_signing_trust(bob_id(), bob.device_id(), true).await.unwrap();
        assert_eq!(alice.compute_shield(&members, true).await.unwrap(), RoomShield::Trusted);

        // Bob resets his identity, the old verification is violated.
        let new_master_key = alice.identity_keys().ed25519;
        assert!(alice.receive_user_identity(bob_id(), new_master_key).await.unwrap());
        assert_eq!(alice.compute_shield(&members, true).await.unwrap(), RoomShield::Warning);

        alice.withdraw_verification(bob_id()).await.unwrap();
        assert_eq!(alice.compute_shield(&members, true).await.unwrap(), RoomShield::Default);
    }

    #[tokio::test]
    async fn test_unknown_to_device_events_are_passed_through() {
        let (alice, ..) = get_machine_pair().await;

        let event = serde_json::from_value(json!({
            "sender": bob_id(),
            "type": "org.example.custom",
            "content": {"answer": 42},
        }))
        .unwrap();

        let processed = alice.receive_to_device_event(&event).await.unwrap();
        assert_let!(ProcessedToDeviceEvent::Custom(custom) = processed);
        assert_eq!(custom.content, json!({"answer": 42}));

        let garbage: Value = json!({
            "sender": bob_id(),
            "type": "m.room.encrypted",
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU",
                "ciphertext": {},
            },
        });
        let processed =
            alice.receive_to_device_event(&serde_json::from_value(garbage).unwrap()).await.unwrap();
        assert_matches!(processed, ProcessedToDeviceEvent::UnableToDecrypt { .. });
    }

    #[tokio::test]
    async fn test_restored_machine_keeps_the_backup_key() {
        let store = MemoryStore::new().into_crypto_store();
        let transport = MockTransport::default();
        let clock = Arc::new(MockClock::default());
        let user_id = user_id!("@alice:example.org");

        let machine = OlmMachine::new(
            user_id,
            device_id!("ALICE"),
            store.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        )
        .await
        .unwrap();
        machine
            .backup_machine()
            .save_decryption_key(Some(BackupDecryptionKey::new()), Some("2".to_owned()))
            .await
            .unwrap();
        assert!(!machine.backup_machine().enabled().await);

        let restored =
            OlmMachine::new(user_id, device_id!("ALICE"), store, Arc::new(transport), clock)
                .await
                .unwrap();
        assert!(restored.backup_machine().enabled().await);
        assert_eq!(restored.backup_machine().backup_version().await.as_deref(), Some("2"));
    }
}
