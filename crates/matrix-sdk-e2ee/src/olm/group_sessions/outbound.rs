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
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use ruma::{
    events::room::{encryption::RoomEncryptionEventContent, history_visibility::HistoryVisibility},
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey},
    olm::IdentityKeys,
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    error::SessionCreationError,
    identities::DeviceData,
    locks::RwLock as StdRwLock,
    olm::shared_history_from_history_visibility,
    types::{
        deserialize_curve_key,
        events::{
            room::encrypted::RoomEncryptedEventContent,
            room_key::RoomKeyContent,
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
        },
        requests::ToDeviceRequest,
        serialize_curve_key, EventEncryptionAlgorithm,
    },
    utilities::elapsed,
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;
const MIN_ROTATION_PERIOD: Duration = Duration::from_secs(3600);

/// Has a device received the room key of an outbound session, and at which
/// message index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    /// The device never received the room key, or received it before its
    /// Olm session was replaced.
    NotShared,
    /// The room key was sent to a device that has since changed its
    /// Curve25519 key.
    SharedButChangedSenderKey,
    /// The device received the room key at the given message index.
    Shared(u32),
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// The history visibility of the room when the session was created.
    pub history_visibility: HistoryVisibility,
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            history_visibility: HistoryVisibility::Shared,
            only_allow_trusted_devices: false,
        }
    }
}

impl EncryptionSettings {
    /// Create new encryption settings using an `RoomEncryptionEventContent`,
    /// a history visibility, and setting if only trusted devices should receive
    /// a room key.
    pub fn new(
        content: RoomEncryptionEventContent,
        history_visibility: HistoryVisibility,
        only_allow_trusted_devices: bool,
    ) -> Self {
        let rotation_period: Duration =
            content.rotation_period_ms.map_or(ROTATION_PERIOD, |r| Duration::from_millis(r.into()));
        let rotation_period_msgs: u64 =
            content.rotation_period_msgs.map_or(ROTATION_MESSAGES, Into::into);

        Self {
            algorithm: content.algorithm,
            rotation_period,
            rotation_period_msgs,
            history_visibility,
            only_allow_trusted_devices,
        }
    }
}

/// A map of user ID to device ID to a [`ShareInfo`].
///
/// Holds the `ShareInfo` for all the user/device pairs that will receive the
/// room key.
pub type ShareInfoSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>;

/// Struct holding info about the share state of a outbound group session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShareInfo {
    /// When the key has been shared
    Shared(SharedWith),
    /// When the session has been withheld
    Withheld(WithheldCode),
}

impl ShareInfo {
    /// Helper to create a SharedWith info
    pub fn new_shared(
        sender_key: Curve25519PublicKey,
        message_index: u32,
        olm_wedging_index: u32,
    ) -> Self {
        ShareInfo::Shared(SharedWith { sender_key, message_index, olm_wedging_index })
    }

    /// Helper to create a Withheld info
    pub fn new_withheld(code: WithheldCode) -> Self {
        ShareInfo::Withheld(code)
    }
}

/// The record of a room key sent to a single device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedWith {
    /// The sender key of the device that was used to encrypt the room key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The message index that the device received.
    pub message_index: u32,
    /// The Olm wedging index of the device when the key was sent. A higher
    /// index on the device means a new Olm session replaced a wedged one and
    /// the key has to be sent again.
    #[serde(default)]
    pub olm_wedging_index: u32,
}

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<RwLock<GroupSession>>,
    device_id: OwnedDeviceId,
    account_identity_keys: Arc<IdentityKeys>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: MilliSecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<StdRwLock<ShareInfoSet>>,
    to_share_with_set:
        Arc<StdRwLock<BTreeMap<OwnedTransactionId, (Arc<ToDeviceRequest>, ShareInfoSet)>>>,
}

impl OutboundGroupSession {
    fn session_config(
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<SessionConfig, SessionCreationError> {
        match algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => Ok(SessionConfig::version_1()),
            _ => Err(SessionCreationError::Algorithm(algorithm.to_owned())),
        }
    }

    /// Create a new outbound group session for the given room.
    ///
    /// Outbound group sessions are used to encrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that created this session.
    ///
    /// * `identity_keys` - The identity keys of the account that created this
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period of
    ///   the outbound group session.
    ///
    /// * `now` - The creation time of the session.
    pub fn new(
        device_id: OwnedDeviceId,
        identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        settings: EncryptionSettings,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Result<Self, SessionCreationError> {
        let config = Self::session_config(&settings.algorithm)?;

        let session = GroupSession::new(config);
        let session_id = session.session_id();

        Ok(OutboundGroupSession {
            inner: RwLock::new(session).into(),
            room_id: room_id.to_owned(),
            device_id,
            account_identity_keys: identity_keys,
            session_id: session_id.into(),
            creation_time: now,
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Default::default(),
            to_share_with_set: Default::default(),
        })
    }

    /// Queue a to-device request carrying the room key, or withheld notices,
    /// for the given devices.
    ///
    /// The devices are only recorded as having received the key once
    /// [`OutboundGroupSession::mark_request_as_sent`] is called.
    pub(crate) fn add_request(
        &self,
        request_id: OwnedTransactionId,
        request: Arc<ToDeviceRequest>,
        share_infos: ShareInfoSet,
    ) {
        self.to_share_with_set.write().insert(request_id, (request, share_infos));
    }

    /// Forget a queued request that could not be delivered.
    ///
    /// The devices it addressed stay unshared and are picked up again the
    /// next time the room key is shared.
    pub(crate) fn discard_request(&self, request_id: &TransactionId) {
        self.to_share_with_set.write().remove(request_id);
    }

    /// Create a new `m.room_key.withheld` event content with the given code for
    /// this outbound group session.
    pub fn withheld_code(&self, code: WithheldCode) -> RoomKeyWithheldContent {
        RoomKeyWithheldContent::new(
            code,
            self.room_id().to_owned(),
            self.session_id().to_owned(),
            self.sender_key(),
            self.device_id.clone(),
        )
    }

    /// This should be called if an the user wishes to rotate this session.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed)
    }

    /// Get the encryption settings of this outbound session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Mark the request with the given request id as sent.
    ///
    /// This removes the request from the queue and marks the set of
    /// users/devices that received the session.
    pub fn mark_request_as_sent(&self, request_id: &TransactionId) {
        let removed = self.to_share_with_set.write().remove(request_id);

        let Some((to_device, request)) = removed else {
            let request_ids: Vec<String> =
                self.to_share_with_set.read().keys().map(|k| k.to_string()).collect();

            error!(
                all_request_ids = ?request_ids,
                request_id = ?request_id,
                "Marking to-device request carrying a room key as sent but no \
                    request found with the given id"
            );

            return;
        };

        let recipients: BTreeMap<&UserId, Vec<&DeviceId>> = request
            .iter()
            .map(|(u, d)| (u.as_ref(), d.keys().map(|d| d.as_ref()).collect()))
            .collect();

        info!(
            ?request_id,
            ?recipients,
            event_type = to_device.event_type.as_str(),
            "Marking to-device request carrying a room key or a withheld as sent"
        );

        {
            let mut shared_with_set = self.shared_with_set.write();

            for (user_id, infos) in request {
                let devices = shared_with_set.entry(user_id).or_default();

                for (device_id, info) in infos {
                    // A share record never regresses: an earlier index for
                    // the same Olm session is kept, and a withheld notice
                    // can't take back a key that was sent.
                    let keep_existing = matches!(
                        devices.get(&device_id),
                        Some(ShareInfo::Shared(existing)) if Self::supersedes(existing, &info)
                    );

                    if !keep_existing {
                        devices.insert(device_id, info);
                    }
                }
            }
        }

        if self.to_share_with_set.read().is_empty() {
            debug!(
                session_id = self.session_id(),
                room_id = ?self.room_id,
                "All m.room_key and withheld to-device requests were sent out, marking \
                    session as shared.",
            );

            self.mark_as_shared();
        }
    }

    fn supersedes(existing: &SharedWith, new: &ShareInfo) -> bool {
        match new {
            ShareInfo::Withheld(_) => true,
            ShareInfo::Shared(new) => {
                existing.sender_key == new.sender_key
                    && existing.olm_wedging_index >= new.olm_wedging_index
                    && existing.message_index <= new.message_index
            }
        }
    }

    /// Encrypt the given plaintext using this session.
    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> MegolmMessage {
        let mut session = self.inner.write().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt a room message for the given room.
    ///
    /// Beware that a room key needs to be shared before this method
    /// can be called using the `share_room_key()` method.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The plaintext type of the event, the outer type of the
    ///   event will become `m.room.encrypted`.
    ///
    /// * `content` - The plaintext content of the message that should be
    ///   encrypted in raw json [`Value`] form.
    ///
    /// The `m.relates_to` field of the content is moved to the unencrypted
    /// part of the event.
    pub async fn encrypt(&self, event_type: &str, mut content: Value) -> RoomEncryptedEventContent {
        let relates_to = content.as_object_mut().and_then(|c| c.remove("m.relates_to"));

        let json_content = json!({
            "content": content,
            "room_id": &*self.room_id,
            "type": event_type,
        });

        let plaintext = json_content.to_string();
        let ciphertext = self.encrypt_helper(plaintext).await;

        RoomEncryptedEventContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            ciphertext: ciphertext.to_base64(),
            session_id: self.session_id().to_owned(),
            sender_key: Some(self.sender_key()),
            device_id: Some(self.device_id.clone()),
            relates_to,
        }
    }

    fn elapsed(&self, now: MilliSecondsSinceUnixEpoch) -> bool {
        // The rotation period comes from room state anyone in the room can
        // set, clamp it to an hour.
        elapsed(self.creation_time, now) >= max(self.settings.rotation_period, MIN_ROTATION_PERIOD)
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time or if enough messages have been
    /// encrypted using it.
    pub fn expired(&self, now: MilliSecondsSinceUnixEpoch) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);
        // Megolm uses a u32 counter internally; staying well below that, a
        // session is usable for at least 1 and at most 10000 messages.
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        count >= rotation_period_msgs || self.elapsed(now)
    }

    /// Has the room's history visibility moved between the "history shared"
    /// and the "history private" buckets since this session was created.
    ///
    /// A change within a bucket, for example from `world_readable` to
    /// `shared`, doesn't require a new session.
    pub fn needs_rotation_due_to_visibility_change(&self, current: &HistoryVisibility) -> bool {
        shared_history_from_history_visibility(&self.settings.history_visibility)
            != shared_history_from_history_visibility(current)
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Check if the session has been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to to create an `InboundGroupSession`.
    pub async fn session_key(&self) -> SessionKey {
        let session = self.inner.read().await;
        session.session_key()
    }

    /// Gets the Sender Key
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.account_identity_keys.curve25519
    }

    /// The Ed25519 key of the device that created the session.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.account_identity_keys.ed25519
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the session was created.
    pub fn creation_time(&self) -> MilliSecondsSinceUnixEpoch {
        self.creation_time
    }

    /// Get the current message index for this session.
    ///
    /// Each message is sent with an increasing index. This returns the
    /// message index that will be used for the next encrypted message.
    pub async fn message_index(&self) -> u32 {
        let session = self.inner.read().await;
        session.message_index()
    }

    /// The `m.room_key` content that shares this session.
    pub(crate) async fn as_content(&self, shared_history: bool) -> RoomKeyContent {
        let session_key = self.session_key().await;

        RoomKeyContent::new(
            self.room_id().to_owned(),
            self.session_id().to_owned(),
            session_key,
            shared_history,
        )
    }

    fn share_state(info: &ShareInfo, device: &DeviceData) -> ShareState {
        match info {
            ShareInfo::Shared(s) => {
                if Some(s.sender_key) != device.curve25519_key() {
                    ShareState::SharedButChangedSenderKey
                } else if device.olm_wedging_index > s.olm_wedging_index {
                    ShareState::NotShared
                } else {
                    ShareState::Shared(s.message_index)
                }
            }
            ShareInfo::Withheld(_) => ShareState::NotShared,
        }
    }

    /// Has or will the session be shared with the given user/device pair.
    pub fn is_shared_with(&self, device: &DeviceData) -> ShareState {
        let shared_state = self
            .shared_with_set
            .read()
            .get(device.user_id())
            .and_then(|d| d.get(device.device_id()).map(|s| Self::share_state(s, device)));

        if let Some(state) = shared_state {
            state
        } else {
            // Not shared yet, check if one of the pending requests carries
            // the key to the device.
            self.to_share_with_set
                .read()
                .values()
                .find_map(|(_, share_info)| {
                    share_info
                        .get(device.user_id())
                        .and_then(|d| d.get(device.device_id()))
                        .map(|info| Self::share_state(info, device))
                })
                .unwrap_or(ShareState::NotShared)
        }
    }

    /// Has the session been, or will it be, withheld from the device with
    /// the given code.
    pub(crate) fn is_withheld_to(&self, device: &DeviceData, code: &WithheldCode) -> bool {
        let is_withheld = |info: &ShareInfo| matches!(info, ShareInfo::Withheld(c) if c == code);

        let recorded = self
            .shared_with_set
            .read()
            .get(device.user_id())
            .and_then(|d| d.get(device.device_id()).map(is_withheld));

        recorded.unwrap_or_else(|| {
            self.to_share_with_set.read().values().any(|(_, share_info)| {
                share_info
                    .get(device.user_id())
                    .and_then(|d| d.get(device.device_id()))
                    .is_some_and(is_withheld)
            })
        })
    }

    /// The users who received, or were refused, the room key.
    pub fn shared_with(&self) -> ShareInfoSet {
        self.shared_with_set.read().clone()
    }

    /// Mark the session as shared with the given user/device pair, starting
    /// from some message index.
    #[cfg(test)]
    pub(crate) fn mark_shared_with_from_index(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
        index: u32,
    ) {
        self.shared_with_set
            .write()
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), ShareInfo::new_shared(sender_key, index, 0));
    }

    /// Get the list of requests that need to be sent out for this session to be
    /// marked as shared.
    pub(crate) fn pending_requests(&self) -> Vec<Arc<ToDeviceRequest>> {
        self.to_share_with_set.read().values().map(|(r, _)| r.clone()).collect()
    }

    /// Get the list of request ids this session is waiting for to be sent out.
    pub(crate) fn pending_request_ids(&self) -> Vec<OwnedTransactionId> {
        self.to_share_with_set.read().keys().cloned().collect()
    }

    /// Restore a Session from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The device ID of the device that created this session.
    ///   Put differently, our own device ID.
    ///
    /// * `identity_keys` - The identity keys of the device that created this
    ///   session, our own identity keys.
    ///
    /// * `pickle` - The pickled version of the `OutboundGroupSession`.
    pub fn from_pickle(
        device_id: OwnedDeviceId,
        identity_keys: Arc<IdentityKeys>,
        pickle: PickledOutboundGroupSession,
    ) -> Self {
        let inner: GroupSession = pickle.pickle.into();
        let session_id = inner.session_id();

        Self {
            inner: Arc::new(RwLock::new(inner)),
            device_id,
            account_identity_keys: identity_keys,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: AtomicU64::from(pickle.message_count).into(),
            shared: AtomicBool::from(pickle.shared).into(),
            invalidated: AtomicBool::from(pickle.invalidated).into(),
            settings: pickle.settings,
            shared_with_set: Arc::new(StdRwLock::new(pickle.shared_with_set)),
            to_share_with_set: Arc::new(StdRwLock::new(pickle.requests)),
        }
    }

    /// Store the group session as a serializable pickle together with the
    /// data belonging to the session.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.read().await.pickle();

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: self.settings.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set: self.shared_with(),
            requests: self.to_share_with_set.read().clone(),
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A pickled version of an `OutboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an OutboundGroupSession.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickle string holding the OutboundGroupSession.
    pub pickle: GroupSessionPickle,
    /// The settings this session adheres to.
    pub settings: Arc<EncryptionSettings>,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The timestamp when this session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Is the session shared.
    pub shared: bool,
    /// Has the session been invalidated.
    pub invalidated: bool,
    /// The set of users the session has been already shared with.
    pub shared_with_set: ShareInfoSet,
    /// Requests that need to be sent out to share the session.
    pub requests: BTreeMap<OwnedTransactionId, (Arc<ToDeviceRequest>, ShareInfoSet)>,
}
