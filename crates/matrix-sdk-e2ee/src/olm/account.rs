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
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use ruma::{
    events::room::history_visibility::HistoryVisibility, DeviceId, DeviceKeyAlgorithm,
    DeviceKeyId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, field::debug, instrument, trace, warn, Span};
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, OlmMessage, PreKeyMessage,
        SessionConfig,
    },
    Curve25519PublicKey, Ed25519Signature, KeyId,
};

use super::{
    utility::to_signable_json, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
    Session,
};
use crate::{
    error::{EventError, OlmError, OlmResult, SessionCreationError, SignatureError},
    identities::DeviceData,
    store::{Changes, DeviceChanges, Store},
    types::{
        events::{
            olm_v1::AnyDecryptedOlmEvent, room::encrypted::ToDeviceEncryptedEventContent,
            ToDeviceEvent,
        },
        DeviceKeys, EventEncryptionAlgorithm, OneTimeKeys, SignedKey,
    },
};

/// The result of a successful decryption of an Olm encrypted to-device event.
#[derive(Debug)]
pub struct OlmDecryptionInfo {
    /// The Olm session that decrypted the event, new or pre-existing.
    pub session: SessionType,
    /// The parsed and checked plaintext.
    pub result: DecryptionResult,
}

/// A decrypted to-device event together with the data needed to act on it.
#[derive(Debug)]
pub struct DecryptionResult {
    /// The decrypted event.
    pub event: Box<AnyDecryptedOlmEvent>,
    /// The plaintext of the event as JSON.
    pub raw_event: Value,
    /// The Curve25519 key of the sending device.
    pub sender_key: Curve25519PublicKey,
    /// The sending device, if we know it.
    pub sender_device: Option<DeviceData>,
}

/// Whether an Olm message was decrypted by a session we already had, or by a
/// session created from the message.
#[derive(Debug, Clone)]
pub enum SessionType {
    /// The session was created from a pre-key message.
    New(Session),
    /// The session was already known to us.
    Existing(Session),
}

impl SessionType {
    /// Returns true if the session was newly created.
    pub fn created(&self) -> bool {
        matches!(self, SessionType::New(_))
    }

    /// Returns the inner session.
    pub fn session(self) -> Session {
        match self {
            SessionType::New(s) | SessionType::Existing(s) => s,
        }
    }
}

/// The result of creating an inbound session from a pre-key message.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that established the session.
    pub plaintext: String,
}

/// The part of an account that never changes, cheap to clone and share.
#[derive(Clone)]
pub struct StaticAccountData {
    /// The user_id this account belongs to.
    pub user_id: OwnedUserId,
    /// The device_id of this entry.
    pub device_id: OwnedDeviceId,
    /// The associated identity keys.
    pub identity_keys: Arc<IdentityKeys>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StaticAccountData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAccountData")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .finish()
    }
}

impl StaticAccountData {
    const ALGORITHMS: &'static [&'static EventEncryptionAlgorithm] = &[
        &EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
        &EventEncryptionAlgorithm::MegolmV1AesSha2,
    ];

    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.identity_keys
    }

    /// Create a group session pair.
    ///
    /// This session pair can be used to encrypt and decrypt messages meant for
    /// a large group of participants.
    ///
    /// The outbound session is used to encrypt messages while the inbound one
    /// is used to decrypt messages encrypted by the outbound one.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The ID of the room where the group session will be used.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period of
    ///   the outbound group session.
    ///
    /// * `now` - The creation time of the outbound session.
    pub async fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Result<(OutboundGroupSession, InboundGroupSession), SessionCreationError> {
        trace!(?room_id, algorithm = settings.algorithm.as_str(), "Creating a new room key");

        let visibility = settings.history_visibility.clone();

        let outbound = OutboundGroupSession::new(
            self.device_id.clone(),
            self.identity_keys.clone(),
            room_id,
            settings,
            now,
        )?;

        let identity_keys = &self.identity_keys;

        let sender_key = identity_keys.curve25519;
        let signing_key = identity_keys.ed25519;

        let inbound = InboundGroupSession::new(
            sender_key,
            signing_key,
            room_id,
            &outbound.session_key().await,
            Some(visibility),
        );

        Ok((outbound, inbound))
    }

    /// The device keys of this account, without any signatures.
    pub fn unsigned_device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();
        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
                identity_keys.curve25519.into(),
            ),
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                identity_keys.ed25519.into(),
            ),
        ]);

        DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            Self::ALGORITHMS.iter().map(|a| (**a).clone()).collect(),
            keys,
            Default::default(),
        )
    }
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    static_data: StaticAccountData,
    inner: Box<InnerAccount>,
    /// Have the identity keys been uploaded to the server.
    shared: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared.
    pub shared: bool,
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.into(),
                device_id: device_id.into(),
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(account),
            shared: false,
        }
    }

    /// The part of the account that never changes.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Get the user id of the owner of the account.
    pub fn user_id(&self) -> &UserId {
        &self.static_data.user_id
    }

    /// Get the device ID that owns this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.static_data.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.static_data.identity_keys()
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Get the maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate count number of one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    /// Get the currently unpublished one-time keys of the account.
    pub fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    ///
    /// Returns the signature as a base64 encoded string.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Convert a JSON value to the canonical representation and sign the JSON
    /// string.
    ///
    /// The `signatures` and `unsigned` fields are not covered by the
    /// signature.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical_json = to_signable_json(json)?;
        Ok(self.sign(&canonical_json))
    }

    /// Sign the device keys of the account and return them so they can be
    /// uploaded.
    pub fn device_keys(&self) -> DeviceKeys {
        let mut device_keys = self.static_data.unsigned_device_keys();

        let json_device_keys =
            serde_json::to_value(&device_keys).expect("device keys are always safe to serialize");
        let signature = self
            .sign_json(json_device_keys)
            .expect("Newly created device keys can always be signed");

        device_keys.signatures.add_signature(
            self.user_id().to_owned(),
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, self.device_id()),
            signature,
        );

        device_keys
    }

    /// Sign and prepare one-time keys to be uploaded.
    ///
    /// If no one-time keys need to be uploaded, returns an empty `BTreeMap`.
    pub fn signed_one_time_keys(&self) -> OneTimeKeys {
        self.one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                (format!("signed_curve25519:{}", key_id.to_base64()), self.sign_key(key))
            })
            .collect()
    }

    fn sign_key(&self, key: Curve25519PublicKey) -> SignedKey {
        let mut key = SignedKey::new(key);

        let signature = self
            .sign_json(serde_json::to_value(&key).expect("Can't serialize a signed key"))
            .expect("Newly created one-time keys can always be signed");

        key.signatures_mut().add_signature(
            self.user_id().to_owned(),
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, self.device_id()),
            signature,
        );

        key
    }

    /// Create a new session with another account given a one-time key.
    ///
    /// # Arguments
    ///
    /// * `identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `one_time_key` - A signed one-time key that the other account created
    ///   and shared with us.
    ///
    /// * `fallback_used` - Was the one-time key a fallback key.
    ///
    /// * `now` - The creation time of the session.
    pub fn create_outbound_session_helper(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
        fallback_used: bool,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Session {
        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        let session_id = session.session_id();

        Session {
            our_account: self.static_data.clone(),
            inner: Arc::new(tokio::sync::Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            created_using_fallback_key: fallback_used,
            creation_time: now,
            last_use_time: now,
            last_message_received_at: MilliSecondsSinceUnixEpoch(0u32.into()),
        }
    }

    /// Create a new session with another account given a one-time key and a
    /// device.
    ///
    /// The signature of the one-time key is checked against the Ed25519 key
    /// of the device before the session is created.
    ///
    /// # Arguments
    ///
    /// * `device` - The other account's device.
    ///
    /// * `key_map` - A map from the algorithm and device ID to the one-time key
    ///   that the other account created and shared with us.
    ///
    /// * `now` - The creation time of the session.
    #[instrument(
        skip_all,
        fields(user_id = ?device.user_id(), device_id = ?device.device_id())
    )]
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        key_map: &OneTimeKeys,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Result<Session, SessionCreationError> {
        let (key_id, key) = key_map.iter().next().ok_or_else(|| {
            SessionCreationError::OneTimeKeyMissing(
                device.user_id().to_owned(),
                device.device_id().into(),
            )
        })?;

        trace!(key_id, "Found a one-time key to create an Olm session with");

        device.verify_one_time_key(key).map_err(|error| SessionCreationError::InvalidSignature {
            signing_key: device.ed25519_key().map(Box::new),
            one_time_key: key.clone().into(),
            error: error.into(),
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().into(),
            )
        })?;

        Ok(self.create_outbound_session_helper(identity_key, key.key(), key.fallback(), now))
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us by the other
    ///   account.
    ///
    /// * `now` - The time the message was received.
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        Span::current().record("session_id", debug(message.session_id()));
        trace!("Creating a new Olm session from a pre-key message");

        let result = self.inner.create_inbound_session(their_identity_key, message)?;
        let session_id = result.session.session_id();

        debug!(session=?result.session, "Decrypted an Olm message from a new Olm session");

        let session = Session {
            our_account: self.static_data.clone(),
            inner: Arc::new(tokio::sync::Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            created_using_fallback_key: false,
            creation_time: now,
            last_use_time: now,
            last_message_received_at: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Decrypt an Olm encrypted to-device event.
    ///
    /// A new Olm session is created if the event carries a pre-key message
    /// none of our existing sessions accepts. The new session and our
    /// account are persisted right away since the one-time key that was used
    /// is now gone.
    #[instrument(
        skip_all,
        fields(sender = ?event.sender, sender_key = ?event.content.sender_key, session_id)
    )]
    pub async fn decrypt_to_device_event(
        &mut self,
        store: &Store,
        event: &ToDeviceEvent<ToDeviceEncryptedEventContent>,
    ) -> OlmResult<OlmDecryptionInfo> {
        trace!("Decrypting a to-device event");

        let message = event.content.message_for(self.identity_keys().curve25519)?;
        let sender_key = event.content.sender_key;

        let (session, plaintext) =
            self.decrypt_olm_message(store, &event.sender, sender_key, &message).await?;

        trace!("Successfully decrypted an Olm message");

        let parsed =
            self.parse_decrypted_to_device_event(store, &event.sender, sender_key, plaintext).await;

        match parsed {
            Ok(result) => Ok(OlmDecryptionInfo { session, result }),
            Err(e) => {
                // The ratchet advanced even though the plaintext is unusable,
                // keep the session state in sync with our peer.
                let changes = Changes { sessions: vec![session.session()], ..Default::default() };
                store.save_changes(changes).await?;

                warn!(
                    error = ?e,
                    "A to-device message was successfully decrypted but \
                    parsing and checking the event fields failed"
                );

                Err(e)
            }
        }
    }

    async fn decrypt_olm_message(
        &mut self,
        store: &Store,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<(SessionType, String)> {
        let now = store.now();
        let existing_sessions = store.get_sessions(&sender_key.to_base64()).await?;

        match message {
            OlmMessage::Normal(_) => {
                let mut errors_by_olm_session = Vec::new();

                if let Some(sessions) = existing_sessions {
                    for session in sessions.lock().await.iter_mut() {
                        match session.decrypt(message, now).await {
                            Ok(p) => return Ok((SessionType::Existing(session.clone()), p)),
                            // Failing here is expected, we don't know which
                            // session encrypted the message.
                            Err(e) => {
                                errors_by_olm_session.push((session.session_id().to_owned(), e))
                            }
                        }
                    }
                }

                warn!(
                    ?errors_by_olm_session,
                    "Failed to decrypt a non-pre-key message with all available sessions"
                );

                Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
            }

            OlmMessage::PreKey(prekey_message) => {
                if let Some(sessions) = existing_sessions {
                    for session in sessions.lock().await.iter_mut() {
                        if prekey_message.session_id() != session.session_id() {
                            continue;
                        }

                        if let Ok(p) = session.decrypt(message, now).await {
                            return Ok((SessionType::Existing(session.clone()), p));
                        }

                        // The message was meant for this session, yet it
                        // doesn't decrypt. The one-time key is used up, so a
                        // new session can't be created from it either.
                        warn!(
                            session_id = session.session_id(),
                            "Failed to decrypt a pre-key message with the corresponding session"
                        );

                        return Err(OlmError::SessionWedged(sender.to_owned(), sender_key));
                    }
                }

                let result = match self.create_inbound_session(sender_key, prekey_message, now) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Failed to create a new Olm session from a pre-key message: {e:?}");
                        return Err(OlmError::SessionWedged(sender.to_owned(), sender_key));
                    }
                };

                let mut changes = Changes {
                    account: Some(self.pickle()),
                    sessions: vec![result.session.clone()],
                    ..Default::default()
                };

                // A new Olm session means the other side might have lost the
                // state of the old one, room keys need to be sent again.
                if let Some(mut device) =
                    store.get_device_from_curve_key(sender, sender_key).await?
                {
                    device.olm_wedging_index += 1;
                    changes.devices = DeviceChanges { changed: vec![device], ..Default::default() };
                }

                store.save_changes(changes).await?;

                Ok((SessionType::New(result.session), result.plaintext))
            }
        }
    }

    /// Parse the decrypted plaintext as JSON and verify that it wasn't
    /// forwarded by a third party.
    ///
    /// The `sender` must be the user who sent the encrypted event, the
    /// `recipient` must be us, and `recipient_keys` must hold our Ed25519 key.
    async fn parse_decrypted_to_device_event(
        &self,
        store: &Store,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        plaintext: String,
    ) -> OlmResult<DecryptionResult> {
        let raw_event: Value = serde_json::from_str(&plaintext)?;
        let event: Box<AnyDecryptedOlmEvent> = serde_json::from_value(raw_event.clone())?;
        let identity_keys = self.identity_keys();

        if event.recipient() != self.user_id() {
            Err(EventError::MismatchedSender(event.recipient().to_owned(), self.user_id().into())
                .into())
        } else if event.sender() != sender {
            Err(EventError::MismatchedSender(event.sender().to_owned(), sender.to_owned()).into())
        } else if identity_keys.ed25519 != event.recipient_keys().ed25519 {
            Err(EventError::MismatchedKeys(
                identity_keys.ed25519.into(),
                event.recipient_keys().ed25519.into(),
            )
            .into())
        } else {
            let sender_device = Self::get_event_sender_device(store, sender_key, &event).await?;

            Ok(DecryptionResult { event, raw_event, sender_key, sender_device })
        }
    }

    /// Look up the device that sent us a successfully decrypted event and
    /// check that its Ed25519 key matches the one the event claims.
    ///
    /// `m.room_key` events are accepted from devices we don't know yet, the
    /// claimed key is stored with the room key and checked once we learn
    /// about the device.
    async fn get_event_sender_device(
        store: &Store,
        sender_key: Curve25519PublicKey,
        event: &AnyDecryptedOlmEvent,
    ) -> OlmResult<Option<DeviceData>> {
        let device = store.get_device_from_curve_key(event.sender(), sender_key).await?;

        match device {
            Some(device) => {
                let key = device.ed25519_key().ok_or(EventError::MissingSigningKey)?;

                if key != event.keys().ed25519 {
                    Err(EventError::MismatchedKeys(key.into(), event.keys().ed25519.into()).into())
                } else {
                    Ok(Some(device))
                }
            }
            None if matches!(event, AnyDecryptedOlmEvent::RoomKey(_)) => Ok(None),
            None => Err(EventError::MissingSigningKey.into()),
        }
    }

    /// Store the account as a serializable pickle.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle: self.inner.pickle(),
            shared: self.shared(),
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let account = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys = account.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: pickle.user_id,
                device_id: pickle.device_id,
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(account),
            shared: pickle.shared,
        }
    }

    /// Testing only helper to create a session pair between two accounts.
    ///
    /// Returns our outbound session and the inbound session `other` created
    /// from our first message.
    #[cfg(test)]
    pub(crate) async fn create_session_for_test_helper(
        &self,
        other: &mut Account,
    ) -> (Session, Session) {
        use serde_json::json;

        use crate::utilities::millis;

        other.generate_one_time_keys(1);
        let one_time_map = other.signed_one_time_keys();
        let device = DeviceData::from_account(other);

        let mut our_session =
            self.create_outbound_session(&device, &one_time_map, millis(0)).unwrap();

        other.mark_keys_as_published();

        let message =
            our_session.encrypt(&device, "m.dummy", json!({}), millis(0)).await.unwrap();
        let message = message.message_for(other.identity_keys().curve25519).unwrap();

        let OlmMessage::PreKey(prekey) = message else {
            panic!("Invalid message type");
        };

        let other_session = other
            .create_inbound_session(self.identity_keys().curve25519, &prekey, millis(0))
            .unwrap();

        (our_session, other_session.session)
    }
}

/// Does the given history visibility mark room keys as safe to share with
/// users who join later.
///
/// Only the `shared` and `world_readable` visibilities let new members read
/// messages sent before they joined.
pub(crate) fn shared_history_from_history_visibility(
    history_visibility: &HistoryVisibility,
) -> bool {
    match history_visibility {
        HistoryVisibility::Shared | HistoryVisibility::WorldReadable => true,
        HistoryVisibility::Invited | HistoryVisibility::Joined | _ => false,
    }
}
