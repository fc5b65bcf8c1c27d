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
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{
    events::room::history_visibility::HistoryVisibility, serde::JsonObject, OwnedRoomId, RoomId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        DecryptedMessage, DecryptionError, InboundGroupSession as InnerSession,
        InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{BackedUpRoomKey, ExportedRoomKey, SenderDataType, SessionKey};
use crate::{
    error::{EventError, MegolmResult, SessionCreationError},
    olm::shared_history_from_history_visibility,
    types::{
        deserialize_curve_key, deserialize_curve_key_vec,
        events::{
            forwarded_room_key::ForwardedRoomKeyContent, room::encrypted::EncryptedEvent,
            room_key::RoomKeyContent,
        },
        serialize_curve_key, serialize_curve_key_vec, EventEncryptionAlgorithm,
        SenderClaimedKeys,
    },
};

/// Inbound group session.
///
/// Inbound group sessions, also known as room keys, are used to decrypt the
/// room messages a single sender device encrypted with the matching
/// [`OutboundGroupSession`](super::OutboundGroupSession).
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    sender_key: Curve25519PublicKey,
    signing_keys: SenderClaimedKeys,
    room_id: OwnedRoomId,
    forwarding_key_chain: Arc<[Curve25519PublicKey]>,
    history_visibility: Arc<Option<HistoryVisibility>>,
    imported: bool,
    backed_up: Arc<AtomicBool>,
    shared_history: bool,
    sender_data_type: SenderDataType,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// These sessions are used to decrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us the
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    ///
    /// * `history_visibility` - The history visibility of the room at the time
    ///   the matching outbound session was created. Only known if we created
    ///   the session ourselves.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        history_visibility: Option<HistoryVisibility>,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();
        let shared_history =
            history_visibility.as_ref().is_some_and(shared_history_from_history_visibility);

        InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_keys: SenderClaimedKeys { ed25519: signing_key },
            room_id: room_id.to_owned(),
            forwarding_key_chain: Vec::new().into(),
            history_visibility: history_visibility.into(),
            imported: false,
            backed_up: AtomicBool::new(false).into(),
            shared_history,
            sender_data_type: SenderDataType::Direct,
        }
    }

    /// Create a new [`InboundGroupSession`] from the content of an
    /// `m.room_key` event.
    ///
    /// The `sender_key` **must** be the Curve25519 key of the Olm session the
    /// event arrived through, and the `signing_key` the Ed25519 key from the
    /// `keys` field of the decrypted payload.
    pub fn from_room_key_content(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        Self::check_algorithm(&content.algorithm)?;

        let session =
            Self::new(sender_key, signing_key, &content.room_id, &content.session_key, None);

        Ok(Self { shared_history: content.shared_history, ..session })
    }

    /// Create a new [`InboundGroupSession`] from the content of an
    /// `m.forwarded_room_key` event.
    ///
    /// # Arguments
    ///
    /// * `forwarder_key` - The Curve25519 key of the Olm session the forwarded
    ///   key arrived through. It is appended to the forwarding chain.
    ///
    /// * `content` - The decrypted forwarded room key content.
    pub fn from_forwarded_key(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        Self::check_algorithm(&content.algorithm)?;

        let session = InnerSession::import(&content.session_key, SessionConfig::version_1());
        let first_known_index = session.first_known_index();

        let mut forwarding_key_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_key_chain.push(forwarder_key);

        Ok(InboundGroupSession {
            session_id: content.session_id.as_str().into(),
            inner: Arc::new(Mutex::new(session)),
            first_known_index,
            sender_key: content.claimed_sender_key,
            signing_keys: SenderClaimedKeys { ed25519: content.claimed_ed25519_key },
            room_id: content.room_id.clone(),
            forwarding_key_chain: forwarding_key_chain.into(),
            history_visibility: None.into(),
            imported: false,
            backed_up: AtomicBool::new(false).into(),
            shared_history: content.shared_history,
            sender_data_type: SenderDataType::Forwarded,
        })
    }

    /// Create a new [`InboundGroupSession`] from an exported version of the
    /// group session.
    ///
    /// Most notably this can be called with an [`ExportedRoomKey`] from a
    /// previous [`InboundGroupSession::export()`] call.
    pub fn from_export(exported_session: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        Self::check_algorithm(&exported_session.algorithm)?;

        let session =
            InnerSession::import(&exported_session.session_key, SessionConfig::version_1());
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            session_id: exported_session.session_id.as_str().into(),
            inner: Arc::new(Mutex::new(session)),
            first_known_index,
            sender_key: exported_session.sender_key,
            signing_keys: exported_session.sender_claimed_keys,
            room_id: exported_session.room_id.clone(),
            forwarding_key_chain: exported_session.forwarding_curve25519_key_chain.clone().into(),
            history_visibility: None.into(),
            imported: true,
            backed_up: AtomicBool::new(false).into(),
            shared_history: exported_session.shared_history,
            sender_data_type: SenderDataType::Imported,
        })
    }

    fn check_algorithm(algorithm: &EventEncryptionAlgorithm) -> Result<(), SessionCreationError> {
        if algorithm == &EventEncryptionAlgorithm::MegolmV1AesSha2 {
            Ok(())
        } else {
            Err(SessionCreationError::Algorithm(algorithm.to_owned()))
        }
    }

    /// Convert the [`InboundGroupSession`] into a
    /// [`PickledInboundGroupSession`] which can be serialized.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_key: self.signing_keys,
            room_id: self.room_id().to_owned(),
            forwarding_chain: self.forwarding_key_chain.to_vec(),
            imported: self.imported,
            backed_up: self.backed_up(),
            history_visibility: self.history_visibility.as_ref().clone(),
            shared_history: self.shared_history,
            sender_data_type: self.sender_data_type,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let PickledInboundGroupSession {
            pickle,
            sender_key,
            signing_key,
            room_id,
            forwarding_chain,
            imported,
            backed_up,
            history_visibility,
            shared_history,
            sender_data_type,
        } = pickle;

        let session: InnerSession = pickle.into();
        let first_known_index = session.first_known_index();
        let session_id = session.session_id();

        InboundGroupSession {
            inner: Mutex::new(session).into(),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_keys: signing_key,
            room_id,
            forwarding_key_chain: forwarding_chain.into(),
            history_visibility: history_visibility.into(),
            imported,
            backed_up: AtomicBool::from(backed_up).into(),
            shared_history,
            sender_data_type,
        }
    }

    /// Export this session at the first known message index.
    ///
    /// If only a limited part of this session should be exported use
    /// [`InboundGroupSession::export_at_index()`].
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    ///
    /// Indices below the first known index are raised to it.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        let session_key = self
            .inner
            .lock()
            .await
            .export_at(message_index)
            .expect("A session can always be exported at an index it knows about");

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id().to_owned(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key,
            sender_claimed_keys: self.signing_keys,
            forwarding_curve25519_key_chain: self.forwarding_key_chain.to_vec(),
            shared_history: self.shared_history,
        }
    }

    /// Export the inbound group session into a format that can be uploaded to
    /// the server as a backup.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the creator of the session claims to own.
    pub fn signing_keys(&self) -> &SenderClaimedKeys {
        &self.signing_keys
    }

    /// The Curve25519 keys of the devices that forwarded this session to us,
    /// empty if we received it from its creator.
    pub fn forwarding_key_chain(&self) -> &[Curve25519PublicKey] {
        &self.forwarding_key_chain
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, SeqCst)
    }

    /// Mark the session as backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst)
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Has the session been imported from a file or server-side backup.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// How the session reached us.
    pub fn sender_data_type(&self) -> SenderDataType {
        self.sender_data_type
    }

    /// Whether this session can be shared with users who are invited to the
    /// room in the future.
    pub fn shared_history(&self) -> bool {
        self.shared_history
    }

    /// Check if this session is better than the given other session.
    ///
    /// A session is better if it can decrypt messages from an earlier index
    /// and belongs to the same ratchet. Sessions of different senders or rooms
    /// are [`SessionOrdering::Unconnected`].
    pub async fn compare(&self, other: &InboundGroupSession) -> SessionOrdering {
        // Locking the same session twice would deadlock.
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key() != other.sender_key()
            || self.signing_keys() != other.signing_keys()
            || self.room_id() != other.room_id()
        {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    pub(crate) async fn decrypt_helper(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Decrypt an event from a room timeline.
    ///
    /// Returns the decrypted event as a JSON object, with the `sender`,
    /// `event_id`, `origin_server_ts` and `unsigned` fields of the encrypted
    /// event filled in, and the message index the event was encrypted at.
    pub async fn decrypt(&self, event: &EncryptedEvent) -> MegolmResult<(JsonObject, u32)> {
        let message = event.content.megolm_message()?;
        let decrypted = self.decrypt_helper(&message).await?;

        let plaintext = String::from_utf8_lossy(&decrypted.plaintext);
        let mut decrypted_object = serde_json::from_str::<JsonObject>(&plaintext)?;

        let server_ts: u64 = event.origin_server_ts.0.into();

        decrypted_object.insert("sender".to_owned(), event.sender.to_string().into());
        decrypted_object.insert("event_id".to_owned(), event.event_id.to_string().into());
        decrypted_object.insert("origin_server_ts".to_owned(), server_ts.into());

        let room_id = decrypted_object
            .get("room_id")
            .and_then(|r| r.as_str().and_then(|r| RoomId::parse(r).ok()));

        // The event must not have been lifted out of a different room.
        if room_id.as_deref() != Some(self.room_id()) {
            return Err(EventError::MismatchedRoom(self.room_id().to_owned(), room_id).into());
        }

        decrypted_object.insert(
            "unsigned".to_owned(),
            serde_json::to_value(&event.unsigned).unwrap_or_default(),
        );

        if let Some(decrypted_content) =
            decrypted_object.get_mut("content").and_then(|c| c.as_object_mut())
        {
            if !decrypted_content.contains_key("m.relates_to") {
                if let Some(relation) = &event.content.relates_to {
                    decrypted_content.insert("m.relates_to".to_owned(), relation.to_owned());
                }
            }
        }

        Ok((decrypted_object, decrypted.message_index))
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the InboundGroupSession.
    pub pickle: InboundGroupSessionPickle,
    /// The public Curve25519 key of the account that sent us the session
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The public ed25519 key of the account that sent us the session.
    pub signing_key: SenderClaimedKeys,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The Curve25519 keys of the devices that forwarded us the session.
    #[serde(
        default,
        deserialize_with = "deserialize_curve_key_vec",
        serialize_with = "serialize_curve_key_vec"
    )]
    pub forwarding_chain: Vec<Curve25519PublicKey>,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// History visibility of the room when the session was created.
    pub history_visibility: Option<HistoryVisibility>,
    /// Whether the session may be shared with users invited later.
    #[serde(default)]
    pub shared_history: bool,
    /// How the session reached us.
    #[serde(default)]
    pub sender_data_type: SenderDataType,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{
        device_id, event_id, events::room::history_visibility::HistoryVisibility, room_id,
        user_id, RoomId,
    };
    use serde_json::json;
    use vodozemac::megolm::SessionOrdering;

    use super::{InboundGroupSession, PickledInboundGroupSession};
    use crate::{
        error::{EventError, MegolmError},
        olm::{Account, EncryptionSettings, OutboundGroupSession, SenderDataType},
        types::events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            room::encrypted::{EncryptedEvent, RoomEncryptedEventContent},
        },
        utilities::millis,
    };

    async fn session_pair(room_id: &RoomId) -> (Account, OutboundGroupSession, InboundGroupSession) {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let (outbound, inbound) = account
            .static_data()
            .create_group_session_pair(room_id, EncryptionSettings::default(), millis(0))
            .await
            .unwrap();

        (account, outbound, inbound)
    }

    fn encrypted_event(content: RoomEncryptedEventContent) -> EncryptedEvent {
        EncryptedEvent {
            sender: user_id!("@alice:localhost").to_owned(),
            event_id: event_id!("$event:localhost").to_owned(),
            origin_server_ts: millis(1),
            content,
            unsigned: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_decrypt_fills_in_the_outer_event_fields() {
        let room_id = room_id!("!test:localhost");
        let (_, outbound, inbound) = session_pair(room_id).await;

        let content = outbound
            .encrypt(
                "m.room.message",
                json!({
                    "msgtype": "m.text",
                    "body": "It's a secret to everybody",
                    "m.relates_to": {"rel_type": "m.thread", "event_id": "$root:localhost"},
                }),
            )
            .await;

        assert!(content.relates_to.is_some(), "The relation is kept in the clear");

        let (decrypted, index) = inbound.decrypt(&encrypted_event(content)).await.unwrap();

        assert_eq!(index, 0);
        assert_eq!(decrypted["sender"], "@alice:localhost");
        assert_eq!(decrypted["event_id"], "$event:localhost");
        assert_eq!(decrypted["room_id"], room_id.as_str());
        assert_eq!(decrypted["content"]["body"], "It's a secret to everybody");
        assert_eq!(decrypted["content"]["m.relates_to"]["rel_type"], "m.thread");
    }

    #[tokio::test]
    async fn test_decrypt_rejects_events_from_another_room() {
        let (_, outbound, inbound) = session_pair(room_id!("!first:localhost")).await;

        // A copy of the same room key, claimed to belong to a different room.
        let mut export = inbound.export().await;
        export.room_id = room_id!("!second:localhost").to_owned();
        let other_room_session = InboundGroupSession::from_export(&export).unwrap();

        let content = outbound.encrypt("m.room.message", json!({"body": "hello"})).await;
        let result = other_room_session.decrypt(&encrypted_event(content)).await;

        assert_matches!(result, Err(MegolmError::EventError(EventError::MismatchedRoom(..))));
    }

    #[tokio::test]
    async fn test_lower_first_known_index_is_better() {
        let room_id = room_id!("!test:localhost");
        let (_, outbound, inbound) = session_pair(room_id).await;

        for _ in 0..5 {
            outbound.encrypt("m.room.message", json!({"body": "ratchet"})).await;
        }

        let later = InboundGroupSession::from_export(&inbound.export_at_index(5).await).unwrap();

        assert_eq!(later.first_known_index(), 5);
        assert_eq!(inbound.compare(&later).await, SessionOrdering::Better);
        assert_eq!(later.compare(&inbound).await, SessionOrdering::Worse);
        assert_eq!(inbound.compare(&inbound).await, SessionOrdering::Equal);

        let (_, _, unrelated) = session_pair(room_id).await;
        assert_eq!(inbound.compare(&unrelated).await, SessionOrdering::Unconnected);
    }

    #[tokio::test]
    async fn test_forwarded_key_extends_the_chain() {
        let room_id = room_id!("!test:localhost");
        let (account, _, inbound) = session_pair(room_id).await;
        let forwarder = Account::new(user_id!("@alice:localhost"), device_id!("OTHERDEVICE"));

        let content: ForwardedRoomKeyContent = inbound.export().await.into();
        let forwarded = InboundGroupSession::from_forwarded_key(
            forwarder.identity_keys().curve25519,
            &content,
        )
        .unwrap();

        assert_eq!(forwarded.sender_key(), account.identity_keys().curve25519);
        assert_eq!(forwarded.forwarding_key_chain(), &[forwarder.identity_keys().curve25519]);
        assert_eq!(forwarded.sender_data_type(), SenderDataType::Forwarded);
        assert_eq!(inbound.compare(&forwarded).await, SessionOrdering::Equal);
    }

    #[tokio::test]
    async fn test_pickle_keeps_provenance_and_backup_state() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let settings = EncryptionSettings {
            history_visibility: HistoryVisibility::Shared,
            ..Default::default()
        };
        let (_, inbound) = account
            .static_data()
            .create_group_session_pair(room_id!("!test:localhost"), settings, millis(0))
            .await
            .unwrap();

        inbound.mark_as_backed_up();
        assert!(inbound.shared_history());

        let pickle = serde_json::to_string(&inbound.pickle().await).unwrap();
        let pickle: PickledInboundGroupSession = serde_json::from_str(&pickle).unwrap();
        let restored = InboundGroupSession::from_pickle(pickle);

        assert_eq!(restored.session_id(), inbound.session_id());
        assert!(restored.backed_up());
        assert!(restored.shared_history());
        assert_eq!(restored.sender_data_type(), SenderDataType::Direct);

        restored.reset_backup_state();
        assert!(!restored.backed_up());
    }
}
