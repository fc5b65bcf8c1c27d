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

use std::{fmt, sync::Arc};

use ruma::MilliSecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{field::debug, instrument, trace, Span};
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use super::StaticAccountData;
use crate::{
    error::{EventError, OlmResult},
    identities::DeviceData,
    types::{
        deserialize_curve_key, events::room::encrypted::ToDeviceEncryptedEventContent,
        serialize_curve_key,
    },
};

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    /// Our own account data, needed to fill in the plaintext of the messages
    /// we encrypt.
    pub our_account: StaticAccountData,
    /// The vodozemac session.
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our session ID.
    pub session_id: Arc<str>,
    /// The Curve25519 key of the other side.
    pub sender_key: Curve25519PublicKey,
    /// Has this been created using the fallback key
    pub created_using_fallback_key: bool,
    /// When the session was created
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// When the session was last used, either to encrypt or to decrypt.
    pub last_use_time: MilliSecondsSinceUnixEpoch,
    /// When we last decrypted a message using this session.
    ///
    /// Sessions that never received a message carry the time they were
    /// created if they were forced into existence to unwedge a device, and
    /// the Unix epoch otherwise.
    pub last_message_received_at: MilliSecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .field("last_message_received_at", &self.last_message_received_at)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a [`DecryptionError`] if decryption
    /// failed.
    ///
    /// # Arguments
    ///
    /// * `message` - The Olm message that should be decrypted.
    ///
    /// * `now` - The time we received the message.
    #[instrument(skip_all, fields(session))]
    pub async fn decrypt(
        &mut self,
        message: &OlmMessage,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Result<String, DecryptionError> {
        let mut inner = self.inner.lock().await;
        let plaintext = inner.decrypt(message)?;

        Span::current().record("session", debug(&*inner));
        trace!("Decrypted a Olm message");

        let plaintext = String::from_utf8_lossy(&plaintext).to_string();

        self.last_use_time = now;
        self.last_message_received_at = now;

        Ok(plaintext)
    }

    /// Get the sender key that was used to establish this Session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    async fn encrypt_helper(
        &mut self,
        plaintext: &str,
        now: MilliSecondsSinceUnixEpoch,
    ) -> OlmMessage {
        let mut session = self.inner.lock().await;

        Span::current().record("session", debug(&*session));
        let message = session.encrypt(plaintext);

        self.last_use_time = now;
        message
    }

    /// Encrypt the given event content as an `m.room.encrypted` to-device
    /// event content.
    ///
    /// # Arguments
    ///
    /// * `recipient_device` - The device for which this message is going to be
    ///   encrypted, this needs to be the device that was used to create this
    ///   session with.
    ///
    /// * `event_type` - The type of the event content.
    ///
    /// * `content` - The content of the event.
    ///
    /// * `now` - The current time, recorded as the last use of the session.
    #[instrument(skip_all, fields(session, recipient = ?recipient_device.device_id()))]
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceData,
        event_type: &str,
        content: Value,
        now: MilliSecondsSinceUnixEpoch,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let plaintext = {
            let recipient_signing_key =
                recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;

            let payload = json!({
                "sender": self.our_account.user_id(),
                "sender_device": self.our_account.device_id(),
                "keys": {
                    "ed25519": self.our_account.identity_keys().ed25519.to_base64(),
                },
                "recipient": recipient_device.user_id(),
                "recipient_keys": {
                    "ed25519": recipient_signing_key.to_base64(),
                },
                "type": event_type,
                "content": content,
            });

            serde_json::to_string(&payload)?
        };

        let ciphertext = self.encrypt_helper(&plaintext, now).await;

        Ok(ToDeviceEncryptedEventContent::new(
            self.our_account.identity_keys().curve25519,
            self.sender_key,
            ciphertext,
        ))
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store the session in a serializable form.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
            last_message_received_at: self.last_message_received_at,
        }
    }

    /// Restore a Session from a previously pickled form.
    ///
    /// # Arguments
    ///
    /// * `our_account` - Our own account data, the session belongs to it.
    ///
    /// * `pickle` - The pickled version of the `Session`.
    pub fn from_pickle(our_account: StaticAccountData, pickle: PickledSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Session {
            our_account,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            created_using_fallback_key: pickle.created_using_fallback_key,
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
            last_message_received_at: pickle.last_message_received_at,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickle holding the Olm Session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the other user that we share this session with.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// Was the session created using a fallback key.
    #[serde(default)]
    pub created_using_fallback_key: bool,
    /// The Unix timestamp when the session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// The Unix timestamp when the session was last used.
    pub last_use_time: MilliSecondsSinceUnixEpoch,
    /// The Unix timestamp when the session last decrypted a message.
    pub last_message_received_at: MilliSecondsSinceUnixEpoch,
}
