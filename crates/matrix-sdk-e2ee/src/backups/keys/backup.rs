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

use ruma::serde::Base64;
use vodozemac::{pk_encryption::PkEncryption, Curve25519PublicKey};
use zeroize::Zeroizing;

use super::decryption::DecodeError;
use crate::{
    locks::Mutex,
    olm::InboundGroupSession,
    types::{
        backup::{EncryptedSessionData, KeyBackupData, MegolmV1AuthData, MEGOLM_BACKUP_V1},
        Signatures,
    },
};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    signatures: Signatures,
    version: Mutex<Option<String>>,
}

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(super) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self {
            inner: InnerBackupKey {
                key,
                signatures: Default::default(),
                version: Mutex::new(version),
            }
            .into(),
        }
    }

    /// Create the backup key from the auth data of a backup version the
    /// server gave us.
    pub fn from_auth_data(auth_data: &MegolmV1AuthData, version: Option<String>) -> Self {
        Self {
            inner: InnerBackupKey {
                key: auth_data.public_key,
                signatures: auth_data.signatures.clone(),
                version: Mutex::new(version),
            }
            .into(),
        }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1
    }

    /// Get all the signatures of this `MegolmV1BackupKey`.
    pub fn signatures(&self) -> Signatures {
        self.inner.signatures.to_owned()
    }

    /// The auth data that gets published together with a new backup
    /// version.
    pub fn auth_data(&self) -> MegolmV1AuthData {
        MegolmV1AuthData::new(self.inner.key, self.signatures())
    }

    /// Try to create a new `MegolmV1BackupKey` from a base 64 encoded string.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;

        Ok(Self::new(key, None))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().clone()
    }

    /// Set the backup version that this `MegolmV1BackupKey` will be used with.
    ///
    /// The key won't be able to encrypt room keys unless a version has been
    /// set.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock() = Some(version);
    }

    pub(crate) async fn encrypt(&self, session: &InboundGroupSession) -> KeyBackupData {
        let pk = PkEncryption::from_key(self.inner.key);

        // The forwarding chains don't mean much, we only care whether we received the
        // session directly from the creator of the session or not.
        let forwarded_count = u32::from(session.has_been_imported());
        let first_message_index = session.first_known_index();

        let key = session.to_backup().await;

        // The session key inside `BackedUpRoomKey` zeroizes itself, the
        // serialized copy needs to be wrapped.
        let key =
            Zeroizing::new(serde_json::to_vec(&key).expect("Can't serialize exported room key"));

        let message = pk.encrypt(&key);

        KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: Base64::new(message.ephemeral_key.to_vec()),
                ciphertext: Base64::new(message.ciphertext),
                mac: Base64::new(message.mac),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use crate::{
        backups::{BackupDecryptionKey, MegolmV1BackupKey},
        olm::Account,
        utilities::millis,
    };

    #[tokio::test]
    async fn test_encrypted_key_decrypts_with_the_private_part() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let account = Account::new(user_id!("@alice:localhost"), device_id!("ABCDEFG"));
        let (_, inbound) = account
            .static_data()
            .create_group_session_pair(room_id!("!room_id:localhost"), Default::default(), millis(0))
            .await
            .unwrap();

        let key_backup_data = backup_key.encrypt(&inbound).await;
        assert_eq!(key_backup_data.first_message_index, 0);
        assert_eq!(key_backup_data.forwarded_count, 0);

        let room_key = decryption_key
            .decrypt_session_data(&key_backup_data.session_data)
            .expect("The backed up key should be decrypted successfully");

        assert_eq!(room_key.sender_key, inbound.sender_key());
        assert_eq!(room_key.session_key.to_base64(), inbound.export().await.session_key.to_base64());

        // Somebody else's key can't read it.
        let other_key = BackupDecryptionKey::new();
        assert!(other_key.decrypt_session_data(&key_backup_data.session_data).is_err());
    }

    #[test]
    fn test_public_key_from_base64() {
        let decryption_key = BackupDecryptionKey::from_bytes(&[3u8; 32]);
        let backup_key = decryption_key.megolm_v1_public_key();

        let decoded = MegolmV1BackupKey::from_base64(&backup_key.to_base64()).unwrap();
        assert_eq!(decoded.to_base64(), backup_key.to_base64());
        assert!(decoded.backup_version().is_none());

        decoded.set_version("1".to_owned());
        assert_eq!(decoded.backup_version().as_deref(), Some("1"));
        assert!(decryption_key.backup_key_matches(&decoded.auth_data()));

        assert!(MegolmV1BackupKey::from_base64("not a key").is_err());
    }
}
