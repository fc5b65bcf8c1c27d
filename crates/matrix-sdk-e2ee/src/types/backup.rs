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

//! Wire types of the `m.megolm_backup.v1.curve25519-aes-sha2` server-side
//! key backup.

use std::collections::BTreeMap;

use ruma::serde::Base64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{deserialize_curve_key, serialize_curve_key, Signatures};

/// The only backup algorithm we know how to use.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    /// The salt used to derive the backup key from a passphrase, if the key
    /// was created from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The PBKDF2 iteration count used together with `private_key_salt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    pub(crate) fn new(public_key: Curve25519PublicKey, signatures: Signatures) -> Self {
        Self {
            public_key,
            signatures,
            private_key_salt: None,
            private_key_iterations: None,
            extra: Default::default(),
        }
    }
}

/// Information pertaining to a room key backup version.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => {
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(serde_json::from_value(
                    value.auth_data,
                )?)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => BackupInfoHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data).map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// A backup version as returned by the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The version string of the backup.
    pub version: String,
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
}

/// A single room key in a backup, encrypted to the backup key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can
    /// decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the
    /// key is from.
    pub is_verified: bool,
    /// Encrypted data about the session.
    pub session_data: EncryptedSessionData,
}

/// The encrypted payload of a [`KeyBackupData`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// Unpadded base64-encoded public half of the ephemeral key.
    pub ephemeral: Base64,
    /// Ciphertext, encrypted using AES-CBC-256 with PKCS#7 padding, encoded
    /// in base64.
    pub ciphertext: Base64,
    /// First 8 bytes of MAC key, encoded in base64.
    pub mac: Base64,
}

/// The keys of a backup as uploaded or downloaded: room id → session id →
/// encrypted key.
pub type RoomKeyBackup = BTreeMap<ruma::OwnedRoomId, BTreeMap<String, KeyBackupData>>;
