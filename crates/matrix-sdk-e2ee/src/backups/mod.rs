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

//! Server-side backup support for room keys
//!
//! This module implements support for server-side backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
//!
//! Room keys are encrypted to the public part of a backup key and uploaded
//! in batches. A key is only marked as backed up once the server accepted
//! the upload that contained it. Restoring a backup downloads every key,
//! decrypts each one on its own and imports the ones that decrypted.

use std::{collections::BTreeMap, sync::Arc};

use ruma::{DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::SignatureError,
    olm::{utility::VerifyJson, ExportedRoomKey, InboundGroupSession},
    store::{BackupKeys, Changes, CryptoStoreError, RoomKeyCounts, RoomKeyImportResult, Store},
    transport::{Transport, TransportError},
    types::{
        backup::{MegolmV1AuthData, RoomKeyBackup, RoomKeyBackupInfo},
        requests::KeysBackupRequest,
    },
};

mod keys;

pub use keys::{BackupDecryptionKey, DecodeError, DecryptionError, MegolmV1BackupKey};

/// Error type for backing up room keys and restoring them.
/// Error type for the backup and restore of room keys.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The request to the server failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server doesn't know the requested backup version.
    #[error("the backup version {0} doesn't exist")]
    MissingBackup(String),

    /// The backup uses an algorithm we don't support.
    #[error("the backup uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The backup key wasn't created from a passphrase, the auth data has no
    /// salt or iteration count.
    #[error("the backup has no passphrase info, its key can't be derived from a passphrase")]
    MissingPassphraseInfo,

    /// The key we got doesn't match the public key of the backup, for
    /// example because the passphrase was wrong.
    #[error("the key doesn't match the public key of the backup")]
    KeyMismatch,

    /// The recovery key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A state machine that handles backing up room keys.
///
/// The state machine can be activated using the
/// [`BackupMachine::enable_backup_v1`] method. After the state machine has been
/// enabled [`BackupMachine::backup`] uploads a batch of encrypted room keys.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    store: Store,
    transport: Arc<dyn Transport>,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
    upload_lock: Arc<Mutex<()>>,
}

/// The result of a signature verification of a signed JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureVerification {
    /// The result of the signature verification using the public key of our own
    /// device.
    pub device_signature: SignatureState,
    /// The result of the signature verification using public keys of other
    /// devices we own.
    pub other_signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

impl SignatureVerification {
    /// Is the result considered to be trusted?
    ///
    /// This tells us if the result has a valid signature from our own device
    /// or from one of our other devices that we trust.
    pub fn trusted(&self) -> bool {
        self.device_signature.trusted() || self.other_signatures.values().any(|s| s.trusted())
    }
}

/// The result of a signature check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device that created the signature is not
    /// trusted.
    ValidButNotTrusted,
    /// The signature is valid and the device that created the signature is
    /// trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did we find a valid signature?
    pub fn signed(self) -> bool {
        matches!(self, SignatureState::ValidButNotTrusted | SignatureState::ValidAndTrusted)
    }
}

impl From<Result<(), SignatureError>> for SignatureState {
    fn from(result: Result<(), SignatureError>) -> Self {
        match result {
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(SignatureError::NoSignatureFound) => SignatureState::Missing,
            Err(_) => SignatureState::Invalid,
        }
    }
}

impl BackupMachine {
    const BACKUP_BATCH_SIZE: usize = 100;

    pub(crate) fn new(
        store: Store,
        transport: Arc<dyn Transport>,
        backup_key: Option<MegolmV1BackupKey>,
    ) -> Self {
        Self {
            store,
            transport,
            backup_key: RwLock::new(backup_key).into(),
            upload_lock: Mutex::new(()).into(),
        }
    }

    /// Are we able to back up room keys to the server?
    pub async fn enabled(&self) -> bool {
        self.backup_key.read().await.as_ref().is_some_and(|b| b.backup_version().is_some())
    }

    /// The version of the backup we're uploading room keys to, if any.
    pub async fn backup_version(&self) -> Option<String> {
        self.backup_key.read().await.as_ref().and_then(|k| k.backup_version())
    }

    fn key_id(device_id: &DeviceId) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id)
    }

    /// Check if the auth data has been signed by the given device of ours.
    async fn test_ed25519_device_signature(
        &self,
        device_id: &DeviceId,
        auth_data: &MegolmV1AuthData,
    ) -> Result<SignatureState, CryptoStoreError> {
        // Signatures by non-device keys don't have a corresponding device and
        // end up as missing here.
        let Some(device) = self.store.get_device(self.store.user_id(), device_id).await? else {
            trace!(?device_id, "Device not found, can't check signature");
            return Ok(SignatureState::Missing);
        };

        let Some(signing_key) = device.ed25519_key() else {
            return Ok(SignatureState::Missing);
        };

        let state: SignatureState = signing_key
            .verify_json(self.store.user_id(), &Self::key_id(device_id), auth_data)
            .into();

        Ok(if state.signed() && device.is_verified() {
            SignatureState::ValidAndTrusted
        } else {
            state
        })
    }

    async fn verify_auth_data_v1(
        &self,
        auth_data: &MegolmV1AuthData,
    ) -> Result<SignatureVerification, CryptoStoreError> {
        trace!(?auth_data, "Verifying backup auth data");

        let own_key = self.store.static_account().identity_keys.ed25519;

        // Our own device is always trusted.
        let device_signature = match SignatureState::from(own_key.verify_json(
            self.store.user_id(),
            &Self::key_id(self.store.device_id()),
            auth_data,
        )) {
            SignatureState::ValidButNotTrusted => SignatureState::ValidAndTrusted,
            state => state,
        };

        let mut other_signatures = BTreeMap::new();

        if let Some(user_signatures) = auth_data.signatures.get(self.store.user_id()) {
            for device_key_id in user_signatures.keys() {
                if device_key_id.algorithm() != DeviceKeyAlgorithm::Ed25519
                    || device_key_id.key_name() == self.store.device_id()
                {
                    continue;
                }

                let device_id = device_key_id.key_name();
                let state = self.test_ed25519_device_signature(device_id, auth_data).await?;
                other_signatures.insert(device_id.to_owned(), state);
            }
        }

        Ok(SignatureVerification { device_signature, other_signatures })
    }

    /// Verify some backup info that we downloaded from the server.
    ///
    /// A backup is trusted if its auth data was signed by our own device or
    /// by one of our verified devices. Backups using an unknown algorithm are
    /// never trusted.
    pub async fn verify_backup(
        &self,
        backup_info: &RoomKeyBackupInfo,
    ) -> Result<SignatureVerification, CryptoStoreError> {
        if let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data) = backup_info {
            self.verify_auth_data_v1(data).await
        } else {
            Ok(Default::default())
        }
    }

    /// Activate the given backup key to be used to encrypt and backup room
    /// keys.
    ///
    /// The key needs to have a backup version set, keys can't be uploaded
    /// otherwise.
    pub async fn enable_backup_v1(&self, key: MegolmV1BackupKey) -> Result<(), CryptoStoreError> {
        if key.backup_version().is_some() {
            info!(backup_key = ?key, "Activated a backup");
            *self.backup_key.write().await = Some(key);
        } else {
            warn!(backup_key = ?key, "Tried to activate a backup without a backup version");
        }

        Ok(())
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Disable and reset our backup state.
    ///
    /// This will remove the backup key and reset the backup state of each room
    /// key we have.
    #[instrument(skip(self))]
    pub async fn disable_backup(&self) -> Result<(), CryptoStoreError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        let _guard = self.upload_lock.lock().await;

        self.backup_key.write().await.take();
        self.store.reset_backup_state().await?;

        debug!("Done disabling backup");

        Ok(())
    }

    /// Store the backup decryption key in the crypto store.
    pub async fn save_decryption_key(
        &self,
        backup_decryption_key: Option<BackupDecryptionKey>,
        version: Option<String>,
    ) -> Result<(), CryptoStoreError> {
        let changes =
            Changes { backup_decryption_key, backup_version: version, ..Default::default() };
        self.store.save_changes(changes).await
    }

    /// Get the backup keys we have saved in our crypto store.
    pub async fn get_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError> {
        self.store.load_backup_keys().await
    }

    /// Encrypt and upload one batch of room keys that aren't backed up yet.
    ///
    /// Returns the number of room keys that were uploaded, zero if there was
    /// nothing to do or no backup is enabled. If the upload fails, none of
    /// the keys are marked as backed up.
    #[instrument(skip(self))]
    pub async fn backup(&self) -> Result<usize, BackupError> {
        let _guard = self.upload_lock.lock().await;

        let Some(backup_key) = self.backup_key.read().await.clone() else {
            warn!("Trying to backup room keys but no backup key was found");
            return Ok(0);
        };

        let Some(version) = backup_key.backup_version() else {
            warn!("Trying to backup room keys but the backup key wasn't uploaded");
            return Ok(0);
        };

        let sessions =
            self.store.inbound_group_sessions_for_backup(Self::BACKUP_BATCH_SIZE).await?;

        if sessions.is_empty() {
            trace!(?backup_key, "No room keys need to be backed up");
            return Ok(0);
        }

        let rooms = Self::backup_keys(&sessions, &backup_key).await;
        let request = KeysBackupRequest { version, rooms };
        let key_count = request.key_count();

        debug!(key_count, version = request.version, "Uploading room keys to the backup");

        self.transport.upload_room_keys(&request).await?;

        let ids: Vec<_> = sessions.iter().map(|s| (s.room_id(), s.session_id())).collect();
        self.store.mark_inbound_group_sessions_as_backed_up(&ids).await?;

        let counts = self.store.inbound_group_session_counts().await?;
        info!(key_count, room_key_counts = ?counts, "Marked room keys as backed up");

        Ok(key_count)
    }

    /// Upload every room key that isn't backed up yet, one batch after the
    /// other.
    ///
    /// Returns the total number of uploaded room keys.
    pub async fn backup_all_group_sessions(&self) -> Result<usize, BackupError> {
        let mut total = 0;

        loop {
            let uploaded = self.backup().await?;

            if uploaded == 0 {
                break;
            }

            total += uploaded;
        }

        Ok(total)
    }

    async fn backup_keys(
        sessions: &[InboundGroupSession],
        backup_key: &MegolmV1BackupKey,
    ) -> RoomKeyBackup {
        let mut backup: RoomKeyBackup = BTreeMap::new();

        for session in sessions {
            let data = backup_key.encrypt(session).await;

            backup
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), data);
        }

        backup
    }

    /// Restore the room keys of a backup whose key was created from a
    /// passphrase.
    ///
    /// The key is derived with the salt and iteration count of the backup's
    /// auth data, and must match the public key of the backup.
    #[instrument(skip(self, passphrase))]
    pub async fn restore_key_backup_with_password(
        &self,
        version: &str,
        passphrase: &str,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let auth_data = self.get_auth_data(version).await?;

        let (Some(salt), Some(iterations)) =
            (&auth_data.private_key_salt, auth_data.private_key_iterations)
        else {
            warn!("Salt and/or iterations not found in key backup auth data");
            return Err(BackupError::MissingPassphraseInfo);
        };

        let decryption_key = BackupDecryptionKey::from_passphrase(passphrase, salt, iterations);

        self.restore_key_backup(version, &auth_data, decryption_key).await
    }

    /// Restore the room keys of a backup using a base58 recovery key.
    #[instrument(skip(self, recovery_key))]
    pub async fn restore_key_backup_with_recovery_key(
        &self,
        version: &str,
        recovery_key: &str,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let auth_data = self.get_auth_data(version).await?;
        let decryption_key = BackupDecryptionKey::from_base58(recovery_key)?;

        self.restore_key_backup(version, &auth_data, decryption_key).await
    }

    async fn get_auth_data(&self, version: &str) -> Result<MegolmV1AuthData, BackupError> {
        let backup = self
            .transport
            .get_backup_version(Some(version))
            .await?
            .ok_or_else(|| BackupError::MissingBackup(version.to_owned()))?;

        match backup.info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) => Ok(auth_data),
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                Err(BackupError::UnsupportedAlgorithm(algorithm))
            }
        }
    }

    async fn restore_key_backup(
        &self,
        version: &str,
        auth_data: &MegolmV1AuthData,
        decryption_key: BackupDecryptionKey,
    ) -> Result<RoomKeyImportResult, BackupError> {
        if !decryption_key.backup_key_matches(auth_data) {
            warn!("The public key of the backup doesn't match the key we derived");
            return Err(BackupError::KeyMismatch);
        }

        // The key is valid, keep it around before the possibly long import.
        self.save_decryption_key(Some(decryption_key.clone()), Some(version.to_owned())).await?;

        let backup = self.transport.download_room_keys(version).await?;
        let (keys, total_count) = Self::decrypt_backup(&decryption_key, backup);

        // Keys that came from the backup we upload to don't need another
        // upload, keys from any other backup do.
        let from_backup_version =
            (self.backup_version().await.as_deref() == Some(version)).then_some(version);

        let result = self.store.import_room_keys(keys, from_backup_version).await?;

        // Records that didn't decrypt still count towards the total.
        Ok(RoomKeyImportResult { total_count, ..result })
    }

    /// Decrypt every record of the backup, returning the keys that decrypted
    /// and the number of records the backup holds.
    fn decrypt_backup(
        decryption_key: &BackupDecryptionKey,
        backup: RoomKeyBackup,
    ) -> (Vec<ExportedRoomKey>, usize) {
        let mut keys = Vec::new();
        let mut total = 0;

        for (room_id, sessions) in backup {
            for (session_id, data) in sessions {
                total += 1;

                match decryption_key.decrypt_session_data(&data.session_data) {
                    Ok(room_key) => keys.push(ExportedRoomKey::from_backed_up_room_key(
                        room_id.clone(),
                        session_id,
                        room_key,
                    )),
                    Err(e) => {
                        warn!(
                            ?room_id,
                            session_id,
                            error = ?e,
                            "Couldn't decrypt a backed up room key"
                        );
                    }
                }
            }
        }

        info!(total, decrypted = keys.len(), "Decrypted the room keys of a backup");

        (keys, total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id, DeviceKeyAlgorithm, DeviceKeyId, RoomId};
    use serde_json::json;

    use super::{BackupDecryptionKey, BackupError, BackupMachine, SignatureState};
    use crate::{
        identities::{DeviceData, LocalTrust},
        machine::test_helpers::MockTransport,
        olm::{Account, InboundGroupSession},
        store::{Changes, MemoryStore, Store},
        types::backup::{BackupVersion, RoomKeyBackupInfo},
        utilities::{millis, MockClock},
    };

    const VERSION: &str = "1";

    fn room_id() -> &'static RoomId {
        room_id!("!test:localhost")
    }

    async fn setup() -> (BackupMachine, Store, MockTransport) {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let store =
            Store::new(account, Arc::new(MemoryStore::new()), Arc::new(MockClock::default()));

        let pickle = store.account().await.pickle();
        store.save_changes(Changes { account: Some(pickle), ..Default::default() }).await.unwrap();

        let transport = MockTransport::default();
        let machine = BackupMachine::new(store.clone(), Arc::new(transport.clone()), None);

        (machine, store, transport)
    }

    async fn add_room_keys(store: &Store, count: usize) -> Vec<InboundGroupSession> {
        let mut sessions = Vec::new();

        for _ in 0..count {
            let (_, inbound) = store
                .static_account()
                .create_group_session_pair(room_id(), Default::default(), millis(0))
                .await
                .unwrap();
            sessions.push(inbound);
        }

        store.save_inbound_group_sessions(&sessions).await.unwrap();

        sessions
    }

    fn backup_version(decryption_key: &BackupDecryptionKey) -> BackupVersion {
        let auth_data = decryption_key.megolm_v1_public_key().auth_data();

        BackupVersion {
            version: VERSION.to_owned(),
            info: RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data),
        }
    }

    #[tokio::test]
    async fn test_backup_flow() {
        let (machine, store, transport) = setup().await;
        add_room_keys(&store, 2).await;

        // Nothing happens without a backup key.
        assert_eq!(machine.backup().await.unwrap(), 0);
        assert!(!machine.enabled().await);

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version(VERSION.to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();
        assert!(machine.enabled().await);

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (2, 0));

        assert_eq!(machine.backup().await.unwrap(), 2);

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (2, 2));
        assert_eq!(transport.backed_up_keys(VERSION).len(), 2);

        // Everything is backed up.
        assert_eq!(machine.backup().await.unwrap(), 0);

        machine.disable_backup().await.unwrap();
        assert!(!machine.enabled().await);
        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (2, 0));
    }

    #[tokio::test]
    async fn test_failed_upload_doesnt_mark_keys() {
        let (machine, store, transport) = setup().await;
        add_room_keys(&store, 1).await;

        let backup_key = BackupDecryptionKey::new().megolm_v1_public_key();
        backup_key.set_version(VERSION.to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();

        transport.set_fail_uploads(true);
        assert_matches!(machine.backup().await, Err(BackupError::Transport(_)));
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 0);

        transport.set_fail_uploads(false);
        assert_eq!(machine.backup_all_group_sessions().await.unwrap(), 1);
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 1);
    }

    #[tokio::test]
    async fn test_backup_all_uploads_in_batches() {
        let (machine, store, transport) = setup().await;
        add_room_keys(&store, 150).await;

        let backup_key = BackupDecryptionKey::new().megolm_v1_public_key();
        backup_key.set_version(VERSION.to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();

        assert_eq!(machine.backup_all_group_sessions().await.unwrap(), 150);
        assert_eq!(transport.backed_up_keys(VERSION).len(), 150);
        assert_eq!(transport.upload_count(), 2);
    }

    #[tokio::test]
    async fn test_restore_with_password() {
        let (machine, store, transport) = setup().await;
        let sessions = add_room_keys(&store, 3).await;

        let salt = "MmMsAlty";
        let decryption_key = BackupDecryptionKey::from_passphrase("passphrase", salt, 1000);
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version(VERSION.to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();
        machine.backup_all_group_sessions().await.unwrap();

        let mut version = backup_version(&decryption_key);
        if let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = &mut version.info {
            auth_data.private_key_salt = Some(salt.to_owned());
            auth_data.private_key_iterations = Some(1000);
        }
        transport.set_backup_version(version);

        // A fresh device of the same user restores the backup.
        let (_, other_store, _) = setup().await;
        let other_machine =
            BackupMachine::new(other_store.clone(), Arc::new(transport.clone()), None);

        assert_matches!(
            other_machine.restore_key_backup_with_password(VERSION, "wrong").await,
            Err(BackupError::KeyMismatch)
        );

        let result =
            other_machine.restore_key_backup_with_password(VERSION, "passphrase").await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (3, 3));

        for session in &sessions {
            let restored = other_store
                .get_inbound_group_session(room_id(), session.session_id())
                .await
                .unwrap()
                .unwrap();
            assert!(restored.has_been_imported());
            // The other device isn't uploading to this backup, the keys still
            // need to be backed up from there.
            assert!(!restored.backed_up());
        }

        let saved = other_machine.get_backup_keys().await.unwrap();
        assert!(saved.decryption_key.is_some());
        assert_eq!(saved.backup_version.as_deref(), Some(VERSION));

        // Unrelated calls on the original machine still work.
        assert_eq!(machine.backup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_skips_undecryptable_keys() {
        let (machine, store, transport) = setup().await;
        add_room_keys(&store, 2).await;

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        backup_key.set_version(VERSION.to_owned());
        machine.enable_backup_v1(backup_key).await.unwrap();
        machine.backup_all_group_sessions().await.unwrap();
        transport.set_backup_version(backup_version(&decryption_key));

        // Corrupt one of the uploaded keys.
        transport.corrupt_backed_up_key(VERSION);

        let (_, other_store, _) = setup().await;
        let other_machine = BackupMachine::new(other_store, Arc::new(transport.clone()), None);

        // Restoring into the backup we upload to marks the keys as backed up.
        let other_key = decryption_key.megolm_v1_public_key();
        other_key.set_version(VERSION.to_owned());
        other_machine.enable_backup_v1(other_key).await.unwrap();

        let result = other_machine
            .restore_key_backup_with_recovery_key(VERSION, &decryption_key.to_base58())
            .await
            .unwrap();

        assert_eq!((result.imported_count, result.total_count), (1, 2));
        assert_eq!(other_machine.room_key_counts().await.unwrap().backed_up, 1);
    }

    #[tokio::test]
    async fn test_restore_errors() {
        let (machine, _, transport) = setup().await;

        assert_matches!(
            machine.restore_key_backup_with_password(VERSION, "passphrase").await,
            Err(BackupError::MissingBackup(_))
        );

        // A backup created from a random key has no passphrase info.
        transport.set_backup_version(backup_version(&BackupDecryptionKey::new()));
        assert_matches!(
            machine.restore_key_backup_with_password(VERSION, "passphrase").await,
            Err(BackupError::MissingPassphraseInfo)
        );

        assert_matches!(
            machine.restore_key_backup_with_recovery_key(VERSION, "EsTc").await,
            Err(BackupError::Decode(_))
        );
    }

    #[tokio::test]
    async fn test_verify_auth_data() {
        let (machine, store, _) = setup().await;

        let decryption_key = BackupDecryptionKey::new();
        let mut auth_data = decryption_key.megolm_v1_public_key().auth_data();

        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data.clone());
        let verification = machine.verify_backup(&info).await.unwrap();
        assert!(!verification.trusted());
        assert_eq!(verification.device_signature, SignatureState::Missing);

        // Signed by our own device.
        let signature = store
            .account()
            .await
            .sign_json(serde_json::to_value(&auth_data).unwrap())
            .unwrap();
        auth_data.signatures.add_signature(
            store.user_id().to_owned(),
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, store.device_id()),
            signature,
        );

        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data.clone());
        let verification = machine.verify_backup(&info).await.unwrap();
        assert!(verification.trusted());
        assert_eq!(verification.device_signature, SignatureState::ValidAndTrusted);

        // Signed by another device of ours, trusted once we verify it.
        let other = Account::new(user_id!("@alice:localhost"), device_id!("OTHERDEVICE"));
        let mut auth_data = decryption_key.megolm_v1_public_key().auth_data();
        let signature = other.sign_json(serde_json::to_value(&auth_data).unwrap()).unwrap();
        auth_data.signatures.add_signature(
            other.user_id().to_owned(),
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, other.device_id()),
            signature,
        );
        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data);

        // Unknown device.
        let verification = machine.verify_backup(&info).await.unwrap();
        assert_eq!(verification.other_signatures[other.device_id()], SignatureState::Missing);

        let mut other_device = DeviceData::from_account(&other);
        store.save_device_data(&[other_device.clone()]).await.unwrap();
        let verification = machine.verify_backup(&info).await.unwrap();
        assert_eq!(
            verification.other_signatures[other.device_id()],
            SignatureState::ValidButNotTrusted
        );
        assert!(!verification.trusted());

        other_device.set_trust_state(LocalTrust::Verified);
        store.save_device_data(&[other_device]).await.unwrap();
        let verification = machine.verify_backup(&info).await.unwrap();
        assert!(verification.trusted());

        // A tampered public key invalidates the signature.
        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(mut tampered) = info else {
            unreachable!()
        };
        tampered.public_key =
            BackupDecryptionKey::new().megolm_v1_public_key().auth_data().public_key;
        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(tampered);
        let verification = machine.verify_backup(&info).await.unwrap();
        assert_eq!(verification.other_signatures[other.device_id()], SignatureState::Invalid);

        // Unknown algorithms are never trusted.
        let info: RoomKeyBackupInfo = serde_json::from_value(json!({
            "algorithm": "m.megolm_backup.v2",
            "auth_data": {}
        }))
        .unwrap();
        assert!(!machine.verify_backup(&info).await.unwrap().trusted());
    }
}
