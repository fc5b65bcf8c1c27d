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

use std::{fmt, sync::Arc};

use ruma::{DeviceId, DeviceKeyAlgorithm, DeviceKeyId, UserId};
use serde::{Deserialize, Serialize};
use tracing::warn;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    olm::{utility::VerifyJson, Account},
    types::{DeviceKeys, EventEncryptionAlgorithm, SignedKey},
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    Unset = 3,
}

impl From<i64> for LocalTrust {
    fn from(state: i64) -> Self {
        match state {
            0 => LocalTrust::Verified,
            1 => LocalTrust::BlackListed,
            2 => LocalTrust::Ignored,
            _ => LocalTrust::Unset,
        }
    }
}

/// A device of a user, as published through a key query, together with our
/// local view on its trust.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceData {
    #[serde(alias = "inner")]
    pub(crate) device_keys: Arc<DeviceKeys>,
    trust_state: LocalTrust,
    /// Has the owner of the device signed it with their self-signing key, and
    /// do we trust the owner.
    #[serde(default)]
    cross_signing_trusted: bool,
    /// The number of times the device has created a new Olm session with us,
    /// each new session might mean that the device lost the room keys we sent
    /// it.
    #[serde(default)]
    pub(crate) olm_wedging_index: u32,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DeviceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceData")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .field("display_name", &self.display_name())
            .field("keys", &self.device_keys.keys)
            .field("trust_state", &self.trust_state)
            .field("cross_signing_trusted", &self.cross_signing_trusted)
            .finish()
    }
}

impl DeviceData {
    /// Create a new Device, this constructor skips signature verification of
    /// the keys, `TryFrom` should be used for completely new devices we
    /// receive.
    pub fn new(device_keys: DeviceKeys, trust_state: LocalTrust) -> Self {
        Self {
            device_keys: device_keys.into(),
            trust_state,
            cross_signing_trusted: false,
            olm_wedging_index: 0,
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_keys.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.device_keys.unsigned.device_display_name.as_deref()
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.device_keys.curve25519_key()
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.device_keys.ed25519_key()
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// Does this device support the Olm encryption algorithm.
    pub fn supports_olm(&self) -> bool {
        self.algorithms().contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// Get the device keys this device published.
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.trust_state
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust_state() == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any group sessions.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust_state() == LocalTrust::BlackListed
    }

    /// Is this device considered to be verified using cross signing.
    pub fn is_cross_signing_trusted(&self) -> bool {
        self.cross_signing_trusted
    }

    /// Is this device considered to be verified, either locally or through
    /// cross signing.
    pub fn is_verified(&self) -> bool {
        self.is_locally_trusted() || self.is_cross_signing_trusted()
    }

    /// Set the trust state of the device to the given state.
    ///
    /// Note: This should only done in the crypto store where the trust state
    /// can be stored.
    pub(crate) fn set_trust_state(&mut self, state: LocalTrust) {
        self.trust_state = state;
    }

    pub(crate) fn set_cross_signing_trusted(&mut self, trusted: bool) {
        self.cross_signing_trusted = trusted;
    }

    /// Update a device with a new device keys struct.
    ///
    /// Returns `true` if any changes were made to the data.
    pub(crate) fn update_device(
        &mut self,
        device_keys: &DeviceKeys,
    ) -> Result<bool, SignatureError> {
        Self::check_self_signature(device_keys)?;

        if self.user_id() != device_keys.user_id || self.device_id() != device_keys.device_id {
            Err(SignatureError::UserIdMismatch)
        } else if self.ed25519_key() != device_keys.ed25519_key() {
            // Identity keys are immutable, a device that changes them is a
            // different device pretending to be this one.
            warn!(
                user_id = ?self.user_id(),
                device_id = ?self.device_id(),
                old_key = ?self.ed25519_key(),
                new_key = ?device_keys.ed25519_key(),
                "Trying to update a device with a new Ed25519 key, ignoring"
            );
            Ok(false)
        } else if *self.device_keys != *device_keys {
            self.device_keys = device_keys.clone().into();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_self_signature(device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        let signing_key = device_keys.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(
            &device_keys.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_keys.device_id),
            device_keys,
        )
    }

    /// Check that the given one-time key was signed by this device.
    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedKey,
    ) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(
            self.user_id(),
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, self.device_id()),
            one_time_key,
        )
    }

    /// Create [`DeviceData`] from an [`Account`].
    ///
    /// Our own device is put into the store when the machine is created, the
    /// device is always trusted.
    pub fn from_account(account: &Account) -> DeviceData {
        let device_keys = account.device_keys();
        let mut device = DeviceData::try_from(&device_keys)
            .expect("Creating a device from our own account should always succeed");
        device.trust_state = LocalTrust::Verified;

        device
    }
}

impl TryFrom<&DeviceKeys> for DeviceData {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        Self::check_self_signature(device_keys)?;
        Ok(Self::new(device_keys.clone(), LocalTrust::Unset))
    }
}

impl PartialEq for DeviceData {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::{DeviceData, LocalTrust};
    use crate::{error::SignatureError, olm::Account, types::DeviceKeys};

    fn device_keys() -> DeviceKeys {
        let account = Account::new(user_id!("@example:localhost"), device_id!("BNYQQWUMXO"));
        account.device_keys()
    }

    #[test]
    fn test_create_a_device() {
        let device_keys = device_keys();
        let device = DeviceData::try_from(&device_keys).unwrap();

        assert_eq!(device.user_id(), user_id!("@example:localhost"));
        assert_eq!(device.device_id(), device_id!("BNYQQWUMXO"));
        assert_eq!(device.curve25519_key(), device_keys.curve25519_key());
        assert_eq!(device.ed25519_key(), device_keys.ed25519_key());
        assert_eq!(device.local_trust_state(), LocalTrust::Unset);
        assert!(device.supports_olm());
        assert!(!device.is_verified());
    }

    #[test]
    fn test_forged_device_keys_are_rejected() {
        let mut value = serde_json::to_value(device_keys()).unwrap();
        value["keys"]["curve25519:BNYQQWUMXO"] = json!("xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc");
        let forged: DeviceKeys = serde_json::from_value(value).unwrap();

        assert_matches!(DeviceData::try_from(&forged), Err(SignatureError::VerificationError(_)));
    }

    #[test]
    fn test_update_device_keeps_identity_keys() {
        let device_keys = device_keys();
        let mut device = DeviceData::try_from(&device_keys).unwrap();
        device.set_trust_state(LocalTrust::Verified);

        assert!(!device.update_device(&device_keys).unwrap());

        let other = Account::new(user_id!("@example:localhost"), device_id!("BNYQQWUMXO"));
        assert!(!device.update_device(&other.device_keys()).unwrap());
        assert_eq!(device.ed25519_key(), device_keys.ed25519_key());
        assert!(device.is_locally_trusted());
    }

    #[test]
    fn test_trust_flags() {
        let mut device = DeviceData::try_from(&device_keys()).unwrap();

        device.set_cross_signing_trusted(true);
        assert!(device.is_verified());
        assert!(!device.is_locally_trusted());

        device.set_cross_signing_trusted(false);
        device.set_trust_state(LocalTrust::BlackListed);
        assert!(device.is_blacklisted());
        assert!(!device.is_verified());
    }

    #[test]
    fn test_device_serialization_keeps_trust() {
        let mut device = DeviceData::try_from(&device_keys()).unwrap();
        device.set_trust_state(LocalTrust::Verified);
        device.olm_wedging_index = 2;

        let json = serde_json::to_string(&device).unwrap();
        let restored: DeviceData = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, device);
        assert!(restored.is_locally_trusted());
        assert_eq!(restored.olm_wedging_index, 2);
    }
}
