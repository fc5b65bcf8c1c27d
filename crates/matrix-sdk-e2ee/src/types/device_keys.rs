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

use std::collections::BTreeMap;

use ruma::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::{EventEncryptionAlgorithm, Signatures};

/// Identity keys for a device, as published to the server and returned by a
/// key query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    pub user_id: OwnedUserId,
    /// The ID of the device these keys belong to.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Public identity keys.
    #[serde(deserialize_with = "deserialize_keys", serialize_with = "serialize_keys")]
    pub keys: BTreeMap<OwnedDeviceKeyId, DeviceKey>,
    /// Signatures for the device key object.
    pub signatures: Signatures,
    /// Additional data added to the device key information by intermediate
    /// servers, not covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl DeviceKeys {
    /// Creates a new `DeviceKeys` from the given user id, device id,
    /// algorithms, keys and signatures.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<OwnedDeviceKeyId, DeviceKey>,
        signatures: Signatures,
    ) -> Self {
        Self {
            user_id,
            device_id,
            algorithms,
            keys,
            signatures,
            unsigned: Default::default(),
            other: BTreeMap::new(),
        }
    }

    /// Get the key of the given algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&DeviceKey> {
        self.keys.get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Curve25519).and_then(|k| {
            if let DeviceKey::Curve25519(k) = k {
                Some(*k)
            } else {
                None
            }
        })
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Ed25519).and_then(|k| {
            if let DeviceKey::Ed25519(k) = k {
                Some(*k)
            } else {
                None
            }
        })
    }
}

/// Additional data added to device key information by intermediate servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name which the user set on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl UnsignedDeviceInfo {
    /// Checks whether all fields are empty / `None`.
    pub fn is_empty(&self) -> bool {
        self.device_display_name.is_none() && self.other.is_empty()
    }
}

/// An enum over the different key types a device can have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceKey {
    /// The curve25519 device key.
    Curve25519(Curve25519PublicKey),
    /// The ed25519 device key.
    Ed25519(Ed25519PublicKey),
    /// An unknown device key.
    Unknown(String),
}

impl DeviceKey {
    /// Convert the `DeviceKey` into a base64 encoded string.
    pub fn to_base64(&self) -> String {
        match self {
            DeviceKey::Curve25519(k) => k.to_base64(),
            DeviceKey::Ed25519(k) => k.to_base64(),
            DeviceKey::Unknown(k) => k.to_owned(),
        }
    }
}

impl From<Curve25519PublicKey> for DeviceKey {
    fn from(val: Curve25519PublicKey) -> Self {
        DeviceKey::Curve25519(val)
    }
}

impl From<Ed25519PublicKey> for DeviceKey {
    fn from(val: Ed25519PublicKey) -> Self {
        DeviceKey::Ed25519(val)
    }
}

fn deserialize_keys<'de, D>(de: D) -> Result<BTreeMap<OwnedDeviceKeyId, DeviceKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let keys: BTreeMap<OwnedDeviceKeyId, String> = Deserialize::deserialize(de)?;

    keys.into_iter()
        .map(|(key_id, key)| {
            let key = match key_id.algorithm() {
                DeviceKeyAlgorithm::Ed25519 => Ed25519PublicKey::from_base64(&key)
                    .map(DeviceKey::Ed25519)
                    .map_err(serde::de::Error::custom)?,
                DeviceKeyAlgorithm::Curve25519 => Curve25519PublicKey::from_base64(&key)
                    .map(DeviceKey::Curve25519)
                    .map_err(serde::de::Error::custom)?,
                _ => DeviceKey::Unknown(key),
            };

            Ok((key_id, key))
        })
        .collect()
}

fn serialize_keys<S>(keys: &BTreeMap<OwnedDeviceKeyId, DeviceKey>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let keys: BTreeMap<&OwnedDeviceKeyId, String> =
        keys.iter().map(|(k, v)| (k, v.to_base64())).collect();

    keys.serialize(s)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::DeviceKeys;

    #[test]
    fn test_device_keys_serialization_cycle() {
        let json = json!({
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "device_id": "BNYQQWUMXO",
            "user_id": "@example:localhost",
            "keys": {
                "curve25519:BNYQQWUMXO": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
                "ed25519:BNYQQWUMXO": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:BNYQQWUMXO": "kTwMrbsLJJM/uFGOj/oqlCaRuw7i9p/6eGrTlXjo8UJMCFAetoyWzoMcF35vSe4S6FTx8RJmqX6rM7ep53MHDQ"
                }
            },
            "unsigned": {
                "device_display_name": "Alice's mobile phone",
            },
            "m.custom": "something",
        });

        let device_keys: DeviceKeys = serde_json::from_value(json.clone()).unwrap();

        assert_eq!(
            device_keys.curve25519_key(),
            Some(
                Curve25519PublicKey::from_base64("xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc")
                    .unwrap()
            )
        );
        assert_eq!(
            device_keys.unsigned.device_display_name.as_deref(),
            Some("Alice's mobile phone")
        );

        let serialized = serde_json::to_value(device_keys).unwrap();
        similar_asserts::assert_eq!(json, serialized);
    }
}
