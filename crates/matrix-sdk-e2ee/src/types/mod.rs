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

//! Module containing customized types modeling Matrix keys and events.
//!
//! The types differ from the Ruma types of the same name in that they
//! deserialize directly into vodozemac curve25519 and ed25519 keys, and that
//! they support lossless serialization cycles in a canonical JSON supported
//! way, meaning the white-space and field order won't be preserved but the
//! data will.

pub mod backup;
mod device_keys;
pub mod events;
mod one_time_keys;
pub mod requests;

use std::collections::BTreeMap;

pub use device_keys::*;
pub use one_time_keys::*;
pub use ruma::EventEncryptionAlgorithm;
use ruma::{DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceKeyId, OwnedUserId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

/// An enum over all the signature types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    /// A Ed25519 digital signature.
    Ed25519(Ed25519Signature),
    /// An unknown digital signature as a base64 encoded string.
    Other(String),
    /// An invalid signature that could not be decoded, left unmodified as a
    /// string.
    Invalid(String),
}

impl Signature {
    /// Get the Ed25519 signature, if this is one.
    pub fn ed25519(&self) -> Option<Ed25519Signature> {
        if let Self::Ed25519(signature) = &self {
            Some(*signature)
        } else {
            None
        }
    }

    /// Convert the signature to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        match self {
            Signature::Ed25519(s) => s.to_base64(),
            Signature::Other(s) | Signature::Invalid(s) => s.to_owned(),
        }
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self::Ed25519(signature)
    }
}

/// Signatures for a signed object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, Signature>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the given signature from the given signer and the given key_id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: OwnedDeviceKeyId,
        signature: Ed25519Signature,
    ) -> Option<Signature> {
        self.0.entry(signer).or_default().insert(key_id, signature.into())
    }

    /// Try to find an Ed25519 signature from the given signer with the given
    /// key id.
    pub fn get_signature(&self, signer: &UserId, key_id: &DeviceKeyId) -> Option<Ed25519Signature> {
        self.get(signer)?.get(key_id)?.ed25519()
    }

    /// Get the map of signatures that belong to the given user.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<OwnedDeviceKeyId, Signature>> {
        self.0.get(signer)
    }

    /// Do we hold any signatures or is our collection completely empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How many signatures do we currently hold.
    pub fn signature_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }
}

impl<'de> Deserialize<'de> for Signatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>> =
            Deserialize::deserialize(deserializer)?;

        let map = map
            .into_iter()
            .map(|(user, signatures)| {
                let signatures = signatures
                    .into_iter()
                    .map(|(key_id, s)| {
                        let signature = match key_id.algorithm() {
                            DeviceKeyAlgorithm::Ed25519 => Ed25519Signature::from_base64(&s)
                                .map(Signature::from)
                                .unwrap_or(Signature::Invalid(s)),
                            _ => Signature::Other(s),
                        };

                        (key_id, signature)
                    })
                    .collect();

                (user, signatures)
            })
            .collect();

        Ok(Signatures(map))
    }
}

impl Serialize for Signatures {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let signatures: BTreeMap<&OwnedUserId, BTreeMap<&OwnedDeviceKeyId, String>> = self
            .0
            .iter()
            .map(|(u, m)| (u, m.iter().map(|(d, s)| (d, s.to_base64())).collect()))
            .collect();

        Serialize::serialize(&signatures, serializer)
    }
}

/// The Ed25519 key a sender claims to own, as carried in room keys and key
/// exports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderClaimedKeys {
    /// The claimed Ed25519 fingerprint key.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

// Vodozemac serializes curve keys directly as a byteslice, while Matrix likes
// to base64 encode all byte slices.
//
// These ensure that we serialize/deserialize in a Matrix compatible way.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_curve_key_vec<'de, D>(
    de: D,
) -> Result<Vec<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let keys: Vec<String> = Deserialize::deserialize(de)?;

    keys.iter()
        .map(|k| Curve25519PublicKey::from_base64(k).map_err(serde::de::Error::custom))
        .collect()
}

pub(crate) fn serialize_curve_key_vec<S>(
    keys: &[Curve25519PublicKey],
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let keys: Vec<String> = keys.iter().map(Curve25519PublicKey::to_base64).collect();
    keys.serialize(s)
}

pub(crate) fn deserialize_optional_curve_key<'de, D>(
    de: D,
) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;

    key.map(|k| Curve25519PublicKey::from_base64(&k).map_err(serde::de::Error::custom))
        .transpose()
}

pub(crate) fn serialize_optional_curve_key<S>(
    key: &Option<Curve25519PublicKey>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    key.map(|k| k.to_base64()).serialize(s)
}

pub(crate) fn deserialize_ed25519_key<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_ed25519_key<S>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}
