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

use ruma::{CanonicalJsonValue, DeviceKeyId, UserId};
use serde::Serialize;
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Convert a JSON object into the canonical form that gets signed, with the
/// `signatures` and `unsigned` fields removed.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;
    Ok(canonical_json.to_string())
}

pub(crate) trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object must have a signatures key associated with an object of the
    /// form `user_id: {key_id: signature}`.
    ///
    /// Returns Ok if the signature was successfully verified, otherwise an
    /// SignatureError.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user who signed the JSON object.
    ///
    /// * `key_id` - The id of the key that signed the JSON object.
    ///
    /// * `signed_object` - The object that should be verified.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signed_object: &impl Serialize,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signed_object: &impl Serialize,
    ) -> Result<(), SignatureError> {
        let value = serde_json::to_value(signed_object).map_err(|_| SignatureError::NotAnObject)?;

        let signature = value
            .get("signatures")
            .and_then(|s| s.get(user_id.as_str()))
            .and_then(|s| s.get(key_id.as_str()))
            .and_then(Value::as_str)
            .ok_or(SignatureError::NoSignatureFound)?;
        let signature = Ed25519Signature::from_base64(signature)
            .map_err(|_| SignatureError::NoSignatureFound)?;

        let canonical_json = to_signable_json(value)?;

        Ok(self.verify(canonical_json.as_bytes(), &signature)?)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::Ed25519PublicKey;

    use super::VerifyJson;

    #[test]
    fn test_signature_verification() {
        let device_keys = json!({
            "device_id": "GBEWHQOYGS",
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "keys": {
                "curve25519:GBEWHQOYGS": "F8QhZ0Z1rjtWrQOblMDgZtEX5x1UrG7sZ2Kk3xliNAU",
                "ed25519:GBEWHQOYGS": "n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:GBEWHQOYGS": "OlF2REsqjYdAfr04ONx8VS/5cB7KjrWYRlLF4eUm2foAiQL/RAfsjsa2JXZeoOHh6vEualZHbWlod49OewVqBg"
                }
            },
            "unsigned": {
                "device_display_name": "Weechat-Matrix-rs"
            },
            "user_id": "@example:localhost"
        });

        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS"));

        signing_key
            .verify_json(user_id!("@example:localhost"), &key_id, &device_keys)
            .expect("Can't verify device keys");

        let mut tampered = device_keys;
        tampered["device_id"] = "ANOTHERONE".into();
        signing_key
            .verify_json(user_id!("@example:localhost"), &key_id, &tampered)
            .expect_err("A modified object shouldn't verify");
    }
}
