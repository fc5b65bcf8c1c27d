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

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{
    pk_encryption::{Message, MessageDecodeError, PkDecryption},
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    olm::BackedUpRoomKey,
    types::backup::{EncryptedSessionData, MegolmV1AuthData},
};

/// Error type for the decoding of a [`BackupDecryptionKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The public key of a backup couldn't be decoded.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),
}

/// Error type for the decryption of a backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The encrypted session data couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] MessageDecodeError),
    /// The MAC didn't match or the padding of the plaintext was invalid.
    #[error(transparent)]
    Decryption(#[from] vodozemac::pk_encryption::Error),
    /// The decrypted plaintext isn't a valid room key.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private part of a backup key.
///
/// The private part of the key is not used on a regular basis. Rather, it is
/// used only when we need to *recover* the backup.
///
/// It can be derived from a passphrase, using the salt and iteration count
/// the backup publishes in its auth data, or decoded from a base58 recovery
/// key.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BackupDecryptionKey {
    pub(crate) inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key will hold.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    /// Create a new random decryption key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { inner: key }
    }

    /// Create a decryption key from its raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*key) }
    }

    /// Derive the decryption key from a passphrase.
    ///
    /// The key is expanded with PBKDF2-HMAC-SHA-512, `salt` and `rounds` are
    /// published in the auth data of the backup.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice());

        Self { inner: key }
    }

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Decode a recovery key, as shown to users, into a decryption key.
    ///
    /// Whitespace is ignored.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let (prefix, rest) = decoded.split_at(Self::PREFIX.len());
        let (key, parity) = rest.split_at(Self::KEY_SIZE);

        let prefix = [prefix[0], prefix[1]];
        let expected_parity = parity[0];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            let mut inner = Box::new([0u8; Self::KEY_SIZE]);
            inner.copy_from_slice(key);

            Ok(Self { inner })
        }
    }

    /// Encode the key as a base58 recovery key.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// Export the [`BackupDecryptionKey`] as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        vodozemac::base64_encode(self.inner.as_slice())
    }

    fn get_pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.inner))
    }

    /// Get the public part of the key, the key room keys get encrypted with.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.get_pk_decryption().public_key(), None)
    }

    /// Does this key belong to the backup with the given auth data?
    pub fn backup_key_matches(&self, auth_data: &MegolmV1AuthData) -> bool {
        self.get_pk_decryption().public_key() == auth_data.public_key
    }

    /// Decrypt a message that was encrypted to the public part of this key.
    pub fn decrypt_v1(
        &self,
        ephemeral_key: &str,
        mac: &str,
        ciphertext: &str,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let message = Message::from_base64(ciphertext, mac, ephemeral_key)?;
        let plaintext = self.get_pk_decryption().decrypt(&message)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Decrypt the session data of a backed up room key.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let plaintext = self.decrypt_v1(
            &session_data.ephemeral.encode(),
            &session_data.mac.encode(),
            &session_data.ciphertext.encode(),
        )?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackupDecryptionKey {
    /// Show the recovery key in groups of four characters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use super::{BackupDecryptionKey, DecodeError};

    #[test]
    fn test_recovery_key_round_trip() {
        let key = BackupDecryptionKey::new();

        let encoded = key.to_base58();
        let decoded = BackupDecryptionKey::from_base58(&encoded).unwrap();
        assert_eq!(key.inner, decoded.inner);

        // The grouped form users copy around decodes too.
        let displayed = key.to_string();
        assert!(displayed.split(' ').all(|chunk| chunk.len() <= 4));
        let decoded = BackupDecryptionKey::from_base58(&displayed).unwrap();
        assert_eq!(key.inner, decoded.inner);
    }

    #[test]
    fn test_recovery_key_checks() {
        let key = BackupDecryptionKey::from_bytes(&[7u8; 32]);

        let mut bytes = vec![0x8b, 0x01];
        bytes.extend_from_slice(&[7u8; 32]);
        bytes.push(0x8b ^ 0x01);
        assert_eq!(bs58::encode(&bytes).into_string(), key.to_base58());

        let mut wrong_parity = bytes.clone();
        *wrong_parity.last_mut().unwrap() ^= 0xff;
        let encoded = bs58::encode(&wrong_parity).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Parity(..)));

        let mut wrong_prefix = bytes.clone();
        wrong_prefix[1] = 0x02;
        let encoded = bs58::encode(&wrong_prefix).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Prefix(..)));

        let encoded = bs58::encode(&bytes[..20]).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&encoded), Err(DecodeError::Length(35, 20)));

        assert_matches!(BackupDecryptionKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn test_passphrase_derivation() {
        let first = BackupDecryptionKey::from_passphrase("It's a secret to everybody", "salt", 10);
        let second = BackupDecryptionKey::from_passphrase("It's a secret to everybody", "salt", 10);
        let other_salt =
            BackupDecryptionKey::from_passphrase("It's a secret to everybody", "pepper", 10);

        assert_eq!(first.inner, second.inner);
        assert_ne!(first.inner, other_salt.inner);
        assert_eq!(
            first.megolm_v1_public_key().to_base64(),
            second.megolm_v1_public_key().to_base64()
        );
    }

    #[test]
    fn test_debug_hides_the_key() {
        let key = BackupDecryptionKey::from_bytes(&[7u8; 32]);
        let debug = format!("{key:?}");

        assert!(!debug.contains(&key.to_base64()));
        assert!(!debug.contains(&key.to_base58()));
    }
}
