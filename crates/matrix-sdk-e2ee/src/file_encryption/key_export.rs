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

use std::io::{Cursor, Read, Seek, SeekFrom};

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use byteorder::{BigEndian, ReadBytesExt};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use serde_json::Error as SerdeError;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode};
use zeroize::Zeroize;

use crate::{olm::ExportedRoomKey, store::CryptoStoreError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + 4;
const LINE_LENGTH: usize = 96;

/// The number of PBKDF2 rounds a key export uses if the caller doesn't pick
/// one.
pub const DEFAULT_EXPORT_ROUNDS: u32 = 500_000;

/// The most PBKDF2 rounds an export may ask for.
pub const MAX_EXPORT_ROUNDS: u32 = 10_000_000;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

/// Error representing a failure during key export or import.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The key export doesn't contain valid headers.
    #[error("Invalid or missing key export headers.")]
    InvalidHeaders,
    /// The key export has been encrypted with an unsupported version.
    #[error("The key export has been encrypted with an unsupported version.")]
    UnsupportedVersion,
    /// The MAC of the encrypted payload is invalid.
    #[error("The MAC of the encrypted payload is invalid.")]
    InvalidMac,
    /// The payload is too short to hold the header and the MAC.
    #[error("The key export is truncated.")]
    TooShort,
    /// The number of key derivation rounds is zero or above
    /// [`MAX_EXPORT_ROUNDS`].
    #[error("The key export uses an invalid number of rounds: {0}")]
    InvalidRounds(u32),
    /// Exports need a passphrase to derive the keys from.
    #[error("The passphrase can't be empty.")]
    EmptyPassphrase,
    /// The decrypted key export isn't valid JSON.
    #[error(transparent)]
    Json(#[from] SerdeError),
    /// The key export body isn't valid base64.
    #[error(transparent)]
    Decode(#[from] vodozemac::Base64DecodeError),
    /// The key export couldn't be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The room keys couldn't be loaded from, or saved to, the store.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Try to decrypt a reader into a list of exported room keys.
///
/// # Arguments
///
/// * `passphrase` - The passphrase that was used to encrypt the exported keys.
///
/// # Examples
/// ```no_run
/// # use std::io::Cursor;
/// # use matrix_sdk_e2ee::{OlmMachine, decrypt_room_key_export};
/// # async {
/// # let machine: OlmMachine = unimplemented!();
/// # let export = Cursor::new("".to_owned());
/// let exported_keys = decrypt_room_key_export(export, "1234").unwrap();
/// machine.import_exported_room_keys(exported_keys).await.unwrap();
/// # };
/// ```
pub fn decrypt_room_key_export(
    mut input: impl Read,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let mut x: String = String::new();

    input.read_to_string(&mut x)?;

    if !(x.trim_start().starts_with(HEADER) && x.trim_end().ends_with(FOOTER)) {
        return Err(KeyExportError::InvalidHeaders);
    }

    let payload: String = x
        .lines()
        .map(str::trim)
        .filter(|l| !(l.starts_with(HEADER) || l.starts_with(FOOTER)))
        .collect();

    let mut decrypted = decrypt_helper(&payload, passphrase)?;
    let keys = serde_json::from_slice(&decrypted);
    decrypted.zeroize();

    Ok(keys?)
}

/// Encrypt the list of exported room keys using the given passphrase.
///
/// # Arguments
///
/// * `keys` - A list of sessions that should be encrypted.
///
/// * `passphrase` - The passphrase that will be used to encrypt the exported
///   room keys.
///
/// * `rounds` - The number of rounds that should be used for the key
///   derivation when the passphrase gets turned into an AES key. More rounds
///   are increasingly computationally intensive and as such help against
///   brute-force attacks. Should be at least `10_000`, while values in the
///   `100_000` ranges should be preferred, [`DEFAULT_EXPORT_ROUNDS`] is a good
///   choice. At most [`MAX_EXPORT_ROUNDS`] are accepted.
///
/// # Panics
///
/// This method will panic if it can't get enough randomness from the OS to
/// encrypt the exported keys securely.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    check_rounds(rounds)?;

    let mut plaintext = serde_json::to_vec(keys)?;
    let ciphertext = encrypt_helper(&plaintext, passphrase, rounds);
    plaintext.zeroize();

    let ciphertext = ciphertext
        .as_bytes()
        .chunks(LINE_LENGTH)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("\n");

    Ok([HEADER.to_owned(), ciphertext, FOOTER.to_owned()].join("\n"))
}

fn derive_keys(passphrase: &str, salt: &[u8], rounds: u32) -> [u8; KEY_SIZE * 2] {
    let mut derived_keys = [0u8; KEY_SIZE * 2];
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, &mut derived_keys);

    derived_keys
}

fn encrypt_helper(plaintext: &[u8], passphrase: &str, rounds: u32) -> String {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    let mut rng = thread_rng();

    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    // Bit 63 is cleared so the 64-bit counter half of the IV can't overflow
    // into the nonce on implementations with a 64-bit counter.
    let mut iv = u128::from_be_bytes(iv);
    iv &= !(1 << 63);
    let iv = iv.to_be_bytes();

    let mut derived_keys = derive_keys(passphrase, &salt, rounds);
    let (key, hmac_key) = derived_keys.split_at(KEY_SIZE);

    let mut payload: Vec<u8> = Vec::with_capacity(HEADER_SIZE + plaintext.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&rounds.to_be_bytes());

    let ciphertext_start = payload.len();
    payload.extend_from_slice(plaintext);

    let mut aes = Aes256Ctr::new(key.into(), &iv.into());
    aes.apply_keystream(&mut payload[ciphertext_start..]);

    let mut hmac = Hmac::<Sha256>::new_from_slice(hmac_key)
        .expect("HMAC-SHA-256 accepts keys of any length");
    hmac.update(&payload);
    let mac = hmac.finalize();

    derived_keys.zeroize();

    payload.extend(mac.into_bytes());

    base64_encode(payload)
}

fn check_rounds(rounds: u32) -> Result<(), KeyExportError> {
    if rounds == 0 || rounds > MAX_EXPORT_ROUNDS {
        Err(KeyExportError::InvalidRounds(rounds))
    } else {
        Ok(())
    }
}

fn decrypt_helper(ciphertext: &str, passphrase: &str) -> Result<Vec<u8>, KeyExportError> {
    let decoded = base64_decode(ciphertext)?;

    if decoded.len() < HEADER_SIZE + MAC_SIZE {
        return Err(KeyExportError::TooShort);
    }

    let mut decoded = Cursor::new(decoded);

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut mac = [0u8; MAC_SIZE];

    let version = decoded.read_u8()?;
    decoded.read_exact(&mut salt)?;
    decoded.read_exact(&mut iv)?;

    let rounds = decoded.read_u32::<BigEndian>()?;
    let ciphertext_start = decoded.position() as usize;

    decoded.seek(SeekFrom::End(-(MAC_SIZE as i64)))?;
    let ciphertext_end = decoded.position() as usize;

    decoded.read_exact(&mut mac)?;

    let mut decoded = decoded.into_inner();

    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion);
    }

    check_rounds(rounds)?;

    let mut derived_keys = derive_keys(passphrase, &salt, rounds);
    let (key, hmac_key) = derived_keys.split_at(KEY_SIZE);

    let mut hmac = Hmac::<Sha256>::new_from_slice(hmac_key)
        .expect("HMAC-SHA-256 accepts keys of any length");
    hmac.update(&decoded[0..ciphertext_end]);

    if hmac.verify_slice(&mac).is_err() {
        derived_keys.zeroize();
        return Err(KeyExportError::InvalidMac);
    }

    let mut aes = Aes256Ctr::new(key.into(), &iv.into());
    derived_keys.zeroize();

    let plaintext = &mut decoded[ciphertext_start..ciphertext_end];
    aes.apply_keystream(plaintext);

    Ok(plaintext.to_vec())
}
