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

use std::{
    collections::BTreeMap,
    io::{Cursor, Error as IoError, ErrorKind, Read},
};

use aes::{
    cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher},
    Aes256,
};
use rand::{thread_rng, RngCore};
use ruma::{
    events::room::{JsonWebKey, JsonWebKeyInit},
    serde::Base64,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

const IV_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const VERSION: &str = "v2";

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A wrapper that transparently decrypts anything that implements `Read` as a
/// Matrix attachment.
///
/// The whole ciphertext is read and its hash checked before the first byte of
/// plaintext is handed out, a reader that fails the check never produces any
/// plaintext.
pub struct AttachmentDecryptor<'a, R: Read> {
    inner: &'a mut R,
    expected_hash: Vec<u8>,
    aes: Aes256Ctr,
    plaintext: Option<Cursor<Vec<u8>>>,
}

#[cfg(not(tarpaulin_include))]
impl<'a, R: 'a + Read + std::fmt::Debug> std::fmt::Debug for AttachmentDecryptor<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentDecryptor")
            .field("inner", &self.inner)
            .field("expected_hash", &self.expected_hash)
            .finish_non_exhaustive()
    }
}

impl<R: Read> AttachmentDecryptor<'_, R> {
    fn verify_and_decrypt(&mut self) -> std::io::Result<Cursor<Vec<u8>>> {
        let mut data = Vec::new();
        self.inner.read_to_end(&mut data)?;

        let hash = Sha256::digest(&data);

        if !bool::from(hash.as_slice().ct_eq(&self.expected_hash)) {
            return Err(IoError::new(ErrorKind::InvalidData, "Hash mismatch while decrypting"));
        }

        self.aes.apply_keystream(&mut data);

        Ok(Cursor::new(data))
    }
}

impl<'a, R: Read> Read for AttachmentDecryptor<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.plaintext.is_none() {
            self.plaintext = Some(self.verify_and_decrypt()?);
        }

        match &mut self.plaintext {
            Some(plaintext) => plaintext.read(buf),
            None => Ok(0),
        }
    }
}

/// Error type for attachment decryption.
#[derive(Error, Debug)]
pub enum DecryptorError {
    /// Some data in the encrypted attachment couldn't be decoded, this may be
    /// a hash, the secret key, or the initialization vector.
    #[error(transparent)]
    Decode(#[from] vodozemac::Base64DecodeError),
    /// A hash is missing from the encryption info.
    #[error("The encryption info is missing a hash")]
    MissingHash,
    /// The supplied key or IV has an invalid length.
    #[error("The supplied key or IV has an invalid length.")]
    KeyNonceLength,
    /// The supplied data was encrypted with an unknown version of the
    /// attachment encryption format.
    #[error("Unknown version for the encrypted attachment.")]
    UnknownVersion,
    /// The ciphertext doesn't match the hash of the encryption info.
    #[error(transparent)]
    Io(#[from] IoError),
}

impl<'a, R: Read + 'a> AttachmentDecryptor<'a, R> {
    /// Wrap the given reader decrypting all the data we read from it.
    ///
    /// # Arguments
    ///
    /// * `reader` - The `Reader` that should be wrapped and decrypted.
    ///
    /// * `info` - The encryption info that is necessary to decrypt data from
    ///   the reader.
    ///
    /// # Examples
    /// ```
    /// # use std::io::{Cursor, Read};
    /// # use matrix_sdk_e2ee::{AttachmentEncryptor, AttachmentDecryptor};
    /// let data = "Hello world".to_owned();
    /// let mut cursor = Cursor::new(data.clone());
    ///
    /// let mut encryptor = AttachmentEncryptor::new(&mut cursor);
    ///
    /// let mut encrypted = Vec::new();
    /// encryptor.read_to_end(&mut encrypted).unwrap();
    /// let info = encryptor.finish();
    ///
    /// let mut cursor = Cursor::new(encrypted);
    /// let mut decryptor = AttachmentDecryptor::new(&mut cursor, info).unwrap();
    /// let mut decrypted_data = Vec::new();
    /// decryptor.read_to_end(&mut decrypted_data).unwrap();
    ///
    /// let decrypted = String::from_utf8(decrypted_data).unwrap();
    /// # assert_eq!(decrypted, data);
    /// ```
    pub fn new(
        input: &'a mut R,
        info: MediaEncryptionInfo,
    ) -> Result<AttachmentDecryptor<'a, R>, DecryptorError> {
        if info.version != VERSION {
            return Err(DecryptorError::UnknownVersion);
        }

        let hash =
            info.hashes.get("sha256").ok_or(DecryptorError::MissingHash)?.as_bytes().to_owned();
        let mut key = info.key.k.into_inner();
        let iv = info.iv.into_inner();

        if key.len() != KEY_SIZE || iv.len() != IV_SIZE {
            key.zeroize();
            return Err(DecryptorError::KeyNonceLength);
        }

        let key_array = GenericArray::from_slice(&key);
        let iv = GenericArray::from_slice(&iv);

        let aes = Aes256Ctr::new(key_array, iv);
        key.zeroize();

        Ok(AttachmentDecryptor { inner: input, expected_hash: hash, aes, plaintext: None })
    }
}

/// Decrypt an attachment that was already fetched in full.
pub fn decrypt_attachment(
    ciphertext: &[u8],
    info: MediaEncryptionInfo,
) -> Result<Vec<u8>, DecryptorError> {
    let mut cursor = Cursor::new(ciphertext);
    let mut decryptor = AttachmentDecryptor::new(&mut cursor, info)?;

    let mut plaintext = Vec::new();
    decryptor.read_to_end(&mut plaintext)?;

    Ok(plaintext)
}

/// A wrapper that transparently encrypts anything that implements `Read`.
pub struct AttachmentEncryptor<'a, R: Read + ?Sized> {
    inner: &'a mut R,
    web_key: JsonWebKey,
    iv: Base64,
    hashes: BTreeMap<String, Base64>,
    aes: Aes256Ctr,
    sha: Sha256,
}

#[cfg(not(tarpaulin_include))]
impl<'a, R: 'a + Read + std::fmt::Debug + ?Sized> std::fmt::Debug for AttachmentEncryptor<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentEncryptor")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<'a, R: Read + ?Sized + 'a> Read for AttachmentEncryptor<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read_bytes = self.inner.read(buf)?;

        self.aes.apply_keystream(&mut buf[0..read_bytes]);
        self.sha.update(&buf[0..read_bytes]);

        Ok(read_bytes)
    }
}

impl<'a, R: Read + ?Sized + 'a> AttachmentEncryptor<'a, R> {
    /// Wrap the given reader encrypting all the data we read from it.
    ///
    /// After all the reads are done, and all the data is encrypted that we wish
    /// to encrypt a call to [`finish()`](#method.finish) is necessary to get
    /// the decryption key for the data.
    ///
    /// # Arguments
    ///
    /// * `reader` - The `Reader` that should be wrapped and encrypted.
    ///
    /// # Panics
    ///
    /// Panics if we can't generate enough random data to create a fresh
    /// encryption key.
    pub fn new(reader: &'a mut R) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];

        let mut rng = thread_rng();

        rng.fill_bytes(&mut key);
        // Only the first 8 bytes are random, the rest is the zero initialized
        // counter.
        rng.fill_bytes(&mut iv[0..8]);

        let web_key = JsonWebKey::from(JsonWebKeyInit {
            kty: "oct".to_owned(),
            key_ops: vec!["encrypt".to_owned(), "decrypt".to_owned()],
            alg: "A256CTR".to_owned(),
            k: Base64::new(key.to_vec()),
            ext: true,
        });
        let encoded_iv = Base64::new(iv.to_vec());

        let aes = Aes256Ctr::new(&key.into(), &iv.into());
        key.zeroize();

        AttachmentEncryptor {
            inner: reader,
            iv: encoded_iv,
            web_key,
            hashes: BTreeMap::new(),
            aes,
            sha: Sha256::default(),
        }
    }

    /// Consume the encryptor and get the encryption key.
    pub fn finish(mut self) -> MediaEncryptionInfo {
        let hash = self.sha.finalize();
        self.hashes
            .entry("sha256".to_owned())
            .or_insert_with(|| Base64::new(hash.as_slice().to_owned()));

        MediaEncryptionInfo {
            version: VERSION.to_owned(),
            hashes: self.hashes,
            iv: self.iv,
            key: self.web_key,
        }
    }
}

/// Struct holding all the information that is needed to decrypt an encrypted
/// file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaEncryptionInfo {
    /// The version of the encryption scheme.
    #[serde(rename = "v")]
    pub version: String,
    /// The web key that was used to encrypt the file.
    pub key: JsonWebKey,
    /// The initialization vector that was used to encrypt the file.
    pub iv: Base64,
    /// The hashes that can be used to check the validity of the file.
    pub hashes: BTreeMap<String, Base64>,
}
