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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    store::CryptoStoreError,
    transport::TransportError,
    types::{events::room_key_withheld::WithheldCode, SignedKey},
};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The received room key couldn't be converted into a valid Megolm session.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The session with a device has become corrupted.
    #[error(
        "decryption failed likely because an Olm session from {0} with sender key {1} was wedged"
    )]
    SessionWedged(OwnedUserId, Curve25519PublicKey),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,

    /// The transport failed to deliver a request.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("Can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The message was encrypted at an index older than the first index our
    /// copy of the room key knows about.
    #[error(
        "the message index {message_index} is older than the first known index \
        {first_known_index} of the room key"
    )]
    UnknownMessageIndex {
        /// The first index our copy of the room key can decrypt.
        first_known_index: u32,
        /// The index the message was encrypted at.
        message_index: u32,
    },

    /// A different event of the same timeline was already decrypted at this
    /// message index, the event is a possible replay.
    #[error("the message index {0} was already used by a different event in this timeline")]
    DuplicatedMessageIndex(u32),

    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(vodozemac::megolm::DecryptionError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// There is no outbound group session for the room, or it hasn't been
    /// shared yet.
    #[error("no shared outbound group session exists for the room {0}")]
    MissingOutboundSession(OwnedRoomId),
}

impl From<vodozemac::megolm::DecryptionError> for MegolmError {
    fn from(error: vodozemac::megolm::DecryptionError) -> Self {
        match error {
            vodozemac::megolm::DecryptionError::UnknownMessageIndex(
                first_known_index,
                message_index,
            ) => MegolmError::UnknownMessageIndex { first_known_index, message_index },
            e => MegolmError::Decryption(e),
        }
    }
}

impl MegolmError {
    /// The category of the failure, which decides the placeholder an
    /// undecryptable event gets and whether a retry is worthwhile.
    pub fn utd_cause(&self) -> UtdCause {
        match self {
            MegolmError::MissingRoomKey(None) => UtdCause::UnknownInboundSessionId,
            MegolmError::MissingRoomKey(Some(code)) => UtdCause::KeysWithheld(code.to_owned()),
            MegolmError::UnknownMessageIndex { .. } | MegolmError::DuplicatedMessageIndex(_) => {
                UtdCause::UnknownMessageIndex
            }
            MegolmError::Store(_) => UtdCause::StoreFailure,
            MegolmError::EventError(_)
            | MegolmError::JsonError(_)
            | MegolmError::Decryption(_)
            | MegolmError::MissingOutboundSession(_) => UtdCause::Malformed,
        }
    }
}

/// Why an event could not be decrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UtdCause {
    /// We don't have the room key. A key request is sent out automatically.
    UnknownInboundSessionId,
    /// The sender refused to share the room key with us. Not retried.
    KeysWithheld(WithheldCode),
    /// The message index is unknown to our copy of the key, or the index was
    /// reused by another event. Possibly a replay, not retried.
    UnknownMessageIndex,
    /// The event is malformed or the ciphertext is corrupt.
    Malformed,
    /// Our store failed to load the session.
    StoreFailure,
}

/// Error that occurs when decrypting an event that is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The provided JSON value isn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The ciphertext couldn't be decoded.
    #[error("the ciphertext of the Encrypted message couldn't be decoded")]
    MalformedCiphertext,

    /// The device we're encrypting for, or decrypting from, has no Ed25519
    /// key.
    #[error("the device is missing its Ed25519 signing key")]
    MissingSigningKey,

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The public key that was part of the message doesn't match the key we
    /// have stored.
    #[error(
        "the public key that was part of the message doesn't match the key we \
        have stored, expected {0}, got {1}"
    )]
    MismatchedKeys(Box<Ed25519PublicKey>, Box<Ed25519PublicKey>),

    /// The room ID of the room key doesn't match the room ID of the decrypted
    /// event.
    #[error(
        "the room id of the room key doesn't match the room id of the \
        decrypted event: expected {0}, got {1:?}"
    )]
    MismatchedRoom(OwnedRoomId, Option<OwnedRoomId>),
}

/// Error type describing different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signature from the expected
    /// signer.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The user id of the signed object doesn't match the owner of the
    /// signing key.
    #[error("the signed object belongs to a different user or device")]
    UserIdMismatch,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The signed object couldn't be converted to canonical JSON.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),
}

/// Error that occurs when a room key or a one-time key can't be converted
/// into a valid session.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The signed one-time key is missing.
    #[error(
        "Tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// Failed to verify the one-time key signatures.
    #[error(
        "Failed to verify the signature of a one-time key, key: {one_time_key:?}, \
        signing_key: {signing_key:?}: {error:?}"
    )]
    InvalidSignature {
        /// The one-time key that failed the signature verification.
        one_time_key: Box<SignedKey>,
        /// The key that was used to verify the signature.
        signing_key: Option<Box<Ed25519PublicKey>>,
        /// The exact error describing why the signature verification failed.
        error: Box<SignatureError>,
    },

    /// The user's device is missing a curve25519 key.
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// Error when creating an Olm Session from an incoming Olm message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The room key uses an algorithm we don't support.
    #[error("the room key uses the unsupported algorithm {0}")]
    Algorithm(crate::types::EventEncryptionAlgorithm),
}
