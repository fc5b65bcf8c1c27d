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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backups;
mod error;
mod file_encryption;
mod gossiping;
mod identities;
mod locks;
mod machine;
pub mod olm;
mod session_manager;
pub mod store;
mod transport;
pub mod types;
mod utilities;

pub use error::{
    EventError, MegolmError, OlmError, SessionCreationError, SignatureError, UtdCause,
};
pub use file_encryption::{
    decrypt_attachment, decrypt_room_key_export, encrypt_room_key_export, AttachmentDecryptor,
    AttachmentEncryptor, DecryptorError, KeyExportError, MediaEncryptionInfo,
    DEFAULT_EXPORT_ROUNDS, MAX_EXPORT_ROUNDS,
};
pub use gossiping::{GossipRequest, KeyForwardDecision};
pub use identities::{
    compute_shield, DeviceData, LocalTrust, RoomShield, RoomShieldProvider, ShieldSnapshot,
    UserIdentity,
};
pub use machine::{
    DecryptedRoomEvent, EncryptionInfo, GlobalSettings, OlmMachine, ProcessedToDeviceEvent,
    VerificationState,
};
pub use olm::{EncryptionSettings, Session};
pub use store::{CryptoStoreError, RoomKeyImportResult};
pub use transport::{Transport, TransportError};
pub use utilities::{Clock, SystemClock};
#[doc(no_inline)]
pub use vodozemac;

/// The version of the matrix-sdk-e2ee crate being used
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate
#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
