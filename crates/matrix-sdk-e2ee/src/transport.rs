// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! The seam between the crypto core and the network.
//!
//! The crate never opens a connection itself, every request it needs to make
//! goes through a [`Transport`] the embedding application provides.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    backup::{BackupVersion, RoomKeyBackup},
    requests::{KeysBackupRequest, KeysClaimRequest, KeysClaimResponse, ToDeviceRequest},
};

/// Error type for the requests a [`Transport`] performs.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with an error.
    #[error("the server rejected the request: {0}")]
    Server(String),

    /// The request didn't reach the server, or the response didn't reach us.
    #[error("the request couldn't be delivered: {0}")]
    Network(String),

    /// The request was cancelled before a response was received.
    ///
    /// Nothing the request would have changed locally is applied.
    #[error("the request was cancelled")]
    Cancelled,
}

/// The requests the crypto core needs the homeserver for.
///
/// A method returns successfully only once the server accepted the request,
/// state that depends on the request being delivered, for example which
/// devices received a room key, is only updated after that.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Send the given to-device messages.
    async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), TransportError>;

    /// Claim one-time keys for the given devices, to create new Olm sessions
    /// with them.
    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Upload room keys to the server-side key backup.
    async fn upload_room_keys(&self, request: &KeysBackupRequest) -> Result<(), TransportError>;

    /// Get the given backup version, or the current one if `version` is
    /// `None`.
    ///
    /// Returns `None` if no such backup exists.
    async fn get_backup_version(
        &self,
        version: Option<&str>,
    ) -> Result<Option<BackupVersion>, TransportError>;

    /// Download every room key of the given backup version.
    async fn download_room_keys(&self, version: &str) -> Result<RoomKeyBackup, TransportError>;
}
