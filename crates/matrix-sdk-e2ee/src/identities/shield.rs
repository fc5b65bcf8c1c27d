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

//! Room level aggregation of user and device trust.

use std::collections::{BTreeMap, BTreeSet};

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};

use super::{DeviceData, UserIdentity};

/// The trust indicator of a room, summarizing the verification state of the
/// members and their devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomShield {
    /// Nobody in the room is verified, or not everyone is.
    Default,
    /// Someone we verified has an unverified device, or someone we verified
    /// in the past isn't verified anymore.
    Warning,
    /// Everyone is verified and so are all of their devices.
    Trusted,
}

/// The trust data the shield computation reads.
pub trait RoomShieldProvider {
    /// The user id of the local user.
    fn own_user_id(&self) -> &UserId;

    /// The cross-signing identity of the given user, if we know it.
    fn user_identity(&self, user_id: &UserId) -> Option<UserIdentity>;

    /// All the known devices of the given user.
    fn user_devices(&self, user_id: &UserId) -> Vec<DeviceData>;
}

/// A [`RoomShieldProvider`] over a snapshot of identities and devices.
#[derive(Clone, Debug)]
pub struct ShieldSnapshot {
    own_user_id: OwnedUserId,
    identities: BTreeMap<OwnedUserId, UserIdentity>,
    devices: BTreeMap<OwnedUserId, Vec<DeviceData>>,
}

impl ShieldSnapshot {
    /// Create an empty snapshot for the given local user.
    pub fn new(own_user_id: OwnedUserId) -> Self {
        Self { own_user_id, identities: BTreeMap::new(), devices: BTreeMap::new() }
    }

    /// Add the identity of a user.
    pub fn add_identity(&mut self, identity: UserIdentity) {
        self.identities.insert(identity.user_id().to_owned(), identity);
    }

    /// Add a device.
    pub fn add_device(&mut self, device: DeviceData) {
        self.devices.entry(device.user_id().to_owned()).or_default().push(device);
    }
}

impl RoomShieldProvider for ShieldSnapshot {
    fn own_user_id(&self) -> &UserId {
        &self.own_user_id
    }

    fn user_identity(&self, user_id: &UserId) -> Option<UserIdentity> {
        self.identities.get(user_id).cloned()
    }

    fn user_devices(&self, user_id: &UserId) -> Vec<DeviceData> {
        self.devices.get(user_id).cloned().unwrap_or_default()
    }
}

/// Compute the shield of a room.
///
/// For direct rooms, and for rooms with at most two members, the local user
/// is left out, the shield only describes the other side. In bigger rooms the
/// local user's identity and devices count like everyone else's.
///
/// # Arguments
///
/// * `members` - The active members of the room, the local user included.
///
/// * `is_direct` - Is the room a direct message room.
///
/// * `provider` - Where the identities and devices of the members come from.
pub fn compute_shield(
    members: &[OwnedUserId],
    is_direct: bool,
    provider: &impl RoomShieldProvider,
) -> RoomShield {
    let own_user_id = provider.own_user_id();
    let members: BTreeSet<&UserId> = members.iter().map(|u| u.as_ref()).collect();

    let to_check: Vec<&UserId> = if is_direct || members.len() <= 2 {
        members.into_iter().filter(|u| *u != own_user_id).collect()
    } else {
        members.into_iter().collect()
    };

    let identities: Vec<Option<UserIdentity>> =
        to_check.iter().map(|u| provider.user_identity(u)).collect();

    if identities.iter().flatten().any(UserIdentity::has_verification_violation) {
        return RoomShield::Warning;
    }

    let trusted_users: Vec<&UserId> = to_check
        .iter()
        .zip(&identities)
        .filter(|(_, identity)| identity.as_ref().is_some_and(UserIdentity::is_verified))
        .map(|(user_id, _)| *user_id)
        .collect();

    if trusted_users.is_empty() {
        return RoomShield::Default;
    }

    let has_insecure_device = trusted_users
        .iter()
        .flat_map(|u| provider.user_devices(u))
        .any(|device| !device.is_verified());

    if has_insecure_device {
        RoomShield::Warning
    } else if trusted_users.len() == to_check.len() {
        RoomShield::Trusted
    } else {
        RoomShield::Default
    }
}
