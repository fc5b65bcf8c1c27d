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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports two main types of identities, a per-device identity and a
//! per-user identity.
//!
//! ## Device
//!
//! Every E2EE capable Matrix client will create a new Olm account and upload
//! the public keys of the Olm account to the server. This is represented as a
//! [`DeviceData`]. Devices carry a local trust flag and a cross-signing trust
//! flag, either one makes the device verified.
//!
//! ## User
//!
//! Cross-signing introduces a per-user identity, the [`UserIdentity`]. We
//! remember if we verified a user at some point, an identity that loses its
//! verification is a verification violation.
//!
//! ## Shield
//!
//! [`compute_shield`] aggregates both kinds of trust over the members of a
//! room.

mod device;
mod shield;
mod user;

pub use device::{DeviceData, LocalTrust};
pub use shield::{compute_shield, RoomShield, RoomShieldProvider, ShieldSnapshot};
pub use user::UserIdentity;
