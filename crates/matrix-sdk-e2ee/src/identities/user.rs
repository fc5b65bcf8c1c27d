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

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::info;
use vodozemac::Ed25519PublicKey;

use crate::types::{deserialize_ed25519_key, serialize_ed25519_key};

/// The cross-signing identity of a user, reduced to what trust decisions
/// need: the user's master key and whether we verified it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    user_id: OwnedUserId,
    #[serde(deserialize_with = "deserialize_ed25519_key", serialize_with = "serialize_ed25519_key")]
    master_key: Ed25519PublicKey,
    verified: bool,
    #[serde(default)]
    was_previously_verified: bool,
}

impl UserIdentity {
    /// Create a new, unverified, identity for the given user.
    pub fn new(user_id: OwnedUserId, master_key: Ed25519PublicKey) -> Self {
        Self { user_id, master_key, verified: false, was_previously_verified: false }
    }

    /// Get the user id of this identity.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the public master key of the identity.
    pub fn master_key(&self) -> Ed25519PublicKey {
        self.master_key
    }

    /// Is the identity currently verified.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Was the identity verified at some point in time, even if it isn't any
    /// more.
    pub fn was_previously_verified(&self) -> bool {
        self.was_previously_verified
    }

    /// An identity that we verified in the past but that isn't verified
    /// anymore, most likely because the user reset their cross-signing keys.
    pub fn has_verification_violation(&self) -> bool {
        self.was_previously_verified && !self.verified
    }

    /// Mark the identity as verified.
    pub fn mark_as_verified(&mut self) {
        self.verified = true;
        self.was_previously_verified = true;
    }

    /// Forget that the identity was verified in the past, resolving a
    /// verification violation.
    pub fn withdraw_verification(&mut self) {
        self.was_previously_verified = false;
    }

    /// Update the identity with a new master key.
    ///
    /// A changed master key resets the verification state, but not the
    /// memory of a previous verification.
    ///
    /// Returns `true` if the master key changed.
    pub(crate) fn update(&mut self, master_key: Ed25519PublicKey) -> bool {
        if self.master_key != master_key {
            info!(
                user_id = ?self.user_id,
                was_verified = self.verified,
                "The master key of a user identity changed"
            );

            self.master_key = master_key;
            self.verified = false;

            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::user_id;
    use vodozemac::{Ed25519PublicKey, Ed25519SecretKey};

    use super::UserIdentity;

    fn key() -> Ed25519PublicKey {
        Ed25519SecretKey::new().public_key()
    }

    #[test]
    fn test_master_key_change_is_a_violation() {
        let mut identity = UserIdentity::new(user_id!("@bob:example.org").to_owned(), key());
        assert!(!identity.has_verification_violation());

        identity.mark_as_verified();
        assert!(identity.is_verified());
        assert!(!identity.has_verification_violation());

        assert!(identity.update(key()));
        assert!(!identity.is_verified());
        assert!(identity.was_previously_verified());
        assert!(identity.has_verification_violation());

        identity.withdraw_verification();
        assert!(!identity.has_verification_violation());
    }

    #[test]
    fn test_same_master_key_keeps_verification() {
        let master_key = key();
        let mut identity = UserIdentity::new(user_id!("@bob:example.org").to_owned(), master_key);
        identity.mark_as_verified();

        assert!(!identity.update(master_key));
        assert!(identity.is_verified());
    }
}
