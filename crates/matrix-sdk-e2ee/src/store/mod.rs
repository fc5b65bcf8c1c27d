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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`]
//!
//! An in-memory only store is provided as well as an SQLite based one,
//! depending on your needs and targets a custom store may be implemented, e.g.
//! for `wasm-unknown-unknown` an indexeddb store would be needed
//!
//! Every write goes through [`Store::save_changes`], which holds the single
//! writer lock of the store for the duration of the write.
//!
//! [`OlmMachine`]: crate::OlmMachine

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    ops::Deref,
    sync::Arc,
};

use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use vodozemac::{megolm::SessionOrdering, Curve25519PublicKey};

use crate::{
    backups::BackupDecryptionKey,
    gossiping::GossipRequest,
    identities::{DeviceData, UserIdentity},
    olm::{
        Account, ExportedRoomKey, InboundGroupSession, OutboundGroupSession, PickledAccount,
        Session, StaticAccountData,
    },
    types::events::room_key_withheld::RoomKeyWithheldContent,
    utilities::Clock,
};

mod caches;
mod error;
mod memorystore;
mod traits;

pub(crate) use caches::{GroupSessionStore, SessionStore};
pub use error::{CryptoStoreError, Result};
pub use memorystore::MemoryStore;
pub use traits::{CryptoStore, IntoCryptoStore};

/// Aggregated changes to be saved in the database.
///
/// This is an update for the store, everything that is set here is written
/// atomically by [`CryptoStore::save_changes`].
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct Changes {
    pub account: Option<PickledAccount>,
    pub sessions: Vec<Session>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    pub key_requests: Vec<GossipRequest>,
    pub identities: IdentityChanges,
    pub devices: DeviceChanges,
    /// Stores when a `m.room_key.withheld` is received
    pub withheld_session_info: BTreeMap<OwnedRoomId, BTreeMap<String, RoomKeyWithheldContent>>,
    pub backup_decryption_key: Option<BackupDecryptionKey>,
    pub backup_version: Option<String>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.key_requests.is_empty()
            && self.identities.is_empty()
            && self.devices.is_empty()
            && self.withheld_session_info.is_empty()
            && self.backup_decryption_key.is_none()
            && self.backup_version.is_none()
    }
}

/// This struct is used to remember whether an identity has undergone a change
/// or remains the same as the one we already know about.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct IdentityChanges {
    pub new: Vec<UserIdentity>,
    pub changed: Vec<UserIdentity>,
}

impl IdentityChanges {
    fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty()
    }
}

/// The set of devices that changed, were newly seen, or were deleted.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct DeviceChanges {
    pub new: Vec<DeviceData>,
    pub changed: Vec<DeviceData>,
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    /// Merge the given `DeviceChanges` into this instance of `DeviceChanges`.
    pub fn extend(&mut self, other: DeviceChanges) {
        self.new.extend(other.new);
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
    }

    fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Stored versions of the backup keys.
#[derive(Default, Clone, Debug)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys.
    pub decryption_key: Option<BackupDecryptionKey>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// Result type telling us how many room keys have been imported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the export.
    pub total_count: usize,
    /// The map of keys that were imported.
    ///
    /// It's a map from room id to a map of the sender key to a set of session
    /// ids.
    pub keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
}

impl RoomKeyImportResult {
    pub(crate) fn new(
        imported_count: usize,
        total_count: usize,
        keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
    ) -> Self {
        Self { imported_count, total_count, keys }
    }
}

/// A wrapper for our CryptoStore trait object.
///
/// This is needed because we want to have a generic interface so we can
/// store/restore objects that we can serialize. Since trait objects and
/// generics don't mix let the CryptoStore store strings and this wrapper
/// adds the generic interface on top.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    static_account: StaticAccountData,
    account: Mutex<Account>,
    store: Arc<dyn CryptoStore>,
    save_changes_lock: Mutex<()>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    clock: Arc<dyn Clock>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("account", &self.inner.static_account)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new Store.
    pub(crate) fn new(
        account: Account,
        store: Arc<dyn CryptoStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                static_account: account.static_data().clone(),
                account: Mutex::new(account),
                store,
                save_changes_lock: Mutex::new(()),
                sessions: SessionStore::new(),
                inbound_group_sessions: GroupSessionStore::new(),
                clock,
            }),
        }
    }

    /// The current time according to the clock of the store.
    pub(crate) fn now(&self) -> MilliSecondsSinceUnixEpoch {
        self.inner.clock.now()
    }

    /// The clock of the store.
    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn static_account(&self) -> &StaticAccountData {
        &self.inner.static_account
    }

    /// UserId associated with this store
    pub(crate) fn user_id(&self) -> &UserId {
        &self.inner.static_account.user_id
    }

    /// DeviceId associated with this store
    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.inner.static_account.device_id
    }

    /// Lock the account for an operation that mutates it.
    ///
    /// Only one account operation runs at a time, this is what keeps two
    /// inbound Olm sessions from being created off the same one-time key.
    pub(crate) async fn account(&self) -> MutexGuard<'_, Account> {
        self.inner.account.lock().await
    }

    /// The underlying [`CryptoStore`].
    pub(crate) fn crypto_store(&self) -> Arc<dyn CryptoStore> {
        self.inner.store.clone()
    }

    /// Save the changes, then make them visible in our caches.
    ///
    /// The caches only learn about a change once the store accepted it.
    pub(crate) async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.inner.save_changes_lock.lock().await;

        let sessions = changes.sessions.clone();
        let inbound_group_sessions = changes.inbound_group_sessions.clone();

        self.inner.store.save_changes(changes).await?;

        for session in sessions {
            self.inner.sessions.add(session).await;
        }

        for session in inbound_group_sessions {
            self.inner.inbound_group_sessions.add(session);
        }

        Ok(())
    }

    /// Convenience helper to persist an array of [`Session`]s.
    pub(crate) async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        let changes = Changes { sessions: sessions.to_vec(), ..Default::default() };
        self.save_changes(changes).await
    }

    /// Convenience helper to persist an array of [`InboundGroupSession`]s.
    pub(crate) async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        let changes = Changes { inbound_group_sessions: sessions.to_vec(), ..Default::default() };
        self.save_changes(changes).await
    }

    /// Convenience helper to persist device updates.
    pub(crate) async fn save_device_data(&self, devices: &[DeviceData]) -> Result<()> {
        let changes = Changes {
            devices: DeviceChanges { changed: devices.to_vec(), ..Default::default() },
            ..Default::default()
        };

        self.save_changes(changes).await
    }

    /// Get all the Olm sessions we share with the device owning the given
    /// Curve25519 key, in the order they were created in.
    pub(crate) async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        let sessions = self.inner.sessions.get(sender_key);

        Ok(if sessions.is_some() {
            sessions
        } else {
            let sessions = self.inner.store.get_sessions(sender_key).await?;

            if let Some(sessions) = sessions {
                self.inner.sessions.set_for_sender(sender_key, sessions);
                self.inner.sessions.get(sender_key)
            } else {
                None
            }
        })
    }

    /// The Olm session we should encrypt with for the device owning the
    /// given Curve25519 key.
    ///
    /// This is the session that most recently received a message, a tie goes
    /// to the session that was created first. Both sides of a conversation
    /// end up picking the same session this way.
    pub(crate) async fn last_used_session(
        &self,
        sender_key: Curve25519PublicKey,
    ) -> Result<Option<Session>> {
        let Some(sessions) = self.get_sessions(&sender_key.to_base64()).await? else {
            return Ok(None);
        };

        let sessions = sessions.lock().await;

        // `max_by_key` keeps the last of equal elements, walk backwards so
        // the first created session wins a tie.
        Ok(sessions.iter().rev().max_by_key(|s| s.last_message_received_at).cloned())
    }

    /// Get the inbound group session with the given room and session id, from
    /// our cache or from the store.
    pub(crate) async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        if let Some(session) = self.inner.inbound_group_sessions.get(room_id, session_id) {
            return Ok(Some(session));
        }

        let session = self.inner.store.get_inbound_group_session(room_id, session_id).await?;

        if let Some(session) = &session {
            self.inner.inbound_group_sessions.add(session.clone());
        }

        Ok(session)
    }

    /// Compare the given session with the copy of it we already have.
    ///
    /// A session we don't have yet is always [`SessionOrdering::Better`].
    pub(crate) async fn compare_group_session(
        &self,
        session: &InboundGroupSession,
    ) -> Result<SessionOrdering> {
        let old_session =
            self.get_inbound_group_session(session.room_id(), session.session_id()).await?;

        Ok(if let Some(old_session) = old_session {
            session.compare(&old_session).await
        } else {
            SessionOrdering::Better
        })
    }

    /// Decide whether a received room key should replace the copy we have.
    ///
    /// Returns the session if it should be stored, a copy with an equal or
    /// higher first known index, or one that doesn't belong to the same
    /// ratchet, is dropped.
    pub(crate) async fn merge_received_group_session(
        &self,
        session: InboundGroupSession,
    ) -> Result<Option<InboundGroupSession>> {
        let ordering = self.compare_group_session(&session).await?;

        match ordering {
            SessionOrdering::Better => {
                info!(
                    room_id = ?session.room_id(),
                    session_id = session.session_id(),
                    first_known_index = session.first_known_index(),
                    "Received a new, or a better, room key",
                );

                Ok(Some(session))
            }
            SessionOrdering::Unconnected => {
                warn!(
                    room_id = ?session.room_id(),
                    session_id = session.session_id(),
                    "Received a room key that doesn't match the ratchet of the copy we have, \
                     dropping it",
                );

                Ok(None)
            }
            SessionOrdering::Equal | SessionOrdering::Worse => {
                info!(
                    room_id = ?session.room_id(),
                    session_id = session.session_id(),
                    ?ordering,
                    "Received a room key we already have at an equal or better index",
                );

                Ok(None)
            }
        }
    }

    /// Import the given room keys into the store.
    ///
    /// # Arguments
    ///
    /// * `exported_keys` - The keys to be imported.
    /// * `from_backup_version` - If the keys came from key backup, the key
    ///   backup version. The imported sessions are marked as backed up.
    ///
    /// Keys that fail to parse, and keys we already have at an equal or
    /// better index, are skipped.
    pub(crate) async fn import_room_keys(
        &self,
        exported_keys: Vec<ExportedRoomKey>,
        from_backup_version: Option<&str>,
    ) -> Result<RoomKeyImportResult> {
        let total_count = exported_keys.len();
        let mut sessions = Vec::new();
        let mut keys = BTreeMap::new();

        for key in exported_keys {
            match InboundGroupSession::from_export(&key) {
                Ok(session) => {
                    // Only import the session if we didn't have this session or
                    // if it's a better version of the same session.
                    let Some(session) = self.merge_received_group_session(session).await? else {
                        continue;
                    };

                    if from_backup_version.is_some() {
                        session.mark_as_backed_up();
                    }

                    keys.entry(session.room_id().to_owned())
                        .or_insert_with(BTreeMap::new)
                        .entry(session.sender_key().to_base64())
                        .or_insert_with(BTreeSet::new)
                        .insert(session.session_id().to_owned());

                    sessions.push(session);
                }
                Err(e) => {
                    warn!(
                        sender_key = key.sender_key.to_base64(),
                        room_id = ?key.room_id,
                        session_id = key.session_id,
                        error = ?e,
                        "Couldn't import a room key from a file export."
                    );
                }
            }
        }

        let imported_count = sessions.len();

        self.save_inbound_group_sessions(&sessions).await?;

        info!(total_count, imported_count, room_keys = ?keys, "Successfully imported room keys");

        Ok(RoomKeyImportResult::new(imported_count, total_count, keys))
    }

    /// Mark the given sessions as backed up, in the store and in our cache.
    pub(crate) async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        let _guard = self.inner.save_changes_lock.lock().await;

        self.inner.store.mark_inbound_group_sessions_as_backed_up(room_and_session_ids).await?;

        for (room_id, session_id) in room_and_session_ids {
            if let Some(session) = self.inner.inbound_group_sessions.get(room_id, session_id) {
                session.mark_as_backed_up();
            }
        }

        Ok(())
    }

    /// Forget which sessions were backed up, in the store and in our cache.
    pub(crate) async fn reset_backup_state(&self) -> Result<()> {
        let _guard = self.inner.save_changes_lock.lock().await;

        self.inner.store.reset_backup_state().await?;

        for session in self.inner.inbound_group_sessions.get_all() {
            session.reset_backup_state();
        }

        Ok(())
    }

    /// Get the device of the given user that owns the given Curve25519 key.
    pub(crate) async fn get_device_from_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .inner
            .store
            .get_user_devices(user_id)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == Some(curve_key)))
    }

    /// Get all our own devices, except the one this store belongs to.
    pub(crate) async fn get_own_other_devices(&self) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        let mut devices = self.inner.store.get_user_devices(self.user_id()).await?;
        devices.remove(self.device_id());

        Ok(devices)
    }

    /// The devices of the given users that we know about.
    pub(crate) async fn get_devices_of(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> Result<BTreeMap<OwnedUserId, Vec<DeviceData>>> {
        let mut devices = BTreeMap::new();

        for user_id in users {
            let user_devices = self.inner.store.get_user_devices(user_id).await?;
            devices.insert(user_id.to_owned(), user_devices.into_values().collect());
        }

        Ok(devices)
    }
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        self.inner.store.deref()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches2::assert_let;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::{Changes, MemoryStore, Store};
    use crate::{
        identities::DeviceData,
        olm::{Account, InboundGroupSession},
        utilities::{millis, Clock, MockClock},
    };

    async fn store_for(account: Account, clock: MockClock) -> Store {
        let memory_store = MemoryStore::new();
        let store = Store::new(account, Arc::new(memory_store), Arc::new(clock));

        let pickle = store.account().await.pickle();
        store.save_changes(Changes { account: Some(pickle), ..Default::default() }).await.unwrap();

        store
    }

    #[tokio::test]
    async fn test_last_used_session_selection() {
        let clock = MockClock::default();
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let alice_device = DeviceData::from_account(&alice);
        let alice_key = alice.identity_keys().curve25519;

        let (mut session_a, mut bob_a) = alice.create_session_for_test_helper(&mut bob).await;
        let (session_b, mut bob_b) = alice.create_session_for_test_helper(&mut bob).await;
        let sender_key = session_a.sender_key();

        let store = store_for(alice, clock.clone()).await;
        store.save_sessions(&[session_a.clone(), session_b.clone()]).await.unwrap();

        // Neither session received anything, the first one wins.
        assert_let!(Some(selected) = store.last_used_session(sender_key).await.unwrap());
        assert_eq!(selected.session_id(), session_a.session_id());

        // Bob answers on session B.
        clock.advance(Duration::from_secs(10));
        let reply = bob_b.encrypt(&alice_device, "m.dummy", json!({}), clock.now()).await.unwrap();
        let message = reply.message_for(alice_key).unwrap();

        {
            let sessions = store.get_sessions(&sender_key.to_base64()).await.unwrap().unwrap();
            let mut sessions = sessions.lock().await;
            let session =
                sessions.iter_mut().find(|s| s.session_id() == session_b.session_id()).unwrap();
            session.decrypt(&message, clock.now()).await.unwrap();
        }

        assert_let!(Some(selected) = store.last_used_session(sender_key).await.unwrap());
        assert_eq!(selected.session_id(), session_b.session_id());

        // A message on session A at the same time ties with B, the session
        // created first wins the tie.
        let reply = bob_a.encrypt(&alice_device, "m.dummy", json!({}), clock.now()).await.unwrap();
        let message = reply.message_for(alice_key).unwrap();
        session_a.decrypt(&message, clock.now()).await.unwrap();
        store.save_sessions(&[session_a.clone()]).await.unwrap();

        assert_let!(Some(selected) = store.last_used_session(sender_key).await.unwrap());
        assert_eq!(selected.session_id(), session_a.session_id());
    }

    #[tokio::test]
    async fn test_better_room_key_wins() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let room_id = room_id!("!test:localhost");

        let (outbound, inbound) = account
            .static_data()
            .create_group_session_pair(room_id, Default::default(), millis(0))
            .await
            .unwrap();

        let store = store_for(account, MockClock::default()).await;

        outbound.encrypt("m.dummy", json!({})).await;
        let later = InboundGroupSession::from_export(&inbound.export_at_index(1).await).unwrap();
        let later = store.merge_received_group_session(later).await.unwrap().unwrap();
        store.save_inbound_group_sessions(&[later]).await.unwrap();

        // The same key at a higher, or equal, index is dropped.
        let worse = InboundGroupSession::from_export(&inbound.export_at_index(1).await).unwrap();
        assert!(store.merge_received_group_session(worse).await.unwrap().is_none());

        // The lower index replaces the stored copy.
        let better = InboundGroupSession::from_export(&inbound.export().await).unwrap();
        let better = store.merge_received_group_session(better).await.unwrap().unwrap();
        store.save_inbound_group_sessions(&[better]).await.unwrap();

        let stored =
            store.get_inbound_group_session(room_id, inbound.session_id()).await.unwrap().unwrap();
        assert_eq!(stored.first_known_index(), 0);
    }

    #[tokio::test]
    async fn test_import_counts_only_new_keys() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let room_id = room_id!("!test:localhost");

        let (_, inbound) = account
            .static_data()
            .create_group_session_pair(room_id, Default::default(), millis(0))
            .await
            .unwrap();

        let store = store_for(account, MockClock::default()).await;

        let result = store.import_room_keys(vec![inbound.export().await], None).await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (1, 1));
        assert!(result.keys[room_id][&inbound.sender_key().to_base64()]
            .contains(inbound.session_id()));

        let result =
            store.import_room_keys(vec![inbound.export().await], Some("1")).await.unwrap();
        assert_eq!((result.imported_count, result.total_count), (0, 1));
    }
}
