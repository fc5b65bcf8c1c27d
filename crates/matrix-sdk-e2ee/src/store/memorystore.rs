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

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use indexmap::IndexMap;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::{BackupKeys, Changes, CryptoStore, CryptoStoreError, Result, RoomKeyCounts};
use crate::{
    gossiping::GossipRequest,
    identities::{DeviceData, UserIdentity},
    locks::RwLock as StdRwLock,
    olm::{
        Account, InboundGroupSession, OutboundGroupSession, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession, Session,
        StaticAccountData,
    },
    types::events::{room_key_request::RequestedKeyInfo, room_key_withheld::RoomKeyWithheldContent},
};

/// Parse a stored record, a record that doesn't parse is reported as missing.
fn parse_record<T: DeserializeOwned>(kind: &'static str, id: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!(kind, id, ?error, "Ignoring a corrupted record in the crypto store");
            None
        }
    }
}

fn to_record<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Only the backup flag of a pickled inbound group session.
#[derive(Deserialize)]
struct BackupFlag {
    #[serde(default)]
    backed_up: bool,
}

/// An in-memory only store that will forget all the E2EE key once it's dropped.
///
/// Every record is kept as the JSON of its pickle, the same form a persistent
/// store would write to disk.
#[derive(Default, Debug)]
pub struct MemoryStore {
    static_account: StdRwLock<Option<StaticAccountData>>,

    account: StdRwLock<Option<String>>,
    // Map of sender_key to map of session_id to serialized pickle, in the
    // order the sessions were first stored.
    sessions: StdRwLock<BTreeMap<String, IndexMap<String, String>>>,
    inbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, HashMap<String, String>>>,
    outbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, String>>,
    devices: StdRwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>>,
    identities: StdRwLock<BTreeMap<OwnedUserId, String>>,
    outgoing_key_requests: StdRwLock<BTreeMap<OwnedTransactionId, String>>,
    key_requests_by_info: StdRwLock<BTreeMap<String, OwnedTransactionId>>,
    withheld_info: StdRwLock<BTreeMap<OwnedRoomId, BTreeMap<String, String>>>,
    backup_keys: RwLock<BackupKeys>,

    save_changes_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn get_static_account(&self) -> Result<StaticAccountData> {
        self.static_account.read().clone().ok_or(CryptoStoreError::AccountUnset)
    }

    async fn save_sessions(&self, sessions: Vec<Session>) -> Result<()> {
        let mut pickles = Vec::with_capacity(sessions.len());

        for session in sessions {
            let pickle = to_record(&session.pickle().await)?;
            let sender_key = session.sender_key().to_base64();
            pickles.push((sender_key, session.session_id().to_owned(), pickle));
        }

        let mut session_store = self.sessions.write();

        for (sender_key, session_id, pickle) in pickles {
            // insert or replace if exists, keeping the original position
            session_store.entry(sender_key).or_default().insert(session_id, pickle);
        }

        Ok(())
    }

    async fn save_inbound_group_sessions(&self, sessions: Vec<InboundGroupSession>) -> Result<()> {
        for session in sessions {
            let pickle = to_record(&session.pickle().await)?;

            self.inbound_group_sessions
                .write()
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), pickle);
        }

        Ok(())
    }

    async fn save_outbound_group_sessions(
        &self,
        sessions: Vec<OutboundGroupSession>,
    ) -> Result<()> {
        for session in sessions {
            let pickle = to_record(&session.pickle().await)?;
            self.outbound_group_sessions.write().insert(session.room_id().to_owned(), pickle);
        }

        Ok(())
    }

    fn save_devices(&self, devices: Vec<DeviceData>) -> Result<()> {
        for device in devices {
            let record = to_record(&device)?;
            self.devices
                .write()
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), record);
        }

        Ok(())
    }

    fn delete_devices(&self, devices: Vec<DeviceData>) {
        let mut store = self.devices.write();

        for device in devices {
            if let Some(user_devices) = store.get_mut(device.user_id()) {
                user_devices.remove(device.device_id());
            }
        }
    }

    fn inbound_group_session_from_record(
        room_id: &RoomId,
        session_id: &str,
        json: &str,
    ) -> Option<InboundGroupSession> {
        let id = format!("{room_id}/{session_id}");
        let pickle: PickledInboundGroupSession = parse_record("inbound_group_session", &id, json)?;

        Some(InboundGroupSession::from_pickle(pickle))
    }

    fn all_inbound_group_sessions(&self) -> Vec<InboundGroupSession> {
        self.inbound_group_sessions
            .read()
            .iter()
            .flat_map(|(room_id, sessions)| {
                sessions.iter().filter_map(|(session_id, json)| {
                    Self::inbound_group_session_from_record(room_id, session_id, json)
                })
            })
            .collect()
    }

    /// Put a record into the store that doesn't parse, like a partially
    /// written entry of a persistent store would.
    #[cfg(test)]
    pub(crate) fn insert_corrupted_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) {
        self.inbound_group_sessions
            .write()
            .entry(room_id.to_owned())
            .or_default()
            .insert(session_id.to_owned(), "{\"pickle\": 12".to_owned());
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let pickle = self.account.read().clone();

        let Some(pickle) = pickle else {
            return Ok(None);
        };

        let pickle: PickledAccount = serde_json::from_str(&pickle)?;
        let account = Account::from_pickle(pickle);

        *self.static_account.write() = Some(account.static_data().clone());

        Ok(Some(account))
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;

        if let Some(pickle) = changes.account {
            let record = to_record(&pickle)?;
            let account = Account::from_pickle(pickle);

            *self.static_account.write() = Some(account.static_data().clone());
            *self.account.write() = Some(record);
        }

        self.save_sessions(changes.sessions).await?;
        self.save_inbound_group_sessions(changes.inbound_group_sessions).await?;
        self.save_outbound_group_sessions(changes.outbound_group_sessions).await?;

        self.save_devices(changes.devices.new)?;
        self.save_devices(changes.devices.changed)?;
        self.delete_devices(changes.devices.deleted);

        for identity in changes.identities.new.into_iter().chain(changes.identities.changed) {
            let record = to_record(&identity)?;
            self.identities.write().insert(identity.user_id().to_owned(), record);
        }

        for key_request in changes.key_requests {
            let record = to_record(&key_request)?;
            let id = key_request.request_id.clone();

            self.outgoing_key_requests.write().insert(id.clone(), record);
            self.key_requests_by_info.write().insert(key_request.info.as_key(), id);
        }

        for (room_id, data) in changes.withheld_session_info {
            for (session_id, content) in data {
                let record = to_record(&content)?;
                self.withheld_info
                    .write()
                    .entry(room_id.clone())
                    .or_default()
                    .insert(session_id, record);
            }
        }

        if let Some(key) = changes.backup_decryption_key {
            self.backup_keys.write().await.decryption_key = Some(key);
        }

        if let Some(version) = changes.backup_version {
            self.backup_keys.write().await.backup_version = Some(version);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Vec<Session>>> {
        let account = self.get_static_account()?;

        Ok(self.sessions.read().get(sender_key).map(|pickles| {
            pickles
                .iter()
                .filter_map(|(session_id, json)| {
                    let pickle: PickledSession = parse_record("session", session_id, json)?;
                    Some(Session::from_pickle(account.clone(), pickle))
                })
                .collect()
        }))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .read()
            .get(room_id)
            .and_then(|m| m.get(session_id))
            .and_then(|json| Self::inbound_group_session_from_record(room_id, session_id, json)))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.all_inbound_group_sessions())
    }

    async fn get_inbound_group_sessions_by_room_id(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .read()
            .get(room_id)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter_map(|(session_id, json)| {
                        Self::inbound_group_session_from_record(room_id, session_id, json)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.inbound_group_sessions.read();

        let total = sessions.values().map(HashMap::len).sum();
        let backed_up = sessions
            .values()
            .flat_map(HashMap::values)
            .filter(|json| {
                serde_json::from_str::<BackupFlag>(json).is_ok_and(|flag| flag.backed_up)
            })
            .count();

        Ok(RoomKeyCounts { total, backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .all_inbound_group_sessions()
            .into_iter()
            .filter(|s| !s.backed_up())
            .take(limit)
            .collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        let mut sessions = Vec::with_capacity(room_and_session_ids.len());

        for (room_id, session_id) in room_and_session_ids {
            if let Some(session) = self.get_inbound_group_session(room_id, session_id).await? {
                session.mark_as_backed_up();
                sessions.push(session);
            }
        }

        self.save_inbound_group_sessions(sessions).await
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let sessions: Vec<_> = self
            .all_inbound_group_sessions()
            .into_iter()
            .filter(|s| s.backed_up())
            .inspect(|s| s.reset_backup_state())
            .collect();

        self.save_inbound_group_sessions(sessions).await
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        Ok(self.backup_keys.read().await.to_owned())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        let account = self.get_static_account()?;
        let json = self.outbound_group_sessions.read().get(room_id).cloned();

        Ok(json
            .and_then(|json| {
                parse_record::<PickledOutboundGroupSession>(
                    "outbound_group_session",
                    room_id.as_str(),
                    &json,
                )
            })
            .map(|pickle| {
                OutboundGroupSession::from_pickle(
                    account.device_id.clone(),
                    account.identity_keys.clone(),
                    pickle,
                )
            }))
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .devices
            .read()
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .and_then(|json| parse_record("device", device_id.as_str(), json)))
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, DeviceData>> {
        Ok(self
            .devices
            .read()
            .get(user_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|(device_id, json)| {
                        let device = parse_record("device", device_id.as_str(), json)?;
                        Some((device_id.to_owned(), device))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentity>> {
        Ok(self
            .identities
            .read()
            .get(user_id)
            .and_then(|json| parse_record("user_identity", user_id.as_str(), json)))
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<GossipRequest>> {
        Ok(self
            .outgoing_key_requests
            .read()
            .get(request_id)
            .and_then(|json| parse_record("key_request", request_id.as_str(), json)))
    }

    async fn get_key_request_by_info(
        &self,
        key_info: &RequestedKeyInfo,
    ) -> Result<Option<GossipRequest>> {
        let id = self.key_requests_by_info.read().get(&key_info.as_key()).cloned();

        if let Some(id) = id {
            self.get_outgoing_key_request(&id).await
        } else {
            Ok(None)
        }
    }

    async fn get_unsent_key_requests(&self) -> Result<Vec<GossipRequest>> {
        Ok(self
            .outgoing_key_requests
            .read()
            .iter()
            .filter_map(|(id, json)| {
                parse_record::<GossipRequest>("key_request", id.as_str(), json)
            })
            .filter(|req| !req.sent_out)
            .collect())
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        let removed = self.outgoing_key_requests.write().remove(request_id);

        if let Some(json) = removed {
            if let Some(request) =
                parse_record::<GossipRequest>("key_request", request_id.as_str(), &json)
            {
                self.key_requests_by_info.write().remove(&request.info.as_key());
            } else {
                self.key_requests_by_info.write().retain(|_, id| id != request_id);
            }
        }

        Ok(())
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        Ok(self
            .withheld_info
            .read()
            .get(room_id)
            .and_then(|sessions| sessions.get(session_id))
            .and_then(|json| parse_record("withheld_info", session_id, json)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id, TransactionId};
    use vodozemac::Curve25519PublicKey;

    use super::MemoryStore;
    use crate::{
        gossiping::GossipRequest,
        identities::{DeviceData, LocalTrust},
        olm::{Account, InboundGroupSession},
        store::{Changes, CryptoStore, CryptoStoreError, DeviceChanges},
        types::events::{
            room_key_request::RequestedKeyInfo,
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
        },
        utilities::millis,
    };

    fn alice() -> Account {
        Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"))
    }

    async fn store_with_account(account: &Account) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .save_changes(Changes { account: Some(account.pickle()), ..Default::default() })
            .await
            .unwrap();

        store
    }

    async fn inbound_session(account: &Account) -> InboundGroupSession {
        let room_id = room_id!("!test:localhost");
        let (_, inbound) = account
            .static_data()
            .create_group_session_pair(room_id, Default::default(), millis(0))
            .await
            .unwrap();

        inbound
    }

    #[tokio::test]
    async fn test_account_is_loaded_back() {
        let account = alice();
        let store = store_with_account(&account).await;

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(loaded.identity_keys(), account.identity_keys());
    }

    #[tokio::test]
    async fn test_sessions_need_an_account() {
        let store = MemoryStore::new();
        assert_matches!(store.get_sessions("key").await, Err(CryptoStoreError::AccountUnset));
    }

    #[tokio::test]
    async fn test_sessions_keep_insertion_order() {
        let account = alice();
        let mut bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let store = store_with_account(&account).await;

        let (first, _) = account.create_session_for_test_helper(&mut bob).await;
        let (second, _) = account.create_session_for_test_helper(&mut bob).await;

        store
            .save_changes(Changes { sessions: vec![first.clone()], ..Default::default() })
            .await
            .unwrap();
        store
            .save_changes(Changes {
                sessions: vec![second.clone(), first.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let sessions = store.get_sessions(&first.sender_key.to_base64()).await.unwrap().unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.session_id().to_owned()).collect();

        assert_eq!(ids, vec![first.session_id().to_owned(), second.session_id().to_owned()]);
    }

    #[tokio::test]
    async fn test_corrupted_group_session_is_reported_as_missing() {
        let account = alice();
        let store = store_with_account(&account).await;
        let session = inbound_session(&account).await;

        store
            .save_changes(Changes {
                inbound_group_sessions: vec![session.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        store.insert_corrupted_inbound_group_session(session.room_id(), "broken");

        assert!(store
            .get_inbound_group_session(session.room_id(), "broken")
            .await
            .unwrap()
            .is_none());

        let all = store.get_inbound_group_sessions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_id(), session.session_id());
    }

    #[tokio::test]
    async fn test_backup_state_tracking() {
        let account = alice();
        let store = store_with_account(&account).await;
        let session = inbound_session(&account).await;
        let room_id = session.room_id().to_owned();

        store
            .save_changes(Changes {
                inbound_group_sessions: vec![session.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (1, 0));
        assert_eq!(store.inbound_group_sessions_for_backup(10).await.unwrap().len(), 1);

        store
            .mark_inbound_group_sessions_as_backed_up(&[(&room_id, session.session_id())])
            .await
            .unwrap();

        let counts = store.inbound_group_session_counts().await.unwrap();
        assert_eq!((counts.total, counts.backed_up), (1, 1));
        assert!(store.inbound_group_sessions_for_backup(10).await.unwrap().is_empty());

        store.reset_backup_state().await.unwrap();
        assert_eq!(store.inbound_group_session_counts().await.unwrap().backed_up, 0);
    }

    #[tokio::test]
    async fn test_devices_are_stored_and_deleted() {
        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let mut device = DeviceData::from_account(&bob);
        device.set_trust_state(LocalTrust::BlackListed);

        let store = MemoryStore::new();
        store
            .save_changes(Changes {
                devices: DeviceChanges { new: vec![device.clone()], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert!(loaded.is_blacklisted());
        assert_eq!(store.get_user_devices(bob.user_id()).await.unwrap().len(), 1);

        store
            .save_changes(Changes {
                devices: DeviceChanges { deleted: vec![device], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.get_device(bob.user_id(), bob.device_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_requests() {
        let store = MemoryStore::new();
        let info = RequestedKeyInfo::new(
            room_id!("!test:localhost").to_owned(),
            None,
            "session_id".to_owned(),
        );
        let request = GossipRequest::new(info.clone(), Vec::new());
        let id = request.request_id.clone();

        store
            .save_changes(Changes { key_requests: vec![request.clone()], ..Default::default() })
            .await
            .unwrap();

        assert_eq!(store.get_outgoing_key_request(&id).await.unwrap(), Some(request.clone()));
        assert_eq!(store.get_key_request_by_info(&info).await.unwrap(), Some(request.clone()));
        assert_eq!(store.get_unsent_key_requests().await.unwrap(), vec![request]);

        store.delete_outgoing_key_request(&id).await.unwrap();
        assert!(store.get_key_request_by_info(&info).await.unwrap().is_none());

        // Deleting an unknown request is fine.
        store.delete_outgoing_key_request(&TransactionId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_withheld_info() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");
        let content = RoomKeyWithheldContent::new(
            WithheldCode::Unverified,
            room_id.to_owned(),
            "session_id".to_owned(),
            Curve25519PublicKey::from_bytes([1u8; 32]),
            device_id!("BOBDEVICE").to_owned(),
        );

        let mut changes = Changes::default();
        changes
            .withheld_session_info
            .entry(room_id.to_owned())
            .or_default()
            .insert("session_id".to_owned(), content.clone());
        store.save_changes(changes).await.unwrap();

        assert_eq!(store.get_withheld_info(room_id, "session_id").await.unwrap(), Some(content));
        assert!(store.get_withheld_info(room_id, "other").await.unwrap().is_none());
    }
}
