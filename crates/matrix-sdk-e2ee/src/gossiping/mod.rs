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

//! Room key gossiping: requesting room keys we're missing from other devices,
//! answering such requests, and forwarding keys to new room members.

mod machine;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub(crate) use machine::GossipMachine;
use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use serde::{Deserialize, Serialize};

use crate::{
    identities::DeviceData,
    locks::RwLock as StdRwLock,
    types::{
        events::{
            room_key_request::{RequestedKeyInfo, RoomKeyRequestContent, RoomKeyRequestEvent},
            EventType,
        },
        requests::ToDeviceRequest,
    },
};

/// An error describing why a key share request won't be honored.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyForwardDecision {
    /// The key request is from a device that we don't own, we're only sharing
    /// sessions that we know the requesting device already was supposed to get.
    #[error("can't find an active outbound group session")]
    MissingOutboundSession,
    /// The key request is from a device that we don't own and the device wasn't
    /// meant to receive the session in the original key share.
    #[error("outbound session wasn't shared with the requesting device")]
    OutboundSessionNotShared,
    /// The key request is from a device we own, yet we don't trust it.
    #[error("requesting device isn't trusted")]
    UntrustedDevice,
    /// The outbound session was shared with the device, but the device either
    /// accidentally or maliciously changed their curve25519 sender key.
    #[error("the device has changed their curve25519 sender key")]
    ChangedSenderKey,
    /// The requesting device is blacklisted.
    #[error("the requesting device is blacklisted")]
    Blacklisted,
}

/// A struct describing an outgoing key request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRequest {
    /// The unique id of the key request.
    pub request_id: OwnedTransactionId,
    /// The info of the requested key.
    pub info: RequestedKeyInfo,
    /// Has the request been sent out.
    pub sent_out: bool,
    /// The devices the request is addressed to.
    pub recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
}

impl GossipRequest {
    /// Create a new, not yet sent, key request.
    pub(crate) fn new(
        info: RequestedKeyInfo,
        recipients: Vec<(OwnedUserId, DeviceIdOrAllDevices)>,
    ) -> Self {
        Self { request_id: TransactionId::new(), info, sent_out: false, recipients }
    }

    /// The `m.room_key_request` to-device request asking our recipients for
    /// the key.
    ///
    /// The transaction id of the request is the request id, which lets us
    /// find the request again once the transport delivered it.
    pub(crate) fn to_request(&self, own_device_id: &DeviceId) -> ToDeviceRequest {
        let content = RoomKeyRequestContent::new_request(
            self.info.clone(),
            own_device_id.to_owned(),
            self.request_id.clone(),
        );

        self.to_device_request(&content, self.request_id.clone())
    }

    /// The `m.room_key_request` to-device request cancelling this request.
    pub(crate) fn to_cancellation(&self, own_device_id: &DeviceId) -> ToDeviceRequest {
        let content = RoomKeyRequestContent::new_cancellation(
            own_device_id.to_owned(),
            self.request_id.clone(),
        );

        self.to_device_request(&content, TransactionId::new())
    }

    fn to_device_request(
        &self,
        content: &RoomKeyRequestContent,
        txn_id: OwnedTransactionId,
    ) -> ToDeviceRequest {
        let content =
            serde_json::to_value(content).expect("We can always serialize a room key request");

        let mut request = ToDeviceRequest::empty(RoomKeyRequestContent::EVENT_TYPE);
        request.txn_id = txn_id;

        for (user_id, device) in &self.recipients {
            request.add(user_id, device.clone(), content.clone());
        }

        request
    }
}

impl PartialEq for GossipRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id && self.info == other.info
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RequestInfo {
    sender: OwnedUserId,
    requesting_device_id: OwnedDeviceId,
    request_id: OwnedTransactionId,
}

impl RequestInfo {
    fn new(
        sender: OwnedUserId,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self { sender, requesting_device_id, request_id }
    }

    fn from_event(event: &RoomKeyRequestEvent) -> Self {
        Self::new(
            event.sender.clone(),
            event.content.requesting_device_id.clone(),
            event.content.request_id.clone(),
        )
    }
}

/// A queue where we store room key requests that we want to serve but the
/// device that requested the key doesn't share an Olm session with us.
#[derive(Clone, Debug, Default)]
struct WaitQueue {
    inner: Arc<StdRwLock<WaitQueueInner>>,
}

#[derive(Debug, Default)]
struct WaitQueueInner {
    requests_waiting_for_session: BTreeMap<RequestInfo, RoomKeyRequestEvent>,
    requests_ids_waiting: BTreeMap<(OwnedUserId, OwnedDeviceId), BTreeSet<OwnedTransactionId>>,
}

impl WaitQueue {
    fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        let read_guard = self.inner.read();
        read_guard.requests_ids_waiting.is_empty()
            && read_guard.requests_waiting_for_session.is_empty()
    }

    fn insert(&self, device: &DeviceData, event: RoomKeyRequestEvent) {
        let request_id = event.content.request_id.clone();
        let requests_waiting_key = RequestInfo::new(
            device.user_id().to_owned(),
            device.device_id().into(),
            request_id.clone(),
        );
        let ids_waiting_key = (device.user_id().to_owned(), device.device_id().into());

        let mut write_guard = self.inner.write();
        write_guard.requests_waiting_for_session.insert(requests_waiting_key, event);
        write_guard.requests_ids_waiting.entry(ids_waiting_key).or_default().insert(request_id);
    }

    /// Forget a waiting request, the requester cancelled it.
    fn cancel(&self, info: &RequestInfo) -> bool {
        let mut write_guard = self.inner.write();
        let key = (info.sender.clone(), info.requesting_device_id.clone());

        if let Some(ids) = write_guard.requests_ids_waiting.get_mut(&key) {
            ids.remove(&info.request_id);

            if ids.is_empty() {
                write_guard.requests_ids_waiting.remove(&key);
            }
        }

        write_guard.requests_waiting_for_session.remove(info).is_some()
    }

    fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<RoomKeyRequestEvent> {
        let mut write_guard = self.inner.write();
        write_guard
            .requests_ids_waiting
            .remove(&(user_id.to_owned(), device_id.into()))
            .map(|request_ids| {
                request_ids
                    .iter()
                    .filter_map(|id| {
                        let key =
                            RequestInfo::new(user_id.to_owned(), device_id.into(), id.to_owned());
                        write_guard.requests_waiting_for_session.remove(&key)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
