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
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::{GossipRequest, KeyForwardDecision, RequestInfo, WaitQueue};
use crate::{
    error::{OlmError, OlmResult},
    identities::DeviceData,
    locks::RwLock as StdRwLock,
    machine::GlobalSettings,
    olm::{InboundGroupSession, Session, ShareState},
    session_manager::{encrypt_for_device, GroupSessionCache, SessionManager},
    store::{Changes, Result as StoreResult, Store},
    transport::Transport,
    types::{
        events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            room::encrypted::{EncryptedEvent, ToDeviceEncryptedEventContent},
            room_key_request::{Action, RequestedKeyInfo, RoomKeyRequestEvent},
            room_key_withheld::{RoomKeyWithheldContent, RoomKeyWithheldEvent, WithheldCode},
            EventType,
        },
        requests::{KeysClaimRequest, ToDeviceRequest},
    },
};

/// What became of an incoming key request.
#[derive(Debug)]
enum KeyRequestOutcome {
    /// The key is forwarded over the given Olm session.
    Forwarded(Session, ToDeviceRequest),
    /// The requester is told why it won't get the key.
    Withheld(ToDeviceRequest),
    /// We need an Olm session with the requester first.
    Queued,
    Ignored,
}

#[derive(Debug, Clone)]
pub(crate) struct GossipMachine {
    store: Store,
    transport: Arc<dyn Transport>,
    session_manager: SessionManager,
    outbound_group_sessions: GroupSessionCache,
    settings: Arc<StdRwLock<GlobalSettings>>,
    incoming_key_requests: Arc<StdRwLock<BTreeMap<RequestInfo, RoomKeyRequestEvent>>>,
    wait_queue: WaitQueue,
    /// Devices with a waiting key request we have to claim a one-time key
    /// for, with the info of one of their requests.
    devices_without_session:
        Arc<StdRwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, RequestedKeyInfo>>>>,
}

impl GossipMachine {
    const KEY_CLAIM_ALGORITHM: &'static str = "signed_curve25519";

    pub(crate) fn new(
        store: Store,
        transport: Arc<dyn Transport>,
        session_manager: SessionManager,
        outbound_group_sessions: GroupSessionCache,
        settings: Arc<StdRwLock<GlobalSettings>>,
    ) -> Self {
        Self {
            store,
            transport,
            session_manager,
            outbound_group_sessions,
            settings,
            incoming_key_requests: Default::default(),
            wait_queue: WaitQueue::new(),
            devices_without_session: Default::default(),
        }
    }

    /// Our own user id.
    pub(crate) fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    /// Our own device ID.
    pub(crate) fn device_id(&self) -> &DeviceId {
        self.store.device_id()
    }

    /// Receive a room key request event.
    ///
    /// Requests are queued up and served by
    /// [`GossipMachine::collect_incoming_key_requests`], a cancellation drops
    /// the request it refers to.
    pub(crate) fn receive_incoming_key_request(&self, event: &RoomKeyRequestEvent) {
        // Servers may echo requests we sent to all of our devices back to us.
        if event.sender == self.user_id()
            && event.content.requesting_device_id == self.device_id()
        {
            trace!("Received a key request event from ourselves, ignoring");
            return;
        }

        let request_info = RequestInfo::from_event(event);

        match event.content.action {
            Action::Request => {
                self.incoming_key_requests.write().insert(request_info, event.clone());
            }
            Action::Cancellation => {
                let pending = self.incoming_key_requests.write().remove(&request_info).is_some();
                let waiting = self.wait_queue.cancel(&request_info);

                debug!(
                    sender = ?event.sender,
                    requesting_device_id = ?event.content.requesting_device_id,
                    request_id = ?event.content.request_id,
                    cancelled = pending || waiting,
                    "Received a key request cancellation"
                );
            }
        }
    }

    /// Retry the key requests of a device that didn't share an Olm session
    /// with us.
    ///
    /// This should be called once the device got a new Olm session.
    pub(crate) fn retry_keyshare(&self, user_id: &UserId, device_id: &DeviceId) {
        {
            let mut devices = self.devices_without_session.write();

            if let Some(user_devices) = devices.get_mut(user_id) {
                user_devices.remove(device_id);

                if user_devices.is_empty() {
                    devices.remove(user_id);
                }
            }
        }

        let mut incoming = self.incoming_key_requests.write();

        for event in self.wait_queue.remove(user_id, device_id) {
            incoming.entry(RequestInfo::from_event(&event)).or_insert(event);
        }
    }

    /// Handle all the queued up incoming key requests, forwarding the room
    /// keys we're willing to share and sending withheld notices for the rest.
    ///
    /// Returns the number of forwarded room keys.
    #[instrument(skip_all)]
    pub(crate) async fn collect_incoming_key_requests(&self) -> OlmResult<usize> {
        let requests: Vec<RoomKeyRequestEvent> =
            std::mem::take(&mut *self.incoming_key_requests.write()).into_values().collect();

        let mut outcomes = Vec::with_capacity(requests.len());

        for event in &requests {
            outcomes.push(self.handle_key_request(event).await?);
        }

        outcomes.extend(self.establish_sessions_for_waiting_requests().await?);

        let mut used_sessions = Vec::new();
        let mut to_send = Vec::new();

        for outcome in outcomes {
            match outcome {
                KeyRequestOutcome::Forwarded(session, request) => {
                    used_sessions.push(session);
                    to_send.push((true, request));
                }
                KeyRequestOutcome::Withheld(request) => to_send.push((false, request)),
                KeyRequestOutcome::Queued | KeyRequestOutcome::Ignored => {}
            }
        }

        if !used_sessions.is_empty() {
            self.store.save_sessions(&used_sessions).await?;
        }

        let mut forwarded = 0;

        for (is_forward, request) in to_send {
            self.transport.send_to_device(&request).await?;

            if is_forward {
                forwarded += 1;
            }
        }

        Ok(forwarded)
    }

    /// Claim one-time keys for the devices whose key requests wait for an Olm
    /// session, and serve the requests of the ones we got a session with.
    ///
    /// Devices we still can't reach get an `m.no_olm` notice, their requests
    /// stay queued until they establish a session with us.
    async fn establish_sessions_for_waiting_requests(&self) -> OlmResult<Vec<KeyRequestOutcome>> {
        let waiting = std::mem::take(&mut *self.devices_without_session.write());

        if waiting.is_empty() {
            return Ok(Vec::new());
        }

        let request: KeysClaimRequest = waiting
            .iter()
            .map(|(user_id, devices)| {
                let devices = devices
                    .keys()
                    .map(|d| (d.to_owned(), Self::KEY_CLAIM_ALGORITHM.to_owned()))
                    .collect();
                (user_id.to_owned(), devices)
            })
            .collect();

        let response = self.transport.claim_one_time_keys(request).await?;
        let created: BTreeSet<(OwnedUserId, OwnedDeviceId)> = self
            .session_manager
            .create_sessions(&response)
            .await?
            .into_iter()
            .map(|d| (d.user_id().to_owned(), d.device_id().to_owned()))
            .collect();

        let mut outcomes = Vec::new();

        for (user_id, devices) in waiting {
            for (device_id, info) in devices {
                if created.contains(&(user_id.clone(), device_id.clone())) {
                    for event in self.wait_queue.remove(&user_id, &device_id) {
                        outcomes.push(self.handle_key_request(&event).await?);
                    }
                } else if let Some(device) = self.store.get_device(&user_id, &device_id).await? {
                    info!(
                        ?user_id,
                        ?device_id,
                        "Couldn't establish an Olm session to serve a key request"
                    );

                    let own_key = self.store.static_account().identity_keys.curve25519;
                    outcomes.push(KeyRequestOutcome::Withheld(self.withheld_response(
                        &device,
                        &info.room_id,
                        &info.session_id,
                        own_key,
                        WithheldCode::NoOlm,
                    )?));
                }
            }
        }

        Ok(outcomes)
    }

    /// Store the key request for later, once we get an Olm session with the
    /// device [`GossipMachine::retry_keyshare`] should be called.
    fn handle_key_share_without_session(
        &self,
        device: &DeviceData,
        info: &RequestedKeyInfo,
        event: &RoomKeyRequestEvent,
    ) {
        self.devices_without_session
            .write()
            .entry(device.user_id().to_owned())
            .or_default()
            .entry(device.device_id().to_owned())
            .or_insert_with(|| info.clone());

        self.wait_queue.insert(device, event.clone());
    }

    fn withheld_response(
        &self,
        device: &DeviceData,
        room_id: &RoomId,
        session_id: &str,
        sender_key: Curve25519PublicKey,
        code: WithheldCode,
    ) -> OlmResult<ToDeviceRequest> {
        let content = RoomKeyWithheldContent::new(
            code,
            room_id.to_owned(),
            session_id.to_owned(),
            sender_key,
            self.device_id().to_owned(),
        );

        Ok(ToDeviceRequest::new(
            device.user_id(),
            device.device_id().to_owned(),
            RoomKeyWithheldContent::EVENT_TYPE,
            serde_json::to_value(content)?,
        ))
    }

    /// Handle a single incoming key request.
    async fn handle_key_request(
        &self,
        event: &RoomKeyRequestEvent,
    ) -> OlmResult<KeyRequestOutcome> {
        let Some(key_info) = &event.content.body else {
            warn!(
                sender = ?event.sender,
                requesting_device_id = ?event.content.requesting_device_id,
                "Received a key request without any key info"
            );
            return Ok(KeyRequestOutcome::Ignored);
        };

        let Some(device) =
            self.store.get_device(&event.sender, &event.content.requesting_device_id).await?
        else {
            warn!(
                sender = ?event.sender,
                requesting_device_id = ?event.content.requesting_device_id,
                "Received a key request from an unknown device"
            );
            return Ok(KeyRequestOutcome::Ignored);
        };

        let session =
            self.store.get_inbound_group_session(&key_info.room_id, &key_info.session_id).await?;

        let Some(session) = session else {
            debug!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                session_id = key_info.session_id,
                room_id = ?key_info.room_id,
                "Received a room key request for an unknown inbound group session"
            );

            return match key_info.sender_key {
                Some(sender_key) => Ok(KeyRequestOutcome::Withheld(self.withheld_response(
                    &device,
                    &key_info.room_id,
                    &key_info.session_id,
                    sender_key,
                    WithheldCode::Unavailable,
                )?)),
                None => Ok(KeyRequestOutcome::Ignored),
            };
        };

        match self.should_share_key(&device, &session).await {
            Err(e) => {
                if let KeyForwardDecision::ChangedSenderKey = e {
                    warn!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        "Received a key request from a device that changed its Curve25519 key"
                    );
                } else {
                    debug!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        reason = ?e,
                        "Received a key request that we won't serve"
                    );
                }

                let code = match e {
                    KeyForwardDecision::Blacklisted => WithheldCode::Blacklisted,
                    _ => WithheldCode::Unauthorised,
                };

                Ok(KeyRequestOutcome::Withheld(self.withheld_response(
                    &device,
                    session.room_id(),
                    session.session_id(),
                    session.sender_key(),
                    code,
                )?))
            }
            Ok(message_index) => {
                info!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    session_id = key_info.session_id,
                    room_id = ?key_info.room_id,
                    ?message_index,
                    "Serving a room key request"
                );

                match self.share_session(&session, &device, message_index).await {
                    Ok((used_session, request)) => {
                        Ok(KeyRequestOutcome::Forwarded(used_session, request))
                    }
                    Err(OlmError::MissingSession) => {
                        info!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            session_id = key_info.session_id,
                            "Key request is missing an Olm session, putting the request in the \
                             wait queue"
                        );
                        self.handle_key_share_without_session(&device, key_info, event);

                        Ok(KeyRequestOutcome::Queued)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn share_session(
        &self,
        session: &InboundGroupSession,
        device: &DeviceData,
        message_index: Option<u32>,
    ) -> OlmResult<(Session, ToDeviceRequest)> {
        let export = match message_index {
            Some(index) => session.export_at_index(index).await,
            None => session.export().await,
        };

        let content = serde_json::to_value(ForwardedRoomKeyContent::from(export))?;
        let (used_session, encrypted) =
            encrypt_for_device(&self.store, device, ForwardedRoomKeyContent::EVENT_TYPE, content)
                .await?;

        let request = ToDeviceRequest::new(
            device.user_id(),
            device.device_id().to_owned(),
            ToDeviceEncryptedEventContent::EVENT_TYPE,
            serde_json::to_value(encrypted)?,
        );

        Ok((used_session, request))
    }

    /// Check if it's ok to share a session with the given device.
    ///
    /// * Our own verified devices get the session in full, starting from the
    ///   earliest known index.
    ///
    /// * Other devices get the session only if we originally shared it with
    ///   them, and only from the message index they got it at. This is
    ///   recorded in the outbound session.
    ///
    /// * Blacklisted devices never get it.
    ///
    /// Returns `Ok(None)` to share from the earliest known index,
    /// `Ok(Some(i))` to share from index `i`, or the reason for the refusal.
    async fn should_share_key(
        &self,
        device: &DeviceData,
        session: &InboundGroupSession,
    ) -> Result<Option<u32>, KeyForwardDecision> {
        if device.is_blacklisted() {
            return Err(KeyForwardDecision::Blacklisted);
        }

        let outbound_session = self
            .outbound_group_sessions
            .get_with_id(session.room_id(), session.session_id())
            .await
            .ok()
            .flatten();

        if device.user_id() == self.user_id() && device.is_verified() {
            Ok(None)
        } else if let Some(outbound) = outbound_session {
            match outbound.is_shared_with(device) {
                ShareState::Shared(message_index) => Ok(Some(message_index)),
                ShareState::SharedButChangedSenderKey => Err(KeyForwardDecision::ChangedSenderKey),
                ShareState::NotShared => Err(KeyForwardDecision::OutboundSessionNotShared),
            }
        } else if device.user_id() == self.user_id() {
            Err(KeyForwardDecision::UntrustedDevice)
        } else {
            Err(KeyForwardDecision::MissingOutboundSession)
        }
    }

    /// The devices a key request for a session of the given sender is sent
    /// to.
    ///
    /// These are all of our other devices, and the device of the sender if we
    /// verified it.
    async fn key_request_recipients(
        &self,
        sender: &UserId,
        sender_key: Option<Curve25519PublicKey>,
    ) -> StoreResult<Vec<(OwnedUserId, DeviceIdOrAllDevices)>> {
        let mut recipients: Vec<_> = self
            .store
            .get_own_other_devices()
            .await?
            .into_values()
            .filter(|d| !d.is_blacklisted())
            .map(|d| {
                (d.user_id().to_owned(), DeviceIdOrAllDevices::DeviceId(d.device_id().to_owned()))
            })
            .collect();

        if sender != self.user_id() {
            if let Some(sender_key) = sender_key {
                let device = self.store.get_device_from_curve_key(sender, sender_key).await?;

                if let Some(device) = device.filter(|d| d.is_verified()) {
                    recipients.push((
                        sender.to_owned(),
                        DeviceIdOrAllDevices::DeviceId(device.device_id().to_owned()),
                    ));
                }
            }
        }

        Ok(recipients)
    }

    fn key_info_for_event(room_id: &RoomId, event: &EncryptedEvent) -> RequestedKeyInfo {
        RequestedKeyInfo::new(
            room_id.to_owned(),
            event.content.sender_key,
            event.content.session_id.clone(),
        )
    }

    /// Create and send a request for the room key of the given event.
    ///
    /// Nothing is sent if a request for the key is already outstanding, or
    /// if there is nobody to ask.
    ///
    /// Returns `true` if a new request was sent out.
    #[instrument(skip_all, fields(?room_id, session_id = event.content.session_id))]
    pub(crate) async fn request_key(
        &self,
        room_id: &RoomId,
        event: &EncryptedEvent,
    ) -> OlmResult<bool> {
        let key_info = Self::key_info_for_event(room_id, event);

        if self.store.get_key_request_by_info(&key_info).await?.is_some() {
            trace!("A request for the room key is already outstanding");
            return Ok(false);
        }

        self.request_key_helper(key_info, &event.sender, event.content.sender_key).await
    }

    /// Cancel the outstanding request for the room key of the given event,
    /// if any, and send a new one.
    #[instrument(skip_all, fields(?room_id, session_id = event.content.session_id))]
    pub(crate) async fn re_request_key(
        &self,
        room_id: &RoomId,
        event: &EncryptedEvent,
    ) -> OlmResult<bool> {
        let key_info = Self::key_info_for_event(room_id, event);

        if let Some(request) = self.store.get_key_request_by_info(&key_info).await? {
            debug!(request_id = ?request.request_id, "Cancelling the outstanding key request");

            if request.sent_out {
                let cancellation = request.to_cancellation(self.device_id());
                self.transport.send_to_device(&cancellation).await?;
            }

            self.store.delete_outgoing_key_request(&request.request_id).await?;
        }

        self.request_key_helper(key_info, &event.sender, event.content.sender_key).await
    }

    async fn request_key_helper(
        &self,
        key_info: RequestedKeyInfo,
        sender: &UserId,
        sender_key: Option<Curve25519PublicKey>,
    ) -> OlmResult<bool> {
        let recipients = self.key_request_recipients(sender, sender_key).await?;

        if recipients.is_empty() {
            debug!("There are no devices to request the room key from");
            return Ok(false);
        }

        let request = GossipRequest::new(key_info, recipients);
        info!(request_id = ?request.request_id, "Requesting a room key");

        self.save_outgoing_key_info(request.clone()).await?;
        self.send_request(request).await?;

        Ok(true)
    }

    /// Send a stored key request and remember that it went out.
    async fn send_request(&self, mut request: GossipRequest) -> OlmResult<()> {
        let to_device = request.to_request(self.device_id());
        self.transport.send_to_device(&to_device).await?;

        trace!(request_id = ?request.request_id, "Marking outgoing key request as sent");
        request.sent_out = true;
        self.save_outgoing_key_info(request).await?;

        Ok(())
    }

    /// Send out the stored key requests the transport failed to deliver
    /// earlier.
    pub(crate) async fn send_unsent_requests(&self) -> OlmResult<usize> {
        let unsent = self.store.get_unsent_key_requests().await?;
        let count = unsent.len();

        for request in unsent {
            self.send_request(request).await?;
        }

        Ok(count)
    }

    async fn save_outgoing_key_info(&self, info: GossipRequest) -> StoreResult<()> {
        self.store.save_changes(Changes { key_requests: vec![info], ..Default::default() }).await
    }

    /// Mark the given outgoing key request as done, cancelling it on the
    /// devices we sent it to.
    async fn mark_as_done(&self, request: &GossipRequest) -> OlmResult<()> {
        trace!(
            request_id = ?request.request_id,
            "Received the requested key, removing the request"
        );

        self.store.delete_outgoing_key_request(&request.request_id).await?;

        if request.sent_out {
            let cancellation = request.to_cancellation(self.device_id());

            if let Err(e) = self.transport.send_to_device(&cancellation).await {
                warn!(error = ?e, "Couldn't cancel a fulfilled key request");
            }
        }

        Ok(())
    }

    /// Receive a forwarded room key, decrypted from an Olm message of the
    /// device with the given key.
    ///
    /// The key is accepted if we requested it and it comes either from one of
    /// our own verified devices or from the verified device that created the
    /// session. Room history shared with us on invite is accepted if we
    /// accept such keys.
    ///
    /// Returns the session if it's new or better than the copy we have, it
    /// has already been saved.
    #[instrument(
        skip_all,
        fields(?sender, session_id = content.session_id, room_id = ?content.room_id)
    )]
    pub(crate) async fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> OlmResult<Option<InboundGroupSession>> {
        let info = RequestedKeyInfo::new(
            content.room_id.clone(),
            Some(content.claimed_sender_key),
            content.session_id.clone(),
        );

        let request = self.store.get_key_request_by_info(&info).await?;
        let device = self.store.get_device_from_curve_key(sender, sender_key).await?;

        let from_own_verified_device = device
            .as_ref()
            .is_some_and(|d| d.user_id() == self.user_id() && d.is_verified());
        let from_session_creator = sender_key == content.claimed_sender_key
            && device.as_ref().is_some_and(|d| d.is_verified());
        let requested =
            request.is_some() && (from_own_verified_device || from_session_creator);
        let shared_history = content.shared_history
            && device.is_some()
            && self.settings.read().share_keys_on_invite;

        if !requested && !shared_history {
            warn!(
                ?sender_key,
                claimed_sender_key = ?content.claimed_sender_key,
                has_request = request.is_some(),
                from_own_verified_device,
                from_session_creator,
                "Received a forwarded room key we won't accept"
            );
            return Ok(None);
        }

        let session = match InboundGroupSession::from_forwarded_key(sender_key, content) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    ?sender_key,
                    error = ?e,
                    "Couldn't create a group session from a forwarded room key"
                );
                return Ok(None);
            }
        };

        let first_known_index = session.first_known_index();
        let session = self.store.merge_received_group_session(session).await?;

        if let Some(session) = &session {
            self.store.save_inbound_group_sessions(&[session.clone()]).await?;
        }

        if requested {
            if let Some(request) = request {
                // A key that can't decrypt the whole session doesn't end the
                // request, a better one may still arrive.
                if first_known_index == 0 {
                    self.mark_as_done(&request).await?;
                }
            }
        }

        Ok(session)
    }

    /// Remember that the sender of a room key refused to share it with us.
    pub(crate) async fn receive_withheld(&self, event: &RoomKeyWithheldEvent) -> StoreResult<()> {
        let content = &event.content;

        let (Some(room_id), Some(session_id)) = (&content.room_id, &content.session_id) else {
            debug!(
                sender = ?event.sender,
                code = ?content.code,
                "Received a withheld notice that isn't about a room key"
            );
            return Ok(());
        };

        info!(
            sender = ?event.sender,
            ?room_id,
            session_id,
            code = ?content.code,
            "The sender withheld a room key from us"
        );

        let mut changes = Changes::default();
        changes
            .withheld_session_info
            .entry(room_id.to_owned())
            .or_default()
            .insert(session_id.to_owned(), content.clone());

        self.store.save_changes(changes).await
    }
}
