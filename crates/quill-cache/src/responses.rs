// Copyright 2025 The Quill Authors
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

//! Inputs handed to the cache by the network layer.
//!
//! These are already validated upstream; the cache treats them as data. The
//! shapes mirror the server responses closely enough that the HTTP layer can
//! deserialize straight into them.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    crypto::{CrossSigningKey, DeviceKeys},
    events::{PresenceSnapshot, StateEventRecord, TimelineEventRecord},
};

/// A full sync response, the input of `save_state`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: RoomUpdates,
    #[serde(default)]
    pub presence: Vec<PresenceUpdate>,
    #[serde(default)]
    pub account_data: Vec<AccountDataEvent>,
    #[serde(default)]
    pub device_lists: DeviceLists,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomUpdates {
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoomUpdate>,
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoomUpdate>,
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoomUpdate>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinedRoomUpdate {
    /// State delta between syncs, before the timeline.
    #[serde(default)]
    pub state: Vec<StateEventRecord>,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub account_data: Vec<AccountDataEvent>,
    /// Read receipts from the ephemeral section, keyed by event.
    #[serde(default)]
    pub receipts: BTreeMap<OwnedEventId, BTreeMap<OwnedUserId, u64>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<TimelineEventRecord>,
    /// The server elided events between this batch and what we have.
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvitedRoomUpdate {
    #[serde(default)]
    pub invite_state: Vec<StateEventRecord>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeftRoomUpdate {}

/// An account data event, global or per room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountDataEvent {
    pub kind: String,
    #[serde(default)]
    pub content: JsonValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub sender: OwnedUserId,
    #[serde(default)]
    pub content: PresenceSnapshot,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// A paginated `/messages` response, the input of `save_old_messages`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub start: String,
    /// Token to resume pagination from; absent when history is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Events ordered from newest to oldest.
    #[serde(default)]
    pub chunk: Vec<TimelineEventRecord>,
}

/// A `/keys/query` response, the input of `update_user_keys`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    #[serde(default)]
    pub master_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    #[serde(default)]
    pub self_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
    #[serde(default)]
    pub user_signing_keys: BTreeMap<OwnedUserId, CrossSigningKey>,
}
