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

//! Change notifications.
//!
//! Every mutation that the UI cares about publishes a [`CacheSignal`] on a
//! broadcast channel *after* the writing transaction has committed, so a
//! subscriber that re-reads the cache always observes the committed state.

use std::collections::BTreeMap;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};

/// A typed change notification emitted by the cache.
#[derive(Clone, Debug)]
pub enum CacheSignal {
    /// Setup finished and the bootstrapped secrets are loaded.
    DatabaseReady,
    /// New read receipts were stored for the given events.
    NewReadReceipts {
        room_id: OwnedRoomId,
        event_ids: Vec<OwnedEventId>,
    },
    /// The unread status of these rooms was recomputed.
    RoomReadStatus { status: BTreeMap<OwnedRoomId, bool> },
    /// Rooms were left or forgotten and their stores removed.
    RoomsRemoved { room_ids: Vec<OwnedRoomId> },
    /// A key query response was stored for these users.
    UserKeysUpdate {
        sync_token: String,
        user_ids: Vec<OwnedUserId>,
    },
    /// The key cache entry for this user reached its final state for the
    /// current query round. Parked `query_keys` callbacks drain on this.
    UserKeysUpdateFinalize { user_id: OwnedUserId },
    /// The verification record of this user changed.
    VerificationStatusChanged { user_id: OwnedUserId },
    /// The verification record of the local user changed.
    SelfVerificationStatusChanged,
    /// A secret was stored or deleted.
    SecretChanged { name: String },
}
