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

//! Persistent client-side cache for the Quill Matrix client.
//!
//! One embedded database mirrors the federated conversation graph on local
//! disk: room state and membership, per-room timelines with stable ordering
//! across pagination, account data, presence and receipts, long-lived crypto
//! session pickles, and a small secret vault bridged to the OS keychain.
//! The sync loop feeds it whole responses through [`Cache::save_state`]; the
//! UI reads it synchronously and subscribes to [`CacheSignal`]s for changes.
//!
//! All of it lives in one [`redb`] environment: writes are serialized by a
//! single writer lock and commit atomically, readers run against an MVCC
//! snapshot without ever blocking the writer.

#![warn(missing_debug_implementations)]

mod account;
pub mod crypto;
mod db;
mod encode;
pub mod error;
pub mod events;
pub mod responses;
pub mod secrets;
pub mod signals;
mod state;
mod sync;
mod timeline;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc, Mutex, RwLock},
};

use once_cell::sync::Lazy;
use ruma::{OwnedUserId, UserId};
use tokio::sync::broadcast;
use tracing::info;
use zeroize::Zeroizing;

pub use crate::{
    error::{CacheError, Result},
    signals::CacheSignal,
};
use crate::{crypto::UserKeyCache, secrets::SecretBackend};

const DB_FILE_NAME: &str = "quill-cache.redb";
const SIGNAL_CAPACITY: usize = 64;

pub(crate) type KeyQueryCallback = Box<dyn FnOnce(Option<UserKeyCache>) + Send>;

/// The cache handle. One instance per logged-in user; open it with
/// [`Cache::open`] or through the process-wide [`init`]/[`client`] pair.
pub struct Cache {
    pub(crate) db: redb::Database,
    path: PathBuf,
    pub(crate) local_user: OwnedUserId,
    pub(crate) signals: broadcast::Sender<CacheSignal>,
    pub(crate) backend: Arc<dyn SecretBackend>,
    pub(crate) secret_mirror: Mutex<HashMap<String, Zeroizing<String>>>,
    pub(crate) pending_key_queries: Mutex<HashMap<OwnedUserId, Vec<KeyQueryCallback>>>,
    pub(crate) database_ready: AtomicBool,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("path", &self.path)
            .field("local_user", &self.local_user)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Open or create the cache under `dir`, using the OS keychain for
    /// external secrets. Runs migrations; a failure leaves nothing half
    /// initialized, it just returns the error.
    pub fn open(dir: impl AsRef<Path>, local_user: &UserId) -> Result<Self> {
        Self::open_with_backend(dir, local_user, Arc::new(secrets::OsKeychain))
    }

    /// Open with a custom secret backend; tests use an in-memory keychain.
    pub fn open_with_backend(
        dir: impl AsRef<Path>,
        local_user: &UserId,
        backend: Arc<dyn SecretBackend>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let db = redb::Database::create(dir.join(DB_FILE_NAME))?;
        Self::run_migrations(&db)?;
        info!(path = %dir.display(), user = %local_user, "cache opened");

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Ok(Self {
            db,
            path: dir,
            local_user: local_user.to_owned(),
            signals,
            backend,
            secret_mirror: Mutex::new(HashMap::new()),
            pending_key_queries: Mutex::new(HashMap::new()),
            database_ready: AtomicBool::new(false),
        })
    }

    /// Subscribe to change notifications. Signals are sent after the
    /// transaction that caused them committed.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheSignal> {
        self.signals.subscribe()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the cache and remove everything it stored on disk.
    pub fn delete_data(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Self::delete_data_at(&path)
    }

    /// Remove a cache directory. Safe to call before any use.
    pub fn delete_data_at(path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

static CLIENT: Lazy<RwLock<Option<Arc<Cache>>>> = Lazy::new(|| RwLock::new(None));

/// Initialize the process-wide cache handle. Lives from login to logout;
/// initializing twice without [`teardown`] is an error, and so is opening
/// the same directory from two handles.
pub fn init(dir: impl AsRef<Path>, local_user: &UserId) -> Result<Arc<Cache>> {
    init_with_backend(dir, local_user, Arc::new(secrets::OsKeychain))
}

pub fn init_with_backend(
    dir: impl AsRef<Path>,
    local_user: &UserId,
    backend: Arc<dyn SecretBackend>,
) -> Result<Arc<Cache>> {
    let mut guard = CLIENT.write().expect("client lock poisoned");
    if guard.is_some() {
        return Err(CacheError::AlreadyInitialized);
    }
    let cache = Arc::new(Cache::open_with_backend(dir, local_user, backend)?);
    *guard = Some(Arc::clone(&cache));
    Ok(cache)
}

/// The process-wide cache handle; fails fast before [`init`].
pub fn client() -> Result<Arc<Cache>> {
    CLIENT
        .read()
        .expect("client lock poisoned")
        .clone()
        .ok_or(CacheError::DatabaseUninitialized)
}

/// Drop the process-wide handle at logout. Pending background operations
/// keep their own reference and complete against the old instance.
pub fn teardown() -> Option<Arc<Cache>> {
    CLIENT.write().expect("client lock poisoned").take()
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::{collections::BTreeMap, sync::Arc};

    use ruma::{user_id, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::{
        events::{kinds, StateEventRecord, TimelineEventRecord},
        responses::{JoinedRoomUpdate, SyncResponse, Timeline},
        secrets::testing::MemoryKeychain,
        Cache,
    };

    pub(crate) const LOCAL_USER: &str = "@self:example.org";

    pub(crate) fn test_cache() -> (TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with_backend(
            dir.path(),
            user_id!("@self:example.org"),
            Arc::new(MemoryKeychain::default()),
        )
        .unwrap();
        (dir, cache)
    }

    pub(crate) fn message_event(event_id: &str, sender: &str, ts: u64) -> TimelineEventRecord {
        serde_json::from_value(json!({
            "event_id": event_id,
            "sender": sender,
            "origin_server_ts": ts,
            "kind": "m.room.message",
            "content": { "msgtype": "m.text", "body": format!("message {event_id}") },
        }))
        .unwrap()
    }

    pub(crate) fn state_event(
        event_id: &str,
        kind: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> StateEventRecord {
        serde_json::from_value(json!({
            "event_id": event_id,
            "sender": LOCAL_USER,
            "origin_server_ts": 1_700_000_000_000u64,
            "kind": kind,
            "state_key": state_key,
            "content": content,
        }))
        .unwrap()
    }

    pub(crate) fn timeline_state_event(
        event_id: &str,
        kind: &str,
        state_key: &str,
        content: serde_json::Value,
        ts: u64,
    ) -> TimelineEventRecord {
        serde_json::from_value(json!({
            "event_id": event_id,
            "sender": LOCAL_USER,
            "origin_server_ts": ts,
            "kind": kind,
            "state_key": state_key,
            "content": content,
        }))
        .unwrap()
    }

    pub(crate) fn member_event(event_id: &str, user: &str, name: &str) -> StateEventRecord {
        state_event(
            event_id,
            kinds::ROOM_MEMBER,
            user,
            json!({ "membership": "join", "displayname": name }),
        )
    }

    pub(crate) fn sync_with_joined_room(
        room_id: &RoomId,
        next_batch: &str,
        update: JoinedRoomUpdate,
    ) -> SyncResponse {
        let mut response = SyncResponse { next_batch: next_batch.to_owned(), ..Default::default() };
        response.rooms.join.insert(room_id.to_owned(), update);
        response
    }

    pub(crate) fn joined_update(
        state: Vec<StateEventRecord>,
        events: Vec<TimelineEventRecord>,
        prev_batch: Option<&str>,
    ) -> JoinedRoomUpdate {
        JoinedRoomUpdate {
            state,
            timeline: Timeline {
                events,
                limited: false,
                prev_batch: prev_batch.map(str::to_owned),
            },
            ..Default::default()
        }
    }

    pub(crate) fn receipts_for(
        event_id: OwnedEventId,
        user: OwnedUserId,
        ts: u64,
    ) -> BTreeMap<OwnedEventId, BTreeMap<OwnedUserId, u64>> {
        BTreeMap::from([(event_id, BTreeMap::from([(user, ts)]))])
    }

    pub(crate) fn room(id: &str) -> OwnedRoomId {
        RoomId::parse(id).unwrap()
    }
}
