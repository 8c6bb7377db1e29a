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

//! The crypto session store.
//!
//! Sessions are stored as opaque pickles produced by the crypto engine; the
//! cache never unpickles them. Losing an inbound Megolm session makes the
//! history it protected undecryptable forever, so these stores are only ever
//! written through committed (fsynced) transactions and are never touched by
//! the old-data sweeper.

use std::collections::{BTreeMap, BTreeSet};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    db::{self, tables, WriteCtx},
    encode::EncodeKey,
    error::Result,
    responses::KeysQueryResponse,
    signals::CacheSignal,
    Cache,
};

const OLM_ACCOUNT_KEY: &[u8] = b"account";
const BACKUP_VERSION_KEY: &[u8] = b"backup_version";

/// Uploaded device keys of one device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    #[serde(default)]
    pub algorithms: Vec<String>,
    /// `algorithm:device_id` → base64 public key.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// A cross-signing key (master, self-signing or user-signing).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    #[serde(default)]
    pub usage: Vec<String>,
    /// `algorithm:key_id` → base64 public key.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<String, String>>,
}

impl CrossSigningKey {
    /// The key material itself, independent of its id.
    pub fn first_key(&self) -> Option<&str> {
        self.keys.values().next().map(String::as_str)
    }
}

/// Cached `/keys/query` result for one user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserKeyCache {
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedDeviceId, DeviceKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_keys: Option<CrossSigningKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signing_keys: Option<CrossSigningKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signing_keys: Option<CrossSigningKey>,
    /// Sync token at the time of the last successful query.
    #[serde(default)]
    pub updated_at: String,
    /// Sync token that invalidated this entry, when `outdated`.
    #[serde(default)]
    pub last_changed: String,
    /// A re-query is required before this entry may be trusted.
    #[serde(default)]
    pub outdated: bool,
}

/// Locally stored verification decisions about one user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationCache {
    /// Master key material we decided to trust for this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_master_key: Option<String>,
    #[serde(default)]
    pub device_verified: BTreeSet<OwnedDeviceId>,
    #[serde(default)]
    pub device_blocked: BTreeSet<OwnedDeviceId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trust {
    Unverified,
    /// Trust on first use: nothing contradicts the keys, nobody verified
    /// them either.
    Tofu,
    Verified,
}

#[derive(Clone, Debug)]
pub struct VerificationStatus {
    pub user_verified: Trust,
    pub verified_devices: Vec<OwnedDeviceId>,
}

/// Identifies an inbound Megolm session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmSessionIndex {
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub sender_key: String,
}

/// Metadata travelling with an inbound Megolm session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSessionData {
    /// Earliest message index this session can decrypt.
    #[serde(default)]
    pub first_known_index: u64,
    #[serde(default)]
    pub sender_claimed_ed25519_key: String,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// Whether the sending device was trusted when the key arrived.
    #[serde(default)]
    pub trusted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    pub pickle: String,
    #[serde(default)]
    pub data: GroupSessionData,
}

fn default_rotation_period_ms() -> u64 {
    // One week, the protocol default.
    604_800_000
}

fn default_rotation_period_msgs() -> u64 {
    100
}

/// Metadata of the active outbound Megolm session of a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundGroupSessionData {
    pub session_id: String,
    #[serde(default)]
    pub creation_ts: u64,
    #[serde(default)]
    pub message_index: u64,
    #[serde(default = "default_rotation_period_ms")]
    pub rotation_period_ms: u64,
    #[serde(default = "default_rotation_period_msgs")]
    pub rotation_period_msgs: u64,
    /// Devices this session was shared with.
    #[serde(default)]
    pub shared_with: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundGroupSessionRecord {
    pub pickle: String,
    pub data: OutboundGroupSessionData,
}

/// A pairwise Olm session with a peer device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmSessionRecord {
    pub session_id: String,
    pub pickle: String,
    #[serde(default)]
    pub last_use_ts: u64,
}

/// Descriptor of the server-side online key backup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineBackupVersion {
    pub version: String,
    #[serde(default)]
    pub algorithm: String,
    #[serde(default)]
    pub auth_public_key: String,
    /// Pickled private key, when the backup can be written locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
}

/// One session in a user-initiated key export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedSession {
    pub room_id: OwnedRoomId,
    pub sender_key: String,
    pub session_id: String,
    pub pickle: String,
    #[serde(default)]
    pub data: GroupSessionData,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExportedSessionKeys {
    pub sessions: Vec<ExportedSession>,
}

fn inbound_key(index: &MegolmSessionIndex) -> Vec<u8> {
    (index.room_id.as_str(), index.sender_key.as_str(), index.session_id.as_str()).encode()
}

impl Cache {
    //
    // Outbound Megolm
    //

    /// Store a freshly rotated outbound session for a room.
    pub fn save_outbound_megolm_session(
        &self,
        room_id: &RoomId,
        data: &OutboundGroupSessionData,
        pickle: &str,
    ) -> Result<()> {
        let record =
            OutboundGroupSessionRecord { pickle: pickle.to_owned(), data: data.clone() };
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::OUTBOUND_MEGOLM)?;
            table.insert(room_id.encode().as_slice(), db::encode_value(&record)?.as_slice())?;
            Ok(())
        })
    }

    /// Refresh the metadata (message counter, shared-with set) of the
    /// current session without rotating it.
    pub fn update_outbound_megolm_session(
        &self,
        room_id: &RoomId,
        data: &OutboundGroupSessionData,
        pickle: &str,
    ) -> Result<()> {
        self.save_outbound_megolm_session(room_id, data, pickle)
    }

    /// Delete the active session; the next encrypt will create a new one.
    pub fn drop_outbound_megolm_session(&self, room_id: &RoomId) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::OUTBOUND_MEGOLM)?;
            table.remove(room_id.encode().as_slice())?;
            Ok(())
        })
    }

    pub fn get_outbound_megolm_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::OUTBOUND_MEGOLM)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &room_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub fn outbound_megolm_session_exists(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.get_outbound_megolm_session(room_id)?.is_some())
    }

    //
    // Inbound Megolm
    //

    /// Store an inbound session. On a collision the session that knows more
    /// history wins: the lower first-known-index is kept, metadata follows
    /// the retained session. Returns whether the new session was stored.
    pub fn save_inbound_megolm_session(
        &self,
        index: &MegolmSessionIndex,
        record: InboundGroupSessionRecord,
    ) -> Result<bool> {
        self.write_with(|ctx| self.save_inbound_megolm_session_tx(ctx, index, record))
    }

    fn save_inbound_megolm_session_tx(
        &self,
        ctx: &WriteCtx,
        index: &MegolmSessionIndex,
        record: InboundGroupSessionRecord,
    ) -> Result<bool> {
        let mut table = db::open_table(ctx, tables::INBOUND_MEGOLM)?;
        let key = inbound_key(index);
        if let Some(existing) = db::get_raw(&table, &key)?
            .and_then(|bytes| db::decode_value::<InboundGroupSessionRecord>(&bytes))
        {
            if existing.data.first_known_index <= record.data.first_known_index {
                return Ok(false);
            }
        }
        table.insert(key.as_slice(), db::encode_value(&record)?.as_slice())?;
        Ok(true)
    }

    pub fn get_inbound_megolm_session(&self, index: &MegolmSessionIndex) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::INBOUND_MEGOLM)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &inbound_key(index))?
                .and_then(|b| db::decode_value::<InboundGroupSessionRecord>(&b))
                .map(|record| record.pickle))
        })
    }

    pub fn inbound_megolm_session_exists(&self, index: &MegolmSessionIndex) -> Result<bool> {
        Ok(self.get_megolm_session_data(index)?.is_some())
    }

    pub fn get_megolm_session_data(
        &self,
        index: &MegolmSessionIndex,
    ) -> Result<Option<GroupSessionData>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::INBOUND_MEGOLM)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &inbound_key(index))?
                .and_then(|b| db::decode_value::<InboundGroupSessionRecord>(&b))
                .map(|record| record.data))
        })
    }

    /// Every stored inbound session, for user-initiated key export.
    pub fn export_session_keys(&self) -> Result<ExportedSessionKeys> {
        self.read_with(|txn| {
            let mut out = ExportedSessionKeys::default();
            let Some(table) = db::open_read(txn, tables::INBOUND_MEGOLM)? else {
                return Ok(out);
            };
            for (key, value) in db::scan_prefix(&table, b"")? {
                let parts = crate::encode::split_key(&key);
                let [room, sender_key, session_id] = parts[..] else { continue };
                let (Ok(room), Ok(sender_key), Ok(session_id)) = (
                    std::str::from_utf8(room),
                    std::str::from_utf8(sender_key),
                    std::str::from_utf8(session_id),
                ) else {
                    continue;
                };
                let Ok(room_id) = RoomId::parse(room) else { continue };
                let Some(record) = db::decode_value::<InboundGroupSessionRecord>(&value) else {
                    continue;
                };
                out.sessions.push(ExportedSession {
                    room_id,
                    sender_key: sender_key.to_owned(),
                    session_id: session_id.to_owned(),
                    pickle: record.pickle,
                    data: record.data,
                });
            }
            Ok(out)
        })
    }

    /// Merge exported sessions; keeping a better-indexed existing session is
    /// a silent merge, not an error. Returns the number of sessions stored.
    pub fn import_session_keys(&self, keys: &ExportedSessionKeys) -> Result<u64> {
        self.write_with(|ctx| {
            let mut imported = 0;
            for session in &keys.sessions {
                let index = MegolmSessionIndex {
                    room_id: session.room_id.clone(),
                    session_id: session.session_id.clone(),
                    sender_key: session.sender_key.clone(),
                };
                let record = InboundGroupSessionRecord {
                    pickle: session.pickle.clone(),
                    data: session.data.clone(),
                };
                if self.save_inbound_megolm_session_tx(ctx, &index, record)? {
                    imported += 1;
                }
            }
            Ok(imported)
        })
    }

    //
    // Olm sessions
    //

    pub fn save_olm_session(&self, curve25519: &str, record: OlmSessionRecord) -> Result<()> {
        self.save_olm_sessions(vec![(curve25519.to_owned(), record)])
    }

    pub fn save_olm_sessions(&self, sessions: Vec<(String, OlmSessionRecord)>) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::OLM_SESSIONS)?;
            for (curve25519, record) in &sessions {
                table.insert(
                    (curve25519.as_str(), record.session_id.as_str()).encode().as_slice(),
                    db::encode_value(record)?.as_slice(),
                )?;
            }
            Ok(())
        })
    }

    /// Ids of all sessions with a peer key.
    pub fn get_olm_sessions(&self, curve25519: &str) -> Result<Vec<String>> {
        Ok(self
            .olm_session_records(curve25519)?
            .into_iter()
            .map(|record| record.session_id)
            .collect())
    }

    pub fn get_olm_session(&self, curve25519: &str, session_id: &str) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::OLM_SESSIONS)? else { return Ok(None) };
            Ok(db::get_raw(&table, &(curve25519, session_id).encode())?
                .and_then(|b| db::decode_value::<OlmSessionRecord>(&b))
                .map(|record| record.pickle))
        })
    }

    /// The most recently used session with a peer key.
    pub fn get_latest_olm_session(&self, curve25519: &str) -> Result<Option<OlmSessionRecord>> {
        Ok(self
            .olm_session_records(curve25519)?
            .into_iter()
            .max_by_key(|record| record.last_use_ts))
    }

    fn olm_session_records(&self, curve25519: &str) -> Result<Vec<OlmSessionRecord>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::OLM_SESSIONS)? else {
                return Ok(Vec::new());
            };
            Ok(db::scan_prefix(&table, &curve25519.encode())?
                .into_iter()
                .filter_map(|(_, value)| db::decode_value(&value))
                .collect())
        })
    }

    //
    // Olm account & online backup
    //

    pub fn save_olm_account(&self, pickled: &str) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::OLM_ACCOUNT)?;
            table.insert(OLM_ACCOUNT_KEY, pickled.as_bytes())?;
            Ok(())
        })
    }

    pub fn restore_olm_account(&self) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::OLM_ACCOUNT)? else { return Ok(None) };
            Ok(db::get_raw(&table, OLM_ACCOUNT_KEY)?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
        })
    }

    pub fn save_backup_version(&self, backup: &OnlineBackupVersion) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::BACKUP)?;
            table.insert(BACKUP_VERSION_KEY, db::encode_value(backup)?.as_slice())?;
            Ok(())
        })
    }

    pub fn backup_version(&self) -> Result<Option<OnlineBackupVersion>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::BACKUP)? else { return Ok(None) };
            Ok(db::get_raw(&table, BACKUP_VERSION_KEY)?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub fn delete_backup_version(&self) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::BACKUP)?;
            table.remove(BACKUP_VERSION_KEY)?;
            Ok(())
        })
    }

    //
    // Device & user keys
    //

    pub fn user_keys(&self, user_id: &UserId) -> Result<Option<UserKeyCache>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::USER_KEYS)? else { return Ok(None) };
            Ok(db::get_raw(&table, &user_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    /// Store a `/keys/query` response. Users whose entry changed get
    /// `UserKeysUpdate` and `VerificationStatusChanged`; every user named by
    /// the response gets `UserKeysUpdateFinalize`, which also releases parked
    /// `query_keys` callbacks.
    pub fn update_user_keys(&self, sync_token: &str, response: &KeysQueryResponse) -> Result<()> {
        self.write_with(|ctx| {
            let mut users: BTreeSet<OwnedUserId> = BTreeSet::new();
            users.extend(response.device_keys.keys().cloned());
            users.extend(response.master_keys.keys().cloned());
            users.extend(response.self_signing_keys.keys().cloned());
            users.extend(response.user_signing_keys.keys().cloned());

            let mut changed = Vec::new();
            let mut fresh = BTreeMap::new();
            {
                let mut table = db::open_table(ctx, tables::USER_KEYS)?;
                for user_id in &users {
                    let previous: Option<UserKeyCache> = db::get_raw(&table, &user_id.encode())?
                        .and_then(|bytes| db::decode_value(&bytes));
                    let mut record = previous.clone().unwrap_or_default();
                    record.device_keys =
                        response.device_keys.get(user_id).cloned().unwrap_or_default();
                    record.master_keys = response.master_keys.get(user_id).cloned();
                    record.self_signing_keys = response.self_signing_keys.get(user_id).cloned();
                    record.user_signing_keys = response.user_signing_keys.get(user_id).cloned();
                    record.updated_at = sync_token.to_owned();
                    record.outdated = false;

                    if previous.as_ref() != Some(&record) {
                        changed.push(user_id.clone());
                    }
                    table.insert(
                        user_id.encode().as_slice(),
                        db::encode_value(&record)?.as_slice(),
                    )?;
                    fresh.insert(user_id.clone(), record);
                }
            }

            let mut parked = Vec::new();
            {
                let mut pending = self.pending_key_queries.lock().expect("query lock poisoned");
                for user_id in &users {
                    for callback in pending.remove(user_id).unwrap_or_default() {
                        parked.push((callback, fresh.get(user_id).cloned()));
                    }
                }
            }

            let signals = self.signals.clone();
            let local_user = self.local_user.clone();
            let sync_token = sync_token.to_owned();
            let finalize: Vec<OwnedUserId> = users.into_iter().collect();
            ctx.on_commit(move || {
                if !changed.is_empty() {
                    let _ = signals.send(CacheSignal::UserKeysUpdate {
                        sync_token,
                        user_ids: changed.clone(),
                    });
                }
                for user_id in &finalize {
                    let _ = signals
                        .send(CacheSignal::UserKeysUpdateFinalize { user_id: user_id.clone() });
                }
                for user_id in changed {
                    if user_id == local_user {
                        let _ = signals.send(CacheSignal::SelfVerificationStatusChanged);
                    }
                    let _ = signals.send(CacheSignal::VerificationStatusChanged { user_id });
                }
                for (callback, record) in parked {
                    callback(record);
                }
            });
            Ok(())
        })
    }

    /// Flag users whose device lists changed; their cache entries need a
    /// re-query before use.
    pub fn mark_user_keys_out_of_date(&self, user_ids: &[OwnedUserId]) -> Result<()> {
        let token = self.next_batch_token()?.unwrap_or_default();
        self.write_with(|ctx| self.mark_user_keys_out_of_date_tx(ctx, user_ids, &token))
    }

    pub(crate) fn mark_user_keys_out_of_date_tx(
        &self,
        ctx: &WriteCtx,
        user_ids: &[OwnedUserId],
        sync_token: &str,
    ) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut table = db::open_table(ctx, tables::USER_KEYS)?;
        for user_id in user_ids {
            let mut record: UserKeyCache = db::get_raw(&table, &user_id.encode())?
                .and_then(|bytes| db::decode_value(&bytes))
                .unwrap_or_default();
            record.outdated = true;
            record.last_changed = sync_token.to_owned();
            table.insert(user_id.encode().as_slice(), db::encode_value(&record)?.as_slice())?;
        }
        Ok(())
    }

    /// Read the key cache for a user. Fresh entries answer immediately; an
    /// outdated or missing entry parks the callback until the next
    /// `UserKeysUpdateFinalize` that names the user.
    pub fn query_keys(
        &self,
        user_id: &UserId,
        callback: impl FnOnce(Option<UserKeyCache>) + Send + 'static,
    ) -> Result<()> {
        match self.user_keys(user_id)? {
            Some(keys) if !keys.outdated => callback(Some(keys)),
            _ => {
                self.pending_key_queries
                    .lock()
                    .expect("query lock poisoned")
                    .entry(user_id.to_owned())
                    .or_default()
                    .push(Box::new(callback));
            }
        }
        Ok(())
    }

    /// Joined members of a room with their cached keys.
    ///
    /// With `verified_only` the result is restricted to users we verified
    /// and, per user, to the devices we verified.
    pub fn get_members_with_keys(
        &self,
        room_id: &RoomId,
        verified_only: bool,
    ) -> Result<BTreeMap<OwnedUserId, Option<UserKeyCache>>> {
        let mut out = BTreeMap::new();
        for user_id in self.room_members(room_id)? {
            let keys = self.user_keys(&user_id)?;
            if !verified_only {
                out.insert(user_id, keys);
                continue;
            }
            let status = self.verification_status(&user_id)?;
            if status.user_verified != Trust::Verified {
                continue;
            }
            let keys = keys.map(|mut keys| {
                keys.device_keys
                    .retain(|device_id, _| status.verified_devices.contains(device_id));
                keys
            });
            out.insert(user_id, keys);
        }
        Ok(out)
    }

    //
    // Verification
    //

    fn verification_cache(&self, user_id: &UserId) -> Result<Option<VerificationCache>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::VERIFICATION)? else { return Ok(None) };
            Ok(db::get_raw(&table, &user_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub fn mark_device_verified(&self, user_id: &UserId, device_id: &str) -> Result<()> {
        let master = self.user_keys(user_id)?.and_then(|keys| {
            keys.master_keys.as_ref().and_then(|k| k.first_key().map(str::to_owned))
        });
        self.write_with(|ctx| {
            {
                let mut table = db::open_table(ctx, tables::VERIFICATION)?;
                let mut record: VerificationCache = db::get_raw(&table, &user_id.encode())?
                    .and_then(|bytes| db::decode_value(&bytes))
                    .unwrap_or_default();
                record.device_verified.insert(device_id.into());
                // Verifying a device pins the identity seen right now.
                if record.trusted_master_key.is_none() {
                    record.trusted_master_key = master.clone();
                }
                table.insert(user_id.encode().as_slice(), db::encode_value(&record)?.as_slice())?;
            }
            self.emit_verification_changed(ctx, user_id);
            Ok(())
        })
    }

    pub fn mark_device_unverified(&self, user_id: &UserId, device_id: &str) -> Result<()> {
        self.write_with(|ctx| {
            {
                let mut table = db::open_table(ctx, tables::VERIFICATION)?;
                let mut record: VerificationCache = db::get_raw(&table, &user_id.encode())?
                    .and_then(|bytes| db::decode_value(&bytes))
                    .unwrap_or_default();
                record.device_verified.remove(&OwnedDeviceId::from(device_id));
                table.insert(user_id.encode().as_slice(), db::encode_value(&record)?.as_slice())?;
            }
            self.emit_verification_changed(ctx, user_id);
            Ok(())
        })
    }

    fn emit_verification_changed(&self, ctx: &WriteCtx, user_id: &UserId) {
        let signals = self.signals.clone();
        let is_self = user_id == &*self.local_user;
        let user_id = user_id.to_owned();
        ctx.on_commit(move || {
            if is_self {
                let _ = signals.send(CacheSignal::SelfVerificationStatusChanged);
            }
            let _ = signals.send(CacheSignal::VerificationStatusChanged { user_id });
        });
    }

    /// Trust we place in a user, derived from the verification record and
    /// the cached cross-signing keys.
    pub fn verification_status(&self, user_id: &UserId) -> Result<VerificationStatus> {
        let record = self.verification_cache(user_id)?.unwrap_or_default();
        let master = self
            .user_keys(user_id)?
            .and_then(|keys| keys.master_keys.as_ref().and_then(|k| k.first_key().map(str::to_owned)));

        let user_verified = match (&record.trusted_master_key, &master) {
            (Some(trusted), Some(current)) if trusted == current => Trust::Verified,
            // The identity changed underneath us.
            (Some(_), Some(_)) => Trust::Unverified,
            _ => Trust::Tofu,
        };
        let verified_devices = record
            .device_verified
            .iter()
            .filter(|device| !record.device_blocked.contains(*device))
            .cloned()
            .collect();
        Ok(VerificationStatus { user_verified, verified_devices })
    }

    /// Reduce member trust to a room-level value: Verified iff everyone is
    /// verified, Tofu iff nobody is outright unverified.
    pub fn room_verification_status(&self, room_id: &RoomId) -> Result<Trust> {
        let mut all_verified = true;
        let mut any_unverified = false;
        for user_id in self.room_members(room_id)? {
            match self.verification_status(&user_id)?.user_verified {
                Trust::Verified => {}
                Trust::Tofu => all_verified = false,
                Trust::Unverified => {
                    all_verified = false;
                    any_unverified = true;
                }
            }
        }
        Ok(if all_verified {
            Trust::Verified
        } else if any_unverified {
            Trust::Unverified
        } else {
            Trust::Tofu
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::mpsc,
    };

    use ruma::user_id;

    use super::{
        CrossSigningKey, DeviceKeys, ExportedSession, ExportedSessionKeys, GroupSessionData,
        InboundGroupSessionRecord, MegolmSessionIndex, OlmSessionRecord,
        OnlineBackupVersion, OutboundGroupSessionData, Trust,
    };
    use crate::{
        responses::KeysQueryResponse,
        test_utils::{joined_update, member_event, room, sync_with_joined_room, test_cache},
    };

    fn session_index(room_id: &str) -> MegolmSessionIndex {
        MegolmSessionIndex {
            room_id: room(room_id),
            session_id: "session".to_owned(),
            sender_key: "curve-sender".to_owned(),
        }
    }

    fn inbound(pickle: &str, first_known_index: u64) -> InboundGroupSessionRecord {
        InboundGroupSessionRecord {
            pickle: pickle.to_owned(),
            data: GroupSessionData { first_known_index, ..Default::default() },
        }
    }

    fn query_response_for(user: &ruma::UserId, master_key: &str) -> KeysQueryResponse {
        let mut response = KeysQueryResponse::default();
        response.device_keys.insert(
            user.to_owned(),
            BTreeMap::from([(
                "DEVICE".into(),
                DeviceKeys {
                    keys: BTreeMap::from([(
                        "curve25519:DEVICE".to_owned(),
                        "devkey".to_owned(),
                    )]),
                    ..Default::default()
                },
            )]),
        );
        response.master_keys.insert(
            user.to_owned(),
            CrossSigningKey {
                usage: vec!["master".to_owned()],
                keys: BTreeMap::from([(format!("ed25519:{master_key}"), master_key.to_owned())]),
                ..Default::default()
            },
        );
        response
    }

    #[test]
    fn better_indexed_inbound_sessions_win() {
        let (_dir, cache) = test_cache();
        let index = session_index("!e:example.org");

        assert!(cache.save_inbound_megolm_session(&index, inbound("p50", 50)).unwrap());
        // More history wins.
        assert!(cache.save_inbound_megolm_session(&index, inbound("p10", 10)).unwrap());
        assert_eq!(
            cache.get_megolm_session_data(&index).unwrap().unwrap().first_known_index,
            10
        );
        assert_eq!(cache.get_inbound_megolm_session(&index).unwrap().as_deref(), Some("p10"));

        // Less history is a silent no-op.
        assert!(!cache.save_inbound_megolm_session(&index, inbound("p30", 30)).unwrap());
        assert_eq!(
            cache.get_megolm_session_data(&index).unwrap().unwrap().first_known_index,
            10
        );
    }

    #[test]
    fn import_merges_under_the_lower_index_rule() {
        let (_dir, cache) = test_cache();
        let index = session_index("!e:example.org");
        cache.save_inbound_megolm_session(&index, inbound("p50", 50)).unwrap();

        let keys = ExportedSessionKeys {
            sessions: vec![ExportedSession {
                room_id: index.room_id.clone(),
                sender_key: index.sender_key.clone(),
                session_id: index.session_id.clone(),
                pickle: "p10".to_owned(),
                data: GroupSessionData { first_known_index: 10, ..Default::default() },
            }],
        };
        assert_eq!(cache.import_session_keys(&keys).unwrap(), 1);
        assert_eq!(
            cache.get_megolm_session_data(&index).unwrap().unwrap().first_known_index,
            10
        );

        // Re-importing the same export changes nothing.
        assert_eq!(cache.import_session_keys(&keys).unwrap(), 0);
        let exported = cache.export_session_keys().unwrap();
        assert_eq!(exported.sessions.len(), 1);
        assert_eq!(exported.sessions[0].pickle, "p10");
    }

    #[test]
    fn outbound_session_lifecycle() {
        let (_dir, cache) = test_cache();
        let room_id = room("!o:example.org");
        assert!(!cache.outbound_megolm_session_exists(&room_id).unwrap());

        let mut data = OutboundGroupSessionData {
            session_id: "out".to_owned(),
            creation_ts: 1000,
            message_index: 0,
            rotation_period_ms: 604_800_000,
            rotation_period_msgs: 100,
            shared_with: BTreeMap::new(),
        };
        cache.save_outbound_megolm_session(&room_id, &data, "pickle-v1").unwrap();
        assert!(cache.outbound_megolm_session_exists(&room_id).unwrap());

        data.message_index = 7;
        cache.update_outbound_megolm_session(&room_id, &data, "pickle-v2").unwrap();
        let record = cache.get_outbound_megolm_session(&room_id).unwrap().unwrap();
        assert_eq!(record.data.message_index, 7);
        assert_eq!(record.pickle, "pickle-v2");

        cache.drop_outbound_megolm_session(&room_id).unwrap();
        assert!(!cache.outbound_megolm_session_exists(&room_id).unwrap());
    }

    #[test]
    fn latest_olm_session_has_the_highest_timestamp() {
        let (_dir, cache) = test_cache();

        cache
            .save_olm_sessions(vec![
                (
                    "peer".to_owned(),
                    OlmSessionRecord {
                        session_id: "s1".to_owned(),
                        pickle: "p1".to_owned(),
                        last_use_ts: 100,
                    },
                ),
                (
                    "peer".to_owned(),
                    OlmSessionRecord {
                        session_id: "s2".to_owned(),
                        pickle: "p2".to_owned(),
                        last_use_ts: 300,
                    },
                ),
            ])
            .unwrap();
        cache
            .save_olm_session(
                "peer",
                OlmSessionRecord {
                    session_id: "s3".to_owned(),
                    pickle: "p3".to_owned(),
                    last_use_ts: 200,
                },
            )
            .unwrap();

        assert_eq!(cache.get_olm_sessions("peer").unwrap().len(), 3);
        assert_eq!(cache.get_latest_olm_session("peer").unwrap().unwrap().session_id, "s2");
        assert_eq!(cache.get_olm_session("peer", "s3").unwrap().as_deref(), Some("p3"));
        assert!(cache.get_latest_olm_session("stranger").unwrap().is_none());
    }

    #[test]
    fn olm_account_and_backup_round_trip() {
        let (_dir, cache) = test_cache();
        assert!(cache.restore_olm_account().unwrap().is_none());

        cache.save_olm_account("account-pickle").unwrap();
        assert_eq!(cache.restore_olm_account().unwrap().as_deref(), Some("account-pickle"));

        let backup = OnlineBackupVersion {
            version: "3".to_owned(),
            algorithm: "m.megolm_backup.v1.curve25519-aes-sha2".to_owned(),
            auth_public_key: "pub".to_owned(),
            local_key: Some("pickled-private".to_owned()),
        };
        cache.save_backup_version(&backup).unwrap();
        assert_eq!(cache.backup_version().unwrap().unwrap(), backup);
        cache.delete_backup_version().unwrap();
        assert!(cache.backup_version().unwrap().is_none());
    }

    #[test]
    fn outdated_key_queries_park_until_the_next_update() {
        let (_dir, cache) = test_cache();
        let alice = user_id!("@alice:example.org");

        cache.update_user_keys("t1", &query_response_for(alice, "master-a")).unwrap();
        assert!(!cache.user_keys(alice).unwrap().unwrap().outdated);

        // Fresh entry answers immediately.
        let (tx, rx) = mpsc::channel();
        cache
            .query_keys(alice, move |keys| {
                tx.send(keys.is_some()).unwrap();
            })
            .unwrap();
        assert!(rx.try_recv().unwrap());

        cache.mark_user_keys_out_of_date(&[alice.to_owned()]).unwrap();
        assert!(cache.user_keys(alice).unwrap().unwrap().outdated);

        // Outdated entry parks the callback until the update lands.
        let (tx, rx) = mpsc::channel();
        cache
            .query_keys(alice, move |keys| {
                tx.send(keys.map(|k| k.updated_at)).unwrap();
            })
            .unwrap();
        assert!(rx.try_recv().is_err());

        cache.update_user_keys("t2", &query_response_for(alice, "master-a")).unwrap();
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("t2"));
    }

    #[test]
    fn verification_pins_the_master_key() {
        let (_dir, cache) = test_cache();
        let alice = user_id!("@alice:example.org");

        cache.update_user_keys("t1", &query_response_for(alice, "master-a")).unwrap();
        assert_eq!(cache.verification_status(alice).unwrap().user_verified, Trust::Tofu);

        cache.mark_device_verified(alice, "DEVICE").unwrap();
        let status = cache.verification_status(alice).unwrap();
        assert_eq!(status.user_verified, Trust::Verified);
        assert_eq!(status.verified_devices.len(), 1);

        // A replaced master key downgrades the user.
        cache.update_user_keys("t2", &query_response_for(alice, "master-b")).unwrap();
        assert_eq!(
            cache.verification_status(alice).unwrap().user_verified,
            Trust::Unverified
        );

        cache.mark_device_unverified(alice, "DEVICE").unwrap();
        assert!(cache.verification_status(alice).unwrap().verified_devices.is_empty());
    }

    #[test]
    fn room_trust_reduces_over_members() {
        let (_dir, cache) = test_cache();
        let room_id = room("!t:example.org");
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        let update = joined_update(
            vec![
                member_event("$m1:example.org", alice.as_str(), "Alice"),
                member_event("$m2:example.org", bob.as_str(), "Bob"),
            ],
            Vec::new(),
            None,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s1", update)).unwrap();

        cache.update_user_keys("t1", &query_response_for(alice, "master-a")).unwrap();
        cache.update_user_keys("t1", &query_response_for(bob, "master-b")).unwrap();
        assert_eq!(cache.room_verification_status(&room_id).unwrap(), Trust::Tofu);

        cache.mark_device_verified(alice, "DEVICE").unwrap();
        cache.mark_device_verified(bob, "DEVICE").unwrap();
        assert_eq!(cache.room_verification_status(&room_id).unwrap(), Trust::Verified);

        // Bob's identity changes: the room drops to unverified.
        cache.update_user_keys("t2", &query_response_for(bob, "master-c")).unwrap();
        assert_eq!(cache.room_verification_status(&room_id).unwrap(), Trust::Unverified);
    }

    #[test]
    fn members_with_keys_respects_verification() {
        let (_dir, cache) = test_cache();
        let room_id = room("!k:example.org");
        let alice = user_id!("@alice:example.org");

        let update = joined_update(
            vec![member_event("$m1:example.org", alice.as_str(), "Alice")],
            Vec::new(),
            None,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s1", update)).unwrap();
        cache.update_user_keys("t1", &query_response_for(alice, "master-a")).unwrap();

        let all = cache.get_members_with_keys(&room_id, false).unwrap();
        assert!(all.get(alice).unwrap().is_some());

        // Nothing verified yet.
        assert!(cache.get_members_with_keys(&room_id, true).unwrap().is_empty());

        cache.mark_device_verified(alice, "DEVICE").unwrap();
        let verified = cache.get_members_with_keys(&room_id, true).unwrap();
        let keys = verified.get(alice).unwrap().as_ref().unwrap();
        assert_eq!(keys.device_keys.len(), 1);
    }
}
