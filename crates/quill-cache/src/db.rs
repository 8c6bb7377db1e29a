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

//! The storage environment.
//!
//! One redb database holds every sub-store as a named table. Global tables
//! are created at open time; per-room tables are created on demand inside the
//! writing transaction and dropped as a unit when the room goes away. Writes
//! are serialized by redb's single writer, readers see an MVCC snapshot, and
//! commits are fsynced before they report success.

use std::sync::Mutex;

use redb::{ReadTransaction, ReadableTable, TableError, WriteTransaction};
use ruma::RoomId;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

pub(crate) type KvDef<'a> = redb::TableDefinition<'a, &'static [u8], &'static [u8]>;
pub(crate) type KvTable<'txn> = redb::Table<'txn, &'static [u8], &'static [u8]>;
pub(crate) type KvReadTable = redb::ReadOnlyTable<&'static [u8], &'static [u8]>;

/// Version stamped into the `system` table; bump on layout changes.
pub(crate) const FORMAT_VERSION: u64 = 1;

pub(crate) const KEY_FORMAT_VERSION: &[u8] = b"format_version";
pub(crate) const KEY_NEXT_BATCH: &[u8] = b"next_batch";

pub(crate) mod tables {
    use ruma::RoomId;

    use super::KvDef;

    pub(crate) const ROOMS: KvDef<'static> = KvDef::new("rooms");
    pub(crate) const INVITES: KvDef<'static> = KvDef::new("invites");
    pub(crate) const SYSTEM: KvDef<'static> = KvDef::new("system");
    pub(crate) const ACCOUNT_DATA: KvDef<'static> = KvDef::new("account_data");
    pub(crate) const USER_KEYS: KvDef<'static> = KvDef::new("user_keys");
    pub(crate) const VERIFICATION: KvDef<'static> = KvDef::new("verification");
    pub(crate) const OUTBOUND_MEGOLM: KvDef<'static> = KvDef::new("outbound_megolm");
    pub(crate) const INBOUND_MEGOLM: KvDef<'static> = KvDef::new("inbound_megolm");
    pub(crate) const OLM_SESSIONS: KvDef<'static> = KvDef::new("olm_sessions");
    pub(crate) const OLM_ACCOUNT: KvDef<'static> = KvDef::new("olm_account");
    pub(crate) const BACKUP: KvDef<'static> = KvDef::new("backup");
    pub(crate) const SECRETS_INTERNAL: KvDef<'static> = KvDef::new("secrets_internal");
    pub(crate) const PRESENCE: KvDef<'static> = KvDef::new("presence");
    pub(crate) const NOTIFICATIONS_SENT: KvDef<'static> = KvDef::new("notifications_sent");
    pub(crate) const READ_RECEIPTS: KvDef<'static> = KvDef::new("read_receipts");
    pub(crate) const SPACE_PARENTS: KvDef<'static> = KvDef::new("space_parents");
    pub(crate) const SPACE_CHILDREN: KvDef<'static> = KvDef::new("space_children");
    pub(crate) const EVENT_EXPIRY_PROGRESS: KvDef<'static> = KvDef::new("event_expiry_progress");

    pub(crate) const ALL_GLOBAL: &[KvDef<'static>] = &[
        ROOMS,
        INVITES,
        SYSTEM,
        ACCOUNT_DATA,
        USER_KEYS,
        VERIFICATION,
        OUTBOUND_MEGOLM,
        INBOUND_MEGOLM,
        OLM_SESSIONS,
        OLM_ACCOUNT,
        BACKUP,
        SECRETS_INTERNAL,
        PRESENCE,
        NOTIFICATIONS_SENT,
        READ_RECEIPTS,
        SPACE_PARENTS,
        SPACE_CHILDREN,
        EVENT_EXPIRY_PROGRESS,
    ];

    pub(crate) mod role {
        pub(crate) const EVENTS: &str = "events";
        pub(crate) const ORDER: &str = "order";
        pub(crate) const EVENT_TO_ORDER: &str = "event_to_order";
        pub(crate) const MSG_TO_ORDER: &str = "msg_to_order";
        pub(crate) const ORDER_TO_MSG: &str = "order_to_msg";
        pub(crate) const PENDING: &str = "pending";
        pub(crate) const RELATIONS: &str = "relations";
        pub(crate) const STATE: &str = "state";
        pub(crate) const STATE_KEY: &str = "state_key";
        pub(crate) const MEMBERS: &str = "members";
        pub(crate) const INVITE_STATE: &str = "invite_state";
        pub(crate) const INVITE_MEMBERS: &str = "invite_members";
        pub(crate) const ACCOUNT_DATA: &str = "account_data";
    }

    pub(crate) const ROOM_ROLES: &[&str] = &[
        role::EVENTS,
        role::ORDER,
        role::EVENT_TO_ORDER,
        role::MSG_TO_ORDER,
        role::ORDER_TO_MSG,
        role::PENDING,
        role::RELATIONS,
        role::STATE,
        role::STATE_KEY,
        role::MEMBERS,
        role::INVITE_STATE,
        role::INVITE_MEMBERS,
        role::ACCOUNT_DATA,
    ];

    pub(crate) fn room_table_name(room_id: &RoomId, role: &str) -> String {
        format!("{room_id}/{role}")
    }
}

/// A write transaction plus the signal emissions it will perform once it has
/// committed. Emitting from inside the transaction would let subscribers
/// observe uncommitted state.
pub(crate) struct WriteCtx {
    txn: WriteTransaction,
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl From<WriteTransaction> for WriteCtx {
    fn from(txn: WriteTransaction) -> Self {
        Self { txn, hooks: Mutex::new(Vec::new()) }
    }
}

impl std::ops::Deref for WriteCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.txn
    }
}

impl WriteCtx {
    pub(crate) fn on_commit(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().expect("hook lock poisoned").push(Box::new(hook));
    }

    pub(crate) fn commit(self) -> Result<()> {
        let Self { txn, hooks } = self;
        txn.commit()?;
        for hook in hooks.into_inner().expect("hook lock poisoned") {
            hook();
        }
        Ok(())
    }
}

impl crate::Cache {
    /// Run `f` inside a read transaction observing a consistent snapshot.
    pub(crate) fn read_with<T>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> Result<T>,
    ) -> Result<T> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    /// Run `f` inside the single write transaction, committing on success.
    /// Dropping the transaction on the error path aborts it, so every exit
    /// terminates the transaction.
    pub(crate) fn write_with<T>(&self, f: impl FnOnce(&WriteCtx) -> Result<T>) -> Result<T> {
        let ctx = WriteCtx::from(self.db.begin_write()?);
        let res = f(&ctx)?;
        ctx.commit()?;
        Ok(res)
    }

    pub(crate) fn run_migrations(db: &redb::Database) -> Result<()> {
        let txn = db.begin_write()?;
        for def in tables::ALL_GLOBAL {
            txn.open_table(*def)?;
        }
        let version = {
            let table = txn.open_table(tables::SYSTEM)?;
            let value = table
                .get(KEY_FORMAT_VERSION)?
                .and_then(|guard| decode_index_value(guard.value()))
                .unwrap_or(0);
            value
        };
        match version {
            0 => {
                debug!(version = FORMAT_VERSION, "stamping fresh cache format");
                let mut table = txn.open_table(tables::SYSTEM)?;
                table.insert(KEY_FORMAT_VERSION, FORMAT_VERSION.to_be_bytes().as_slice())?;
            }
            FORMAT_VERSION => {}
            found => {
                // Aborts the transaction on drop.
                return Err(CacheError::UnsupportedFormat { found, supported: FORMAT_VERSION });
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// The format version of the open database.
    pub fn format_version(&self) -> Result<u64> {
        self.read_with(|txn| {
            let table = txn.open_table(tables::SYSTEM)?;
            Ok(table
                .get(KEY_FORMAT_VERSION)?
                .and_then(|guard| decode_index_value(guard.value()))
                .unwrap_or(0))
        })
    }

    /// Bind the file to the current layout.
    pub fn set_current_format(&self) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = ctx.open_table(tables::SYSTEM)?;
            table.insert(KEY_FORMAT_VERSION, FORMAT_VERSION.to_be_bytes().as_slice())?;
            Ok(())
        })
    }
}

fn decode_index_value(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

pub(crate) fn open_table<'txn>(txn: &'txn WriteTransaction, def: KvDef<'_>) -> Result<KvTable<'txn>> {
    Ok(txn.open_table(def)?)
}

pub(crate) fn open_room_table<'txn>(
    txn: &'txn WriteTransaction,
    room_id: &RoomId,
    role: &str,
) -> Result<KvTable<'txn>> {
    let name = tables::room_table_name(room_id, role);
    let def = KvDef::new(&name);
    Ok(txn.open_table(def)?)
}

pub(crate) fn open_read(txn: &ReadTransaction, def: KvDef<'_>) -> Result<Option<KvReadTable>> {
    match txn.open_table(def) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn open_room_read(
    txn: &ReadTransaction,
    room_id: &RoomId,
    role: &str,
) -> Result<Option<KvReadTable>> {
    let name = tables::room_table_name(room_id, role);
    open_read(txn, KvDef::new(&name))
}

/// Drop every per-room sub-store of a room in the current transaction.
pub(crate) fn delete_room_tables(txn: &WriteTransaction, room_id: &RoomId) -> Result<()> {
    for role in tables::ROOM_ROLES {
        let name = tables::room_table_name(room_id, role);
        txn.delete_table(KvDef::new(&name))?;
    }
    Ok(())
}

/// Collect every entry whose key starts with `prefix`, oldest key first.
pub(crate) fn scan_prefix<T>(table: &T, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.range::<&[u8]>(prefix..)? {
        let (key, value) = entry?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.to_vec(), value.value().to_vec()));
    }
    Ok(out)
}

pub(crate) fn get_raw<T>(table: &T, key: &[u8]) -> Result<Option<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a stored record, dropping it as corrupt on failure. Callers see the
/// drop as an absent value.
pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(%error, "dropping corrupt cache record");
            None
        }
    }
}
