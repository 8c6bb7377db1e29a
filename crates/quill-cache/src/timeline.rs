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

//! The per-room timeline store.
//!
//! Every room keeps two dense orders: `order` over all timeline events and
//! `order_to_msg` over message-like events only, both centered on a sentinel
//! midpoint so back-pagination extends downward without renumbering anything
//! already stored. The inverse maps resolve event ids back to indices.

use redb::ReadableTable;
use ruma::{EventId, OwnedEventId, RoomId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::{
    db::{self, tables, tables::role, KvTable, WriteCtx},
    encode::{decode_index, index_key, EncodeKey},
    error::Result,
    events::{kinds, HiddenEventsContent, TimelineEventRecord, TimelineRange},
    responses::{MessagesResponse, Timeline},
};

/// Midpoint both orders grow away from.
const TIMELINE_SENTINEL: u64 = u64::MAX / 2;
/// Entries `clear_timeline` keeps around as the latest batch.
const TIMELINE_BATCH_KEEP: u64 = 100;
/// Entries the old-data sweeper leaves per room.
const MAX_KEPT_EVENTS: u64 = 1000;

/// Event types hidden from the rendered timeline unless account data says
/// otherwise.
const DEFAULT_HIDDEN: &[&str] =
    &["m.reaction", "m.call.candidates", "m.call.select_answer", "m.call.negotiate"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct OrderEntry {
    pub(crate) event_id: OwnedEventId,
    #[serde(default)]
    pub(crate) is_message: bool,
}

fn first_index<T>(table: &T) -> Result<Option<u64>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table
        .range::<&[u8]>(..)?
        .next()
        .transpose()?
        .and_then(|(key, _)| decode_index(key.value())))
}

fn last_index<T>(table: &T) -> Result<Option<u64>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table
        .range::<&[u8]>(..)?
        .next_back()
        .transpose()?
        .and_then(|(key, _)| decode_index(key.value())))
}

fn add_relations(
    relations: &mut KvTable<'_>,
    event: &TimelineEventRecord,
) -> Result<()> {
    for relation in event.relations() {
        let key = relation.event_id.as_str().encode();
        let mut related: Vec<OwnedEventId> = db::get_raw(relations, &key)?
            .and_then(|bytes| db::decode_value(&bytes))
            .unwrap_or_default();
        if !related.contains(&event.event_id) {
            related.push(event.event_id.clone());
            relations.insert(key.as_slice(), db::encode_value(&related)?.as_slice())?;
        }
    }
    Ok(())
}

impl crate::Cache {
    /// Append a live sync timeline batch in server order.
    ///
    /// Known event ids are dropped, which makes replaying the same batch
    /// after a crash idempotent. Returns the newest message timestamp seen.
    pub(crate) fn save_timeline_messages_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        timeline: &Timeline,
    ) -> Result<u64> {
        if timeline.limited {
            // The server skipped events; keep only the latest batch and
            // restart pagination from the new token.
            self.trim_timeline_tx(ctx, room_id, TIMELINE_BATCH_KEEP, true)?;
        }

        let mut state_events = Vec::new();
        let mut max_ts = 0;
        let was_empty;
        {
            let mut order = db::open_room_table(ctx, room_id, role::ORDER)?;
            let mut event_to_order = db::open_room_table(ctx, room_id, role::EVENT_TO_ORDER)?;
            let mut msg_to_order = db::open_room_table(ctx, room_id, role::MSG_TO_ORDER)?;
            let mut order_to_msg = db::open_room_table(ctx, room_id, role::ORDER_TO_MSG)?;
            let mut events = db::open_room_table(ctx, room_id, role::EVENTS)?;
            let mut relations = db::open_room_table(ctx, room_id, role::RELATIONS)?;
            let mut pending = db::open_room_table(ctx, room_id, role::PENDING)?;

            let last = last_index(&order)?;
            was_empty = last.is_none();
            let mut next = last.map(|i| i + 1).unwrap_or(TIMELINE_SENTINEL + 1);
            let mut next_msg =
                last_index(&order_to_msg)?.map(|i| i + 1).unwrap_or(TIMELINE_SENTINEL + 1);

            for event in &timeline.events {
                let event_key = event.event_id.as_str().encode();
                if event_to_order.get(event_key.as_slice())?.is_some() {
                    continue;
                }

                let entry = OrderEntry {
                    event_id: event.event_id.clone(),
                    is_message: event.is_message(),
                };
                order.insert(index_key(next).as_slice(), db::encode_value(&entry)?.as_slice())?;
                event_to_order.insert(event_key.as_slice(), index_key(next).as_slice())?;
                if entry.is_message {
                    order_to_msg
                        .insert(index_key(next_msg).as_slice(), event.event_id.as_bytes())?;
                    msg_to_order.insert(event_key.as_slice(), index_key(next_msg).as_slice())?;
                    next_msg += 1;
                }
                events.insert(event_key.as_slice(), db::encode_value(event)?.as_slice())?;
                add_relations(&mut relations, event)?;

                if let Some(txn_id) = &event.txn_id {
                    remove_pending_entry(&mut pending, txn_id)?;
                }
                if let Some(state) = event.as_state() {
                    state_events.push(state);
                }
                if entry.is_message {
                    max_ts = max_ts.max(event.origin_server_ts);
                }
                next += 1;
            }
        }

        if !state_events.is_empty() {
            self.save_state_events_tx(ctx, room_id, &state_events, false)?;
        }

        if let Some(prev_batch) = &timeline.prev_batch {
            if was_empty || timeline.limited {
                let mut system = db::open_table(ctx, tables::SYSTEM)?;
                system.insert(
                    ("prev_batch", room_id.as_str()).encode().as_slice(),
                    prev_batch.as_bytes(),
                )?;
            }
        }
        Ok(max_ts)
    }

    /// Prepend a page of history. Existing indices never move; the number of
    /// newly stored events is returned.
    pub fn save_old_messages(&self, room_id: &RoomId, response: &MessagesResponse) -> Result<u64> {
        self.write_with(|ctx| {
            let mut added = 0;
            {
                let mut order = db::open_room_table(ctx, room_id, role::ORDER)?;
                let mut event_to_order = db::open_room_table(ctx, room_id, role::EVENT_TO_ORDER)?;
                let mut msg_to_order = db::open_room_table(ctx, room_id, role::MSG_TO_ORDER)?;
                let mut order_to_msg = db::open_room_table(ctx, room_id, role::ORDER_TO_MSG)?;
                let mut events = db::open_room_table(ctx, room_id, role::EVENTS)?;
                let mut relations = db::open_room_table(ctx, room_id, role::RELATIONS)?;

                let mut next = first_index(&order)?.map(|i| i - 1).unwrap_or(TIMELINE_SENTINEL);
                let mut next_msg =
                    first_index(&order_to_msg)?.map(|i| i - 1).unwrap_or(TIMELINE_SENTINEL);

                // The chunk runs newest to oldest, matching the downward walk.
                for event in &response.chunk {
                    let event_key = event.event_id.as_str().encode();
                    if event_to_order.get(event_key.as_slice())?.is_some() {
                        continue;
                    }
                    let entry = OrderEntry {
                        event_id: event.event_id.clone(),
                        is_message: event.is_message(),
                    };
                    order.insert(index_key(next).as_slice(), db::encode_value(&entry)?.as_slice())?;
                    event_to_order.insert(event_key.as_slice(), index_key(next).as_slice())?;
                    if entry.is_message {
                        order_to_msg
                            .insert(index_key(next_msg).as_slice(), event.event_id.as_bytes())?;
                        msg_to_order.insert(event_key.as_slice(), index_key(next_msg).as_slice())?;
                        next_msg -= 1;
                    }
                    events.insert(event_key.as_slice(), db::encode_value(event)?.as_slice())?;
                    add_relations(&mut relations, event)?;
                    next -= 1;
                    added += 1;
                }
            }

            let mut system = db::open_table(ctx, tables::SYSTEM)?;
            let key = ("prev_batch", room_id.as_str()).encode();
            match &response.end {
                Some(token) => {
                    system.insert(key.as_slice(), token.as_bytes())?;
                }
                None => {
                    system.remove(key.as_slice())?;
                }
            }
            Ok(added)
        })
    }

    /// Token to resume back-pagination from.
    pub fn previous_batch_token(&self, room_id: &RoomId) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(system) = db::open_read(txn, tables::SYSTEM)? else { return Ok(None) };
            Ok(db::get_raw(&system, &("prev_batch", room_id.as_str()).encode())?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
        })
    }

    pub fn get_timeline_range(&self, room_id: &RoomId) -> Result<Option<TimelineRange>> {
        self.read_with(|txn| {
            let Some(order) = db::open_room_read(txn, room_id, role::ORDER)? else {
                return Ok(None);
            };
            match (first_index(&order)?, last_index(&order)?) {
                (Some(first), Some(last)) => Ok(Some(TimelineRange { first, last })),
                _ => Ok(None),
            }
        })
    }

    /// Index of an event in the all-events order.
    pub fn get_event_index(&self, room_id: &RoomId, event_id: &EventId) -> Result<Option<u64>> {
        self.read_with(|txn| {
            let Some(table) = db::open_room_read(txn, room_id, role::EVENT_TO_ORDER)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &event_id.encode())?.as_deref().and_then(decode_index))
        })
    }

    /// Index of a message event in the message-only order.
    pub fn get_timeline_index(&self, room_id: &RoomId, event_id: &EventId) -> Result<Option<u64>> {
        self.read_with(|txn| {
            let Some(table) = db::open_room_read(txn, room_id, role::MSG_TO_ORDER)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &event_id.encode())?.as_deref().and_then(decode_index))
        })
    }

    /// Event id at a message-order index.
    pub fn get_timeline_event_id(
        &self,
        room_id: &RoomId,
        index: u64,
    ) -> Result<Option<OwnedEventId>> {
        self.read_with(|txn| {
            let Some(table) = db::open_room_read(txn, room_id, role::ORDER_TO_MSG)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &index_key(index))?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| EventId::parse(&s).ok()))
        })
    }

    pub fn get_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Option<TimelineEventRecord>> {
        self.read_with(|txn| {
            let Some(events) = db::open_room_read(txn, room_id, role::EVENTS)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&events, &event_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    /// Write an event body without touching the ordering.
    pub fn store_event(&self, room_id: &RoomId, event: &TimelineEventRecord) -> Result<()> {
        self.write_with(|ctx| {
            let mut events = db::open_room_table(ctx, room_id, role::EVENTS)?;
            events.insert(
                event.event_id.as_str().encode().as_slice(),
                db::encode_value(event)?.as_slice(),
            )?;
            Ok(())
        })
    }

    /// Replace an event body under the given id, keeping its place in the
    /// timeline and refreshing the relation index.
    pub fn replace_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        event: &TimelineEventRecord,
    ) -> Result<()> {
        self.write_with(|ctx| {
            let mut events = db::open_room_table(ctx, room_id, role::EVENTS)?;
            events.insert(event_id.encode().as_slice(), db::encode_value(event)?.as_slice())?;
            drop(events);
            let mut relations = db::open_room_table(ctx, room_id, role::RELATIONS)?;
            add_relations(&mut relations, event)?;
            Ok(())
        })
    }

    /// Events related to the given one (edits, reactions, replies).
    pub fn related_events(&self, room_id: &RoomId, event_id: &EventId) -> Result<Vec<OwnedEventId>> {
        self.read_with(|txn| {
            let Some(relations) = db::open_room_read(txn, room_id, role::RELATIONS)? else {
                return Ok(Vec::new());
            };
            Ok(db::get_raw(&relations, &event_id.encode())?
                .and_then(|bytes| db::decode_value(&bytes))
                .unwrap_or_default())
        })
    }

    /// Walk backward from the given event to the first visible message.
    pub fn last_visible_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Option<(u64, OwnedEventId)>> {
        self.read_with(|txn| {
            let Some(index) = read_event_index(txn, room_id, event_id)? else { return Ok(None) };
            let Some(order) = db::open_room_read(txn, room_id, role::ORDER)? else {
                return Ok(None);
            };
            let Some(events) = db::open_room_read(txn, room_id, role::EVENTS)? else {
                return Ok(None);
            };
            let hidden = self.hidden_event_types(txn, room_id)?;

            let upper = index_key(index);
            for entry in order.range::<&[u8]>(..=upper.as_slice())?.rev() {
                let (key, value) = entry?;
                let Some(idx) = decode_index(key.value()) else { continue };
                let Some(entry) = db::decode_value::<OrderEntry>(value.value()) else { continue };
                if !entry.is_message {
                    continue;
                }
                let record = db::get_raw(&events, &entry.event_id.as_str().encode())?
                    .and_then(|b| db::decode_value::<TimelineEventRecord>(&b));
                if let Some(record) = record {
                    if is_hidden(&record, &hidden) {
                        continue;
                    }
                }
                return Ok(Some((idx, entry.event_id)));
            }
            Ok(None)
        })
    }

    /// Walk upward from the given event through the run of invisible events
    /// and return the last of them. Used for read-marker placement.
    pub fn last_invisible_event_after(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Option<(u64, OwnedEventId)>> {
        self.read_with(|txn| {
            let Some(index) = read_event_index(txn, room_id, event_id)? else { return Ok(None) };
            let Some(order) = db::open_room_read(txn, room_id, role::ORDER)? else {
                return Ok(None);
            };
            let Some(events) = db::open_room_read(txn, room_id, role::EVENTS)? else {
                return Ok(None);
            };
            let hidden = self.hidden_event_types(txn, room_id)?;

            let mut candidate = None;
            let lower = index_key(index + 1);
            for entry in order.range::<&[u8]>(lower.as_slice()..)? {
                let (key, value) = entry?;
                let Some(idx) = decode_index(key.value()) else { continue };
                let Some(entry) = db::decode_value::<OrderEntry>(value.value()) else { continue };
                let record = db::get_raw(&events, &entry.event_id.as_str().encode())?
                    .and_then(|b| db::decode_value::<TimelineEventRecord>(&b));
                let invisible = !entry.is_message
                    || record.as_ref().map(|r| is_hidden(r, &hidden)).unwrap_or(false);
                if invisible {
                    candidate = Some((idx, entry.event_id));
                } else {
                    break;
                }
            }
            Ok(candidate)
        })
    }

    /// Drop everything but the most recent batch; used to recover from gaps.
    pub fn clear_timeline(&self, room_id: &RoomId) -> Result<()> {
        self.write_with(|ctx| self.trim_timeline_tx(ctx, room_id, TIMELINE_BATCH_KEEP, true))
    }

    pub(crate) fn trim_timeline_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        keep: u64,
        clear_prev_batch: bool,
    ) -> Result<()> {
        {
            let mut order = db::open_room_table(ctx, room_id, role::ORDER)?;
            let mut event_to_order = db::open_room_table(ctx, room_id, role::EVENT_TO_ORDER)?;
            let mut msg_to_order = db::open_room_table(ctx, room_id, role::MSG_TO_ORDER)?;
            let mut order_to_msg = db::open_room_table(ctx, room_id, role::ORDER_TO_MSG)?;
            let mut events = db::open_room_table(ctx, room_id, role::EVENTS)?;

            if let Some(last) = last_index(&order)? {
                let cutoff = last.saturating_sub(keep.saturating_sub(1));
                let doomed: Vec<(Vec<u8>, Vec<u8>)> = db::scan_prefix(&order, b"")?
                    .into_iter()
                    .filter(|(key, _)| decode_index(key).is_some_and(|idx| idx < cutoff))
                    .collect();
                for (key, value) in doomed {
                    order.remove(key.as_slice())?;
                    let Some(entry) = db::decode_value::<OrderEntry>(&value) else { continue };
                    let event_key = entry.event_id.as_str().encode();
                    event_to_order.remove(event_key.as_slice())?;
                    events.remove(event_key.as_slice())?;
                    if let Some(msg_idx) =
                        db::get_raw(&msg_to_order, &event_key)?.as_deref().and_then(decode_index)
                    {
                        msg_to_order.remove(event_key.as_slice())?;
                        order_to_msg.remove(index_key(msg_idx).as_slice())?;
                    }
                }
            }
        }
        if clear_prev_batch {
            let mut system = db::open_table(ctx, tables::SYSTEM)?;
            system.remove(("prev_batch", room_id.as_str()).encode().as_slice())?;
        }
        Ok(())
    }

    /// The old-data sweeper: trim every room's timeline to a bounded tail.
    /// Crypto stores are never touched by this.
    pub fn delete_old_messages(&self) -> Result<()> {
        let rooms = self.joined_rooms()?;
        self.write_with(|ctx| {
            for room_id in &rooms {
                self.trim_timeline_tx(ctx, room_id, MAX_KEPT_EVENTS, false)?;
            }
            Ok(())
        })
    }

    /// Store a locally originated message awaiting its server echo.
    pub fn save_pending_message(&self, room_id: &RoomId, event: &TimelineEventRecord) -> Result<()> {
        self.write_with(|ctx| {
            let mut pending = db::open_room_table(ctx, room_id, role::PENDING)?;
            let next = last_index(&pending)?.map(|i| i + 1).unwrap_or(0);
            pending.insert(index_key(next).as_slice(), db::encode_value(event)?.as_slice())?;
            Ok(())
        })
    }

    /// All pending messages in insertion order.
    pub fn pending_events(&self, room_id: &RoomId) -> Result<Vec<TimelineEventRecord>> {
        self.read_with(|txn| {
            let Some(pending) = db::open_room_read(txn, room_id, role::PENDING)? else {
                return Ok(Vec::new());
            };
            Ok(db::scan_prefix(&pending, b"")?
                .into_iter()
                .filter_map(|(_, value)| db::decode_value(&value))
                .collect())
        })
    }

    /// The pending message next in line for sending.
    pub fn first_pending_message(&self, room_id: &RoomId) -> Result<Option<TimelineEventRecord>> {
        Ok(self.pending_events(room_id)?.into_iter().next())
    }

    /// Drop a pending message once the server confirmed it.
    pub fn remove_pending_status(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<()> {
        self.write_with(|ctx| {
            let mut pending = db::open_room_table(ctx, room_id, role::PENDING)?;
            remove_pending_entry(&mut pending, txn_id)
        })
    }

    /// Record how far the event-expiry job got for a room under the given
    /// settings, so it resumes instead of rescanning.
    pub fn store_event_expiration_progress(
        &self,
        room_id: &RoomId,
        settings: &str,
        stop_marker: &str,
    ) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::EVENT_EXPIRY_PROGRESS)?;
            table.insert(
                (room_id.as_str(), settings).encode().as_slice(),
                stop_marker.as_bytes(),
            )?;
            Ok(())
        })
    }

    pub fn load_event_expiration_progress(
        &self,
        room_id: &RoomId,
        settings: &str,
    ) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::EVENT_EXPIRY_PROGRESS)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &(room_id.as_str(), settings).encode())?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
        })
    }

    /// Event types the timeline currently hides, from room account data,
    /// global account data, or the built-in defaults. Best effort over
    /// committed state.
    fn hidden_event_types(
        &self,
        txn: &redb::ReadTransaction,
        room_id: &RoomId,
    ) -> Result<Vec<String>> {
        let room_scoped = match db::open_room_read(txn, room_id, role::ACCOUNT_DATA)? {
            Some(table) => db::get_raw(&table, &kinds::HIDDEN_EVENTS.encode())?,
            None => None,
        };
        let global = match db::open_read(txn, tables::ACCOUNT_DATA)? {
            Some(table) => db::get_raw(&table, &kinds::HIDDEN_EVENTS.encode())?,
            None => None,
        };
        let configured = room_scoped.or(global).and_then(|bytes| {
            db::decode_value::<crate::responses::AccountDataEvent>(&bytes).and_then(|event| {
                serde_json::from_value::<HiddenEventsContent>(event.content).ok()
            })
        });
        Ok(match configured {
            Some(content) => content.hidden_event_types,
            None => DEFAULT_HIDDEN.iter().map(|s| (*s).to_owned()).collect(),
        })
    }
}

fn is_hidden(record: &TimelineEventRecord, hidden: &[String]) -> bool {
    record.redacted || hidden.iter().any(|kind| *kind == record.kind)
}

fn read_event_index(
    txn: &redb::ReadTransaction,
    room_id: &RoomId,
    event_id: &EventId,
) -> Result<Option<u64>> {
    let Some(table) = db::open_room_read(txn, room_id, role::EVENT_TO_ORDER)? else {
        return Ok(None);
    };
    Ok(db::get_raw(&table, &event_id.encode())?.as_deref().and_then(decode_index))
}

fn remove_pending_entry(pending: &mut KvTable<'_>, txn_id: &TransactionId) -> Result<()> {
    let entries = db::scan_prefix(pending, b"")?;
    for (key, value) in entries {
        let Some(record) = db::decode_value::<TimelineEventRecord>(&value) else { continue };
        if record.txn_id.as_deref() == Some(txn_id) {
            pending.remove(key.as_slice())?;
            break;
        }
    }
    Ok(())
}
