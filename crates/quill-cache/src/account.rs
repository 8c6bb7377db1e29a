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

//! Account data, presence, read receipts and notification bookkeeping.
//!
//! Read receipts live in one store under two key shapes: `(room, event)`
//! holds the user→timestamp map and `(room, user)` points back at the event a
//! user last acknowledged. Event ids start with `$` and user ids with `@`,
//! so the shapes cannot collide, and moving a user is O(1) instead of a scan.

use std::collections::BTreeMap;

use redb::ReadableTable;
use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};

use crate::{
    db::{self, tables, tables::role, WriteCtx},
    encode::EncodeKey,
    error::Result,
    events::{kinds, PresenceSnapshot, RoomInfo},
    responses::{AccountDataEvent, PresenceUpdate},
    Cache,
};

impl Cache {
    pub(crate) fn save_account_data_tx(
        &self,
        ctx: &WriteCtx,
        room_id: Option<&RoomId>,
        events: &[AccountDataEvent],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut table = match room_id {
            Some(room_id) => db::open_room_table(ctx, room_id, role::ACCOUNT_DATA)?,
            None => db::open_table(ctx, tables::ACCOUNT_DATA)?,
        };
        for event in events {
            table.insert(event.kind.as_str().encode().as_slice(), db::encode_value(event)?.as_slice())?;
        }
        Ok(())
    }

    /// Account data by type; `None` room scope reads the global store.
    pub fn account_data(
        &self,
        room_id: Option<&RoomId>,
        kind: &str,
    ) -> Result<Option<AccountDataEvent>> {
        self.read_with(|txn| {
            let table = match room_id {
                Some(room_id) => db::open_room_read(txn, room_id, role::ACCOUNT_DATA)?,
                None => db::open_read(txn, tables::ACCOUNT_DATA)?,
            };
            let Some(table) = table else { return Ok(None) };
            Ok(db::get_raw(&table, &kind.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub(crate) fn save_presence_tx(
        &self,
        ctx: &WriteCtx,
        updates: &[PresenceUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut table = db::open_table(ctx, tables::PRESENCE)?;
        for update in updates {
            table.insert(
                update.sender.encode().as_slice(),
                db::encode_value(&update.content)?.as_slice(),
            )?;
        }
        Ok(())
    }

    /// Last known presence snapshot of a user.
    pub fn presence(&self, user_id: &UserId) -> Result<Option<PresenceSnapshot>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::PRESENCE)? else { return Ok(None) };
            Ok(db::get_raw(&table, &user_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    /// Merge a batch of read receipts, keeping each user under exactly one
    /// event per room. Returns the events whose receipt set changed.
    pub(crate) fn update_read_receipt_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        receipts: &BTreeMap<OwnedEventId, BTreeMap<OwnedUserId, u64>>,
    ) -> Result<Vec<OwnedEventId>> {
        if receipts.is_empty() {
            return Ok(Vec::new());
        }
        let mut table = db::open_table(ctx, tables::READ_RECEIPTS)?;
        let mut updated = Vec::new();

        for (event_id, users) in receipts {
            let event_key = (room_id.as_str(), event_id.as_str()).encode();
            let mut event_map: BTreeMap<OwnedUserId, u64> = db::get_raw(&table, &event_key)?
                .and_then(|bytes| db::decode_value(&bytes))
                .unwrap_or_default();
            let mut changed = false;

            for (user_id, timestamp) in users {
                let user_key = (room_id.as_str(), user_id.as_str()).encode();
                let previous_event = db::get_raw(&table, &user_key)?
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .and_then(|s| EventId::parse(&s).ok());

                if let Some(previous) = previous_event.filter(|prev| prev != event_id) {
                    let prev_key = (room_id.as_str(), previous.as_str()).encode();
                    let mut prev_map: BTreeMap<OwnedUserId, u64> = db::get_raw(&table, &prev_key)?
                        .and_then(|bytes| db::decode_value(&bytes))
                        .unwrap_or_default();
                    if prev_map.remove(user_id).is_some() {
                        if prev_map.is_empty() {
                            table.remove(prev_key.as_slice())?;
                        } else {
                            table.insert(
                                prev_key.as_slice(),
                                db::encode_value(&prev_map)?.as_slice(),
                            )?;
                        }
                        if !updated.contains(&previous) {
                            updated.push(previous);
                        }
                    }
                }

                if event_map.insert(user_id.clone(), *timestamp) != Some(*timestamp) {
                    changed = true;
                }
                table.insert(user_key.as_slice(), event_id.as_bytes())?;
            }

            if changed {
                table.insert(event_key.as_slice(), db::encode_value(&event_map)?.as_slice())?;
                updated.push(event_id.clone());
            }
        }
        Ok(updated)
    }

    /// All read receipts for an event, newest first.
    pub fn read_receipts(
        &self,
        event_id: &EventId,
        room_id: &RoomId,
    ) -> Result<Vec<(u64, OwnedUserId)>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::READ_RECEIPTS)? else {
                return Ok(Vec::new());
            };
            let map: BTreeMap<OwnedUserId, u64> =
                db::get_raw(&table, &(room_id.as_str(), event_id.as_str()).encode())?
                    .and_then(|bytes| db::decode_value(&bytes))
                    .unwrap_or_default();
            let mut out: Vec<(u64, OwnedUserId)> =
                map.into_iter().map(|(user, ts)| (ts, user)).collect();
            out.sort_by(|a, b| b.cmp(a));
            Ok(out)
        })
    }

    /// The event a user's receipt currently sits on in a room.
    pub(crate) fn receipt_event_of_user(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<OwnedEventId>> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::READ_RECEIPTS)? else {
                return Ok(None);
            };
            Ok(db::get_raw(&table, &(room_id.as_str(), user_id.as_str()).encode())?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| EventId::parse(&s).ok()))
        })
    }

    /// Remember that a desktop notification went out for this event.
    pub fn mark_sent_notification(&self, event_id: &EventId) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::NOTIFICATIONS_SENT)?;
            table.insert(event_id.encode().as_slice(), [1u8].as_slice())?;
            Ok(())
        })
    }

    pub fn is_notification_sent(&self, event_id: &EventId) -> Result<bool> {
        self.read_with(|txn| {
            let Some(table) = db::open_read(txn, tables::NOTIFICATIONS_SENT)? else {
                return Ok(false);
            };
            Ok(table.get(event_id.encode().as_slice())?.is_some())
        })
    }

    pub fn remove_read_notification(&self, event_id: &EventId) -> Result<()> {
        self.write_with(|ctx| {
            let mut table = db::open_table(ctx, tables::NOTIFICATIONS_SENT)?;
            table.remove(event_id.encode().as_slice())?;
            Ok(())
        })
    }

    /// The `m.fully_read` marker of a room.
    pub fn get_fully_read_event_id(&self, room_id: &RoomId) -> Result<Option<OwnedEventId>> {
        let Some(event) = self.account_data(Some(room_id), kinds::FULLY_READ)? else {
            return Ok(None);
        };
        Ok(event
            .content
            .get("event_id")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| EventId::parse(s).ok()))
    }

    /// Whether a room has messages the local user has not read yet.
    pub fn calculate_room_read_status(&self, room_id: &RoomId) -> Result<bool> {
        let Some(newest) = self.newest_timeline_event(room_id)? else {
            return Ok(false);
        };
        let Some((_, last_visible)) = self.last_visible_event(room_id, &newest)? else {
            return Ok(false);
        };
        if self.get_fully_read_event_id(room_id)?.as_deref() == Some(&*last_visible) {
            return Ok(false);
        }
        if self.receipt_event_of_user(room_id, &self.local_user)?.as_deref()
            == Some(&*last_visible)
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Read status of every joined room, for the post-sync signal.
    pub fn calculate_room_read_status_all(&self) -> Result<BTreeMap<OwnedRoomId, bool>> {
        let mut out = BTreeMap::new();
        for room_id in self.joined_rooms()? {
            let unread = self.calculate_room_read_status(&room_id)?;
            out.insert(room_id, unread);
        }
        Ok(out)
    }

    /// Newest event in the room's timeline order.
    pub(crate) fn newest_timeline_event(&self, room_id: &RoomId) -> Result<Option<OwnedEventId>> {
        self.read_with(|txn| {
            let Some(order) = db::open_room_read(txn, room_id, role::ORDER)? else {
                return Ok(None);
            };
            let Some((_, value)) = order.range::<&[u8]>(..)?.next_back().transpose()? else {
                return Ok(None);
            };
            Ok(db::decode_value::<crate::timeline::OrderEntry>(value.value())
                .map(|entry| entry.event_id))
        })
    }

    pub(crate) fn update_last_message_timestamp_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        timestamp: u64,
    ) -> Result<()> {
        if timestamp == 0 {
            return Ok(());
        }
        let mut rooms = db::open_table(ctx, tables::ROOMS)?;
        let Some(mut info) =
            db::get_raw(&rooms, &room_id.encode())?.and_then(|b| db::decode_value::<RoomInfo>(&b))
        else {
            return Ok(());
        };
        if timestamp > info.last_message_ts {
            info.last_message_ts = timestamp;
            rooms.insert(room_id.encode().as_slice(), db::encode_value(&info)?.as_slice())?;
        }
        Ok(())
    }

    pub fn update_last_message_timestamp(&self, room_id: &RoomId, timestamp: u64) -> Result<()> {
        self.write_with(|ctx| self.update_last_message_timestamp_tx(ctx, room_id, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, user_id};

    use crate::{
        test_utils::{
            joined_update, member_event, message_event, receipts_for, room,
            sync_with_joined_room, test_cache,
        },
        CacheSignal,
    };

    #[test]
    fn receipts_move_users_between_events() {
        let (_dir, cache) = test_cache();
        let room_id = room("!r:example.org");
        let alice = user_id!("@alice:example.org");

        let mut update = joined_update(
            Vec::new(),
            vec![
                message_event("$e1:example.org", "@alice:example.org", 1),
                message_event("$e2:example.org", "@alice:example.org", 2),
            ],
            None,
        );
        update.receipts = receipts_for(event_id!("$e1:example.org").to_owned(), alice.to_owned(), 100);
        cache.save_state(&sync_with_joined_room(&room_id, "s1", update)).unwrap();

        assert_eq!(
            cache.read_receipts(event_id!("$e1:example.org"), &room_id).unwrap(),
            vec![(100, alice.to_owned())]
        );

        // The same user acknowledges a newer event; the old entry moves.
        let mut update = joined_update(Vec::new(), Vec::new(), None);
        update.receipts = receipts_for(event_id!("$e2:example.org").to_owned(), alice.to_owned(), 200);
        cache.save_state(&sync_with_joined_room(&room_id, "s2", update)).unwrap();

        assert!(cache.read_receipts(event_id!("$e1:example.org"), &room_id).unwrap().is_empty());
        assert_eq!(
            cache.read_receipts(event_id!("$e2:example.org"), &room_id).unwrap(),
            vec![(200, alice.to_owned())]
        );
    }

    #[test]
    fn receipt_updates_emit_a_signal_after_commit() {
        let (_dir, cache) = test_cache();
        let room_id = room("!r:example.org");
        let mut rx = cache.subscribe();

        let mut update = joined_update(
            Vec::new(),
            vec![message_event("$e1:example.org", "@alice:example.org", 1)],
            None,
        );
        update.receipts = receipts_for(
            event_id!("$e1:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            100,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s1", update)).unwrap();

        let mut saw_receipts = false;
        while let Ok(signal) = rx.try_recv() {
            if let CacheSignal::NewReadReceipts { room_id: r, event_ids } = signal {
                assert_eq!(r, room_id);
                assert_eq!(event_ids, vec![event_id!("$e1:example.org").to_owned()]);
                saw_receipts = true;
            }
        }
        assert!(saw_receipts);
    }

    #[test]
    fn room_read_status_follows_own_receipt() {
        let (_dir, cache) = test_cache();
        let room_id = room("!r:example.org");

        let update = joined_update(
            vec![member_event("$m:example.org", crate::test_utils::LOCAL_USER, "Self")],
            vec![message_event("$e1:example.org", "@alice:example.org", 1)],
            None,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s1", update)).unwrap();
        assert!(cache.calculate_room_read_status(&room_id).unwrap());

        let mut update = joined_update(Vec::new(), Vec::new(), None);
        update.receipts = receipts_for(
            event_id!("$e1:example.org").to_owned(),
            user_id!("@self:example.org").to_owned(),
            100,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s2", update)).unwrap();
        assert!(!cache.calculate_room_read_status(&room_id).unwrap());
    }

    #[test]
    fn notification_bookkeeping() {
        let (_dir, cache) = test_cache();
        let event = event_id!("$n:example.org");

        assert!(!cache.is_notification_sent(event).unwrap());
        cache.mark_sent_notification(event).unwrap();
        assert!(cache.is_notification_sent(event).unwrap());
        cache.remove_read_notification(event).unwrap();
        assert!(!cache.is_notification_sent(event).unwrap());
    }

    #[test]
    fn presence_snapshots_overwrite() {
        let (_dir, cache) = test_cache();
        let alice = user_id!("@alice:example.org");

        let mut sync = crate::responses::SyncResponse {
            next_batch: "s1".to_owned(),
            ..Default::default()
        };
        sync.presence.push(crate::responses::PresenceUpdate {
            sender: alice.to_owned(),
            content: serde_json::from_value(
                serde_json::json!({ "presence": "online", "status_msg": "hi" }),
            )
            .unwrap(),
        });
        cache.save_state(&sync).unwrap();

        let snapshot = cache.presence(alice).unwrap().unwrap();
        assert_eq!(snapshot.presence, "online");
        assert_eq!(snapshot.status_msg.as_deref(), Some("hi"));
    }

    #[test]
    fn account_data_is_scoped() {
        let (_dir, cache) = test_cache();
        let room_id = room("!r:example.org");

        let mut sync = crate::responses::SyncResponse {
            next_batch: "s1".to_owned(),
            ..Default::default()
        };
        sync.account_data.push(crate::responses::AccountDataEvent {
            kind: "m.direct".to_owned(),
            content: serde_json::json!({ "@alice:example.org": ["!r:example.org"] }),
        });
        let mut update = joined_update(Vec::new(), Vec::new(), None);
        update.account_data.push(crate::responses::AccountDataEvent {
            kind: "m.fully_read".to_owned(),
            content: serde_json::json!({ "event_id": "$e1:example.org" }),
        });
        sync.rooms.join.insert(room_id.clone(), update);
        cache.save_state(&sync).unwrap();

        assert!(cache.account_data(None, "m.direct").unwrap().is_some());
        assert!(cache.account_data(Some(&room_id), "m.direct").unwrap().is_none());
        assert_eq!(
            cache.get_fully_read_event_id(&room_id).unwrap().unwrap().as_str(),
            "$e1:example.org"
        );
    }
}

#[cfg(test)]
mod receipt_properties {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use ruma::{EventId, OwnedEventId, OwnedUserId, UserId};

    use crate::test_utils::{joined_update, message_event, room, sync_with_joined_room, test_cache};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// However receipts arrive, a user sits under exactly one event per
        /// room afterwards.
        #[test]
        fn each_user_acknowledges_exactly_one_event(
            batches in proptest::collection::vec(
                proptest::collection::vec((0usize..4, 0usize..5, 1u64..1000), 1..6),
                1..6,
            ),
        ) {
            let (_dir, cache) = test_cache();
            let room_id = room("!rp:example.org");

            let users: Vec<OwnedUserId> = (0..4)
                .map(|i| UserId::parse(format!("@u{i}:example.org").as_str()).unwrap())
                .collect();
            let events: Vec<OwnedEventId> = (0..5)
                .map(|i| EventId::parse(format!("$r{i}:example.org").as_str()).unwrap())
                .collect();

            let update = joined_update(
                Vec::new(),
                events
                    .iter()
                    .enumerate()
                    .map(|(i, id)| message_event(id.as_str(), "@alice:example.org", i as u64))
                    .collect(),
                None,
            );
            cache.save_state(&sync_with_joined_room(&room_id, "s0", update)).unwrap();

            for (batch_no, batch) in batches.into_iter().enumerate() {
                let mut receipts: BTreeMap<OwnedEventId, BTreeMap<OwnedUserId, u64>> =
                    BTreeMap::new();
                for (user_idx, event_idx, ts) in batch {
                    receipts
                        .entry(events[event_idx].clone())
                        .or_default()
                        .insert(users[user_idx].clone(), ts);
                }
                let mut update = joined_update(Vec::new(), Vec::new(), None);
                update.receipts = receipts;
                cache
                    .save_state(&sync_with_joined_room(&room_id, &format!("s{}", batch_no + 1), update))
                    .unwrap();

                for user in &users {
                    let holding: Vec<&OwnedEventId> = events
                        .iter()
                        .filter(|event| {
                            cache
                                .read_receipts(event, &room_id)
                                .unwrap()
                                .iter()
                                .any(|(_, u)| u == user)
                        })
                        .collect();
                    prop_assert!(holding.len() <= 1);
                    if let Some(event) = holding.first() {
                        let receipt_event = cache.receipt_event_of_user(&room_id, user).unwrap();
                        prop_assert_eq!(receipt_event.as_ref(), Some(*event));
                    }
                }
            }
        }
    }
}
