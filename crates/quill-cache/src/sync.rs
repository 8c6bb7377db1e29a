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

//! The sync applier.
//!
//! `save_state` is the single entry point the sync loop drives. Everything a
//! sync response carries is applied in one write transaction, with the
//! next-batch token written last: a crash anywhere in between replays the
//! same batch, and event-id dedup makes the replay a no-op.

use std::collections::BTreeSet;

use ruma::{OwnedEventId, OwnedRoomId};
use tracing::debug;

use crate::{
    db::{self, tables, KEY_NEXT_BATCH},
    error::Result,
    responses::SyncResponse,
    signals::CacheSignal,
    Cache,
};

impl Cache {
    /// Apply a sync response atomically.
    pub fn save_state(&self, response: &SyncResponse) -> Result<()> {
        debug!(
            joined = response.rooms.join.len(),
            invited = response.rooms.invite.len(),
            left = response.rooms.leave.len(),
            "applying sync response"
        );
        self.write_with(|ctx| {
            let mut touched: BTreeSet<OwnedRoomId> = BTreeSet::new();
            let mut receipt_updates: Vec<(OwnedRoomId, Vec<OwnedEventId>)> = Vec::new();
            let mut removed: Vec<OwnedRoomId> = Vec::new();

            for (room_id, joined) in &response.rooms.join {
                // A join supersedes any pending invite snapshot.
                self.remove_invite_tx(ctx, room_id)?;
                self.save_account_data_tx(ctx, Some(room_id), &joined.account_data)?;
                self.save_state_events_tx(ctx, room_id, &joined.state, false)?;
                let newest_ts = self.save_timeline_messages_tx(ctx, room_id, &joined.timeline)?;
                let updated = self.update_read_receipt_tx(ctx, room_id, &joined.receipts)?;
                if !updated.is_empty() {
                    receipt_updates.push((room_id.clone(), updated));
                }
                self.refresh_room_info_tx(ctx, room_id)?;
                self.update_last_message_timestamp_tx(ctx, room_id, newest_ts)?;
                touched.insert(room_id.clone());
            }

            for (room_id, invited) in &response.rooms.invite {
                self.save_invite_tx(ctx, room_id, invited)?;
                touched.insert(room_id.clone());
            }

            for room_id in response.rooms.leave.keys() {
                self.remove_room_tx(ctx, room_id)?;
                touched.remove(room_id);
                removed.push(room_id.clone());
            }

            self.save_presence_tx(ctx, &response.presence)?;
            self.save_account_data_tx(ctx, None, &response.account_data)?;
            self.mark_user_keys_out_of_date_tx(
                ctx,
                &response.device_lists.changed,
                &response.next_batch,
            )?;
            self.update_spaces_tx(ctx, &touched)?;

            // Last, so an interrupted apply replays this batch.
            self.set_next_batch_token_tx(ctx, &response.next_batch)?;

            let signals = self.signals.clone();
            ctx.on_commit(move || {
                for (room_id, event_ids) in receipt_updates {
                    let _ = signals.send(CacheSignal::NewReadReceipts { room_id, event_ids });
                }
                if !removed.is_empty() {
                    let _ = signals.send(CacheSignal::RoomsRemoved { room_ids: removed });
                }
            });
            Ok(())
        })?;

        // Recompute read status against the committed state.
        let status = self.calculate_room_read_status_all()?;
        if !status.is_empty() {
            let _ = self.signals.send(CacheSignal::RoomReadStatus { status });
        }
        Ok(())
    }

    /// The token the next sync resumes from.
    pub fn next_batch_token(&self) -> Result<Option<String>> {
        self.read_with(|txn| {
            let Some(system) = db::open_read(txn, tables::SYSTEM)? else { return Ok(None) };
            Ok(db::get_raw(&system, KEY_NEXT_BATCH)?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
        })
    }

    pub(crate) fn set_next_batch_token_tx(
        &self,
        ctx: &crate::db::WriteCtx,
        token: &str,
    ) -> Result<()> {
        let mut system = db::open_table(ctx, tables::SYSTEM)?;
        system.insert(KEY_NEXT_BATCH, token.as_bytes())?;
        Ok(())
    }

    /// Whether at least one sync was stored into this cache.
    pub fn is_initialized(&self) -> bool {
        self.next_batch_token().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Whether setup finished and the bootstrapped secrets are loaded.
    pub fn database_ready(&self) -> bool {
        self.database_ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, user_id};
    use serde_json::json;

    use crate::{
        events::kinds,
        responses::{InvitedRoomUpdate, LeftRoomUpdate, SyncResponse},
        signals::CacheSignal,
        test_utils::{
            joined_update, member_event, message_event, receipts_for, room, state_event,
            sync_with_joined_room, test_cache, timeline_state_event,
        },
    };

    fn fresh_sync() -> crate::responses::SyncResponse {
        let room_id = room("!a:example.org");
        let update = joined_update(
            vec![
                member_event("$m1:example.org", "@alice:example.org", "Alice"),
                member_event("$m2:example.org", crate::test_utils::LOCAL_USER, "Self"),
            ],
            vec![
                message_event("$e1:example.org", "@alice:example.org", 100),
                message_event("$e2:example.org", "@alice:example.org", 200),
                timeline_state_event(
                    "$e3:example.org",
                    kinds::ROOM_NAME,
                    "",
                    json!({ "name": "Room A" }),
                    250,
                ),
            ],
            Some("p0"),
        );
        sync_with_joined_room(&room_id, "s1", update)
    }

    #[test]
    fn fresh_sync_populates_the_room() {
        let (_dir, cache) = test_cache();
        let room_id = room("!a:example.org");

        cache.save_state(&fresh_sync()).unwrap();

        let range = cache.get_timeline_range(&room_id).unwrap().unwrap();
        assert_eq!(range.last - range.first, 2);
        assert_eq!(cache.member_count(&room_id).unwrap(), 2);
        assert_eq!(cache.next_batch_token().unwrap().as_deref(), Some("s1"));
        assert!(cache.is_initialized());

        let info = cache.single_room_info(&room_id).unwrap().unwrap();
        assert_eq!(info.name, "Room A");
        assert_eq!(info.member_count, 2);
        assert_eq!(info.last_message_ts, 200);
        assert_eq!(cache.previous_batch_token(&room_id).unwrap().as_deref(), Some("p0"));
    }

    #[test]
    fn back_pagination_extends_downward() {
        let (_dir, cache) = test_cache();
        let room_id = room("!a:example.org");
        cache.save_state(&fresh_sync()).unwrap();
        let before = cache.get_timeline_range(&room_id).unwrap().unwrap();

        let response = crate::responses::MessagesResponse {
            start: "p0".to_owned(),
            end: Some("p".to_owned()),
            chunk: vec![
                message_event("$old1:example.org", "@alice:example.org", 90),
                message_event("$old2:example.org", "@alice:example.org", 80),
            ],
        };
        let added = cache.save_old_messages(&room_id, &response).unwrap();
        assert_eq!(added, 2);

        let after = cache.get_timeline_range(&room_id).unwrap().unwrap();
        assert_eq!(after.last, before.last);
        assert_eq!(after.first, before.first - 2);
        assert_eq!(cache.previous_batch_token(&room_id).unwrap().as_deref(), Some("p"));
    }

    #[test]
    fn duplicate_events_are_dropped() {
        let (_dir, cache) = test_cache();
        let room_id = room("!a:example.org");
        cache.save_state(&fresh_sync()).unwrap();
        let before = cache.get_timeline_range(&room_id).unwrap().unwrap();
        let index_before =
            cache.get_event_index(&room_id, event_id!("$e2:example.org")).unwrap().unwrap();

        let update = joined_update(
            Vec::new(),
            vec![message_event("$e2:example.org", "@alice:example.org", 200)],
            None,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s2", update)).unwrap();

        let after = cache.get_timeline_range(&room_id).unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(
            cache.get_event_index(&room_id, event_id!("$e2:example.org")).unwrap().unwrap(),
            index_before,
        );
        assert_eq!(cache.next_batch_token().unwrap().as_deref(), Some("s2"));
    }

    #[test]
    fn replaying_the_same_batch_is_idempotent() {
        let (_dir, cache) = test_cache();
        let room_id = room("!a:example.org");
        let mut sync = fresh_sync();
        sync.rooms.join.get_mut(&room_id).unwrap().receipts = receipts_for(
            event_id!("$e2:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            1000,
        );

        cache.save_state(&sync).unwrap();
        let range = cache.get_timeline_range(&room_id).unwrap().unwrap();
        let receipts =
            cache.read_receipts(event_id!("$e2:example.org"), &room_id).unwrap();

        cache.save_state(&sync).unwrap();
        assert_eq!(cache.get_timeline_range(&room_id).unwrap().unwrap(), range);
        assert_eq!(
            cache.read_receipts(event_id!("$e2:example.org"), &room_id).unwrap(),
            receipts,
        );
        assert_eq!(cache.member_count(&room_id).unwrap(), 2);
    }

    #[test]
    fn invite_then_join_moves_the_room() {
        let (_dir, cache) = test_cache();
        let room_id = room("!b:example.org");

        let mut invite_sync = SyncResponse { next_batch: "s1".to_owned(), ..Default::default() };
        invite_sync.rooms.invite.insert(
            room_id.clone(),
            InvitedRoomUpdate {
                invite_state: vec![
                    state_event(
                        "$n:example.org",
                        kinds::ROOM_NAME,
                        "",
                        json!({ "name": "Invited room" }),
                    ),
                    member_event("$i:example.org", crate::test_utils::LOCAL_USER, "Self"),
                ],
            },
        );
        cache.save_state(&invite_sync).unwrap();

        let invites = cache.invites().unwrap();
        assert!(invites.get(&room_id).is_some_and(|info| info.is_invite));
        assert_eq!(cache.get_members_from_invite(&room_id, 0, 10).unwrap().len(), 1);

        let update = joined_update(
            vec![member_event("$m:example.org", crate::test_utils::LOCAL_USER, "Self")],
            vec![message_event("$e:example.org", crate::test_utils::LOCAL_USER, 50)],
            None,
        );
        cache.save_state(&sync_with_joined_room(&room_id, "s2", update)).unwrap();

        assert!(cache.invites().unwrap().is_empty());
        assert!(cache.joined_rooms().unwrap().contains(&room_id));
        assert!(cache.get_members_from_invite(&room_id, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn leaving_a_room_drops_its_stores() {
        let (_dir, cache) = test_cache();
        let room_id = room("!a:example.org");
        cache.save_state(&fresh_sync()).unwrap();
        assert!(cache.joined_rooms().unwrap().contains(&room_id));

        let mut rx = cache.subscribe();
        let mut leave_sync = SyncResponse { next_batch: "s2".to_owned(), ..Default::default() };
        leave_sync.rooms.leave.insert(room_id.clone(), LeftRoomUpdate::default());
        cache.save_state(&leave_sync).unwrap();

        assert!(cache.joined_rooms().unwrap().is_empty());
        assert!(cache.get_timeline_range(&room_id).unwrap().is_none());
        assert!(cache.member_count(&room_id).unwrap() == 0);

        let mut saw_removed = false;
        while let Ok(signal) = rx.try_recv() {
            if let CacheSignal::RoomsRemoved { room_ids } = signal {
                assert_eq!(room_ids, vec![room_id.clone()]);
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[test]
    fn space_edges_follow_state() {
        let (_dir, cache) = test_cache();
        let space = room("!space:example.org");
        let child = room("!child:example.org");

        let mut sync = SyncResponse { next_batch: "s1".to_owned(), ..Default::default() };
        sync.rooms.join.insert(
            space.clone(),
            joined_update(
                vec![
                    state_event(
                        "$c:example.org",
                        kinds::ROOM_CREATE,
                        "",
                        json!({ "type": "m.space" }),
                    ),
                    state_event(
                        "$sc:example.org",
                        kinds::SPACE_CHILD,
                        child.as_str(),
                        json!({ "via": ["example.org"] }),
                    ),
                ],
                Vec::new(),
                None,
            ),
        );
        sync.rooms.join.insert(child.clone(), joined_update(Vec::new(), Vec::new(), None));
        cache.save_state(&sync).unwrap();

        assert_eq!(cache.get_child_room_ids(&space).unwrap(), vec![child.clone()]);
        assert_eq!(cache.get_parent_room_ids(&child).unwrap(), vec![space.clone()]);
        assert!(cache.spaces().unwrap().contains_key(&space));

        // An empty via list retracts the edge.
        let update = joined_update(
            vec![state_event(
                "$sc2:example.org",
                kinds::SPACE_CHILD,
                child.as_str(),
                json!({ "via": [] }),
            )],
            Vec::new(),
            None,
        );
        cache.save_state(&sync_with_joined_room(&space, "s2", update)).unwrap();
        assert!(cache.get_child_room_ids(&space).unwrap().is_empty());
        assert!(cache.get_parent_room_ids(&child).unwrap().is_empty());
    }
}
