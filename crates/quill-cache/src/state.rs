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

//! The materialized room state view.
//!
//! Per room the cache keeps the latest state event for every `(type,
//! state_key)` pair, a separate member store for joined members, a wholesale
//! snapshot for invites, and a denormalized [`RoomInfo`] summary recomputed
//! whenever state changes. Space relations are mirrored into two directed
//! edge stores so that both directions are one prefix scan.

use std::collections::BTreeSet;

use redb::ReadableTable;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::warn;

use crate::{
    db::{self, tables, tables::role, KvTable, WriteCtx},
    encode::{split_key, EncodeKey},
    error::Result,
    events::{
        kinds, ImagePackInfo, MemberInfo, Membership, RoomInfo, RoomMember, RoomNameAlias,
        StateContent, StateEventRecord,
    },
    responses::InvitedRoomUpdate,
    signals::CacheSignal,
    Cache,
};

/// An edge asserted by an `m.space.child` event in the space.
const EDGE_FROM_CHILD: u8 = 1;
/// An edge asserted by an `m.space.parent` event in the room.
const EDGE_FROM_PARENT: u8 = 1 << 1;

fn state_record<T>(table: &T, kind: &str) -> Result<Option<StateEventRecord>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(db::get_raw(table, &kind.encode())?.and_then(|bytes| db::decode_value(&bytes)))
}

fn state_record_with_key<T>(
    table: &T,
    kind: &str,
    state_key: &str,
) -> Result<Option<StateEventRecord>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(db::get_raw(table, &(kind, state_key).encode())?.and_then(|bytes| db::decode_value(&bytes)))
}

fn state_content<T>(table: &T, kind: &str) -> Result<Option<StateContent>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(state_record(table, kind)?.map(|record| record.decoded()))
}

fn member_info<T>(table: &T, user_id: &UserId) -> Result<Option<MemberInfo>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(db::get_raw(table, &user_id.encode())?.and_then(|bytes| db::decode_value(&bytes)))
}

fn members_page<T>(table: &T, start: usize, len: usize) -> Result<Vec<RoomMember>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for (key, value) in db::scan_prefix(table, b"")?.into_iter().skip(start).take(len) {
        let Some(user_id) = split_key(&key)
            .first()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| UserId::parse(s).ok())
        else {
            continue;
        };
        let Some(info) = db::decode_value::<MemberInfo>(&value) else { continue };
        out.push(RoomMember {
            display_name: rendered_name(&info, &user_id),
            avatar_url: info.avatar_url,
            user_id,
        });
    }
    Ok(out)
}

/// Displayed name, with the user id appended when two joined members share
/// the raw display name.
fn rendered_name(info: &MemberInfo, user_id: &UserId) -> String {
    if info.is_display_name_ambiguous {
        format!("{} ({})", info.name, user_id)
    } else {
        info.name.clone()
    }
}

impl Cache {
    /// Apply a batch of state events to a room, in server order.
    ///
    /// With `wipe` the state stores are cleared first, which is how gap
    /// recovery resets a room before replaying a full snapshot.
    pub fn update_state(
        &self,
        room_id: &RoomId,
        events: &[StateEventRecord],
        wipe: bool,
    ) -> Result<()> {
        self.write_with(|ctx| {
            self.save_state_events_tx(ctx, room_id, events, wipe)?;
            self.refresh_room_info_tx(ctx, room_id)?;
            Ok(())
        })
    }

    pub(crate) fn save_state_events_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        events: &[StateEventRecord],
        wipe: bool,
    ) -> Result<()> {
        let mut state = db::open_room_table(ctx, room_id, role::STATE)?;
        let mut state_key = db::open_room_table(ctx, room_id, role::STATE_KEY)?;
        let mut members = db::open_room_table(ctx, room_id, role::MEMBERS)?;
        if wipe {
            for (key, _) in db::scan_prefix(&state, b"")? {
                state.remove(key.as_slice())?;
            }
            for (key, _) in db::scan_prefix(&state_key, b"")? {
                state_key.remove(key.as_slice())?;
            }
        }
        for event in events {
            apply_state_event(&mut state, &mut state_key, &mut members, event)?;
        }
        Ok(())
    }

    /// Recompute the denormalized summary of a joined room.
    pub(crate) fn refresh_room_info_tx(&self, ctx: &WriteCtx, room_id: &RoomId) -> Result<RoomInfo> {
        let info = {
            let state = db::open_room_table(ctx, room_id, role::STATE)?;
            let members = db::open_room_table(ctx, room_id, role::MEMBERS)?;
            let mut rooms = db::open_table(ctx, tables::ROOMS)?;

            let previous: Option<RoomInfo> =
                db::get_raw(&rooms, &room_id.encode())?.and_then(|b| db::decode_value(&b));
            let info = self.compute_room_info(&StateLookup::Singleton(&state), &members, previous)?;
            rooms.insert(room_id.encode().as_slice(), db::encode_value(&info)?.as_slice())?;
            info
        };
        Ok(info)
    }

    fn compute_room_info(
        &self,
        state: &StateLookup<'_, '_>,
        members: &KvTable<'_>,
        previous: Option<RoomInfo>,
    ) -> Result<RoomInfo> {
        use redb::ReadableTableMetadata;

        let mut info = RoomInfo {
            last_message_ts: previous.map(|p| p.last_message_ts).unwrap_or_default(),
            ..Default::default()
        };
        info.member_count = members.len()?;

        if let Some(StateContent::Create(create)) = state.content(kinds::ROOM_CREATE)? {
            info.is_space = create.is_space();
            info.version = create.room_version.unwrap_or_else(|| "1".to_owned());
        }
        if let Some(StateContent::Topic(topic)) = state.content(kinds::ROOM_TOPIC)? {
            info.topic = topic.topic;
        }
        if let Some(StateContent::JoinRules(rules)) = state.content(kinds::ROOM_JOIN_RULES)? {
            info.join_rule = rules.join_rule;
        }
        if let Some(StateContent::GuestAccess(guest)) = state.content(kinds::ROOM_GUEST_ACCESS)? {
            info.guest_access = guest.guest_access == crate::events::GuestAccess::CanJoin;
        }
        if let Some(StateContent::Encryption(encryption)) = state.content(kinds::ROOM_ENCRYPTION)? {
            info.encryption = Some(encryption);
        }
        info.is_tombstoned =
            matches!(state.content(kinds::ROOM_TOMBSTONE)?, Some(StateContent::Tombstone(_)));

        info.name = self.compute_room_name(state, members, info.member_count)?;
        info.avatar_url = self.compute_room_avatar(state, members, info.member_count)?;
        Ok(info)
    }

    /// Explicit name, then canonical alias, then a name derived from the
    /// other members' display names.
    fn compute_room_name(
        &self,
        state: &StateLookup<'_, '_>,
        members: &KvTable<'_>,
        member_count: u64,
    ) -> Result<String> {
        if let Some(StateContent::Name(name)) = state.content(kinds::ROOM_NAME)? {
            if !name.name.is_empty() {
                return Ok(name.name);
            }
        }
        if let Some(StateContent::CanonicalAlias(alias)) =
            state.content(kinds::ROOM_CANONICAL_ALIAS)?
        {
            if let Some(alias) = alias.alias.filter(|a| !a.is_empty()) {
                return Ok(alias);
            }
        }

        let mut names = Vec::new();
        for (key, value) in db::scan_prefix(members, b"")? {
            let user = split_key(&key)
                .first()
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .unwrap_or_default()
                .to_owned();
            if user == self.local_user.as_str() {
                continue;
            }
            if let Some(info) = db::decode_value::<MemberInfo>(&value) {
                names.push(info.name);
            }
            if names.len() == 3 {
                break;
            }
        }
        names.sort_unstable();

        let others = member_count.saturating_sub(1);
        Ok(if names.is_empty() {
            "Empty room".to_owned()
        } else if others > names.len() as u64 {
            format!("{}, and {} others", names.join(", "), others - names.len() as u64)
        } else {
            names.join(", ")
        })
    }

    /// Explicit avatar, with the other member's avatar as the fallback for
    /// two-person rooms.
    fn compute_room_avatar(
        &self,
        state: &StateLookup<'_, '_>,
        members: &KvTable<'_>,
        member_count: u64,
    ) -> Result<String> {
        if let Some(StateContent::Avatar(avatar)) = state.content(kinds::ROOM_AVATAR)? {
            if let Some(url) = avatar.url.filter(|u| !u.is_empty()) {
                return Ok(url);
            }
        }
        if member_count == 2 {
            for (key, value) in db::scan_prefix(members, b"")? {
                let user = split_key(&key)
                    .first()
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .unwrap_or_default();
                if user == self.local_user.as_str() {
                    continue;
                }
                if let Some(info) = db::decode_value::<MemberInfo>(&value) {
                    return Ok(info.avatar_url);
                }
            }
        }
        Ok(String::new())
    }

    /// Replace the invite snapshot of a room wholesale.
    pub(crate) fn save_invite_tx(
        &self,
        ctx: &WriteCtx,
        room_id: &RoomId,
        update: &InvitedRoomUpdate,
    ) -> Result<()> {
        let mut invite_state = db::open_room_table(ctx, room_id, role::INVITE_STATE)?;
        let mut invite_members = db::open_room_table(ctx, room_id, role::INVITE_MEMBERS)?;
        for (key, _) in db::scan_prefix(&invite_state, b"")? {
            invite_state.remove(key.as_slice())?;
        }
        for (key, _) in db::scan_prefix(&invite_members, b"")? {
            invite_members.remove(key.as_slice())?;
        }

        for event in &update.invite_state {
            if event.kind == kinds::ROOM_MEMBER {
                if let StateContent::Member(member) = event.decoded() {
                    let info = MemberInfo {
                        name: member
                            .displayname
                            .clone()
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| event.state_key.clone()),
                        avatar_url: member.avatar_url.clone().unwrap_or_default(),
                        is_display_name_ambiguous: false,
                    };
                    invite_members.insert(
                        event.state_key.as_str().encode().as_slice(),
                        db::encode_value(&info)?.as_slice(),
                    )?;
                }
            }
            invite_state.insert(
                (event.kind.as_str(), event.state_key.as_str()).encode().as_slice(),
                db::encode_value(event)?.as_slice(),
            )?;
        }

        let info = {
            let mut info =
                self.compute_room_info(&StateLookup::Keyed(&invite_state), &invite_members, None)?;
            info.is_invite = true;
            info
        };
        let mut invites = db::open_table(ctx, tables::INVITES)?;
        invites.insert(room_id.encode().as_slice(), db::encode_value(&info)?.as_slice())?;
        Ok(())
    }

    /// Remove a joined room and all its sub-stores.
    pub fn remove_room(&self, room_id: &RoomId) -> Result<()> {
        self.write_with(|ctx| {
            self.remove_room_tx(ctx, room_id)?;
            let signals = self.signals.clone();
            let room_id = room_id.to_owned();
            ctx.on_commit(move || {
                let _ = signals.send(CacheSignal::RoomsRemoved { room_ids: vec![room_id] });
            });
            Ok(())
        })
    }

    pub(crate) fn remove_room_tx(&self, ctx: &WriteCtx, room_id: &RoomId) -> Result<()> {
        db::delete_room_tables(ctx, room_id)?;
        {
            let mut rooms = db::open_table(ctx, tables::ROOMS)?;
            rooms.remove(room_id.encode().as_slice())?;
        }
        {
            let mut invites = db::open_table(ctx, tables::INVITES)?;
            invites.remove(room_id.encode().as_slice())?;
        }
        {
            let mut receipts = db::open_table(ctx, tables::READ_RECEIPTS)?;
            for (key, _) in db::scan_prefix(&receipts, &room_id.encode())? {
                receipts.remove(key.as_slice())?;
            }
        }
        {
            let mut system = db::open_table(ctx, tables::SYSTEM)?;
            system.remove(("prev_batch", room_id.as_str()).encode().as_slice())?;
        }
        self.remove_space_edges_tx(ctx, room_id)?;
        Ok(())
    }

    pub(crate) fn remove_invite_tx(&self, ctx: &WriteCtx, room_id: &RoomId) -> Result<()> {
        let name = tables::room_table_name(room_id, role::INVITE_STATE);
        ctx.delete_table(crate::db::KvDef::new(&name))?;
        let name = tables::room_table_name(room_id, role::INVITE_MEMBERS);
        ctx.delete_table(crate::db::KvDef::new(&name))?;
        let mut invites = db::open_table(ctx, tables::INVITES)?;
        invites.remove(room_id.encode().as_slice())?;
        Ok(())
    }

    pub fn remove_invite(&self, room_id: &RoomId) -> Result<()> {
        self.write_with(|ctx| self.remove_invite_tx(ctx, room_id))
    }

    fn remove_space_edges_tx(&self, ctx: &WriteCtx, room_id: &RoomId) -> Result<()> {
        let mut children = db::open_table(ctx, tables::SPACE_CHILDREN)?;
        let mut parents = db::open_table(ctx, tables::SPACE_PARENTS)?;
        for (key, _) in db::scan_prefix(&children, &room_id.encode())? {
            if let [space, child] = split_key(&key)[..] {
                parents.remove(mirror_key(child, space).as_slice())?;
            }
            children.remove(key.as_slice())?;
        }
        for (key, _) in db::scan_prefix(&parents, &room_id.encode())? {
            if let [room, parent] = split_key(&key)[..] {
                children.remove(mirror_key(parent, room).as_slice())?;
            }
            parents.remove(key.as_slice())?;
        }
        Ok(())
    }

    /// Recompute the space edges contributed by the given rooms.
    ///
    /// Each mirrored edge carries a bitmask of the sides asserting it, so
    /// clearing one room's assertions cannot disturb edges the other side
    /// still vouches for.
    pub(crate) fn update_spaces_tx(
        &self,
        ctx: &WriteCtx,
        touched: &BTreeSet<OwnedRoomId>,
    ) -> Result<()> {
        let mut children = db::open_table(ctx, tables::SPACE_CHILDREN)?;
        let mut parents = db::open_table(ctx, tables::SPACE_PARENTS)?;

        for room_id in touched {
            for (key, value) in db::scan_prefix(&children, &room_id.encode())? {
                if let [space, child] = split_key(&key)[..] {
                    let flags = value.first().copied().unwrap_or(0) & !EDGE_FROM_CHILD;
                    write_edge(&mut children, &mut parents, space, child, flags)?;
                }
            }
            for (key, value) in db::scan_prefix(&parents, &room_id.encode())? {
                if let [room, parent] = split_key(&key)[..] {
                    let flags = value.first().copied().unwrap_or(0) & !EDGE_FROM_PARENT;
                    write_edge(&mut children, &mut parents, parent, room, flags)?;
                }
            }

            let state_key = db::open_room_table(ctx, room_id, role::STATE_KEY)?;
            for (_, value) in db::scan_prefix(&state_key, &kinds::SPACE_CHILD.encode())? {
                let Some(event) = db::decode_value::<StateEventRecord>(&value) else { continue };
                let StateContent::SpaceChild(content) = event.decoded() else { continue };
                let Ok(child) = RoomId::parse(event.state_key.as_str()) else { continue };
                // An empty via list retracts the relationship.
                if content.via.is_empty() {
                    continue;
                }
                merge_edge(&mut children, &mut parents, room_id, &child, EDGE_FROM_CHILD)?;
            }
            for (_, value) in db::scan_prefix(&state_key, &kinds::SPACE_PARENT.encode())? {
                let Some(event) = db::decode_value::<StateEventRecord>(&value) else { continue };
                let StateContent::SpaceParent(content) = event.decoded() else { continue };
                let Ok(parent) = RoomId::parse(event.state_key.as_str()) else { continue };
                if content.via.is_empty() {
                    continue;
                }
                merge_edge(&mut children, &mut parents, &parent, room_id, EDGE_FROM_PARENT)?;
            }
        }
        Ok(())
    }

    /// Spaces this room is a child of.
    pub fn get_parent_room_ids(&self, room_id: &RoomId) -> Result<Vec<OwnedRoomId>> {
        self.read_with(|txn| {
            let Some(parents) = db::open_read(txn, tables::SPACE_PARENTS)? else {
                return Ok(Vec::new());
            };
            Ok(edge_targets(&parents, room_id)?)
        })
    }

    /// Rooms this space lists as children.
    pub fn get_child_room_ids(&self, room_id: &RoomId) -> Result<Vec<OwnedRoomId>> {
        self.read_with(|txn| {
            let Some(children) = db::open_read(txn, tables::SPACE_CHILDREN)? else {
                return Ok(Vec::new());
            };
            Ok(edge_targets(&children, room_id)?)
        })
    }

    /// All known spaces, with their summary where we are joined.
    pub fn spaces(&self) -> Result<std::collections::BTreeMap<OwnedRoomId, Option<RoomInfo>>> {
        self.read_with(|txn| {
            let mut out = std::collections::BTreeMap::new();
            if let Some(rooms) = db::open_read(txn, tables::ROOMS)? {
                for (key, value) in db::scan_prefix(&rooms, b"")? {
                    let Some(info) = db::decode_value::<RoomInfo>(&value) else { continue };
                    if info.is_space {
                        if let Some(room_id) = room_id_from_key(&key) {
                            out.insert(room_id, Some(info));
                        }
                    }
                }
            }
            if let Some(children) = db::open_read(txn, tables::SPACE_CHILDREN)? {
                for (key, _) in db::scan_prefix(&children, b"")? {
                    if let Some(space) = room_id_from_key(&key) {
                        out.entry(space).or_insert(None);
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn get_state_event(&self, room_id: &RoomId, kind: &str) -> Result<Option<StateEventRecord>> {
        self.read_with(|txn| {
            let Some(state) = db::open_room_read(txn, room_id, role::STATE)? else {
                return Ok(None);
            };
            state_record(&state, kind)
        })
    }

    pub fn get_state_event_with_key(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Option<StateEventRecord>> {
        if state_key.is_empty() {
            return self.get_state_event(room_id, kind);
        }
        self.read_with(|txn| {
            let Some(table) = db::open_room_read(txn, room_id, role::STATE_KEY)? else {
                return Ok(None);
            };
            state_record_with_key(&table, kind, state_key)
        })
    }

    /// Every state event of a kind: the singleton plus all keyed instances.
    pub fn get_state_events_with_type(
        &self,
        room_id: &RoomId,
        kind: &str,
    ) -> Result<Vec<StateEventRecord>> {
        self.read_with(|txn| {
            let mut out = Vec::new();
            if let Some(state) = db::open_room_read(txn, room_id, role::STATE)? {
                if let Some(record) = state_record(&state, kind)? {
                    out.push(record);
                }
            }
            if let Some(table) = db::open_room_read(txn, room_id, role::STATE_KEY)? {
                for (_, value) in db::scan_prefix(&table, &kind.encode())? {
                    if let Some(record) = db::decode_value(&value) {
                        out.push(record);
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn joined_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        self.read_with(|txn| {
            let Some(rooms) = db::open_read(txn, tables::ROOMS)? else { return Ok(Vec::new()) };
            Ok(db::scan_prefix(&rooms, b"")?
                .into_iter()
                .filter_map(|(key, _)| room_id_from_key(&key))
                .collect())
        })
    }

    /// All saved room ids, joined rooms only.
    pub fn room_ids(&self) -> Result<Vec<OwnedRoomId>> {
        self.joined_rooms()
    }

    pub fn room_info(
        &self,
        with_invites: bool,
    ) -> Result<std::collections::BTreeMap<OwnedRoomId, RoomInfo>> {
        self.read_with(|txn| {
            let mut out = std::collections::BTreeMap::new();
            if let Some(rooms) = db::open_read(txn, tables::ROOMS)? {
                for (key, value) in db::scan_prefix(&rooms, b"")? {
                    if let (Some(room_id), Some(info)) =
                        (room_id_from_key(&key), db::decode_value(&value))
                    {
                        out.insert(room_id, info);
                    }
                }
            }
            if with_invites {
                if let Some(invites) = db::open_read(txn, tables::INVITES)? {
                    for (key, value) in db::scan_prefix(&invites, b"")? {
                        if let (Some(room_id), Some(info)) =
                            (room_id_from_key(&key), db::decode_value(&value))
                        {
                            out.insert(room_id, info);
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn single_room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        self.read_with(|txn| {
            let Some(rooms) = db::open_read(txn, tables::ROOMS)? else { return Ok(None) };
            Ok(db::get_raw(&rooms, &room_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub fn get_room_info(
        &self,
        rooms: &[OwnedRoomId],
    ) -> Result<std::collections::BTreeMap<OwnedRoomId, RoomInfo>> {
        let mut out = std::collections::BTreeMap::new();
        for room_id in rooms {
            if let Some(info) = self.single_room_info(room_id)? {
                out.insert(room_id.clone(), info);
            }
        }
        Ok(out)
    }

    pub fn invites(&self) -> Result<std::collections::BTreeMap<OwnedRoomId, RoomInfo>> {
        self.read_with(|txn| {
            let mut out = std::collections::BTreeMap::new();
            let Some(invites) = db::open_read(txn, tables::INVITES)? else { return Ok(out) };
            for (key, value) in db::scan_prefix(&invites, b"")? {
                if let (Some(room_id), Some(info)) =
                    (room_id_from_key(&key), db::decode_value(&value))
                {
                    out.insert(room_id, info);
                }
            }
            Ok(out)
        })
    }

    pub fn invite(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        self.read_with(|txn| {
            let Some(invites) = db::open_read(txn, tables::INVITES)? else { return Ok(None) };
            Ok(db::get_raw(&invites, &room_id.encode())?.and_then(|b| db::decode_value(&b)))
        })
    }

    pub fn room_names_and_aliases(&self) -> Result<Vec<RoomNameAlias>> {
        self.read_with(|txn| {
            let mut out = Vec::new();
            let Some(rooms) = db::open_read(txn, tables::ROOMS)? else { return Ok(out) };
            for (key, value) in db::scan_prefix(&rooms, b"")? {
                let Some(room_id) = room_id_from_key(&key) else { continue };
                let Some(info) = db::decode_value::<RoomInfo>(&value) else { continue };
                let alias = match db::open_room_read(txn, &room_id, role::STATE)? {
                    Some(state) => match state_content(&state, kinds::ROOM_CANONICAL_ALIAS)? {
                        Some(StateContent::CanonicalAlias(content)) => {
                            content.alias.unwrap_or_default()
                        }
                        _ => String::new(),
                    },
                    None => String::new(),
                };
                out.push(RoomNameAlias { room_id, name: info.name, alias });
            }
            Ok(out)
        })
    }

    pub fn get_members(&self, room_id: &RoomId, start: usize, len: usize) -> Result<Vec<RoomMember>> {
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::MEMBERS)? else {
                return Ok(Vec::new());
            };
            members_page(&members, start, len)
        })
    }

    pub fn get_members_from_invite(
        &self,
        room_id: &RoomId,
        start: usize,
        len: usize,
    ) -> Result<Vec<RoomMember>> {
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::INVITE_MEMBERS)? else {
                return Ok(Vec::new());
            };
            members_page(&members, start, len)
        })
    }

    pub fn member_count(&self, room_id: &RoomId) -> Result<u64> {
        use redb::ReadableTableMetadata;
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::MEMBERS)? else {
                return Ok(0);
            };
            Ok(members.len()?)
        })
    }

    pub fn room_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>> {
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::MEMBERS)? else {
                return Ok(Vec::new());
            };
            Ok(db::scan_prefix(&members, b"")?
                .into_iter()
                .filter_map(|(key, _)| {
                    split_key(&key)
                        .first()
                        .and_then(|raw| std::str::from_utf8(raw).ok())
                        .and_then(|s| UserId::parse(s).ok())
                })
                .collect())
        })
    }

    pub fn is_room_member(&self, user_id: &UserId, room_id: &RoomId) -> Result<bool> {
        Ok(self.get_member(room_id, user_id)?.is_some())
    }

    pub(crate) fn get_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<MemberInfo>> {
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::MEMBERS)? else {
                return Ok(None);
            };
            member_info(&members, user_id)
        })
    }

    pub fn get_invite_member(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<MemberInfo>> {
        self.read_with(|txn| {
            let Some(members) = db::open_room_read(txn, room_id, role::INVITE_MEMBERS)? else {
                return Ok(None);
            };
            member_info(&members, user_id)
        })
    }

    /// The display name of a member, disambiguated when shared.
    pub fn display_name(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>> {
        Ok(self.get_member(room_id, user_id)?.map(|info| rendered_name(&info, user_id)))
    }

    pub fn avatar_url(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>> {
        Ok(self.get_member(room_id, user_id)?.map(|info| info.avatar_url))
    }

    /// Whether the user's power level reaches the lowest level required by
    /// any of the given state event types.
    pub fn has_enough_power_level(
        &self,
        event_kinds: &[&str],
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<bool> {
        let levels = match self.get_state_event(room_id, kinds::ROOM_POWER_LEVELS)? {
            Some(record) => match record.decoded() {
                StateContent::PowerLevels(levels) => levels,
                _ => Default::default(),
            },
            None => Default::default(),
        };
        let required =
            event_kinds.iter().map(|kind| levels.state_level(kind)).min().unwrap_or(0);
        Ok(levels.user_level(user_id) >= required)
    }

    pub fn is_room_encrypted(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.room_encryption_settings(room_id)?.is_some())
    }

    pub fn room_encryption_settings(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<crate::events::EncryptionContent>> {
        match self.get_state_event(room_id, kinds::ROOM_ENCRYPTION)? {
            Some(record) => match record.decoded() {
                StateContent::Encryption(content) => Ok(Some(content)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Joined rooms shared with the given user.
    pub fn get_common_rooms(
        &self,
        user_id: &UserId,
    ) -> Result<std::collections::BTreeMap<OwnedRoomId, RoomInfo>> {
        let mut out = std::collections::BTreeMap::new();
        for (room_id, info) in self.room_info(false)? {
            if self.is_room_member(user_id, &room_id)? {
                out.insert(room_id, info);
            }
        }
        Ok(out)
    }

    /// Image packs usable from a room, derived from committed state.
    ///
    /// `stickers` filters to packs usable as stickers (`Some(true)`) or as
    /// emoticons (`Some(false)`).
    pub fn get_image_packs(
        &self,
        room_id: &RoomId,
        stickers: Option<bool>,
    ) -> Result<Vec<ImagePackInfo>> {
        let wanted = stickers.map(|s| if s { "sticker" } else { "emoticon" });
        let mut out = Vec::new();
        for record in self.get_state_events_with_type(room_id, kinds::IMAGE_PACK)? {
            let StateContent::ImagePack(pack) = record.decoded() else { continue };
            let pack_usage = pack.pack.as_ref().map(|p| p.usage.clone()).unwrap_or_default();
            let images: std::collections::BTreeMap<_, _> = pack
                .images
                .into_iter()
                .filter(|(_, image)| match wanted {
                    // An image with no usage list inherits the pack usage; an
                    // empty pack usage means "usable everywhere".
                    Some(usage) => {
                        let effective =
                            if image.usage.is_empty() { &pack_usage } else { &image.usage };
                        effective.is_empty() || effective.iter().any(|u| u == usage)
                    }
                    None => true,
                })
                .collect();
            if images.is_empty() {
                continue;
            }
            out.push(ImagePackInfo {
                source_room: room_id.to_owned(),
                state_key: record.state_key.clone(),
                pack_name: pack.pack.and_then(|p| p.display_name),
                images,
            });
        }
        Ok(out)
    }
}

/// How singleton state is keyed in the table at hand: joined rooms keep
/// empty-state-key events under the type alone, invite snapshots keep the
/// whole batch keyed `(type, state_key)`.
pub(crate) enum StateLookup<'a, 'txn> {
    Singleton(&'a KvTable<'txn>),
    Keyed(&'a KvTable<'txn>),
}

impl StateLookup<'_, '_> {
    fn content(&self, kind: &str) -> Result<Option<StateContent>> {
        match self {
            Self::Singleton(table) => state_content(*table, kind),
            Self::Keyed(table) => {
                Ok(state_record_with_key(*table, kind, "")?.map(|record| record.decoded()))
            }
        }
    }
}

fn apply_state_event(
    state: &mut KvTable<'_>,
    state_key_table: &mut KvTable<'_>,
    members: &mut KvTable<'_>,
    event: &StateEventRecord,
) -> Result<()> {
    if event.kind == kinds::ROOM_MEMBER {
        apply_member_event(members, event)?;
        // Membership also lands in the keyed state store so enumeration by
        // type sees it.
        state_key_table.insert(
            (event.kind.as_str(), event.state_key.as_str()).encode().as_slice(),
            db::encode_value(event)?.as_slice(),
        )?;
        return Ok(());
    }
    if event.state_key.is_empty() {
        state.insert(event.kind.as_str().encode().as_slice(), db::encode_value(event)?.as_slice())?;
    } else {
        state_key_table.insert(
            (event.kind.as_str(), event.state_key.as_str()).encode().as_slice(),
            db::encode_value(event)?.as_slice(),
        )?;
    }
    Ok(())
}

fn apply_member_event(members: &mut KvTable<'_>, event: &StateEventRecord) -> Result<()> {
    let member = match event.decoded() {
        StateContent::Member(member) => member,
        _ => {
            warn!(event_id = %event.event_id, "dropping undecodable membership event");
            return Ok(());
        }
    };
    let user_key = event.state_key.as_str().encode();

    match member.membership {
        Membership::Join => {
            let name = member
                .displayname
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| event.state_key.clone());

            let mut ambiguous = false;
            for (key, value) in db::scan_prefix(members, b"")? {
                if key == user_key {
                    continue;
                }
                let Some(mut other) = db::decode_value::<MemberInfo>(&value) else { continue };
                if other.name == name {
                    ambiguous = true;
                    if !other.is_display_name_ambiguous {
                        other.is_display_name_ambiguous = true;
                        members.insert(key.as_slice(), db::encode_value(&other)?.as_slice())?;
                    }
                }
            }
            let info = MemberInfo {
                name,
                avatar_url: member.avatar_url.clone().unwrap_or_default(),
                is_display_name_ambiguous: ambiguous,
            };
            members.insert(user_key.as_slice(), db::encode_value(&info)?.as_slice())?;
        }
        _ => {
            let removed = db::get_raw(members, &user_key)?
                .and_then(|bytes| db::decode_value::<MemberInfo>(&bytes));
            members.remove(user_key.as_slice())?;
            if let Some(removed) = removed {
                // If exactly one member is left with this name it is no
                // longer ambiguous.
                let mut holders = Vec::new();
                for (key, value) in db::scan_prefix(members, b"")? {
                    if let Some(info) = db::decode_value::<MemberInfo>(&value) {
                        if info.name == removed.name {
                            holders.push((key, info));
                        }
                    }
                }
                if let [(key, info)] = &mut holders[..] {
                    if info.is_display_name_ambiguous {
                        info.is_display_name_ambiguous = false;
                        members.insert(key.as_slice(), db::encode_value(info)?.as_slice())?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn mirror_key(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len() + 2);
    out.extend_from_slice(a);
    out.push(0xff);
    out.extend_from_slice(b);
    out.push(0xff);
    out
}

fn write_edge(
    children: &mut KvTable<'_>,
    parents: &mut KvTable<'_>,
    space: &[u8],
    child: &[u8],
    flags: u8,
) -> Result<()> {
    let child_key = mirror_key(space, child);
    let parent_key = mirror_key(child, space);
    if flags == 0 {
        children.remove(child_key.as_slice())?;
        parents.remove(parent_key.as_slice())?;
    } else {
        children.insert(child_key.as_slice(), [flags].as_slice())?;
        parents.insert(parent_key.as_slice(), [flags].as_slice())?;
    }
    Ok(())
}

fn merge_edge(
    children: &mut KvTable<'_>,
    parents: &mut KvTable<'_>,
    space: &RoomId,
    child: &RoomId,
    flag: u8,
) -> Result<()> {
    let key = mirror_key(space.as_str().as_bytes(), child.as_str().as_bytes());
    let old = db::get_raw(children, &key)?.and_then(|v| v.first().copied()).unwrap_or(0);
    write_edge(children, parents, space.as_str().as_bytes(), child.as_str().as_bytes(), old | flag)
}

fn edge_targets<T>(table: &T, room_id: &RoomId) -> Result<Vec<OwnedRoomId>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(db::scan_prefix(table, &room_id.encode())?
        .into_iter()
        .filter_map(|(key, _)| {
            split_key(&key)
                .get(1)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|s| RoomId::parse(s).ok())
        })
        .collect())
}

fn room_id_from_key(key: &[u8]) -> Option<OwnedRoomId> {
    split_key(key)
        .first()
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| RoomId::parse(s).ok())
}
