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

//! The event model stored by the cache.
//!
//! Events are kept as self-describing records with the raw JSON content
//! attached. Known state-event kinds decode into the [`StateContent`] sum on
//! demand; anything else stays an opaque blob, so unknown event types survive
//! a round trip unharmed.

use std::collections::BTreeMap;

use ruma::{OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Event types the cache inspects by name.
pub mod kinds {
    pub const ROOM_CREATE: &str = "m.room.create";
    pub const ROOM_NAME: &str = "m.room.name";
    pub const ROOM_TOPIC: &str = "m.room.topic";
    pub const ROOM_AVATAR: &str = "m.room.avatar";
    pub const ROOM_CANONICAL_ALIAS: &str = "m.room.canonical_alias";
    pub const ROOM_JOIN_RULES: &str = "m.room.join_rules";
    pub const ROOM_GUEST_ACCESS: &str = "m.room.guest_access";
    pub const ROOM_HISTORY_VISIBILITY: &str = "m.room.history_visibility";
    pub const ROOM_ENCRYPTION: &str = "m.room.encryption";
    pub const ROOM_MEMBER: &str = "m.room.member";
    pub const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
    pub const ROOM_TOMBSTONE: &str = "m.room.tombstone";
    pub const ROOM_PINNED_EVENTS: &str = "m.room.pinned_events";
    pub const ROOM_MESSAGE: &str = "m.room.message";
    pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
    pub const ROOM_REDACTION: &str = "m.room.redaction";
    pub const STICKER: &str = "m.sticker";
    pub const SPACE_CHILD: &str = "m.space.child";
    pub const SPACE_PARENT: &str = "m.space.parent";
    pub const IMAGE_PACK: &str = "im.ponies.room_emotes";
    pub const FULLY_READ: &str = "m.fully_read";
    /// Account data listing event types the timeline hides.
    pub const HIDDEN_EVENTS: &str = "im.quill.hidden_events";
}

/// A state event as stored in a room's state sub-stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateEventRecord {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    pub kind: String,
    #[serde(default)]
    pub state_key: String,
    #[serde(default)]
    pub content: JsonValue,
}

impl StateEventRecord {
    /// Decode the content into the tagged sum for this record's kind.
    pub fn decoded(&self) -> StateContent {
        StateContent::decode(&self.kind, &self.content)
    }
}

/// A timeline event as stored in a room's `events` sub-store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineEventRecord {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    pub kind: String,
    /// Present iff this is a state event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: JsonValue,
    /// Target of an `m.room.redaction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    /// Local echo transaction id, present on events we sent ourselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<OwnedTransactionId>,
    /// Set once the event body was replaced by a redaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redacted: bool,
}

impl TimelineEventRecord {
    /// Whether the event renders as a message in the timeline.
    pub fn is_message(&self) -> bool {
        self.state_key.is_none()
            && matches!(
                self.kind.as_str(),
                kinds::ROOM_MESSAGE | kinds::ROOM_ENCRYPTED | kinds::STICKER
            )
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The events this one relates to (edits, reactions, replies).
    pub fn relations(&self) -> Vec<Relation> {
        let mut out = Vec::new();
        let Some(relates_to) = self.content.get("m.relates_to") else {
            return out;
        };
        if let Ok(RawRelation { event_id: Some(event_id), rel_type }) =
            serde_json::from_value::<RawRelation>(relates_to.clone())
        {
            out.push(Relation { event_id, rel_type: rel_type.unwrap_or_default() });
        }
        if let Some(reply) = relates_to
            .get("m.in_reply_to")
            .and_then(|r| r.get("event_id"))
            .and_then(JsonValue::as_str)
            .and_then(|s| ruma::EventId::parse(s).ok())
        {
            out.push(Relation {
                event_id: reply,
                rel_type: "m.in_reply_to".to_owned(),
            });
        }
        out
    }

    /// View this record as a state event, if it is one.
    pub fn as_state(&self) -> Option<StateEventRecord> {
        let state_key = self.state_key.clone()?;
        Some(StateEventRecord {
            event_id: self.event_id.clone(),
            sender: self.sender.clone(),
            origin_server_ts: self.origin_server_ts,
            kind: self.kind.clone(),
            state_key,
            content: self.content.clone(),
        })
    }
}

#[derive(Deserialize)]
struct RawRelation {
    #[serde(default)]
    event_id: Option<OwnedEventId>,
    #[serde(default)]
    rel_type: Option<String>,
}

/// A single relation edge extracted from an event's content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub event_id: OwnedEventId,
    pub rel_type: String,
}

/// Decoded content of the state-event kinds the cache understands.
#[derive(Clone, Debug)]
pub enum StateContent {
    Create(CreateContent),
    Name(NameContent),
    Topic(TopicContent),
    Avatar(AvatarContent),
    CanonicalAlias(CanonicalAliasContent),
    JoinRules(JoinRulesContent),
    GuestAccess(GuestAccessContent),
    HistoryVisibility(HistoryVisibilityContent),
    Encryption(EncryptionContent),
    Member(MemberContent),
    PowerLevels(PowerLevelsContent),
    Tombstone(TombstoneContent),
    PinnedEvents(PinnedEventsContent),
    SpaceChild(SpaceChildContent),
    SpaceParent(SpaceParentContent),
    ImagePack(ImagePackContent),
    /// Any kind the cache does not inspect, kept verbatim.
    Unknown(JsonValue),
}

impl StateContent {
    pub fn decode(kind: &str, content: &JsonValue) -> Self {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: &str,
            content: &JsonValue,
        ) -> Option<T> {
            match serde_json::from_value(content.clone()) {
                Ok(decoded) => Some(decoded),
                Err(error) => {
                    warn!(kind, %error, "dropping undecodable state content");
                    None
                }
            }
        }

        let decoded = match kind {
            kinds::ROOM_CREATE => parse(kind, content).map(Self::Create),
            kinds::ROOM_NAME => parse(kind, content).map(Self::Name),
            kinds::ROOM_TOPIC => parse(kind, content).map(Self::Topic),
            kinds::ROOM_AVATAR => parse(kind, content).map(Self::Avatar),
            kinds::ROOM_CANONICAL_ALIAS => parse(kind, content).map(Self::CanonicalAlias),
            kinds::ROOM_JOIN_RULES => parse(kind, content).map(Self::JoinRules),
            kinds::ROOM_GUEST_ACCESS => parse(kind, content).map(Self::GuestAccess),
            kinds::ROOM_HISTORY_VISIBILITY => parse(kind, content).map(Self::HistoryVisibility),
            kinds::ROOM_ENCRYPTION => parse(kind, content).map(Self::Encryption),
            kinds::ROOM_MEMBER => parse(kind, content).map(Self::Member),
            kinds::ROOM_POWER_LEVELS => parse(kind, content).map(Self::PowerLevels),
            kinds::ROOM_TOMBSTONE => parse(kind, content).map(Self::Tombstone),
            kinds::ROOM_PINNED_EVENTS => parse(kind, content).map(Self::PinnedEvents),
            kinds::SPACE_CHILD => parse(kind, content).map(Self::SpaceChild),
            kinds::SPACE_PARENT => parse(kind, content).map(Self::SpaceParent),
            kinds::IMAGE_PACK => parse(kind, content).map(Self::ImagePack),
            _ => None,
        };
        decoded.unwrap_or_else(|| Self::Unknown(content.clone()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateContent {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
}

impl CreateContent {
    pub fn is_space(&self) -> bool {
        self.room_type.as_deref() == Some("m.space")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NameContent {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopicContent {
    #[serde(default)]
    pub topic: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AvatarContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CanonicalAliasContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_aliases: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRule {
    #[default]
    Public,
    Invite,
    Knock,
    Restricted,
    KnockRestricted,
    Private,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinRulesContent {
    #[serde(default)]
    pub join_rule: JoinRule,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAccess {
    CanJoin,
    #[default]
    Forbidden,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuestAccessContent {
    #[serde(default)]
    pub guest_access: GuestAccess,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryVisibilityContent {
    #[serde(default)]
    pub history_visibility: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContent {
    #[serde(default)]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    #[default]
    Leave,
    Ban,
    Knock,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemberContent {
    #[serde(default)]
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

fn default_state_level() -> i64 {
    50
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PowerLevelsContent {
    #[serde(default)]
    pub users: BTreeMap<OwnedUserId, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_state_level")]
    pub state_default: i64,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: default_state_level(),
        }
    }
}

impl PowerLevelsContent {
    pub fn user_level(&self, user_id: &ruma::UserId) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }

    /// Level required to send the given state event type.
    pub fn state_level(&self, kind: &str) -> i64 {
        self.events.get(kind).copied().unwrap_or(self.state_default)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TombstoneContent {
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_room: Option<OwnedRoomId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PinnedEventsContent {
    #[serde(default)]
    pub pinned: Vec<OwnedEventId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpaceChildContent {
    #[serde(default)]
    pub via: Vec<String>,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpaceParentContent {
    #[serde(default)]
    pub via: Vec<String>,
    #[serde(default)]
    pub canonical: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackImage {
    pub url: String,
    #[serde(default)]
    pub usage: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub usage: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImagePackContent {
    #[serde(default)]
    pub images: BTreeMap<String, PackImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack: Option<PackMeta>,
}

/// One image pack derived from a room's committed state.
#[derive(Clone, Debug)]
pub struct ImagePackInfo {
    pub source_room: OwnedRoomId,
    pub state_key: String,
    pub pack_name: Option<String>,
    pub images: BTreeMap<String, PackImage>,
}

/// Account data content for [`kinds::HIDDEN_EVENTS`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HiddenEventsContent {
    #[serde(default)]
    pub hidden_event_types: Vec<String>,
}

/// Materialized info about a room member.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    /// Another joined member currently shares this display name.
    #[serde(default)]
    pub is_display_name_ambiguous: bool,
}

/// A member as returned by the paginated member queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: OwnedUserId,
    pub display_name: String,
    pub avatar_url: String,
}

/// The denormalized room summary kept in the `rooms` / `invites` stores.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub is_invite: bool,
    #[serde(default)]
    pub is_space: bool,
    #[serde(default)]
    pub is_tombstoned: bool,
    #[serde(default)]
    pub join_rule: JoinRule,
    #[serde(default)]
    pub guest_access: bool,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub last_message_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionContent>,
}

/// A room name/alias pair for quick-switcher style lookups.
#[derive(Clone, Debug)]
pub struct RoomNameAlias {
    pub room_id: OwnedRoomId,
    pub name: String,
    pub alias: String,
}

/// Last known presence of a user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    #[serde(default)]
    pub presence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_ago: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currently_active: Option<bool>,
}

/// Inclusive bounds of a room's event order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelineRange {
    pub first: u64,
    pub last: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn member_content_decodes() {
        let content = json!({
            "membership": "join",
            "displayname": "Alice",
            "avatar_url": "mxc://example.org/abc",
        });
        match StateContent::decode(kinds::ROOM_MEMBER, &content) {
            StateContent::Member(m) => {
                assert_eq!(m.membership, Membership::Join);
                assert_eq!(m.displayname.as_deref(), Some("Alice"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_stay_opaque() {
        let content = json!({ "custom": ["x", "y"] });
        match StateContent::decode("org.example.custom", &content) {
            StateContent::Unknown(v) => assert_eq!(v, content),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn undecodable_known_kind_degrades_to_unknown() {
        let content = json!({ "join_rule": 17 });
        assert!(matches!(
            StateContent::decode(kinds::ROOM_JOIN_RULES, &content),
            StateContent::Unknown(_)
        ));
    }

    #[test]
    fn relations_are_extracted() {
        let event: TimelineEventRecord = serde_json::from_value(json!({
            "event_id": "$edit:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_700_000_000_000u64,
            "kind": "m.room.message",
            "content": {
                "body": "* fixed",
                "m.relates_to": { "event_id": "$orig:example.org", "rel_type": "m.replace" },
            },
        }))
        .unwrap();

        let relations = event.relations();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].event_id.as_str(), "$orig:example.org");
        assert_eq!(relations[0].rel_type, "m.replace");
    }

    #[test]
    fn message_classification() {
        let mut event: TimelineEventRecord = serde_json::from_value(json!({
            "event_id": "$a:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1u64,
            "kind": "m.room.message",
            "content": { "body": "hi" },
        }))
        .unwrap();
        assert!(event.is_message());

        event.kind = kinds::ROOM_MEMBER.to_owned();
        event.state_key = Some("@alice:example.org".to_owned());
        assert!(!event.is_message());
        assert!(event.is_state());
    }
}
