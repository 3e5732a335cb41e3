//! Live rooms.
//!
//! A room is a named broadcast group created on first join and discarded
//! when its last member leaves. Its category comes from the id prefix.

use crate::connection::ConnectionId;
use crate::error::{ChatError, ChatResult};
use crate::identity::{Identity, Role, UserId};
use crate::presence::PresenceStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Prefix of per-user private channels.
pub const USER_CHANNEL_PREFIX: &str = "user-";

/// A room identifier.
pub type RoomId = String;

/// The private channel of a user.
#[must_use]
pub fn user_channel(user_id: &str) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the id is empty, too long, reserved or
/// contains non-printable characters.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if id.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if id.starts_with(USER_CHANNEL_PREFIX) {
        return Err("Private user channels cannot be joined");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Room category, derived from the id prefix before the first `:` or `-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomCategory {
    Event,
    Poll,
    Admin,
    Other,
}

impl RoomCategory {
    #[must_use]
    pub fn of(room_id: &str) -> Self {
        let prefix = room_id
            .split_once([':', '-'])
            .map_or(room_id, |(prefix, _)| prefix);
        match prefix {
            "event" => RoomCategory::Event,
            "poll" => RoomCategory::Poll,
            "admin" => RoomCategory::Admin,
            _ => RoomCategory::Other,
        }
    }
}

/// Decides whether an identity may enter a room.
pub trait AccessPolicy: Send + Sync {
    /// # Errors
    ///
    /// Returns `PermissionDenied` when access is refused.
    fn check(&self, identity: &Identity, room_id: &str) -> ChatResult<()>;
}

/// `admin` rooms need an elevated role, `event` rooms any authenticated
/// identity, everything else is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixAccessPolicy;

impl AccessPolicy for PrefixAccessPolicy {
    fn check(&self, identity: &Identity, room_id: &str) -> ChatResult<()> {
        match RoomCategory::of(room_id) {
            RoomCategory::Admin if !identity.role().is_elevated() => {
                Err(ChatError::denied("Admin access required"))
            }
            RoomCategory::Event if !identity.is_authenticated() => {
                Err(ChatError::denied("Authentication required"))
            }
            _ => Ok(()),
        }
    }
}

/// A connection's membership in a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub connection_id: String,
    pub user_id: Option<UserId>,
    pub display_name: Option<String>,
    pub role: Role,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Member {
    #[must_use]
    pub fn new(connection: &ConnectionId, identity: &Identity) -> Self {
        let now = Utc::now();
        let user = identity.as_user();
        Self {
            connection_id: connection.to_string(),
            user_id: user.map(|u| u.user_id.clone()),
            display_name: user.map(|u| u.display_name.clone()),
            role: identity.role(),
            status: PresenceStatus::Online,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Record activity, optionally with a new status.
    pub fn touch(&mut self, status: Option<PresenceStatus>) {
        if let Some(status) = status {
            self.status = status;
        }
        self.last_seen = Utc::now();
    }
}

/// Live room statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub message_count: u64,
    pub file_count: u64,
}

/// A live room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    category: RoomCategory,
    members: HashMap<ConnectionId, Member>,
    created_at: DateTime<Utc>,
    stats: RoomStats,
    metadata: Option<Value>,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        let id = id.into();
        Self {
            category: RoomCategory::of(&id),
            id,
            members: HashMap::new(),
            created_at: Utc::now(),
            stats: RoomStats::default(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn category(&self) -> RoomCategory {
        self.category
    }

    /// Add a member. Returns `false` if the connection was already present.
    pub fn add_member(&mut self, connection: ConnectionId, member: Member) -> bool {
        if self.members.contains_key(&connection) {
            return false;
        }
        self.members.insert(connection, member);
        true
    }

    pub fn remove_member(&mut self, connection: &ConnectionId) -> Option<Member> {
        self.members.remove(connection)
    }

    pub fn member_mut(&mut self, connection: &ConnectionId) -> Option<&mut Member> {
        self.members.get_mut(connection)
    }

    #[must_use]
    pub fn is_member(&self, connection: &ConnectionId) -> bool {
        self.members.contains_key(connection)
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member connection ids, optionally excluding one.
    #[must_use]
    pub fn recipients(&self, exclude: Option<&ConnectionId>) -> Vec<ConnectionId> {
        self.members
            .keys()
            .filter(|id| Some(*id) != exclude)
            .cloned()
            .collect()
    }

    pub fn record_message(&mut self, is_file: bool) {
        self.stats.message_count += 1;
        if is_file {
            self.stats.file_count += 1;
        }
    }

    pub fn set_metadata(&mut self, metadata: Value) {
        self.metadata = Some(metadata);
    }

    /// Snapshot of the room for clients.
    #[must_use]
    pub fn info(&self) -> RoomInfo {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        RoomInfo {
            room_id: self.id.clone(),
            category: self.category,
            member_count: members.len(),
            members,
            created_at: self.created_at,
            stats: self.stats,
            metadata: self.metadata.clone(),
        }
    }
}

/// Client-facing snapshot of a live room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub category: RoomCategory,
    pub member_count: usize,
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
    pub stats: RoomStats,
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("event-42").is_ok());
        assert!(validate_room_id("poll:7").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$system").is_err());
        assert!(validate_room_id("user-b").is_err());
        assert!(validate_room_id("caf\u{e9}").is_err());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_category_from_prefix() {
        assert_eq!(RoomCategory::of("event-42"), RoomCategory::Event);
        assert_eq!(RoomCategory::of("event:42"), RoomCategory::Event);
        assert_eq!(RoomCategory::of("poll-7"), RoomCategory::Poll);
        assert_eq!(RoomCategory::of("admin:ops"), RoomCategory::Admin);
        assert_eq!(RoomCategory::of("lobby"), RoomCategory::Other);
        assert_eq!(RoomCategory::of("events-list"), RoomCategory::Other);
    }

    #[test]
    fn test_prefix_access_policy() {
        let policy = PrefixAccessPolicy;
        let anon = Identity::Anonymous;
        let user = Identity::user("u", Role::Moderator, "U");
        let admin = Identity::user("a", Role::Admin, "A");

        assert!(policy.check(&anon, "lobby").is_ok());
        assert!(policy.check(&anon, "poll-1").is_ok());
        assert!(policy.check(&anon, "event-1").is_err());
        assert!(policy.check(&user, "event-1").is_ok());
        assert!(policy.check(&user, "admin:ops").is_err());
        assert!(policy.check(&admin, "admin:ops").is_ok());
    }

    #[test]
    fn test_room_membership() {
        let mut room = Room::new("event-1");
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");
        let identity = Identity::user("u", Role::Participant, "U");

        assert!(room.add_member(c1.clone(), Member::new(&c1, &identity)));
        assert!(!room.add_member(c1.clone(), Member::new(&c1, &identity)));
        assert!(room.add_member(c2.clone(), Member::new(&c2, &Identity::Anonymous)));

        assert_eq!(room.member_count(), 2);
        assert_eq!(room.recipients(Some(&c1)), vec![c2.clone()]);

        room.record_message(true);
        let info = room.info();
        assert_eq!(info.member_count, 2);
        assert_eq!(info.stats.file_count, 1);
        assert_eq!(info.category, RoomCategory::Event);

        assert!(room.remove_member(&c1).is_some());
        assert!(room.remove_member(&c2).is_some());
        assert!(room.is_empty());
    }
}
