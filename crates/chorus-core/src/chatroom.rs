//! Durable chat room directory.
//!
//! A logical room, such as an event's chat, keeps its settings in the record
//! store independently of whether it has live members. The registry never
//! writes here; the directory is read again on every join.

use crate::error::{ChatError, ChatResult};
use crate::identity::{Identity, Role, UserId};
use crate::ratelimit::{Action, RateDecision, RateLimiter};
use crate::store::{Store, ROOMS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Durable room status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Active,
    Archived,
    Disabled,
}

impl RoomStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Active => "active",
            RoomStatus::Archived => "archived",
            RoomStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomSettings {
    pub pre_event_access: bool,
    pub post_event_duration_hours: u32,
    pub moderated: bool,
    pub max_messages: u32,
    pub allow_file_upload: bool,
    pub allowed_file_types: Vec<String>,
    pub max_file_size_mb: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            pre_event_access: false,
            post_event_duration_hours: 24,
            moderated: true,
            max_messages: 10_000,
            allow_file_upload: true,
            allowed_file_types: ["jpg", "jpeg", "png", "gif", "pdf"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_size_mb: 10,
        }
    }
}

impl RoomSettings {
    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_file_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomStatistics {
    pub total_messages: u64,
    pub total_files: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A durable chat room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomRecord {
    pub id: String,
    pub event_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub settings: RoomSettings,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub statistics: RoomStatistics,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Room id of an event's chat.
#[must_use]
pub fn event_room_id(event_id: &str) -> String {
    format!("event-{event_id}")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub event_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub settings: Option<RoomSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<RoomStatus>,
    pub settings: Option<RoomSettings>,
}

/// Result of an update; `previous_status` is set when the status changed.
#[derive(Debug, Clone)]
pub struct RoomUpdateOutcome {
    pub room: ChatRoomRecord,
    pub previous_status: Option<RoomStatus>,
}

/// Durable room records over the record store.
pub struct RoomDirectory {
    store: Arc<dyn Store>,
    limiter: Arc<dyn RateLimiter>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self { store, limiter }
    }

    /// Create the chat room of an event.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without room-creation rights, `RateLimited`,
    /// `Validation` for a bad event id, `Conflict` if the room exists.
    pub async fn create(
        &self,
        identity: &Identity,
        request: CreateRoomRequest,
    ) -> ChatResult<ChatRoomRecord> {
        let user = identity
            .as_user()
            .ok_or_else(|| ChatError::denied("Authentication required"))?;
        if !user.role.permissions().create_rooms {
            return Err(ChatError::denied("Cannot create chat rooms"));
        }
        let event_id = request.event_id.trim();
        if event_id.is_empty()
            || !event_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ChatError::validation("Invalid event id"));
        }
        if let RateDecision::Denied { .. } = self.limiter.check(&user.user_id, Action::CreateRoom) {
            return Err(ChatError::RateLimited(Action::CreateRoom));
        }

        let now = Utc::now();
        let record = ChatRoomRecord {
            id: event_room_id(event_id),
            event_id: event_id.to_string(),
            name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Event {event_id} Chat")),
            description: request.description,
            status: RoomStatus::Active,
            settings: request.settings.unwrap_or_default(),
            participants: Vec::new(),
            statistics: RoomStatistics::default(),
            created_by: user.user_id.clone(),
            created_at: now,
            updated_at: now,
        };

        self.store
            .create(ROOMS, serde_json::to_value(&record)?)
            .await
            .map_err(|err| match ChatError::from(err) {
                ChatError::Conflict(_) => ChatError::Conflict("Chat room already exists".into()),
                other => other,
            })?;
        info!(room = %record.id, user = %user.user_id, "Chat room created");
        Ok(record)
    }

    /// Look up a room record.
    ///
    /// # Errors
    ///
    /// Store failures and undecodable records.
    pub async fn find(&self, room_id: &str) -> ChatResult<Option<ChatRoomRecord>> {
        match self.store.read(ROOMS, room_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// `NotFound` when no record exists.
    pub async fn get(&self, room_id: &str) -> ChatResult<ChatRoomRecord> {
        self.find(room_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("Chat room".into()))
    }

    /// Patch name, description, settings or status.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without room-management rights, `NotFound`.
    pub async fn update(
        &self,
        identity: &Identity,
        room_id: &str,
        update: RoomUpdate,
    ) -> ChatResult<RoomUpdateOutcome> {
        if !identity.permissions().manage_rooms {
            return Err(ChatError::denied("Cannot manage chat rooms"));
        }
        let mut room = self.get(room_id).await?;
        let mut previous_status = None;

        if let Some(name) = update.name.filter(|n| !n.trim().is_empty()) {
            room.name = name;
        }
        if update.description.is_some() {
            room.description = update.description;
        }
        if let Some(settings) = update.settings {
            room.settings = settings;
        }
        if let Some(status) = update.status {
            if status != room.status {
                previous_status = Some(room.status);
                room.status = status;
            }
        }
        room.updated_at = Utc::now();

        let stored = self
            .store
            .update(ROOMS, room_id, serde_json::to_value(&room)?)
            .await?;
        let room: ChatRoomRecord = serde_json::from_value(stored)?;
        info!(room = %room_id, status = room.status.as_str(), "Chat room updated");
        Ok(RoomUpdateOutcome {
            room,
            previous_status,
        })
    }

    /// Record a user as a participant. Returns `false` if already listed.
    ///
    /// # Errors
    ///
    /// `NotFound`, `PermissionDenied` for anonymous identities and rooms
    /// that are not active, or `RateLimited` once the user's join quota is
    /// spent. Refused joins do not count against the quota.
    pub async fn add_participant(&self, identity: &Identity, room_id: &str) -> ChatResult<bool> {
        let user = identity
            .as_user()
            .ok_or_else(|| ChatError::denied("Authentication required"))?;
        let mut room = self.get(room_id).await?;
        if room.status != RoomStatus::Active {
            return Err(ChatError::denied("Chat room is not active"));
        }
        if let RateDecision::Denied { .. } = self.limiter.check(&user.user_id, Action::JoinRoom) {
            return Err(ChatError::RateLimited(Action::JoinRoom));
        }
        if room.participants.iter().any(|p| p.user_id == user.user_id) {
            return Ok(false);
        }
        room.participants.push(Participant {
            user_id: user.user_id.clone(),
            role: user.role,
            joined_at: Utc::now(),
        });
        self.store
            .update(ROOMS, room_id, json!({ "participants": room.participants }))
            .await?;
        Ok(true)
    }

    /// Remove a participant. Returns `false` if the user was not listed.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `PermissionDenied` for anonymous identities.
    pub async fn remove_participant(&self, identity: &Identity, room_id: &str) -> ChatResult<bool> {
        let user_id = identity
            .user_id()
            .ok_or_else(|| ChatError::denied("Authentication required"))?;
        let mut room = self.get(room_id).await?;
        let before = room.participants.len();
        room.participants.retain(|p| p.user_id != user_id);
        if room.participants.len() == before {
            return Ok(false);
        }
        self.store
            .update(ROOMS, room_id, json!({ "participants": room.participants }))
            .await?;
        Ok(true)
    }

    /// Bump durable statistics. Failures are logged and ignored.
    pub async fn record_activity(&self, room_id: &str, is_file: bool) {
        let result = async {
            let Some(room) = self.find(room_id).await? else {
                return Ok(());
            };
            let mut stats = room.statistics;
            stats.total_messages += 1;
            if is_file {
                stats.total_files += 1;
            }
            stats.last_activity = Some(Utc::now());
            self.store
                .update(ROOMS, room_id, json!({ "statistics": stats }))
                .await?;
            Ok::<_, ChatError>(())
        }
        .await;

        if let Err(err) = result {
            warn!(room = %room_id, error = %err, "Failed to update room statistics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::SlidingWindowLimiter;
    use crate::store::MemoryStore;

    fn directory() -> RoomDirectory {
        RoomDirectory::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SlidingWindowLimiter::new()),
        )
    }

    fn request(event_id: &str) -> CreateRoomRequest {
        CreateRoomRequest {
            event_id: event_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_event_room() {
        let dir = directory();
        let speaker = Identity::user("s", Role::Speaker, "Sam");

        let room = dir.create(&speaker, request("42")).await.unwrap();
        assert_eq!(room.id, "event-42");
        assert_eq!(room.name, "Event 42 Chat");
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.settings.max_file_size_mb, 10);
        assert!(room.settings.allows_extension("PDF"));

        let fetched = dir.get("event-42").await.unwrap();
        assert_eq!(fetched, room);
        assert_eq!(
            dir.create(&speaker, request("42")).await.unwrap_err().code(),
            "CONFLICT"
        );
    }

    #[tokio::test]
    async fn test_create_requires_permission_and_rate_limit() {
        let dir = directory();
        let participant = Identity::user("p", Role::Participant, "P");
        assert_eq!(
            dir.create(&participant, request("1")).await.unwrap_err().code(),
            "PERMISSION_DENIED"
        );
        assert!(dir.create(&Identity::Anonymous, request("1")).await.is_err());

        let admin = Identity::user("a", Role::Admin, "A");
        dir.create(&admin, request("1")).await.unwrap();
        dir.create(&admin, request("2")).await.unwrap();
        assert_eq!(
            dir.create(&admin, request("3")).await.unwrap_err(),
            ChatError::RateLimited(Action::CreateRoom)
        );
        assert!(dir.create(&admin, request("bad id")).await.is_err());
    }

    #[tokio::test]
    async fn test_update_status() {
        let dir = directory();
        let moderator = Identity::user("m", Role::Moderator, "M");
        dir.create(&moderator, request("7")).await.unwrap();

        let outcome = dir
            .update(
                &moderator,
                "event-7",
                RoomUpdate {
                    status: Some(RoomStatus::Archived),
                    name: Some("Closing".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.previous_status, Some(RoomStatus::Active));
        assert_eq!(outcome.room.status, RoomStatus::Archived);
        assert_eq!(outcome.room.name, "Closing");

        let speaker = Identity::user("s", Role::Speaker, "S");
        assert!(dir
            .update(&speaker, "event-7", RoomUpdate::default())
            .await
            .is_err());
        assert_eq!(
            dir.update(&moderator, "event-8", RoomUpdate::default())
                .await
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_participants_and_statistics() {
        let dir = directory();
        let admin = Identity::user("a", Role::Admin, "A");
        let user = Identity::user("u", Role::Participant, "U");
        dir.create(&admin, request("9")).await.unwrap();

        assert!(dir.add_participant(&user, "event-9").await.unwrap());
        assert!(!dir.add_participant(&user, "event-9").await.unwrap());
        assert_eq!(dir.get("event-9").await.unwrap().participants.len(), 1);
        assert!(dir.remove_participant(&user, "event-9").await.unwrap());
        assert!(!dir.remove_participant(&user, "event-9").await.unwrap());

        dir.record_activity("event-9", true).await;
        dir.record_activity("missing", false).await;
        let stats = dir.get("event-9").await.unwrap().statistics;
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.total_files, 1);
    }

    #[tokio::test]
    async fn test_add_participant_rate_limited() {
        let dir = directory();
        let admin = Identity::user("a", Role::Admin, "A");
        let user = Identity::user("u", Role::Participant, "U");
        dir.create(&admin, request("9")).await.unwrap();
        dir.create(&admin, request("10")).await.unwrap();
        dir.update(
            &admin,
            "event-10",
            RoomUpdate { status: Some(RoomStatus::Disabled), ..Default::default() },
        )
        .await
        .unwrap();

        // Refused joins leave the quota untouched.
        for _ in 0..5 {
            assert_eq!(
                dir.add_participant(&user, "event-10").await.unwrap_err().code(),
                "PERMISSION_DENIED"
            );
        }

        assert!(dir.add_participant(&user, "event-9").await.unwrap());
        for _ in 1..10 {
            assert!(!dir.add_participant(&user, "event-9").await.unwrap());
        }
        assert_eq!(
            dir.add_participant(&user, "event-9").await.unwrap_err(),
            ChatError::RateLimited(Action::JoinRoom)
        );
    }
}
