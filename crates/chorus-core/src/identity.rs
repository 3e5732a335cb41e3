//! Identities and role-derived permissions.
//!
//! The external identity collaborator supplies `{userId, role, displayName}`
//! at connect time or marks the connection anonymous. Nothing here verifies
//! credentials.

use serde::{Deserialize, Serialize};

/// A user identifier.
pub type UserId = String;

/// Participant roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anonymous,
    Participant,
    Speaker,
    Moderator,
    Admin,
}

impl Role {
    /// Parse a role name as supplied by the identity collaborator.
    ///
    /// Unknown names map to `Participant`.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "moderator" => Role::Moderator,
            "speaker" => Role::Speaker,
            "anonymous" => Role::Anonymous,
            _ => Role::Participant,
        }
    }

    /// Permissions granted by this role.
    #[must_use]
    pub const fn permissions(self) -> Permissions {
        match self {
            Role::Anonymous => Permissions {
                send_messages: false,
                upload_files: false,
                create_rooms: false,
                moderate_messages: false,
                manage_rooms: false,
                manage_users: false,
            },
            Role::Participant => Permissions {
                send_messages: true,
                upload_files: false,
                create_rooms: false,
                moderate_messages: false,
                manage_rooms: false,
                manage_users: false,
            },
            Role::Speaker => Permissions {
                send_messages: true,
                upload_files: true,
                create_rooms: true,
                moderate_messages: false,
                manage_rooms: false,
                manage_users: false,
            },
            Role::Moderator => Permissions {
                send_messages: true,
                upload_files: true,
                create_rooms: true,
                moderate_messages: true,
                manage_rooms: true,
                manage_users: false,
            },
            Role::Admin => Permissions {
                send_messages: true,
                upload_files: true,
                create_rooms: true,
                moderate_messages: true,
                manage_rooms: true,
                manage_users: true,
            },
        }
    }

    /// Whether this role counts as elevated for `admin:` rooms.
    #[must_use]
    pub fn is_elevated(self) -> bool {
        self == Role::Admin
    }
}

/// Role-derived capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub send_messages: bool,
    pub upload_files: bool,
    pub create_rooms: bool,
    /// Edit or delete other users' messages.
    pub moderate_messages: bool,
    pub manage_rooms: bool,
    pub manage_users: bool,
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
}

/// The identity bound to a connection or request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    User(UserIdentity),
}

impl Identity {
    /// Build an authenticated identity.
    #[must_use]
    pub fn user(user_id: impl Into<UserId>, role: Role, display_name: impl Into<String>) -> Self {
        Identity::User(UserIdentity {
            user_id: user_id.into(),
            role,
            display_name: display_name.into(),
        })
    }

    /// Whether an identity was supplied.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_))
    }

    /// The role, `Anonymous` when unauthenticated.
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Identity::Anonymous => Role::Anonymous,
            Identity::User(user) => user.role,
        }
    }

    /// The user id, if authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User(user) => Some(&user.user_id),
        }
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn as_user(&self) -> Option<&UserIdentity> {
        match self {
            Identity::Anonymous => None,
            Identity::User(user) => Some(user),
        }
    }

    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.role().permissions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("speaker"), Role::Speaker);
        assert_eq!(Role::parse("organizer"), Role::Participant);
    }

    #[test]
    fn test_role_permissions() {
        assert!(!Role::Anonymous.permissions().send_messages);
        assert!(Role::Participant.permissions().send_messages);
        assert!(!Role::Participant.permissions().upload_files);
        assert!(Role::Speaker.permissions().upload_files);
        assert!(!Role::Speaker.permissions().moderate_messages);
        assert!(Role::Moderator.permissions().moderate_messages);
        assert!(Role::Admin.permissions().manage_users);
    }

    #[test]
    fn test_identity_accessors() {
        let anon = Identity::Anonymous;
        assert!(!anon.is_authenticated());
        assert_eq!(anon.role(), Role::Anonymous);
        assert!(anon.user_id().is_none());

        let user = Identity::user("u-1", Role::Moderator, "Mod");
        assert_eq!(user.user_id(), Some("u-1"));
        assert!(user.permissions().moderate_messages);
    }
}
