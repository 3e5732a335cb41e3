//! # chorus-core
//!
//! Realtime chat engine for event platforms: connections, rooms, moderation,
//! and the message lifecycle.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection** - Registry of live transport sessions and their identities
//! - **Registry** - Live rooms, membership, and fan-out
//! - **Engine** - Send, edit, delete, and react with permission, rate-limit,
//!   and moderation gates
//! - **Presence** - Typing indicators and member status
//! - **Dispatch** - Routing of inbound envelopes to pluggable handlers
//! - **Hub** - Single owner of all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│     Hub     │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │◀────│   Engine    │──▶ Store
//!                     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Connections │
//!                     └─────────────┘
//! ```

pub mod chatroom;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod identity;
pub mod message;
pub mod moderation;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod room;
pub mod store;

pub use chatroom::{ChatRoomRecord, CreateRoomRequest, RoomDirectory, RoomSettings, RoomStatus, RoomUpdate};
pub use connection::{ConnectionId, ConnectionManager, Outbound, Transport};
pub use dispatch::{parse_payload, EventContext, EventHandler, EventRouter};
pub use engine::{Actor, EngineConfig, FileRequest, ListQuery, MessageEngine, SendRequest};
pub use error::{ChatError, ChatResult};
pub use hub::{Hub, HubBuilder, HubConfig, RoomView};
pub use identity::{Identity, Permissions, Role, UserIdentity};
pub use message::{ChatMessage, MessageContent, MessageId, PublicMessage};
pub use moderation::{sanitize, KeywordModerator, Moderator, Verdict};
pub use presence::{Presence, PresenceStatus};
pub use ratelimit::{Action, RateDecision, RateLimitPolicy, RateLimiter, SlidingWindowLimiter};
pub use registry::{JoinOutcome, RegistryConfig, RoomRegistry};
pub use room::{AccessPolicy, PrefixAccessPolicy, RoomId, RoomInfo};
pub use store::{MemoryStore, Store, StoreError};
