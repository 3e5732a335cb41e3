//! # chorus-protocol
//!
//! Wire protocol definitions for the Chorus realtime chat engine.
//!
//! Clients and the server exchange [`Envelope`]s of the shape
//! `{type, payload, room?, target?}`. Text frames carry JSON and binary
//! frames carry MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{codec, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::new("chat:send-message", json!({"content": "Hello"}))
//!     .with_room("event-42");
//!
//! let text = codec::encode_json(&envelope).unwrap();
//! let decoded = codec::decode_json(&text, codec::MAX_ENVELOPE_SIZE).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod version;

pub use codec::{Encoding, EnvelopeCodec, ProtocolError};
pub use envelope::Envelope;
pub use events::{outbound, ChatEvent};
pub use version::{Version, PROTOCOL_VERSION};
