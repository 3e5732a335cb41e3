//! Shared fixtures for the Chorus benchmarks.

use chorus_core::{ConnectionId, Hub, HubConfig, Identity, RegistryConfig, Role, Transport};
use chorus_protocol::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A connected member and its outbound queue.
pub struct Member {
    pub id: ConnectionId,
    pub rx: UnboundedReceiver<Arc<Envelope>>,
}

impl Member {
    /// Discard everything queued so far.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// A hub without room or connection caps getting in the way.
#[must_use]
pub fn hub() -> Hub {
    Hub::new(HubConfig {
        registry: RegistryConfig {
            max_rooms: usize::MAX,
            max_rooms_per_connection: usize::MAX,
        },
        ..HubConfig::default()
    })
}

/// Register an authenticated participant.
pub fn connect(hub: &Hub, n: usize) -> Member {
    let (tx, rx) = mpsc::unbounded_channel();
    let user = format!("user-{n}");
    let id = hub.register(
        Transport::new(format!("bench-{n}"), tx),
        Identity::user(format!("u{n}"), Role::Participant, user),
    );
    Member { id, rx }
}

/// Fill a room with `size` members, bypassing the join rate limit.
///
/// Each member is its own user, so per-user limits never trip.
pub fn populate(hub: &Hub, room: &str, size: usize) -> Vec<Member> {
    let mut members: Vec<Member> = (0..size).map(|n| connect(hub, n)).collect();
    for member in &members {
        let joined = hub.registry().join(&member.id, room, |info| {
            Envelope::new("chat:room-joined", serde_json::json!({ "memberCount": info.member_count }))
        });
        assert!(joined.is_ok(), "bench room join failed");
    }
    for member in &mut members {
        member.drain();
    }
    members
}
