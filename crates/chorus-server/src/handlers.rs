//! Connection handlers for the Chorus server.
//!
//! This module handles the connection lifecycle and envelope processing.

use crate::api;
use crate::config::Config;
use crate::identity::identity_from_headers;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::polls::register_poll_handlers;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chorus_core::{ConnectionId, Hub, Identity, Transport};
use chorus_protocol::{codec, outbound, Encoding, Envelope, EnvelopeCodec, Version};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(1);

/// Shared server state.
pub struct AppState {
    pub hub: Hub,
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Hub::new(config.hub_config());
        register_poll_handlers(hub.router());
        Self { hub, config }
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api/chat", api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    spawn_sweeper(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Chorus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Periodically drop idle rate limit keys.
fn spawn_sweeper(state: Arc<AppState>) {
    let period = state.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dropped = state.hub.sweep_rate_limits();
            debug!(dropped, "Swept rate limit keys");
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connections().count(),
        "rooms": state.hub.registry().room_count(),
    }))
}

/// Query parameters accepted on the WebSocket endpoint.
///
/// Identity is never taken from the query; only the gateway headers carry it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub format: Option<String>,
    pub version: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let version = match Version::negotiate(params.version.as_deref()) {
        Ok(version) => version,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };
    if state.hub.connections().count() >= state.config.limits.max_connections {
        warn!("Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let identity = identity_from_headers(&headers);
    let wire = EnvelopeCodec::new(
        Encoding::from_query(params.format.as_deref()),
        state.config.limits.max_envelope_size,
    );

    ws.max_message_size(state.config.limits.max_envelope_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, wire, version))
}

/// Encode an outbound envelope for the connection's encoding.
fn encode(wire: &EnvelopeCodec, envelope: &Envelope) -> Result<Message, codec::ProtocolError> {
    match wire.encoding() {
        Encoding::Json => codec::encode_json(envelope).map(Message::Text),
        Encoding::MessagePack => codec::encode_msgpack(envelope).map(|data| Message::Binary(data.to_vec())),
    }
}

async fn send_envelope(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    wire: &EnvelopeCodec,
    envelope: &Envelope,
) -> Result<()> {
    let message = encode(wire, envelope)?;
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    sender.send(message).await?;
    metrics::record_envelope(len, "outbound");
    Ok(())
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    wire: EnvelopeCodec,
    version: Version,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let hub = &state.hub;

    let (tx, mut outbound_rx) = mpsc::unbounded_channel();
    let key = format!("ws-{}", NEXT_SOCKET.fetch_add(1, Ordering::Relaxed));
    let authenticated = identity.is_authenticated();
    let user_id = identity.user_id().map(str::to_string);
    let connection_id = hub.register(Transport::new(key, tx), identity);

    debug!(connection = %connection_id, authenticated, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Written before the outbound queue is drained, so it is always first.
    let connected = Envelope::new(
        outbound::CONNECTED,
        json!({
            "connectionId": connection_id.as_str(),
            "authenticated": authenticated,
            "userId": user_id,
            "protocolVersion": version.to_string(),
            "serverTime": chrono::Utc::now(),
        }),
    );
    if let Err(e) = send_envelope(&mut sender, &wire, &connected).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected envelope");
        hub.unregister(&connection_id);
        return;
    }

    let heartbeat = &state.config.heartbeat;
    let timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat.interval_ms.max(1)));
    ticker.tick().await;
    let mut last_seen = Instant::now();

    // Inbound envelopes run in receipt order on their own task, so a close
    // frame is seen while a slow handler is still awaiting the store.
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let dispatcher = {
        let state = Arc::clone(&state);
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                dispatch(&state, &connection_id, envelope).await;
            }
        })
    };

    loop {
        tokio::select! {
            biased;

            Some(envelope) = outbound_rx.recv() => {
                if let Err(e) = send_envelope(&mut sender, &wire, &envelope).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_envelope(text.len(), "inbound");
                        wire.decode_text(&text)
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_envelope(data.len(), "inbound");
                        wire.decode_binary(&data)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("TRANSPORT_ERROR");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                match decoded {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(connection = %connection_id, error = %e, "Undecodable envelope");
                        metrics::record_error("VALIDATION_ERROR");
                        hub.connections().send(
                            &connection_id,
                            Arc::new(Envelope::error("VALIDATION_ERROR", e.to_string())),
                        );
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // A running handler finishes; envelopes still queued are rejected once
    // the connection is gone.
    drop(inbound_tx);
    let rooms_left = hub.unregister(&connection_id);
    drop(dispatcher);
    metrics::set_active_rooms(hub.registry().room_count());
    debug!(connection = %connection_id, rooms_left, "WebSocket disconnected");
}

async fn dispatch(state: &AppState, connection: &ConnectionId, envelope: Envelope) {
    let start = Instant::now();
    if let Err(err) = state.hub.dispatch(connection, envelope).await {
        metrics::record_error(err.code());
    }
    metrics::record_dispatch(start.elapsed().as_secs_f64());
    metrics::set_active_rooms(state.hub.registry().room_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve() -> SocketAddr {
        serve_state(Arc::new(AppState::new(Config::default()))).await
    }

    async fn serve_state(state: Arc<AppState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, user: Option<&str>) -> Client {
        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        if let Some(user) = user {
            request
                .headers_mut()
                .insert("x-user-id", user.parse().unwrap());
        }
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    /// Read envelopes until one of the given type arrives.
    async fn expect(ws: &mut Client, kind: &str) -> Value {
        let wait = async {
            loop {
                match ws.next().await.unwrap().unwrap() {
                    WsMessage::Text(text) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if value["type"] == kind {
                            return value;
                        }
                    }
                    WsMessage::Binary(data) => {
                        let envelope = codec::decode_msgpack(&data, codec::MAX_ENVELOPE_SIZE).unwrap();
                        if envelope.kind == kind {
                            return serde_json::to_value(envelope).unwrap();
                        }
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_mention_and_edit_over_websocket() {
        let addr = serve().await;
        let mut a = connect(addr, Some("A")).await;
        let mut b = connect(addr, Some("B")).await;

        let hello = expect(&mut a, "connected").await;
        assert_eq!(hello["payload"]["authenticated"], true);
        assert_eq!(hello["payload"]["protocolVersion"], "1.0");
        expect(&mut b, "connected").await;

        for ws in [&mut a, &mut b] {
            send(ws, json!({"type": "chat:join-room", "payload": {"roomId": "event-42"}})).await;
            expect(ws, "chat:room-joined").await;
        }

        send(
            &mut a,
            json!({"type": "chat:send-message", "payload": {"roomId": "event-42", "content": "Hello @B"}}),
        )
        .await;
        let received = expect(&mut b, "chat:message-received").await;
        assert_eq!(received["payload"]["message"]["content"]["text"], "Hello @B");
        let id = received["payload"]["message"]["id"].clone();
        let mention = expect(&mut b, "chat:mention").await;
        assert_eq!(mention["payload"]["messageId"], id);
        expect(&mut a, "chat:message-received").await;

        send(
            &mut a,
            json!({"type": "chat:edit-message", "payload": {"messageId": id, "newContent": "Hello again @B"}}),
        )
        .await;
        let edited = expect(&mut b, "chat:message-edited").await;
        let history = edited["payload"]["message"]["editHistory"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["content"]["text"], "Hello @B");
    }

    #[tokio::test]
    async fn test_errors_and_disconnect() {
        let addr = serve().await;
        let mut a = connect(addr, None).await;
        let mut b = connect(addr, Some("B")).await;
        expect(&mut a, "connected").await;
        expect(&mut b, "connected").await;

        ws_send_raw(&mut a, "not json").await;
        let err = expect(&mut a, "chat:error").await;
        assert_eq!(err["payload"]["code"], "VALIDATION_ERROR");

        for ws in [&mut a, &mut b] {
            send(ws, json!({"type": "chat:join-room", "payload": {"roomId": "lobby"}})).await;
            expect(ws, "chat:room-joined").await;
        }
        send(&mut a, json!({"type": "chat:send-message", "payload": {"roomId": "lobby", "content": "hi"}})).await;
        let err = expect(&mut a, "chat:error").await;
        assert_eq!(err["payload"]["code"], "PERMISSION_DENIED");

        a.close(None).await.unwrap();
        let left = expect(&mut b, "chat:user-left").await;
        assert_eq!(left["payload"]["roomId"], "lobby");
        assert_eq!(left["payload"]["memberCount"], 1);
    }

    async fn ws_send_raw(ws: &mut Client, text: &str) {
        ws.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_msgpack_connection() {
        let addr = serve().await;
        let mut request = format!("ws://{addr}/ws?format=msgpack")
            .into_client_request()
            .unwrap();
        request.headers_mut().insert("x-user-id", "M".parse().unwrap());
        let (mut ws, _) = connect_async(request).await.unwrap();
        let hello = expect(&mut ws, "connected").await;
        assert_eq!(hello["payload"]["userId"], "M");

        let join = Envelope::new("chat:join-room", json!({"roomId": "lobby"}));
        let data = codec::encode_msgpack(&join).unwrap();
        ws.send(WsMessage::Binary(data.to_vec())).await.unwrap();
        let joined = expect(&mut ws, "chat:room-joined").await;
        assert_eq!(joined["payload"]["room"]["memberCount"], 1);
    }

    #[tokio::test]
    async fn test_query_string_carries_no_identity() {
        let addr = serve().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws?userId=evil&role=admin&name=Root"))
            .await
            .unwrap();
        let hello = expect(&mut ws, "connected").await;
        assert_eq!(hello["payload"]["authenticated"], false);
        assert!(hello["payload"]["userId"].is_null());

        send(&mut ws, json!({"type": "chat:join-room", "payload": {"roomId": "admin:ops"}})).await;
        let err = expect(&mut ws, "chat:error").await;
        assert_eq!(err["payload"]["code"], "PERMISSION_DENIED");

        let mut admin = format!("ws://{addr}/ws").into_client_request().unwrap();
        admin.headers_mut().insert("x-user-id", "root".parse().unwrap());
        admin.headers_mut().insert("x-user-role", "admin".parse().unwrap());
        let (mut admin, _) = connect_async(admin).await.unwrap();
        send(&mut admin, json!({"type": "chat:join-room", "payload": {"roomId": "admin:ops"}})).await;
        let joined = expect(&mut admin, "chat:room-joined").await;
        assert_eq!(joined["payload"]["room"]["memberCount"], 1);
    }

    struct Stall;

    #[async_trait::async_trait]
    impl chorus_core::EventHandler for Stall {
        async fn handle(
            &self,
            _hub: &Hub,
            _ctx: &chorus_core::EventContext,
            _envelope: Envelope,
        ) -> chorus_core::ChatResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_during_slow_handler_leaves_rooms() {
        let state = Arc::new(AppState::new(Config::default()));
        state.hub.router().register("test:stall", Arc::new(Stall));
        let addr = serve_state(state).await;

        let mut a = connect(addr, Some("A")).await;
        let mut b = connect(addr, Some("B")).await;
        for ws in [&mut a, &mut b] {
            send(ws, json!({"type": "chat:join-room", "payload": {"roomId": "lobby"}})).await;
            expect(ws, "chat:room-joined").await;
        }

        send(&mut a, json!({"type": "test:stall", "payload": {}})).await;
        a.close(None).await.unwrap();
        let left = expect(&mut b, "chat:user-left").await;
        assert_eq!(left["payload"]["userId"], "A");
        assert_eq!(left["payload"]["memberCount"], 1);
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected() {
        let addr = serve().await;
        assert!(connect_async(format!("ws://{addr}/ws?version=2.0")).await.is_err());
    }
}
