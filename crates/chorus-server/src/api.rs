//! Request/response surface under `/api/chat`.
//!
//! Every route goes through the same hub operations as the socket path, so
//! validation, rate limits and moderation are identical. Requests carry no
//! connection and skip live membership checks.

use crate::handlers::AppState;
use crate::identity::RequestIdentity;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chorus_core::{
    Actor, ChatError, CreateRoomRequest, FileRequest, ListQuery, MessageId, RoomUpdate, SendRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// HTTP error wrapping a chat error.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::Validation(_) | ChatError::EmptyContent => StatusCode::BAD_REQUEST,
            ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ChatError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ChatError::ModerationBlocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Transport(_) => StatusCode::BAD_GATEWAY,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ChatError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(ChatError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        crate::metrics::record_error(self.0.code());
        let mut body = json!({
            "success": false,
            "code": self.0.code(),
            "error": self.0.to_string(),
        });
        if let ChatError::ModerationBlocked(Some(reason)) = &self.0 {
            body["reason"] = reason.clone().into();
        }
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBody {
    #[serde(alias = "content")]
    pub new_content: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionBody {
    pub emoji: String,
}

/// Build the `/api/chat` router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:room_id", get(get_room).patch(update_room))
        .route("/rooms/:room_id/join", post(join_room))
        .route("/rooms/:room_id/leave", post(leave_room))
        .route("/rooms/:room_id/messages", get(list_messages).post(send_message))
        .route("/rooms/:room_id/files", post(send_file))
        .route("/messages/:message_id", delete(delete_message).patch(edit_message))
        .route("/messages/:message_id/reactions", post(add_reaction))
        .route(
            "/messages/:message_id/reactions/:emoji",
            delete(remove_reaction),
        )
}

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    payload: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> ApiResult {
    let room = state.hub.create_room(&identity, body(payload)?).await?;
    ok(room)
}

pub async fn get_room(State(state): State<Arc<AppState>>, Path(room_id): Path<String>) -> ApiResult {
    ok(state.hub.get_room(&room_id).await?)
}

pub async fn update_room(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
    payload: Result<Json<RoomUpdate>, JsonRejection>,
) -> ApiResult {
    let room = state
        .hub
        .update_room(&identity, &room_id, body(payload)?)
        .await?;
    ok(room)
}

pub async fn join_room(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
) -> ApiResult {
    state.hub.registry().policy().check(&identity, &room_id)?;
    let added = state
        .hub
        .directory()
        .add_participant(&identity, &room_id)
        .await?;
    ok(json!({ "roomId": room_id, "joined": added }))
}

pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
) -> ApiResult {
    let removed = state
        .hub
        .directory()
        .remove_participant(&identity, &room_id)
        .await?;
    ok(json!({ "roomId": room_id, "left": removed }))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let messages = state
        .hub
        .engine()
        .list(&Actor::request(identity), &room_id, &query)
        .await?;
    ok(messages)
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult {
    let mut request = body(payload)?;
    request.room_id = room_id;
    let message = state
        .hub
        .engine()
        .send(&Actor::request(identity), request)
        .await?;
    ok(message.public_view())
}

pub async fn send_file(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(room_id): Path<String>,
    payload: Result<Json<FileRequest>, JsonRejection>,
) -> ApiResult {
    let mut request = body(payload)?;
    request.room_id = room_id;
    let message = state
        .hub
        .engine()
        .send_file(&Actor::request(identity), request)
        .await?;
    ok(message.public_view())
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(message_id): Path<MessageId>,
    payload: Result<Json<EditBody>, JsonRejection>,
) -> ApiResult {
    let edit = body(payload)?;
    let message = state
        .hub
        .engine()
        .edit(&Actor::request(identity), message_id, &edit.new_content)
        .await?;
    ok(message.public_view())
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(message_id): Path<MessageId>,
) -> ApiResult {
    let message = state
        .hub
        .engine()
        .delete(&Actor::request(identity), message_id)
        .await?;
    ok(message.public_view())
}

pub async fn add_reaction(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path(message_id): Path<MessageId>,
    payload: Result<Json<ReactionBody>, JsonRejection>,
) -> ApiResult {
    let reaction = body(payload)?;
    let outcome = state
        .hub
        .engine()
        .add_reaction(&Actor::request(identity), message_id, &reaction.emoji)
        .await?;
    ok(json!({
        "messageId": message_id,
        "emoji": reaction.emoji,
        "count": outcome.count,
        "changed": outcome.changed,
    }))
}

pub async fn remove_reaction(
    State(state): State<Arc<AppState>>,
    RequestIdentity(identity): RequestIdentity,
    Path((message_id, emoji)): Path<(MessageId, String)>,
) -> ApiResult {
    let outcome = state
        .hub
        .engine()
        .remove_reaction(&Actor::request(identity), message_id, &emoji)
        .await?;
    ok(json!({
        "messageId": message_id,
        "emoji": emoji,
        "count": outcome.count,
        "changed": outcome.changed,
    }))
}
