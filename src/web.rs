//! HTTP API over the message store and the bridge.
//!
//! Read endpoints are thin wrappers over the query engine; send and
//! download go through the bridge and fail with 503 while it is offline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::bridge::BridgeClient;
use crate::error::Error;
use crate::media::{self, DownloadedMedia};
use crate::storage::{
    ChatMessage, Contact, ListChatsParams, ListMessagesParams, MessageContext, MessageStore,
    StoredChat,
};

/// Shared application state
pub struct AppState {
    pub store: MessageStore,
    pub data_dir: PathBuf,
    pub bridge: RwLock<Option<BridgeClient>>,
    pub connected: RwLock<bool>,
    pub phone: RwLock<Option<String>>,
    pub name: RwLock<Option<String>>,
}

impl AppState {
    pub fn new(store: MessageStore, data_dir: PathBuf) -> Self {
        Self {
            store,
            data_dir,
            bridge: RwLock::new(None),
            connected: RwLock::new(false),
            phone: RwLock::new(None),
            name: RwLock::new(None),
        }
    }

    pub async fn set_bridge(&self, client: BridgeClient) {
        *self.bridge.write().await = Some(client);
    }

    pub async fn set_connected(&self, connected: bool, phone: Option<String>, name: Option<String>) {
        *self.connected.write().await = connected;
        *self.phone.write().await = phone;
        *self.name.write().await = name;
    }

    /// The bridge client, if the session is up
    async fn live_bridge(&self) -> Result<BridgeClient, ApiError> {
        if !*self.connected.read().await {
            return Err(ApiError::Unavailable);
        }
        self.bridge.read().await.clone().ok_or(ApiError::Unavailable)
    }
}

/// Handler error, rendered as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    Unavailable,
    Other(anyhow::Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Other(e.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Other(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Not connected to WhatsApp".to_string(),
            ),
            ApiError::Other(e) => {
                let status = match e.downcast_ref::<Error>() {
                    Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
                    Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("Request failed: {:#}", e);
                }
                (status, format!("{:#}", e))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub recipient: String,
    #[serde(default)]
    pub message: String,
    pub media_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub message_id: String,
    pub chat_jid: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub media: DownloadedMedia,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub messages: i64,
    pub chats: i64,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
    pub transcript: String,
}

#[derive(Debug, Deserialize)]
pub struct IncludeLastMessage {
    #[serde(default = "yes")]
    pub include_last_message: bool,
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default = "default_contact_chat_limit")]
    pub limit: i64,
    #[serde(default)]
    pub page: i64,
}

#[derive(Debug, Deserialize)]
pub struct ContextWindow {
    #[serde(default = "default_context")]
    pub before: i64,
    #[serde(default = "default_context")]
    pub after: i64,
}

#[derive(Debug, Deserialize)]
pub struct ContactQuery {
    #[serde(default)]
    pub q: String,
}

fn yes() -> bool {
    true
}

fn default_contact_chat_limit() -> i64 {
    20
}

fn default_context() -> i64 {
    5
}

/// Path segments may arrive still percent-encoded (`%40` for `@`)
fn decode_param(raw: String) -> String {
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/send", post(send_message))
        .route("/api/download", post(download_media))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:jid", get(get_chat))
        .route("/api/direct-chat/:phone", get(get_direct_chat))
        .route("/api/contact-chats/:jid", get(get_contact_chats))
        .route("/api/contacts", get(search_contacts))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/:id/context", get(get_message_context))
        .route("/api/last-interaction/:jid", get(get_last_interaction))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let router = create_router(state);

    info!("API server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let (messages, chats) = state.store.stats()?;
    Ok(Json(StatusResponse {
        connected: *state.connected.read().await,
        phone: state.phone.read().await.clone(),
        name: state.name.read().await.clone(),
        messages,
        chats,
    }))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    if req.recipient.trim().is_empty() {
        return Err(Error::Validation("recipient is required".to_string()).into());
    }
    let bridge = state.live_bridge().await?;
    let media_path = req
        .media_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(std::path::Path::new);

    let receipt = media::send_message(&bridge, &req.recipient, &req.message, media_path).await?;
    Ok(Json(SendMessageResponse {
        success: true,
        message: format!("Message sent to {}", req.recipient),
        message_id: receipt.message_id,
    }))
}

async fn download_media(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadRequest>,
) -> ApiResult<DownloadResponse> {
    if req.message_id.is_empty() || req.chat_jid.is_empty() {
        return Err(Error::Validation("message_id and chat_jid are required".to_string()).into());
    }
    let bridge = state.live_bridge().await?;
    let media = media::download_media(
        &state.store,
        &bridge,
        &state.data_dir,
        &req.message_id,
        &req.chat_jid,
    )
    .await?;
    Ok(Json(DownloadResponse {
        success: true,
        message: format!("Downloaded {} media", media.media_type.as_str()),
        media,
    }))
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListChatsParams>,
) -> ApiResult<Vec<StoredChat>> {
    Ok(Json(state.store.list_chats(&params)?))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(jid): Path<String>,
    Query(opts): Query<IncludeLastMessage>,
) -> ApiResult<StoredChat> {
    let jid = decode_param(jid);
    match state.store.get_chat(&jid, opts.include_last_message)? {
        Some(chat) => Ok(Json(chat)),
        None => Err(Error::NotFound(format!("chat {jid}")).into()),
    }
}

async fn get_direct_chat(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> ApiResult<StoredChat> {
    let phone = decode_param(phone);
    match state.store.get_direct_chat_by_contact(&phone)? {
        Some(chat) => Ok(Json(chat)),
        None => Err(Error::NotFound(format!("direct chat with {phone}")).into()),
    }
}

async fn get_contact_chats(
    State(state): State<Arc<AppState>>,
    Path(jid): Path<String>,
    Query(paging): Query<Paging>,
) -> ApiResult<Vec<StoredChat>> {
    let jid = decode_param(jid);
    Ok(Json(state.store.get_contact_chats(&jid, paging.limit, paging.page)?))
}

async fn search_contacts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactQuery>,
) -> ApiResult<Vec<Contact>> {
    Ok(Json(state.store.search_contacts(&query.q)?))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListMessagesParams>,
) -> ApiResult<MessagesResponse> {
    let messages = state.store.find_messages(&params)?;
    let transcript = state.store.format_messages(&messages)?;
    Ok(Json(MessagesResponse {
        messages,
        transcript,
    }))
}

async fn get_message_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(window): Query<ContextWindow>,
) -> ApiResult<MessageContext> {
    let id = decode_param(id);
    Ok(Json(state.store.get_message_context(&id, window.before, window.after)?))
}

async fn get_last_interaction(
    State(state): State<Arc<AppState>>,
    Path(jid): Path<String>,
) -> ApiResult<serde_json::Value> {
    let jid = decode_param(jid);
    let message = state.store.last_interaction(&jid)?;
    Ok(Json(serde_json::json!({ "message": message })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MediaInfo, StoredMessage};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn app() -> Router {
        let store = MessageStore::open_in_memory().unwrap();
        let ts = |s| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap();
        store.upsert_chat("111@s.whatsapp.net", "Alice", ts(2)).unwrap();
        for (i, text) in ["morning", "coffee?", "sure"].iter().enumerate() {
            store
                .upsert_message(&StoredMessage {
                    id: format!("m{i}"),
                    chat_jid: "111@s.whatsapp.net".to_string(),
                    sender: "111".to_string(),
                    content: text.to_string(),
                    timestamp: ts(i as i64),
                    is_from_me: i == 1,
                    media: MediaInfo::default(),
                })
                .unwrap();
        }
        create_router(Arc::new(AppState::new(store, PathBuf::from("."))))
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        call(app(), Request::get(uri).body(Body::empty()).unwrap()).await
    }

    #[tokio::test]
    async fn test_list_chats() {
        let (status, body) = get_json("/api/chats?q=ali&sort=name").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["jid"], "111@s.whatsapp.net");
        assert_eq!(body[0]["last_message"], "sure");
    }

    #[tokio::test]
    async fn test_get_chat_and_not_found() {
        let (status, body) = get_json("/api/chats/111%40s.whatsapp.net").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Alice");

        let (status, body) = get_json("/api/chats/404@s.whatsapp.net").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("404@s.whatsapp.net"));
    }

    #[tokio::test]
    async fn test_list_messages_with_transcript() {
        let (status, body) = get_json("/api/messages?chat_jid=111@s.whatsapp.net&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert!(body["transcript"].as_str().unwrap().contains("From: Me: coffee?"));
    }

    #[tokio::test]
    async fn test_bad_timestamp_is_400() {
        let (status, body) = get_json("/api/messages?after=last-tuesday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("after"));
    }

    #[tokio::test]
    async fn test_message_context() {
        let (status, body) = get_json("/api/messages/m1/context?before=1&after=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["id"], "m1");
        assert_eq!(body["before"][0]["id"], "m0");
        assert_eq!(body["after"][0]["id"], "m2");

        let (status, _) = get_json("/api/messages/nope/context").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_last_interaction_empty_is_ok() {
        let (status, body) = get_json("/api/last-interaction/222@s.whatsapp.net").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_null());
    }

    #[tokio::test]
    async fn test_status() {
        let (status, body) = get_json("/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], false);
        assert_eq!(body["messages"], 3);
        assert_eq!(body["chats"], 1);
    }

    #[tokio::test]
    async fn test_send_while_offline() {
        let req = Request::post("/api/send")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"recipient": "111", "message": "hi"}"#))
            .unwrap();
        let (status, _) = call(app(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let req = Request::post("/api/send")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"recipient": "", "message": "hi"}"#))
            .unwrap();
        let (status, _) = call(app(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
