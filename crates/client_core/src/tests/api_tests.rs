use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::error::ErrorCode;
use tokio::{net::TcpListener, sync::Mutex};

use super::*;
use crate::session::Credential;

type SeenUpload = Arc<Mutex<Option<(String, Option<String>, Vec<u8>)>>>;

#[derive(Deserialize)]
struct LimitQuery {
    limit: u32,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer token-abc")
}

async fn friends(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Token expired" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "friends": [{
                "friendDetails": { "id": 2, "name": "Bo", "userName": "bo" },
                "messages": [{
                    "id": 10,
                    "content": "hey",
                    "timestamp": "2025-01-08T10:30:00Z",
                    "isSent": false,
                    "isRead": false
                }]
            }]
        })),
    )
}

async fn group_messages(Path(group_id): Path<i64>, Query(query): Query<LimitQuery>) -> Json<Value> {
    Json(json!([{
        "id": 1,
        "content": format!("group {group_id} limit {}", query.limit),
        "timeStamp": "2025-01-08T10:30:00Z",
        "read": false,
        "from": { "id": 3, "name": "Cy", "userName": "cy" }
    }]))
}

async fn upload(State(seen): State<SeenUpload>, mut multipart: Multipart) -> Json<Value> {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let mime = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.expect("file bytes").to_vec();
        *seen.lock().await = Some((name, mime, bytes));
    }
    Json(json!({ "filePath": "uploads/abc.png" }))
}

async fn mark_read(Path(friend_id): Path<i64>) -> StatusCode {
    if friend_id == 2 {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn file_url(Path(path): Path<String>) -> Json<Value> {
    Json(json!({ "url": format!("https://cdn.test/{path}?sig=1") }))
}

async fn spawn_api_server() -> (String, SeenUpload) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen: SeenUpload = Arc::new(Mutex::new(None));
    let app = Router::new()
        .route("/user/my/friends", get(friends))
        .route("/group/:id/messages", get(group_messages))
        .route("/user/upload", post(upload))
        .route("/user/messages/:id/read", post(mark_read))
        .route("/user/file/*path", get(file_url))
        .with_state(Arc::clone(&seen));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), seen)
}

fn api_for(server_url: &str, token: &str) -> HttpChatApi {
    HttpChatApi::new(&SessionContext::new(
        UserId(1),
        "Al",
        Credential::new(token),
        server_url,
    ))
}

#[tokio::test]
async fn fetch_friends_sends_bearer_token_and_parses_summaries() {
    let (server_url, _) = spawn_api_server().await;
    let api = api_for(&server_url, "token-abc");

    let friends = api.fetch_friends().await.expect("friends");

    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0].friend_details.id, UserId(2));
    assert_eq!(friends[0].messages[0].content, "hey");
    assert!(!friends[0].messages[0].is_sent);
}

#[tokio::test]
async fn rejected_token_surfaces_api_exception() {
    let (server_url, _) = spawn_api_server().await;
    let api = api_for(&server_url, "stale");

    let err = api.fetch_friends().await.expect_err("must be rejected");
    let exception = err.downcast_ref::<ApiException>().expect("api exception");

    assert_eq!(exception.code, ErrorCode::Unauthorized);
    assert_eq!(exception.message, "Token expired");
}

#[tokio::test]
async fn group_history_passes_page_size() {
    let (server_url, _) = spawn_api_server().await;
    let api = api_for(&server_url, "token-abc");

    let records = api
        .fetch_group_messages(GroupId(7), 25)
        .await
        .expect("history");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "group 7 limit 25");
    assert_eq!(records[0].from.name, "Cy");
}

#[tokio::test]
async fn upload_sends_multipart_file_field() {
    let (server_url, seen) = spawn_api_server().await;
    let api = api_for(&server_url, "token-abc");

    let response = api
        .upload_file(&AttachmentUpload {
            file_name: "cat.png".into(),
            mime_type: Some("image/png".into()),
            bytes: vec![9, 8, 7],
        })
        .await
        .expect("upload");

    assert_eq!(response.file_path, "uploads/abc.png");
    let (name, mime, bytes) = seen.lock().await.clone().expect("server saw the file");
    assert_eq!(name, "cat.png");
    assert_eq!(mime.as_deref(), Some("image/png"));
    assert_eq!(bytes, vec![9, 8, 7]);
}

#[tokio::test]
async fn mark_read_and_file_url_round_trip_paths() {
    let (server_url, _) = spawn_api_server().await;
    let api = api_for(&server_url, "token-abc");

    api.mark_direct_read(UserId(2)).await.expect("mark read");
    let err = api
        .mark_direct_read(UserId(5))
        .await
        .expect_err("unknown friend");
    assert_eq!(
        err.downcast_ref::<ApiException>().map(|e| e.code),
        Some(ErrorCode::NotFound)
    );

    let url = api.file_url("uploads/abc.png").await.expect("url");
    assert_eq!(url, "https://cdn.test/uploads/abc.png?sig=1");
}

#[tokio::test]
async fn missing_api_returns_empty_directory() {
    let api = MissingChatApi;
    assert!(api.fetch_friends().await.expect("friends").is_empty());
    assert!(api.fetch_groups().await.expect("groups").is_empty());
    assert!(api.file_url("x").await.is_err());
}
