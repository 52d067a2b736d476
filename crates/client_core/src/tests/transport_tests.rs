use std::time::Duration;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, time::timeout};

use super::*;

async fn ws_handler(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer good-token");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(serve_socket)
}

async fn serve_socket(mut socket: WebSocket) {
    let hello = r#"{"event":"initialFriendsStatus","data":[{"id":2,"isOnline":true}]}"#;
    if socket.send(WsMessage::Text(hello.to_string())).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) if text == "bye" => break,
            WsMessage::Text(text) => {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_ws_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(ws_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn recv(connection: &mut Connection) -> Option<String> {
    timeout(Duration::from_secs(2), connection.inbound.recv())
        .await
        .expect("frame in time")
}

#[test]
fn server_url_maps_to_websocket_endpoint() {
    assert_eq!(
        WsConnector::from_server_url("http://chat.local:5000/")
            .expect("http")
            .ws_url(),
        "ws://chat.local:5000/ws"
    );
    assert_eq!(
        WsConnector::from_server_url("https://chat.example")
            .expect("https")
            .ws_url(),
        "wss://chat.example/ws"
    );
    assert!(matches!(
        WsConnector::from_server_url("chat.example"),
        Err(ChannelError::Transport(_))
    ));
}

#[tokio::test]
async fn connects_with_bearer_token_and_relays_text_frames() {
    let server_url = spawn_ws_server().await;
    let connector = WsConnector::from_server_url(&server_url).expect("url");

    let mut connection = connector
        .connect(&Credential::new("good-token"))
        .await
        .expect("connect");

    let hello = recv(&mut connection).await.expect("hello frame");
    assert!(hello.contains("initialFriendsStatus"));

    connection
        .outbound
        .send(r#"{"event":"typingStart","data":{"to":2}}"#.to_string())
        .expect("send");
    let echoed = recv(&mut connection).await.expect("echo");
    assert_eq!(echoed, r#"{"event":"typingStart","data":{"to":2}}"#);
}

#[tokio::test]
async fn unauthorized_handshake_maps_to_rejected() {
    let server_url = spawn_ws_server().await;
    let connector = WsConnector::from_server_url(&server_url).expect("url");

    let result = connector.connect(&Credential::new("bad-token")).await;

    assert!(matches!(result, Err(ChannelError::Rejected(_))));
}

#[tokio::test]
async fn server_close_ends_inbound_stream() {
    let server_url = spawn_ws_server().await;
    let connector = WsConnector::from_server_url(&server_url).expect("url");
    let mut connection = connector
        .connect(&Credential::new("good-token"))
        .await
        .expect("connect");
    let _hello = recv(&mut connection).await;

    connection.outbound.send("bye".to_string()).expect("send");

    assert_eq!(recv(&mut connection).await, None);
}
