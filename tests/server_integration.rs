mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use common::{create_temp_storage, joined_text, parse_sse_body, test_config};
use lawchat_relay::server::{router, AppState, CHAT_ID_HEADER};
use lawchat_relay::storage::MessageStore;
use lawchat_relay::stream::StreamEvent;
use lawchat_relay::ChatRelay;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app(server: &MockServer) -> (Router, Arc<dyn MessageStore>, TempDir) {
    let (storage, dir) = create_temp_storage();
    let store: Arc<dyn MessageStore> = Arc::new(storage);
    let relay = ChatRelay::from_config(&test_config(&server.uri()), store.clone()).unwrap();
    (router(Arc::new(AppState::new(relay))), store, dir)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_chat_streams_sse_and_lists_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "Statute of limitations is two years.",
            "sources": [{"title": "Civ. Code 335.1"}]
        })))
        .mount(&server)
        .await;
    let (app, _store, _dir) = app(&server);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/chat",
            json!({"message": "How long do I have to sue?", "userId": "user-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let chat_id = response.headers()[CHAT_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    let events = parse_sse_body(&body_text(response).await);
    assert_eq!(joined_text(&events), "Statute of limitations is two years.");
    assert!(matches!(events.last(), Some(StreamEvent::Done { sources }) if sources.len() == 1));

    let response = app
        .clone()
        .oneshot(get("/api/chats?userId=user-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let chats = body_json(response).await;
    assert_eq!(chats.as_array().unwrap().len(), 1);
    assert_eq!(chats[0]["id"], chat_id.as_str());
    assert_eq!(chats[0]["title"], "How long do I have to sue?");

    let response = app
        .clone()
        .oneshot(get(&format!("/api/chats/{}", chat_id)))
        .await
        .unwrap();
    let transcript = body_json(response).await;
    assert_eq!(transcript["messages"].as_array().unwrap().len(), 2);
    assert_eq!(transcript["messages"][1]["role"], "assistant");
    assert_eq!(
        transcript["messages"][1]["references"][0]["title"],
        "Civ. Code 335.1"
    );

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/chats/{}", chat_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get(&format!("/api/chats/{}", chat_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_validation_error_is_json_400() {
    let server = MockServer::start().await;
    let (app, _store, _dir) = app(&server);

    let response = app
        .oneshot(post_json("/api/chat", json!({"message": "   ", "userId": "user-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn test_chat_malformed_body_is_400() {
    let server = MockServer::start().await;
    let (app, _store, _dir) = app(&server);

    let response = app
        .oneshot(post_json("/api/chat", json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_upstream_failure_mirrors_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Workflow could not be started!"))
        .mount(&server)
        .await;
    let (app, _store, _dir) = app(&server);

    let response = app
        .oneshot(post_json("/api/chat", json!({"message": "Hi", "userId": "user-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "upstream");
    assert_eq!(body["error"]["body"], "Workflow could not be started!");
    assert_eq!(body["error"]["upstreamStatus"], 500);
}

#[tokio::test]
async fn test_inactive_workflow_is_never_a_raw_404() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            "The requested webhook is not registered. The workflow must be active.",
        ))
        .mount(&server)
        .await;
    let (app, store, _dir) = app(&server);

    let response = app
        .oneshot(post_json("/api/chat", json!({"message": "Hi", "userId": "user-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_sse_body(&body_text(response).await);
    assert!(!joined_text(&events).is_empty());
    assert_eq!(events.last(), Some(&StreamEvent::done()));

    // The fallback answer is not stored, so the session never reaches history
    assert!(store.list_valid_chats("user-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_chats_requires_user() {
    let server = MockServer::start().await;
    let (app, _store, _dir) = app(&server);

    let response = app.oneshot(get("/api/chats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_chat_returns_201() {
    let server = MockServer::start().await;
    let (app, store, _dir) = app(&server);

    let response = app
        .oneshot(post_json(
            "/api/chats",
            json!({"userId": "user-1", "title": "Lease dispute"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let chat = body_json(response).await;
    assert_eq!(chat["title"], "Lease dispute");
    assert_eq!(chat["userId"], "user-1");

    let id = chat["id"].as_str().unwrap();
    assert!(store.get_chat(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_unknown_chat_is_404() {
    let server = MockServer::start().await;
    let (app, _store, _dir) = app(&server);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/chats/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["kind"], "not_found");
}
