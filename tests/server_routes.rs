//! HTTP API exercised over a real socket.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::*;
use folio::server::router;

async fn spawn_server(world: &World) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = world.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, router(app)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_ready(client: &reqwest::Client, base: &str, id: &str) -> Value {
    for _ in 0..100 {
        let body: Value = client
            .get(format!("{}/books/{}/status", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        match body["status"]["state"].as_str() {
            Some("ready") | Some("failed") => return body,
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("book {} never finished ingesting", id);
}

#[tokio::test]
async fn test_health() {
    let w = world();
    let base = spawn_server(&w).await;
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_book_then_chat() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/books", base))
        .json(&json!({
            "id": "courtship",
            "title": "Courtship",
            "author": "Anon",
            "text": courtship().join("\n\n"),
            "visibility": "public"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["book_id"], "courtship");
    assert_eq!(ack["status"]["state"], "pending");

    let status = wait_ready(&client, &base, "courtship").await;
    assert_eq!(status["status"]["state"], "ready", "{}", status);

    let resp = client
        .post(format!("{}/chat", base))
        .json(&json!({
            "book_ids": ["courtship"],
            "character_id": "elizabeth",
            "message": "Why does Elizabeth refuse Darcy's proposal?"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "delivered");
    assert_eq!(body["response_text"], ANSWER);
    assert_eq!(body["evidence_used"][0]["book_id"], "courtship");
    assert!(w.generator.prompts().last().unwrap().starts_with("You are Elizabeth"));

    let stats: Value = client
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["books"], 1);
    assert_eq!(stats["model"], "mock-bow");
}

#[tokio::test]
async fn test_chat_without_books_returns_guidance() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/chat", base))
        .json(&json!({ "book_ids": [], "message": "hello" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["outcome"], "guidance");
    assert_eq!(body["evidence_used"], json!([]));
    assert_eq!(w.generator.calls(), 0);
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/books", base))
        .json(&json!({ "id": "blank", "title": "Blank", "text": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "malformed_input");
}

#[tokio::test]
async fn test_upload_plain_text() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/books/courtship/upload?title=Courtship&visibility=public", base))
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(courtship().join("\n\n"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let status = wait_ready(&client, &base, "courtship").await;
    assert_eq!(status["status"]["state"], "ready", "{}", status);
}

#[tokio::test]
async fn test_upload_unsupported_format() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/books/cover/upload?title=Cover", base))
        .header("Content-Type", "image/png")
        .body(vec![0x89u8, b'P', b'N', b'G'])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_format");
}

#[tokio::test]
async fn test_unknown_book_errors() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/books/nope/status", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "book_not_found");

    let resp = client
        .delete(format!("{}/books/nope", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/chat", base))
        .json(&json!({ "book_ids": ["nope"], "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_delete_book() {
    let w = world();
    let base = spawn_server(&w).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/books", base))
        .json(&json!({ "id": "courtship", "title": "Courtship", "text": courtship().join("\n\n") }))
        .send()
        .await
        .unwrap();
    wait_ready(&client, &base, "courtship").await;

    let resp = client
        .delete(format!("{}/books/courtship", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], true);

    let resp = client
        .get(format!("{}/books/courtship/status", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
