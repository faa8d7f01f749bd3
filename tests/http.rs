mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use docchat::extract::FormatExtractor;
use docchat::server;

const MANUAL: &str = "Warranty terms. The warranty covers defects for two years.\u{c}\
Battery care. Charge the battery fully before first use.\u{c}\
Screen cleaning. Wipe the screen with a dry cloth.";

async fn start_server() -> (u16, reqwest::Client) {
    let port = find_free_port();
    let (app, _store) = build(
        Arc::new(KeywordEmbedder::new()),
        Arc::new(ScriptedLlm::replying("It lasts two years [C0].")),
        Arc::new(FormatExtractor),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        server::serve(app, listener).await.ok();
    });
    wait_for_server(port).await;
    (port, reqwest::Client::new())
}

async fn upload(client: &reqwest::Client, port: u16, body: &str) -> reqwest::Response {
    client
        .post(format!("http://127.0.0.1:{}/upload", port))
        .header("x-owner-id", OWNER)
        .header("content-type", "text/plain")
        .header("x-file-name", "manual.txt")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

async fn poll_until_done(client: &reqwest::Client, port: u16, document_id: &str) -> Value {
    let url = format!("http://127.0.0.1:{}/status/{}", port, document_id);
    for _ in 0..100 {
        let body: Value = client
            .get(&url)
            .header("x-owner-id", OWNER)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["processingStatus"] == "completed" || body["processingStatus"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("document {} never finished processing", document_id);
}

#[tokio::test]
async fn upload_poll_and_chat_over_http() {
    let (port, client) = start_server().await;

    let resp = upload(&client, port, MANUAL).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    let document_id = body["document_id"].as_str().unwrap().to_string();

    let status = poll_until_done(&client, port, &document_id).await;
    assert_eq!(status["processingStatus"], "completed");
    assert_eq!(status["totalPages"], 3);
    assert_eq!(status["isReady"], true);
    assert!(status["chunkCount"].as_u64().unwrap() > 0);

    let resp = client
        .post(format!("http://127.0.0.1:{}/chat", port))
        .header("x-owner-id", OWNER)
        .json(&json!({
            "chat_id": "chat-1",
            "message": "How long is the warranty?",
            "document_id": document_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["answer"], "It lasts two years [C0].");
    let citations = body["citations"].as_array().unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0]["page"], 1);
    assert_eq!(citations[0]["chunk_index"], 0);
    let score = citations[0]["similarity_score"].as_f64().unwrap();
    assert!(score > 0.5 && score <= 1.0);
}

#[tokio::test]
async fn status_is_scoped_to_the_owner() {
    let (port, client) = start_server().await;
    let body: Value = upload(&client, port, MANUAL).await.json().await.unwrap();
    let document_id = body["document_id"].as_str().unwrap();

    let resp = client
        .get(format!("http://127.0.0.1:{}/status/{}", port, document_id))
        .header("x-owner-id", "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .get(format!("http://127.0.0.1:{}/status/{}", port, document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn malformed_chat_requests_are_rejected() {
    let (port, client) = start_server().await;
    let url = format!("http://127.0.0.1:{}/chat", port);

    let resp = client
        .post(&url)
        .header("x-owner-id", OWNER)
        .json(&json!({"chat_id": "c", "message": "hi", "temperature": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(&url)
        .header("x-owner-id", OWNER)
        .json(&json!({"chat_id": "c", "message": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unsupported_upload_is_rejected() {
    let (port, client) = start_server().await;
    let resp = client
        .post(format!("http://127.0.0.1:{}/upload", port))
        .header("x-owner-id", OWNER)
        .header("content-type", "image/png")
        .body(vec![0x89u8, b'P', b'N', b'G', 0, 1, 2, 3])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn reprocess_is_accepted_after_completion() {
    let (port, client) = start_server().await;
    let body: Value = upload(&client, port, MANUAL).await.json().await.unwrap();
    let document_id = body["document_id"].as_str().unwrap().to_string();
    let first = poll_until_done(&client, port, &document_id).await;

    let resp = client
        .post(format!(
            "http://127.0.0.1:{}/documents/{}/reprocess",
            port, document_id
        ))
        .header("x-owner-id", OWNER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let second = poll_until_done(&client, port, &document_id).await;
    assert_eq!(second["processingStatus"], "completed");
    assert_eq!(second["chunkCount"], first["chunkCount"]);
}
