/// HTTP tests: ApiClient against a local hyper backend, and the view bridge
extern crate wa_inbox_core;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use wa_inbox_core::api::{ApiClient, ImageUpload, InboxBackend};
use wa_inbox_core::messenger_types::ConversationId;
use wa_inbox_core::state::InboxStatus;
use wa_inbox_core::{
    view_bridge, Config, Inbox, InboxError, Presentation, RefreshMode, RefreshOutcome, Session,
};

// ─── Fake backend ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

type Handler = Arc<dyn Fn(&Recorded) -> (StatusCode, &'static str, String) + Send + Sync>;
type Log = Arc<Mutex<Vec<Recorded>>>;

async fn spawn_backend(handler: Handler) -> (String, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let server_log = log.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let log = log.clone();
                    async move {
                        let method = req.method().to_string();
                        let path = req.uri().path().to_string();
                        let headers = req.headers().clone();
                        let body = req
                            .collect()
                            .await
                            .map(|c| c.to_bytes())
                            .unwrap_or_default();
                        let recorded = Recorded {
                            method,
                            path,
                            headers,
                            body,
                        };
                        let (status, content_type, body) = handler(&recorded);
                        log.lock().unwrap().push(recorded);
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, content_type)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (format!("http://{}/api", addr), log)
}

fn json(body: serde_json::Value) -> (StatusCode, &'static str, String) {
    (StatusCode::OK, "application/json", body.to_string())
}

fn client_for(base_url: &str) -> ApiClient {
    let config = Config {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    ApiClient::new(&config, Session::new("acme", "tok-123").unwrap()).unwrap()
}

fn conversations_body() -> serde_json::Value {
    serde_json::json!({
        "status": "success",
        "data": [
            {
                "id": 1,
                "name": "Ana",
                "phone": "5511900001111",
                "avatar": "",
                "last_message": "oi, tudo bem?",
                "last_reply_at": "2024-03-01 10:00:00",
                "resolved_chat": 0,
                "is_last_message_by_contact": 1
            },
            {
                "id": "2",
                "name": null,
                "phone": "5522900002222",
                "last_message": "obrigado",
                "resolved_chat": true,
                "is_last_message_by_contact": true
            }
        ],
        "summary": { "total_conversations": 10, "filtered_conversations": 2 }
    })
}

// ─── ApiClient ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_conversations_normalizes_and_authenticates() {
    let (base, log) = spawn_backend(Arc::new(|_: &Recorded| json(conversations_body()))).await;
    let client = client_for(&base);

    let page = client.fetch_conversations().await.unwrap();
    assert_eq!(page.total, 10);
    assert_eq!(page.filtered, 2);
    assert_eq!(page.conversations.len(), 2);

    let ana = &page.conversations[0];
    assert_eq!(ana.id, ConversationId::from("1"));
    assert!(ana.is_unread);
    assert!(ana.avatar_url.is_none());

    let second = &page.conversations[1];
    assert_eq!(second.display_name, "5522900002222");
    assert!(!second.is_unread);

    let requests = log.lock().unwrap();
    let req = &requests[0];
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, "/api/whatsapp/conversations");
    assert_eq!(req.headers["authorization"], "Bearer tok-123");
    assert_eq!(req.headers["x-tenant-id"], "acme");
    assert!(req.headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_fetch_messages_uses_encoded_path() {
    let (base, log) = spawn_backend(Arc::new(|_: &Recorded| {
        json(serde_json::json!({
            "status": "success",
            "data": [
                { "id": 102, "value": "segunda", "created_at": "2024-03-01 10:05:00",
                  "is_message_by_contact": 0, "message_type": 1, "header_image": null },
                { "id": 101, "value": "", "created_at": "2024-03-01 10:00:00",
                  "is_message_by_contact": 1, "message_type": 2,
                  "header_image": "https://cdn.example.com/p.jpg" }
            ]
        }))
    }))
    .await;
    let client = client_for(&base);

    let messages = client
        .fetch_messages(&ConversationId::from("a/b"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_outbound);
    assert!(messages[1].is_image);
    assert!(!messages[1].is_outbound);

    assert_eq!(
        log.lock().unwrap()[0].path,
        "/api/whatsapp/conversations/a%2Fb/messages"
    );
}

#[tokio::test]
async fn test_html_response_means_not_configured() {
    let (base, _) = spawn_backend(Arc::new(|_: &Recorded| {
        (
            StatusCode::OK,
            "text/html; charset=utf-8",
            "<html><body>Whoops</body></html>".to_string(),
        )
    }))
    .await;
    let result = client_for(&base).fetch_conversations().await;
    assert!(matches!(result, Err(InboxError::NotConfigured(_))));
}

#[tokio::test]
async fn test_error_envelopes_are_classified() {
    let (base, _) = spawn_backend(Arc::new(|req: &Recorded| match req.path.as_str() {
        "/api/whatsapp/conversations" => json(serde_json::json!({
            "status": "error",
            "error": "No WhatsApp API settings configured"
        })),
        "/api/whatsapp/send-message" => (
            StatusCode::BAD_REQUEST,
            "application/json",
            serde_json::json!({ "status": "error", "error": "User lacks permission to send" })
                .to_string(),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "application/json",
            serde_json::json!({ "status": "error", "message": "template missing" }).to_string(),
        ),
    }))
    .await;
    let client = client_for(&base);

    assert!(matches!(
        client.fetch_conversations().await,
        Err(InboxError::NotConfigured(_))
    ));
    assert!(matches!(
        client.send_message("5511", "hi").await,
        Err(InboxError::PermissionDenied(_))
    ));
    match client.fetch_messages(&ConversationId::from("9")).await {
        Err(InboxError::Api(reason)) => assert_eq!(reason, "template missing"),
        other => panic!("expected api error, got {:?}", other.map(|m| m.len())),
    }
}

#[tokio::test]
async fn test_forbidden_status_means_permission_denied() {
    let (base, _) = spawn_backend(Arc::new(|_: &Recorded| {
        (StatusCode::FORBIDDEN, "text/html", "nope".to_string())
    }))
    .await;
    let result = client_for(&base).fetch_conversations().await;
    assert!(matches!(result, Err(InboxError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_send_message_posts_json() {
    let (base, log) = spawn_backend(Arc::new(|_: &Recorded| {
        json(serde_json::json!({ "status": "success", "data": { "id": "wamid.1" } }))
    }))
    .await;
    client_for(&base)
        .send_message("5511900001111", "olá!")
        .await
        .unwrap();

    let requests = log.lock().unwrap();
    assert_eq!(requests[0].path, "/api/whatsapp/send-message");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["phone"], "5511900001111");
    assert_eq!(body["message"], "olá!");
}

#[tokio::test]
async fn test_send_image_posts_multipart() {
    let (base, log) = spawn_backend(Arc::new(|_: &Recorded| {
        json(serde_json::json!({ "status": "success" }))
    }))
    .await;
    let image = ImageUpload {
        file_name: "menu.png".to_string(),
        bytes: b"\x89PNG fake".to_vec(),
    };
    client_for(&base)
        .send_image("5511", image, Some("cardápio"))
        .await
        .unwrap();

    let requests = log.lock().unwrap();
    let req = &requests[0];
    assert_eq!(req.path, "/api/whatsapp/send-image");
    let content_type = req.headers[CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&req.body);
    assert!(body.contains("name=\"phone\""));
    assert!(body.contains("filename=\"menu.png\""));
    assert!(body.contains("cardápio"));
}

// ─── Inbox over HTTP ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inbox_surfaces_unconfigured_integration() {
    let (base, _) = spawn_backend(Arc::new(|_: &Recorded| {
        (StatusCode::OK, "text/html", "<h1>Server Error</h1>".to_string())
    }))
    .await;
    let config = Config {
        base_url: base.clone(),
        presentation: Presentation::Mobile,
        ..Default::default()
    };
    let inbox = Inbox::new(config, Arc::new(client_for(&base)));

    let outcome = inbox.refresh(RefreshMode::Loud).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Unavailable(InboxStatus::NotConfigured));
    assert_eq!(inbox.status().await, InboxStatus::NotConfigured);
    assert!(inbox.conversations("").await.is_empty());
    assert!(!inbox.snapshot().await.loading);
}

#[tokio::test]
async fn test_view_bridge_serves_merged_state() {
    let (base, _) = spawn_backend(Arc::new(|req: &Recorded| {
        if req.path.ends_with("/messages") {
            json(serde_json::json!({
                "status": "success",
                "data": [{ "id": 1, "value": "oi", "created_at": "2024-03-01 10:00:00",
                           "is_message_by_contact": 1 }]
            }))
        } else {
            json(conversations_body())
        }
    }))
    .await;
    let config = Config {
        base_url: base.clone(),
        presentation: Presentation::Mobile,
        ..Default::default()
    };
    let inbox = Inbox::new(config, Arc::new(client_for(&base)));
    inbox.refresh(RefreshMode::Quiet).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(view_bridge::serve_view_bridge(inbox.clone(), listener));

    let http = reqwest::Client::new();
    let state: serde_json::Value = http
        .get(format!("{}/api/state", bridge))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["total_conversations"], 10);
    assert_eq!(state["unread_conversations"], 1);
    assert_eq!(state["status"]["state"], "ready");

    let list: serde_json::Value = http
        .get(format!("{}/api/conversations?q=ana", bridge))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);

    let selected: serde_json::Value = http
        .post(format!("{}/api/select", bridge))
        .json(&serde_json::json!({ "conversation_id": "1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(selected["added"], 1);

    let thread: serde_json::Value = http
        .get(format!("{}/api/conversations/1", bridge))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(thread["conversation"]["messages"][0]["text"], "oi");

    let missing = http
        .post(format!("{}/api/select", bridge))
        .json(&serde_json::json!({ "conversation_id": "404" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_view_bridge_streams_loading_events() {
    let (base, _) = spawn_backend(Arc::new(|_: &Recorded| json(conversations_body()))).await;
    let config = Config {
        base_url: base.clone(),
        presentation: Presentation::Mobile,
        ..Default::default()
    };
    let inbox = Inbox::new(config, Arc::new(client_for(&base)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(view_bridge::serve_view_bridge(inbox.clone(), listener));

    let http = reqwest::Client::new();
    let mut stream = http.get(format!("{}/events", bridge)).send().await.unwrap();
    assert_eq!(stream.status(), reqwest::StatusCode::OK);
    let hello = stream.chunk().await.unwrap().unwrap();
    let mut seen = String::from_utf8_lossy(&hello).into_owned();
    assert!(seen.starts_with(": connected"));

    let refreshed: serde_json::Value = http
        .post(format!("{}/api/refresh", bridge))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(refreshed["outcome"], "reconciled");

    tokio::time::timeout(Duration::from_secs(2), async {
        while !seen.contains(r#""loading":false"#) {
            let chunk = stream.chunk().await.unwrap().unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("loading events never streamed");
    assert!(seen.contains(r#"{"type":"loading_changed","loading":true}"#));
}
