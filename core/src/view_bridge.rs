/// View bridge: local REST + SSE surface over the merged inbox state
///
/// Endpoints:
///   GET    /api/state                      status, counts, active id, send error
///   GET    /api/conversations              ?q=<search>
///   GET    /api/conversations/:id          one conversation with its held thread
///   POST   /api/select                     body: {"conversation_id":"..."}
///   DELETE /api/select                     back to the list
///   POST   /api/refresh                    user-triggered (loud) refresh
///   POST   /api/send                       body: {"phone":"...|null","message":"..."}
///   GET    /events                         SSE stream of InboxEvent JSON
use crate::error::{InboxError, Result};
use crate::inbox::{Inbox, RefreshMode, RefreshOutcome};
use crate::messenger_types::{ConversationId, InboxEvent};
use futures_util::stream::{unfold, StreamExt};
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn error_status(e: &InboxError) -> StatusCode {
    match e {
        InboxError::Validation(_) => StatusCode::BAD_REQUEST,
        InboxError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        InboxError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        InboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn sse_resp(rx: tokio::sync::broadcast::Receiver<InboxEvent>) -> Resp {
    // Sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let frame = Frame::data(bytes::Bytes::from(format!("data: {}\n\n", json)));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(CACHE_CONTROL, "no-cache")
        .body(BodyExt::boxed(StreamBody::new(first.chain(events))))
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_view_bridge(inbox: Inbox, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(InboxError::Io)?;
    serve_view_bridge(inbox, listener).await
}

/// Serve on an already bound listener (port 0 in tests)
pub async fn serve_view_bridge(inbox: Inbox, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr().map_err(InboxError::Io)?;
    info!("View bridge listening on http://{}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let inbox = inbox.clone();
                        async move { Ok::<_, Infallible>(handle(req, inbox).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("View bridge connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("View bridge accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, inbox: Inbox) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/state") => get_state(&inbox).await,
        (Method::GET, "/api/conversations") => get_conversations(&query, &inbox).await,
        (Method::POST, "/api/select") => post_select(req, &inbox).await,
        (Method::DELETE, "/api/select") => {
            inbox.clear_selection().await;
            json_ok(serde_json::json!({ "active_conversation_id": null }))
        }
        (Method::POST, "/api/refresh") => post_refresh(&inbox).await,
        (Method::POST, "/api/send") => post_send(req, &inbox).await,
        (Method::GET, "/events") => sse_resp(inbox.subscribe()),
        _ => {
            if method == Method::GET && path.starts_with("/api/conversations/") {
                let raw = path.trim_start_matches("/api/conversations/");
                let id = urlencoding::decode(raw)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| raw.to_string());
                return get_conversation(&ConversationId(id), &inbox).await;
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_state(inbox: &Inbox) -> Resp {
    match serde_json::to_value(inbox.snapshot().await) {
        Ok(v) => json_ok(v),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn get_conversations(query: &str, inbox: &Inbox) -> Resp {
    let search = parse_query_param(query, "q").unwrap_or_default();
    let conversations = inbox.conversations(&search).await;
    json_ok(serde_json::json!({
        "count": conversations.len(),
        "conversations": conversations,
    }))
}

async fn get_conversation(id: &ConversationId, inbox: &Inbox) -> Resp {
    match inbox.conversation(id).await {
        Some(conversation) => json_ok(serde_json::json!({ "conversation": conversation })),
        None => json_err(StatusCode::NOT_FOUND, "conversation not found"),
    }
}

#[derive(Deserialize)]
struct SelectRequest {
    conversation_id: String,
}

async fn post_select(req: Request<hyper::body::Incoming>, inbox: &Inbox) -> Resp {
    let r: SelectRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let id = ConversationId(r.conversation_id);
    match inbox.select_conversation(&id).await {
        Ok(added) => json_ok(serde_json::json!({
            "active_conversation_id": id,
            "added": added,
        })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn post_refresh(inbox: &Inbox) -> Resp {
    match inbox.refresh(RefreshMode::Loud).await {
        Ok(outcome) => {
            let label = match outcome {
                RefreshOutcome::Skipped => "skipped",
                RefreshOutcome::Reconciled(_) => "reconciled",
                RefreshOutcome::Unavailable(_) => "unavailable",
                RefreshOutcome::Failed => "failed",
            };
            json_ok(serde_json::json!({ "outcome": label }))
        }
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    phone: Option<String>,
    message: String,
}

async fn post_send(req: Request<hyper::body::Incoming>, inbox: &Inbox) -> Resp {
    let r: SendRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let result = match r.phone {
        Some(phone) => inbox.send_message(&phone, &r.message).await,
        None => inbox.reply(&r.message).await,
    };
    match result {
        Ok(()) => json_ok(serde_json::json!({ "success": true })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn parse_query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(&v.replace('+', " ")).ok().map(|s| s.into_owned()))
}
