/// REST client for the tenant's WhatsApp backend
///
/// Endpoints (all POST, all under the configured base URL):
///   /whatsapp/conversations                 conversation summaries + counts
///   /whatsapp/conversations/:id/messages    full thread of one conversation
///   /whatsapp/send-message                  body: {"phone":"...","message":"..."}
///   /whatsapp/send-image                    multipart: phone, image, caption
use crate::config::Config;
use crate::error::{InboxError, Result};
use crate::messenger_types::{
    ConversationId, ConversationPage, Envelope, Message, RawConversation, RawMessage,
};
use crate::session::Session;
use async_trait::async_trait;
use chrono::Local;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

const CONVERSATIONS_PATH: &str = "/whatsapp/conversations";
const SEND_MESSAGE_PATH: &str = "/whatsapp/send-message";
const SEND_IMAGE_PATH: &str = "/whatsapp/send-image";

const TENANT_HEADER: &str = "X-Tenant-ID";
const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Backend error text that means the tenant never configured the integration
pub const NOT_CONFIGURED_MARKER: &str = "No WhatsApp API settings configured";

/// Everything the inbox needs from the backend
#[async_trait]
pub trait InboxBackend: Send + Sync + 'static {
    async fn fetch_conversations(&self) -> Result<ConversationPage>;

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    async fn send_message(&self, phone: &str, message: &str) -> Result<()>;

    async fn send_image(&self, phone: &str, image: ImageUpload, caption: Option<&str>)
        -> Result<()>;
}

/// Image attachment ready for upload
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub async fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| InboxError::Validation(format!("not a file: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path).await.map_err(InboxError::Io)?;
        if bytes.is_empty() {
            return Err(InboxError::Validation(format!("{} is empty", file_name)));
        }
        Ok(Self { file_name, bytes })
    }

    pub fn mime_type(&self) -> &'static str {
        let ext = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "application/octet-stream",
        }
    }
}

/// Map a backend failure message onto the error taxonomy
pub fn classify_failure(reason: &str) -> InboxError {
    if reason.contains(NOT_CONFIGURED_MARKER) {
        InboxError::NotConfigured(reason.to_string())
    } else if reason.to_lowercase().contains("permission") {
        InboxError::PermissionDenied(reason.to_string())
    } else {
        InboxError::Api(reason.to_string())
    }
}

/// HTTP implementation of [`InboxBackend`]
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    root: String,
    session: Session,
}

impl ApiClient {
    pub fn new(config: &Config, session: Session) -> Result<Self> {
        config.validate()?;
        session.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(InboxError::Http)?;
        Ok(Self {
            http,
            root: config.api_root().to_string(),
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.root, path))
            .header(AUTHORIZATION, self.session.bearer())
            .header(TENANT_HEADER, &self.session.tenant_id)
            .header(ACCEPT, "application/json")
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<Envelope<T>> {
        let request_id = Uuid::new_v4().to_string();
        debug!("→ {} (request {})", endpoint, request_id);

        let response = request
            .header(REQUEST_ID_HEADER, &request_id)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InboxError::Timeout(format!("{} timed out", endpoint))
                } else {
                    InboxError::Http(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(InboxError::PermissionDenied(format!(
                "{} returned 403 Forbidden",
                endpoint
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.contains("json") {
            // Misconfigured backends answer with an HTML error page
            warn!(
                "{} answered with non-JSON content type {:?} (request {})",
                endpoint, content_type, request_id
            );
            return Err(InboxError::NotConfigured(format!(
                "{} did not return JSON",
                endpoint
            )));
        }

        let body = response.bytes().await.map_err(InboxError::Http)?;
        let envelope: Envelope<T> = match serde_json::from_slice(&body) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(InboxError::Api(format!("{} returned HTTP {}", endpoint, status)));
            }
            Err(e) => return Err(InboxError::Serialization(e)),
        };

        if !envelope.is_success() {
            let reason = envelope.failure_reason();
            debug!("← {} failed: {} (request {})", endpoint, reason, request_id);
            return Err(classify_failure(&reason));
        }
        if !status.is_success() {
            return Err(InboxError::Api(format!("{} returned HTTP {}", endpoint, status)));
        }

        debug!("← {} ok (request {})", endpoint, request_id);
        Ok(envelope)
    }
}

#[async_trait]
impl InboxBackend for ApiClient {
    async fn fetch_conversations(&self) -> Result<ConversationPage> {
        let envelope: Envelope<Vec<RawConversation>> = self
            .execute(self.post(CONVERSATIONS_PATH), CONVERSATIONS_PATH)
            .await?;

        let now = Local::now();
        let conversations: Vec<_> = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|raw| raw.into_summary(now))
            .collect();
        let summary = envelope.summary.unwrap_or_default();

        Ok(ConversationPage {
            total: summary.total_conversations.unwrap_or(conversations.len()),
            filtered: summary.filtered_conversations.unwrap_or(conversations.len()),
            conversations,
        })
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let path = format!(
            "{}/{}/messages",
            CONVERSATIONS_PATH,
            urlencoding::encode(&conversation_id.0)
        );
        let envelope: Envelope<Vec<RawMessage>> = self.execute(self.post(&path), &path).await?;

        Ok(envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(RawMessage::into_message)
            .collect())
    }

    async fn send_message(&self, phone: &str, message: &str) -> Result<()> {
        let request = self.post(SEND_MESSAGE_PATH).json(&serde_json::json!({
            "phone": phone,
            "message": message,
        }));
        self.execute::<serde_json::Value>(request, SEND_MESSAGE_PATH)
            .await
            .map(|_| ())
    }

    async fn send_image(
        &self,
        phone: &str,
        image: ImageUpload,
        caption: Option<&str>,
    ) -> Result<()> {
        let mime = image.mime_type();
        let part = reqwest::multipart::Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(mime)
            .map_err(InboxError::Http)?;
        let form = reqwest::multipart::Form::new()
            .text("phone", phone.to_string())
            .text("caption", caption.unwrap_or_default().to_string())
            .part("image", part);

        self.execute::<serde_json::Value>(self.post(SEND_IMAGE_PATH).multipart(form), SEND_IMAGE_PATH)
            .await
            .map(|_| ())
    }
}
