/// WhatsApp inbox core
///
/// Client-side synchronization for a multi-tenant WhatsApp inbox: polls a REST
/// backend, merges conversation and message lists into held view state, and
/// decides when new inbound content deserves a notification.

pub mod error;
pub mod config;
pub mod session;
pub mod messenger_types;
pub mod state;
pub mod merge;
pub mod notify;
pub mod api;
pub mod scheduler;
pub mod inbox;
pub mod view_bridge;
pub mod cli_app;

pub use api::{ApiClient, ImageUpload, InboxBackend};
pub use config::{Config, Presentation};
pub use error::{InboxError, Result};
pub use inbox::{Inbox, RefreshMode, RefreshOutcome};
pub use session::Session;
