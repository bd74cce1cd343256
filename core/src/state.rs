/// Process-local poll state, created when the inbox mounts and dropped on teardown
use crate::messenger_types::{ConversationId, ConversationSummary, InboxEvent, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// What the view should show around the lists
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum InboxStatus {
    #[default]
    Ready,
    /// The tenant has not set up the WhatsApp integration
    NotConfigured,
    /// Access restricted for this operator
    PermissionDenied,
    /// Visible error from a user-initiated action
    Error(String),
}

/// `(conversation id, last message preview)` pair already used for a notification
pub type Signature = (ConversationId, String);

/// Guard flag that collapses concurrent refresh triggers into one pass.
///
/// Cloning shares the flag; the pass that acquired it releases it when its
/// [`InFlightGuard`] is dropped, including on early return or cancellation.
#[derive(Debug, Clone, Default)]
pub struct InFlightFlag(Arc<AtomicBool>);

impl InFlightFlag {
    pub fn try_acquire(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(self.0.clone()))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Loading indicator of loud passes.
///
/// Set through [`LoadingFlag::begin`]; the returned guard turns it off again on
/// drop, so a pass that is cancelled mid-fetch cannot leave it stuck on.
#[derive(Debug, Clone, Default)]
pub struct LoadingFlag(Arc<AtomicBool>);

impl LoadingFlag {
    pub fn begin(&self, events: &broadcast::Sender<InboxEvent>) -> LoadingGuard {
        self.0.store(true, Ordering::Release);
        let _ = events.send(InboxEvent::LoadingChanged { loading: true });
        LoadingGuard {
            flag: self.0.clone(),
            events: events.clone(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct LoadingGuard {
    flag: Arc<AtomicBool>,
    events: broadcast::Sender<InboxEvent>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        let _ = self.events.send(InboxEvent::LoadingChanged { loading: false });
    }
}

/// Inline send failure; cleared after a TTL unless a newer one replaced it
#[derive(Debug, Clone)]
pub struct SendError {
    pub message: String,
    pub generation: u64,
    pub raised_at: Instant,
}

#[derive(Debug, Default)]
pub struct PollState {
    pub held_conversations: Vec<ConversationSummary>,
    pub active_conversation_id: Option<ConversationId>,
    pub last_processed_signatures: HashSet<Signature>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub total_conversations: usize,
    pub filtered_conversations: usize,
    pub status: InboxStatus,
    /// Loading indicator, only touched by loud passes
    pub loading: LoadingFlag,
    pub send_error: Option<SendError>,
    pub in_flight: InFlightFlag,
    /// False once the view is torn down; late results are dropped
    pub mounted: bool,
    send_error_generation: u64,
}

impl PollState {
    pub fn new() -> Self {
        Self {
            mounted: true,
            ..Default::default()
        }
    }

    pub fn active_conversation(&self) -> Option<&ConversationSummary> {
        let id = self.active_conversation_id.as_ref()?;
        self.held_conversations.iter().find(|c| &c.id == id)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.held_conversations.iter().find(|c| &c.id == id)
    }

    /// Held messages of the active conversation (empty when none is active)
    pub fn active_messages(&self) -> &[Message] {
        self.active_conversation()
            .map(|c| c.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn unread_count(&self) -> usize {
        self.held_conversations.iter().filter(|c| c.is_unread).count()
    }

    /// Chat-list search over the held conversations
    pub fn filtered(&self, query: &str) -> Vec<ConversationSummary> {
        self.held_conversations
            .iter()
            .filter(|c| c.matches(query))
            .cloned()
            .collect()
    }

    /// Replace the active thread. Full-value replacement of the conversation entry.
    pub fn set_active_messages(&mut self, id: &ConversationId, messages: Vec<Message>) -> bool {
        let Some(pos) = self.held_conversations.iter().position(|c| &c.id == id) else {
            return false;
        };
        let mut updated = self.held_conversations.clone();
        updated[pos] = ConversationSummary {
            messages,
            ..updated[pos].clone()
        };
        self.held_conversations = updated;
        true
    }

    /// Returns the generation of the stored error
    pub fn raise_send_error(&mut self, message: String) -> u64 {
        self.send_error_generation += 1;
        self.send_error = Some(SendError {
            message,
            generation: self.send_error_generation,
            raised_at: Instant::now(),
        });
        self.send_error_generation
    }

    /// Clear the send error only if it is still the one from `generation`
    pub fn clear_send_error(&mut self, generation: u64) -> bool {
        match &self.send_error {
            Some(err) if err.generation == generation => {
                self.send_error = None;
                true
            }
            _ => false,
        }
    }
}

/// Serializable snapshot for views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub status: InboxStatus,
    pub loading: bool,
    pub active_conversation_id: Option<ConversationId>,
    pub total_conversations: usize,
    pub filtered_conversations: usize,
    pub unread_conversations: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub send_error: Option<String>,
}

impl From<&PollState> for StateSnapshot {
    fn from(state: &PollState) -> Self {
        Self {
            status: state.status.clone(),
            loading: state.loading.is_set(),
            active_conversation_id: state.active_conversation_id.clone(),
            total_conversations: state.total_conversations,
            filtered_conversations: state.filtered_conversations,
            unread_conversations: state.unread_count(),
            last_refresh: state.last_refresh,
            send_error: state.send_error.as_ref().map(|e| e.message.clone()),
        }
    }
}
