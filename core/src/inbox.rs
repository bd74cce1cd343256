/// Inbox controller: owns the poll state and drives fetch → merge → notify
use crate::api::{ImageUpload, InboxBackend};
use crate::config::Config;
use crate::error::{InboxError, Result};
use crate::merge::{merge_messages, reconcile_conversations, ConversationReconciliation, MessageMerge};
use crate::messenger_types::{ConversationId, ConversationSummary, InboxEvent, Message};
use crate::notify::{NotificationCue, Notifier, TerminalBell};
use crate::scheduler::PollScheduler;
use crate::state::{InboxStatus, PollState, StateSnapshot};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock, RwLockWriteGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Loud passes drive the loading indicator and surface errors; quiet ones do neither
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Quiet,
    Loud,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Another pass was in flight, or the inbox is torn down
    Skipped,
    Reconciled(ConversationReconciliation),
    /// Integration missing or access restricted; the status says which
    Unavailable(InboxStatus),
    /// Transient failure swallowed by a quiet pass
    Failed,
}

/// The mounted inbox. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Inbox {
    config: Config,
    backend: Arc<dyn InboxBackend>,
    notifier: Arc<dyn Notifier>,
    state: Arc<RwLock<PollState>>,
    events: broadcast::Sender<InboxEvent>,
    scheduler: Arc<Mutex<Option<PollScheduler>>>,
}

impl Inbox {
    pub fn new(config: Config, backend: Arc<dyn InboxBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            backend,
            notifier: Arc::new(TerminalBell),
            state: Arc::new(RwLock::new(PollState::new())),
            events,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InboxEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Initial loud load, then background polling at the configured cadence
    pub async fn start(&self) {
        info!(
            "Starting inbox against {} (poll every {:?})",
            self.config.api_root(),
            self.config.poll_interval
        );
        if let Err(e) = self.refresh(RefreshMode::Loud).await {
            warn!("Initial load failed: {}", e);
        }

        let mut slot = self.scheduler.lock().await;
        if slot.as_ref().is_some_and(PollScheduler::is_running) {
            return;
        }
        let inbox = self.clone();
        *slot = Some(PollScheduler::spawn(self.config.poll_interval, move || {
            let inbox = inbox.clone();
            async move {
                // quiet passes never return Err
                let _ = inbox.refresh(RefreshMode::Quiet).await;
            }
        }));
    }

    /// Stop polling and drop any result that is still in flight
    pub async fn shutdown(&self) {
        self.state.write().await.mounted = false;
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop();
        }
        info!("Inbox stopped");
    }

    pub async fn is_polling(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(PollScheduler::is_running)
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from(&*self.state.read().await)
    }

    pub async fn status(&self) -> InboxStatus {
        self.state.read().await.status.clone()
    }

    /// Held conversations matching the chat-list search
    pub async fn conversations(&self, query: &str) -> Vec<ConversationSummary> {
        self.state.read().await.filtered(query)
    }

    pub async fn conversation(&self, id: &ConversationId) -> Option<ConversationSummary> {
        self.state.read().await.conversation(id).cloned()
    }

    pub async fn active_conversation_id(&self) -> Option<ConversationId> {
        self.state.read().await.active_conversation_id.clone()
    }

    pub async fn active_messages(&self) -> Vec<Message> {
        self.state.read().await.active_messages().to_vec()
    }

    // ─── Refresh ─────────────────────────────────────────────────────────────

    /// One fetch-and-merge pass over the conversation list.
    ///
    /// At most one pass runs at a time; a trigger that arrives while another
    /// pass is in flight returns `Skipped` and is not replayed.
    pub async fn refresh(&self, mode: RefreshMode) -> Result<RefreshOutcome> {
        let (_guard, loading) = {
            let state = self.state.read().await;
            if !state.mounted {
                return Ok(RefreshOutcome::Skipped);
            }
            match state.in_flight.try_acquire() {
                Some(guard) => (guard, state.loading.clone()),
                None => {
                    debug!("refresh already in flight, dropping {:?} trigger", mode);
                    return Ok(RefreshOutcome::Skipped);
                }
            }
        };

        // settles on drop, also when this future is cancelled mid-fetch
        let loading = (mode == RefreshMode::Loud).then(|| loading.begin(&self.events));

        let fetched = self.bounded(self.backend.fetch_conversations(), "conversation fetch").await;
        drop(loading);

        let mut state = self.state.write().await;
        if !state.mounted {
            debug!("inbox torn down, discarding conversation fetch");
            return Ok(RefreshOutcome::Skipped);
        }

        let page = match fetched {
            Ok(page) => page,
            Err(e) => return self.fail_refresh(state, e, mode),
        };

        let reconciliation =
            reconcile_conversations(&mut state, page.conversations, self.config.presentation);
        let refreshed_at = Utc::now();
        state.total_conversations = page.total;
        state.filtered_conversations = page.filtered;
        state.last_refresh = Some(refreshed_at);
        let status_recovered = state.status != InboxStatus::Ready;
        state.status = InboxStatus::Ready;
        let unread = state.unread_count();
        let active = state.active_conversation_id.clone();
        drop(state);

        if status_recovered {
            self.emit(InboxEvent::StatusChanged {
                status: InboxStatus::Ready,
            });
        }
        self.emit(InboxEvent::ConversationsUpdated {
            total: page.total,
            unread,
            refreshed_at,
        });

        if reconciliation.has_new_content {
            debug!(
                "new content in {} conversation(s), notify={}",
                reconciliation.content_changes.len(),
                reconciliation.notify
            );
            if reconciliation.notify {
                self.notifier.notify(&NotificationCue {
                    conversation_ids: reconciliation.content_changes.clone(),
                });
            }
            self.emit(InboxEvent::NewContent {
                conversation_ids: reconciliation.content_changes.clone(),
                notified: reconciliation.notify,
            });
        }

        if reconciliation.active_changed {
            self.emit(InboxEvent::ActiveConversationChanged {
                conversation_id: active.clone(),
            });
        }

        if reconciliation.fetch_active_messages {
            if let Some(id) = active {
                self.spawn_thread_refresh(id);
            }
        }

        Ok(RefreshOutcome::Reconciled(reconciliation))
    }

    fn fail_refresh(
        &self,
        mut state: RwLockWriteGuard<'_, PollState>,
        error: InboxError,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome> {
        if let Some(status) = unavailable_status(&error) {
            warn!("Inbox unavailable: {}", error);
            self.mark_unavailable(state, status.clone());
            return Ok(RefreshOutcome::Unavailable(status));
        }

        match mode {
            RefreshMode::Quiet => {
                debug!("background refresh failed: {}", error);
                Ok(RefreshOutcome::Failed)
            }
            RefreshMode::Loud => {
                let status = InboxStatus::Error(error.to_string());
                state.status = status.clone();
                drop(state);
                self.emit(InboxEvent::StatusChanged { status });
                Err(error)
            }
        }
    }

    /// Integration missing or access restricted: nothing held stays visible
    fn mark_unavailable(&self, mut state: RwLockWriteGuard<'_, PollState>, status: InboxStatus) {
        let changed = state.status != status;
        let had_active = state.active_conversation_id.is_some();
        state.held_conversations = Vec::new();
        state.active_conversation_id = None;
        state.total_conversations = 0;
        state.filtered_conversations = 0;
        state.status = status.clone();
        drop(state);
        if changed {
            self.emit(InboxEvent::StatusChanged { status });
        }
        if had_active {
            self.emit(InboxEvent::ActiveConversationChanged {
                conversation_id: None,
            });
        }
    }

    /// Bound a backend call by the request timeout so a hung call cannot pin the in-flight guard
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>, what: &str) -> Result<T> {
        match timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(InboxError::Timeout(format!(
                "{} exceeded {:?}",
                what, self.config.request_timeout
            ))),
        }
    }

    // ─── Threads ─────────────────────────────────────────────────────────────

    fn spawn_thread_refresh(&self, id: ConversationId) {
        let inbox = self.clone();
        tokio::spawn(async move {
            let _ = inbox.refresh_thread(&id, RefreshMode::Quiet).await;
        });
    }

    /// Fetch the active conversation's thread and append unseen messages.
    /// Returns how many messages were added.
    pub async fn refresh_active_thread(&self, mode: RefreshMode) -> Result<usize> {
        match self.active_conversation_id().await {
            Some(id) => self.refresh_thread(&id, mode).await,
            None => Ok(0),
        }
    }

    async fn refresh_thread(&self, id: &ConversationId, mode: RefreshMode) -> Result<usize> {
        let fetched = match self.bounded(self.backend.fetch_messages(id), "message fetch").await {
            Ok(messages) => messages,
            Err(e) => {
                if let Some(status) = unavailable_status(&e) {
                    warn!("Thread for {} unavailable: {}", id, e);
                    let state = self.state.write().await;
                    if state.mounted {
                        self.mark_unavailable(state, status);
                    }
                    return match mode {
                        RefreshMode::Quiet => Ok(0),
                        RefreshMode::Loud => Err(e),
                    };
                }
                return match mode {
                    RefreshMode::Quiet => {
                        debug!("background thread refresh for {} failed: {}", id, e);
                        Ok(0)
                    }
                    RefreshMode::Loud => {
                        let status = InboxStatus::Error(e.to_string());
                        self.state.write().await.status = status.clone();
                        self.emit(InboxEvent::StatusChanged { status });
                        Err(e)
                    }
                };
            }
        };

        let mut state = self.state.write().await;
        if !state.mounted || state.active_conversation_id.as_ref() != Some(id) {
            debug!("discarding thread for {}: no longer active", id);
            return Ok(0);
        }

        let merge = merge_messages(state.active_messages(), fetched);
        let scroll_to_bottom = merge.scroll_to_bottom();
        match merge {
            MessageMerge::Unchanged => Ok(0),
            MessageMerge::Updated { messages, added } => {
                state.set_active_messages(id, messages);
                drop(state);
                self.emit(InboxEvent::MessagesUpdated {
                    conversation_id: id.clone(),
                    added,
                    scroll_to_bottom,
                });
                Ok(added)
            }
        }
    }

    // ─── Selection ───────────────────────────────────────────────────────────

    /// Make `id` the active conversation and load its thread
    pub async fn select_conversation(&self, id: &ConversationId) -> Result<usize> {
        {
            let mut state = self.state.write().await;
            if state.conversation(id).is_none() {
                return Err(InboxError::Validation(format!("unknown conversation {}", id)));
            }
            if state.active_conversation_id.as_ref() != Some(id) {
                state.active_conversation_id = Some(id.clone());
                drop(state);
                self.emit(InboxEvent::ActiveConversationChanged {
                    conversation_id: Some(id.clone()),
                });
            }
        }
        self.refresh_thread(id, RefreshMode::Loud).await
    }

    /// Back to the list (mobile)
    pub async fn clear_selection(&self) {
        let cleared = self.state.write().await.active_conversation_id.take();
        if cleared.is_some() {
            self.emit(InboxEvent::ActiveConversationChanged {
                conversation_id: None,
            });
        }
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    pub async fn send_message(&self, phone: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(InboxError::Validation("message text is empty".to_string()));
        }
        let result = self
            .bounded(self.backend.send_message(phone, text), "send message")
            .await;
        self.finish_send(phone, result).await
    }

    pub async fn send_image(
        &self,
        phone: &str,
        image: ImageUpload,
        caption: Option<&str>,
    ) -> Result<()> {
        let result = self
            .bounded(self.backend.send_image(phone, image, caption), "send image")
            .await;
        self.finish_send(phone, result).await
    }

    /// Send text to the active conversation
    pub async fn reply(&self, text: &str) -> Result<()> {
        let phone = self
            .state
            .read()
            .await
            .active_conversation()
            .map(|c| c.phone.clone())
            .ok_or_else(|| InboxError::Validation("no active conversation".to_string()))?;
        self.send_message(&phone, text).await
    }

    async fn finish_send(&self, phone: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                info!("Message sent to {}", phone);
                self.emit(InboxEvent::MessageSent {
                    phone: phone.to_string(),
                });
                let active = {
                    let state = self.state.read().await;
                    state
                        .active_conversation()
                        .filter(|c| c.phone == phone)
                        .map(|c| c.id.clone())
                };
                if let Some(id) = active {
                    self.spawn_thread_refresh(id);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Send to {} failed: {}", phone, e);
                let message = e.to_string();
                let generation = self.state.write().await.raise_send_error(message.clone());
                self.emit(InboxEvent::SendFailed { error: message });

                let inbox = self.clone();
                let ttl = self.config.send_error_ttl;
                tokio::spawn(async move {
                    sleep(ttl).await;
                    let cleared = inbox.state.write().await.clear_send_error(generation);
                    if cleared {
                        inbox.emit(InboxEvent::SendErrorCleared);
                    }
                });
                Err(e)
            }
        }
    }
}

fn unavailable_status(error: &InboxError) -> Option<InboxStatus> {
    match error {
        InboxError::NotConfigured(_) => Some(InboxStatus::NotConfigured),
        InboxError::PermissionDenied(_) => Some(InboxStatus::PermissionDenied),
        _ => None,
    }
}

/// Log every published event until the inbox is dropped. A lagging receiver
/// skips what it missed and keeps going. Returns how many events were logged.
pub async fn log_events(mut events: broadcast::Receiver<InboxEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                info!("{}", serde_json::to_string(&event).unwrap_or_default());
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}
