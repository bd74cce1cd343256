/// Reconciliation of freshly fetched server data against held view state.
///
/// Conversation lists are replaced wholesale on every pass; the only thing
/// carried over is the cached thread of the active conversation. Message
/// threads are append-only: unseen ids are added and the list is re-sorted
/// by timestamp, so an unchanged fetch never produces a new value.
use crate::config::Presentation;
use crate::messenger_types::{ConversationId, ConversationSummary, Message, MessageId};
use crate::state::{PollState, Signature};
use std::collections::{HashMap, HashSet};

/// Outcome of one conversation-list reconciliation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationReconciliation {
    /// Held list was empty before this pass
    pub first_load: bool,
    /// New conversations plus those whose preview changed
    pub content_changes: Vec<ConversationId>,
    /// Changes carry at least one signature not seen before
    pub has_new_content: bool,
    /// Play the audible cue: new content and at least one change is contact-authored
    pub notify: bool,
    pub active_changed: bool,
    /// Active thread must be (re)fetched in the background
    pub fetch_active_messages: bool,
}

pub fn reconcile_conversations(
    state: &mut PollState,
    fetched: Vec<ConversationSummary>,
    presentation: Presentation,
) -> ConversationReconciliation {
    let first_load = state.held_conversations.is_empty();
    let held_by_id: HashMap<&ConversationId, &ConversationSummary> = state
        .held_conversations
        .iter()
        .map(|c| (&c.id, c))
        .collect();

    let changes: Vec<&ConversationSummary> = fetched
        .iter()
        .filter(|f| match held_by_id.get(&f.id) {
            None => true,
            Some(h) => h.last_message_preview != f.last_message_preview,
        })
        .collect();

    let mut has_new_content = false;
    if !changes.is_empty() && !first_load {
        let signatures: HashSet<Signature> = changes
            .iter()
            .map(|c| (c.id.clone(), c.last_message_preview.clone()))
            .collect();
        if signatures
            .iter()
            .any(|s| !state.last_processed_signatures.contains(s))
        {
            has_new_content = true;
            state.last_processed_signatures = signatures;
        }
    }

    // Never notify for the operator's own outbound messages
    let notify = has_new_content && changes.iter().any(|c| c.is_unread);
    let content_changes: Vec<ConversationId> = changes.iter().map(|c| c.id.clone()).collect();

    let previous_active = state
        .active_conversation_id
        .as_ref()
        .and_then(|id| held_by_id.get(id).copied());
    let active_preview_changed = match (previous_active, state.active_conversation_id.as_ref()) {
        (Some(prev), Some(id)) => fetched
            .iter()
            .find(|f| &f.id == id)
            .is_some_and(|f| f.last_message_preview != prev.last_message_preview),
        _ => false,
    };
    let cached_messages: Vec<Message> = previous_active
        .map(|c| c.messages.clone())
        .unwrap_or_default();

    let mut next = fetched;
    let mut active_changed = false;
    let mut fetch_active_messages = active_preview_changed;

    if let Some(id) = state.active_conversation_id.clone() {
        match next.iter_mut().find(|c| c.id == id) {
            Some(entry) => entry.messages = cached_messages,
            None => {
                state.active_conversation_id = None;
                active_changed = true;
                fetch_active_messages = false;
            }
        }
    }

    if state.active_conversation_id.is_none() && presentation == Presentation::Desktop {
        if let Some(first) = next.first() {
            state.active_conversation_id = Some(first.id.clone());
            active_changed = true;
            fetch_active_messages = true;
        }
    }

    state.held_conversations = next;

    ConversationReconciliation {
        first_load,
        content_changes,
        has_new_content,
        notify,
        active_changed,
        fetch_active_messages,
    }
}

/// Outcome of reconciling one thread
#[derive(Debug, Clone, PartialEq)]
pub enum MessageMerge {
    /// Nothing new; state must not be touched
    Unchanged,
    Updated { messages: Vec<Message>, added: usize },
}

impl MessageMerge {
    /// The view scrolls to the newest message only after messages were added
    pub fn scroll_to_bottom(&self) -> bool {
        matches!(self, MessageMerge::Updated { added, .. } if *added > 0)
    }
}

pub fn merge_messages(held: &[Message], fetched: Vec<Message>) -> MessageMerge {
    let mut seen: HashSet<MessageId> = held.iter().map(|m| m.id.clone()).collect();
    let new_messages: Vec<Message> = fetched
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();

    if new_messages.is_empty() {
        return MessageMerge::Unchanged;
    }

    let added = new_messages.len();
    let mut messages = Vec::with_capacity(held.len() + added);
    messages.extend_from_slice(held);
    messages.extend(new_messages);
    // stable: equal timestamps keep arrival order
    messages.sort_by_key(|m| m.timestamp);

    MessageMerge::Updated { messages, added }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn conv(id: &str, preview: &str, unread: bool) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            display_name: format!("Contact {}", id),
            phone: format!("55119{}", id),
            avatar_url: None,
            last_message_preview: preview.to_string(),
            last_message_time: String::new(),
            last_message_at: None,
            is_unread: unread,
            messages: Vec::new(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            text: format!("text {}", id),
            is_outbound: false,
            timestamp: at(secs),
            is_image: false,
            image_url: None,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.0.as_str()).collect()
    }

    #[test]
    fn test_first_load_never_notifies() {
        let mut state = PollState::new();
        let result = reconcile_conversations(
            &mut state,
            vec![conv("1", "hi", true)],
            Presentation::Desktop,
        );
        assert!(result.first_load);
        assert!(!result.has_new_content);
        assert!(!result.notify);
        assert_eq!(state.held_conversations.len(), 1);
        assert_eq!(state.held_conversations[0].id, ConversationId::from("1"));
    }

    #[test]
    fn test_new_unread_conversation_notifies() {
        let mut state = PollState::new();
        reconcile_conversations(&mut state, vec![conv("1", "hi", false)], Presentation::Mobile);

        let result = reconcile_conversations(
            &mut state,
            vec![conv("1", "hi", false), conv("2", "new", true)],
            Presentation::Mobile,
        );
        assert!(result.has_new_content);
        assert!(result.notify);
        assert_eq!(result.content_changes, vec![ConversationId::from("2")]);
        assert_eq!(state.held_conversations.len(), 2);
        assert!(state
            .last_processed_signatures
            .contains(&(ConversationId::from("2"), "new".to_string())));
    }

    #[test]
    fn test_unchanged_list_is_idempotent() {
        let mut state = PollState::new();
        let list = vec![conv("1", "hi", true), conv("2", "yo", true)];
        reconcile_conversations(&mut state, list.clone(), Presentation::Desktop);
        reconcile_conversations(
            &mut state,
            vec![conv("1", "hi", true), conv("2", "again", true)],
            Presentation::Desktop,
        );
        let held = state.held_conversations.clone();
        let signatures = state.last_processed_signatures.clone();

        let updated = vec![conv("1", "hi", true), conv("2", "again", true)];
        let result = reconcile_conversations(&mut state, updated, Presentation::Desktop);
        assert!(result.content_changes.is_empty());
        assert!(!result.has_new_content);
        assert!(!result.notify);
        assert!(!result.fetch_active_messages);
        assert_eq!(state.held_conversations, held);
        assert_eq!(state.last_processed_signatures, signatures);
    }

    #[test]
    fn test_self_sent_change_does_not_notify() {
        let mut state = PollState::new();
        reconcile_conversations(&mut state, vec![conv("1", "hi", true)], Presentation::Mobile);

        // operator replied: preview changes but the last message is ours
        let result = reconcile_conversations(
            &mut state,
            vec![conv("1", "thanks, on it", false)],
            Presentation::Mobile,
        );
        assert!(result.has_new_content);
        assert!(!result.notify);
    }

    #[test]
    fn test_already_processed_signature_is_not_new_content() {
        let mut state = PollState::new();
        reconcile_conversations(&mut state, vec![conv("1", "a", true)], Presentation::Mobile);
        let result =
            reconcile_conversations(&mut state, vec![conv("1", "b", true)], Presentation::Mobile);
        assert!(result.notify);

        // held list dropped and re-added the same preview: same signature
        state.held_conversations = vec![conv("1", "a", true)];
        let result =
            reconcile_conversations(&mut state, vec![conv("1", "b", true)], Presentation::Mobile);
        assert_eq!(result.content_changes.len(), 1);
        assert!(!result.has_new_content);
        assert!(!result.notify);
    }

    #[test]
    fn test_desktop_auto_selects_first_conversation() {
        let mut state = PollState::new();
        let result = reconcile_conversations(
            &mut state,
            vec![conv("7", "x", false), conv("8", "y", false)],
            Presentation::Desktop,
        );
        assert!(result.active_changed);
        assert!(result.fetch_active_messages);
        assert_eq!(state.active_conversation_id, Some(ConversationId::from("7")));
    }

    #[test]
    fn test_mobile_waits_for_explicit_selection() {
        let mut state = PollState::new();
        let result =
            reconcile_conversations(&mut state, vec![conv("7", "x", false)], Presentation::Mobile);
        assert!(!result.active_changed);
        assert!(!result.fetch_active_messages);
        assert!(state.active_conversation_id.is_none());
    }

    #[test]
    fn test_active_messages_survive_full_replace() {
        let mut state = PollState::new();
        reconcile_conversations(
            &mut state,
            vec![conv("5", "hi", true), conv("6", "yo", true)],
            Presentation::Desktop,
        );
        let active = ConversationId::from("5");
        assert!(state.set_active_messages(&active, vec![msg("101", 1)]));

        let result = reconcile_conversations(
            &mut state,
            vec![conv("6", "yo", true), conv("5", "hi", true)],
            Presentation::Desktop,
        );
        assert!(!result.fetch_active_messages);
        assert_eq!(ids(state.active_messages()), vec!["101"]);
        // matched by id, not position
        assert_eq!(state.held_conversations[0].id, ConversationId::from("6"));
        assert!(state.held_conversations[0].messages.is_empty());
    }

    #[test]
    fn test_active_preview_change_requests_thread_refresh() {
        let mut state = PollState::new();
        reconcile_conversations(&mut state, vec![conv("5", "hi", true)], Presentation::Desktop);
        let result = reconcile_conversations(
            &mut state,
            vec![conv("5", "are you there?", true)],
            Presentation::Desktop,
        );
        assert!(!result.active_changed);
        assert!(result.fetch_active_messages);
    }

    #[test]
    fn test_empty_fetch_clears_list_and_selection() {
        let mut state = PollState::new();
        reconcile_conversations(&mut state, vec![conv("1", "hi", true)], Presentation::Desktop);
        let result = reconcile_conversations(&mut state, Vec::new(), Presentation::Desktop);
        assert!(state.held_conversations.is_empty());
        assert!(state.active_conversation_id.is_none());
        assert!(result.active_changed);
        assert!(!result.notify);
    }

    #[test]
    fn test_vanished_active_conversation_is_deselected() {
        let mut state = PollState::new();
        reconcile_conversations(
            &mut state,
            vec![conv("1", "a", false), conv("2", "b", false)],
            Presentation::Mobile,
        );
        state.active_conversation_id = Some(ConversationId::from("1"));
        reconcile_conversations(&mut state, vec![conv("2", "b", false)], Presentation::Mobile);
        assert!(state.active_conversation_id.is_none());

        let mut desktop = PollState::new();
        reconcile_conversations(
            &mut desktop,
            vec![conv("1", "a", false), conv("2", "b", false)],
            Presentation::Desktop,
        );
        reconcile_conversations(&mut desktop, vec![conv("2", "b", false)], Presentation::Desktop);
        assert_eq!(desktop.active_conversation_id, Some(ConversationId::from("2")));
    }

    #[test]
    fn test_initial_thread_load_is_sorted_and_unique() {
        let merged = merge_messages(&[], vec![msg("b", 5), msg("a", 1), msg("b", 5)]);
        match &merged {
            MessageMerge::Updated { messages, added } => {
                assert_eq!(ids(messages), vec!["a", "b"]);
                assert_eq!(*added, 2);
            }
            MessageMerge::Unchanged => panic!("expected an update"),
        }
        assert!(merged.scroll_to_bottom());
        assert_eq!(merge_messages(&[], Vec::new()), MessageMerge::Unchanged);
    }

    #[test]
    fn test_append_only_unseen_messages() {
        let held = vec![msg("101", 10)];
        let merged = merge_messages(&held, vec![msg("101", 10), msg("102", 20)]);
        match &merged {
            MessageMerge::Updated { messages, added } => {
                assert_eq!(ids(messages), vec!["101", "102"]);
                assert_eq!(*added, 1);
            }
            MessageMerge::Unchanged => panic!("expected an update"),
        }
        assert!(merged.scroll_to_bottom());
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let held = vec![msg("1", 10), msg("3", 30)];
        let merged = merge_messages(&held, vec![msg("4", 40), msg("2", 20), msg("3", 30)]);
        let MessageMerge::Updated { messages, .. } = merged else {
            panic!("expected an update");
        };
        assert_eq!(ids(&messages), vec!["1", "2", "3", "4"]);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_unchanged_fetch_is_a_no_op() {
        let held = vec![msg("1", 10), msg("2", 20)];
        let merged = merge_messages(&held, held.clone());
        assert_eq!(merged, MessageMerge::Unchanged);
        assert!(!merged.scroll_to_bottom());
    }

    #[test]
    fn test_overlapping_fetch_sequences_never_duplicate() {
        let mut held: Vec<Message> = Vec::new();
        let fetches = vec![
            vec![msg("1", 1), msg("2", 2)],
            vec![msg("2", 2), msg("3", 3)],
            vec![msg("1", 1), msg("3", 3), msg("4", 4), msg("4", 4)],
            vec![msg("0", 0)],
        ];
        for fetched in fetches {
            if let MessageMerge::Updated { messages, .. } = merge_messages(&held, fetched) {
                held = messages;
            }
        }
        assert_eq!(ids(&held), vec!["0", "1", "2", "3", "4"]);
        let unique: HashSet<_> = held.iter().map(|m| m.id.clone()).collect();
        assert_eq!(unique.len(), held.len());
    }
}
