/// Notification emitter: a short audible cue when new inbound content arrives.
///
/// Fire-and-forget. Implementations must not block the reconciliation pass.
use crate::messenger_types::ConversationId;
use std::io::Write;
use tracing::{debug, trace};

/// Why a cue is being played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationCue {
    pub conversation_ids: Vec<ConversationId>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, cue: &NotificationCue);
}

/// Rings the terminal bell on stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Notifier for TerminalBell {
    fn notify(&self, cue: &NotificationCue) {
        debug!("New inbound content in {} conversation(s)", cue.conversation_ids.len());
        let mut stderr = std::io::stderr();
        if let Err(e) = stderr.write_all(b"\x07").and_then(|_| stderr.flush()) {
            trace!("bell failed: {}", e);
        }
    }
}

/// Drops every cue (muted inbox, tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, cue: &NotificationCue) {
        trace!("muted cue for {:?}", cue.conversation_ids);
    }
}
