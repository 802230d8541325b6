use crate::{AppState, ChatContext, ContextId, DispatchOrigin, Effect, LogEntry};

impl AppState {
    /// Hands `text` to the next context in open order, one chain at a time.
    pub(crate) fn forward_relay(&mut self, source: &ContextId, text: &str) -> Vec<Effect> {
        if !self.modes.relay_enabled || self.contexts.len() < 2 || self.relay.in_progress {
            return Vec::new();
        }
        let Some(target) = self.contexts.next_after(source) else {
            return Vec::new();
        };
        if self.contexts.get(&target).is_some_and(ChatContext::is_busy) {
            self.relay.in_progress = false;
            return Vec::new();
        }

        self.relay.in_progress = true;
        vec![Effect::ScheduleRelay {
            target,
            text: text.to_owned(),
        }]
    }

    pub(crate) fn relay_due(&mut self, target: &ContextId, text: String) -> Vec<Effect> {
        let deliverable = self.modes.relay_enabled
            && self
                .contexts
                .get(target)
                .is_some_and(|context| !context.is_busy());
        if !deliverable {
            self.relay.in_progress = false;
            return Vec::new();
        }

        let mut config = None;
        if let Some(context) = self.contexts.get_mut(target) {
            config = context.assigned_config.clone();
            context.push_entry(LogEntry::Info {
                message: "relaying the previous chat's answer".to_owned(),
            });
        }
        match self.begin_prompt(target, text, config.as_ref(), DispatchOrigin::Relay) {
            Ok(effect) => vec![effect],
            Err(err) => {
                self.relay.in_progress = false;
                self.last_error = Some(err.to_string());
                Vec::new()
            }
        }
    }

    pub(crate) fn disable_relay_below_two_contexts(&mut self) -> bool {
        if self.contexts.len() >= 2 || !self.modes.relay_enabled {
            return false;
        }
        self.modes.relay_enabled = false;
        self.relay.in_progress = false;
        true
    }
}
