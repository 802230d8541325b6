use crate::persistence;
use crate::{
    Action, AppState, ContextId, DispatchFailure, DispatchOrigin, DispatchPlan, DispatchReply,
    Effect, LogEntry, RegistryError, RunConfig, default_run_config,
};

impl AppState {
    pub fn apply(&mut self, action: Action) -> Vec<Effect> {
        match action {
            Action::AppStarted => {
                if self.contexts.is_empty() {
                    let id = self.contexts.allocate_id();
                    self.contexts.create(id.clone());
                    self.contexts.activate(&id);
                }
                vec![Effect::LoadModes, Effect::LoadCatalog]
            }

            Action::ModesLoaded { persisted } => {
                persistence::apply_persisted_modes(self, &persisted);
                // Contexts are not restored, so a stored relay flag can
                // arrive with a single chat open.
                if self.disable_relay_below_two_contexts() {
                    vec![Effect::SaveModes]
                } else {
                    Vec::new()
                }
            }
            Action::ModesLoadFailed { message } => {
                self.last_error = Some(format!("failed to load modes: {message}"));
                Vec::new()
            }
            Action::ModesSaved => Vec::new(),
            Action::ModesSaveFailed { message } => {
                self.last_error = Some(format!("failed to save modes: {message}"));
                Vec::new()
            }

            Action::OpenContext { context_id } => {
                let id = match context_id {
                    Some(id) if self.contexts.contains(&id) => {
                        self.contexts.activate(&id);
                        return vec![Effect::ShowSurface {
                            context_id: id,
                            transition_id: None,
                        }];
                    }
                    Some(id) => id,
                    None => self.contexts.allocate_id(),
                };
                self.contexts.create(id.clone());
                self.contexts.activate(&id);
                vec![Effect::SurfaceOpened { context_id: id }]
            }
            Action::CloseContext { context_id } => self.close_context(&context_id),
            Action::AutoCloseDue { context_id } => {
                if self
                    .contexts
                    .get(&context_id)
                    .is_some_and(|context| context.is_busy())
                {
                    return Vec::new();
                }
                self.close_context(&context_id)
            }
            Action::SurfaceReady { context_id } => self.surface_ready(&context_id),

            Action::SubmitPrompt { context_id, text } => {
                if text.trim().is_empty() {
                    return Vec::new();
                }
                let Some(context) = self.contexts.get(&context_id) else {
                    self.last_error = Some(RegistryError::Missing(context_id).to_string());
                    return Vec::new();
                };
                if context.is_busy() {
                    return Vec::new();
                }
                let config = context.assigned_config.clone();
                match self.begin_prompt(&context_id, text, config.as_ref(), DispatchOrigin::User) {
                    Ok(effect) => vec![effect],
                    Err(err) => {
                        self.last_error = Some(err.to_string());
                        Vec::new()
                    }
                }
            }
            Action::ResetContext { context_id } => {
                let Some(context) = self.contexts.get_mut(&context_id) else {
                    return Vec::new();
                };
                if context.is_busy() {
                    self.last_error = Some(RegistryError::Busy(context_id).to_string());
                    return Vec::new();
                }
                context.reset_conversation();
                self.drop_transitions_for(&context_id);
                Vec::new()
            }

            Action::SetWorkflowEnabled { enabled } => {
                self.modes.workflow_enabled = enabled;
                vec![Effect::SaveModes]
            }
            Action::SetRelayEnabled { enabled } => {
                if enabled && self.contexts.len() < 2 {
                    self.last_error = Some("relay needs at least two open chats".to_owned());
                    return Vec::new();
                }
                self.modes.relay_enabled = enabled;
                if !enabled {
                    self.relay.in_progress = false;
                }
                vec![Effect::SaveModes]
            }

            Action::ReloadCatalog => vec![Effect::LoadCatalog],

            Action::DispatchLog {
                context_id,
                dispatch_id,
                data,
            } => {
                if let Some(context) = self.contexts.get_mut(&context_id)
                    && context.is_current_dispatch(dispatch_id)
                {
                    context.push_entry(LogEntry::ToolEvent { data });
                }
                Vec::new()
            }
            Action::DispatchSucceeded {
                context_id,
                dispatch_id,
                reply,
            } => self.dispatch_succeeded(context_id, dispatch_id, reply),
            Action::DispatchFailed {
                context_id,
                dispatch_id,
                failure,
            } => self.dispatch_failed(context_id, dispatch_id, failure),

            Action::SurfaceSwitchTimedOut { transition_id } => {
                self.surface_switch_timed_out(transition_id)
            }
            Action::ContextConfigured {
                transition_id,
                applied,
                fallbacks,
            } => self.context_configured(transition_id, applied, fallbacks),
            Action::ContextConfigureFailed {
                transition_id,
                partial,
                message,
            } => self.context_configure_failed(transition_id, partial, &message),
            Action::DeliverTransition { transition_id } => self.deliver_transition(transition_id),

            Action::QueuedActionDue { context_id, action } => {
                self.start_queued_transition(context_id, action)
            }
            Action::RelayDue { target, text } => self.relay_due(&target, text),
        }
    }

    /// Marks `context_id` busy and builds the request for the backend.
    pub(crate) fn begin_prompt(
        &mut self,
        context_id: &ContextId,
        prompt: String,
        config: Option<&RunConfig>,
        origin: DispatchOrigin,
    ) -> Result<Effect, RegistryError> {
        let dispatch_id = self.contexts.begin_dispatch(context_id, origin)?;
        let context = self
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| RegistryError::Missing(context_id.clone()))?;

        let default_config = default_run_config();
        let config = config.unwrap_or(&default_config);
        context.push_entry(LogEntry::UserPrompt {
            text: prompt.clone(),
        });
        Ok(Effect::StartDispatch {
            context_id: context_id.clone(),
            dispatch_id,
            plan: DispatchPlan {
                prompt,
                model_id: config.model_id.clone(),
                preset_id: config.preset_id.clone(),
                conversation_id: context.conversation_id.clone(),
            },
        })
    }

    fn dispatch_succeeded(
        &mut self,
        context_id: ContextId,
        dispatch_id: u64,
        reply: DispatchReply,
    ) -> Vec<Effect> {
        let Some(context) = self.contexts.get_mut(&context_id) else {
            return Vec::new();
        };
        let Some(finished) = context.finish_dispatch(dispatch_id) else {
            return Vec::new();
        };

        if context.conversation_id.is_none() {
            context.conversation_id = reply.conversation_id;
        }
        if reply.title.is_some() {
            context.title = reply.title;
        }
        context.active_connections = reply.active_connections;
        context.activity = false;
        context.push_entry(LogEntry::AssistantReply {
            text: reply.text.clone(),
        });

        let mut effects = Vec::new();
        if let Some(action) = context.queued_action.take() {
            effects.push(Effect::DrainQueuedAction {
                context_id: context_id.clone(),
                action,
            });
        }

        let transitioned = match self.evaluate_workflow(&context_id, &reply.text) {
            Some(transition_effects) => {
                effects.extend(transition_effects);
                true
            }
            None => false,
        };

        if finished.origin == DispatchOrigin::Relay {
            self.relay.in_progress = false;
        } else if !transitioned {
            effects.extend(self.forward_relay(&context_id, &reply.text));
        }
        effects
    }

    fn dispatch_failed(
        &mut self,
        context_id: ContextId,
        dispatch_id: u64,
        failure: DispatchFailure,
    ) -> Vec<Effect> {
        let Some(context) = self.contexts.get_mut(&context_id) else {
            return Vec::new();
        };
        let Some(finished) = context.finish_dispatch(dispatch_id) else {
            return Vec::new();
        };

        context.activity = false;
        context.push_entry(LogEntry::Error {
            message: failure.to_string(),
        });

        let mut effects = Vec::new();
        if let Some(action) = context.queued_action.take() {
            effects.push(Effect::DrainQueuedAction { context_id, action });
        }
        if finished.origin == DispatchOrigin::Relay {
            self.relay.in_progress = false;
        }
        effects
    }

    fn close_context(&mut self, context_id: &ContextId) -> Vec<Effect> {
        if !self.contexts.contains(context_id) {
            return Vec::new();
        }
        if self.contexts.len() <= 1 {
            self.last_error = Some("the last chat cannot be closed".to_owned());
            return Vec::new();
        }

        let removed = self.contexts.delete(context_id);
        self.drop_transitions_for(context_id);
        if removed
            .and_then(|context| context.active_dispatch())
            .is_some_and(|dispatch| dispatch.origin == DispatchOrigin::Relay)
        {
            self.relay.in_progress = false;
        }

        let mut effects = vec![Effect::SurfaceClosed {
            context_id: context_id.clone(),
        }];
        if self.disable_relay_below_two_contexts() {
            effects.push(Effect::SaveModes);
        }
        effects
    }
}
