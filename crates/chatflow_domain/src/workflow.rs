use crate::{
    AppState, ChatContext, ContextId, DispatchFailure, DispatchOrigin, Effect, LogEntry,
    QueuedAction, RunConfig, WorkflowLayout, WorkflowMatch,
};

/// Retries after the first delivery attempt finds the surface not ready.
pub const MAX_DELIVERY_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransitionStage {
    /// Waiting for the UI to confirm the target is visible.
    SwitchingSurface,
    Configuring,
    Delivering,
}

/// A prompt on its way into a target context.
#[derive(Clone, Debug)]
pub struct WorkflowTransition {
    pub id: u64,
    pub source: Option<ContextId>,
    pub target: ContextId,
    pub prompt: String,
    pub config: RunConfig,
    pub origin: DispatchOrigin,
    pub stage: TransitionStage,
    pub attempts: u32,
    /// Closed once the prompt has been handed to the backend.
    pub close_after_delivery: Option<ContextId>,
}

struct TransitionRequest {
    source: Option<ContextId>,
    target: ContextId,
    prompt: String,
    config: RunConfig,
    origin: DispatchOrigin,
    show: bool,
    close_after_delivery: Option<ContextId>,
}

impl AppState {
    /// Returns `None` when automation is off or nothing matched.
    pub(crate) fn evaluate_workflow(
        &mut self,
        source: &ContextId,
        text: &str,
    ) -> Option<Vec<Effect>> {
        if !self.modes.workflow_enabled {
            return None;
        }
        let found = self.patterns.find(text)?;
        Some(self.transition(source, found))
    }

    fn transition(&mut self, source: &ContextId, found: WorkflowMatch) -> Vec<Effect> {
        let config = found.rule.run_config();
        let target = match self.settings.layout {
            WorkflowLayout::Tabs => ContextId::workflow_tab(found.rule.target_context_id),
            WorkflowLayout::Windows => self.contexts.allocate_id(),
        };
        if let Some(context) = self.contexts.get_mut(source) {
            context.push_entry(LogEntry::Info {
                message: format!("workflow: {} -> {target}", found.rule.description),
            });
        }

        if self.contexts.get(&target).is_some_and(ChatContext::is_busy) {
            self.queue_on_busy(
                &target,
                QueuedAction {
                    prompt_text: found.next_prompt,
                    config,
                },
            );
            return Vec::new();
        }

        let close_after_delivery = match self.settings.layout {
            WorkflowLayout::Tabs => None,
            WorkflowLayout::Windows => Some(source.clone()),
        };
        self.launch_transition(TransitionRequest {
            source: Some(source.clone()),
            target,
            prompt: found.next_prompt,
            config,
            origin: DispatchOrigin::Workflow,
            show: true,
            close_after_delivery,
        })
    }

    /// Replays an action that was queued while `context_id` was busy.
    pub(crate) fn start_queued_transition(
        &mut self,
        context_id: ContextId,
        action: QueuedAction,
    ) -> Vec<Effect> {
        let Some(context) = self.contexts.get(&context_id) else {
            return Vec::new();
        };
        if context.is_busy() {
            // Something else grabbed the context during the settle delay.
            match context.queued_action.as_ref() {
                None => self.queue_on_busy(&context_id, action),
                Some(newer) => {
                    let message = format!(
                        "queued prompt {:?} replaced by {:?}",
                        action.prompt_text, newer.prompt_text
                    );
                    if let Some(context) = self.contexts.get_mut(&context_id) {
                        context.push_entry(LogEntry::Warning { message });
                    }
                }
            }
            return Vec::new();
        }
        self.launch_transition(TransitionRequest {
            source: None,
            target: context_id,
            prompt: action.prompt_text,
            config: action.config,
            origin: DispatchOrigin::Queued,
            show: false,
            close_after_delivery: None,
        })
    }

    fn launch_transition(&mut self, request: TransitionRequest) -> Vec<Effect> {
        let mut effects = Vec::new();
        let target = request.target;

        if !self.contexts.contains(&target) {
            let ready = !self.settings.require_surface_ack;
            self.contexts.create(target.clone()).ready = ready;
            effects.push(Effect::SurfaceOpened {
                context_id: target.clone(),
            });
        }
        if let Some(context) = self.contexts.get_mut(&target) {
            context.activity = true;
        }

        let transition_id = self.next_transition_id;
        self.next_transition_id += 1;

        let mut stage = TransitionStage::Configuring;
        if request.show && self.contexts.active() != Some(&target) {
            self.contexts.activate(&target);
            if self.settings.require_surface_ack {
                stage = TransitionStage::SwitchingSurface;
                effects.push(Effect::ShowSurface {
                    context_id: target.clone(),
                    transition_id: Some(transition_id),
                });
            } else {
                effects.push(Effect::ShowSurface {
                    context_id: target.clone(),
                    transition_id: None,
                });
            }
        }
        if stage == TransitionStage::Configuring {
            effects.push(Effect::ConfigureContext {
                transition_id,
                context_id: target.clone(),
                config: request.config.clone(),
            });
        }

        self.transitions.insert(
            transition_id,
            WorkflowTransition {
                id: transition_id,
                source: request.source,
                target,
                prompt: request.prompt,
                config: request.config,
                origin: request.origin,
                stage,
                attempts: 0,
                close_after_delivery: request.close_after_delivery,
            },
        );
        effects
    }

    pub(crate) fn surface_ready(&mut self, context_id: &ContextId) -> Vec<Effect> {
        let Some(context) = self.contexts.get_mut(context_id) else {
            return Vec::new();
        };
        context.ready = true;
        self.contexts.activate(context_id);

        let pending = self
            .transitions
            .values()
            .filter(|transition| &transition.target == context_id)
            .map(|transition| (transition.id, transition.stage))
            .collect::<Vec<_>>();

        let mut effects = Vec::new();
        for (transition_id, stage) in pending {
            match stage {
                TransitionStage::SwitchingSurface => {
                    effects.extend(self.advance_to_configuring(transition_id));
                }
                TransitionStage::Delivering => {
                    effects.extend(self.deliver_transition(transition_id));
                }
                TransitionStage::Configuring => {}
            }
        }
        effects
    }

    pub(crate) fn surface_switch_timed_out(&mut self, transition_id: u64) -> Vec<Effect> {
        let Some(transition) = self.transitions.get(&transition_id) else {
            return Vec::new();
        };
        if transition.stage != TransitionStage::SwitchingSurface {
            return Vec::new();
        }
        let target = transition.target.clone();
        if let Some(context) = self.contexts.get_mut(&target) {
            context.push_entry(LogEntry::Warning {
                message: format!("surface {target} did not confirm it is visible, continuing"),
            });
        }
        self.advance_to_configuring(transition_id)
    }

    fn advance_to_configuring(&mut self, transition_id: u64) -> Vec<Effect> {
        let Some(transition) = self.transitions.get_mut(&transition_id) else {
            return Vec::new();
        };
        transition.stage = TransitionStage::Configuring;
        vec![Effect::ConfigureContext {
            transition_id,
            context_id: transition.target.clone(),
            config: transition.config.clone(),
        }]
    }

    pub(crate) fn context_configured(
        &mut self,
        transition_id: u64,
        applied: RunConfig,
        fallbacks: Vec<crate::ConfigFallback>,
    ) -> Vec<Effect> {
        let Some(transition) = self.transitions.get_mut(&transition_id) else {
            return Vec::new();
        };
        if transition.stage != TransitionStage::Configuring {
            return Vec::new();
        }
        let Some(context) = self.contexts.get_mut(&transition.target) else {
            self.transitions.remove(&transition_id);
            return Vec::new();
        };

        for fallback in &fallbacks {
            context.push_entry(LogEntry::Warning {
                message: fallback.to_string(),
            });
        }
        let target = transition.target.clone();
        transition.config = applied.clone();
        transition.stage = TransitionStage::Delivering;
        self.contexts.assign_config(&target, applied);
        self.deliver_transition(transition_id)
    }

    pub(crate) fn context_configure_failed(
        &mut self,
        transition_id: u64,
        partial: Option<RunConfig>,
        message: &str,
    ) -> Vec<Effect> {
        let Some(transition) = self.transitions.remove(&transition_id) else {
            return Vec::new();
        };
        if let Some(partial) = partial {
            self.contexts.assign_config(&transition.target, partial);
        }
        if let Some(context) = self.contexts.get_mut(&transition.target) {
            context.activity = false;
            context.push_entry(LogEntry::Error {
                message: format!("configuration failed: {message}"),
            });
        }
        Vec::new()
    }

    pub(crate) fn deliver_transition(&mut self, transition_id: u64) -> Vec<Effect> {
        let Some(transition) = self.transitions.get_mut(&transition_id) else {
            return Vec::new();
        };
        if transition.stage != TransitionStage::Delivering {
            return Vec::new();
        }
        let target = transition.target.clone();
        let Some(context) = self.contexts.get(&target) else {
            self.transitions.remove(&transition_id);
            return Vec::new();
        };

        if context.is_busy() {
            if let Some(transition) = self.transitions.remove(&transition_id) {
                self.queue_on_busy(
                    &target,
                    QueuedAction {
                        prompt_text: transition.prompt,
                        config: transition.config,
                    },
                );
            }
            return Vec::new();
        }

        if !context.ready {
            transition.attempts += 1;
            if transition.attempts <= MAX_DELIVERY_RETRIES {
                return vec![Effect::RetryDelivery { transition_id }];
            }
            let attempts = transition.attempts;
            self.transitions.remove(&transition_id);
            if let Some(context) = self.contexts.get_mut(&target) {
                context.activity = false;
                context.push_entry(LogEntry::Error {
                    message: format!(
                        "{} after {attempts} attempts",
                        DispatchFailure::TargetNotReady
                    ),
                });
            }
            return Vec::new();
        }

        let Some(transition) = self.transitions.remove(&transition_id) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        match self.begin_prompt(
            &target,
            transition.prompt,
            Some(&transition.config),
            transition.origin,
        ) {
            Ok(effect) => effects.push(effect),
            Err(err) => self.last_error = Some(err.to_string()),
        }
        if let Some(source) = transition.close_after_delivery {
            effects.push(Effect::ScheduleAutoClose { context_id: source });
        }
        effects
    }

    /// Stores `action` on a busy context. A newer action replaces an older one.
    pub(crate) fn queue_on_busy(&mut self, target: &ContextId, action: QueuedAction) {
        let prompt_text = action.prompt_text.clone();
        let previous = match self.contexts.queue_action(target, action) {
            Ok(previous) => previous,
            Err(err) => {
                self.last_error = Some(err.to_string());
                return;
            }
        };
        let Some(context) = self.contexts.get_mut(target) else {
            return;
        };
        match previous {
            Some(previous) => context.push_entry(LogEntry::Warning {
                message: format!(
                    "queued prompt {:?} replaced by {prompt_text:?}",
                    previous.prompt_text
                ),
            }),
            None => context.push_entry(LogEntry::Info {
                message: format!("queued {prompt_text:?} until the current response completes"),
            }),
        }
    }

    pub(crate) fn drop_transitions_for(&mut self, context_id: &ContextId) {
        self.transitions
            .retain(|_, transition| &transition.target != context_id);
    }
}
