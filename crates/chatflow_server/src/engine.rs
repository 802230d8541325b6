use crate::backend::{ChatBackend, DispatchStream};
use crate::catalog::Catalog;
use crate::configurator::{ConfigureError, configure};
use crate::mode_store::ModeStore;
use anyhow::Context as _;
use chatflow_api::{
    AppSnapshot, ContextSnapshot, DispatchRequest, DispatchStreamEvent, ModelInfo, PresetCatalog,
    WsServerMessage,
};
use chatflow_domain::{
    Action, AppState, ChatContext, ContextId, DispatchFailure, DispatchPlan, DispatchReply, Effect,
    EngineSettings, LogEntry, QueuedAction, RunConfig, WorkflowLayout,
};
use futures::StreamExt as _;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Clone, Copy, Debug)]
pub struct EngineTimings {
    pub configure_timeout: Duration,
    pub surface_switch_timeout: Duration,
    pub delivery_backoff: Duration,
    pub queue_settle_delay: Duration,
    pub relay_delay: Duration,
    pub window_close_delay: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            configure_timeout: Duration::from_secs(5),
            surface_switch_timeout: Duration::from_secs(2),
            delivery_backoff: Duration::from_millis(500),
            queue_settle_delay: Duration::from_millis(500),
            relay_delay: Duration::from_secs(1),
            window_close_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn current_rev(&self) -> anyhow::Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::GetRev { reply: tx })
            .await
            .context("engine unavailable")?;
        rx.await.context("engine stopped")?
    }

    pub async fn app_snapshot(&self) -> anyhow::Result<AppSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::GetAppSnapshot { reply: tx })
            .await
            .context("engine unavailable")?;
        rx.await.context("engine stopped")?
    }

    pub async fn context_snapshot(
        &self,
        context_id: chatflow_api::ContextId,
    ) -> anyhow::Result<ContextSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::GetContextSnapshot {
                context_id,
                reply: tx,
            })
            .await
            .context("engine unavailable")?;
        rx.await.context("engine stopped")?
    }

    pub async fn apply_client_action(
        &self,
        action: chatflow_api::ClientAction,
    ) -> Result<u64, String> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(EngineCommand::ApplyClientAction { action, reply: tx })
            .await
            .is_err()
        {
            return Err("engine unavailable".to_owned());
        }
        rx.await
            .unwrap_or_else(|_| Err("engine stopped".to_owned()))
    }
}

pub enum EngineCommand {
    GetRev {
        reply: oneshot::Sender<anyhow::Result<u64>>,
    },
    GetAppSnapshot {
        reply: oneshot::Sender<anyhow::Result<AppSnapshot>>,
    },
    GetContextSnapshot {
        context_id: chatflow_api::ContextId,
        reply: oneshot::Sender<anyhow::Result<ContextSnapshot>>,
    },
    ApplyClientAction {
        action: chatflow_api::ClientAction,
        reply: oneshot::Sender<Result<u64, String>>,
    },
    DispatchAction {
        action: Box<Action>,
    },
    ModelsLoaded {
        result: Result<Vec<ModelInfo>, String>,
    },
    PresetsLoaded {
        result: Result<PresetCatalog, String>,
    },
}

pub struct EngineConfig {
    pub backend: Arc<dyn ChatBackend>,
    pub mode_store: ModeStore,
    pub settings: EngineSettings,
    pub timings: EngineTimings,
}

/// Everything a client renders for one context, used to detect changes.
#[derive(Clone, Debug, PartialEq)]
struct ContextDigest {
    entries: usize,
    last_entry: Option<LogEntry>,
    busy: bool,
    activity: bool,
    ready: bool,
    queued_action: Option<QueuedAction>,
    assigned_config: Option<RunConfig>,
    conversation_id: Option<String>,
    title: Option<String>,
    active_connections: Vec<String>,
}

impl ContextDigest {
    fn of(context: &ChatContext) -> Self {
        Self {
            entries: context.entries.len(),
            last_entry: context.entries.last().cloned(),
            busy: context.is_busy(),
            activity: context.activity,
            ready: context.ready,
            queued_action: context.queued_action.clone(),
            assigned_config: context.assigned_config.clone(),
            conversation_id: context.conversation_id.clone(),
            title: context.title.clone(),
            active_connections: context.active_connections.clone(),
        }
    }
}

pub struct Engine {
    state: AppState,
    rev: u64,
    backend: Arc<dyn ChatBackend>,
    mode_store: ModeStore,
    timings: EngineTimings,
    catalog: watch::Sender<Catalog>,
    events: broadcast::Sender<WsServerMessage>,
    tx: mpsc::Sender<EngineCommand>,
}

impl Engine {
    pub fn start(config: EngineConfig) -> (EngineHandle, broadcast::Sender<WsServerMessage>) {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(256);
        let (events, _) = broadcast::channel::<WsServerMessage>(256);
        let (catalog, _) = watch::channel(Catalog::default());

        let mut engine = Self {
            state: AppState::with_settings(config.settings),
            rev: 0,
            backend: config.backend,
            mode_store: config.mode_store,
            timings: config.timings,
            catalog,
            events: events.clone(),
            tx: tx.clone(),
        };

        tokio::spawn(async move {
            engine.bootstrap().await;
            while let Some(cmd) = rx.recv().await {
                engine.handle(cmd).await;
            }
        });

        (EngineHandle { tx }, events)
    }

    async fn bootstrap(&mut self) {
        self.process_action_queue(Action::AppStarted).await;
    }

    async fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::GetRev { reply } => {
                let _ = reply.send(Ok(self.rev));
            }
            EngineCommand::GetAppSnapshot { reply } => {
                let _ = reply.send(Ok(self.app_snapshot()));
            }
            EngineCommand::GetContextSnapshot { context_id, reply } => {
                let snapshot = self
                    .context_snapshot(&ContextId::new(context_id.0.clone()))
                    .with_context(|| format!("chat context {context_id} not found"));
                let _ = reply.send(snapshot);
            }
            EngineCommand::ApplyClientAction { action, reply } => {
                let action = map_client_action(action);
                self.process_action_queue(action).await;
                let _ = reply.send(Ok(self.rev));
            }
            EngineCommand::DispatchAction { action } => {
                self.process_action_queue(*action).await;
            }
            EngineCommand::ModelsLoaded { result } => match result {
                Ok(models) => {
                    tracing::info!(count = models.len(), "models loaded");
                    self.catalog
                        .send_modify(|catalog| catalog.models = Some(models));
                    self.bump_and_publish_app();
                }
                Err(message) => self.report_catalog_error("models", &message),
            },
            EngineCommand::PresetsLoaded { result } => match result {
                Ok(presets) => {
                    tracing::info!(count = presets.len(), "presets loaded");
                    self.catalog
                        .send_modify(|catalog| catalog.presets = Some(presets));
                    self.bump_and_publish_app();
                }
                Err(message) => self.report_catalog_error("presets", &message),
            },
        }
    }

    fn report_catalog_error(&self, what: &str, message: &str) {
        tracing::error!(error = %message, "failed to load {what}");
        self.publish_event(chatflow_api::ServerEvent::Toast {
            message: format!("Failed to load {what}: {message}"),
        });
    }

    fn bump_and_publish_app(&mut self) {
        self.rev = self.rev.saturating_add(1);
        self.publish_app_snapshot();
    }

    async fn process_action_queue(&mut self, initial: Action) {
        let mut actions = VecDeque::from([initial]);
        let mut effects = VecDeque::<Effect>::new();

        while let Some(action) = actions.pop_front() {
            self.rev = self.rev.saturating_add(1);

            let log_context = match &action {
                Action::DispatchLog { context_id, .. } => Some(context_id.clone()),
                _ => None,
            };
            let before = self.context_digests();
            let previous_error = self.state.last_error.clone();

            let new_effects = self.state.apply(action);

            self.publish_app_snapshot();
            self.publish_context_changes(&before, log_context.as_ref());
            if self.state.last_error != previous_error
                && let Some(message) = self.state.last_error.clone()
            {
                self.publish_event(chatflow_api::ServerEvent::Toast { message });
            }

            effects.extend(new_effects);

            while let Some(effect) = effects.pop_front() {
                match self.run_effect(effect).await {
                    Ok(mut followups) => actions.append(&mut followups),
                    Err(err) => {
                        tracing::error!(error = %err, "effect failed");
                    }
                }
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> anyhow::Result<VecDeque<Action>> {
        match effect {
            Effect::LoadModes => {
                let action = match self.mode_store.load().await {
                    Ok(persisted) => Action::ModesLoaded { persisted },
                    Err(err) => {
                        tracing::warn!(error = %format!("{err:#}"), "failed to load modes");
                        Action::ModesLoadFailed {
                            message: format!("{err:#}"),
                        }
                    }
                };
                Ok(VecDeque::from([action]))
            }
            Effect::SaveModes => {
                let persisted = self.state.to_persisted_modes();
                let action = match self.mode_store.save(&persisted).await {
                    Ok(()) => Action::ModesSaved,
                    Err(err) => Action::ModesSaveFailed {
                        message: format!("{err:#}"),
                    },
                };
                Ok(VecDeque::from([action]))
            }
            Effect::LoadCatalog => {
                self.load_catalog();
                Ok(VecDeque::new())
            }
            Effect::StartDispatch {
                context_id,
                dispatch_id,
                plan,
            } => {
                tracing::debug!(
                    context_id = %context_id,
                    dispatch_id,
                    model = %plan.model_id,
                    "starting dispatch"
                );
                let backend = self.backend.clone();
                let tx = self.tx.clone();
                tokio::spawn(run_dispatch(backend, tx, context_id, dispatch_id, plan));
                Ok(VecDeque::new())
            }
            Effect::ShowSurface {
                context_id,
                transition_id,
            } => {
                self.publish_event(chatflow_api::ServerEvent::ActivateSurface {
                    context_id: map_context_id(&context_id),
                });
                if let Some(transition_id) = transition_id {
                    self.send_later(
                        self.timings.surface_switch_timeout,
                        Action::SurfaceSwitchTimedOut { transition_id },
                    );
                }
                Ok(VecDeque::new())
            }
            Effect::ConfigureContext {
                transition_id,
                context_id,
                config,
            } => {
                let catalog = self.catalog.subscribe();
                let timeout = self.timings.configure_timeout;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let action = match configure(catalog, &config, timeout).await {
                        Ok(resolved) => Action::ContextConfigured {
                            transition_id,
                            applied: resolved.config,
                            fallbacks: resolved.fallbacks,
                        },
                        Err(err) => {
                            tracing::warn!(context_id = %context_id, error = %err, "configuration failed");
                            let partial = match err {
                                ConfigureError::Timeout { ref partial } => partial.clone(),
                                ConfigureError::CatalogClosed => None,
                            };
                            Action::ContextConfigureFailed {
                                transition_id,
                                partial,
                                message: err.to_string(),
                            }
                        }
                    };
                    let _ = tx
                        .send(EngineCommand::DispatchAction {
                            action: Box::new(action),
                        })
                        .await;
                });
                Ok(VecDeque::new())
            }
            Effect::RetryDelivery { transition_id } => {
                self.send_later(
                    self.timings.delivery_backoff,
                    Action::DeliverTransition { transition_id },
                );
                Ok(VecDeque::new())
            }
            Effect::DrainQueuedAction { context_id, action } => {
                self.send_later(
                    self.timings.queue_settle_delay,
                    Action::QueuedActionDue { context_id, action },
                );
                Ok(VecDeque::new())
            }
            Effect::ScheduleRelay { target, text } => {
                self.send_later(self.timings.relay_delay, Action::RelayDue { target, text });
                Ok(VecDeque::new())
            }
            Effect::ScheduleAutoClose { context_id } => {
                self.send_later(
                    self.timings.window_close_delay,
                    Action::AutoCloseDue { context_id },
                );
                Ok(VecDeque::new())
            }
            Effect::SurfaceOpened { context_id } => {
                self.publish_event(chatflow_api::ServerEvent::SurfaceOpened {
                    context_id: map_context_id(&context_id),
                });
                Ok(VecDeque::new())
            }
            Effect::SurfaceClosed { context_id } => {
                self.publish_event(chatflow_api::ServerEvent::SurfaceClosed {
                    context_id: map_context_id(&context_id),
                });
                Ok(VecDeque::new())
            }
        }
    }

    fn load_catalog(&self) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = backend
                .list_models()
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(EngineCommand::ModelsLoaded { result }).await;
        });

        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = backend
                .list_presets()
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(EngineCommand::PresetsLoaded { result }).await;
        });
    }

    fn send_later(&self, delay: Duration, action: Action) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(EngineCommand::DispatchAction {
                    action: Box::new(action),
                })
                .await;
        });
    }

    fn context_digests(&self) -> HashMap<ContextId, ContextDigest> {
        self.state
            .contexts
            .iter()
            .map(|context| (context.id.clone(), ContextDigest::of(context)))
            .collect()
    }

    fn publish_context_changes(
        &self,
        before: &HashMap<ContextId, ContextDigest>,
        log_context: Option<&ContextId>,
    ) {
        for context in self.state.contexts.iter() {
            let digest = ContextDigest::of(context);
            let previous = before.get(&context.id);
            if previous == Some(&digest) {
                continue;
            }

            let appended_only = log_context == Some(&context.id)
                && previous.is_some_and(|previous| previous.entries + 1 == digest.entries);
            if appended_only && let Some(entry) = context.entries.last() {
                self.publish_event(chatflow_api::ServerEvent::LogAppended {
                    context_id: map_context_id(&context.id),
                    entry: map_log_entry(entry),
                });
                continue;
            }

            if let Some(snapshot) = self.context_snapshot(&context.id) {
                self.publish_event(chatflow_api::ServerEvent::ContextChanged {
                    snapshot: Box::new(snapshot),
                });
            }
        }
    }

    fn publish_event(&self, event: chatflow_api::ServerEvent) {
        let _ = self.events.send(WsServerMessage::Event {
            rev: self.rev,
            event: Box::new(event),
        });
    }

    fn publish_app_snapshot(&self) {
        self.publish_event(chatflow_api::ServerEvent::AppChanged {
            snapshot: Box::new(self.app_snapshot()),
        });
    }

    fn app_snapshot(&self) -> AppSnapshot {
        let catalog = self.catalog.borrow();
        AppSnapshot {
            rev: self.rev,
            workflow_enabled: self.state.modes.workflow_enabled,
            relay_enabled: self.state.modes.relay_enabled,
            layout: match self.state.settings.layout {
                WorkflowLayout::Tabs => chatflow_api::WorkflowLayout::Tabs,
                WorkflowLayout::Windows => chatflow_api::WorkflowLayout::Windows,
            },
            active_context_id: self.state.contexts.active().map(map_context_id),
            contexts: self
                .state
                .contexts
                .iter()
                .map(|context| chatflow_api::ContextSummarySnapshot {
                    context_id: map_context_id(&context.id),
                    title: context.title.clone(),
                    busy: context.is_busy(),
                    activity: context.activity,
                    has_queued_action: context.queued_action.is_some(),
                })
                .collect(),
            models: catalog.model_list(),
            presets: catalog.preset_list(),
            last_error: self.state.last_error.clone(),
        }
    }

    fn context_snapshot(&self, context_id: &ContextId) -> Option<ContextSnapshot> {
        let context = self.state.context(context_id)?;
        Some(ContextSnapshot {
            rev: self.rev,
            context_id: map_context_id(&context.id),
            conversation_id: context.conversation_id.clone(),
            title: context.title.clone(),
            busy: context.is_busy(),
            activity: context.activity,
            ready: context.ready,
            assigned_config: context.assigned_config.as_ref().map(map_run_config),
            queued_action: context.queued_action.as_ref().map(|queued| {
                chatflow_api::QueuedActionSnapshot {
                    prompt_text: queued.prompt_text.clone(),
                    config: map_run_config(&queued.config),
                }
            }),
            active_connections: context.active_connections.clone(),
            entries: context.entries.iter().map(map_log_entry).collect(),
        })
    }
}

async fn run_dispatch(
    backend: Arc<dyn ChatBackend>,
    tx: mpsc::Sender<EngineCommand>,
    context_id: ContextId,
    dispatch_id: u64,
    plan: DispatchPlan,
) {
    let request = DispatchRequest {
        prompt: plan.prompt,
        model: plan.model_id,
        preset: plan.preset_id,
        conversation_id: plan.conversation_id,
    };

    let terminal = match backend.dispatch(request).await {
        Ok(stream) => forward_stream(stream, &tx, &context_id, dispatch_id).await,
        Err(err) => Err(DispatchFailure::Transport(format!("{err:#}"))),
    };

    let action = match terminal {
        Ok(reply) => Action::DispatchSucceeded {
            context_id,
            dispatch_id,
            reply,
        },
        Err(failure) => {
            tracing::warn!(context_id = %context_id, dispatch_id, error = %failure, "dispatch failed");
            Action::DispatchFailed {
                context_id,
                dispatch_id,
                failure,
            }
        }
    };
    let _ = tx
        .send(EngineCommand::DispatchAction {
            action: Box::new(action),
        })
        .await;
}

/// Relays log frames in arrival order and returns the terminal outcome.
async fn forward_stream(
    mut stream: DispatchStream,
    tx: &mpsc::Sender<EngineCommand>,
    context_id: &ContextId,
    dispatch_id: u64,
) -> Result<DispatchReply, DispatchFailure> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(DispatchFailure::from)? {
            DispatchStreamEvent::Log { data } => {
                let _ = tx
                    .send(EngineCommand::DispatchAction {
                        action: Box::new(Action::DispatchLog {
                            context_id: context_id.clone(),
                            dispatch_id,
                            data,
                        }),
                    })
                    .await;
            }
            DispatchStreamEvent::Done {
                response,
                conversation_id,
                title,
                active_connections,
            } => {
                return Ok(DispatchReply {
                    text: response,
                    conversation_id: Some(conversation_id).filter(|id| !id.is_empty()),
                    title,
                    active_connections,
                });
            }
            DispatchStreamEvent::Error { message } => {
                return Err(DispatchFailure::Backend(message));
            }
        }
    }
    Err(DispatchFailure::Transport(
        "stream ended without a terminal event".to_owned(),
    ))
}

fn map_client_action(action: chatflow_api::ClientAction) -> Action {
    use chatflow_api::ClientAction;
    match action {
        ClientAction::SubmitPrompt { context_id, text } => Action::SubmitPrompt {
            context_id: ContextId::new(context_id.0),
            text,
        },
        ClientAction::ResetContext { context_id } => Action::ResetContext {
            context_id: ContextId::new(context_id.0),
        },
        ClientAction::OpenContext { context_id } => Action::OpenContext {
            context_id: context_id.map(|id| ContextId::new(id.0)),
        },
        ClientAction::CloseContext { context_id } => Action::CloseContext {
            context_id: ContextId::new(context_id.0),
        },
        ClientAction::SurfaceReady { context_id } => Action::SurfaceReady {
            context_id: ContextId::new(context_id.0),
        },
        ClientAction::SetWorkflowEnabled { enabled } => Action::SetWorkflowEnabled { enabled },
        ClientAction::SetRelayEnabled { enabled } => Action::SetRelayEnabled { enabled },
        ClientAction::ReloadCatalog => Action::ReloadCatalog,
    }
}

fn map_context_id(id: &ContextId) -> chatflow_api::ContextId {
    chatflow_api::ContextId(id.as_str().to_owned())
}

fn map_run_config(config: &RunConfig) -> chatflow_api::RunConfigSnapshot {
    chatflow_api::RunConfigSnapshot {
        model_id: config.model_id.clone(),
        preset_id: config.preset_id.clone(),
        description: config.description.clone(),
        target_context_id: config.target_context_id.clone(),
    }
}

fn map_log_entry(entry: &LogEntry) -> chatflow_api::LogEntrySnapshot {
    use chatflow_api::LogEntrySnapshot;
    match entry {
        LogEntry::UserPrompt { text } => LogEntrySnapshot::UserPrompt { text: text.clone() },
        LogEntry::AssistantReply { text } => LogEntrySnapshot::AssistantReply { text: text.clone() },
        LogEntry::ToolEvent { data } => LogEntrySnapshot::ToolEvent { data: data.clone() },
        LogEntry::Info { message } => LogEntrySnapshot::Info {
            message: message.clone(),
        },
        LogEntry::Warning { message } => LogEntrySnapshot::Warning {
            message: message.clone(),
        },
        LogEntry::Error { message } => LogEntrySnapshot::Error {
            message: message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_api::{ClientAction, LogEntrySnapshot, PresetInfo};
    use chatflow_domain::FALLBACK_MODEL_ID;
    use futures::StreamExt as _;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedBackend {
        models: Vec<String>,
        presets: Vec<String>,
        catalog_unavailable: bool,
        scripts: Mutex<HashMap<String, Vec<Result<DispatchStreamEvent, crate::backend::StreamError>>>>,
        requests: Mutex<Vec<DispatchRequest>>,
    }

    impl ScriptedBackend {
        fn with_catalog(models: &[&str], presets: &[&str]) -> Self {
            Self {
                models: models.iter().map(|m| (*m).to_owned()).collect(),
                presets: presets.iter().map(|p| (*p).to_owned()).collect(),
                ..Self::default()
            }
        }

        fn script(
            &self,
            prompt: &str,
            frames: Vec<Result<DispatchStreamEvent, crate::backend::StreamError>>,
        ) {
            self.scripts
                .lock()
                .expect("scripts lock")
                .insert(prompt.to_owned(), frames);
        }

        fn requests(&self) -> Vec<DispatchRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    fn done(text: &str) -> Result<DispatchStreamEvent, crate::backend::StreamError> {
        Ok(DispatchStreamEvent::Done {
            response: text.to_owned(),
            conversation_id: "conv-1".to_owned(),
            title: None,
            active_connections: Vec::new(),
        })
    }

    impl ChatBackend for ScriptedBackend {
        fn list_models(&self) -> BoxFuture<'_, anyhow::Result<Vec<ModelInfo>>> {
            Box::pin(async move {
                if self.catalog_unavailable {
                    anyhow::bail!("backend offline");
                }
                Ok(self
                    .models
                    .iter()
                    .map(|id| ModelInfo {
                        id: id.clone(),
                        name: id.clone(),
                        description: String::new(),
                    })
                    .collect())
            })
        }

        fn list_presets(&self) -> BoxFuture<'_, anyhow::Result<PresetCatalog>> {
            Box::pin(async move {
                if self.catalog_unavailable {
                    anyhow::bail!("backend offline");
                }
                Ok(self
                    .presets
                    .iter()
                    .map(|key| {
                        (
                            key.clone(),
                            PresetInfo {
                                id: key.clone(),
                                name: key.clone(),
                                description: String::new(),
                                temperature: None,
                            },
                        )
                    })
                    .collect())
            })
        }

        fn dispatch(
            &self,
            request: DispatchRequest,
        ) -> BoxFuture<'_, anyhow::Result<DispatchStream>> {
            Box::pin(async move {
                let frames = self
                    .scripts
                    .lock()
                    .expect("scripts lock")
                    .remove(&request.prompt)
                    .unwrap_or_else(|| vec![done("ok")]);
                self.requests.lock().expect("requests lock").push(request);
                Ok(futures::stream::iter(frames).boxed())
            })
        }
    }

    fn start(
        backend: Arc<ScriptedBackend>,
        settings: EngineSettings,
    ) -> (EngineHandle, broadcast::Sender<WsServerMessage>) {
        Engine::start(EngineConfig {
            backend,
            mode_store: ModeStore::default(),
            settings,
            timings: EngineTimings::default(),
        })
    }

    fn tabs_without_ack() -> EngineSettings {
        EngineSettings {
            layout: WorkflowLayout::Tabs,
            require_surface_ack: false,
        }
    }

    fn api_id(raw: &str) -> chatflow_api::ContextId {
        chatflow_api::ContextId(raw.to_owned())
    }

    async fn submit(handle: &EngineHandle, context_id: &str, text: &str) {
        handle
            .apply_client_action(ClientAction::SubmitPrompt {
                context_id: api_id(context_id),
                text: text.to_owned(),
            })
            .await
            .expect("submit");
    }

    /// Polls until `pred` holds. Time is paused, so sleeping only lets
    /// spawned tasks and timers make progress.
    async fn wait_for_context(
        handle: &EngineHandle,
        context_id: &str,
        pred: impl Fn(&ContextSnapshot) -> bool,
    ) -> ContextSnapshot {
        for _ in 0..400 {
            if let Ok(snapshot) = handle.context_snapshot(api_id(context_id)).await
                && pred(&snapshot)
            {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("context {context_id} never reached the expected state");
    }

    fn has_reply(snapshot: &ContextSnapshot, text: &str) -> bool {
        snapshot.entries.iter().any(
            |entry| matches!(entry, LogEntrySnapshot::AssistantReply { text: t } if t == text),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_round_trip_records_tool_events_and_conversation() {
        let backend = Arc::new(ScriptedBackend::with_catalog(&[FALLBACK_MODEL_ID], &[]));
        backend.script(
            "hallo",
            vec![
                Ok(DispatchStreamEvent::Log {
                    data: serde_json::json!({ "tool": "github", "step": 1 }),
                }),
                Ok(DispatchStreamEvent::Log {
                    data: serde_json::json!({ "tool": "github", "step": 2 }),
                }),
                Ok(DispatchStreamEvent::Done {
                    response: "hoi".to_owned(),
                    conversation_id: "conv-9".to_owned(),
                    title: Some("Begroeting".to_owned()),
                    active_connections: vec!["github".to_owned()],
                }),
            ],
        );
        let (handle, _events) = start(backend.clone(), tabs_without_ack());

        submit(&handle, "chat-1", "hallo").await;
        let snapshot = wait_for_context(&handle, "chat-1", |s| !s.busy && has_reply(s, "hoi")).await;

        assert_eq!(snapshot.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(snapshot.title.as_deref(), Some("Begroeting"));
        let steps = snapshot
            .entries
            .iter()
            .filter_map(|entry| match entry {
                LogEntrySnapshot::ToolEvent { data } => data.get("step").and_then(|v| v.as_u64()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(steps, vec![1, 2]);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].conversation_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_without_terminal_event_is_a_transport_error() {
        let backend = Arc::new(ScriptedBackend::with_catalog(&[FALLBACK_MODEL_ID], &[]));
        backend.script(
            "hallo",
            vec![Ok(DispatchStreamEvent::Log {
                data: serde_json::json!({}),
            })],
        );
        let (handle, _events) = start(backend, tabs_without_ack());

        submit(&handle, "chat-1", "hallo").await;
        let snapshot = wait_for_context(&handle, "chat-1", |s| {
            !s.busy
                && s.entries.iter().any(|entry| {
                    matches!(entry, LogEntrySnapshot::Error { message } if message.contains("terminal"))
                })
        })
        .await;
        assert_eq!(snapshot.conversation_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_marker_drives_prompt_into_workflow_tab() {
        let backend = Arc::new(ScriptedBackend::with_catalog(
            &["claude-3-7-sonnet-20250219", FALLBACK_MODEL_ID],
            &["developer", "default"],
        ));
        backend.script(
            "maak een issue",
            vec![done("Ik heb issue 42 aangemaakt voor Repo Acme/widgets")],
        );
        let (handle, _events) = start(backend.clone(), tabs_without_ack());
        handle
            .apply_client_action(ClientAction::SetWorkflowEnabled { enabled: true })
            .await
            .expect("enable workflow");

        submit(&handle, "chat-1", "maak een issue").await;
        let tab = wait_for_context(&handle, "workflow-issue", |s| !s.busy && has_reply(s, "ok")).await;
        assert!(!tab.activity);
        assert_eq!(
            tab.assigned_config.as_ref().map(|c| c.model_id.as_str()),
            Some("claude-3-7-sonnet-20250219")
        );

        let requests = backend.requests();
        let forwarded = requests
            .iter()
            .find(|request| request.prompt == "Ga naar Repo Acme/widgets en pak issue 42 op")
            .expect("forwarded prompt");
        assert_eq!(forwarded.model, "claude-3-7-sonnet-20250219");
        assert_eq!(forwarded.preset.as_deref(), Some("developer"));

        let app = handle.app_snapshot().await.expect("app");
        assert_eq!(app.active_context_id, Some(api_id("workflow-issue")));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_model_falls_back_with_one_warning() {
        let backend = Arc::new(ScriptedBackend::with_catalog(
            &[FALLBACK_MODEL_ID],
            &["developer"],
        ));
        backend.script(
            "maak een issue",
            vec![done("Ik heb issue 7 aangemaakt voor Repo Acme/widgets")],
        );
        let (handle, _events) = start(backend.clone(), tabs_without_ack());
        handle
            .apply_client_action(ClientAction::SetWorkflowEnabled { enabled: true })
            .await
            .expect("enable workflow");

        submit(&handle, "chat-1", "maak een issue").await;
        let tab = wait_for_context(&handle, "workflow-issue", |s| !s.busy && has_reply(s, "ok")).await;
        let warnings = tab
            .entries
            .iter()
            .filter(|entry| matches!(entry, LogEntrySnapshot::Warning { .. }))
            .count();
        assert_eq!(warnings, 1);

        let forwarded = backend
            .requests()
            .into_iter()
            .find(|request| request.prompt == "Ga naar Repo Acme/widgets en pak issue 7 op")
            .expect("forwarded prompt");
        assert_eq!(forwarded.model, FALLBACK_MODEL_ID);
        assert_eq!(forwarded.preset.as_deref(), Some("developer"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_catalog_times_out_configuration() {
        let backend = Arc::new(ScriptedBackend {
            catalog_unavailable: true,
            ..ScriptedBackend::default()
        });
        backend.script(
            "maak een issue",
            vec![done("Ik heb issue 1 aangemaakt voor Repo a/b")],
        );
        let (handle, _events) = start(backend.clone(), tabs_without_ack());
        handle
            .apply_client_action(ClientAction::SetWorkflowEnabled { enabled: true })
            .await
            .expect("enable workflow");

        submit(&handle, "chat-1", "maak een issue").await;
        let tab = wait_for_context(&handle, "workflow-issue", |s| {
            s.entries.iter().any(|entry| {
                matches!(entry, LogEntrySnapshot::Error { message } if message.contains("configuration failed"))
            })
        })
        .await;
        assert!(!tab.busy);
        assert!(!tab.activity);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_forwards_answer_to_next_chat() {
        let backend = Arc::new(ScriptedBackend::with_catalog(&[FALLBACK_MODEL_ID], &[]));
        backend.script("start", vec![done("doorgeven")]);
        backend.script("doorgeven", vec![done("ontvangen")]);
        let (handle, _events) = start(backend.clone(), tabs_without_ack());

        handle
            .apply_client_action(ClientAction::OpenContext { context_id: None })
            .await
            .expect("open");
        handle
            .apply_client_action(ClientAction::SetRelayEnabled { enabled: true })
            .await
            .expect("relay");

        submit(&handle, "chat-1", "start").await;
        let next = wait_for_context(&handle, "chat-2", |s| !s.busy && has_reply(s, "ontvangen")).await;
        assert!(next.entries.iter().any(
            |entry| matches!(entry, LogEntrySnapshot::UserPrompt { text } if text == "doorgeven")
        ));

        // The relayed answer is not forwarded again.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn surface_ack_gates_delivery_into_new_tab() {
        let backend = Arc::new(ScriptedBackend::with_catalog(
            &["claude-3-7-sonnet-20250219"],
            &["developer"],
        ));
        backend.script(
            "maak een issue",
            vec![done("Ik heb issue 42 aangemaakt voor Repo Acme/widgets")],
        );
        let (handle, events) = start(
            backend.clone(),
            EngineSettings {
                layout: WorkflowLayout::Tabs,
                require_surface_ack: true,
            },
        );
        let mut events = events.subscribe();
        handle
            .apply_client_action(ClientAction::SetWorkflowEnabled { enabled: true })
            .await
            .expect("enable workflow");
        submit(&handle, "chat-1", "maak een issue").await;

        loop {
            let message = events.recv().await.expect("event");
            if let WsServerMessage::Event { event, .. } = message
                && let chatflow_api::ServerEvent::ActivateSurface { context_id } = *event
            {
                assert_eq!(context_id, api_id("workflow-issue"));
                break;
            }
        }
        handle
            .apply_client_action(ClientAction::SurfaceReady {
                context_id: api_id("workflow-issue"),
            })
            .await
            .expect("ack");

        let tab = wait_for_context(&handle, "workflow-issue", |s| !s.busy && has_reply(s, "ok")).await;
        assert!(tab.ready);
        assert!(
            !tab.entries
                .iter()
                .any(|entry| matches!(entry, LogEntrySnapshot::Error { .. }))
        );
    }
}
