use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Backend contract.

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// One frame of the dispatch stream. A well-formed stream carries any
/// number of `Log` frames followed by exactly one `Done` or `Error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchStreamEvent {
    Log {
        data: serde_json::Value,
    },
    Done {
        response: String,
        conversation_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        active_connections: Vec<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresetInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Preset listing keyed by preset key, as returned by the backend.
pub type PresetCatalog = BTreeMap<String, PresetInfo>;

// UI contract.

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowLayout {
    #[default]
    Tabs,
    Windows,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub rev: u64,
    pub workflow_enabled: bool,
    pub relay_enabled: bool,
    pub layout: WorkflowLayout,
    #[serde(default)]
    pub active_context_id: Option<ContextId>,
    pub contexts: Vec<ContextSummarySnapshot>,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub presets: Vec<PresetInfo>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextSummarySnapshot {
    pub context_id: ContextId,
    #[serde(default)]
    pub title: Option<String>,
    pub busy: bool,
    pub activity: bool,
    pub has_queued_action: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub rev: u64,
    pub context_id: ContextId,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub busy: bool,
    pub activity: bool,
    pub ready: bool,
    #[serde(default)]
    pub assigned_config: Option<RunConfigSnapshot>,
    #[serde(default)]
    pub queued_action: Option<QueuedActionSnapshot>,
    #[serde(default)]
    pub active_connections: Vec<String>,
    pub entries: Vec<LogEntrySnapshot>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    pub model_id: String,
    #[serde(default)]
    pub preset_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target_context_id: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueuedActionSnapshot {
    pub prompt_text: String,
    pub config: RunConfigSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntrySnapshot {
    UserPrompt { text: String },
    AssistantReply { text: String },
    ToolEvent { data: serde_json::Value },
    Info { message: String },
    Warning { message: String },
    Error { message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    SubmitPrompt {
        context_id: ContextId,
        text: String,
    },
    ResetContext {
        context_id: ContextId,
    },
    OpenContext {
        #[serde(default)]
        context_id: Option<ContextId>,
    },
    CloseContext {
        context_id: ContextId,
    },
    SurfaceReady {
        context_id: ContextId,
    },
    SetWorkflowEnabled {
        enabled: bool,
    },
    SetRelayEnabled {
        enabled: bool,
    },
    ReloadCatalog,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AppChanged {
        snapshot: Box<AppSnapshot>,
    },
    ContextChanged {
        snapshot: Box<ContextSnapshot>,
    },
    LogAppended {
        context_id: ContextId,
        entry: LogEntrySnapshot,
    },
    SurfaceOpened {
        context_id: ContextId,
    },
    SurfaceClosed {
        context_id: ContextId,
    },
    ActivateSurface {
        context_id: ContextId,
    },
    Toast {
        message: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Hello {
        protocol_version: u32,
    },
    Action {
        request_id: String,
        action: Box<ClientAction>,
    },
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Hello {
        protocol_version: u32,
        current_rev: u64,
    },
    Ack {
        request_id: String,
        rev: u64,
    },
    Event {
        rev: u64,
        event: Box<ServerEvent>,
    },
    Error {
        request_id: Option<String>,
        message: String,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_stream_event_parses_backend_frames() {
        let log: DispatchStreamEvent =
            serde_json::from_str(r#"{"type":"log","data":{"tool":"github","step":1}}"#)
                .expect("log frame");
        assert!(matches!(log, DispatchStreamEvent::Log { .. }));

        let done: DispatchStreamEvent = serde_json::from_str(
            r#"{"type":"done","response":"ok","conversation_id":"c-1","title":"Hi"}"#,
        )
        .expect("done frame");
        match done {
            DispatchStreamEvent::Done {
                response,
                conversation_id,
                title,
                active_connections,
            } => {
                assert_eq!(response, "ok");
                assert_eq!(conversation_id, "c-1");
                assert_eq!(title.as_deref(), Some("Hi"));
                assert!(active_connections.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let error: DispatchStreamEvent =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).expect("error frame");
        assert!(matches!(error, DispatchStreamEvent::Error { message } if message == "boom"));
    }

    #[test]
    fn dispatch_request_omits_absent_optionals() {
        let request = DispatchRequest {
            prompt: "hi".to_owned(),
            model: "m".to_owned(),
            preset: None,
            conversation_id: None,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json, serde_json::json!({"prompt": "hi", "model": "m"}));
    }

    #[test]
    fn open_context_accepts_missing_id() {
        let action: ClientAction =
            serde_json::from_str(r#"{"type":"open_context"}"#).expect("parse");
        assert!(matches!(action, ClientAction::OpenContext { context_id: None }));
    }
}
