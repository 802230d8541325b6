use crate::ServerConfig;
use crate::backend::{ChatBackend, HttpChatBackend};
use crate::engine::{Engine, EngineConfig, EngineHandle, EngineTimings};
use crate::mode_store::ModeStore;
use axum::{
    Json, Router,
    extract::{Path, State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use chatflow_api::{ClientAction, PROTOCOL_VERSION, WsClientMessage, WsServerMessage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub async fn router(config: ServerConfig) -> anyhow::Result<Router> {
    let backend: Arc<dyn ChatBackend> = Arc::new(HttpChatBackend::new(&config.backend_url)?);
    tracing::info!(backend = %config.backend_url, "using chat backend");
    Ok(router_with_backend(config, backend, EngineTimings::default()))
}

pub fn router_with_backend(
    config: ServerConfig,
    backend: Arc<dyn ChatBackend>,
    timings: EngineTimings,
) -> Router {
    let mode_store = ModeStore::new(config.state_path);
    tracing::info!(
        layout = config.settings.layout.as_str(),
        surface_ack = config.settings.require_surface_ack,
        state_path = ?mode_store.path(),
        "starting engine"
    );
    let (engine, events) = Engine::start(EngineConfig {
        backend,
        mode_store,
        settings: config.settings,
        timings,
    });

    let state = AppStateHolder { engine, events };

    let api = Router::new()
        .route("/health", get(health))
        .route("/app", get(get_app))
        .route("/contexts/{context_id}", get(get_context))
        .route("/action", post(post_action))
        .route("/events", get(ws_events))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppStateHolder {
    engine: EngineHandle,
    events: broadcast::Sender<WsServerMessage>,
}

async fn get_app(State(state): State<AppStateHolder>) -> impl IntoResponse {
    match state.engine.app_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
            .into_response(),
    }
}

async fn get_context(
    State(state): State<AppStateHolder>,
    Path(context_id): Path<String>,
) -> impl IntoResponse {
    match state
        .engine
        .context_snapshot(chatflow_api::ContextId(context_id))
        .await
    {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (axum::http::StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

#[derive(serde::Serialize)]
struct ActionAccepted {
    rev: u64,
}

async fn post_action(
    State(state): State<AppStateHolder>,
    Json(action): Json<ClientAction>,
) -> impl IntoResponse {
    match state.engine.apply_client_action(action).await {
        Ok(rev) => Json(ActionAccepted { rev }).into_response(),
        Err(message) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, message).into_response(),
    }
}

async fn ws_events(ws: WebSocketUpgrade, State(state): State<AppStateHolder>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_events_task(socket, state))
}

async fn ws_events_task(mut socket: axum::extract::ws::WebSocket, state: AppStateHolder) {
    let mut rx = state.events.subscribe();
    let engine = state.engine.clone();

    let current_rev = engine.current_rev().await.unwrap_or(0);
    let _ = socket
        .send(json_text(&WsServerMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            current_rev,
        }))
        .await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                if handle_ws_incoming(msg, &engine, &mut socket).await.is_err() {
                    break;
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(outgoing) => {
                        if socket.send(json_text(&outgoing)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "ws client lagged, resending app snapshot");
                        if let Ok(snapshot) = engine.app_snapshot().await {
                            let rev = snapshot.rev;
                            let msg = WsServerMessage::Event {
                                rev,
                                event: Box::new(chatflow_api::ServerEvent::AppChanged {
                                    snapshot: Box::new(snapshot),
                                }),
                            };
                            if socket.send(json_text(&msg)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> axum::extract::ws::Message {
    axum::extract::ws::Message::Text(serde_json::to_string(value).unwrap_or_default().into())
}

async fn handle_ws_incoming(
    msg: axum::extract::ws::Message,
    engine: &EngineHandle,
    socket: &mut axum::extract::ws::WebSocket,
) -> anyhow::Result<()> {
    let axum::extract::ws::Message::Text(text) = msg else {
        return Ok(());
    };

    let client: WsClientMessage = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(err) => {
            let _ = socket
                .send(json_text(&WsServerMessage::Error {
                    request_id: None,
                    message: format!("invalid ws message: {err}"),
                }))
                .await;
            return Ok(());
        }
    };

    match client {
        WsClientMessage::Hello { protocol_version } => {
            if protocol_version != PROTOCOL_VERSION {
                tracing::warn!(
                    client = protocol_version,
                    server = PROTOCOL_VERSION,
                    "ws client speaks a different protocol version"
                );
            }
            Ok(())
        }
        WsClientMessage::Ping => {
            socket.send(json_text(&WsServerMessage::Pong)).await?;
            Ok(())
        }
        WsClientMessage::Action { request_id, action } => {
            let msg = match engine.apply_client_action(*action).await {
                Ok(rev) => WsServerMessage::Ack { request_id, rev },
                Err(message) => WsServerMessage::Error {
                    request_id: Some(request_id),
                    message,
                },
            };
            socket.send(json_text(&msg)).await?;
            Ok(())
        }
    }
}
