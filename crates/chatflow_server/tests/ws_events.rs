use chatflow_api::{ClientAction, ContextId, ServerEvent, WsClientMessage, WsServerMessage};
use futures::{SinkExt as _, StreamExt as _};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn recv_ws_msg(socket: &mut WsStream, timeout: Duration) -> WsServerMessage {
    loop {
        let next = tokio::time::timeout(timeout, socket.next())
            .await
            .expect("timed out waiting for ws message")
            .expect("websocket stream ended")
            .expect("websocket recv failed");
        match next {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("failed to parse ws server message");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text ws message, got {other:?}"),
        }
    }
}

async fn send_ws_msg(socket: &mut WsStream, msg: &WsClientMessage) {
    socket
        .send(Message::Text(
            serde_json::to_string(msg).expect("serialize ws message").into(),
        ))
        .await
        .expect("send ws message");
}

/// Reads messages until `done` holds for everything seen so far.
async fn recv_until(
    socket: &mut WsStream,
    mut done: impl FnMut(&[WsServerMessage]) -> bool,
) -> Vec<WsServerMessage> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        seen.push(recv_ws_msg(socket, Duration::from_secs(2)).await);
        if done(&seen) {
            return seen;
        }
    }
    panic!("expected ws messages never arrived: {seen:?}");
}

fn acked(seen: &[WsServerMessage], request_id: &str) -> bool {
    seen.iter()
        .any(|msg| matches!(msg, WsServerMessage::Ack { request_id: id, .. } if id == request_id))
}

fn events(seen: &[WsServerMessage]) -> impl Iterator<Item = &ServerEvent> {
    seen.iter().filter_map(|msg| match msg {
        WsServerMessage::Event { event, .. } => Some(event.as_ref()),
        _ => None,
    })
}

// No chat backend is listening on this address; catalog loading fails and
// the engine keeps serving.
async fn start_offline_server() -> chatflow_server::StartedServer {
    let config = chatflow_server::ServerConfig {
        backend_url: "http://127.0.0.1:9".to_owned(),
        state_path: None,
        settings: chatflow_domain::EngineSettings::default(),
    };
    chatflow_server::start_server_with_config("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("start chatflow server")
}

async fn connect(server: &chatflow_server::StartedServer) -> WsStream {
    let url = format!("ws://{}/api/events", server.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect websocket");

    let first = recv_ws_msg(&mut socket, Duration::from_secs(2)).await;
    assert!(matches!(first, WsServerMessage::Hello { .. }));

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Hello {
            protocol_version: chatflow_api::PROTOCOL_VERSION,
        },
    )
    .await;
    socket
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = start_offline_server().await;
    let mut socket = connect(&server).await;

    send_ws_msg(&mut socket, &WsClientMessage::Ping).await;
    for _ in 0..50 {
        if matches!(
            recv_ws_msg(&mut socket, Duration::from_secs(2)).await,
            WsServerMessage::Pong
        ) {
            return;
        }
    }
    panic!("no pong received");
}

#[tokio::test]
async fn open_context_is_acked_and_announced() {
    let server = start_offline_server().await;
    let mut socket = connect(&server).await;

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Action {
            request_id: "req-1".to_owned(),
            action: Box::new(ClientAction::OpenContext { context_id: None }),
        },
    )
    .await;

    let chat_2 = ContextId("chat-2".to_owned());
    let seen = recv_until(&mut socket, |seen| {
        acked(seen, "req-1")
            && events(seen).any(|event| {
                matches!(event, ServerEvent::SurfaceOpened { context_id } if *context_id == chat_2)
            })
    })
    .await;

    let last_app = events(&seen)
        .filter_map(|event| match event {
            ServerEvent::AppChanged { snapshot } => Some(snapshot),
            _ => None,
        })
        .last()
        .expect("app snapshot event");
    assert_eq!(last_app.contexts.len(), 2);
    assert_eq!(last_app.active_context_id, Some(chat_2));
}

#[tokio::test]
async fn closing_the_last_chat_raises_a_toast() {
    let server = start_offline_server().await;
    let mut socket = connect(&server).await;

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Action {
            request_id: "req-close".to_owned(),
            action: Box::new(ClientAction::CloseContext {
                context_id: ContextId("chat-1".to_owned()),
            }),
        },
    )
    .await;

    let seen = recv_until(&mut socket, |seen| {
        acked(seen, "req-close")
            && events(seen).any(|event| {
                matches!(event, ServerEvent::Toast { message } if message.contains("last chat"))
            })
    })
    .await;
    assert!(!events(&seen).any(|event| matches!(event, ServerEvent::SurfaceClosed { .. })));
}

#[tokio::test]
async fn invalid_message_reports_error_without_request_id() {
    let server = start_offline_server().await;
    let mut socket = connect(&server).await;

    socket
        .send(Message::Text("{\"type\":\"bogus\"}".into()))
        .await
        .expect("send bogus");

    for _ in 0..50 {
        if let WsServerMessage::Error {
            request_id,
            message,
        } = recv_ws_msg(&mut socket, Duration::from_secs(2)).await
        {
            assert_eq!(request_id, None);
            assert!(message.contains("invalid ws message"));
            return;
        }
    }
    panic!("no error received");
}
