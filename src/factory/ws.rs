use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::api::{SharedState, StatusSnapshot};
use super::models::{Project, ProjectEvent};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket frame types ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsFrame {
    StatusSnapshot(StatusSnapshot),
    Event(ProjectEvent),
}

impl WsFrame {
    fn to_text(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize websocket frame");
                None
            }
        }
    }
}

/// Frames sent right after the upgrade: the snapshot, then the replayed history.
fn initial_frames(project: &Project, history: Vec<ProjectEvent>) -> Vec<WsFrame> {
    std::iter::once(WsFrame::StatusSnapshot(StatusSnapshot::from(project)))
        .chain(history.into_iter().map(WsFrame::Event))
        .collect()
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, project_id: String) {
    let (mut sender, receiver) = socket.split();
    let orchestrator = &state.orchestrator;

    let project = match orchestrator.get_project(&project_id, None).await {
        Ok(project) => project,
        Err(e) => {
            tracing::debug!(project_id = %project_id, error = %e, "rejecting websocket");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Project not found".into(),
                })))
                .await;
            return;
        }
    };

    let subscription = match orchestrator.subscribe(&project_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(project_id = %project_id, error = %e, "subscribe failed");
            return;
        }
    };
    let subscriber_id = subscription.id;

    let mut opened = true;
    for frame in initial_frames(&project, subscription.history) {
        let Some(text) = frame.to_text() else { continue };
        if sender.send(Message::Text(text.into())).await.is_err() {
            opened = false;
            break;
        }
    }
    if opened {
        run_socket_loop(sender, receiver, subscription.receiver).await;
    }

    orchestrator.unsubscribe(&project_id, subscriber_id);
    tracing::debug!(project_id = %project_id, subscriber_id, "websocket closed");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards bus events, drains client frames and pings the client every
/// [`PING_INTERVAL`]. If no Pong arrives within [`PONG_TIMEOUT`] the loop
/// exits. It also exits when the bus drops the subscription.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: mpsc::UnboundedReceiver<ProjectEvent>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(text) = WsFrame::Event(event).to_text() else { continue };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Text, Binary and Ping from the client are ignored.
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::{ProjectEventType, ProjectStatus, payload};
    use chrono::Utc;
    use serde_json::json;

    fn project() -> Project {
        let now = Utc::now();
        Project {
            id: "p1".to_string(),
            user_id: "alice".to_string(),
            prompt: "todo".to_string(),
            status: ProjectStatus::Ready,
            project_dir: "/tmp/p1".to_string(),
            template: None,
            preview_url: Some("/api/projects/p1/preview/index.html".to_string()),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
    }

    #[test]
    fn test_snapshot_frame_shape() {
        let frame = WsFrame::StatusSnapshot(StatusSnapshot::from(&project()));
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "status_snapshot");
        assert_eq!(value["data"]["status"], "ready");
        assert_eq!(
            value["data"]["preview_url"],
            "/api/projects/p1/preview/index.html"
        );
        assert!(value["data"]["created_at"].is_string());
    }

    #[test]
    fn test_event_frame_wraps_project_event() {
        let event = ProjectEvent::new(
            "p1",
            ProjectEventType::PreviewReady,
            Some("Preview ready".to_string()),
            payload([("preview_url", json!("/x"))]),
        );
        let value: serde_json::Value =
            serde_json::from_str(&WsFrame::Event(event).to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["data"]["type"], "preview_ready");
        assert_eq!(value["data"]["payload"]["preview_url"], "/x");
    }

    #[test]
    fn test_initial_frames_snapshot_precedes_history() {
        let history = vec![
            ProjectEvent::log("p1", "one"),
            ProjectEvent::log("p1", "two"),
        ];
        let frames = initial_frames(&project(), history);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], WsFrame::StatusSnapshot(_)));
        match &frames[2] {
            WsFrame::Event(e) => assert_eq!(e.message.as_deref(), Some("two")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
