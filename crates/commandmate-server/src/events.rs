use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use commandmate_protocol::Envelope;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::AppState;

const EVENT_BUFFER: usize = 256;

/// Fan-out of lifecycle events to WebSocket subscribers.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<Envelope>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, envelope: Envelope) {
        // no subscribers is not an error
        let _ = self.sender.send(envelope);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn event_feed(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let receiver = state.events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, receiver))
}

async fn stream_events(mut socket: WebSocket, mut receiver: broadcast::Receiver<Envelope>) {
    debug!("event feed subscriber connected");
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event feed subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("event feed subscriber disconnected");
}
