use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};

use super::AppState;
use crate::bus::EphemeralSubscription;
use crate::error::AppError;
use crate::tail::{Liveness, TailError, TailSink};

/// Handle GET /tail (WebSocket upgrade)
///
/// The subscription is opened before the upgrade so a bus failure is
/// reported as a plain HTTP error.
pub async fn tail_logs(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let subscription = state.tail.subscribe().await?;

    Ok(ws.on_upgrade(move |socket| run_session(socket, subscription, state)))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl TailSink for WsSink {
    async fn send_record(&mut self, json: String) -> Result<(), TailError> {
        self.0
            .send(Message::Text(json))
            .await
            .map_err(|e| TailError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TailError> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TailError::Transport(e.to_string()))
    }
}

async fn run_session(socket: WebSocket, subscription: EphemeralSubscription, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let session = state.shutdown.child_token();
    let liveness = Liveness::new();

    // Reader: any inbound frame counts as liveness; close or error ends the session
    let reader = tokio::spawn({
        let session = session.clone();
        let liveness = liveness.clone();
        async move {
            while let Some(frame) = receiver.next().await {
                match frame {
                    Ok(Message::Close(_)) => break,
                    Ok(_) => liveness.mark_inbound(),
                    Err(e) => {
                        tracing::debug!(error = %e, "Tail client read failed");
                        break;
                    }
                }
            }
            session.cancel();
        }
    });

    let mut sink = WsSink(sender);
    let end = state
        .tail
        .pump(subscription, &mut sink, liveness, session.clone())
        .await;

    session.cancel();
    reader.abort();
    let _ = sink.0.close().await;

    tracing::debug!(reason = ?end, "Tail connection closed");
}
