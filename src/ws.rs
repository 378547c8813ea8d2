use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    hub::Hub,
    protocol::{self, ProtocolError},
};

#[debug_handler(state = crate::AppState)]
pub async fn connect(State(hub): State<Hub>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve(hub, stream))
}

async fn serve(hub: Hub, stream: WebSocket) {
    let conn_id = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut sender, mut receiver) = stream.split();

    hub.connect(conn_id, tx).await;
    info!(%conn_id, "connection opened");

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%conn_id, %err, "failed to serialize event");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let parsed = match frame {
                    Some(Ok(WsMessage::Text(text))) => protocol::parse_frame(text.as_str()),
                    Some(Ok(WsMessage::Binary(_))) => Err(ProtocolError::Binary),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(%conn_id, %err, "websocket error");
                        break;
                    }
                };

                match parsed {
                    Ok(event) => hub.handle(conn_id, event).await,
                    Err(err) => {
                        warn!(%conn_id, %err, "rejected frame");
                        hub.reject(conn_id, err.to_string()).await;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    hub.disconnect(conn_id).await;
    send_task.abort();
    info!(%conn_id, "connection closed");
}
