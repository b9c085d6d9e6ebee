use crate::error::ServiceError;
use crate::messages::{InboundMessage, OutboundResponse, ServerEvent};
use crate::{AppState, Store};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub async fn ws_handler<L: Store>(ws: WebSocketUpgrade, State(state): State<AppState<L>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket<L: Store>(socket: WebSocket, state: AppState<L>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    // Subscribe before the snapshot so nothing falls between the two.
    let mut broadcast_rx = state.rounds.subscribe();

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    if let Ok(round) = state.rounds.snapshot().await {
        send(&tx, &ServerEvent::State { round });
    }
    if let Ok(rounds) = state.rounds.history().await {
        send(&tx, &ServerEvent::History { rounds });
    }

    let broadcast_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => send(&tx, &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(inbound) => {
                    let response = handle_inbound(inbound, &state).await;
                    send(&tx, &response);
                }
                Err(err) => {
                    warn!(?err, "invalid inbound message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!("websocket closed");
    write_task.abort();
    broadcast_task.abort();
}

async fn handle_inbound<L: Store>(inbound: InboundMessage, state: &AppState<L>) -> OutboundResponse {
    match inbound {
        InboundMessage::Bet {
            request_id,
            account_id,
            panel_id,
            amount,
            auto_cashout,
        } => {
            let result = state
                .rounds
                .place_bet(&account_id, panel_id, amount, auto_cashout)
                .await;
            match flatten(result) {
                Ok(placed) => OutboundResponse::Ack {
                    request_id,
                    balance: Some(placed.balance),
                    payout: None,
                },
                Err(err) => error_response(request_id, err),
            }
        }
        InboundMessage::Cashout {
            request_id,
            account_id,
            panel_id,
        } => match flatten(state.rounds.cash_out(&account_id, panel_id).await) {
            Ok(cashout) => OutboundResponse::Ack {
                request_id,
                balance: Some(cashout.balance),
                payout: Some(cashout.payout),
            },
            Err(err) => error_response(request_id, err),
        },
        InboundMessage::Autoplay {
            request_id,
            account_id,
            panel_id,
            config,
        } => match flatten(state.rounds.set_autoplay(&account_id, panel_id, config).await) {
            Ok(()) => OutboundResponse::Ack {
                request_id,
                balance: None,
                payout: None,
            },
            Err(err) => error_response(request_id, err),
        },
    }
}

fn flatten<T, E, G>(result: Result<Result<T, E>, G>) -> Result<T, ServiceError>
where
    E: Into<ServiceError>,
    G: Into<ServiceError>,
{
    result.map_err(Into::<ServiceError>::into)?.map_err(Into::into)
}

fn send(tx: &mpsc::UnboundedSender<Message>, payload: &impl Serialize) {
    if let Ok(payload) = serde_json::to_string(payload) {
        let _ = tx.send(Message::Text(payload));
    }
}

fn error_response(request_id: String, err: ServiceError) -> OutboundResponse {
    OutboundResponse::Error {
        request_id,
        code: err.code().to_string(),
        message: err.message(),
    }
}
