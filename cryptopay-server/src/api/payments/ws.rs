use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use cryptopay_sdk::objects::PaymentSessionResponse;
use cryptopay_sdk::objects::ws::{WsCloseCode, WsServerMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::owned_session;
use crate::api::extractors::CurrentUser;
use crate::state::AppState;

/// `GET /payments/{id}/ws`: WebSocket payment status stream.
///
/// Upgrades the HTTP connection to a WebSocket and pushes
/// [`PaymentSessionResponse`] JSON frames whenever the session changes.
/// The first frame is always the current projection; the connection is
/// closed after a terminal status.
pub(super) async fn payment_status_ws(
    state: State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(payment_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let app_state = state.0.clone();
    ws.on_upgrade(move |socket| handle_payment_ws(socket, app_state, user.id, payment_id))
}

/// Background task that drives a single WebSocket connection.
///
/// 1. Sends the current projection as the first message.
/// 2. If already terminal, closes immediately.
/// 3. Otherwise forwards broadcast changes for this session, and re-reads
///    it every poll interval, until a terminal status or disconnect.
async fn handle_payment_ws(mut socket: WebSocket, state: AppState, user_id: Uuid, payment_id: Uuid) {
    // Subscribe before the first read so a change racing the read is
    // still buffered.
    let mut events = state.events.subscribe();

    let mut last = match owned_session(state.store.as_ref(), user_id, payment_id).await {
        Ok(Some(session)) => session.to_response(),
        Ok(None) => {
            close_with_error(&mut socket, WsCloseCode::PAYMENT_NOT_FOUND, "payment not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, %payment_id, "WS: failed to query payment");
            close_with_error(&mut socket, WsCloseCode::INTERNAL_ERROR, "internal error").await;
            return;
        }
    };

    if send_status(&mut socket, &last).await.is_err() {
        return;
    }
    if last.status.is_terminal() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let poll_secs = state.config.realtime.read().await.poll_interval_secs.max(1);
    let mut poll = tokio::time::interval(Duration::from_secs(poll_secs));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    poll.tick().await;

    loop {
        let update = tokio::select! {
            result = events.recv() => match result {
                Ok(event) if event.session_id() == payment_id && event.user_id == user_id => {
                    Some(event.session)
                }
                Ok(_) => None,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        %payment_id,
                        skipped,
                        "WS: broadcast receiver lagged, re-reading payment"
                    );
                    reload(&state, user_id, payment_id).await
                }
                Err(RecvError::Closed) => break,
            },

            _ = poll.tick() => reload(&state, user_id, payment_id).await,

            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => None,
            },
        };

        let Some(next) = update else {
            continue;
        };
        // Never move the stream backwards or repeat a frame.
        if next == last || next.status.rank() < last.status.rank() {
            continue;
        }
        if send_status(&mut socket, &next).await.is_err() {
            return;
        }
        let terminal = next.status.is_terminal();
        last = next;
        if terminal {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

async fn reload(state: &AppState, user_id: Uuid, payment_id: Uuid) -> Option<PaymentSessionResponse> {
    match owned_session(state.store.as_ref(), user_id, payment_id).await {
        Ok(session) => session.map(|s| s.to_response()),
        Err(e) => {
            tracing::warn!(error = %e, %payment_id, "WS: failed to re-read payment");
            None
        }
    }
}

async fn send_status(socket: &mut WebSocket, payment: &PaymentSessionResponse) -> Result<(), ()> {
    send_json(
        socket,
        &WsServerMessage::StatusUpdate {
            payment: payment.clone(),
        },
    )
    .await
}

async fn close_with_error(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = send_json(
        socket,
        &WsServerMessage::Error {
            code,
            reason: reason.to_owned(),
        },
    )
    .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Serialize `value` as JSON and send it as a text WebSocket frame.
///
/// Returns `Err(())` if the send fails (client disconnected).
async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
