use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_models::realtime::{ClientCommand, Role, ServerEvent};
use shared_utils::jwt::validate_token;

use crate::error::ConsultationError;
use crate::models::{ConsultationState, WsParams};
use crate::services::coordinator::ConsultationCoordinator;

// ==============================================================================
// SESSION CHANNEL
// ==============================================================================

/// Upgrade to the consultation channel. The token comes from `?token=` or
/// the `Authorization` header; a doctor channel needs a doctor account.
pub async fn consultation_socket(
    ws: WebSocketUpgrade,
    State(state): State<ConsultationState>,
    Query(params): Query<WsParams>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, AppError> {
    let token = params
        .token
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()))
        .ok_or_else(|| AppError::Auth("Missing access token".to_string()))?;

    let user = validate_token(&token, &state.config.supabase_jwt_secret)
        .map_err(|e| AppError::Auth(e.to_string()))?;
    let user_id = user_uuid(&user)?;

    let account_role = Role::from_claim(user.role.as_deref());
    let role = params.role.unwrap_or(account_role);
    if role == Role::Doctor && account_role != Role::Doctor {
        return Err(AppError::Forbidden(
            "Doctor channel requires a doctor account".to_string(),
        ));
    }

    let coordinator = Arc::clone(&state.coordinator);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, coordinator, user_id, role)))
}

async fn handle_socket(
    socket: WebSocket,
    coordinator: Arc<ConsultationCoordinator>,
    user_id: Uuid,
    role: Role,
) {
    let open = coordinator.connect(user_id, role).await;
    let handle = open.handle;
    let mut receiver = open.receiver;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward channel events to the socket, in order
    let send_task = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    let mut graceful = false;
    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("{} {} closed the channel", role, user_id);
                graceful = true;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error for {} {}: {}", role, user_id, e);
                break;
            }
        };

        match serde_json::from_str::<ClientCommand>(text.as_str()) {
            Ok(command) => coordinator.dispatch(&handle, command).await,
            Err(e) => {
                warn!("Failed to parse client message: {} - {}", e, text.as_str());
                let event = ServerEvent::error("validation", format!("Unrecognised message: {}", e));
                if coordinator.hub().send(&handle, event).await.is_err() {
                    break;
                }
            }
        }
    }

    coordinator.disconnect(&handle, graceful).await;
    send_task.abort();
}

// ==============================================================================
// REST HANDLERS
// ==============================================================================

pub async fn get_doctor_queue(
    State(state): State<ConsultationState>,
    Path(doctor_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if user_uuid(&user)? != doctor_id || !user.has_role("doctor") {
        return Err(AppError::Forbidden("Only the doctor can view their queue".to_string()));
    }

    let snapshot = state.coordinator.queue().snapshot(doctor_id).await;

    Ok(Json(json!({
        "doctor_id": snapshot.doctor_id,
        "queue_length": snapshot.queue_length,
        "waiting": snapshot.waiting,
        "average_consultation_seconds": snapshot.average_consultation.as_secs(),
        "in_consultation": snapshot.in_consultation,
    })))
}

pub async fn get_queue_position(
    State(state): State<ConsultationState>,
    Path(doctor_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let patient_id = user_uuid(&user)?;

    let position = state
        .coordinator
        .queue()
        .position_of(doctor_id, patient_id)
        .await
        .ok_or_else(|| {
            ConsultationError::NotFound(format!("Not queued for doctor {}", doctor_id))
        })?;

    Ok(Json(json!({
        "doctor_id": doctor_id,
        "patient_id": patient_id,
        "position": position.position,
        "estimated_wait_seconds": position.estimated_wait.as_secs(),
        "queue_length": position.queue_length,
        "in_consultation": position.is_in_consultation(),
    })))
}

pub async fn get_session(
    State(state): State<ConsultationState>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let user_id = user_uuid(&user)?;

    let session = state
        .coordinator
        .sessions()
        .get_session(session_id)
        .await
        .filter(|session| session.involves(user_id))
        .ok_or_else(|| ConsultationError::NotFound(format!("Session {}", session_id)))?;

    Ok(Json(json!(session)))
}

pub async fn get_session_participants(
    State(state): State<ConsultationState>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let user_id = user_uuid(&user)?;
    let sessions = state.coordinator.sessions();

    let involved = sessions
        .get_session(session_id)
        .await
        .is_some_and(|session| session.involves(user_id));
    if !involved {
        return Err(ConsultationError::NotFound(format!("Session {}", session_id)).into());
    }

    let participants = sessions
        .participants(session_id)
        .await
        .map_err(ConsultationError::from)?;

    Ok(Json(json!({
        "session_id": session_id,
        "participants": participants,
    })))
}

pub async fn health_check(State(state): State<ConsultationState>) -> impl IntoResponse {
    let connections = state.coordinator.hub().active_connections().await.len();
    let live_sessions = state.coordinator.sessions().live_session_count().await;

    Json(json!({
        "status": "healthy",
        "service": "consultation-cell",
        "room_provider_configured": state.config.is_room_provider_configured(),
        "connections": connections,
        "live_sessions": live_sessions,
    }))
}

fn user_uuid(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id)
        .map_err(|_| AppError::Auth("Token subject is not a valid user id".to_string()))
}
