use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use consultation_cell::{consultation_routes, ConsultationCoordinator, ConsultationState};
use shared_models::realtime::ClientCommand;
use shared_models::realtime::Role;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};
use video_conferencing_cell::HttpRoomGateway;

fn create_app() -> (Router, ConsultationState) {
    let config = TestConfig::default().to_arc();
    let gateway = Arc::new(HttpRoomGateway::new(&config).unwrap());
    let (coordinator, _departures) = ConsultationCoordinator::new(&config.coordination, gateway);
    let state = ConsultationState { config, coordinator };
    (consultation_routes(state.clone()), state)
}

async fn get(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_check_is_public() {
    let (app, _state) = create_app();

    let (status, json) = get(app, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["room_provider_configured"], true);
    assert_eq!(json["live_sessions"], 0);
}

#[tokio::test]
async fn test_queue_requires_authentication() {
    let (app, _state) = create_app();

    let (status, _) = get(app, &format!("/doctors/{}/queue", Uuid::new_v4()), None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_doctor_sees_own_queue_only() {
    let (app, state) = create_app();
    let doctor = TestUser::doctor("doctor@example.com");
    let token = JwtTestUtils::create_test_token(&doctor, &state.config.supabase_jwt_secret, Some(1));

    let patient_id = Uuid::new_v4();
    let patient = state.coordinator.connect(patient_id, Role::Patient).await;
    state
        .coordinator
        .handle_command(
            &patient.handle,
            ClientCommand::JoinQueue {
                doctor_id: doctor.uuid(),
                patient_id,
                room_name_hint: None,
            },
        )
        .await
        .unwrap();

    let (status, json) = get(
        app.clone(),
        &format!("/doctors/{}/queue", doctor.uuid()),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["queue_length"], 1);
    assert_eq!(json["waiting"][0]["patient_id"], patient_id.to_string());

    let (status, _) = get(app, &format!("/doctors/{}/queue", Uuid::new_v4()), Some(&token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_patient_position_and_unknown_session() {
    let (app, state) = create_app();
    let patient = TestUser::patient("patient@example.com");
    let token = JwtTestUtils::create_test_token(&patient, &state.config.supabase_jwt_secret, Some(1));
    let doctor_id = Uuid::new_v4();

    let (status, _) = get(app.clone(), &format!("/doctors/{}/position", doctor_id), Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state
        .coordinator
        .queue()
        .join_queue(doctor_id, patient.uuid(), None)
        .await
        .unwrap();

    let (status, json) = get(app.clone(), &format!("/doctors/{}/position", doctor_id), Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["position"], 1);
    assert_eq!(json["estimated_wait_seconds"], 600);

    let (status, _) = get(app, &format!("/sessions/{}", Uuid::new_v4()), Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
