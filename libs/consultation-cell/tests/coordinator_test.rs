use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio::time::sleep;
use uuid::Uuid;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use consultation_cell::ConsultationCoordinator;
use session_channel_cell::{ConnectionHandle, EventReceiver};
use shared_models::realtime::{CallSessionState, ClientCommand, Role, ServerEvent};
use shared_utils::test_utils::TestConfig;
use video_conferencing_cell::{EndReason, HttpRoomGateway};

struct Client {
    handle: ConnectionHandle,
    receiver: EventReceiver,
}

impl Client {
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn last_position(&mut self) -> Option<u32> {
        self.drain().into_iter().rev().find_map(|event| match event {
            ServerEvent::PositionUpdate { position, .. } => Some(position),
            _ => None,
        })
    }
}

async fn start_provider(create_status: u16) -> MockServer {
    let server = MockServer::start().await;
    let create = if create_status < 300 {
        ResponseTemplate::new(create_status).set_body_json(json!({
            "id": format!("room-{}", Uuid::new_v4()),
            "name": "consult-room",
            "status": "created"
        }))
    } else {
        ResponseTemplate::new(create_status)
    };
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .respond_with(create)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/rooms/[^/]+/complete$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(&server)
        .await;
    server
}

fn coordinator_for(server: &MockServer) -> Arc<ConsultationCoordinator> {
    let config = TestConfig::default().with_room_provider(&server.uri()).to_app_config();
    let gateway = Arc::new(HttpRoomGateway::new(&config).unwrap());
    let (coordinator, departures) = ConsultationCoordinator::new(&config.coordination, gateway);
    tokio::spawn(Arc::clone(&coordinator).run_departure_worker(departures));
    coordinator
}

async fn connect(coordinator: &ConsultationCoordinator, user_id: Uuid, role: Role) -> Client {
    let open = coordinator.connect(user_id, role).await;
    Client {
        handle: open.handle,
        receiver: open.receiver,
    }
}

fn grace() -> Duration {
    TestConfig::fast_coordination().grace_window
}

fn session_states(events: &[ServerEvent]) -> Vec<CallSessionState> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::SessionStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_queue_to_completed_consultation() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let (doctor_id, p1, p2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let mut doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
    let mut patient1 = connect(&coordinator, p1, Role::Patient).await;
    let mut patient2 = connect(&coordinator, p2, Role::Patient).await;

    coordinator
        .dispatch(&patient1.handle, ClientCommand::JoinQueue { doctor_id, patient_id: p1, room_name_hint: None })
        .await;
    assert_matches!(
        patient1.drain().last(),
        Some(ServerEvent::PositionUpdate { position: 1, estimated_wait_seconds: 600, .. })
    );

    coordinator
        .dispatch(&patient2.handle, ClientCommand::JoinQueue { doctor_id, patient_id: p2, room_name_hint: None })
        .await;
    assert_eq!(patient2.last_position(), Some(2));

    coordinator
        .dispatch(&patient1.handle, ClientCommand::LeaveQueue { doctor_id, patient_id: p1 })
        .await;
    assert_eq!(patient2.last_position(), Some(1));

    doctor.drain();
    coordinator.dispatch(&doctor.handle, ClientCommand::PullNext { doctor_id }).await;

    let events = patient2.drain();
    assert_eq!(
        session_states(&events),
        vec![CallSessionState::Provisioning, CallSessionState::Invited]
    );
    let session_id = events
        .iter()
        .find_map(|event| match event {
            ServerEvent::Invite { session_id, role: Role::Patient, .. } => Some(*session_id),
            _ => None,
        })
        .expect("Patient should be invited");
    assert!(doctor
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::Invite { role: Role::Doctor, .. })));

    coordinator.dispatch(&patient2.handle, ClientCommand::ConfirmJoin { session_id }).await;
    assert_eq!(session_states(&patient2.drain()), vec![CallSessionState::Active]);

    coordinator.dispatch(&doctor.handle, ClientCommand::EndSession { session_id }).await;
    assert_eq!(
        session_states(&patient2.drain()),
        vec![CallSessionState::Ending, CallSessionState::Completed]
    );

    let session = coordinator.sessions().get_session(session_id).await.unwrap();
    assert_eq!(session.state, CallSessionState::Completed);
    assert!(patient1.drain().iter().all(|e| !matches!(e, ServerEvent::Error { .. })));
}

#[tokio::test]
async fn test_dropped_patient_is_removed_after_grace_without_gaps() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();
    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let mut clients = Vec::new();
    for patient_id in &ids {
        let client = connect(&coordinator, *patient_id, Role::Patient).await;
        coordinator
            .dispatch(
                &client.handle,
                ClientCommand::JoinQueue { doctor_id, patient_id: *patient_id, room_name_hint: None },
            )
            .await;
        clients.push(client);
    }

    coordinator.disconnect(&clients[1].handle, false).await;
    sleep(grace() * 3).await;

    assert!(coordinator.queue().position_of(doctor_id, ids[1]).await.is_none());
    assert_eq!(clients[2].last_position(), Some(2));

    let newcomer = Uuid::new_v4();
    let mut late = connect(&coordinator, newcomer, Role::Patient).await;
    coordinator
        .dispatch(&late.handle, ClientCommand::JoinQueue { doctor_id, patient_id: newcomer, room_name_hint: None })
        .await;
    assert_eq!(late.last_position(), Some(3));
}

#[tokio::test]
async fn test_reconnect_within_grace_starts_with_resync() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();
    let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());

    let patient1 = connect(&coordinator, p1, Role::Patient).await;
    let patient2 = connect(&coordinator, p2, Role::Patient).await;
    for (client, patient_id) in [(&patient1, p1), (&patient2, p2)] {
        coordinator
            .dispatch(&client.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
            .await;
    }

    coordinator.disconnect(&patient2.handle, false).await;
    coordinator
        .dispatch(&patient1.handle, ClientCommand::LeaveQueue { doctor_id, patient_id: p1 })
        .await;

    let mut reconnected = connect(&coordinator, p2, Role::Patient).await;
    let direct = coordinator.queue().position_of(doctor_id, p2).await.unwrap();

    let first = reconnected.receiver.try_recv().expect("Resync should be waiting");
    assert_matches!(
        first,
        ServerEvent::Resync { snapshot }
            if snapshot.position == Some(direct.position) && snapshot.doctor_id == Some(doctor_id)
    );
    assert_eq!(direct.position, 1);

    sleep(grace() * 2).await;
    assert!(
        coordinator.queue().position_of(doctor_id, p2).await.is_some(),
        "Rebound patient keeps their entry"
    );
}

#[tokio::test]
async fn test_provisioning_failure_keeps_patient_first() {
    let server = start_provider(503).await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();
    let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());

    let mut doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
    let mut patient1 = connect(&coordinator, p1, Role::Patient).await;
    let patient2 = connect(&coordinator, p2, Role::Patient).await;
    for (client, patient_id) in [(&patient1, p1), (&patient2, p2)] {
        coordinator
            .dispatch(&client.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
            .await;
    }
    doctor.drain();
    patient1.drain();

    coordinator.dispatch(&doctor.handle, ClientCommand::PullNext { doctor_id }).await;

    assert_matches!(
        doctor.drain().last(),
        Some(ServerEvent::Error { code, .. }) if code == "provider_unavailable"
    );
    let events = patient1.drain();
    assert!(session_states(&events).contains(&CallSessionState::ProvisionFailed));
    assert_eq!(coordinator.queue().position_of(doctor_id, p1).await.unwrap().position, 1);
    assert_eq!(coordinator.queue().position_of(doctor_id, p2).await.unwrap().position, 2);
}

#[tokio::test]
async fn test_second_pull_while_provisioning_is_a_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "id": "room-slow", "name": "slow", "status": "created" }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();

    let mut doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
    for _ in 0..2 {
        let patient_id = Uuid::new_v4();
        let client = connect(&coordinator, patient_id, Role::Patient).await;
        coordinator
            .dispatch(&client.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
            .await;
    }
    doctor.drain();

    let first = {
        let coordinator = Arc::clone(&coordinator);
        let handle = doctor.handle;
        tokio::spawn(async move {
            coordinator.dispatch(&handle, ClientCommand::PullNext { doctor_id }).await;
        })
    };
    sleep(Duration::from_millis(100)).await;
    coordinator.dispatch(&doctor.handle, ClientCommand::PullNext { doctor_id }).await;
    first.await.unwrap();

    let events = doctor.drain();
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::Error { code, .. } if code == "conflict")));
    assert_eq!(coordinator.queue().snapshot(doctor_id).await.queue_length, 1);
    assert_eq!(coordinator.sessions().live_session_count().await, 1);
}

#[tokio::test]
async fn test_identity_checks_and_late_leave() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    let mut patient = connect(&coordinator, patient_id, Role::Patient).await;
    let doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
    patient.drain();

    coordinator
        .dispatch(
            &patient.handle,
            ClientCommand::JoinQueue { doctor_id, patient_id: Uuid::new_v4(), room_name_hint: None },
        )
        .await;
    assert_matches!(
        patient.drain().last(),
        Some(ServerEvent::Error { code, .. }) if code == "unauthorized"
    );

    coordinator.dispatch(&patient.handle, ClientCommand::PullNext { doctor_id }).await;
    assert_matches!(
        patient.drain().last(),
        Some(ServerEvent::Error { code, .. }) if code == "unauthorized"
    );

    coordinator
        .dispatch(&patient.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
        .await;
    coordinator.dispatch(&doctor.handle, ClientCommand::PullNext { doctor_id }).await;

    coordinator
        .dispatch(&patient.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
        .await;
    assert_matches!(
        patient.drain().last(),
        Some(ServerEvent::Error { code, .. }) if code == "conflict"
    );

    // The leave arrives after promotion and cancels the session instead
    coordinator
        .dispatch(&patient.handle, ClientCommand::LeaveQueue { doctor_id, patient_id })
        .await;
    assert!(session_states(&patient.drain()).contains(&CallSessionState::Abandoned));
    assert!(coordinator.sessions().session_for_user(doctor_id, Role::Doctor).await.is_none());

    // Repeating it is a silent no-op
    coordinator
        .dispatch(&patient.handle, ClientCommand::LeaveQueue { doctor_id, patient_id })
        .await;
    assert!(patient.drain().is_empty());
}

#[tokio::test]
async fn test_active_patient_lost_past_grace_abandons_session() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let (doctor_id, patient_id) = (Uuid::new_v4(), Uuid::new_v4());

    let mut doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
    let mut patient = connect(&coordinator, patient_id, Role::Patient).await;
    coordinator
        .dispatch(&patient.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
        .await;
    coordinator.dispatch(&doctor.handle, ClientCommand::PullNext { doctor_id }).await;

    let session_id = patient
        .drain()
        .iter()
        .find_map(|event| match event {
            ServerEvent::Invite { session_id, .. } => Some(*session_id),
            _ => None,
        })
        .expect("Patient should be invited");
    coordinator.dispatch(&patient.handle, ClientCommand::ConfirmJoin { session_id }).await;
    doctor.drain();

    coordinator.disconnect(&patient.handle, false).await;
    sleep(grace() / 3).await;
    assert_eq!(
        coordinator.sessions().get_session(session_id).await.unwrap().state,
        CallSessionState::Active,
        "Still inside the grace window"
    );

    sleep(grace() * 3).await;

    let session = coordinator.sessions().get_session(session_id).await.unwrap();
    assert_eq!(session.state, CallSessionState::Abandoned);
    assert_eq!(session.end_reason, Some(EndReason::ParticipantLost));
    assert_eq!(session_states(&doctor.drain()), vec![CallSessionState::Abandoned]);
    assert!(coordinator.sessions().session_for_user(doctor_id, Role::Doctor).await.is_none());
    assert!(coordinator.queue().position_of(doctor_id, patient_id).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_racing_pull_next_is_never_lost() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);

    for _ in 0..200 {
        let (doctor_id, patient_id) = (Uuid::new_v4(), Uuid::new_v4());
        let doctor = connect(&coordinator, doctor_id, Role::Doctor).await;
        let mut patient = connect(&coordinator, patient_id, Role::Patient).await;
        coordinator
            .dispatch(&patient.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
            .await;

        let pull = {
            let coordinator = Arc::clone(&coordinator);
            let handle = doctor.handle;
            tokio::spawn(async move {
                coordinator.dispatch(&handle, ClientCommand::PullNext { doctor_id }).await;
            })
        };
        let leave = {
            let coordinator = Arc::clone(&coordinator);
            let handle = patient.handle;
            tokio::spawn(async move {
                coordinator
                    .dispatch(&handle, ClientCommand::LeaveQueue { doctor_id, patient_id })
                    .await;
            })
        };
        pull.await.unwrap();
        leave.await.unwrap();

        assert!(coordinator.sessions().session_for_user(patient_id, Role::Patient).await.is_none());
        assert!(coordinator.queue().position_of(doctor_id, patient_id).await.is_none());
        assert!(patient
            .drain()
            .iter()
            .all(|event| !matches!(event, ServerEvent::Error { .. })));
    }
}

#[tokio::test]
async fn test_superseded_connection_cannot_issue_commands() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    let old = connect(&coordinator, doctor_id, Role::Doctor).await;
    let _current = connect(&coordinator, doctor_id, Role::Doctor).await;
    let patient = connect(&coordinator, patient_id, Role::Patient).await;
    coordinator
        .dispatch(&patient.handle, ClientCommand::JoinQueue { doctor_id, patient_id, room_name_hint: None })
        .await;

    coordinator.dispatch(&old.handle, ClientCommand::PullNext { doctor_id }).await;

    assert_eq!(coordinator.queue().position_of(doctor_id, patient_id).await.unwrap().position, 1);
    assert_eq!(coordinator.sessions().live_session_count().await, 0);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let server = start_provider(201).await;
    let coordinator = coordinator_for(&server);

    let mut patient = connect(&coordinator, Uuid::new_v4(), Role::Patient).await;
    patient.drain();

    coordinator.dispatch(&patient.handle, ClientCommand::Ping {}).await;
    assert_eq!(patient.drain(), vec![ServerEvent::Pong {}]);
}
