use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_utils::test_utils::TestConfig;
use video_conferencing_cell::{HttpRoomGateway, RoomGatewayError, RoomProvisioningGateway};

async fn gateway_for(server: &MockServer) -> HttpRoomGateway {
    let config = TestConfig::default().with_room_provider(&server.uri()).to_app_config();
    HttpRoomGateway::new(&config).unwrap()
}

#[tokio::test]
async fn test_create_room_sends_name_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .and(header("authorization", "Bearer test-room-token"))
        .and(body_json(json!({ "name": "consult-a" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "room-123",
            "name": "consult-a",
            "status": "created"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let room = gateway_for(&server).await.create_room("consult-a").await.unwrap();

    assert_eq!(room.room_id, "room-123");
    assert_eq!(room.room_name, "consult-a");
    assert_eq!(room.status, "created");
}

#[tokio::test]
async fn test_create_room_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let result = gateway_for(&server).await.create_room("taken").await;
    assert_eq!(
        result,
        Err(RoomGatewayError::RoomNameConflict {
            room_name: "taken".to_string()
        })
    );
}

#[tokio::test]
async fn test_server_error_is_provider_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    assert_matches!(
        gateway_for(&server).await.create_room("consult-b").await,
        Err(RoomGatewayError::ProviderUnavailable { message }) if message.contains("503")
    );
}

#[tokio::test]
async fn test_unparseable_body_is_provider_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    assert_matches!(
        gateway_for(&server).await.create_room("consult-c").await,
        Err(RoomGatewayError::ProviderUnavailable { .. })
    );
}

#[tokio::test]
async fn test_complete_room_and_missing_room() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rooms/room-1/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rooms/gone/complete"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;

    assert_eq!(gateway.complete_room("room-1").await.unwrap().status, "completed");
    assert_eq!(
        gateway.complete_room("gone").await,
        Err(RoomGatewayError::RoomNotFound {
            room_id: "gone".to_string()
        })
    );
}

#[tokio::test]
async fn test_get_room_and_list_participants() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rooms/room-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "room-9",
            "name": "consult-9",
            "status": "in_progress",
            "participant_count": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rooms/room-9/participants"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "participants": [
                { "id": "p-1", "identity": "doctor" },
                { "id": "p-2", "identity": "patient" }
            ]
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;

    let info = gateway.get_room("room-9").await.unwrap();
    assert_eq!(info.participant_count, Some(2));

    let participants = gateway.list_participants("room-9").await.unwrap();
    let identities: Vec<&str> = participants.iter().map(|p| p.identity.as_str()).collect();
    assert_eq!(identities, vec!["doctor", "patient"]);
    assert_eq!(participants[0].participant_id, "p-1");
}
