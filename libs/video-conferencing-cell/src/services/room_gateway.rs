// libs/video-conferencing-cell/src/services/room_gateway.rs
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use shared_config::AppConfig;

use crate::models::{
    CompletedRoom, CreateRoomRequest, ParticipantListResponse, ProvisionedRoom, RoomGatewayError,
    RoomInfo, RoomParticipant, VideoConferencingError,
};

/// Narrow interface to the external media-room provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomProvisioningGateway: Send + Sync {
    async fn create_room(&self, room_name: &str) -> Result<ProvisionedRoom, RoomGatewayError>;

    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, RoomGatewayError>;

    /// `RoomNotFound` means the room is already gone.
    async fn complete_room(&self, room_id: &str) -> Result<CompletedRoom, RoomGatewayError>;

    async fn list_participants(
        &self,
        room_id: &str,
    ) -> Result<Vec<RoomParticipant>, RoomGatewayError>;
}

/// REST client for the room provider
pub struct HttpRoomGateway {
    client: Client,
    api_token: String,
    base_url: String,
}

impl HttpRoomGateway {
    pub fn new(config: &AppConfig) -> Result<Self, VideoConferencingError> {
        if !config.is_room_provider_configured() {
            return Err(VideoConferencingError::NotConfigured);
        }

        let client = Client::builder()
            .timeout(config.coordination.provider_timeout)
            .build()
            .map_err(|e| VideoConferencingError::Internal {
                message: format!("Failed to build room provider client: {}", e),
            })?;

        Ok(Self {
            client,
            api_token: config.room_provider_api_token.clone(),
            base_url: config.room_provider_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn parse<T: DeserializeOwned>(
        response: Response,
        operation: &str,
    ) -> Result<T, RoomGatewayError> {
        let status = response.status();
        let response_text = response.text().await?;

        debug!("Room provider {} response: {} - {}", operation, status, response_text);

        if !status.is_success() {
            error!("Room provider {} failed: {} - {}", operation, status, response_text);
            return Err(RoomGatewayError::ProviderUnavailable {
                message: format!("HTTP {}: {}", status, response_text),
            });
        }

        serde_json::from_str(&response_text).map_err(|e| RoomGatewayError::ProviderUnavailable {
            message: format!("Failed to parse {} response: {}", operation, e),
        })
    }
}

#[async_trait]
impl RoomProvisioningGateway for HttpRoomGateway {
    /// POST /rooms
    async fn create_room(&self, room_name: &str) -> Result<ProvisionedRoom, RoomGatewayError> {
        info!("Creating room: {}", room_name);

        let url = format!("{}/rooms", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&CreateRoomRequest {
                name: room_name.to_string(),
            })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(RoomGatewayError::RoomNameConflict {
                room_name: room_name.to_string(),
            });
        }

        let room: ProvisionedRoom = Self::parse(response, "create room").await?;
        info!("Created room {} ({})", room.room_name, room.room_id);
        Ok(room)
    }

    /// GET /rooms/{id}
    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, RoomGatewayError> {
        let url = format!("{}/rooms/{}", self.base_url, room_id);
        let response = self.client.get(&url).bearer_auth(&self.api_token).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RoomGatewayError::RoomNotFound {
                room_id: room_id.to_string(),
            });
        }

        Self::parse(response, "get room").await
    }

    /// POST /rooms/{id}/complete
    async fn complete_room(&self, room_id: &str) -> Result<CompletedRoom, RoomGatewayError> {
        info!("Completing room: {}", room_id);

        let url = format!("{}/rooms/{}/complete", self.base_url, room_id);
        let response = self.client.post(&url).bearer_auth(&self.api_token).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RoomGatewayError::RoomNotFound {
                room_id: room_id.to_string(),
            });
        }

        Self::parse(response, "complete room").await
    }

    /// GET /rooms/{id}/participants
    async fn list_participants(
        &self,
        room_id: &str,
    ) -> Result<Vec<RoomParticipant>, RoomGatewayError> {
        let url = format!("{}/rooms/{}/participants", self.base_url, room_id);
        let response = self.client.get(&url).bearer_auth(&self.api_token).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RoomGatewayError::RoomNotFound {
                room_id: room_id.to_string(),
            });
        }

        let list: ParticipantListResponse = Self::parse(response, "list participants").await?;
        Ok(list.participants)
    }
}
