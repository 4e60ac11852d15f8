use std::sync::Arc;

use serde::Deserialize;

use shared_config::AppConfig;
use shared_models::realtime::Role;

use crate::services::coordinator::ConsultationCoordinator;

/// Router state shared by every consultation handler.
#[derive(Clone)]
pub struct ConsultationState {
    pub config: Arc<AppConfig>,
    pub coordinator: Arc<ConsultationCoordinator>,
}

/// Query string of the channel upgrade. Browsers cannot set headers on a
/// WebSocket handshake, so the access token may travel here instead.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    pub role: Option<Role>,
}
