// libs/video-conferencing-cell/src/services/mod.rs

pub mod room_gateway;
pub mod session;

pub use room_gateway::{HttpRoomGateway, RoomProvisioningGateway};
pub use session::CallSessionManager;
