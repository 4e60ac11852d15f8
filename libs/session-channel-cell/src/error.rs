use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum ChannelError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(Uuid),

    #[error("Connection {0} has been replaced by a newer connection")]
    Superseded(Uuid),

    #[error("Connection {0} is stale, waiting for reconnect")]
    Stale(Uuid),

    #[error("Channel closed for connection {0}")]
    ChannelClosed(Uuid),
}
