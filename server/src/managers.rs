use tokio::sync::mpsc;

use crate::transport::ServerMessage;

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Failed to send notification")]
    SendFailed,

    #[error("Notification service unavailable")]
    ServiceUnavailable,
}

pub trait NotifierManager: Send + Sync + Clone {
    async fn notify(&self, event: ServerMessage) -> Result<(), NotifierError>;
}

#[derive(Clone)]
pub struct DefaultNotifierManager {
    sender: mpsc::Sender<ServerMessage>,
}

impl DefaultNotifierManager {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { sender }
    }
}

impl NotifierManager for DefaultNotifierManager {
    async fn notify(&self, event: ServerMessage) -> Result<(), NotifierError> {
        if self.sender.is_closed() {
            return Err(NotifierError::ServiceUnavailable);
        }

        self.sender
            .send(event)
            .await
            .map_err(|_| NotifierError::SendFailed)?;

        Ok(())
    }
}
