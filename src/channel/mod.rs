pub mod state_machine;

use async_trait::async_trait;

use crate::messaging::message::Message;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Opening,
    Registering,
    Open,
    Restarting,
    Closing,
    Unregistering,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not closed (state {0:?})")]
    AlreadyOpen(ChannelState),
    #[error("channel is not open (state {0:?})")]
    NotOpen(ChannelState),
    #[error("connection failed: {0:#}")]
    Connection(anyhow::Error),
    #[error("registration failed: {0:#}")]
    Registration(anyhow::Error),
}

/// What clients and servers have in common as communication endpoints.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn open(&self) -> Result<(), ChannelError>;

    async fn close(&self);

    async fn send(&self, message: Message) -> anyhow::Result<()>;
}
