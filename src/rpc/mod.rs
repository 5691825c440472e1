//! The abstract request / callback channel between clients and a server. A binding (in-process,
//!  named pipes, sockets, ...) provides a [Connector] to clients and calls into the server's
//!  [ServerEndpoint]; the client side hands a [ClientCallback] to the server when registering.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::envelope::TransportEnvelope;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum RegistrationKind {
    Register = 1,
    Unregister = 2,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerEndpoint: Send + Sync + 'static {
    /// registration traffic; the response to a successful `Register` is the serialized
    ///  transport configuration
    async fn registration_channel(&self, kind: RegistrationKind, data: Bytes, callback: Arc<dyn ClientCallback>) -> anyhow::Result<Bytes>;

    async fn push_envelope_to_server(&self, envelope: TransportEnvelope) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientCallback: Send + Sync + 'static {
    /// ms since epoch, measured on the client
    async fn ping(&self) -> anyhow::Result<u64>;

    /// the client's serialized transport statistics
    async fn get_statistics(&self) -> anyhow::Result<Bytes>;

    async fn instruct_close(&self) -> anyhow::Result<()>;

    async fn instruct_restart(&self, retry_count: u32, retry_duration: Duration) -> anyhow::Result<()>;

    async fn push_envelope_to_client(&self, envelope: TransportEnvelope) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ServerEndpoint>>;
}

/// What the server holds on to for delivering to a registered client.
#[derive(Clone)]
pub struct RecipientHandle {
    pub client_id: String,
    pub callback: Arc<dyn ClientCallback>,
}

impl Debug for RecipientHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecipientHandle{{{:?}}}", self.client_id)
    }
}

impl RecipientHandle {
    pub fn new(client_id: &str, callback: Arc<dyn ClientCallback>) -> RecipientHandle {
        RecipientHandle {
            client_id: client_id.to_string(),
            callback,
        }
    }
}
