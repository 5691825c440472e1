use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{info, warn};

use crate::channel::Channel;
use crate::client::client::Client;
use crate::messaging::envelope::TransportEnvelope;
use crate::rpc::ClientCallback;
use crate::transport::statistics::millis_since_epoch;

/// The client's side of the callback channel, handed to the server on registration.
///
/// Close and restart instructions are carried out asynchronously: the server awaits the
///  callback, and the client's own close would call back into the server.
pub struct ClientCallbackHandler {
    client: Weak<Client>,
}

impl ClientCallbackHandler {
    pub fn new(client: Weak<Client>) -> ClientCallbackHandler {
        ClientCallbackHandler {
            client,
        }
    }

    fn client(&self) -> anyhow::Result<Arc<Client>> {
        self.client.upgrade()
            .ok_or_else(|| anyhow!("client was dropped"))
    }
}

#[async_trait]
impl ClientCallback for ClientCallbackHandler {
    async fn ping(&self) -> anyhow::Result<u64> {
        self.client()?;
        Ok(millis_since_epoch())
    }

    async fn get_statistics(&self) -> anyhow::Result<Bytes> {
        let client = self.client()?;
        let stats = client.transport_statistics().await
            .ok_or_else(|| anyhow!("client {:?} is not registered", client.id()))?;

        let mut buf = BytesMut::new();
        stats.ser(&mut buf);
        Ok(buf.freeze())
    }

    async fn instruct_close(&self) -> anyhow::Result<()> {
        let client = self.client()?;
        info!("client {:?} instructed to close", client.id());
        tokio::spawn(async move {
            client.close().await;
        });
        Ok(())
    }

    async fn instruct_restart(&self, retry_count: u32, retry_duration: Duration) -> anyhow::Result<()> {
        let client = self.client()?;
        info!("client {:?} instructed to restart", client.id());
        tokio::spawn(async move {
            if let Err(e) = client.restart(retry_count, retry_duration).await {
                warn!("client {:?} failed to restart: {}", client.id(), e);
            }
        });
        Ok(())
    }

    async fn push_envelope_to_client(&self, envelope: TransportEnvelope) -> anyhow::Result<()> {
        self.client()?
            .receive_envelope(envelope).await
    }
}
