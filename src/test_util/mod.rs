//! Utilities for testing code that uses the bus. They are used for the crate's own tests, and
//!  they are exported for application testing, which is why they are regular (non-test) code.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, RwLock};

use crate::channel::Channel;
use crate::client::client::Client;
use crate::config::endpoint::{ClientConfiguration, ServerConfiguration};
use crate::local::LocalConnector;
use crate::messaging::envelope::TransportEnvelope;
use crate::messaging::message::Message;
use crate::registration::challenge::RegistrationConfiguration;
use crate::rpc::ClientCallback;
use crate::server::server::Server;
use crate::transport::config::TransportConfiguration;
use crate::transport::statistics::TransportStatistics;

/// A [ClientCallback] that records what the server does with it instead of acting on it.
#[derive(Default)]
pub struct TrackingClientCallback {
    envelopes: RwLock<Vec<TransportEnvelope>>,
    fail_deliveries: AtomicBool,
    num_close_instructions: AtomicUsize,
    num_restart_instructions: AtomicUsize,
}

impl TrackingClientCallback {
    pub fn new() -> Arc<TrackingClientCallback> {
        Default::default()
    }

    pub fn failing() -> Arc<TrackingClientCallback> {
        let result = TrackingClientCallback::default();
        result.fail_deliveries.store(true, Ordering::SeqCst);
        Arc::new(result)
    }

    /// returns pushed envelopes, clearing the internal buffer
    pub async fn received_envelopes(&self) -> Vec<TransportEnvelope> {
        std::mem::take(&mut *self.envelopes.write().await)
    }

    pub fn num_close_instructions(&self) -> usize {
        self.num_close_instructions.load(Ordering::SeqCst)
    }

    pub fn num_restart_instructions(&self) -> usize {
        self.num_restart_instructions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientCallback for TrackingClientCallback {
    async fn ping(&self) -> anyhow::Result<u64> {
        if self.fail_deliveries.load(Ordering::SeqCst) {
            bail!("unreachable");
        }
        Ok(1)
    }

    async fn get_statistics(&self) -> anyhow::Result<Bytes> {
        if self.fail_deliveries.load(Ordering::SeqCst) {
            bail!("unreachable");
        }
        let mut buf = BytesMut::new();
        TransportStatistics::new().ser(&mut buf);
        Ok(buf.freeze())
    }

    async fn instruct_close(&self) -> anyhow::Result<()> {
        self.num_close_instructions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn instruct_restart(&self, _retry_count: u32, _retry_duration: Duration) -> anyhow::Result<()> {
        self.num_restart_instructions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_envelope_to_client(&self, envelope: TransportEnvelope) -> anyhow::Result<()> {
        if self.fail_deliveries.load(Ordering::SeqCst) {
            bail!("unreachable");
        }
        self.envelopes.write().await.push(envelope);
        Ok(())
    }
}

pub fn test_client_config(id: &str, receive_self_sent_messages: bool, receivable_types: &[&str]) -> ClientConfiguration {
    let mut config = ClientConfiguration::new(id);
    config.receive_self_sent_messages = receive_self_sent_messages;
    config.receivable_types_filter = receivable_types.iter().map(|t| t.to_string()).collect();
    config
}

/// Starts a server and connects one client per configuration, all in-process.
pub async fn start_local_bus(server_config: ServerConfiguration, transport_config: TransportConfiguration, client_configs: Vec<ClientConfiguration>) -> anyhow::Result<(Arc<Server>, Vec<Arc<Client>>)> {
    let registration_config = RegistrationConfiguration::new();
    let server = Server::new(server_config, transport_config, &registration_config)?;
    server.open().await?;

    let mut clients = Vec::new();
    for config in client_configs {
        let client = Client::new(config, Arc::new(LocalConnector::new(server.clone())), &registration_config)?;
        client.open().await?;
        clients.push(client);
    }
    Ok((server, clients))
}

/// The next message on a bus subscription, or `None` if nothing arrives in time.
pub async fn recv_within(receiver: &mut broadcast::Receiver<Message>, timeout: Duration) -> Option<Message> {
    match tokio::time::timeout(timeout, receiver.recv()).await {
        Ok(Ok(message)) => Some(message),
        _ => None,
    }
}
