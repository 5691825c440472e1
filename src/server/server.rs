use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::state_machine::{ChannelHooks, ChannelStateMachine};
use crate::channel::{Channel, ChannelError, ChannelState};
use crate::config::endpoint::ServerConfiguration;
use crate::messaging::envelope::TransportEnvelope;
use crate::messaging::message::{is_reserved_type, Message};
use crate::messaging::message_bus::MessageBus;
use crate::registration::challenge::RegistrationConfiguration;
use crate::registration::server::ServerRegistrationController;
use crate::rpc::{ClientCallback, RegistrationKind, ServerEndpoint};
use crate::server::registry::{Session, SessionRegistry};
use crate::server::relay::{request_clients_statistics, Relay};
use crate::transport::config::TransportConfiguration;
use crate::transport::statistics::{StatisticsReport, TransportStatistics};
use crate::util::cancel::CancellationToken;
use crate::util::work_queue::{WorkQueue, DEFAULT_QUEUE_CAPACITY};

struct Running {
    relay: Arc<Relay>,
    inbound: WorkQueue<TransportEnvelope>,
}

/// Everything the server's lifecycle hooks operate on.
pub struct ServerCore {
    config: ServerConfiguration,
    registry: Arc<SessionRegistry>,
    registration: ServerRegistrationController,
    bus: Arc<MessageBus>,
    accepting: AtomicBool,
    running: RwLock<Option<Running>>,
}

#[async_trait]
impl ChannelHooks for ServerCore {
    async fn on_opening(&self) -> anyhow::Result<()> {
        let transport_config = self.registration.transport_config().await;
        let relay = Arc::new(Relay::new(self.config.clone(), transport_config, self.registry.clone(), self.bus.clone())?);

        let relay_for_queue = relay.clone();
        let inbound = WorkQueue::spawn("server-inbound", DEFAULT_QUEUE_CAPACITY, move |envelope: TransportEnvelope| {
            relay_for_queue.route(envelope)
        });

        if let Some(stale) = self.running.write().await.replace(Running { relay, inbound }) {
            stale.inbound.shutdown();
        }
        Ok(())
    }

    async fn on_registering(&self) -> anyhow::Result<()> {
        self.accepting.store(true, Ordering::SeqCst);
        info!("server {:?} accepting registrations", self.config.id());
        Ok(())
    }

    async fn on_unregistering(&self) -> anyhow::Result<()> {
        self.accepting.store(false, Ordering::SeqCst);

        let mut instructions = JoinSet::new();
        for session in self.registry.snapshot().await {
            instructions.spawn(async move {
                (session.id().to_string(), session.handle.callback.instruct_close().await)
            });
        }
        while let Some(joined) = instructions.join_next().await {
            if let Ok((id, Err(e))) = joined {
                warn!("error instructing client {:?} to close: {:#}", id, e);
            }
        }

        self.registry.clear().await;
        Ok(())
    }

    async fn on_closing(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(running) = self.running.write().await.take() {
            running.inbound.shutdown();
        }
        self.registry.clear().await;
    }
}

/// The hub of the bus: admits clients, relays their envelopes, and has an endpoint of its own
///  for sending and receiving messages.
pub struct Server {
    lifecycle: ChannelStateMachine<ServerCore>,
}

impl Server {
    pub fn new(config: ServerConfiguration, mut transport_config: TransportConfiguration, registration_config: &RegistrationConfiguration) -> anyhow::Result<Arc<Server>> {
        config.validate()?;
        transport_config.server_id = config.id().to_string();
        transport_config.validate()?;

        let registry = Arc::new(SessionRegistry::new());
        let core = ServerCore {
            registration: ServerRegistrationController::new(registration_config.challenge.build(), registry.clone(), transport_config),
            registry,
            bus: Arc::new(MessageBus::default()),
            accepting: AtomicBool::new(false),
            running: RwLock::new(None),
            config,
        };

        Ok(Arc::new(Server {
            lifecycle: ChannelStateMachine::new(&format!("server {}", core.config.id()), core),
        }))
    }

    fn core(&self) -> &ServerCore {
        self.lifecycle.hooks()
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.core().config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.core().bus.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.lifecycle.subscribe_state()
    }

    pub fn is_accepting(&self) -> bool {
        self.core().accepting.load(Ordering::SeqCst)
    }

    pub async fn restart(&self, retry_count: u32, retry_duration: Duration) -> Result<(), ChannelError> {
        self.lifecycle.restart(retry_count, retry_duration).await
    }

    pub fn endpoint(self: &Arc<Self>) -> Arc<dyn ServerEndpoint> {
        Arc::new(ServerEndpointHandle {
            server: self.clone(),
        })
    }

    pub async fn transport_config(&self) -> TransportConfiguration {
        self.core().registration.transport_config().await
    }

    /// Only possible while the server is closed: the relay and every registered client must
    ///  share one configuration, and opening the server applies it to both.
    pub async fn update_transport_config(&self, mut config: TransportConfiguration) -> anyhow::Result<()> {
        config.server_id = self.id().to_string();
        self.lifecycle.while_closed(self.core().registration.update_transport_config(config)).await?
    }

    pub async fn handle_registration(&self, kind: RegistrationKind, data: Bytes, callback: Arc<dyn ClientCallback>) -> anyhow::Result<Bytes> {
        if !self.is_accepting() {
            bail!("server {:?} is not accepting registrations (state {:?})", self.id(), self.state());
        }
        self.core().registration.handle(kind, data, callback).await
    }

    /// Queues an envelope pushed by a client for relaying; waits while the queue is full.
    pub async fn receive_envelope(&self, envelope: TransportEnvelope) -> anyhow::Result<()> {
        match self.core().running.read().await.as_ref() {
            Some(running) => running.inbound.submit(envelope).await,
            None => bail!("server {:?} is not running", self.id()),
        }
    }

    async fn relay(&self) -> Option<Arc<Relay>> {
        self.core().running.read().await
            .as_ref()
            .map(|r| r.relay.clone())
    }

    pub async fn registered_clients(&self) -> Vec<String> {
        let mut result = self.core().registry.snapshot().await
            .iter()
            .map(|s| s.id().to_string())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Pings registered clients one after the other, stopping early if cancelled.
    pub async fn ping_all(&self, cancel: &CancellationToken) -> BTreeMap<String, anyhow::Result<u64>> {
        let mut result = BTreeMap::new();
        for session in self.core().registry.snapshot().await {
            if cancel.is_cancelled() {
                debug!("ping_all cancelled after {} client(s)", result.len());
                break;
            }
            result.insert(session.id().to_string(), session.handle.callback.ping().await);
        }
        result
    }

    pub async fn close_all(&self) {
        self.instruct_all("close", |session| async move {
            session.handle.callback.instruct_close().await
        }).await;
    }

    pub async fn restart_all(&self, retry_count: u32, retry_duration: Duration) {
        self.instruct_all("restart", move |session| async move {
            session.handle.callback.instruct_restart(retry_count, retry_duration).await
        }).await;
    }

    async fn instruct_all<F, Fut>(&self, what: &str, instruction: F)
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut instructions = JoinSet::new();
        for session in self.core().registry.snapshot().await {
            let id = session.id().to_string();
            let fut = instruction(session);
            instructions.spawn(async move { (id, fut.await) });
        }
        while let Some(joined) = instructions.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!("error instructing client {:?} to {}: {:#}", id, what, e),
                Err(e) => warn!("instruction task failed: {}", e),
            }
        }
    }

    pub async fn request_all_clients_transport_statistics(&self) -> BTreeMap<String, TransportStatistics> {
        request_clients_statistics(&self.core().registry).await
    }

    /// `None` unless the server is running
    pub async fn statistics_report(&self) -> Option<StatisticsReport> {
        match self.relay().await {
            Some(relay) => Some(relay.statistics_report().await),
            None => None,
        }
    }
}

#[async_trait]
impl Channel for Server {
    fn id(&self) -> &str {
        self.core().config.id()
    }

    fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    async fn open(&self) -> Result<(), ChannelError> {
        self.lifecycle.open().await
    }

    async fn close(&self) {
        self.lifecycle.close().await
    }

    /// Sends from the server's own endpoint; the message's client id must be the server id, and
    ///  reserved types are refused.
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(ChannelError::NotOpen(state).into());
        }
        if message.client_id() != self.id() {
            bail!("server {:?} cannot send a message from {:?}", self.id(), message.client_id());
        }
        if is_reserved_type(message.type_info()) {
            bail!("server {:?} cannot send messages of reserved type {:?}", self.id(), message.type_info());
        }

        match self.relay().await {
            Some(relay) => relay.publish(&message).await,
            None => Err(ChannelError::NotOpen(self.state()).into()),
        }
    }
}

/// A binding's handle for calling into a server.
pub struct ServerEndpointHandle {
    server: Arc<Server>,
}

#[async_trait]
impl ServerEndpoint for ServerEndpointHandle {
    async fn registration_channel(&self, kind: RegistrationKind, data: Bytes, callback: Arc<dyn ClientCallback>) -> anyhow::Result<Bytes> {
        self.server.handle_registration(kind, data, callback).await
    }

    async fn push_envelope_to_server(&self, envelope: TransportEnvelope) -> anyhow::Result<()> {
        self.server.receive_envelope(envelope).await
    }
}

#[cfg(test)]
mod test {
    use crate::config::endpoint::ClientConfiguration;
    use crate::registration::payload::RegistrationPayload;
    use crate::test_util::TrackingClientCallback;
    use crate::transport::config::EncryptorConfiguration;
    use super::*;

    fn server() -> Arc<Server> {
        Server::new(ServerConfiguration::new("s1"), TransportConfiguration::new("ignored"), &RegistrationConfiguration::new()).unwrap()
    }

    async fn register(server: &Server, id: &str, callback: Arc<TrackingClientCallback>) -> anyhow::Result<TransportConfiguration> {
        let payload = RegistrationPayload {
            client_configuration: ClientConfiguration::new(id),
            evidence: Bytes::new(),
        };
        let mut response = server.handle_registration(RegistrationKind::Register, payload.to_bytes(), callback).await?;
        TransportConfiguration::try_deser(&mut response)
    }

    #[tokio::test]
    async fn test_registration_requires_open_server() {
        let server = server();
        assert!(register(&server, "c1", TrackingClientCallback::new()).await.is_err());

        server.open().await.unwrap();
        assert_eq!(server.state(), ChannelState::Open);
        let transport_config = register(&server, "c1", TrackingClientCallback::new()).await.unwrap();
        assert_eq!(transport_config.server_id, "s1");
        assert_eq!(server.registered_clients().await, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_close_instructs_clients() {
        let server = server();
        server.open().await.unwrap();
        let a = TrackingClientCallback::new();
        let b = TrackingClientCallback::new();
        register(&server, "a", a.clone()).await.unwrap();
        register(&server, "b", b.clone()).await.unwrap();

        server.close().await;
        assert_eq!(server.state(), ChannelState::Closed);
        assert_eq!(a.num_close_instructions(), 1);
        assert_eq!(b.num_close_instructions(), 1);
        assert!(server.registered_clients().await.is_empty());
        assert!(server.receive_envelope(TransportEnvelope { header: Bytes::new(), payload: Bytes::new() }).await.is_err());
        assert!(server.statistics_report().await.is_none());
    }

    #[tokio::test]
    async fn test_batch_operations_tolerate_failures() {
        let server = server();
        server.open().await.unwrap();
        let good = TrackingClientCallback::new();
        let bad = TrackingClientCallback::failing();
        register(&server, "good", good.clone()).await.unwrap();
        register(&server, "bad", bad.clone()).await.unwrap();

        let pings = server.ping_all(&CancellationToken::new()).await;
        assert_eq!(pings.len(), 2);
        assert_eq!(*pings["good"].as_ref().unwrap(), 1);
        assert!(pings["bad"].is_err());

        let stats = server.request_all_clients_transport_statistics().await;
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["good"]);

        server.restart_all(3, Duration::from_secs(1)).await;
        assert_eq!(good.num_restart_instructions(), 1);
        assert_eq!(bad.num_restart_instructions(), 1);

        server.close_all().await;
        assert_eq!(good.num_close_instructions(), 1);
    }

    #[tokio::test]
    async fn test_ping_all_cancelled() {
        let server = server();
        server.open().await.unwrap();
        register(&server, "a", TrackingClientCallback::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(server.ping_all(&cancel).await.is_empty());
    }

    #[tokio::test]
    async fn test_send() {
        let server = server();
        let msg = Message::new("s1", "t", b"x".to_vec()).unwrap();
        assert!(server.send(msg.clone()).await.is_err());

        server.open().await.unwrap();
        let a = TrackingClientCallback::new();
        register(&server, "a", a.clone()).await.unwrap();

        assert!(server.send(Message::new("other", "t", b"x".to_vec()).unwrap()).await.is_err());
        server.send(msg).await.unwrap();
        assert_eq!(a.received_envelopes().await.len(), 1);

        let report = server.statistics_report().await.unwrap();
        assert_eq!(report.internal_client.outgoing_messages, 1);
        assert_eq!(report.server.outgoing_envelopes, 1);
    }

    #[tokio::test]
    async fn test_update_transport_config() {
        let server = server();
        let mut config = TransportConfiguration::new("whatever");
        config.chunk_size = 2048;
        server.update_transport_config(config).await.unwrap();

        let current = server.transport_config().await;
        assert_eq!(current.server_id, "s1");
        assert_eq!(current.chunk_size, 2048);
    }

    #[tokio::test]
    async fn test_update_transport_config_rejected_while_open() {
        let server = server();
        server.open().await.unwrap();

        let mut config = TransportConfiguration::new("s1");
        config.encryptor_configurations.push(EncryptorConfiguration::Aes256Gcm { passphrase: "p".to_string() });
        assert!(server.update_transport_config(config.clone()).await.is_err());
        assert!(server.transport_config().await.encryptor_configurations.is_empty());

        let transport_config = register(&server, "c1", TrackingClientCallback::new()).await.unwrap();
        assert!(transport_config.encryptor_configurations.is_empty());

        server.close().await;
        server.update_transport_config(config.clone()).await.unwrap();
        server.open().await.unwrap();
        let transport_config = register(&server, "c1", TrackingClientCallback::new()).await.unwrap();
        assert_eq!(transport_config, config);
    }
}
