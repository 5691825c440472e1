use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::channel::state_machine::{ChannelHooks, ChannelStateMachine};
use crate::channel::{Channel, ChannelError, ChannelState};
use crate::client::callback::ClientCallbackHandler;
use crate::config::endpoint::ClientConfiguration;
use crate::messaging::envelope::TransportEnvelope;
use crate::messaging::message::{is_reserved_type, Message, STATISTICS_REQUEST_TIMEOUT, STATISTICS_REQUEST_TYPE, STATISTICS_RESPONSE_TYPE};
use crate::messaging::message_bus::MessageBus;
use crate::registration::challenge::RegistrationConfiguration;
use crate::registration::client::ClientRegistrationController;
use crate::rpc::{ClientCallback, Connector, ServerEndpoint};
use crate::transport::controller::TransportController;
use crate::transport::statistics::{StatisticsReport, StatisticsResponse, TransportStatistics};
use crate::util::work_queue::{WorkQueue, DEFAULT_QUEUE_CAPACITY};

/// statistics requests waiting for their response, keyed by request message id
type PendingStatistics = Mutex<FxHashMap<String, oneshot::Sender<StatisticsReport>>>;

struct Connection {
    transport: Arc<TransportController>,
    inbound: WorkQueue<TransportEnvelope>,
}

/// Everything the client's lifecycle hooks operate on.
pub struct ClientCore {
    config: ClientConfiguration,
    connector: Arc<dyn Connector>,
    registration: ClientRegistrationController,
    bus: Arc<MessageBus>,
    callback: Arc<dyn ClientCallback>,
    endpoint: RwLock<Option<Arc<dyn ServerEndpoint>>>,
    connection: RwLock<Option<Connection>>,
    pending_statistics: Arc<PendingStatistics>,
}

impl ClientCore {
    async fn endpoint(&self) -> anyhow::Result<Arc<dyn ServerEndpoint>> {
        self.endpoint.read().await
            .clone()
            .ok_or_else(|| anyhow!("client {:?} is not connected", self.config.id()))
    }
}

#[async_trait]
impl ChannelHooks for ClientCore {
    async fn on_opening(&self) -> anyhow::Result<()> {
        let endpoint = self.connector.connect().await?;
        *self.endpoint.write().await = Some(endpoint);
        Ok(())
    }

    async fn on_registering(&self) -> anyhow::Result<()> {
        let endpoint = self.endpoint().await?;
        let transport_config = self.registration.register(endpoint.as_ref(), &self.config, self.callback.clone()).await?;
        let transport = Arc::new(TransportController::new(transport_config, None)?);

        let queue_transport = transport.clone();
        let bus = self.bus.clone();
        let pending = self.pending_statistics.clone();
        let inbound = WorkQueue::spawn("client-inbound", DEFAULT_QUEUE_CAPACITY, move |envelope: TransportEnvelope| {
            let transport = queue_transport.clone();
            let bus = bus.clone();
            let pending = pending.clone();
            async move {
                deliver_inbound(&transport, &bus, &pending, envelope).await
            }
        });

        if let Some(stale) = self.connection.write().await.replace(Connection { transport, inbound }) {
            stale.inbound.shutdown();
        }
        Ok(())
    }

    async fn on_unregistering(&self) -> anyhow::Result<()> {
        let endpoint = self.endpoint().await?;
        self.registration.unregister(endpoint.as_ref(), &self.config, self.callback.clone()).await
    }

    async fn on_closing(&self) {
        if let Some(connection) = self.connection.write().await.take() {
            connection.inbound.shutdown();
        }
        self.endpoint.write().await.take();
        // dropping the responders wakes up waiting requests
        self.pending_statistics.lock().await.clear();
    }
}

async fn deliver_inbound(transport: &TransportController, bus: &MessageBus, pending: &PendingStatistics, envelope: TransportEnvelope) {
    let message = match transport.ingest_fragment(&envelope).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            warn!("dropping inbound envelope: {:#}", e);
            return;
        }
    };

    if message.type_info() == STATISTICS_RESPONSE_TYPE {
        match StatisticsResponse::try_deser(&mut message.payload().clone()) {
            Ok(response) => {
                match pending.lock().await.remove(&response.request_id) {
                    Some(responder) => {
                        let _ = responder.send(response.report);
                    }
                    None => debug!("statistics response for unknown or expired request {:?}", response.request_id),
                }
            }
            Err(e) => warn!("invalid statistics response: {:#}", e),
        }
    }
    else if message.type_info() == STATISTICS_REQUEST_TYPE {
        debug!("ignoring statistics request addressed to a client");
    }
    else {
        bus.publish(message);
    }
}

/// An endpoint that registers with a server through a [Connector] and then exchanges messages
///  with all other endpoints via that server.
pub struct Client {
    lifecycle: ChannelStateMachine<ClientCore>,
}

impl Client {
    pub fn new(config: ClientConfiguration, connector: Arc<dyn Connector>, registration_config: &RegistrationConfiguration) -> anyhow::Result<Arc<Client>> {
        config.validate()?;
        let challenge = registration_config.challenge.build();

        Ok(Arc::new_cyclic(|myself: &Weak<Client>| {
            let name = format!("client {}", config.id());
            let core = ClientCore {
                config,
                connector,
                registration: ClientRegistrationController::new(challenge),
                bus: Arc::new(MessageBus::default()),
                callback: Arc::new(ClientCallbackHandler::new(myself.clone())),
                endpoint: RwLock::new(None),
                connection: RwLock::new(None),
                pending_statistics: Default::default(),
            };
            Client {
                lifecycle: ChannelStateMachine::new(&name, core),
            }
        }))
    }

    fn core(&self) -> &ClientCore {
        self.lifecycle.hooks()
    }

    pub fn config(&self) -> &ClientConfiguration {
        &self.core().config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.core().bus.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.lifecycle.subscribe_state()
    }

    pub async fn restart(&self, retry_count: u32, retry_duration: Duration) -> Result<(), ChannelError> {
        self.lifecycle.restart(retry_count, retry_duration).await
    }

    /// `None` while not registered
    pub async fn transport_statistics(&self) -> Option<TransportStatistics> {
        match self.core().connection.read().await.as_ref() {
            Some(connection) => Some(connection.transport.statistics().await),
            None => None,
        }
    }

    /// Hands an envelope pushed by the server to the inbound queue; waits while it is full.
    pub async fn receive_envelope(&self, envelope: TransportEnvelope) -> anyhow::Result<()> {
        match self.core().connection.read().await.as_ref() {
            Some(connection) => connection.inbound.submit(envelope).await,
            None => bail!("client {:?} is not registered", self.id()),
        }
    }

    async fn transmit(&self, message: &Message) -> anyhow::Result<()> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(ChannelError::NotOpen(state).into());
        }

        let transport = match self.core().connection.read().await.as_ref() {
            Some(connection) => connection.transport.clone(),
            None => return Err(ChannelError::NotOpen(self.state()).into()),
        };
        let endpoint = self.core().endpoint().await?;

        for envelope in transport.prepare_for_transport(message).await? {
            endpoint.push_envelope_to_server(envelope).await?;
        }
        Ok(())
    }

    /// Asks the server for a statistics report covering the server and all its clients.
    ///  Returns `None` if no answer arrives within [STATISTICS_REQUEST_TIMEOUT], or if the
    ///  client is closed while waiting.
    pub async fn request_all_transport_statistics(&self) -> anyhow::Result<Option<StatisticsReport>> {
        let server_id = match self.core().connection.read().await.as_ref() {
            Some(connection) => connection.transport.config().server_id.clone(),
            None => return Err(ChannelError::NotOpen(self.state()).into()),
        };

        let request = Message::internal(self.id(), &server_id, STATISTICS_REQUEST_TYPE, Bytes::new())?;
        let (responder, response) = oneshot::channel();
        self.core().pending_statistics.lock().await
            .insert(request.id().to_string(), responder);

        if let Err(e) = self.transmit(&request).await {
            self.core().pending_statistics.lock().await.remove(request.id());
            return Err(e);
        }

        match tokio::time::timeout(STATISTICS_REQUEST_TIMEOUT, response).await {
            Ok(Ok(report)) => Ok(Some(report)),
            Ok(Err(_)) => {
                debug!("statistics request {:?} abandoned", request.id());
                Ok(None)
            }
            Err(_) => {
                warn!("statistics request {:?} timed out", request.id());
                self.core().pending_statistics.lock().await.remove(request.id());
                Ok(None)
            }
        }
    }

    pub async fn num_pending_statistics_requests(&self) -> usize {
        self.core().pending_statistics.lock().await.len()
    }
}

#[async_trait]
impl Channel for Client {
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

    /// Publishes a message. It must originate from this client, must not carry a reserved
    ///  type and must pass the transmittable filter.
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if message.client_id() != self.id() {
            bail!("client {:?} cannot send a message from {:?}", self.id(), message.client_id());
        }
        if is_reserved_type(message.type_info()) {
            bail!("client {:?} cannot send messages of reserved type {:?}", self.id(), message.type_info());
        }
        if !self.config().can_transmit(message.type_info()) {
            bail!("client {:?} is not allowed to transmit messages of type {:?}", self.id(), message.type_info());
        }
        self.transmit(&message).await
    }
}
